use std::collections::BTreeSet;

use crate::core::db::StoreHandle;
use crate::core::errors::Result;
use crate::models::models::{SocialEdge, UserId};
use crate::visibility::ViewerGraph;

/// Follow relations, kept in the `following`/`followers` sets of the user documents.
/// The follower's `following` set is written first and is authoritative for
/// [`SocialGraphStore::is_following`]. When the followee's write fails, the follower's
/// write is undone, so a failed call leaves both sets as they were.
#[derive(Clone)]
pub struct SocialGraphStore {
    store: StoreHandle,
}

fn toggle(set: &mut BTreeSet<UserId>, id: UserId, present: bool) -> bool {
    if present {
        set.insert(id)
    } else {
        set.remove(&id)
    }
}

impl SocialGraphStore {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Following someone already followed is a no-op.
    pub async fn follow(&self, follower_id: UserId, following_id: UserId) -> Result<()> {
        let edge = SocialEdge::new(follower_id, following_id)?;
        self.store.require_user(edge.followee).await?;
        self.set_edge(edge, true).await?;

        tracing::debug!(follower = %edge.follower, followee = %edge.followee, "followed");
        Ok(())
    }

    /// Unfollowing someone not followed is a no-op.
    pub async fn unfollow(&self, follower_id: UserId, following_id: UserId) -> Result<()> {
        let edge = SocialEdge::new(follower_id, following_id)?;
        if self.store.get_user(edge.followee).await?.is_some() {
            self.set_edge(edge, false).await?;
        } else {
            self.store
                .update_user(edge.follower, |u| Ok(u.following.remove(&edge.followee)))
                .await?;
        }

        tracing::debug!(follower = %edge.follower, followee = %edge.followee, "unfollowed");
        Ok(())
    }

    async fn set_edge(&self, edge: SocialEdge, present: bool) -> Result<()> {
        let mut changed = false;
        self.store
            .update_user(edge.follower, |u| {
                changed = toggle(&mut u.following, edge.followee, present);
                Ok(changed)
            })
            .await?;

        let mirrored = self
            .store
            .update_user(edge.followee, |u| Ok(toggle(&mut u.followers, edge.follower, present)))
            .await;
        if let Err(err) = mirrored {
            if changed {
                let undo = self
                    .store
                    .update_user(edge.follower, |u| Ok(toggle(&mut u.following, edge.followee, !present)))
                    .await;
                if let Err(undo_err) = undo {
                    tracing::debug!(follower = %edge.follower, followee = %edge.followee, error = %undo_err, "follow edge left half written");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn is_following(&self, follower_id: UserId, following_id: UserId) -> Result<bool> {
        let follower = self.store.require_user(follower_id).await?;
        Ok(follower.following.contains(&following_id))
    }

    /// Users following `user_id`, in id order.
    pub async fn followers(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let user = self.store.require_user(user_id).await?;
        Ok(user.followers.into_iter().collect())
    }

    /// Users `user_id` follows, in id order.
    pub async fn following(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let user = self.store.require_user(user_id).await?;
        Ok(user.following.into_iter().collect())
    }

    /// The viewer's edges, enough to decide visibility of anyone's catch for them.
    pub async fn viewer_graph(&self, viewer_id: UserId) -> Result<ViewerGraph> {
        let viewer = self.store.require_user(viewer_id).await?;
        Ok(ViewerGraph::from_user(&viewer))
    }
}
