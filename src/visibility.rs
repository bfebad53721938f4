use std::collections::BTreeSet;

use crate::models::models::{Catch, User, UserId, Visibility};

/// Read-only view of follow edges.
pub trait FollowGraph {
    fn is_following(&self, follower: UserId, followee: UserId) -> bool;
}

/// The edges touching one viewer, taken from their user document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerGraph {
    viewer: UserId,
    following: BTreeSet<UserId>,
    followers: BTreeSet<UserId>,
}

impl ViewerGraph {
    pub fn from_user(user: &User) -> Self {
        Self {
            viewer: user.id,
            following: user.following.clone(),
            followers: user.followers.clone(),
        }
    }

    pub fn following(&self) -> impl Iterator<Item = UserId> + '_ {
        self.following.iter().copied()
    }
}

impl FollowGraph for ViewerGraph {
    /// Edges not touching the viewer are reported as absent.
    fn is_following(&self, follower: UserId, followee: UserId) -> bool {
        if follower == self.viewer {
            self.following.contains(&followee)
        } else if followee == self.viewer {
            self.followers.contains(&follower)
        } else {
            false
        }
    }
}

/// Decides who may see a catch. Stateless, so one value can be shared across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisibilityResolver;

impl VisibilityResolver {
    /// First matching rule wins: public, owner, friends (a follow edge in either
    /// direction), otherwise hidden.
    pub fn is_visible<G: FollowGraph + ?Sized>(&self, viewer_id: UserId, catch: &Catch, graph: &G) -> bool {
        if catch.visibility == Visibility::Public {
            return true;
        }
        if viewer_id == catch.owner_id {
            return true;
        }
        match catch.visibility {
            Visibility::Friends => {
                graph.is_following(viewer_id, catch.owner_id) || graph.is_following(catch.owner_id, viewer_id)
            }
            Visibility::Private | Visibility::Public => false,
        }
    }

    pub fn retain_visible<G: FollowGraph + ?Sized>(&self, viewer_id: UserId, catches: &mut Vec<Catch>, graph: &G) {
        catches.retain(|c| self.is_visible(viewer_id, c, graph));
    }
}
