//! Catch ranking, social graph and geo feed engine for an angler logbook.
//!
//! [`Atlas`] owns every component. Build one with [`Atlas::open`] at process start and
//! hand out references; call [`Atlas::shutdown`] when the process is done with it.

pub mod catches;
pub mod config;
pub mod core;
pub mod feed;
pub mod follow;
pub mod geo;
pub mod models;
pub mod ranking;
pub mod users;
pub mod visibility;

use std::sync::Arc;

pub use crate::catches::{CatchEdit, CatchLog, NewCatch};
pub use crate::config::{EngineConfig, RankingConfig, SpeciesRule, TierThresholds};
pub use crate::core::db::{CatchStore, MemoryStore, StoreHandle};
pub use crate::core::errors::{CoreError, Result};
pub use crate::core::helpers::{Clock, ManualClock, SystemClock};
pub use crate::core::spin_kv::SpinKvStore;
pub use crate::feed::{FeedAggregator, NearbyQuery};
pub use crate::follow::SocialGraphStore;
pub use crate::geo::GeoIndex;
pub use crate::models::models::*;
pub use crate::ranking::{RankingEngine, TimeWindow};
pub use crate::users::{NewUser, ProfileUpdate, UserDirectory};
pub use crate::visibility::VisibilityResolver;

pub struct Atlas {
    store: StoreHandle,
    geo: Arc<GeoIndex>,
    ranking: Arc<RankingEngine>,
    graph: SocialGraphStore,
    catches: CatchLog,
    feeds: FeedAggregator,
    users: UserDirectory,
}

impl Atlas {
    /// Wires the components over `store`, then rebuilds the spatial index and every
    /// user's points from what the store holds.
    pub async fn open(store: Arc<dyn CatchStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = StoreHandle::new(store, &config);
        let geo = Arc::new(GeoIndex::new());
        let ranking = Arc::new(RankingEngine::new(store.clone(), Arc::new(config.ranking.clone())));

        let atlas = Self {
            graph: SocialGraphStore::new(store.clone()),
            catches: CatchLog::new(
                store.clone(),
                Arc::clone(&geo),
                Arc::clone(&ranking),
                Arc::clone(&clock),
                Arc::clone(&config),
            ),
            feeds: FeedAggregator::new(store.clone(), Arc::clone(&geo), Arc::clone(&ranking), Arc::clone(&config)),
            users: UserDirectory::new(store.clone(), Arc::clone(&ranking), clock),
            store,
            geo,
            ranking,
        };
        atlas.rebuild().await?;
        Ok(atlas)
    }

    async fn rebuild(&self) -> Result<()> {
        let users = self.store.list_users().await?;
        let mut indexed = 0usize;
        for user in &users {
            for catch in self.store.list_catches_by_owner(user.id).await? {
                if catch.is_retracted() {
                    continue;
                }
                let point = catch.location.point;
                self.geo.insert(catch.id, point.longitude, point.latitude)?;
                indexed += 1;
            }
            self.ranking.recompute_points(user.id).await?;
        }
        tracing::debug!(users = users.len(), catches = indexed, "engine state rebuilt");
        Ok(())
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn catches(&self) -> &CatchLog {
        &self.catches
    }

    pub fn feeds(&self) -> &FeedAggregator {
        &self.feeds
    }

    pub fn graph(&self) -> &SocialGraphStore {
        &self.graph
    }

    pub fn ranking(&self) -> &RankingEngine {
        &self.ranking
    }

    pub fn geo(&self) -> &GeoIndex {
        &self.geo
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Releases the store. Every later call through this handle fails with
    /// [`CoreError::ShutDown`].
    pub fn shutdown(&self) {
        self.store.close();
        tracing::debug!("engine shut down");
    }
}
