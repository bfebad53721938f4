//! Personal, nearby and leaderboard feeds.
//!
//! Each feed sorts by a strict total order and pages with a cursor holding the last
//! key served, so writes landing between two page requests never shift later pages.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::core::cursor::{decode_as, encode, CursorKey};
use crate::core::db::StoreHandle;
use crate::core::errors::Result;
use crate::geo::GeoIndex;
use crate::models::models::{CatchId, CatchSummary, LeaderboardEntry, Page, RankTier, UserId};
use crate::ranking::{RankingEngine, TimeWindow};
use crate::visibility::{ViewerGraph, VisibilityResolver};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct NearbyQuery {
    pub longitude: f64,
    pub latitude: f64,
    pub radius_meters: f64,
}

/// Newest first, then catch id.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RecencyKey {
    logged_at: DateTime<Utc>,
    id: CatchId,
}

impl RecencyKey {
    fn order(&self, other: &Self) -> Ordering {
        other.logged_at.cmp(&self.logged_at).then_with(|| self.id.cmp(&other.id))
    }
}

/// Closest first, then newest, then catch id.
#[derive(Debug, Clone, Copy, PartialEq)]
struct NearbyKey {
    distance: f64,
    logged_at: DateTime<Utc>,
    id: CatchId,
}

impl NearbyKey {
    fn order(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| other.logged_at.cmp(&self.logged_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Most points first, then username, then user id.
#[derive(Debug, Clone, PartialEq)]
struct LeaderKey {
    points: u64,
    username: String,
    id: UserId,
}

impl LeaderKey {
    fn order(&self, other: &Self) -> Ordering {
        other
            .points
            .cmp(&self.points)
            .then_with(|| self.username.cmp(&other.username))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Cuts a sorted run of `(key, item)` pairs after `limit` items and encodes the cursor
/// of the last one if anything is left.
fn paginate<K, T>(mut rows: Vec<(K, T)>, limit: usize, to_cursor: impl Fn(&K) -> CursorKey) -> Result<Page<T>> {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = match rows.last() {
        Some((key, _)) if has_more => Some(encode(&to_cursor(key))?),
        _ => None,
    };
    Ok(Page {
        items: rows.into_iter().map(|(_, item)| item).collect(),
        next_cursor,
    })
}

pub struct FeedAggregator {
    store: StoreHandle,
    geo: Arc<GeoIndex>,
    ranking: Arc<RankingEngine>,
    config: Arc<EngineConfig>,
    visibility: VisibilityResolver,
}

impl FeedAggregator {
    pub fn new(store: StoreHandle, geo: Arc<GeoIndex>, ranking: Arc<RankingEngine>, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            geo,
            ranking,
            config,
            visibility: VisibilityResolver,
        }
    }

    /// Catches by the users the viewer follows, newest first.
    pub async fn personal_feed(&self, viewer_id: UserId, cursor: Option<&str>, limit: Option<usize>) -> Result<Page<CatchSummary>> {
        let limit = self.config.page_size(limit)?;
        let after = decode_as(cursor, |key| match key {
            CursorKey::Personal { logged_at, id } => Some(RecencyKey { logged_at, id }),
            _ => None,
        })?;

        let viewer = self.store.require_user(viewer_id).await?;
        let graph = ViewerGraph::from_user(&viewer);

        let mut rows = Vec::new();
        for followee in graph.following() {
            for catch in self.store.list_catches_by_owner(followee).await? {
                if catch.is_retracted() || !self.visibility.is_visible(viewer_id, &catch, &graph) {
                    continue;
                }
                let key = RecencyKey {
                    logged_at: catch.logged_time(),
                    id: catch.id,
                };
                if after.as_ref().is_some_and(|a| key.order(a) != Ordering::Greater) {
                    continue;
                }
                rows.push((key, CatchSummary::from_catch(&catch)));
            }
        }
        rows.sort_by(|a, b| a.0.order(&b.0));

        paginate(rows, limit, |k| CursorKey::Personal {
            logged_at: k.logged_at,
            id: k.id,
        })
    }

    /// Visible catches around a point, closest first.
    pub async fn nearby_feed(
        &self,
        viewer_id: UserId,
        query: NearbyQuery,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Page<CatchSummary>> {
        let limit = self.config.page_size(limit)?;
        let after = decode_as(cursor, |key| match key {
            CursorKey::Nearby {
                distance_bits,
                logged_at,
                id,
            } => Some(NearbyKey {
                distance: f64::from_bits(distance_bits),
                logged_at,
                id,
            }),
            _ => None,
        })?;

        let viewer = self.store.require_user(viewer_id).await?;
        let graph = ViewerGraph::from_user(&viewer);

        let mut scan = self.geo.scan(query.longitude, query.latitude, query.radius_meters)?;
        if let Some(a) = &after {
            scan = scan.from_distance(a.distance);
        }

        // Hits arrive by distance; a page is complete once it holds more than `limit`
        // rows and the next hit is strictly farther than everything collected.
        let mut rows: Vec<(NearbyKey, CatchSummary)> = Vec::new();
        for hit in scan {
            if rows.len() > limit && rows.last().is_some_and(|(k, _)| hit.distance_meters > k.distance) {
                break;
            }
            let Some(catch) = self.store.get_catch(hit.catch_id).await? else {
                continue;
            };
            if catch.is_retracted() || !self.visibility.is_visible(viewer_id, &catch, &graph) {
                continue;
            }
            let key = NearbyKey {
                distance: hit.distance_meters,
                logged_at: catch.logged_time(),
                id: catch.id,
            };
            if after.as_ref().is_some_and(|a| key.order(a) != Ordering::Greater) {
                continue;
            }
            rows.push((key, CatchSummary::from_catch(&catch).with_distance(hit.distance_meters)));
        }
        rows.sort_by(|a, b| a.0.order(&b.0));

        paginate(rows, limit, |k| CursorKey::Nearby {
            distance_bits: k.distance.to_bits(),
            logged_at: k.logged_at,
            id: k.id,
        })
    }

    /// All users by points. With a window, by points earned inside it; the tier always
    /// reflects the user's overall points.
    pub async fn leaderboard(
        &self,
        window: Option<TimeWindow>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Page<LeaderboardEntry>> {
        let limit = self.config.page_size(limit)?;
        let after = decode_as(cursor, |key| match key {
            CursorKey::Leaderboard { points, username, id } => Some(LeaderKey { points, username, id }),
            _ => None,
        })?;

        let users = self.store.list_users().await?;
        let mut ranked: Vec<(LeaderKey, RankTier)> = Vec::with_capacity(users.len());
        for user in users {
            let points = match &window {
                Some(w) => self.ranking.points_within(user.id, w).await?,
                None => user.points,
            };
            let tier = self.ranking.tier_for(user.points);
            ranked.push((
                LeaderKey {
                    points,
                    username: user.username,
                    id: user.id,
                },
                tier,
            ));
        }
        ranked.sort_by(|a, b| a.0.order(&b.0));

        let rows: Vec<(LeaderKey, LeaderboardEntry)> = ranked
            .into_iter()
            .enumerate()
            .filter(|(_, (key, _))| after.as_ref().map_or(true, |a| key.order(a) == Ordering::Greater))
            .take(limit + 1)
            .map(|(i, (key, tier))| {
                let entry = LeaderboardEntry {
                    position: i + 1,
                    user_id: key.id,
                    username: key.username.clone(),
                    points: key.points,
                    tier,
                };
                (key, entry)
            })
            .collect();

        paginate(rows, limit, |k| CursorKey::Leaderboard {
            points: k.points,
            username: k.username.clone(),
            id: k.id,
        })
    }
}
