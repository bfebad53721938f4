//! Points and rank tiers.
//!
//! A user's points are the sum of per-catch contributions, and every contribution is
//! recomputed from the catch document itself. Recomputing replaces the user's whole
//! ledger entry, so running it twice never counts anything twice.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{RankingConfig, SpeciesRule};
use crate::core::db::StoreHandle;
use crate::core::errors::{CoreError, Result};
use crate::models::models::{Catch, CatchId, Measurements, RankTier, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSource {
    Base,
    Size,
    Release,
    Like,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointEvent {
    pub source: PointSource,
    pub points: u64,
    pub earned_at: DateTime<Utc>,
}

/// Everything one catch is worth to its owner, dated so windows can be cut from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatchContribution {
    pub catch_id: CatchId,
    pub events: Vec<PointEvent>,
}

impl CatchContribution {
    pub fn total(&self) -> u64 {
        self.events.iter().fold(0, |acc, e| acc.saturating_add(e.points))
    }

    pub fn within(&self, window: &TimeWindow) -> u64 {
        self.events
            .iter()
            .filter(|e| window.contains(e.earned_at))
            .fold(0, |acc, e| acc.saturating_add(e.points))
    }
}

/// Half-open interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from >= to {
            return Err(CoreError::InvalidInput(format!("empty time window {} .. {}", from, to)));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }
}

pub type Ledger = BTreeMap<CatchId, CatchContribution>;

fn units_above(value: Option<f64>, threshold: f64) -> u64 {
    match value {
        Some(v) if v.is_finite() && v > threshold => (v - threshold).floor() as u64,
        _ => 0,
    }
}

/// Whole units of weight and length above the species thresholds. Absent
/// measurements count as zero. Saturates instead of overflowing.
pub fn size_bonus(rule: &SpeciesRule, measurements: &Measurements) -> u64 {
    let weight = units_above(measurements.weight, rule.weight_threshold).saturating_mul(rule.weight_unit_points);
    let length = units_above(measurements.length, rule.length_threshold).saturating_mul(rule.length_unit_points);
    weight.saturating_add(length)
}

/// Scores one catch. Likes and comments count once per user, and never for the owner.
pub fn score_catch(config: &RankingConfig, catch: &Catch) -> CatchContribution {
    let rule = config.rule_for(&catch.species);
    let logged = catch.logged_time();
    let mut events = vec![PointEvent {
        source: PointSource::Base,
        points: rule.base_points,
        earned_at: logged,
    }];

    let size = size_bonus(rule, &catch.measurements);
    if size > 0 {
        events.push(PointEvent {
            source: PointSource::Size,
            points: size,
            earned_at: logged,
        });
    }

    if catch.release.earns_bonus() && config.release_bonus > 0 {
        events.push(PointEvent {
            source: PointSource::Release,
            points: config.release_bonus,
            earned_at: catch.release.released_at.unwrap_or(logged),
        });
    }

    let mut likers = HashSet::new();
    for like in &catch.likes {
        if like.user_id != catch.owner_id && likers.insert(like.user_id) && config.like_points > 0 {
            events.push(PointEvent {
                source: PointSource::Like,
                points: config.like_points,
                earned_at: like.liked_at,
            });
        }
    }

    let mut commenters = HashSet::new();
    for comment in &catch.comments {
        if comment.author_id != catch.owner_id && commenters.insert(comment.author_id) && config.comment_points > 0 {
            events.push(PointEvent {
                source: PointSource::Comment,
                points: config.comment_points,
                earned_at: comment.created_at,
            });
        }
    }

    CatchContribution {
        catch_id: catch.id,
        events: events.into_iter().filter(|e| e.points > 0).collect(),
    }
}

pub struct RankingEngine {
    store: StoreHandle,
    config: Arc<RankingConfig>,
    ledgers: DashMap<UserId, Arc<Ledger>>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl RankingEngine {
    pub fn new(store: StoreHandle, config: Arc<RankingConfig>) -> Self {
        Self {
            store,
            config,
            ledgers: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: UserId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(user_id).or_default().value())
    }

    /// Rebuilds the user's ledger from their catches and stores the new total.
    /// At most one recompute per user runs at a time.
    pub async fn recompute_points(&self, user_id: UserId) -> Result<u64> {
        let lock = self.lock_for(user_id);
        let result = {
            let _guard = lock.lock().await;
            self.rebuild_ledger(user_id).await
        };
        drop(lock);
        // Nobody else holds or waits on the lock once only the map refers to it.
        self.locks.remove_if(&user_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn rebuild_ledger(&self, user_id: UserId) -> Result<u64> {
        let user = self.store.require_user(user_id).await?;
        let catches = self.store.list_catches_by_owner(user_id).await?;
        let ledger: Ledger = catches
            .iter()
            .map(|c| (c.id, score_catch(&self.config, c)))
            .collect();
        let total = ledger
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(c.total()));

        if user.points != total {
            self.store
                .update_user(user_id, |u| {
                    if u.points == total {
                        return Ok(false);
                    }
                    u.points = total;
                    Ok(true)
                })
                .await?;
        }
        self.ledgers.insert(user_id, Arc::new(ledger));

        tracing::debug!(user = %user_id, points = total, "recomputed points");
        Ok(total)
    }

    pub fn tier_for(&self, points: u64) -> RankTier {
        self.config.tiers.tier_for(points)
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Per-catch contributions, recomputing when this process has not seen the user yet.
    pub async fn contributions(&self, user_id: UserId) -> Result<Arc<Ledger>> {
        if let Some(ledger) = self.ledgers.get(&user_id) {
            return Ok(Arc::clone(ledger.value()));
        }
        self.recompute_points(user_id).await?;
        self.ledgers
            .get(&user_id)
            .map(|l| Arc::clone(l.value()))
            .ok_or(CoreError::UnknownUser(user_id))
    }

    /// Points earned inside `window`.
    pub async fn points_within(&self, user_id: UserId, window: &TimeWindow) -> Result<u64> {
        let ledger = self.contributions(user_id).await?;
        Ok(ledger.values().fold(0u64, |acc, c| acc.saturating_add(c.within(window))))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::config::EngineConfig;
    use crate::core::db::{CatchStore, MemoryStore};
    use crate::models::models::{Comment, GeoPoint, Like, Location, ReleaseInfo, User, Visibility};

    fn bass(owner: UserId, weight: Option<f64>) -> Catch {
        let location = Location {
            point: GeoPoint::new(-81.5, 27.6).unwrap(),
            address: None,
        };
        let mut catch = Catch::new(owner, "Bass".to_string(), location, Visibility::Public, Utc::now());
        catch.measurements.weight = weight;
        catch
    }

    #[test]
    fn base_plus_size() {
        let config = RankingConfig::default();
        // bass: base 10, 2 points per kg above 2.0
        let catch = bass(UserId::new(), Some(4.7));
        assert_eq!(score_catch(&config, &catch).total(), 10 + 2 * 2);
    }

    #[test]
    fn missing_measurements_score_base_only() {
        let config = RankingConfig::default();
        let mut catch = bass(UserId::new(), None);
        catch.species = "Unlisted Minnow".to_string();
        assert_eq!(score_catch(&config, &catch).total(), config.default_rule.base_points);
    }

    #[test]
    fn repeated_likes_and_comments_count_once() {
        let config = RankingConfig::default();
        let owner = UserId::new();
        let fan = UserId::new();
        let now = Utc::now();
        let mut catch = bass(owner, None);
        catch.likes.push(Like { user_id: fan, liked_at: now });
        catch.likes.push(Like { user_id: fan, liked_at: now });
        for text in ["nice", "really nice", "spam"] {
            catch.comments.push(Comment {
                id: Uuid::new_v4(),
                author_id: fan,
                text: text.to_string(),
                created_at: now,
            });
        }
        assert_eq!(score_catch(&config, &catch).total(), 10 + 1 + 2);
    }

    #[test]
    fn owner_engagement_is_free() {
        let config = RankingConfig::default();
        let owner = UserId::new();
        let mut catch = bass(owner, None);
        catch.likes.push(Like { user_id: owner, liked_at: Utc::now() });
        assert_eq!(score_catch(&config, &catch).total(), 10);
    }

    #[test]
    fn healthy_release_earns_bonus() {
        let config = RankingConfig::default();
        let mut catch = bass(UserId::new(), None);
        catch.release = ReleaseInfo {
            was_released: true,
            released_at: None,
            released_healthy: Some(false),
        };
        assert_eq!(score_catch(&config, &catch).total(), 10);
        catch.release.released_healthy = Some(true);
        assert_eq!(score_catch(&config, &catch).total(), 10 + config.release_bonus);
    }

    #[test]
    fn window_cuts_by_event_time() {
        let config = RankingConfig::default();
        let start = Utc::now();
        let mut catch = bass(UserId::new(), None);
        catch.captured_at = Some(start);
        catch.likes.push(Like {
            user_id: UserId::new(),
            liked_at: start + Duration::days(3),
        });
        let contribution = score_catch(&config, &catch);
        let first_day = TimeWindow::new(start, start + Duration::days(1)).unwrap();
        let later = TimeWindow::new(start + Duration::days(1), start + Duration::days(7)).unwrap();
        assert_eq!(contribution.within(&first_day), 10);
        assert_eq!(contribution.within(&later), 1);
        assert!(TimeWindow::new(start, start).is_err());
    }

    #[test]
    fn size_bonus_floors_at_zero() {
        let rule = SpeciesRule::default();
        let tiny = Measurements { weight: Some(0.3), length: Some(12.0), depth: None };
        assert_eq!(size_bonus(&rule, &tiny), 0);
        let nan = Measurements { weight: Some(f64::NAN), length: None, depth: None };
        assert_eq!(size_bonus(&rule, &nan), 0);
    }

    #[test]
    fn oversized_measurements_saturate() {
        let config = RankingConfig::default();
        let mut catch = bass(UserId::new(), Some(1.0e19));
        catch.measurements.length = Some(f64::MAX);
        let total = score_catch(&config, &catch).total();
        assert_eq!(total, u64::MAX);

        let mut ledger = Ledger::new();
        ledger.insert(catch.id, score_catch(&config, &catch));
        let other = bass(UserId::new(), Some(1.0e19));
        ledger.insert(other.id, score_catch(&config, &other));
        let sum = ledger.values().fold(0u64, |acc, c| acc.saturating_add(c.total()));
        assert_eq!(sum, u64::MAX);
    }

    #[tokio::test]
    async fn recompute_releases_its_lock() {
        let memory = Arc::new(MemoryStore::new());
        let user = User::new(UserId::new(), "walleye".to_string(), "w@example.com".to_string(), Utc::now());
        let user = memory.upsert_user(user).await.unwrap();
        let engine = RankingEngine::new(
            StoreHandle::new(memory, &EngineConfig::default()),
            Arc::new(RankingConfig::default()),
        );

        assert_eq!(engine.recompute_points(user.id).await.unwrap(), 0);
        assert!(engine.locks.is_empty());

        assert!(engine.recompute_points(UserId::new()).await.is_err());
        assert!(engine.locks.is_empty());
        assert_eq!(engine.ledgers.len(), 1);
    }
}
