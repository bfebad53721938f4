use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::core::errors::{CoreError, Result};
use crate::models::models::{CatchId, RankTier, UserId};

pub const USERS_LIST_KEY: &str = "users_list";
pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 32;
pub const MAX_BIO_LENGTH: usize = 500;
pub const MAX_NAME_LENGTH: usize = 100;

pub fn user_key(id: &UserId) -> String {
    format!("user:{}", id)
}

pub fn catch_key(id: &CatchId) -> String {
    format!("catch:{}", id)
}

pub fn owner_catches_key(id: &UserId) -> String {
    format!("owner_catches:{}", id)
}

/// Points and size thresholds for one species. Weights in kg, lengths in cm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesRule {
    pub base_points: u64,
    pub weight_threshold: f64,
    pub weight_unit_points: u64,
    pub length_threshold: f64,
    pub length_unit_points: u64,
}

impl Default for SpeciesRule {
    fn default() -> Self {
        Self {
            base_points: 10,
            weight_threshold: 2.0,
            weight_unit_points: 1,
            length_threshold: 50.0,
            length_unit_points: 1,
        }
    }
}

impl SpeciesRule {
    fn new(base_points: u64, weight_threshold: f64, weight_unit_points: u64, length_threshold: f64) -> Self {
        Self {
            base_points,
            weight_threshold,
            weight_unit_points,
            length_threshold,
            length_unit_points: 1,
        }
    }
}

/// Minimum points for each tier above Novice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub intermediate: u64,
    pub master: u64,
    pub legend: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            intermediate: 100,
            master: 500,
            legend: 2000,
        }
    }
}

impl TierThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.intermediate == 0 || self.intermediate >= self.master || self.master >= self.legend {
            return Err(CoreError::InvalidInput(format!(
                "tier thresholds must be strictly ascending and above zero, got {}/{}/{}",
                self.intermediate, self.master, self.legend
            )));
        }
        Ok(())
    }

    pub fn tier_for(&self, points: u64) -> RankTier {
        if points >= self.legend {
            RankTier::Legend
        } else if points >= self.master {
            RankTier::Master
        } else if points >= self.intermediate {
            RankTier::Intermediate
        } else {
            RankTier::Novice
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Keyed by species name, matched case-insensitively.
    pub species: HashMap<String, SpeciesRule>,
    pub default_rule: SpeciesRule,
    pub like_points: u64,
    pub comment_points: u64,
    pub release_bonus: u64,
    pub tiers: TierThresholds,
}

impl Default for RankingConfig {
    fn default() -> Self {
        let species = [
            ("bass", SpeciesRule::new(10, 2.0, 2, 45.0)),
            ("trout", SpeciesRule::new(10, 1.5, 2, 40.0)),
            ("pike", SpeciesRule::new(15, 4.0, 1, 70.0)),
            ("carp", SpeciesRule::new(8, 5.0, 1, 60.0)),
            ("salmon", SpeciesRule::new(20, 4.0, 2, 70.0)),
        ]
        .into_iter()
        .map(|(name, rule)| (name.to_string(), rule))
        .collect();

        Self {
            species,
            default_rule: SpeciesRule::default(),
            like_points: 1,
            comment_points: 2,
            release_bonus: 5,
            tiers: TierThresholds::default(),
        }
    }
}

impl RankingConfig {
    pub fn rule_for(&self, species: &str) -> &SpeciesRule {
        let wanted = species.trim();
        self.species
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(wanted))
            .map(|(_, rule)| rule)
            .unwrap_or(&self.default_rule)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store_timeout_ms: u64,
    pub max_write_retries: u32,
    pub visibility_grace_hours: i64,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_comment_length: usize,
    pub max_notes_length: usize,
    pub ranking: RankingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 2000,
            max_write_retries: 3,
            visibility_grace_hours: 24,
            default_page_size: 20,
            max_page_size: 100,
            max_comment_length: 1000,
            max_notes_length: 5000,
            ranking: RankingConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl EngineConfig {
    /// Defaults overlaid with `ATLAS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = env_parse("ATLAS_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = ms;
        }
        if let Some(retries) = env_parse("ATLAS_MAX_WRITE_RETRIES") {
            config.max_write_retries = retries;
        }
        if let Some(hours) = env_parse("ATLAS_VISIBILITY_GRACE_HOURS") {
            config.visibility_grace_hours = hours;
        }
        if let Some(size) = env_parse("ATLAS_PAGE_SIZE") {
            config.default_page_size = size;
        }
        if let Ok(raw) = std::env::var("ATLAS_RANKING_JSON") {
            config.ranking = serde_json::from_str(&raw)
                .map_err(|e| CoreError::InvalidInput(format!("ATLAS_RANKING_JSON: {}", e)))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ranking.tiers.validate()?;
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(CoreError::InvalidInput(format!(
                "default page size {} must be within 1..={}",
                self.default_page_size, self.max_page_size
            )));
        }
        self.visibility_grace()?;
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// The grace period as a duration. Negative or unrepresentable hours are rejected.
    pub fn visibility_grace(&self) -> Result<TimeDelta> {
        if self.visibility_grace_hours < 0 {
            return Err(CoreError::InvalidInput("visibility grace must not be negative".to_string()));
        }
        TimeDelta::try_hours(self.visibility_grace_hours).ok_or_else(|| {
            CoreError::InvalidInput(format!("visibility grace of {} hours is out of range", self.visibility_grace_hours))
        })
    }

    pub fn page_size(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            None => Ok(self.default_page_size),
            Some(n) if n == 0 || n > self.max_page_size => Err(CoreError::InvalidInput(format!(
                "page size must be within 1..={}",
                self.max_page_size
            ))),
            Some(n) => Ok(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_default_thresholds() {
        let tiers = TierThresholds::default();
        assert_eq!(tiers.tier_for(0), RankTier::Novice);
        assert_eq!(tiers.tier_for(99), RankTier::Novice);
        assert_eq!(tiers.tier_for(100), RankTier::Intermediate);
        assert_eq!(tiers.tier_for(499), RankTier::Intermediate);
        assert_eq!(tiers.tier_for(500), RankTier::Master);
        assert_eq!(tiers.tier_for(1999), RankTier::Master);
        assert_eq!(tiers.tier_for(2000), RankTier::Legend);
    }

    #[test]
    fn tier_mapping_is_monotonic() {
        let tiers = TierThresholds { intermediate: 7, master: 30, legend: 31 };
        let mut previous = tiers.tier_for(0);
        for points in 1..100 {
            let tier = tiers.tier_for(points);
            assert!(tier >= previous);
            previous = tier;
        }
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let tiers = TierThresholds { intermediate: 500, master: 100, legend: 2000 };
        assert!(matches!(tiers.validate(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn species_lookup_ignores_case_and_falls_back() {
        let ranking = RankingConfig::default();
        assert_eq!(ranking.rule_for(" Pike ").base_points, 15);
        assert_eq!(ranking.rule_for("Walleye"), &ranking.default_rule);
    }

    #[test]
    fn partial_ranking_json_keeps_defaults() {
        let ranking: RankingConfig = serde_json::from_str(r#"{"like_points": 3, "tiers": {"legend": 5000}}"#).unwrap();
        assert_eq!(ranking.like_points, 3);
        assert_eq!(ranking.comment_points, 2);
        assert_eq!(ranking.tiers.legend, 5000);
        assert_eq!(ranking.tiers.master, 500);
    }

    #[test]
    fn page_size_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.page_size(None).unwrap(), 20);
        assert_eq!(config.page_size(Some(5)).unwrap(), 5);
        assert!(config.page_size(Some(0)).is_err());
        assert!(config.page_size(Some(101)).is_err());
    }

    #[test]
    fn grace_hours_must_fit_a_duration() {
        let config = EngineConfig {
            visibility_grace_hours: i64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.visibility_grace(), Err(CoreError::InvalidInput(_))));
        assert!(matches!(config.validate(), Err(CoreError::InvalidInput(_))));

        let negative = EngineConfig {
            visibility_grace_hours: -1,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
        assert_eq!(EngineConfig::default().visibility_grace().unwrap(), TimeDelta::hours(24));
    }

    #[test]
    fn env_overlay_reads_atlas_variables() {
        const KEYS: [&str; 5] = [
            "ATLAS_STORE_TIMEOUT_MS",
            "ATLAS_MAX_WRITE_RETRIES",
            "ATLAS_VISIBILITY_GRACE_HOURS",
            "ATLAS_PAGE_SIZE",
            "ATLAS_RANKING_JSON",
        ];
        let clear = || KEYS.iter().for_each(|k| std::env::remove_var(k));
        clear();
        assert_eq!(EngineConfig::from_env().unwrap(), EngineConfig::default());

        std::env::set_var("ATLAS_STORE_TIMEOUT_MS", "750");
        std::env::set_var("ATLAS_MAX_WRITE_RETRIES", "9");
        std::env::set_var("ATLAS_VISIBILITY_GRACE_HOURS", "48");
        std::env::set_var("ATLAS_PAGE_SIZE", "5");
        std::env::set_var("ATLAS_RANKING_JSON", r#"{"release_bonus": 8, "tiers": {"intermediate": 50}}"#);
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.store_timeout(), Duration::from_millis(750));
        assert_eq!(config.max_write_retries, 9);
        assert_eq!(config.visibility_grace_hours, 48);
        assert_eq!(config.default_page_size, 5);
        assert_eq!(config.ranking.release_bonus, 8);
        assert_eq!(config.ranking.like_points, 1);
        assert_eq!(config.ranking.tiers.intermediate, 50);
        assert_eq!(config.ranking.tiers.master, 500);

        std::env::set_var("ATLAS_RANKING_JSON", "{not json");
        assert!(matches!(EngineConfig::from_env(), Err(CoreError::InvalidInput(_))));

        std::env::set_var("ATLAS_RANKING_JSON", r#"{"tiers": {"intermediate": 600}}"#);
        assert!(matches!(EngineConfig::from_env(), Err(CoreError::InvalidInput(_))));

        std::env::remove_var("ATLAS_RANKING_JSON");
        std::env::set_var("ATLAS_VISIBILITY_GRACE_HOURS", i64::MAX.to_string());
        assert!(matches!(EngineConfig::from_env(), Err(CoreError::InvalidInput(_))));

        // unparseable numbers keep the default
        std::env::set_var("ATLAS_VISIBILITY_GRACE_HOURS", "soon");
        assert_eq!(EngineConfig::from_env().unwrap().visibility_grace_hours, 24);

        std::env::set_var("ATLAS_PAGE_SIZE", "0");
        assert!(EngineConfig::from_env().is_err());
        clear();
    }
}
