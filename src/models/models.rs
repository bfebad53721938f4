use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatchId(pub Uuid);

impl CatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-catch access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Friends,
    Private,
}

impl Visibility {
    /// Higher means visible to more people.
    pub fn openness(self) -> u8 {
        match self {
            Visibility::Private => 0,
            Visibility::Friends => 1,
            Visibility::Public => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RankTier {
    #[serde(rename = "Novice Angler")]
    Novice,
    #[serde(rename = "Intermediate Angler")]
    Intermediate,
    #[serde(rename = "Master Angler")]
    Master,
    #[serde(rename = "Legend")]
    Legend,
}

impl RankTier {
    pub fn label(self) -> &'static str {
        match self {
            RankTier::Novice => "Novice Angler",
            RankTier::Intermediate => "Intermediate Angler",
            RankTier::Master => "Master Angler",
            RankTier::Legend => "Legend",
        }
    }
}

impl fmt::Display for RankTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub notifications: bool,
    pub private_profile: bool,
    pub subscription_tier: SubscriptionTier,
    pub default_visibility: Visibility,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            notifications: true,
            private_profile: false,
            subscription_tier: SubscriptionTier::Free,
            default_visibility: Visibility::Public,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub profile_picture: Option<String>,
    pub home_location: Option<String>,
    /// Only ever written by the ranking engine.
    pub points: u64,
    pub followers: BTreeSet<UserId>,
    pub following: BTreeSet<UserId>,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl User {
    pub fn new(id: UserId, username: String, email: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            username,
            email,
            first_name: None,
            last_name: None,
            bio: None,
            profile_picture: None,
            home_location: None,
            points: 0,
            followers: BTreeSet::new(),
            following: BTreeSet::new(),
            preferences: Preferences::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Visibility given to a new catch that does not name one.
    pub fn catch_default_visibility(&self) -> Visibility {
        let preferred = self.preferences.default_visibility;
        if self.preferences.private_profile && preferred == Visibility::Public {
            Visibility::Friends
        } else {
            preferred
        }
    }
}

/// A validated longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Result<Self> {
        let valid = longitude.is_finite()
            && latitude.is_finite()
            && (-180.0..=180.0).contains(&longitude)
            && (-90.0..=90.0).contains(&latitude);
        if !valid {
            return Err(CoreError::InvalidLocation { longitude, latitude });
        }
        Ok(Self { longitude, latitude })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub point: GeoPoint,
    pub address: Option<String>,
}

/// Weight in kilograms, length and depth in centimetres and metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub weight: Option<f64>,
    pub length: Option<f64>,
    pub depth: Option<f64>,
}

/// Plausibility limits for a single catch.
pub const MAX_WEIGHT_KG: f64 = 5_000.0;
pub const MAX_LENGTH_CM: f64 = 2_500.0;
pub const MAX_DEPTH_M: f64 = 11_000.0;

impl Measurements {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("weight", self.weight, MAX_WEIGHT_KG),
            ("length", self.length, MAX_LENGTH_CM),
            ("depth", self.depth, MAX_DEPTH_M),
        ];
        for (name, value, max) in fields {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(CoreError::InvalidInput(format!("{} must be a non-negative number", name)));
                }
                if v > max {
                    return Err(CoreError::InvalidInput(format!("{} of {} exceeds the maximum of {}", name, v, max)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WaterConditions {
    pub temperature: Option<f64>,
    pub clarity: Option<String>,
    pub flow_rate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Weather {
    pub condition: Option<String>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
}

/// Environmental metadata. Carried along, never interpreted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Conditions {
    pub water: WaterConditions,
    pub weather: Weather,
    pub time_of_day: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub was_released: bool,
    pub released_at: Option<DateTime<Utc>>,
    pub released_healthy: Option<bool>,
}

impl ReleaseInfo {
    pub fn earns_bonus(&self) -> bool {
        self.was_released && self.released_healthy == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Like {
    pub user_id: UserId,
    pub liked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catch {
    pub id: CatchId,
    pub owner_id: UserId,
    pub species: String,
    pub measurements: Measurements,
    pub location: Location,
    pub captured_at: Option<DateTime<Utc>>,
    pub conditions: Conditions,
    pub lure_used: Option<String>,
    pub release: ReleaseInfo,
    pub images: Vec<String>,
    pub notes: Option<String>,
    pub visibility: Visibility,
    /// Unique per user, in the order they arrived.
    pub likes: Vec<Like>,
    pub comments: Vec<Comment>,
    pub retracted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Catch {
    pub fn new(owner_id: UserId, species: String, location: Location, visibility: Visibility, now: DateTime<Utc>) -> Self {
        Self {
            id: CatchId::new(),
            owner_id,
            species,
            measurements: Measurements::default(),
            location,
            captured_at: None,
            conditions: Conditions::default(),
            lure_used: None,
            release: ReleaseInfo::default(),
            images: Vec::new(),
            notes: None,
            visibility,
            likes: Vec::new(),
            comments: Vec::new(),
            retracted_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Capture time, falling back to when the catch was logged.
    pub fn logged_time(&self) -> DateTime<Utc> {
        self.captured_at.unwrap_or(self.created_at)
    }

    pub fn is_liked_by(&self, user_id: UserId) -> bool {
        self.likes.iter().any(|l| l.user_id == user_id)
    }

    pub fn is_retracted(&self) -> bool {
        self.retracted_at.is_some()
    }
}

/// Directed follow relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocialEdge {
    pub follower: UserId,
    pub followee: UserId,
}

impl SocialEdge {
    pub fn new(follower: UserId, followee: UserId) -> Result<Self> {
        if follower == followee {
            return Err(CoreError::InvalidEdge(format!("user {} cannot follow themselves", follower)));
        }
        Ok(Self { follower, followee })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchSummary {
    pub id: CatchId,
    pub owner_id: UserId,
    pub species: String,
    pub weight: Option<f64>,
    pub length: Option<f64>,
    pub point: GeoPoint,
    pub logged_at: DateTime<Utc>,
    pub visibility: Visibility,
    pub like_count: usize,
    pub comment_count: usize,
    pub cover_image: Option<String>,
    pub distance_meters: Option<f64>,
}

impl CatchSummary {
    pub fn from_catch(catch: &Catch) -> Self {
        Self {
            id: catch.id,
            owner_id: catch.owner_id,
            species: catch.species.clone(),
            weight: catch.measurements.weight,
            length: catch.measurements.length,
            point: catch.location.point,
            logged_at: catch.logged_time(),
            visibility: catch.visibility,
            like_count: catch.likes.len(),
            comment_count: catch.comments.len(),
            cover_image: catch.images.first().cloned(),
            distance_meters: None,
        }
    }

    pub fn with_distance(mut self, meters: f64) -> Self {
        self.distance_meters = Some(meters);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub position: usize,
    pub user_id: UserId,
    pub username: String,
    pub points: u64,
    pub tier: RankTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub bio: Option<String>,
    pub points: u64,
    pub tier: RankTier,
    pub follower_count: usize,
    pub following_count: usize,
}

/// One page of results plus the cursor for the next one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}
