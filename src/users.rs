use std::sync::Arc;

use serde::Deserialize;

use crate::config::{MAX_BIO_LENGTH, MAX_NAME_LENGTH};
use crate::core::db::StoreHandle;
use crate::core::errors::{CoreError, Result};
use crate::core::helpers::{clean_optional_text, normalize_email, normalize_username, Clock};
use crate::models::models::{Preferences, User, UserId, UserProfile};
use crate::ranking::RankingEngine;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Profile changes. `None` leaves a field alone; an empty string clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    pub bio: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_picture: Option<String>,
    pub home_location: Option<String>,
    pub preferences: Option<Preferences>,
}

fn apply(slot: &mut Option<String>, cleaned: Option<String>, requested: bool) {
    if requested {
        *slot = cleaned;
    }
}

pub struct UserDirectory {
    store: StoreHandle,
    ranking: Arc<RankingEngine>,
    clock: Arc<dyn Clock>,
}

impl UserDirectory {
    pub fn new(store: StoreHandle, ranking: Arc<RankingEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { store, ranking, clock }
    }

    pub async fn register_user(&self, new: NewUser) -> Result<User> {
        let username = normalize_username(&new.username)?;
        let email = normalize_email(&new.email)?;
        let first_name = clean_optional_text("first name", new.first_name.as_deref(), MAX_NAME_LENGTH)?;
        let last_name = clean_optional_text("last name", new.last_name.as_deref(), MAX_NAME_LENGTH)?;

        if self.find_by_username(&username).await?.is_some() {
            return Err(CoreError::DuplicateUsername(username));
        }

        let mut user = User::new(UserId::new(), username, email, self.clock.now());
        user.first_name = first_name;
        user.last_name = last_name;
        let user = self.store.upsert_user(user).await?;

        tracing::debug!(user = %user.id, username = %user.username, "user registered");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User> {
        self.store.require_user(user_id).await
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let wanted = username.trim();
        let users = self.store.list_users().await?;
        Ok(users.into_iter().find(|u| u.username.eq_ignore_ascii_case(wanted)))
    }

    pub async fn update_profile(&self, actor: UserId, update: ProfileUpdate) -> Result<User> {
        let bio = clean_optional_text("bio", update.bio.as_deref(), MAX_BIO_LENGTH)?;
        let first_name = clean_optional_text("first name", update.first_name.as_deref(), MAX_NAME_LENGTH)?;
        let last_name = clean_optional_text("last name", update.last_name.as_deref(), MAX_NAME_LENGTH)?;
        let picture = clean_optional_text("profile picture", update.profile_picture.as_deref(), MAX_BIO_LENGTH)?;
        let home = clean_optional_text("home location", update.home_location.as_deref(), MAX_NAME_LENGTH)?;
        let now = self.clock.now();

        self.store
            .update_user(actor, |u| {
                apply(&mut u.bio, bio.clone(), update.bio.is_some());
                apply(&mut u.first_name, first_name.clone(), update.first_name.is_some());
                apply(&mut u.last_name, last_name.clone(), update.last_name.is_some());
                apply(&mut u.profile_picture, picture.clone(), update.profile_picture.is_some());
                apply(&mut u.home_location, home.clone(), update.home_location.is_some());
                if let Some(preferences) = &update.preferences {
                    u.preferences = preferences.clone();
                }
                u.updated_at = now;
                Ok(true)
            })
            .await
    }

    /// Public view of a user with their current tier.
    pub async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
        let user = self.store.require_user(user_id).await?;
        Ok(UserProfile {
            id: user.id,
            username: user.username,
            bio: user.bio,
            points: user.points,
            tier: self.ranking.tier_for(user.points),
            follower_count: user.followers.len(),
            following_count: user.following.len(),
        })
    }
}
