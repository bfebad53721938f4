use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::db::StoreHandle;
use crate::core::errors::{CoreError, Result};
use crate::core::helpers::{clean_optional_text, normalize_species, sanitize_text, Clock};
use crate::geo::GeoIndex;
use crate::models::models::{
    Catch, CatchId, Comment, Conditions, GeoPoint, Like, Location, Measurements, ReleaseInfo, UserId, Visibility,
};
use crate::ranking::RankingEngine;
use crate::visibility::{ViewerGraph, VisibilityResolver};

/// What an angler submits when logging a catch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewCatch {
    /// Chosen by the caller to make creation safe to retry.
    pub id: Option<CatchId>,
    pub species: String,
    pub longitude: f64,
    pub latitude: f64,
    pub address: Option<String>,
    pub measurements: Measurements,
    pub captured_at: Option<DateTime<Utc>>,
    pub conditions: Conditions,
    pub lure_used: Option<String>,
    pub release: ReleaseInfo,
    pub images: Vec<String>,
    pub notes: Option<String>,
    /// Falls back to the owner's default.
    pub visibility: Option<Visibility>,
}

/// Owner edits. `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatchEdit {
    pub species: Option<String>,
    pub location: Option<GeoPoint>,
    pub address: Option<String>,
    pub measurements: Option<Measurements>,
    pub captured_at: Option<DateTime<Utc>>,
    pub conditions: Option<Conditions>,
    pub lure_used: Option<String>,
    pub images: Option<Vec<String>>,
    pub notes: Option<String>,
}

fn clean_images(images: Vec<String>) -> Vec<String> {
    images
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect()
}

fn ensure_owner(actor: UserId, catch: &Catch) -> Result<()> {
    if catch.owner_id != actor {
        return Err(CoreError::Forbidden {
            actor,
            catch: catch.id,
        });
    }
    Ok(())
}

/// Catch lifecycle. Every write that can change the owner's points ends in a recompute.
pub struct CatchLog {
    store: StoreHandle,
    geo: Arc<GeoIndex>,
    ranking: Arc<RankingEngine>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    visibility: VisibilityResolver,
}

impl CatchLog {
    pub fn new(
        store: StoreHandle,
        geo: Arc<GeoIndex>,
        ranking: Arc<RankingEngine>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            geo,
            ranking,
            clock,
            config,
            visibility: VisibilityResolver,
        }
    }

    /// Logs a new catch. With `new.id` set, a retry after a failed or timed-out call
    /// finds the catch already stored under that id and only finishes indexing and
    /// scoring it.
    pub async fn create_catch(&self, owner_id: UserId, new: NewCatch) -> Result<Catch> {
        let owner = self.store.require_user(owner_id).await?;
        let species = normalize_species(&new.species)?;
        let point = GeoPoint::new(new.longitude, new.latitude)?;
        new.measurements.validate()?;
        let notes = clean_optional_text("notes", new.notes.as_deref(), self.config.max_notes_length)?;
        let address = clean_optional_text("address", new.address.as_deref(), self.config.max_notes_length)?;
        let visibility = new.visibility.unwrap_or_else(|| owner.catch_default_visibility());

        if let Some(id) = new.id {
            if let Some(existing) = self.store.get_catch(id).await? {
                ensure_owner(owner_id, &existing)?;
                tracing::debug!(catch = %id, "catch already logged");
                return self.finish_logging(existing).await;
            }
        }

        let now = self.clock.now();
        let mut catch = Catch::new(owner_id, species, Location { point, address }, visibility, now);
        if let Some(id) = new.id {
            catch.id = id;
        }
        catch.measurements = new.measurements;
        catch.captured_at = new.captured_at;
        catch.conditions = new.conditions;
        catch.lure_used = new.lure_used.map(|l| sanitize_text(&l)).filter(|l| !l.is_empty());
        catch.release = new.release;
        catch.images = clean_images(new.images);
        catch.notes = notes;

        let stored = self.store.upsert_catch(catch).await?;
        tracing::debug!(catch = %stored.id, owner = %owner_id, species = %stored.species, "catch logged");
        self.finish_logging(stored).await
    }

    async fn finish_logging(&self, catch: Catch) -> Result<Catch> {
        if !catch.is_retracted() {
            let point = catch.location.point;
            self.geo.insert(catch.id, point.longitude, point.latitude)?;
        }
        self.ranking.recompute_points(catch.owner_id).await?;
        Ok(catch)
    }

    /// Applies an owner edit against the version the owner last saw.
    pub async fn edit_catch(&self, actor: UserId, catch_id: CatchId, expected_version: u64, edit: CatchEdit) -> Result<Catch> {
        let species = edit.species.as_deref().map(normalize_species).transpose()?;
        let location = edit.location.map(|p| GeoPoint::new(p.longitude, p.latitude)).transpose()?;
        if let Some(measurements) = &edit.measurements {
            measurements.validate()?;
        }
        let notes = clean_optional_text("notes", edit.notes.as_deref(), self.config.max_notes_length)?;
        let address = clean_optional_text("address", edit.address.as_deref(), self.config.max_notes_length)?;

        let mut catch = self.store.require_catch(catch_id).await?;
        ensure_owner(actor, &catch)?;
        if catch.version != expected_version {
            return Err(CoreError::Conflict {
                entity: format!("catch:{}", catch_id),
                expected: expected_version,
                found: catch.version,
            });
        }

        if let Some(species) = species {
            catch.species = species;
        }
        if let Some(point) = location {
            catch.location.point = point;
        }
        if edit.address.is_some() {
            catch.location.address = address;
        }
        if let Some(measurements) = edit.measurements {
            catch.measurements = measurements;
        }
        if edit.captured_at.is_some() {
            catch.captured_at = edit.captured_at;
        }
        if let Some(conditions) = edit.conditions {
            catch.conditions = conditions;
        }
        if let Some(lure) = edit.lure_used {
            catch.lure_used = Some(sanitize_text(&lure)).filter(|l| !l.is_empty());
        }
        if let Some(images) = edit.images {
            catch.images = clean_images(images);
        }
        if edit.notes.is_some() {
            catch.notes = notes;
        }
        catch.updated_at = self.clock.now();

        let stored = self.store.upsert_catch(catch).await?;
        if location.is_some() && !stored.is_retracted() {
            let point = stored.location.point;
            self.geo.insert(stored.id, point.longitude, point.latitude)?;
        }
        self.ranking.recompute_points(stored.owner_id).await?;
        Ok(stored)
    }

    /// Loads a catch the viewer is allowed to see. Hidden catches look missing.
    pub async fn get_catch(&self, viewer_id: UserId, catch_id: CatchId) -> Result<Catch> {
        let viewer = self.store.require_user(viewer_id).await?;
        let catch = self.store.require_catch(catch_id).await?;
        let graph = ViewerGraph::from_user(&viewer);
        let hidden = (catch.is_retracted() && catch.owner_id != viewer_id)
            || !self.visibility.is_visible(viewer_id, &catch, &graph);
        if hidden {
            return Err(CoreError::UnknownCatch(catch_id));
        }
        Ok(catch)
    }

    /// An owner's catches as the viewer may see them, newest first.
    pub async fn catches_by_owner(&self, viewer_id: UserId, owner_id: UserId) -> Result<Vec<Catch>> {
        let viewer = self.store.require_user(viewer_id).await?;
        self.store.require_user(owner_id).await?;
        let graph = ViewerGraph::from_user(&viewer);
        let mut catches = self.store.list_catches_by_owner(owner_id).await?;
        catches.retain(|c| !c.is_retracted() || viewer_id == owner_id);
        self.visibility.retain_visible(viewer_id, &mut catches, &graph);
        catches.sort_by(|a, b| b.logged_time().cmp(&a.logged_time()).then_with(|| a.id.cmp(&b.id)));
        Ok(catches)
    }

    /// Likes count once per user; liking again is a no-op.
    pub async fn like_catch(&self, actor: UserId, catch_id: CatchId) -> Result<Catch> {
        let seen = self.get_catch(actor, catch_id).await?;
        let now = self.clock.now();
        let catch = self
            .store
            .update_catch(catch_id, |c| {
                if c.is_liked_by(actor) {
                    return Ok(false);
                }
                c.likes.push(Like {
                    user_id: actor,
                    liked_at: now,
                });
                Ok(true)
            })
            .await?;
        self.ranking.recompute_points(seen.owner_id).await?;
        Ok(catch)
    }

    pub async fn comment_on_catch(&self, actor: UserId, catch_id: CatchId, text: &str) -> Result<Comment> {
        let text = clean_optional_text("comment", Some(text), self.config.max_comment_length)?
            .ok_or_else(|| CoreError::InvalidInput("Comment text is required".to_string()))?;
        let seen = self.get_catch(actor, catch_id).await?;
        let comment = Comment {
            id: Uuid::new_v4(),
            author_id: actor,
            text,
            created_at: self.clock.now(),
        };
        self.store
            .update_catch(catch_id, |c| {
                if c.comments.iter().any(|existing| existing.id == comment.id) {
                    return Ok(false);
                }
                c.comments.push(comment.clone());
                Ok(true)
            })
            .await?;
        self.ranking.recompute_points(seen.owner_id).await?;
        Ok(comment)
    }

    pub async fn record_release(
        &self,
        actor: UserId,
        catch_id: CatchId,
        released_healthy: bool,
        released_at: Option<DateTime<Utc>>,
    ) -> Result<Catch> {
        let now = self.clock.now();
        let release = ReleaseInfo {
            was_released: true,
            released_at: Some(released_at.unwrap_or(now)),
            released_healthy: Some(released_healthy),
        };
        let catch = self
            .store
            .update_catch(catch_id, |c| {
                ensure_owner(actor, c)?;
                if c.release == release {
                    return Ok(false);
                }
                c.release = release;
                c.updated_at = now;
                Ok(true)
            })
            .await?;
        self.ranking.recompute_points(catch.owner_id).await?;
        Ok(catch)
    }

    /// Narrowing is always allowed. Widening only within the grace period after logging.
    pub async fn set_visibility(&self, actor: UserId, catch_id: CatchId, visibility: Visibility) -> Result<Catch> {
        let now = self.clock.now();
        let grace = self.config.visibility_grace()?;
        self.store
            .update_catch(catch_id, |c| {
                ensure_owner(actor, c)?;
                if c.visibility == visibility {
                    return Ok(false);
                }
                let widening = visibility.openness() > c.visibility.openness();
                if widening && (c.is_retracted() || now - c.created_at > grace) {
                    return Err(CoreError::VisibilityLocked(c.id));
                }
                c.visibility = visibility;
                c.updated_at = now;
                Ok(true)
            })
            .await
    }

    /// Soft delete: the catch goes private and leaves the spatial index. Points stay.
    pub async fn retract_catch(&self, actor: UserId, catch_id: CatchId) -> Result<Catch> {
        let now = self.clock.now();
        let catch = self
            .store
            .update_catch(catch_id, |c| {
                ensure_owner(actor, c)?;
                if c.is_retracted() {
                    return Ok(false);
                }
                c.visibility = Visibility::Private;
                c.retracted_at = Some(now);
                c.updated_at = now;
                Ok(true)
            })
            .await?;
        self.geo.remove(catch_id)?;
        tracing::debug!(catch = %catch_id, "catch retracted");
        Ok(catch)
    }
}
