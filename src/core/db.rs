use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::core::errors::{CoreError, Result};
use crate::models::models::{
    Catch, CatchId, GeoPoint, Like, Location, Measurements, ReleaseInfo, User, UserId, Visibility,
};

/// Persistence collaborator: a document store keyed by id.
///
/// `upsert_*` is an optimistic write. It succeeds only if the submitted `version` matches
/// the stored one (0 for a record that does not exist yet) and returns the record with
/// its version bumped; otherwise it fails with [`CoreError::Conflict`].
/// `upsert_user` also rejects a username or email already held by another user.
#[async_trait]
pub trait CatchStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;
    async fn upsert_user(&self, user: User) -> Result<User>;
    async fn get_catch(&self, id: CatchId) -> Result<Option<Catch>>;
    async fn upsert_catch(&self, catch: Catch) -> Result<Catch>;
    async fn list_catches_by_owner(&self, owner: UserId) -> Result<Vec<Catch>>;
    async fn list_users(&self) -> Result<Vec<User>>;
}

pub(crate) fn check_version(entity: String, stored: Option<u64>, submitted: u64) -> Result<()> {
    let found = stored.unwrap_or(0);
    if found != submitted {
        return Err(CoreError::Conflict { entity, expected: submitted, found });
    }
    Ok(())
}

fn username_taken<'a>(mut users: impl Iterator<Item = &'a User>, candidate: &User) -> bool {
    users.any(|u| u.id != candidate.id && u.username.eq_ignore_ascii_case(&candidate.username))
}

fn email_taken<'a>(mut users: impl Iterator<Item = &'a User>, candidate: &User) -> bool {
    users.any(|u| u.id != candidate.id && u.email.eq_ignore_ascii_case(&candidate.email))
}

/// Usernames and emails are unique across users, ignoring case.
pub(crate) fn check_unique<'a>(users: impl Iterator<Item = &'a User> + Clone, candidate: &User) -> Result<()> {
    if username_taken(users.clone(), candidate) {
        return Err(CoreError::DuplicateUsername(candidate.username.clone()));
    }
    if email_taken(users, candidate) {
        return Err(CoreError::DuplicateEmail(candidate.email.clone()));
    }
    Ok(())
}

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    catches: HashMap<CatchId, Catch>,
    by_owner: HashMap<UserId, Vec<CatchId>>,
}

/// In-process store, for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

/// Ids produced by [`MemoryStore::seed_demo`].
#[derive(Debug, Clone)]
pub struct DemoSeed {
    pub users: Vec<UserId>,
    pub catches: Vec<CatchId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| CoreError::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| CoreError::Storage("memory store lock poisoned".to_string()))
    }

    pub fn reset(&self) -> Result<()> {
        *self.write()? = Tables::default();
        Ok(())
    }

    /// Creates three anglers with a handful of catches if they are not there yet.
    /// "test" follows "dale"; "marina" has a healthy release.
    pub async fn seed_demo(&self, now: DateTime<Utc>) -> Result<DemoSeed> {
        let existing = self.list_users().await?;
        if existing.iter().any(|u| u.username == "test") {
            return Ok(DemoSeed {
                users: existing.iter().map(|u| u.id).collect(),
                catches: Vec::new(),
            });
        }

        let mut users = Vec::new();
        for (name, bio) in [
            ("test", "Test angler"),
            ("marina", "Fly fishing the Sierra every weekend"),
            ("dale", "Bass boat, sunrise, coffee"),
        ] {
            let mut user = User::new(UserId::new(), name.to_string(), format!("{}@example.com", name), now);
            user.bio = Some(bio.to_string());
            users.push(self.upsert_user(user).await?);
        }

        let spots = [
            (1, "Rainbow Trout", -120.0324, 39.0968, Some(1.9), Some(46.0), true),
            (1, "Brown Trout", -119.9801, 38.9399, Some(0.8), None, false),
            (2, "Bass", -81.5158, 27.6648, Some(3.4), Some(52.0), false),
        ];
        let mut catches = Vec::new();
        for (owner, species, lon, lat, weight, length, released) in spots {
            let location = Location {
                point: GeoPoint::new(lon, lat)?,
                address: None,
            };
            let mut catch = Catch::new(users[owner].id, species.to_string(), location, Visibility::Public, now);
            catch.measurements = Measurements { weight, length, depth: None };
            catch.captured_at = Some(now);
            if released {
                catch.release = ReleaseInfo {
                    was_released: true,
                    released_at: Some(now),
                    released_healthy: Some(true),
                };
            }
            catches.push(self.upsert_catch(catch).await?.id);
        }

        let (tester, dale) = (users[0].id, users[2].id);
        let mut follower = users[0].clone();
        follower.following.insert(dale);
        self.upsert_user(follower).await?;
        let mut followee = users[2].clone();
        followee.followers.insert(tester);
        self.upsert_user(followee).await?;

        if let Some(first) = catches.first() {
            let mut liked = self.get_catch(*first).await?.ok_or(CoreError::UnknownCatch(*first))?;
            liked.likes.push(Like { user_id: dale, liked_at: now });
            self.upsert_catch(liked).await?;
        }

        Ok(DemoSeed {
            users: users.iter().map(|u| u.id).collect(),
            catches,
        })
    }
}

#[async_trait]
impl CatchStore for MemoryStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    async fn upsert_user(&self, mut user: User) -> Result<User> {
        let mut tables = self.write()?;
        check_version(format!("user:{}", user.id), tables.users.get(&user.id).map(|u| u.version), user.version)?;
        check_unique(tables.users.values(), &user)?;
        user.version += 1;
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_catch(&self, id: CatchId) -> Result<Option<Catch>> {
        Ok(self.read()?.catches.get(&id).cloned())
    }

    async fn upsert_catch(&self, mut catch: Catch) -> Result<Catch> {
        let mut tables = self.write()?;
        let stored = tables.catches.get(&catch.id);
        if let Some(previous) = stored {
            if previous.owner_id != catch.owner_id {
                return Err(CoreError::InvalidInput(format!("catch {} cannot change owner", catch.id)));
            }
        }
        let is_new = stored.is_none();
        check_version(format!("catch:{}", catch.id), stored.map(|c| c.version), catch.version)?;
        catch.version += 1;
        if is_new {
            tables.by_owner.entry(catch.owner_id).or_default().push(catch.id);
        }
        tables.catches.insert(catch.id, catch.clone());
        Ok(catch)
    }

    async fn list_catches_by_owner(&self, owner: UserId) -> Result<Vec<Catch>> {
        let tables = self.read()?;
        let ids = tables.by_owner.get(&owner).map(Vec::as_slice).unwrap_or_default();
        Ok(ids.iter().filter_map(|id| tables.catches.get(id).cloned()).collect())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.read()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

/// The engine's only way to the store. Puts a deadline on every call and refuses
/// calls after [`StoreHandle::close`].
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn CatchStore>,
    timeout: Duration,
    max_retries: u32,
    open: Arc<AtomicBool>,
}

impl StoreHandle {
    pub fn new(inner: Arc<dyn CatchStore>, config: &EngineConfig) -> Self {
        Self {
            inner,
            timeout: config.store_timeout(),
            max_retries: config.max_write_retries,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn call<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        if !self.is_open() {
            return Err(CoreError::ShutDown);
        }
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(operation, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(CoreError::Timeout {
                    operation,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.call("get_user", self.inner.get_user(id)).await
    }

    pub async fn upsert_user(&self, user: User) -> Result<User> {
        self.call("upsert_user", self.inner.upsert_user(user)).await
    }

    pub async fn get_catch(&self, id: CatchId) -> Result<Option<Catch>> {
        self.call("get_catch", self.inner.get_catch(id)).await
    }

    pub async fn upsert_catch(&self, catch: Catch) -> Result<Catch> {
        self.call("upsert_catch", self.inner.upsert_catch(catch)).await
    }

    pub async fn list_catches_by_owner(&self, owner: UserId) -> Result<Vec<Catch>> {
        self.call("list_catches_by_owner", self.inner.list_catches_by_owner(owner)).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.call("list_users", self.inner.list_users()).await
    }

    pub async fn require_user(&self, id: UserId) -> Result<User> {
        self.get_user(id).await?.ok_or(CoreError::UnknownUser(id))
    }

    pub async fn require_catch(&self, id: CatchId) -> Result<Catch> {
        self.get_catch(id).await?.ok_or(CoreError::UnknownCatch(id))
    }

    /// Read-modify-write on a user, re-reading on `Conflict` up to the retry limit.
    /// `mutate` returns `false` when there is nothing to write.
    pub async fn update_user<F>(&self, id: UserId, mut mutate: F) -> Result<User>
    where
        F: FnMut(&mut User) -> Result<bool> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut user = self.require_user(id).await?;
            if !mutate(&mut user)? {
                return Ok(user);
            }
            match self.upsert_user(user).await {
                Err(err @ CoreError::Conflict { .. }) => {
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::trace!(user = %id, attempt, "retrying user write after conflict");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    /// Same as [`StoreHandle::update_user`], for catches.
    pub async fn update_catch<F>(&self, id: CatchId, mut mutate: F) -> Result<Catch>
    where
        F: FnMut(&mut Catch) -> Result<bool> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut catch = self.require_catch(id).await?;
            if !mutate(&mut catch)? {
                return Ok(catch);
            }
            match self.upsert_catch(catch).await {
                Err(err @ CoreError::Conflict { .. }) => {
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::trace!(catch = %id, attempt, "retrying catch write after conflict");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User::new(UserId::new(), name.to_string(), format!("{}@example.com", name), Utc::now())
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemoryStore::new();
        let first = store.upsert_user(user("finn")).await.unwrap();
        assert_eq!(first.version, 1);

        let mut fresh = first.clone();
        fresh.bio = Some("first".to_string());
        store.upsert_user(fresh).await.unwrap();

        let mut stale = first;
        stale.bio = Some("second".to_string());
        let err = store.upsert_user(stale).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { expected: 1, found: 2, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn usernames_are_unique_ignoring_case() {
        let store = MemoryStore::new();
        store.upsert_user(user("Finn")).await.unwrap();
        let err = store.upsert_user(user("finn")).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateUsername(_)));
    }

    #[tokio::test]
    async fn emails_are_unique_ignoring_case() {
        let store = MemoryStore::new();
        store.upsert_user(user("finn")).await.unwrap();
        let mut other = user("gill");
        other.email = "FINN@example.com".to_string();
        let err = store.upsert_user(other).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateEmail(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let seed = store.seed_demo(now).await.unwrap();
        assert_eq!(seed.users.len(), 3);
        assert_eq!(seed.catches.len(), 3);
        store.seed_demo(now).await.unwrap();
        assert_eq!(store.list_users().await.unwrap().len(), 3);

        store.reset().unwrap();
        assert!(store.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_handle_refuses_calls() {
        let handle = StoreHandle::new(Arc::new(MemoryStore::new()), &EngineConfig::default());
        handle.close();
        assert!(matches!(handle.list_users().await, Err(CoreError::ShutDown)));
    }
}
