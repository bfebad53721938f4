use async_trait::async_trait;
use spin_sdk::key_value::Store;

use crate::config::{catch_key, owner_catches_key, user_key, USERS_LIST_KEY};
use crate::core::db::{check_unique, check_version, CatchStore};
use crate::core::errors::{CoreError, Result};
use crate::models::models::{Catch, CatchId, User, UserId};

/// [`CatchStore`] on top of a Spin key-value store.
///
/// Layout: `user:{id}` and `catch:{id}` hold JSON documents, `users_list` the known user
/// ids, `owner_catches:{id}` the catch ids of one owner in creation order. The version
/// check is read-then-write, so it only holds within one component instance.
#[derive(Debug, Clone)]
pub struct SpinKvStore {
    label: String,
}

impl SpinKvStore {
    pub fn open_default() -> Self {
        Self::open("default")
    }

    pub fn open(label: &str) -> Self {
        Self { label: label.to_string() }
    }

    fn store(&self) -> Result<Store> {
        Store::open(&self.label).map_err(|e| CoreError::Storage(format!("open store {}: {:?}", self.label, e)))
    }

    fn load_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.store()?.get_json::<User>(user_key(&id))?)
    }

    fn save_user(&self, mut user: User) -> Result<User> {
        let store = self.store()?;
        let key = user_key(&user.id);
        let stored = store.get_json::<User>(&key)?;
        check_version(key.clone(), stored.as_ref().map(|u| u.version), user.version)?;

        let mut ids: Vec<UserId> = store.get_json(USERS_LIST_KEY)?.unwrap_or_default();
        let mut others = Vec::new();
        for id in &ids {
            if *id != user.id {
                if let Some(u) = store.get_json::<User>(user_key(id))? {
                    others.push(u);
                }
            }
        }
        check_unique(others.iter(), &user)?;

        user.version += 1;
        store.set_json(&key, &user)?;
        if stored.is_none() {
            ids.push(user.id);
            store.set_json(USERS_LIST_KEY, &ids)?;
        }
        Ok(user)
    }

    fn load_catch(&self, id: CatchId) -> Result<Option<Catch>> {
        Ok(self.store()?.get_json::<Catch>(catch_key(&id))?)
    }

    fn save_catch(&self, mut catch: Catch) -> Result<Catch> {
        let store = self.store()?;
        let key = catch_key(&catch.id);
        let stored = store.get_json::<Catch>(&key)?;
        if let Some(previous) = &stored {
            if previous.owner_id != catch.owner_id {
                return Err(CoreError::InvalidInput(format!("catch {} cannot change owner", catch.id)));
            }
        }
        check_version(key.clone(), stored.as_ref().map(|c| c.version), catch.version)?;

        catch.version += 1;
        store.set_json(&key, &catch)?;
        if stored.is_none() {
            let owner_key = owner_catches_key(&catch.owner_id);
            let mut ids: Vec<CatchId> = store.get_json(&owner_key)?.unwrap_or_default();
            ids.push(catch.id);
            store.set_json(&owner_key, &ids)?;
        }
        Ok(catch)
    }

    fn load_owner_catches(&self, owner: UserId) -> Result<Vec<Catch>> {
        let store = self.store()?;
        let ids: Vec<CatchId> = store.get_json(owner_catches_key(&owner))?.unwrap_or_default();
        let mut catches = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = store.get_json::<Catch>(catch_key(&id))? {
                catches.push(c);
            }
        }
        Ok(catches)
    }

    fn load_users(&self) -> Result<Vec<User>> {
        let store = self.store()?;
        let ids: Vec<UserId> = store.get_json(USERS_LIST_KEY)?.unwrap_or_default();
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(u) = store.get_json::<User>(user_key(&id))? {
                users.push(u);
            }
        }
        Ok(users)
    }
}

#[async_trait]
impl CatchStore for SpinKvStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.load_user(id)
    }

    async fn upsert_user(&self, user: User) -> Result<User> {
        self.save_user(user)
    }

    async fn get_catch(&self, id: CatchId) -> Result<Option<Catch>> {
        self.load_catch(id)
    }

    async fn upsert_catch(&self, catch: Catch) -> Result<Catch> {
        self.save_catch(catch)
    }

    async fn list_catches_by_owner(&self, owner: UserId) -> Result<Vec<Catch>> {
        self.load_owner_catches(owner)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.load_users()
    }
}
