//! App metadata store seam and the in-memory implementation.
//!
//! The durable store (and everything around it: users, galleries, API
//! catalog) lives outside this service; the trait below is the slice the
//! backend actually touches, and the in-memory implementation backs
//! development and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use sandpiper_proxy::{AppDirectory, AppRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Attribute '{0}' cannot be duplicated")]
    DuplicateAttribute(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub user_id: String,
    pub worktree_id: String,
    pub private: bool,
    pub start_cmd: String,
    pub env_vars: Vec<EnvVar>,
    pub created_at: u64,
    pub accessed_at: u64,
    pub running_timestamp: u64,
}

/// Fields a caller supplies when creating an app; id and name are
/// generated by the store.
#[derive(Debug, Clone, Default)]
pub struct NewApp {
    pub description: String,
    pub icon: String,
    pub user_id: String,
    pub worktree_id: String,
    pub start_cmd: String,
    pub env_vars: Vec<EnvVar>,
}

#[async_trait]
pub trait AppStore: Send + Sync {
    /// Create an app under a freshly generated unique name.
    async fn create_app(&self, template: NewApp) -> StoreResult<App>;
    async fn app(&self, id: &str) -> StoreResult<Option<App>>;
    async fn app_by_name(&self, name: &str) -> StoreResult<Option<App>>;
    async fn touch_accessed(&self, id: &str) -> StoreResult<()>;
    async fn touch_running(&self, id: &str) -> StoreResult<()>;
}

/// In-memory implementation backing development and tests.
#[derive(Default)]
pub struct MemoryAppStore {
    apps: RwLock<HashMap<String, App>>,
}

impl MemoryAppStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_named(&self, mut app: App, name: String) -> StoreResult<App> {
        let mut apps = self.apps.write();
        if apps.values().any(|existing| existing.name == name) {
            return Err(StoreError::DuplicateAttribute("name"));
        }
        app.name = name;
        apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }
}

#[async_trait]
impl AppStore for MemoryAppStore {
    async fn create_app(&self, template: NewApp) -> StoreResult<App> {
        let now = now_secs();
        let app = App {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            description: template.description,
            icon: template.icon,
            user_id: template.user_id,
            worktree_id: template.worktree_id,
            private: false,
            start_cmd: template.start_cmd,
            env_vars: template.env_vars,
            created_at: now,
            accessed_at: now,
            running_timestamp: 0,
        };

        // Generated names can collide; keep drawing until the insert
        // sticks, the same way the durable store's unique index is used.
        loop {
            match self.insert_named(app.clone(), random_name()) {
                Ok(app) => return Ok(app),
                Err(StoreError::DuplicateAttribute("name")) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn app(&self, id: &str) -> StoreResult<Option<App>> {
        Ok(self.apps.read().get(id).cloned())
    }

    async fn app_by_name(&self, name: &str) -> StoreResult<Option<App>> {
        Ok(self
            .apps
            .read()
            .values()
            .find(|app| app.name == name)
            .cloned())
    }

    async fn touch_accessed(&self, id: &str) -> StoreResult<()> {
        if let Some(app) = self.apps.write().get_mut(id) {
            app.accessed_at = now_secs();
        }
        Ok(())
    }

    async fn touch_running(&self, id: &str) -> StoreResult<()> {
        if let Some(app) = self.apps.write().get_mut(id) {
            app.running_timestamp = now_secs();
        }
        Ok(())
    }
}

/// Adapter exposing the store through the proxy's directory seam.
pub struct StoreDirectory {
    store: Arc<dyn AppStore>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn AppStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AppDirectory for StoreDirectory {
    async fn app_by_name(&self, name: &str) -> anyhow::Result<Option<AppRecord>> {
        Ok(self.store.app_by_name(name).await?.map(AppRecord::from))
    }
}

impl From<App> for AppRecord {
    fn from(app: App) -> Self {
        AppRecord {
            id: app.id,
            name: app.name,
            worktree_id: app.worktree_id,
            start_cmd: app.start_cmd,
            env: app
                .env_vars
                .into_iter()
                .map(|kv| (kv.key, kv.value))
                .collect(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "calm", "coastal", "daring", "dusky", "eager", "fleet", "gentle", "hollow",
    "keen", "lively", "mellow", "nimble", "pale", "quiet", "rapid", "sunny", "tidal", "vivid",
];

const NOUNS: &[&str] = &[
    "beach", "cliff", "cove", "current", "dune", "estuary", "gull", "harbor", "inlet", "kelp",
    "lagoon", "marsh", "pebble", "reef", "shoal", "spray", "surf", "tide", "wave", "wader",
];

/// `adjective-noun` app names, RFC 1123 label safe.
fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"sandy");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"piper");
    format!("{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> NewApp {
        NewApp {
            description: "test app".to_string(),
            worktree_id: Uuid::new_v4().to_string(),
            start_cmd: "npm start".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn created_apps_get_valid_distinct_names() {
        let store = MemoryAppStore::new();
        let a = store.create_app(template()).await.expect("create a");
        let b = store.create_app(template()).await.expect("create b");

        assert_ne!(a.id, b.id);
        assert_ne!(a.name, b.name);
        for name in [&a.name, &b.name] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '-'));
            assert!(!name.starts_with('-') && !name.ends_with('-'));
        }
    }

    #[tokio::test]
    async fn lookups_work_by_id_and_name() {
        let store = MemoryAppStore::new();
        let app = store.create_app(template()).await.expect("create");

        let by_id = store.app(&app.id).await.expect("by id").expect("found");
        assert_eq!(by_id.name, app.name);

        let by_name = store
            .app_by_name(&app.name)
            .await
            .expect("by name")
            .expect("found");
        assert_eq!(by_name.id, app.id);

        assert!(store.app("missing").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_and_retried_past() {
        let store = MemoryAppStore::new();
        let existing = store.create_app(template()).await.expect("create");

        // A direct insert under the taken name is refused...
        let clash = App {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            description: String::new(),
            icon: String::new(),
            user_id: String::new(),
            worktree_id: Uuid::new_v4().to_string(),
            private: false,
            start_cmd: String::new(),
            env_vars: vec![],
            created_at: 0,
            accessed_at: 0,
            running_timestamp: 0,
        };
        let err = store.insert_named(clash, existing.name.clone()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAttribute("name")));

        // ...while create_app keeps drawing names until one sticks, even
        // with most of the namespace taken.
        for _ in 0..50 {
            store.create_app(template()).await.expect("create more");
        }
    }

    #[tokio::test]
    async fn touch_updates_timestamps() {
        let store = MemoryAppStore::new();
        let app = store.create_app(template()).await.expect("create");
        assert_eq!(app.running_timestamp, 0);

        store.touch_running(&app.id).await.expect("touch");
        let after = store.app(&app.id).await.expect("get").expect("found");
        assert!(after.running_timestamp > 0);
    }
}
