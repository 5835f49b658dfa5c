//! Applications and the registry that resolves them.
//!
//! Credentials live outside Herald; the core only sees immutable [`App`]
//! values handed out by an [`AppRegistry`]. [`CachedAppRegistry`] puts a
//! read-through TTL cache in front of any registry.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing store could not be reached.
    #[error("App registry unavailable: {0}")]
    Unavailable(String),
}

/// An application allowed to use Herald.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub key: String,
    pub secret: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub presence_enabled: bool,
    #[serde(default)]
    pub client_messages_enabled: bool,
    /// Concurrent connections per instance, 0 for unlimited.
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Client events per connection per second, 0 for unlimited.
    #[serde(default = "default_max_client_events_per_second")]
    pub max_client_events_per_second: u32,
    #[serde(default = "default_max_presence_members")]
    pub max_presence_members: usize,
    #[serde(default = "default_max_presence_member_bytes")]
    pub max_presence_member_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_payload_bytes() -> usize {
    10 * 1024
}

fn default_max_client_events_per_second() -> u32 {
    10
}

fn default_max_presence_members() -> usize {
    100
}

fn default_max_presence_member_bytes() -> usize {
    1024
}

impl App {
    /// Create an enabled app with default limits.
    #[must_use]
    pub fn new(id: impl Into<String>, key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            secret: secret.into(),
            enabled: true,
            presence_enabled: true,
            client_messages_enabled: false,
            max_connections: 0,
            max_payload_bytes: default_max_payload_bytes(),
            max_client_events_per_second: default_max_client_events_per_second(),
            max_presence_members: default_max_presence_members(),
            max_presence_member_bytes: default_max_presence_member_bytes(),
        }
    }

    /// Allow clients to send `client-*` events.
    #[must_use]
    pub fn with_client_messages(mut self, enabled: bool) -> Self {
        self.client_messages_enabled = enabled;
        self
    }

    /// Set the concurrent connection quota.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Source of app credentials.
#[async_trait]
pub trait AppRegistry: Send + Sync {
    /// Look an app up by its id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Arc<App>>, RegistryError>;

    /// Look an app up by its public key.
    async fn find_by_key(&self, key: &str) -> Result<Option<Arc<App>>, RegistryError>;
}

/// Registry backed by a fixed list of apps, usually from configuration.
#[derive(Debug, Default)]
pub struct MemoryAppRegistry {
    by_id: DashMap<String, Arc<App>>,
    by_key: DashMap<String, Arc<App>>,
}

impl MemoryAppRegistry {
    /// Create a registry holding `apps`.
    #[must_use]
    pub fn new(apps: impl IntoIterator<Item = App>) -> Self {
        let registry = Self::default();
        for app in apps {
            registry.insert(app);
        }
        registry
    }

    /// Add or replace an app.
    pub fn insert(&self, app: App) {
        let app = Arc::new(app);
        if let Some(previous) = self.by_id.insert(app.id.clone(), Arc::clone(&app)) {
            self.by_key.remove(&previous.key);
        }
        self.by_key.insert(app.key.clone(), app);
    }

    /// Remove an app.
    pub fn remove(&self, id: &str) -> Option<Arc<App>> {
        let (_, app) = self.by_id.remove(id)?;
        self.by_key.remove(&app.key);
        Some(app)
    }

    /// Number of known apps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if no app is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl AppRegistry for MemoryAppRegistry {
    async fn find_by_id(&self, id: &str) -> Result<Option<Arc<App>>, RegistryError> {
        Ok(self.by_id.get(id).map(|a| Arc::clone(a.value())))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Arc<App>>, RegistryError> {
        Ok(self.by_key.get(key).map(|a| Arc::clone(a.value())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lookup {
    Id,
    Key,
}

/// Read-through cache in front of another registry.
///
/// Hits are served for `ttl`; misses always go to the inner registry so a
/// newly provisioned app is usable immediately.
pub struct CachedAppRegistry {
    inner: Arc<dyn AppRegistry>,
    ttl: Duration,
    cache: DashMap<(Lookup, String), (Instant, Arc<App>)>,
}

impl CachedAppRegistry {
    /// Wrap `inner` with a cache of the given TTL.
    #[must_use]
    pub fn new(inner: Arc<dyn AppRegistry>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    fn cached(&self, lookup: Lookup, value: &str) -> Option<Arc<App>> {
        let key = (lookup, value.to_string());
        let fresh = self
            .cache
            .get(&key)
            .filter(|entry| entry.0.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.1));
        if fresh.is_none() {
            self.cache.remove(&key);
        }
        fresh
    }

    fn store(&self, app: &Arc<App>) {
        let now = Instant::now();
        self.cache
            .insert((Lookup::Id, app.id.clone()), (now, Arc::clone(app)));
        self.cache
            .insert((Lookup::Key, app.key.clone()), (now, Arc::clone(app)));
    }

    async fn resolve(&self, lookup: Lookup, value: &str) -> Result<Option<Arc<App>>, RegistryError> {
        if let Some(app) = self.cached(lookup, value) {
            trace!(lookup = ?lookup, value = %value, "App cache hit");
            return Ok(Some(app));
        }

        let found = match lookup {
            Lookup::Id => self.inner.find_by_id(value).await?,
            Lookup::Key => self.inner.find_by_key(value).await?,
        };
        if let Some(app) = &found {
            debug!(app = %app.id, "App cached");
            self.store(app);
        }
        Ok(found)
    }
}

#[async_trait]
impl AppRegistry for CachedAppRegistry {
    async fn find_by_id(&self, id: &str) -> Result<Option<Arc<App>>, RegistryError> {
        self.resolve(Lookup::Id, id).await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Arc<App>>, RegistryError> {
        self.resolve(Lookup::Key, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRegistry {
        inner: MemoryAppRegistry,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AppRegistry for CountingRegistry {
        async fn find_by_id(&self, id: &str) -> Result<Option<Arc<App>>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_id(id).await
        }

        async fn find_by_key(&self, key: &str) -> Result<Option<Arc<App>>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_key(key).await
        }
    }

    #[tokio::test]
    async fn test_memory_registry_lookups() {
        let registry = MemoryAppRegistry::new([App::new("1", "key-1", "secret")]);
        assert_eq!(registry.find_by_id("1").await.unwrap().unwrap().key, "key-1");
        assert_eq!(registry.find_by_key("key-1").await.unwrap().unwrap().id, "1");
        assert!(registry.find_by_key("nope").await.unwrap().is_none());

        registry.insert(App::new("1", "key-2", "secret"));
        assert!(registry.find_by_key("key-1").await.unwrap().is_none());
        assert_eq!(registry.len(), 1);

        registry.remove("1");
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_registry_expires() {
        let counting = Arc::new(CountingRegistry {
            inner: MemoryAppRegistry::new([App::new("1", "key-1", "secret")]),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedAppRegistry::new(counting.clone(), Duration::from_secs(5));

        cached.find_by_key("key-1").await.unwrap().unwrap();
        cached.find_by_key("key-1").await.unwrap().unwrap();
        // Filled by the key lookup
        cached.find_by_id("1").await.unwrap().unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        cached.find_by_key("key-1").await.unwrap().unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_registry_misses_pass_through() {
        let counting = Arc::new(CountingRegistry {
            inner: MemoryAppRegistry::default(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedAppRegistry::new(counting.clone(), Duration::from_secs(5));

        assert!(cached.find_by_key("key-1").await.unwrap().is_none());
        counting.inner.insert(App::new("1", "key-1", "secret"));
        assert!(cached.find_by_key("key-1").await.unwrap().is_some());
    }

    #[test]
    fn test_app_defaults_from_toml_like_input() {
        let app: App = serde_json::from_str(r#"{"id":"1","key":"k","secret":"s"}"#).unwrap();
        assert!(app.enabled);
        assert!(app.presence_enabled);
        assert!(!app.client_messages_enabled);
        assert_eq!(app.max_payload_bytes, 10 * 1024);
        assert_eq!(app.max_presence_members, 100);
    }
}
