//! Fallback key-value store
//!
//! Every call first awaits one shared readiness future, then routes between
//! the in-memory overlay and the persistent store:
//! - an overlay entry always shadows the persisted value for its key
//! - writes fall back to the overlay when persistence is off or rejects them
//! - reads never fall back; persistent read errors are returned
//!
//! Initialization opens the persistent store, wipes it when the stored
//! schema version differs, and (when enabled) announces this tab so that
//! older tabs copy their data into memory and stop writing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::future::{self, FutureExt, LocalBoxFuture, Shared};
use futures::task::LocalSpawnExt;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StoreConfig;
use crate::error::{DisabledEvent, DisabledReason, Result, StorageError, StoreError};
use crate::platform::{PersistentStore, Platform, Subscription, now_ms};

/// One-shot readiness signal shared by every caller
pub type Readiness = Shared<LocalBoxFuture<'static, bool>>;

/// Where a successful write landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Persistent,
    Memory,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Persistent => "persistent",
            StoreKind::Memory => "memory",
        }
    }
}

/// Result of [`FallbackStore::set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOutcome {
    pub store: StoreKind,
}

/// Write options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    /// Keep the value in memory when it cannot be persisted
    pub use_fallback: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self { use_fallback: true }
    }
}

/// Keys known to each side; a key may appear in both
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyListing {
    pub persistent: Vec<String>,
    pub memory: Vec<String>,
}

/// Recorded cause of the switch to memory-only mode
#[derive(Debug, Clone, PartialEq)]
pub struct DisabledState {
    pub reason: DisabledReason,
    pub error: Option<StorageError>,
}

struct Inner {
    config: StoreConfig,
    platform: Platform,
    backend: RefCell<Option<Rc<dyn PersistentStore>>>,
    readiness: RefCell<Readiness>,
    overlay: RefCell<HashMap<String, Value>>,
    disabled: RefCell<Option<DisabledState>>,
}

/// Key-value store with in-memory fallback and single-writer tab hand-off.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct FallbackStore {
    inner: Rc<Inner>,
}

impl FallbackStore {
    /// Create a store and start initializing it on the platform spawner.
    /// Every caller shares that one initialization.
    pub fn new(config: StoreConfig, platform: Platform) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<Inner>| Inner {
            config,
            platform,
            backend: RefCell::new(None),
            readiness: RefCell::new(initialize(weak.clone()).boxed_local().shared()),
            overlay: RefCell::new(HashMap::new()),
            disabled: RefCell::new(None),
        });

        let readiness = inner.readiness.borrow().clone();
        if let Err(err) = inner.platform.spawner.spawn_local(readiness.map(drop)) {
            let err = StorageError::other(err.to_string());
            inner.disable(DisabledReason::InitSpawnFailed, Some(err), false);
        }
        Self { inner }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Whether persistent storage is usable
    pub async fn ready(&self) -> bool {
        self.backend().await.is_some()
    }

    /// Shared readiness future, as currently pinned
    pub fn readiness(&self) -> Readiness {
        self.inner.readiness.borrow().clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.disabled.borrow().is_some()
    }

    pub fn disabled_state(&self) -> Option<DisabledState> {
        self.inner.disabled.borrow().clone()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let backend = self.backend().await;
        if let Some(value) = self.inner.overlay.borrow().get(key) {
            return Ok(Some(value.clone()));
        }
        match backend {
            Some(backend) => backend.get(key).await.map_err(StoreError::Read),
            None => Ok(None),
        }
    }

    /// [`get`](Self::get) and deserialize
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<SetOutcome> {
        self.set_with(key, value, SetOptions::default()).await
    }

    /// Serialize and [`set`](Self::set)
    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<SetOutcome> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }

    pub async fn set_with(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: SetOptions,
    ) -> Result<SetOutcome> {
        let value = value.into();
        let backend = self.backend().await;
        self.inner.overlay.borrow_mut().remove(key);

        let Some(backend) = backend else {
            if options.use_fallback {
                self.inner.overlay.borrow_mut().insert(key.to_string(), value);
                return Ok(SetOutcome {
                    store: StoreKind::Memory,
                });
            }
            return Err(StoreError::Disabled(self.inner.disabled_reason()));
        };

        match backend.set(key, &value).await {
            Ok(()) => Ok(SetOutcome {
                store: StoreKind::Persistent,
            }),
            Err(err) if options.use_fallback => {
                log::warn!("Persisting '{}' failed, keeping it in memory: {}", key, err);
                self.inner.overlay.borrow_mut().insert(key.to_string(), value);
                Ok(SetOutcome {
                    store: StoreKind::Memory,
                })
            }
            Err(err) => Err(StoreError::Write(err)),
        }
    }

    /// Remove a key. An overlay entry is the only copy considered; the
    /// persisted value behind it is left alone.
    pub async fn del(&self, key: &str) -> Result<()> {
        let backend = self.backend().await;
        if self.inner.overlay.borrow_mut().remove(key).is_some() {
            return Ok(());
        }
        match backend {
            Some(backend) => backend.delete(key).await.map_err(StoreError::Delete),
            None => Ok(()),
        }
    }

    pub async fn keys(&self) -> Result<KeyListing> {
        let backend = self.backend().await;
        let persistent = match backend {
            Some(backend) => backend.keys().await.map_err(StoreError::Keys)?,
            None => Vec::new(),
        };
        let mut memory: Vec<String> = self.inner.overlay.borrow().keys().cloned().collect();
        memory.sort();
        Ok(KeyListing { persistent, memory })
    }

    /// Drop every overlay entry and, when persistence is on, every
    /// persisted entry.
    pub async fn clear(&self) -> Result<()> {
        let backend = self.backend().await;
        self.inner.overlay.borrow_mut().clear();
        match backend {
            Some(backend) => backend.clear().await.map_err(StoreError::Clear),
            None => Ok(()),
        }
    }

    /// Switch to memory-only mode for the rest of this store's life.
    ///
    /// Repeated calls re-pin the state and re-run the disabled hook.
    pub fn disable(&self, reason: impl Into<DisabledReason>, error: Option<StorageError>) {
        self.inner.disable(reason.into(), error, true);
    }

    /// Persistent store to use for this call, if any
    async fn backend(&self) -> Option<Rc<dyn PersistentStore>> {
        let readiness = self.inner.readiness.borrow().clone();
        if !readiness.await || self.is_disabled() {
            return None;
        }
        self.inner.backend.borrow().clone()
    }
}

impl Inner {
    fn is_disabled(&self) -> bool {
        self.disabled.borrow().is_some()
    }

    fn disabled_reason(&self) -> DisabledReason {
        self.disabled
            .borrow()
            .as_ref()
            .map(|state| state.reason.clone())
            .unwrap_or(DisabledReason::OpenFailed)
    }

    fn disable(&self, reason: DisabledReason, error: Option<StorageError>, was_initialized: bool) {
        log::info!(
            "Persistent storage for {}/{} disabled: {}",
            self.config.database_name,
            self.config.object_store_name,
            reason
        );
        *self.disabled.borrow_mut() = Some(DisabledState {
            reason: reason.clone(),
            error: error.clone(),
        });
        if was_initialized {
            *self.readiness.borrow_mut() = future::ready(false).boxed_local().shared();
        }

        let event = DisabledEvent {
            was_initialized,
            reason,
            error,
        };
        match &self.config.on_disabled {
            Some(hook) => hook(&event),
            None => log::error!(
                "Falling back to in-memory storage (initialized: {}, reason: {}, error: {:?})",
                event.was_initialized,
                event.reason,
                event.error
            ),
        }
    }

    /// Open the persistent store and enforce the schema version
    async fn open_versioned(&self) -> bool {
        let config = &self.config;
        let backend = match self
            .platform
            .persistent
            .open(&config.database_name, &config.object_store_name)
            .await
        {
            Ok(backend) => backend,
            Err(_) if self.is_disabled() => return false,
            Err(err) => {
                let reason = DisabledReason::classify_open_failure(&err);
                self.disable(reason, Some(err), false);
                return false;
            }
        };
        if self.is_disabled() {
            log::debug!("Disabled while opening, skipping the version check");
            return false;
        }

        let stored = match self.platform.scalar.get(&config.version_key) {
            Ok(stored) => stored,
            Err(err) => {
                self.disable(DisabledReason::VersionReadFailed, Some(err), false);
                return false;
            }
        };

        if stored.as_deref() != Some(config.version.as_str()) {
            log::info!(
                "Schema version {:?} does not match {:?}, wiping {}/{}",
                stored,
                config.version,
                config.database_name,
                config.object_store_name
            );
            if let Err(err) = backend.clear().await {
                self.disable(DisabledReason::VersionClearFailed, Some(err), false);
                return false;
            }
            if self.is_disabled() {
                log::debug!("Disabled while wiping, leaving the version tag alone");
                return false;
            }
            if let Err(err) = self.platform.scalar.set(&config.version_key, &config.version) {
                self.disable(DisabledReason::VersionWriteFailed, Some(err), false);
                return false;
            }
        }

        *self.backend.borrow_mut() = Some(backend);
        true
    }

    /// Copy every persisted entry into the overlay. Existing overlay
    /// entries win. Returns the first failure, if any.
    async fn drain(&self) -> Option<StorageError> {
        let backend = self.backend.borrow().clone()?;
        let keys = match backend.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("Could not list keys while handing off: {}", err);
                return Some(err);
            }
        };

        let mut snapshot = HashMap::with_capacity(keys.len());
        let mut first_error = None;
        for key in keys {
            match backend.get(&key).await {
                Ok(Some(value)) => {
                    snapshot.insert(key, value);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Could not copy '{}' while handing off: {}", key, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        if self.is_disabled() {
            // The caller already switched to memory; its overlay stands
            return first_error;
        }
        let mut overlay = self.overlay.borrow_mut();
        snapshot.extend(overlay.drain());
        log::info!("Copied {} entries into memory", snapshot.len());
        *overlay = snapshot;
        first_error
    }
}

async fn initialize(weak: Weak<Inner>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    if inner.is_disabled() || !inner.open_versioned().await || inner.is_disabled() {
        return false;
    }
    if inner.config.disable_on_new_tab_open && !announce_tab(&inner) {
        return false;
    }
    log::info!(
        "Persistent storage ready ({}/{} v{})",
        inner.config.database_name,
        inner.config.object_store_name,
        inner.config.version
    );
    true
}

/// Claim the newest-tab slot and start watching for a newer claim
fn announce_tab(inner: &Rc<Inner>) -> bool {
    let key = inner.config.latest_tab_key.clone();
    let announcement = format!("{}-{:016x}", now_ms() as u64, rand::random::<u64>());
    if let Err(err) = inner.platform.scalar.set(&key, &announcement) {
        inner.disable(DisabledReason::LatestTabWriteFailed, Some(err), true);
        return false;
    }

    let subscription = match inner.platform.notifier.subscribe() {
        Ok(subscription) => subscription,
        Err(err) => {
            inner.disable(DisabledReason::LatestTabSubscribeFailed, Some(err), true);
            return false;
        }
    };

    let watcher = watch_for_newer_tab(Rc::downgrade(inner), subscription, key);
    if let Err(err) = inner.platform.spawner.spawn_local(watcher) {
        let err = StorageError::other(err.to_string());
        inner.disable(DisabledReason::LatestTabSubscribeFailed, Some(err), true);
        return false;
    }
    log::debug!("Announced tab {}", announcement);
    true
}

/// Wait for another tab to claim the newest-tab slot, then copy persisted
/// data into memory and give up persistent access. Runs at most once.
async fn watch_for_newer_tab(weak: Weak<Inner>, mut subscription: Subscription, key: String) {
    let change = loop {
        match subscription.next().await {
            Some(change) if change.key.as_deref() == Some(key.as_str()) => break change,
            Some(_) => continue,
            None => return,
        }
    };
    subscription.unsubscribe();

    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.is_disabled() {
        log::debug!("Newer tab announced after persistence was already off");
        return;
    }
    log::info!("Newer tab announced ({:?}), handing off", change.new_value);
    let error = inner.drain().await;
    if inner.is_disabled() {
        log::debug!("Persistence was switched off during the hand-off");
        return;
    }
    inner.disable(DisabledReason::NewTabOpened, error, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PersistentStoreFactory;
    use crate::platform::memory::MemoryProfile;
    use async_trait::async_trait;
    use futures::channel::oneshot;
    use futures::executor::{LocalPool, block_on};
    use futures::future::join_all;
    use futures::task::LocalSpawn;
    use proptest::prelude::*;
    use serde_json::json;

    type Events = Rc<RefCell<Vec<DisabledEvent>>>;
    type Outcome<T> = std::result::Result<T, StorageError>;

    fn open_on(platform: Platform, config: StoreConfig) -> (FallbackStore, Events) {
        let events: Events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let config = config.with_on_disabled(move |event| sink.borrow_mut().push(event.clone()));
        (FallbackStore::new(config, platform), events)
    }

    fn open_store(
        pool: &LocalPool,
        profile: &MemoryProfile,
        config: StoreConfig,
    ) -> (FallbackStore, Events) {
        open_on(profile.context(Rc::new(pool.spawner())), config)
    }

    fn solo() -> StoreConfig {
        StoreConfig::default().with_disable_on_new_tab_open(false)
    }

    /// Holds the next caller until the paired sender fires
    #[derive(Clone, Default)]
    struct Gate(Rc<RefCell<Option<oneshot::Receiver<()>>>>);

    impl Gate {
        fn close(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.0.borrow_mut() = Some(rx);
            tx
        }

        async fn pass(&self) {
            let waiting = self.0.borrow_mut().take();
            if let Some(rx) = waiting {
                let _ = rx.await;
            }
        }
    }

    struct GatedFactory {
        inner: Rc<dyn PersistentStoreFactory>,
        open: Gate,
        keys: Gate,
    }

    #[async_trait(?Send)]
    impl PersistentStoreFactory for GatedFactory {
        async fn open(&self, database: &str, store: &str) -> Outcome<Rc<dyn PersistentStore>> {
            self.open.pass().await;
            let inner = self.inner.open(database, store).await?;
            Ok(Rc::new(GatedStore {
                inner,
                keys: self.keys.clone(),
            }))
        }
    }

    struct GatedStore {
        inner: Rc<dyn PersistentStore>,
        keys: Gate,
    }

    #[async_trait(?Send)]
    impl PersistentStore for GatedStore {
        async fn get(&self, key: &str) -> Outcome<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &Value) -> Outcome<()> {
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Outcome<()> {
            self.inner.delete(key).await
        }

        async fn keys(&self) -> Outcome<Vec<String>> {
            self.keys.pass().await;
            self.inner.keys().await
        }

        async fn clear(&self) -> Outcome<()> {
            self.inner.clear().await
        }
    }

    /// Tab whose persistent open and key listing can be held open
    fn gated_context(pool: &LocalPool, profile: &MemoryProfile) -> (Platform, Gate, Gate) {
        let mut platform = profile.context(Rc::new(pool.spawner()));
        let (open, keys) = (Gate::default(), Gate::default());
        platform.persistent = Rc::new(GatedFactory {
            inner: platform.persistent.clone(),
            open: open.clone(),
            keys: keys.clone(),
        });
        (platform, open, keys)
    }

    #[test]
    fn test_set_get_round_trip_persistent() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, events) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            assert!(store.ready().await);
            let outcome = store.set("a", json!({"n": 1})).await.unwrap();
            assert_eq!(outcome.store, StoreKind::Persistent);
            assert_eq!(store.get("a").await.unwrap(), Some(json!({"n": 1})));
            assert_eq!(store.get("missing").await.unwrap(), None);
        });
        assert_eq!(
            profile.persisted("keyval-store", "keyval"),
            vec![("a".to_string(), json!({"n": 1}))]
        );
        assert_eq!(profile.scalar_value("__IndexedDB_version").as_deref(), Some("0.1"));
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_stored_null_is_present() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("nothing", Value::Null).await.unwrap();
            assert_eq!(store.get("nothing").await.unwrap(), Some(Value::Null));
            store.disable("test", None);
            store.set("nothing", Value::Null).await.unwrap();
            assert_eq!(store.get("nothing").await.unwrap(), Some(Value::Null));
        });
    }

    #[test]
    fn test_del_after_set() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("k", 1).await.unwrap();
            store.del("k").await.unwrap();
            assert_eq!(store.get("k").await.unwrap(), None);
            // Deleting an absent key is fine
            store.del("k").await.unwrap();
        });
        assert!(profile.persisted("keyval-store", "keyval").is_empty());
    }

    #[test]
    fn test_failed_write_falls_back_and_shadows() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, events) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("k", "old").await.unwrap();

            profile.faults().writes.set(true);
            let outcome = store.set("k", "new").await.unwrap();
            assert_eq!(outcome.store, StoreKind::Memory);
            assert_eq!(store.get("k").await.unwrap(), Some(json!("new")));

            let keys = store.keys().await.unwrap();
            assert_eq!(keys.persistent, vec!["k".to_string()]);
            assert_eq!(keys.memory, vec!["k".to_string()]);

            // A successful write drops the stale overlay entry
            profile.faults().writes.set(false);
            assert_eq!(store.set("k", "newest").await.unwrap().store, StoreKind::Persistent);
            assert!(store.keys().await.unwrap().memory.is_empty());
            assert_eq!(store.get("k").await.unwrap(), Some(json!("newest")));
        });
        // Write failures alone never disable persistence
        assert!(events.borrow().is_empty());
        assert!(!store.is_disabled());
    }

    #[test]
    fn test_failed_write_without_fallback_rejects() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());
        let strict = SetOptions {
            use_fallback: false,
        };

        pool.run_until(async {
            store.set("k", 1).await.unwrap();
            profile.faults().writes.set(true);
            let err = store.set_with("k", 2, strict).await.unwrap_err();
            assert!(matches!(err, StoreError::Write(ref e) if e.name == "QuotaExceededError"));
            assert!(store.keys().await.unwrap().memory.is_empty());
            assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        });
    }

    #[test]
    fn test_del_of_overlay_entry_leaves_persisted_value() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("k", 1).await.unwrap();
            profile.faults().writes.set(true);
            store.set("k", 2).await.unwrap();
            store.del("k").await.unwrap();
            assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        });
    }

    #[test]
    fn test_read_failure_surfaces() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            profile.faults().writes.set(true);
            store.set("shadowed", 1).await.unwrap();
            profile.faults().reads.set(true);

            assert!(matches!(store.get("other").await, Err(StoreError::Read(_))));
            assert_eq!(store.get("shadowed").await.unwrap(), Some(json!(1)));
        });
    }

    #[test]
    fn test_version_change_wipes_persisted_data() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (first, _) = open_store(&pool, &profile, solo().with_version("0.1"));
        pool.run_until(async {
            first.set("a", 1).await.unwrap();
            first.set("b", 2).await.unwrap();
            assert_eq!(first.keys().await.unwrap().persistent, vec!["a", "b"]);
        });

        let (second, _) = open_store(&pool, &profile, solo().with_version("0.2"));
        pool.run_until(async {
            assert!(second.keys().await.unwrap().persistent.is_empty());
        });

        let (third, _) = open_store(&pool, &profile, solo().with_version("0.1"));
        pool.run_until(async {
            assert!(third.keys().await.unwrap().persistent.is_empty());
        });
        assert_eq!(profile.clear_count(), 3);
        assert_eq!(profile.scalar_value("__IndexedDB_version").as_deref(), Some("0.1"));
    }

    #[test]
    fn test_matching_version_keeps_data() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (first, _) = open_store(&pool, &profile, solo());
        pool.run_until(first.set("a", 1)).unwrap();

        let (second, _) = open_store(&pool, &profile, solo());
        pool.run_until(async {
            assert_eq!(second.get("a").await.unwrap(), Some(json!(1)));
        });
        assert_eq!(profile.clear_count(), 1);
    }

    #[test]
    fn test_concurrent_calls_share_one_initialization() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, StoreConfig::default());

        let outcomes = pool.run_until(join_all(
            (0..8).map(|i| {
                let store = store.clone();
                async move { store.set(&format!("k{i}"), i).await }
            }),
        ));
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().store, StoreKind::Persistent);
        }
        assert_eq!(profile.clear_count(), 1);
        assert_eq!(profile.persisted("keyval-store", "keyval").len(), 8);
        // Only one tab announcement, so only one live subscription
        assert_eq!(profile.subscriber_count(), 1);
    }

    #[test]
    fn test_explicit_disable_routes_to_memory() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, events) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("persisted", 1).await.unwrap();
            store.disable("user_logout", None);
            assert!(!store.ready().await);

            // Adapter failures no longer matter
            profile.faults().writes.set(true);
            let outcome = store.set("k", 2).await.unwrap();
            assert_eq!(outcome.store, StoreKind::Memory);
            assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
            assert_eq!(store.get("persisted").await.unwrap(), None);

            let keys = store.keys().await.unwrap();
            assert!(keys.persistent.is_empty());
            assert_eq!(keys.memory, vec!["k".to_string()]);

            let strict = SetOptions {
                use_fallback: false,
            };
            let err = store.set_with("x", 3, strict).await.unwrap_err();
            assert_eq!(
                err,
                StoreError::Disabled(DisabledReason::Other("user_logout".to_string()))
            );
        });

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert!(events[0].was_initialized);
        assert_eq!(events[0].reason.code(), "user_logout");
        // Persisted data is left untouched
        assert_eq!(profile.persisted("keyval-store", "keyval").len(), 1);
    }

    #[test]
    fn test_repeated_disable_reinvokes_hook() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, events) = open_store(&pool, &profile, solo());

        pool.run_until(store.ready());
        store.disable("first", None);
        store.disable("second", Some(StorageError::other("boom")));
        assert_eq!(events.borrow().len(), 2);
        let state = store.disabled_state().unwrap();
        assert_eq!(state.reason.code(), "second");
        assert_eq!(state.error, Some(StorageError::other("boom")));
    }

    #[test]
    fn test_open_failure_is_classified() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        *profile.faults().open.borrow_mut() = Some(StorageError::new(
            "InvalidStateError",
            "A mutation operation was attempted on a database that did not allow mutations.",
        ));
        let (store, events) = open_store(&pool, &profile, StoreConfig::default());

        pool.run_until(async {
            assert!(!store.ready().await);
            assert_eq!(store.set("k", 1).await.unwrap().store, StoreKind::Memory);
            assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
            store.clear().await.unwrap();
            assert_eq!(store.get("k").await.unwrap(), None);
        });

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert!(!events[0].was_initialized);
        assert_eq!(events[0].reason, DisabledReason::PrivateBrowsing);
        assert_eq!(
            events[0].error.as_ref().map(|e| e.name.as_str()),
            Some("InvalidStateError")
        );
        // No announcement from a tab that never reached persistent storage
        assert_eq!(profile.scalar_value("__latest_tab"), None);
    }

    #[test]
    fn test_version_check_failures() {
        let cases = [
            ("scalar_reads", DisabledReason::VersionReadFailed),
            ("clear", DisabledReason::VersionClearFailed),
            ("scalar_writes", DisabledReason::VersionWriteFailed),
        ];
        for (fault, expected) in cases {
            let mut pool = LocalPool::new();
            let profile = MemoryProfile::new();
            match fault {
                "scalar_reads" => profile.faults().scalar_reads.set(true),
                "clear" => profile.faults().clear.set(true),
                _ => profile.faults().scalar_writes.set(true),
            }
            let (store, events) = open_store(&pool, &profile, StoreConfig::default());

            assert!(!pool.run_until(store.ready()));
            let events = events.borrow();
            assert_eq!(events.len(), 1, "{fault}");
            assert_eq!(events[0].reason, expected);
            assert!(!events[0].was_initialized);
            assert_eq!(store.disabled_state().unwrap().reason, expected);
        }
    }

    #[test]
    fn test_announcement_failure_disables() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        // Record the version first so only the announcement write fails
        let (setup, _) = open_store(&pool, &profile, solo());
        assert!(pool.run_until(setup.ready()));

        profile.faults().scalar_writes.set(true);
        let (store, events) = open_store(&pool, &profile, StoreConfig::default());
        assert!(!pool.run_until(store.ready()));

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert!(events[0].was_initialized);
        assert_eq!(events[0].reason, DisabledReason::LatestTabWriteFailed);
        assert_eq!(profile.subscriber_count(), 0);
    }

    #[test]
    fn test_newer_tab_demotes_older_tab() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, events_a) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_a.set("x", 10)).unwrap();
        assert!(profile.scalar_value("__latest_tab").is_some());

        let (tab_b, events_b) = open_store(&pool, &profile, StoreConfig::default());
        assert!(pool.run_until(tab_b.ready()));
        pool.run_until_stalled();

        pool.run_until(async {
            assert_eq!(tab_a.get("x").await.unwrap(), Some(json!(10)));
            let keys = tab_a.keys().await.unwrap();
            assert!(keys.persistent.is_empty());
            assert_eq!(keys.memory, vec!["x".to_string()]);

            // The older tab no longer writes through
            tab_a.set("y", 1).await.unwrap();
            assert_eq!(tab_b.get("y").await.unwrap(), None);
            assert_eq!(tab_b.get("x").await.unwrap(), Some(json!(10)));
        });

        let events = events_a.borrow();
        assert_eq!(events.len(), 1);
        assert!(events[0].was_initialized);
        assert_eq!(events[0].reason, DisabledReason::NewTabOpened);
        assert_eq!(events[0].error, None);
        assert!(events_b.borrow().is_empty());
        // A unsubscribed on hand-off, B is still listening
        assert_eq!(profile.subscriber_count(), 1);
    }

    #[test]
    fn test_hand_off_keeps_overlay_entries_authoritative() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, _) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(async {
            tab_a.set("k", "persisted").await.unwrap();
            profile.faults().writes.set(true);
            tab_a.set("k", "memory").await.unwrap();
            profile.faults().writes.set(false);
        });

        let (tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_b.ready());
        pool.run_until_stalled();

        assert!(tab_a.is_disabled());
        assert_eq!(pool.run_until(tab_a.get("k")).unwrap(), Some(json!("memory")));
    }

    #[test]
    fn test_hand_off_is_best_effort_on_read_failure() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, events_a) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_a.set("x", 1)).unwrap();

        profile.faults().reads.set(true);
        let (tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_b.ready());
        pool.run_until_stalled();

        let events = events_a.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DisabledReason::NewTabOpened);
        assert!(events[0].error.is_some());
        assert!(tab_a.is_disabled());
        assert_eq!(pool.run_until(tab_a.get("x")).unwrap(), None);
    }

    #[test]
    fn test_unrelated_changes_are_ignored() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, events) = open_store(&pool, &profile, StoreConfig::default());
        assert!(pool.run_until(tab_a.ready()));

        let other = profile.context(Rc::new(pool.spawner()));
        other.scalar.set("some_other_key", "1").unwrap();
        pool.run_until_stalled();

        assert!(!tab_a.is_disabled());
        assert!(events.borrow().is_empty());
        assert_eq!(profile.subscriber_count(), 1);
    }

    #[test]
    fn test_coordination_can_be_turned_off() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, _) = open_store(&pool, &profile, solo());
        assert!(pool.run_until(tab_a.ready()));
        let (tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        assert!(pool.run_until(tab_b.ready()));
        pool.run_until_stalled();

        assert!(!tab_a.is_disabled());
        assert!(pool.run_until(tab_a.ready()));
    }

    #[test]
    fn test_hand_off_after_explicit_disable_is_skipped() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, events) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_a.set("x", 1)).unwrap();
        tab_a.disable("manual", None);

        let (tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_b.ready());
        pool.run_until_stalled();

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason.code(), "manual");
        assert_eq!(pool.run_until(tab_a.get("x")).unwrap(), None);
    }

    #[test]
    fn test_clear_resets_both_sides() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("p", 1).await.unwrap();
            profile.faults().writes.set(true);
            store.set("m", 2).await.unwrap();
            store.clear().await.unwrap();
            assert_eq!(store.keys().await.unwrap(), KeyListing::default());
        });
    }

    #[test]
    fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Prefs {
            theme: String,
            volume: f32,
        }

        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, _) = open_store(&pool, &profile, solo());
        let prefs = Prefs {
            theme: "dark".to_string(),
            volume: 0.5,
        };

        pool.run_until(async {
            store.set_as("prefs", &prefs).await.unwrap();
            assert_eq!(
                store.get_as::<Prefs>("prefs").await.unwrap().as_ref(),
                Some(&prefs)
            );
            assert_eq!(store.get_as::<Prefs>("missing").await.unwrap(), None);

            store.set("bad", "not prefs").await.unwrap();
            assert!(matches!(
                store.get_as::<Prefs>("bad").await,
                Err(StoreError::Serialization(_))
            ));
        });
    }

    #[test]
    fn test_construction_alone_starts_initialization() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, events_a) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(tab_a.set("x", 10)).unwrap();

        // The newer tab is never called into
        let (_tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until_stalled();

        assert!(tab_a.is_disabled());
        assert_eq!(pool.run_until(tab_a.get("x")).unwrap(), Some(json!(10)));
        let events = events_a.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DisabledReason::NewTabOpened);
    }

    #[test]
    fn test_refused_spawn_disables_up_front() {
        let profile = MemoryProfile::new();
        // A spawner whose pool is gone refuses new tasks
        let closed: Rc<dyn LocalSpawn> = Rc::new(LocalPool::new().spawner());
        let (store, events) = open_on(profile.context(closed), StoreConfig::default());

        assert_eq!(
            store.disabled_state().map(|state| state.reason),
            Some(DisabledReason::InitSpawnFailed)
        );
        assert!(!block_on(store.ready()));
        assert_eq!(block_on(store.set("k", 1)).unwrap().store, StoreKind::Memory);

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert!(!events[0].was_initialized);
        assert_eq!(profile.clear_count(), 0);
        assert_eq!(profile.scalar_value("__IndexedDB_version"), None);
    }

    #[test]
    fn test_disable_while_opening_stops_initialization() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (seed, _) = open_store(&pool, &profile, solo().with_version("0.0"));
        pool.run_until(seed.set("keep", 1)).unwrap();
        let clears = profile.clear_count();

        let (platform, open, _) = gated_context(&pool, &profile);
        let release = open.close();
        let (store, events) = open_on(platform, StoreConfig::default().with_version("0.1"));
        pool.run_until_stalled();

        store.disable("manual", None);
        release.send(()).unwrap();
        pool.run_until_stalled();

        // No wipe, no new version tag, no announcement
        assert_eq!(profile.clear_count(), clears);
        assert_eq!(
            profile.persisted("keyval-store", "keyval"),
            vec![("keep".to_string(), json!(1))]
        );
        assert_eq!(profile.scalar_value("__IndexedDB_version").as_deref(), Some("0.0"));
        assert_eq!(profile.scalar_value("__latest_tab"), None);
        assert_eq!(profile.subscriber_count(), 0);
        assert!(!pool.run_until(store.ready()));

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason.code(), "manual");
    }

    #[test]
    fn test_disable_during_hand_off_keeps_explicit_reason() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (platform, _, keys) = gated_context(&pool, &profile);
        let (tab_a, events) = open_on(platform, StoreConfig::default());
        pool.run_until(tab_a.set("x", 1)).unwrap();

        // Hold the hand-off inside its key listing
        let release = keys.close();
        let (tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        assert!(pool.run_until(tab_b.ready()));
        pool.run_until_stalled();
        assert!(!tab_a.is_disabled());

        tab_a.disable("manual", None);
        release.send(()).unwrap();
        pool.run_until_stalled();

        assert_eq!(tab_a.disabled_state().unwrap().reason.code(), "manual");
        assert_eq!(pool.run_until(tab_a.get("x")).unwrap(), None);
        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason.code(), "manual");
    }

    #[test]
    fn test_delete_and_key_listing_failures_surface() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let (store, events) = open_store(&pool, &profile, solo());

        pool.run_until(async {
            store.set("k", 1).await.unwrap();

            profile.faults().deletes.set(true);
            assert!(matches!(
                store.del("k").await,
                Err(StoreError::Delete(ref e)) if e.message == "delete failed"
            ));
            assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));

            profile.faults().keys.set(true);
            assert!(matches!(store.keys().await, Err(StoreError::Keys(_))));
        });
        assert!(events.borrow().is_empty());
        assert!(!store.is_disabled());
    }

    #[test]
    fn test_hand_off_survives_key_listing_failure() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();

        let (tab_a, events_a) = open_store(&pool, &profile, StoreConfig::default());
        pool.run_until(async {
            tab_a.set("x", 1).await.unwrap();
            profile.faults().writes.set(true);
            tab_a.set("y", 2).await.unwrap();
            profile.faults().writes.set(false);
        });

        profile.faults().keys.set(true);
        let (tab_b, _) = open_store(&pool, &profile, StoreConfig::default());
        assert!(pool.run_until(tab_b.ready()));
        pool.run_until_stalled();

        assert!(tab_a.is_disabled());
        pool.run_until(async {
            assert_eq!(tab_a.get("y").await.unwrap(), Some(json!(2)));
            assert_eq!(tab_a.get("x").await.unwrap(), None);
        });
        let events = events_a.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DisabledReason::NewTabOpened);
        assert_eq!(
            events[0].error.as_ref().map(|e| e.message.as_str()),
            Some("cursor failed")
        );
    }

    #[test]
    fn test_subscription_failure_disables() {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        profile.faults().subscribe.set(true);

        let (store, events) = open_store(&pool, &profile, StoreConfig::default());
        assert!(!pool.run_until(store.ready()));

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert!(events[0].was_initialized);
        assert_eq!(events[0].reason, DisabledReason::LatestTabSubscribeFailed);
        assert_eq!(profile.subscriber_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_set_then_get_round_trips(
            entries in prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 1..16),
            disabled in any::<bool>(),
            failing_writes in any::<bool>(),
        ) {
            let mut pool = LocalPool::new();
            let profile = MemoryProfile::new();
            let (store, _) = open_store(&pool, &profile, solo());
            if disabled {
                store.disable("prop", None);
            }
            profile.faults().writes.set(failing_writes);

            let mut expected = HashMap::new();
            for (key, value) in &entries {
                pool.run_until(store.set(key, *value)).unwrap();
                expected.insert(key.clone(), *value);
            }
            for (key, value) in &expected {
                let got = pool.run_until(store.get(key)).unwrap();
                prop_assert_eq!(got, Some(json!(*value)));
            }
        }
    }
}
