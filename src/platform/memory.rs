//! In-memory browser profile
//!
//! One [`MemoryProfile`] stands in for a browser profile: its databases and
//! scalar store are shared by every context (tab) created from it, and a
//! scalar change made by one context is announced to all the others, the
//! way the `storage` event behaves. [`Faults`] lets callers make individual
//! operations fail.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::task::LocalSpawn;
use serde_json::Value;

use super::{
    ChangeNotifier, PersistentStore, PersistentStoreFactory, Platform, ScalarStore,
    StorageChange, Subscription,
};
use crate::error::StorageError;

/// Failure switches checked before every operation
#[derive(Debug, Default)]
pub struct Faults {
    /// Error returned by every open attempt
    pub open: RefCell<Option<StorageError>>,
    pub reads: Cell<bool>,
    pub writes: Cell<bool>,
    pub deletes: Cell<bool>,
    pub keys: Cell<bool>,
    pub clear: Cell<bool>,
    pub scalar_reads: Cell<bool>,
    pub scalar_writes: Cell<bool>,
    pub subscribe: Cell<bool>,
}

impl Faults {
    fn check(flag: &Cell<bool>, name: &str, message: &str) -> Result<(), StorageError> {
        if flag.get() {
            Err(StorageError::new(name, message))
        } else {
            Ok(())
        }
    }
}

type ObjectStoreId = (String, String);

struct Listener {
    context: u64,
    events: UnboundedSender<StorageChange>,
}

#[derive(Default)]
struct ProfileState {
    databases: RefCell<HashMap<ObjectStoreId, BTreeMap<String, Value>>>,
    scalar: RefCell<HashMap<String, String>>,
    listeners: RefCell<Vec<Listener>>,
    next_context: Cell<u64>,
    clears: Cell<usize>,
    faults: Faults,
}

/// Shared storage for a set of simulated tabs
#[derive(Clone, Default)]
pub struct MemoryProfile {
    state: Rc<ProfileState>,
}

impl MemoryProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.state.faults
    }

    /// Create collaborators for one new tab of this profile
    pub fn context(&self, spawner: Rc<dyn LocalSpawn>) -> Platform {
        let id = self.state.next_context.get();
        self.state.next_context.set(id + 1);
        let context = Rc::new(MemoryContext {
            id,
            profile: self.clone(),
        });
        Platform {
            persistent: Rc::new(MemoryFactory {
                profile: self.clone(),
            }),
            scalar: context.clone(),
            notifier: context,
            spawner,
        }
    }

    /// Current scalar value, bypassing fault injection
    pub fn scalar_value(&self, key: &str) -> Option<String> {
        self.state.scalar.borrow().get(key).cloned()
    }

    /// Persisted entries of one object store, in key order
    pub fn persisted(&self, database: &str, store: &str) -> Vec<(String, Value)> {
        self.state
            .databases
            .borrow()
            .get(&(database.to_string(), store.to_string()))
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of full clears issued against any object store
    pub fn clear_count(&self) -> usize {
        self.state.clears.get()
    }

    /// Live change subscriptions across all contexts
    pub fn subscriber_count(&self) -> usize {
        let mut listeners = self.state.listeners.borrow_mut();
        listeners.retain(|l| !l.events.is_closed());
        listeners.len()
    }

    fn set_scalar(&self, origin: u64, key: &str, value: &str) {
        let old_value = self
            .state
            .scalar
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        if old_value.as_deref() == Some(value) {
            return;
        }

        let change = StorageChange {
            key: Some(key.to_string()),
            old_value,
            new_value: Some(value.to_string()),
        };
        let mut listeners = self.state.listeners.borrow_mut();
        listeners.retain(|l| !l.events.is_closed());
        for listener in listeners.iter().filter(|l| l.context != origin) {
            let _ = listener.events.unbounded_send(change.clone());
        }
    }

    fn with_store<R>(
        &self,
        id: &ObjectStoreId,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> R,
    ) -> R {
        let mut databases = self.state.databases.borrow_mut();
        f(databases.entry(id.clone()).or_default())
    }
}

/// One tab's view of the profile's scalar store and change events
struct MemoryContext {
    id: u64,
    profile: MemoryProfile,
}

impl ScalarStore for MemoryContext {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Faults::check(
            &self.profile.faults().scalar_reads,
            "SecurityError",
            "The operation is insecure.",
        )?;
        Ok(self.profile.scalar_value(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Faults::check(
            &self.profile.faults().scalar_writes,
            "QuotaExceededError",
            "The quota has been exceeded.",
        )?;
        self.profile.set_scalar(self.id, key, value);
        Ok(())
    }
}

impl ChangeNotifier for MemoryContext {
    fn subscribe(&self) -> Result<Subscription, StorageError> {
        Faults::check(
            &self.profile.faults().subscribe,
            "SecurityError",
            "The operation is insecure.",
        )?;
        let (tx, rx) = mpsc::unbounded();
        self.profile.state.listeners.borrow_mut().push(Listener {
            context: self.id,
            events: tx,
        });
        Ok(Subscription::new(rx))
    }
}

struct MemoryFactory {
    profile: MemoryProfile,
}

#[async_trait(?Send)]
impl PersistentStoreFactory for MemoryFactory {
    async fn open(
        &self,
        database: &str,
        store: &str,
    ) -> Result<Rc<dyn PersistentStore>, StorageError> {
        if let Some(err) = self.profile.faults().open.borrow().clone() {
            return Err(err);
        }
        let id = (database.to_string(), store.to_string());
        self.profile.with_store(&id, |_| ());
        Ok(Rc::new(MemoryObjectStore {
            profile: self.profile.clone(),
            id,
        }))
    }
}

struct MemoryObjectStore {
    profile: MemoryProfile,
    id: ObjectStoreId,
}

#[async_trait(?Send)]
impl PersistentStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Faults::check(&self.profile.faults().reads, "UnknownError", "read failed")?;
        Ok(self.profile.with_store(&self.id, |s| s.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        Faults::check(
            &self.profile.faults().writes,
            "QuotaExceededError",
            "The quota has been exceeded.",
        )?;
        self.profile.with_store(&self.id, |s| {
            s.insert(key.to_string(), value.clone());
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        Faults::check(&self.profile.faults().deletes, "UnknownError", "delete failed")?;
        self.profile.with_store(&self.id, |s| {
            s.remove(key);
        });
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Faults::check(&self.profile.faults().keys, "UnknownError", "cursor failed")?;
        Ok(self.profile.with_store(&self.id, |s| s.keys().cloned().collect()))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        Faults::check(&self.profile.faults().clear, "UnknownError", "clear failed")?;
        self.profile.with_store(&self.id, |s| s.clear());
        self.profile.state.clears.set(self.profile.clear_count() + 1);
        Ok(())
    }
}
