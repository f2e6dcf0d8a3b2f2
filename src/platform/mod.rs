//! Platform abstraction layer
//!
//! The store never talks to the browser directly. It is handed:
//! - a persistent key-value driver (IndexedDB on web)
//! - a small synchronous scalar store (LocalStorage on web)
//! - a cross-tab change notifier (the window `storage` event on web)
//! - a local task spawner for the tab watcher
//!
//! `memory` provides a whole simulated browser profile for tests and
//! native hosts.

pub mod memory;
#[cfg(target_arch = "wasm32")]
pub mod web;

use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use futures::task::LocalSpawn;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::StorageError;

/// Opens handles to persistent object stores
#[async_trait(?Send)]
pub trait PersistentStoreFactory {
    async fn open(
        &self,
        database: &str,
        store: &str,
    ) -> Result<Rc<dyn PersistentStore>, StorageError>;
}

/// Asynchronous durable key-value driver bound to one object store
#[async_trait(?Send)]
pub trait PersistentStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Synchronous string store shared by every tab of a profile
pub trait ScalarStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// A scalar store change made by another execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// `None` when the whole store was cleared
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Delivers scalar store changes made by other contexts
pub trait ChangeNotifier {
    fn subscribe(&self) -> Result<Subscription, StorageError>;
}

/// Stream of [`StorageChange`]s. Dropping it unsubscribes.
pub struct Subscription {
    events: UnboundedReceiver<StorageChange>,
    on_drop: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(events: UnboundedReceiver<StorageChange>) -> Self {
        Self {
            events,
            on_drop: None,
        }
    }

    /// Run `cleanup` when the subscription goes away
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + 'static) -> Self {
        self.on_drop = Some(Box::new(cleanup));
        self
    }

    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = StorageChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.events.close();
        if let Some(cleanup) = self.on_drop.take() {
            cleanup();
        }
    }
}

/// Everything a store needs from its host
#[derive(Clone)]
pub struct Platform {
    pub persistent: Rc<dyn PersistentStoreFactory>,
    pub scalar: Rc<dyn ScalarStore>,
    pub notifier: Rc<dyn ChangeNotifier>,
    pub spawner: Rc<dyn LocalSpawn>,
}

/// Wall-clock time in milliseconds since the Unix epoch
#[cfg(target_arch = "wasm32")]
pub fn now_ms() -> f64 {
    js_sys::Date::now()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn now_ms() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}
