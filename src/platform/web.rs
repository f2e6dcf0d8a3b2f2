//! Browser collaborators
//!
//! - `IndexedDbFactory`/`IndexedDbStore`: persistent values in one IndexedDB object store
//! - `LocalStorage`: version tag and tab announcements
//! - `StorageEvents`: the window `storage` event, fired in every other tab
//! - `WasmSpawner`: runs the tab watcher on the page's event loop

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::task::{LocalFutureObj, LocalSpawn, SpawnError};
use js_sys::{Array, JSON};
use serde_json::Value;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{
    DomException, IdbDatabase, IdbFactory, IdbObjectStore, IdbRequest, IdbTransaction,
    IdbTransactionMode, IdbVersionChangeEvent, Storage, StorageEvent, Window,
};

use super::{
    ChangeNotifier, PersistentStore, PersistentStoreFactory, Platform, ScalarStore,
    StorageChange, Subscription,
};
use crate::error::StorageError;

impl Platform {
    /// Collaborators backed by the current window
    pub fn browser() -> Result<Self, StorageError> {
        let window = web_sys::window()
            .ok_or_else(|| StorageError::new("NotSupportedError", "No window object"))?;
        Ok(Self {
            persistent: Rc::new(IndexedDbFactory),
            scalar: Rc::new(LocalStorage::new(&window)),
            notifier: Rc::new(StorageEvents { window }),
            spawner: Rc::new(WasmSpawner),
        })
    }
}

/// Convert a thrown JS value into a [`StorageError`]
pub fn js_error(value: JsValue) -> StorageError {
    if let Some(exception) = value.dyn_ref::<DomException>() {
        return StorageError::new(exception.name(), exception.message());
    }
    if let Some(error) = value.dyn_ref::<js_sys::Error>() {
        return StorageError::new(String::from(error.name()), String::from(error.message()));
    }
    StorageError::other(value.as_string().unwrap_or_else(|| format!("{:?}", value)))
}

/// Structured JS value from JSON
pub fn value_to_js(value: &Value) -> Result<JsValue, StorageError> {
    let json = serde_json::to_string(value)
        .map_err(|e| StorageError::new("DataCloneError", e.to_string()))?;
    JSON::parse(&json).map_err(js_error)
}

/// JSON from a structured JS value; `None` for `undefined`
pub fn js_to_value(value: &JsValue) -> Result<Option<Value>, StorageError> {
    if value.is_undefined() {
        return Ok(None);
    }
    let json = JSON::stringify(value)
        .map_err(js_error)?
        .as_string()
        .ok_or_else(|| StorageError::new("DataCloneError", "value is not serializable"))?;
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| StorageError::new("DataCloneError", e.to_string()))
}

// ============================================================================
// IndexedDB
// ============================================================================

/// Opens IndexedDB object stores, creating them on first use
pub struct IndexedDbFactory;

#[async_trait(?Send)]
impl PersistentStoreFactory for IndexedDbFactory {
    async fn open(
        &self,
        database: &str,
        store: &str,
    ) -> Result<Rc<dyn PersistentStore>, StorageError> {
        let window = web_sys::window()
            .ok_or_else(|| StorageError::new("NotSupportedError", "No window object"))?;
        let factory = window
            .indexed_db()
            .map_err(js_error)?
            .ok_or_else(|| StorageError::new("NotSupportedError", "IndexedDB not available"))?;

        let mut db = open_database(&factory, database, None, store).await?;
        if !db.object_store_names().contains(store) {
            // Database exists without our store; bump the version to add it
            let next = db.version() as u32 + 1;
            db.close();
            db = open_database(&factory, database, Some(next), store).await?;
        }

        log::info!("Opened IndexedDB {}/{}", database, store);
        Ok(Rc::new(IndexedDbStore {
            db,
            store: store.to_string(),
        }))
    }
}

/// One IndexedDB object store
pub struct IndexedDbStore {
    db: IdbDatabase,
    store: String,
}

impl IndexedDbStore {
    fn object_store(
        &self,
        mode: IdbTransactionMode,
    ) -> Result<(IdbTransaction, IdbObjectStore), StorageError> {
        let tx = self
            .db
            .transaction_with_str_and_mode(&self.store, mode)
            .map_err(js_error)?;
        let store = tx.object_store(&self.store).map_err(js_error)?;
        Ok((tx, store))
    }
}

#[async_trait(?Send)]
impl PersistentStore for IndexedDbStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let (_tx, store) = self.object_store(IdbTransactionMode::Readonly)?;
        let request = store.get(&JsValue::from_str(key)).map_err(js_error)?;
        let result = wait_for_request(&request).await?;
        js_to_value(&result)
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let value = value_to_js(value)?;
        let (tx, store) = self.object_store(IdbTransactionMode::Readwrite)?;
        store
            .put_with_key(&value, &JsValue::from_str(key))
            .map_err(js_error)?;
        wait_for_transaction(&tx).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let (tx, store) = self.object_store(IdbTransactionMode::Readwrite)?;
        store.delete(&JsValue::from_str(key)).map_err(js_error)?;
        wait_for_transaction(&tx).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let (_tx, store) = self.object_store(IdbTransactionMode::Readonly)?;
        let request = store.get_all_keys().map_err(js_error)?;
        let result = wait_for_request(&request).await?;
        let keys: Array = result
            .dyn_into()
            .map_err(|_| StorageError::other("getAllKeys did not return an array"))?;
        Ok(keys.iter().filter_map(|k| k.as_string()).collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let (tx, store) = self.object_store(IdbTransactionMode::Readwrite)?;
        store.clear().map_err(js_error)?;
        wait_for_transaction(&tx).await
    }
}

/// Open a database, creating `store` during the upgrade if it is missing
async fn open_database(
    factory: &IdbFactory,
    name: &str,
    version: Option<u32>,
    store: &str,
) -> Result<IdbDatabase, StorageError> {
    let request = match version {
        Some(version) => factory.open_with_u32(name, version),
        None => factory.open(name),
    }
    .map_err(js_error)?;

    let store_name = store.to_string();
    let on_upgrade = Closure::<dyn FnMut(_)>::new(move |event: IdbVersionChangeEvent| {
        let db = event
            .target()
            .and_then(|target| target.dyn_into::<IdbRequest>().ok())
            .and_then(|request| request.result().ok())
            .and_then(|result| result.dyn_into::<IdbDatabase>().ok());
        let Some(db) = db else {
            log::error!("Upgrade event without a database");
            return;
        };
        if db.object_store_names().contains(&store_name) {
            return;
        }
        match db.create_object_store(&store_name) {
            Ok(_) => log::info!("Created object store {}", store_name),
            Err(e) => log::error!("Failed to create object store {}: {:?}", store_name, e),
        }
    });
    request.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));

    let result = wait_for_request(&request).await;
    request.set_onupgradeneeded(None);
    drop(on_upgrade);

    result?
        .dyn_into::<IdbDatabase>()
        .map_err(|_| StorageError::other("open did not produce a database"))
}

/// Waits for an IDB request to complete.
async fn wait_for_request(request: &IdbRequest) -> Result<JsValue, StorageError> {
    let (tx, rx) = oneshot::channel::<Result<JsValue, StorageError>>();
    let tx = Rc::new(RefCell::new(Some(tx)));

    let tx_success = tx.clone();
    let request_success = request.clone();
    let on_success = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::Event| {
        let result = request_success.result().map_err(js_error);
        if let Some(tx) = tx_success.borrow_mut().take() {
            let _ = tx.send(result);
        }
    });

    let tx_error = tx;
    let request_error = request.clone();
    let on_error = Closure::<dyn FnMut(_)>::new(move |event: web_sys::Event| {
        // Keep the failure local to this request
        event.prevent_default();
        let error = request_error
            .error()
            .ok()
            .flatten()
            .map(|e| StorageError::new(e.name(), e.message()))
            .unwrap_or_else(|| StorageError::other("Unknown request error"));
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(error));
        }
    });

    request.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
    request.set_onerror(Some(on_error.as_ref().unchecked_ref()));

    let result = rx
        .await
        .unwrap_or_else(|_| Err(StorageError::other("Request abandoned")));

    request.set_onsuccess(None);
    request.set_onerror(None);

    result
}

/// Waits for an IDB transaction to commit.
async fn wait_for_transaction(tx: &IdbTransaction) -> Result<(), StorageError> {
    let (sender, rx) = oneshot::channel::<Result<(), StorageError>>();
    let sender = Rc::new(RefCell::new(Some(sender)));

    let tx_complete = sender.clone();
    let on_complete = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::Event| {
        if let Some(sender) = tx_complete.borrow_mut().take() {
            let _ = sender.send(Ok(()));
        }
    });

    // Errors and aborts (quota exceeded arrives as an abort) share one handler
    let tx_failed = sender;
    let transaction = tx.clone();
    let on_failed = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::Event| {
        let error = transaction
            .error()
            .map(|e| StorageError::new(e.name(), e.message()))
            .unwrap_or_else(|| StorageError::new("AbortError", "Transaction aborted"));
        if let Some(sender) = tx_failed.borrow_mut().take() {
            let _ = sender.send(Err(error));
        }
    });

    tx.set_oncomplete(Some(on_complete.as_ref().unchecked_ref()));
    tx.set_onerror(Some(on_failed.as_ref().unchecked_ref()));
    tx.set_onabort(Some(on_failed.as_ref().unchecked_ref()));

    let result = rx
        .await
        .unwrap_or_else(|_| Err(StorageError::other("Transaction abandoned")));

    tx.set_oncomplete(None);
    tx.set_onerror(None);
    tx.set_onabort(None);

    result
}

// ============================================================================
// LocalStorage + storage events
// ============================================================================

/// Window LocalStorage; every call fails when it is unavailable
pub struct LocalStorage {
    storage: Option<Storage>,
}

impl LocalStorage {
    pub fn new(window: &Window) -> Self {
        let storage = window.local_storage().ok().flatten();
        if storage.is_none() {
            log::warn!("LocalStorage unavailable");
        }
        Self { storage }
    }

    fn storage(&self) -> Result<&Storage, StorageError> {
        self.storage
            .as_ref()
            .ok_or_else(|| StorageError::new("SecurityError", "LocalStorage unavailable"))
    }
}

impl ScalarStore for LocalStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage()?.get_item(key).map_err(js_error)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage()?.set_item(key, value).map_err(js_error)
    }
}

/// Listens for the window `storage` event
pub struct StorageEvents {
    window: Window,
}

impl ChangeNotifier for StorageEvents {
    fn subscribe(&self) -> Result<Subscription, StorageError> {
        let (tx, rx) = mpsc::unbounded();
        let listener = Closure::<dyn FnMut(_)>::new(move |event: StorageEvent| {
            let _ = tx.unbounded_send(StorageChange {
                key: event.key(),
                old_value: event.old_value(),
                new_value: event.new_value(),
            });
        });
        self.window
            .add_event_listener_with_callback("storage", listener.as_ref().unchecked_ref())
            .map_err(js_error)?;

        let window = self.window.clone();
        Ok(Subscription::new(rx).with_cleanup(move || {
            let _ = window
                .remove_event_listener_with_callback("storage", listener.as_ref().unchecked_ref());
            drop(listener);
        }))
    }
}

/// Spawns onto the browser microtask queue
pub struct WasmSpawner;

impl LocalSpawn for WasmSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}
