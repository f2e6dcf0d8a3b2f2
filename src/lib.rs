//! Keyval Fallback - a browser key-value store that keeps working
//!
//! Core modules:
//! - `store`: Fallback store (readiness, overlay routing, tab hand-off)
//! - `config`: Store options and defaults
//! - `error`: Error types and disablement reasons
//! - `platform`: Storage collaborators (IndexedDB/LocalStorage on web, in-memory elsewhere)
//! - `bindings`: JavaScript API (wasm only)

#[cfg(target_arch = "wasm32")]
pub mod bindings;
pub mod config;
pub mod error;
pub mod platform;
pub mod store;

pub use config::{DisabledHook, StoreConfig};
pub use error::{ConfigError, DisabledEvent, DisabledReason, StorageError, StoreError};
pub use platform::Platform;
pub use store::{DisabledState, FallbackStore, KeyListing, SetOptions, SetOutcome, StoreKind};

/// Default option values
pub mod defaults {
    /// Backing database name
    pub const DATABASE_NAME: &str = "keyval-store";
    /// Object store inside the database
    pub const OBJECT_STORE_NAME: &str = "keyval";
    /// Schema tag
    pub const VERSION: &str = "0.1";
    /// Scalar key holding the schema tag
    pub const VERSION_KEY: &str = "__IndexedDB_version";
    /// Scalar key holding the newest tab's announcement
    pub const LATEST_TAB_KEY: &str = "__latest_tab";
}
