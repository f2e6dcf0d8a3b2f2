//! Error types and disablement reasons
//!
//! Collaborator failures are carried as [`StorageError`] (shaped like a
//! browser `DOMException`). Anything fatal to persistence is reported once
//! through a [`DisabledReason`]; per-call failures surface as [`StoreError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a storage collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct StorageError {
    /// Exception name (`QuotaExceededError`, `InvalidStateError`, ...)
    pub name: String,
    /// Human readable message
    pub message: String,
}

impl StorageError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Generic failure with no browser-specific name
    pub fn other(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }
}

/// Why persistent storage was switched off for a store instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisabledReason {
    /// No persistent storage API in this context
    IndexedDbUnavailable,
    /// Persistent storage refused because the context is private/incognito
    PrivateBrowsing,
    /// The browser profile's database files are unusable
    CorruptedProfile,
    /// Opening failed for an unrecognised cause
    OpenFailed,
    VersionReadFailed,
    VersionClearFailed,
    VersionWriteFailed,
    LatestTabWriteFailed,
    LatestTabSubscribeFailed,
    /// Initialization could not be scheduled
    InitSpawnFailed,
    /// A newer tab announced itself and took over persistent writes
    NewTabOpened,
    /// Caller supplied reason for an explicit disable
    Other(String),
}

impl DisabledReason {
    /// Stable reason code
    pub fn code(&self) -> &str {
        match self {
            DisabledReason::IndexedDbUnavailable => "indexeddb_unavailable",
            DisabledReason::PrivateBrowsing => "private_browsing",
            DisabledReason::CorruptedProfile => "corrupted_profile",
            DisabledReason::OpenFailed => "open_failed",
            DisabledReason::VersionReadFailed => "version_read_failed",
            DisabledReason::VersionClearFailed => "version_clear_failed",
            DisabledReason::VersionWriteFailed => "version_write_failed",
            DisabledReason::LatestTabWriteFailed => "latest_tab_write_failed",
            DisabledReason::LatestTabSubscribeFailed => "latest_tab_subscribe_failed",
            DisabledReason::InitSpawnFailed => "init_spawn_failed",
            DisabledReason::NewTabOpened => "new_tab_opened",
            DisabledReason::Other(reason) => reason,
        }
    }

    /// Parse a reason code, keeping unknown codes as [`DisabledReason::Other`]
    pub fn from_code(code: &str) -> Self {
        match code {
            "indexeddb_unavailable" => DisabledReason::IndexedDbUnavailable,
            "private_browsing" => DisabledReason::PrivateBrowsing,
            "corrupted_profile" => DisabledReason::CorruptedProfile,
            "open_failed" => DisabledReason::OpenFailed,
            "version_read_failed" => DisabledReason::VersionReadFailed,
            "version_clear_failed" => DisabledReason::VersionClearFailed,
            "version_write_failed" => DisabledReason::VersionWriteFailed,
            "latest_tab_write_failed" => DisabledReason::LatestTabWriteFailed,
            "latest_tab_subscribe_failed" => DisabledReason::LatestTabSubscribeFailed,
            "init_spawn_failed" => DisabledReason::InitSpawnFailed,
            "new_tab_opened" => DisabledReason::NewTabOpened,
            other => DisabledReason::Other(other.to_string()),
        }
    }

    /// Map a failure to open the persistent store onto a stable reason.
    ///
    /// Firefox private windows reject IndexedDB with `InvalidStateError`
    /// ("A mutation operation was attempted on a database that did not allow
    /// mutations"); a damaged Firefox profile yields `UnknownError`
    /// ("The operation failed for reasons unrelated to the database itself").
    pub fn classify_open_failure(error: &StorageError) -> Self {
        let message = error.message.to_ascii_lowercase();
        match error.name.as_str() {
            "InvalidStateError" => DisabledReason::PrivateBrowsing,
            "UnknownError" => DisabledReason::CorruptedProfile,
            "NotSupportedError" | "NotFoundError" => DisabledReason::IndexedDbUnavailable,
            _ if message.contains("did not allow mutations") => DisabledReason::PrivateBrowsing,
            _ if message.contains("unrelated to the database") => {
                DisabledReason::CorruptedProfile
            }
            _ if message.contains("not available") || message.contains("undefined") => {
                DisabledReason::IndexedDbUnavailable
            }
            _ => DisabledReason::OpenFailed,
        }
    }
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<&str> for DisabledReason {
    fn from(code: &str) -> Self {
        Self::from_code(code)
    }
}

/// Payload handed to the disabled hook
#[derive(Debug, Clone, PartialEq)]
pub struct DisabledEvent {
    /// False when initialization itself failed
    pub was_initialized: bool,
    pub reason: DisabledReason,
    pub error: Option<StorageError>,
}

/// Configuration rejected at construction
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("Options must be an object: {0}")]
    NotAnObject(String),
}

/// Failure of a single store operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Persistent storage disabled ({0})")]
    Disabled(DisabledReason),

    #[error("Read failed: {0}")]
    Read(StorageError),

    #[error("Write failed: {0}")]
    Write(StorageError),

    #[error("Delete failed: {0}")]
    Delete(StorageError),

    #[error("Key listing failed: {0}")]
    Keys(StorageError),

    #[error("Clear failed: {0}")]
    Clear(StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
