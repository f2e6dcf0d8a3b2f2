//! Store configuration
//!
//! Options arrive either from Rust (builder methods) or as a JSON options
//! object from JavaScript. Every option is optional; a value of the wrong
//! kind is rejected before any storage is touched.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::defaults;
use crate::error::{ConfigError, DisabledEvent};

/// Hook invoked whenever a store drops to memory-only mode
pub type DisabledHook = Rc<dyn Fn(&DisabledEvent)>;

/// Expected JSON kind of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKind {
    String,
    Bool,
}

impl OptionKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            OptionKind::String => value.is_string(),
            OptionKind::Bool => value.is_boolean(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            OptionKind::String => "a string",
            OptionKind::Bool => "a boolean",
        }
    }
}

/// Recognised option names and their kinds
const OPTIONS: &[(&str, OptionKind)] = &[
    ("databaseName", OptionKind::String),
    ("objectStoreName", OptionKind::String),
    ("version", OptionKind::String),
    ("versionKey", OptionKind::String),
    ("disableOnNewTabOpen", OptionKind::Bool),
    ("latestTabKey", OptionKind::String),
];

/// Configuration for a [`FallbackStore`](crate::FallbackStore)
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Backing database name
    pub database_name: String,
    /// Object store inside the database
    pub object_store_name: String,
    /// Schema tag; changing it wipes persisted data
    pub version: String,
    /// Bookkeeping key holding the schema tag
    pub version_key: String,
    /// Demote this store when a newer tab announces itself
    pub disable_on_new_tab_open: bool,
    /// Bookkeeping key used for tab announcements
    pub latest_tab_key: String,
    /// Disablement hook (logs at error level when unset)
    #[serde(skip)]
    pub on_disabled: Option<DisabledHook>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_name: defaults::DATABASE_NAME.to_string(),
            object_store_name: defaults::OBJECT_STORE_NAME.to_string(),
            version: defaults::VERSION.to_string(),
            version_key: defaults::VERSION_KEY.to_string(),
            disable_on_new_tab_open: true,
            latest_tab_key: defaults::LATEST_TAB_KEY.to_string(),
            on_disabled: None,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_name", &self.database_name)
            .field("object_store_name", &self.object_store_name)
            .field("version", &self.version)
            .field("version_key", &self.version_key)
            .field("disable_on_new_tab_open", &self.disable_on_new_tab_open)
            .field("latest_tab_key", &self.latest_tab_key)
            .field("on_disabled", &self.on_disabled.is_some())
            .finish()
    }
}

impl StoreConfig {
    /// Parse a JSON options object
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| ConfigError::NotAnObject(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build from an options object, checking every known option's kind.
    ///
    /// `null` counts as absent. Unknown options are ignored.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let options = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(ConfigError::NotAnObject(kind_name(&other).to_string())),
        };

        let mut known = Map::new();
        for (name, kind) in OPTIONS {
            match options.get(*name) {
                None | Some(Value::Null) => {}
                Some(value) if kind.matches(value) => {
                    known.insert(name.to_string(), value.clone());
                }
                Some(value) => {
                    return Err(ConfigError::InvalidOption {
                        option: name.to_string(),
                        message: format!("expected {}, got {}", kind.as_str(), kind_name(value)),
                    });
                }
            }
        }

        serde_json::from_value(Value::Object(known)).map_err(|e| ConfigError::InvalidOption {
            option: "options".to_string(),
            message: e.to_string(),
        })
    }

    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    pub fn with_object_store_name(mut self, name: impl Into<String>) -> Self {
        self.object_store_name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_version_key(mut self, key: impl Into<String>) -> Self {
        self.version_key = key.into();
        self
    }

    pub fn with_disable_on_new_tab_open(mut self, enabled: bool) -> Self {
        self.disable_on_new_tab_open = enabled;
        self
    }

    pub fn with_latest_tab_key(mut self, key: impl Into<String>) -> Self {
        self.latest_tab_key = key.into();
        self
    }

    pub fn with_on_disabled(mut self, hook: impl Fn(&DisabledEvent) + 'static) -> Self {
        self.on_disabled = Some(Rc::new(hook));
        self
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
