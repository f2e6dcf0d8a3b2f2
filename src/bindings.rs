//! JavaScript API
//!
//! ```js
//! const store = new KeyvalStore({ version: "2", onDisabled: (e) => console.warn(e) });
//! await store.set("prefs", { theme: "dark" });   // { store: "persistent" }
//! await store.get("prefs");
//! await store.keys();                            // { persistent: [...], memory: [...] }
//! ```

use std::fmt::Display;
use std::rc::Rc;

use js_sys::{Function, Promise, Reflect};
use serde_json::json;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

use crate::config::StoreConfig;
use crate::error::{ConfigError, DisabledEvent, DisabledReason};
use crate::platform::Platform;
use crate::platform::web::{js_error, js_to_value, value_to_js};
use crate::store::{FallbackStore, SetOptions};

#[wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
    if console_log::init_with_level(log::Level::Info).is_err() {
        web_sys::console::warn_1(&"Logger already initialized".into());
    }
}

fn to_js_error(err: impl Display) -> JsValue {
    js_sys::Error::new(&err.to_string()).into()
}

fn invalid_option(option: &str, message: &str) -> ConfigError {
    ConfigError::InvalidOption {
        option: option.to_string(),
        message: message.to_string(),
    }
}

/// Split the `onDisabled` function off the options and parse the rest
fn parse_options(options: &JsValue) -> Result<StoreConfig, ConfigError> {
    if options.is_undefined() || options.is_null() {
        return Ok(StoreConfig::default());
    }
    if !options.is_object() {
        return Err(ConfigError::NotAnObject(format!("{:?}", options)));
    }

    let hook = Reflect::get(options, &"onDisabled".into())
        .map_err(|e| invalid_option("onDisabled", &js_error(e).to_string()))?;
    let hook = if hook.is_undefined() || hook.is_null() {
        None
    } else {
        Some(
            hook.dyn_into::<Function>()
                .map_err(|_| invalid_option("onDisabled", "expected a function"))?,
        )
    };

    // Functions are dropped by JSON.stringify
    let json = js_sys::JSON::stringify(options)
        .map_err(|e| ConfigError::NotAnObject(js_error(e).to_string()))?
        .as_string()
        .unwrap_or_else(|| "{}".to_string());
    let mut config = StoreConfig::from_json(&json)?;

    if let Some(hook) = hook {
        config.on_disabled = Some(Rc::new(move |event: &DisabledEvent| {
            let payload = json!({
                "wasInitialized": event.was_initialized,
                "reason": event.reason.code(),
                "error": event.error,
            });
            let result = value_to_js(&payload)
                .map_err(|e| JsValue::from_str(&e.to_string()))
                .and_then(|payload| hook.call1(&JsValue::NULL, &payload));
            if let Err(e) = result {
                log::error!("onDisabled threw: {:?}", e);
            }
        }));
    }
    Ok(config)
}

/// Key-value store with in-memory fallback, exported to JavaScript
#[wasm_bindgen]
pub struct KeyvalStore {
    store: FallbackStore,
}

#[wasm_bindgen]
impl KeyvalStore {
    /// Validates options; initialization starts right away
    #[wasm_bindgen(constructor)]
    pub fn new(options: JsValue) -> Result<KeyvalStore, JsValue> {
        let config = parse_options(&options).map_err(to_js_error)?;
        let platform = Platform::browser().map_err(to_js_error)?;
        Ok(Self {
            store: FallbackStore::new(config, platform),
        })
    }

    /// Resolves to whether persistent storage is in use
    #[wasm_bindgen(getter = readinessPromise)]
    pub fn readiness_promise(&self) -> Promise {
        let readiness = self.store.readiness();
        future_to_promise(async move { Ok(JsValue::from_bool(readiness.await)) })
    }

    pub fn ready(&self) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move { Ok(JsValue::from_bool(store.ready().await)) })
    }

    /// `_options` is accepted for call compatibility; reads never fall back
    pub fn get(&self, key: String, _options: JsValue) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            match store.get(&key).await.map_err(to_js_error)? {
                Some(value) => value_to_js(&value).map_err(to_js_error),
                None => Ok(JsValue::UNDEFINED),
            }
        })
    }

    /// Values cross into storage as JSON: `Date` becomes a string, `Map`,
    /// `Set` and `Blob` become `{}`, `NaN`/`Infinity` become `null`, and
    /// `undefined` is rejected.
    pub fn set(&self, key: String, value: JsValue, options: JsValue) -> Promise {
        let store = self.store.clone();
        let use_fallback = if options.is_object() {
            Reflect::get(&options, &"useFallback".into())
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(true)
        } else {
            true
        };
        future_to_promise(async move {
            let value = js_to_value(&value)
                .map_err(to_js_error)?
                .ok_or_else(|| to_js_error("undefined cannot be stored"))?;
            let outcome = store
                .set_with(&key, value, SetOptions { use_fallback })
                .await
                .map_err(to_js_error)?;
            value_to_js(&json!({ "store": outcome.store.as_str() })).map_err(to_js_error)
        })
    }

    pub fn del(&self, key: String) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            store.del(&key).await.map_err(to_js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    pub fn keys(&self) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            let listing = store.keys().await.map_err(to_js_error)?;
            let listing = serde_json::to_value(listing).map_err(to_js_error)?;
            value_to_js(&listing).map_err(to_js_error)
        })
    }

    pub fn clear(&self) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            store.clear().await.map_err(to_js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Switch to memory-only mode
    pub fn disable(&self, reason: String, error: JsValue) {
        let error = if error.is_undefined() || error.is_null() {
            None
        } else {
            Some(js_error(error))
        };
        self.store.disable(DisabledReason::from_code(&reason), error);
    }
}
