//! Keyval Fallback demo
//!
//! Natively, runs the two-tab hand-off against an in-memory browser profile.
//! In the browser the library is used through the exported `KeyvalStore`.

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    log::info!("Keyval Fallback (native) starting...");

    if let Err(e) = demo::run() {
        log::error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // WASM entry point is bindings::start, this is just to satisfy the compiler
}

#[cfg(not(target_arch = "wasm32"))]
mod demo {
    use std::rc::Rc;

    use futures::executor::LocalPool;
    use keyval_fallback::platform::memory::MemoryProfile;
    use keyval_fallback::{FallbackStore, StoreConfig, StoreError};
    use serde_json::json;

    pub fn run() -> Result<(), StoreError> {
        let mut pool = LocalPool::new();
        let profile = MemoryProfile::new();
        let config = StoreConfig::default().with_on_disabled(|event| {
            println!(
                "  tab demoted: reason={} initialized={}",
                event.reason, event.was_initialized
            );
        });

        println!("Opening tab A...");
        let tab_a = FallbackStore::new(config.clone(), profile.context(Rc::new(pool.spawner())));
        let outcome = pool.run_until(tab_a.set("x", json!(10)))?;
        println!("  set x=10 -> {}", outcome.store.as_str());

        println!("Opening tab B...");
        let tab_b = FallbackStore::new(config.clone(), profile.context(Rc::new(pool.spawner())));
        let usable = pool.run_until(tab_b.ready());
        pool.run_until_stalled();
        println!("  tab B persistent: {}", usable);

        let x = pool.run_until(tab_a.get("x"))?;
        let keys = pool.run_until(tab_a.keys())?;
        println!(
            "  tab A still reads x={:?} (persistent keys {:?}, memory keys {:?})",
            x, keys.persistent, keys.memory
        );

        println!("Bumping schema version in tab C...");
        let tab_c = FallbackStore::new(
            config.with_version("0.2").with_disable_on_new_tab_open(false),
            profile.context(Rc::new(pool.spawner())),
        );
        let keys = pool.run_until(tab_c.keys())?;
        println!("  persisted keys after wipe: {:?}", keys.persistent);

        println!("✓ Hand-off demo complete");
        Ok(())
    }
}
