pub mod bridge;
pub mod cancel;
pub mod chat;
pub mod config;
pub mod handle;
mod jni_bridge;
pub mod llm_engine;
pub mod stream;
pub mod tensor;
pub mod util;

pub use bridge::Bridge;
pub use cancel::CancellationTable;
pub use handle::Handle;
pub use llm_engine::llama_engine::LlamaEngine;
pub use stream::{DeliveryError, StopReason, StreamOutcome};

#[cfg(target_os = "android")]
use android_logger::Config;
#[cfg(target_os = "android")]
use log::LevelFilter;

/// Initialize logging. Idempotent; the JNI layer calls it on first use.
pub fn init() {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("llm-jni"),
    );

    #[cfg(not(target_os = "android"))]
    util::init_logging();

    log::info!("llm-jni {} initialized", env!("CARGO_PKG_VERSION"));
}
