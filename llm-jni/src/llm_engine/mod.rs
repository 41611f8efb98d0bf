//! Seam between the bridge and the inference engine linked into the process.
//!
//! The bridge never tokenizes, samples or runs kernels itself. Everything it
//! needs from an engine goes through the traits below, which the llama.cpp
//! backend implements for real and the scripted engine implements in tests.

pub mod llama_engine;
#[cfg(test)]
pub(crate) mod scripted;

use std::path::Path;

use anyhow::Result;
use common::{HistoryTurn, ModuleConfig};

use crate::tensor::Tensor;

/// Destination for generated text.
///
/// `accept` receives raw bytes as the engine produces them (often a single
/// token's worth, possibly a partial UTF-8 sequence) and returns how many it
/// took. An engine must stop generating once a non-empty write is not fully
/// accepted.
pub trait TokenSink {
    fn accept(&mut self, bytes: &[u8]) -> usize;
}

impl TokenSink for Vec<u8> {
    fn accept(&mut self, bytes: &[u8]) -> usize {
        self.extend_from_slice(bytes);
        bytes.len()
    }
}

/// What a generation call is conditioned on.
#[derive(Debug, Clone, Copy)]
pub enum Prompt<'a> {
    /// Fed to the model as-is, no chat template.
    Text(&'a str),
    /// Prior turns; the engine renders them with its chat template.
    History(&'a [HistoryTurn]),
}

/// One model instance. Shared between threads: a generation may be running
/// while tokenize, detokenize or set_config arrive, so implementations keep
/// their state behind locks that are never held across `generate`.
pub trait EngineSession: Send + Sync {
    /// Loads weights. Configuration set before this call applies to it.
    fn load(&self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    fn tokenize(&self, text: &str) -> Result<Vec<i32>>;

    fn detokenize(&self, token: i32) -> Result<String>;

    /// Wraps a single user message in the model's chat template.
    fn apply_chat_template(&self, user_content: &str) -> Result<String>;

    /// Overlays a JSON object onto the session configuration.
    fn set_config(&self, json: &str) -> Result<()>;

    /// Drops any conversation state the engine keeps between calls.
    fn reset(&self) -> Result<()>;

    /// Blocks until generation finishes: budget exhausted, end-of-generation
    /// reached, or the sink refused a write.
    fn generate(&self, prompt: Prompt<'_>, sink: &mut dyn TokenSink, max_tokens: usize) -> Result<()>;

    /// Budget used when the caller does not supply a positive one.
    fn default_max_tokens(&self) -> usize;
}

pub trait Module: Send + Sync {
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

/// Names and scheduling for a module load.
#[derive(Debug, Clone, Default)]
pub struct ModuleSpec {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub config: ModuleConfig,
}

pub trait Engine: Send + Sync {
    type Session: EngineSession;
    type Module: Module;

    /// Creates a session from a config file without loading weights, so
    /// `set_config` can still change load-time settings.
    fn create_session(&self, config_path: &Path) -> Result<Self::Session>;

    fn load_module(&self, path: &Path, spec: &ModuleSpec) -> Result<Self::Module>;
}
