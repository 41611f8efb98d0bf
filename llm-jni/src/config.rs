//! Session configuration: a JSON file named at create time, adjustable with
//! JSON overlays until (and after) the model is loaded.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model weights. Relative paths resolve against the config file's directory.
    pub llm_model: String,
    /// Context window in tokens; 0 uses the model's training context.
    pub n_ctx: u32,
    pub n_gpu_layers: u32,
    /// 0 lets the engine pick.
    pub n_threads: u32,
    /// 0 or below selects greedy sampling.
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    /// `u32::MAX` asks the engine for a random seed.
    pub seed: u32,
    pub max_new_tokens: usize,
    pub system_prompt: Option<String>,
    /// Render prompts with the model's chat template when it has one.
    pub use_template: bool,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            llm_model: "model.gguf".to_string(),
            n_ctx: 4096,
            n_gpu_layers: 0,
            n_threads: 0,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            seed: u32::MAX,
            max_new_tokens: 512,
            system_prompt: None,
            use_template: true,
            base_dir: PathBuf::new(),
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: SessionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        debug!("Loaded session config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Applies a JSON object on top of the current values and returns the
    /// keys it carried. On error the config is left as it was.
    pub fn merge_json(&mut self, json: &str) -> Result<Vec<String>> {
        let overlay: Value = serde_json::from_str(json).context("config overlay is not valid JSON")?;
        let Value::Object(overlay) = overlay else {
            bail!("config overlay must be a JSON object");
        };

        let mut current = serde_json::to_value(&*self)?;
        let keys: Vec<String> = overlay.keys().cloned().collect();
        if let Value::Object(fields) = &mut current {
            fields.extend(overlay);
        }

        let mut merged: SessionConfig =
            serde_json::from_value(current).context("config overlay has a field of the wrong type")?;
        merged.base_dir = std::mem::take(&mut self.base_dir);
        *self = merged;
        Ok(keys)
    }

    pub fn model_path(&self) -> PathBuf {
        let model = Path::new(&self.llm_model);
        if model.is_absolute() {
            model.to_path_buf()
        } else {
            self.base_dir.join(model)
        }
    }

    /// Keys that only take effect on the next load.
    pub fn is_load_key(key: &str) -> bool {
        matches!(key, "llm_model" | "n_gpu_layers")
    }
}
