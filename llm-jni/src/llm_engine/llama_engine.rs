use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, ensure, Context, Result};
use common::HistoryTurn;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tracing::{debug, info, warn};

use super::{Engine, EngineSession, Module, ModuleSpec, Prompt, TokenSink};
use crate::config::SessionConfig;
use crate::tensor::Tensor;

const MIN_BATCH: usize = 512;

/// Process-wide llama.cpp backend. One per process; sessions and modules
/// share it.
pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
}

impl LlamaEngine {
    pub fn new() -> Result<Self> {
        let mut backend = LlamaBackend::init().map_err(|e| anyhow!("Failed to initialize llama.cpp backend: {}", e))?;
        if !tracing::enabled!(tracing::Level::DEBUG) {
            backend.void_logs();
        }
        info!("llama.cpp backend initialized");
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl Engine for LlamaEngine {
    type Session = LlamaSession;
    type Module = LlamaEmbeddingModule;

    fn create_session(&self, config_path: &Path) -> Result<LlamaSession> {
        let config = SessionConfig::from_file(config_path)?;
        info!("Created session for model {}", config.model_path().display());
        Ok(LlamaSession {
            backend: self.backend.clone(),
            config: RwLock::new(config),
            model: RwLock::new(None),
        })
    }

    fn load_module(&self, path: &Path, spec: &ModuleSpec) -> Result<LlamaEmbeddingModule> {
        ensure!(
            spec.inputs.len() <= 1 && spec.outputs.len() <= 1,
            "embedding modules take one input and produce one output, got {:?} -> {:?}",
            spec.inputs,
            spec.outputs
        );
        let model_path = validate_model_path(path)?;
        let n_gpu_layers = if spec.config.forward_type.wants_gpu() { 999 } else { 0 };
        debug!(
            "Loading module {} (forward={:?}, precision={:?}, memory={:?})",
            model_path.display(),
            spec.config.forward_type,
            spec.config.precision,
            spec.config.memory
        );

        let params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, &model_path, &params)
            .map_err(|e| anyhow!("Failed to load module {}: {}", model_path.display(), e))?;
        info!("Module loaded: {} (n_embd={})", model_path.display(), model.n_embd());

        Ok(LlamaEmbeddingModule {
            backend: self.backend.clone(),
            model,
            n_threads: spec.config.num_threads,
        })
    }
}

fn validate_model_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(anyhow!("Model file does not exist: {}", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("Model path is not a file: {}", path.display()));
    }
    Ok(path.to_path_buf())
}

/// A model plus its settings. Calls never hold a lock while the engine runs:
/// generation works on a cloned config and its own `Arc` of the weights, so
/// tokenize and friends stay available meanwhile.
pub struct LlamaSession {
    backend: Arc<LlamaBackend>,
    config: RwLock<SessionConfig>,
    model: RwLock<Option<Arc<LlamaModel>>>,
}

// Both locks guard single assignments; a panic cannot leave them half-written.
impl LlamaSession {
    fn config(&self) -> RwLockReadGuard<'_, SessionConfig> {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn config_mut(&self) -> RwLockWriteGuard<'_, SessionConfig> {
        self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self) -> RwLockWriteGuard<'_, Option<Arc<LlamaModel>>> {
        self.model.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn model(&self) -> Result<Arc<LlamaModel>> {
        self.model
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("model not loaded"))
    }
}

fn sampler(config: &SessionConfig) -> LlamaSampler {
    if config.temperature <= 0.0 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(config.top_k),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(config.seed),
        ])
    }
}

/// Renders prior turns into one prompt string, prepending the configured
/// system prompt unless the history already opens with one.
fn render_history(config: &SessionConfig, model: &LlamaModel, turns: &[HistoryTurn]) -> Result<String> {
    let mut messages: Vec<(&str, &str)> = Vec::with_capacity(turns.len() + 1);
    if let Some(system) = config.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        if !turns.first().is_some_and(HistoryTurn::is_system) {
            messages.push(("system", system));
        }
    }
    messages.extend(turns.iter().map(|t| (t.role.as_str(), t.content.as_str())));

    if config.use_template {
        match apply_template(model, &messages) {
            Ok(prompt) => return Ok(prompt),
            Err(e) => warn!("Chat template not applied, using plain transcript: {:#}", e),
        }
    }
    Ok(plain_transcript(&messages))
}

/// Templates usually open with the BOS text already; tokenizing parses it
/// into the BOS token, so adding another would double it.
fn bos_for(prompt: &str, bos_text: &[u8]) -> AddBos {
    if !bos_text.is_empty() && prompt.as_bytes().starts_with(bos_text) {
        AddBos::Never
    } else {
        AddBos::Always
    }
}

fn apply_template(model: &LlamaModel, messages: &[(&str, &str)]) -> Result<String> {
    let template = model.chat_template(None).context("model has no chat template")?;
    let chat = messages
        .iter()
        .map(|(role, content)| LlamaChatMessage::new(role.to_string(), content.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(model.apply_chat_template(&template, &chat, true)?)
}

fn plain_transcript(messages: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (role, content) in messages {
        out.push_str(role);
        out.push_str(": ");
        out.push_str(content);
        out.push('\n');
    }
    out.push_str("assistant: ");
    out
}

impl EngineSession for LlamaSession {
    fn load(&self) -> Result<()> {
        let (path, n_gpu_layers) = {
            let config = self.config();
            (config.model_path(), config.n_gpu_layers)
        };
        let path = validate_model_path(&path)?;
        info!("Loading model {} (n_gpu_layers={})", path.display(), n_gpu_layers);

        // drop our reference to the old weights before mapping new ones
        *self.slot() = None;
        let params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, &path, &params)
            .map_err(|e| anyhow!("Failed to load model {}: {}", path.display(), e))?;

        info!(
            "Model loaded: n_vocab={}, n_ctx_train={}",
            model.n_vocab(),
            model.n_ctx_train()
        );
        *self.slot() = Some(Arc::new(model));
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.model().is_ok()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        let tokens = self
            .model()?
            .str_to_token(text, AddBos::Never)
            .map_err(|e| anyhow!("Failed to tokenize: {}", e))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn detokenize(&self, token: i32) -> Result<String> {
        let model = self.model()?;
        if token < 0 || token >= model.n_vocab() {
            bail!("token {} outside vocabulary of {}", token, model.n_vocab());
        }
        let bytes = model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| anyhow!("Failed to detokenize {}: {}", token, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn apply_chat_template(&self, user_content: &str) -> Result<String> {
        let model = self.model()?;
        apply_template(&model, &[("user", user_content)])
    }

    fn set_config(&self, json: &str) -> Result<()> {
        let keys = self.config_mut().merge_json(json)?;
        if self.is_loaded() && keys.iter().any(|k| SessionConfig::is_load_key(k)) {
            warn!("Config keys {:?} take effect on the next load", keys);
        }
        debug!("Session config updated: {:?}", keys);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        // Every generate builds a fresh context, so no KV state survives between calls.
        debug!("Session reset");
        Ok(())
    }

    fn generate(&self, prompt: Prompt<'_>, sink: &mut dyn TokenSink, max_tokens: usize) -> Result<()> {
        let loaded = self.model()?;
        let model = loaded.as_ref();
        let config = self.config().clone();
        let text = match prompt {
            Prompt::Text(text) => text.to_string(),
            Prompt::History(turns) => render_history(&config, model, turns)?,
        };

        let bos_text = model
            .token_to_bytes(model.token_bos(), Special::Tokenize)
            .unwrap_or_default();
        let tokens = model
            .str_to_token(&text, bos_for(&text, &bos_text))
            .map_err(|e| anyhow!("Failed to tokenize prompt: {}", e))?;
        ensure!(!tokens.is_empty(), "prompt produced no tokens");

        let n_ctx = match config.n_ctx {
            0 => model.n_ctx_train(),
            n => n.min(model.n_ctx_train()),
        };
        ensure!(
            tokens.len() < n_ctx as usize,
            "prompt of {} tokens does not fit a context of {}",
            tokens.len(),
            n_ctx
        );
        let budget = max_tokens.min(n_ctx as usize - tokens.len());
        debug!("Prompt is {} tokens, generating up to {}", tokens.len(), budget);

        let n_batch = tokens.len().max(MIN_BATCH);
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_batch as u32);
        if config.n_threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(config.n_threads as i32)
                .with_n_threads_batch(config.n_threads as i32);
        }
        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| anyhow!("Failed to create context: {}", e))?;

        let mut batch = LlamaBatch::new(n_batch, 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch.add(*token, i as i32, &[0], i == last)?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| anyhow!("Failed to decode prompt: {}", e))?;

        let mut sampler = sampler(&config);
        let mut n_cur = batch.n_tokens();
        for _ in 0..budget {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if model.is_eog_token(token) {
                debug!("End of generation after {} tokens", n_cur as usize - tokens.len());
                break;
            }

            let piece = model
                .token_to_bytes(token, Special::Plaintext)
                .map_err(|e| anyhow!("Failed to convert token to bytes: {}", e))?;
            if !piece.is_empty() && sink.accept(&piece) < piece.len() {
                debug!("Sink refused output, stopping");
                break;
            }

            batch.clear();
            batch.add(token, n_cur, &[0], true)?;
            ctx.decode(&mut batch)
                .map_err(|e| anyhow!("Failed to decode: {}", e))?;
            n_cur += 1;
        }
        Ok(())
    }

    fn default_max_tokens(&self) -> usize {
        self.config().max_new_tokens
    }
}

/// Runs a token tensor through an embedding model: int32 ids in, one pooled
/// `[1, n_embd]` float32 tensor out, laid out like the input.
pub struct LlamaEmbeddingModule {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    n_threads: u32,
}

impl Module for LlamaEmbeddingModule {
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let [input] = inputs else {
            bail!("embedding module takes exactly one input, got {}", inputs.len());
        };
        let tokens: Vec<LlamaToken> = input.as_i32()?.iter().copied().map(LlamaToken).collect();
        ensure!(!tokens.is_empty(), "input tensor holds no tokens");

        let n_batch = tokens.len().max(MIN_BATCH) as u32;
        let mut ctx_params = LlamaContextParams::default()
            .with_embeddings(true)
            .with_n_ctx(NonZeroU32::new(n_batch))
            .with_n_batch(n_batch)
            .with_n_ubatch(n_batch);
        if self.n_threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(self.n_threads as i32)
                .with_n_threads_batch(self.n_threads as i32);
        }
        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| anyhow!("Failed to create embedding context: {}", e))?;

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        batch.add_sequence(&tokens, 0, false)?;
        ctx.decode(&mut batch)
            .map_err(|e| anyhow!("Failed to decode embedding input: {}", e))?;

        let embedding = ctx
            .embeddings_seq_ith(0)
            .map_err(|e| anyhow!("Failed to read embeddings: {}", e))?;
        let width = i32::try_from(embedding.len())?;
        Ok(vec![Tensor::from_f32(vec![1, width], input.format(), embedding.to_vec())?])
    }
}
