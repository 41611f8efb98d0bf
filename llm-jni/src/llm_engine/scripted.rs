//! Deterministic engine for tests: replays a fixed list of writes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use common::HistoryTurn;

use super::{Engine, EngineSession, Module, ModuleSpec, Prompt, TokenSink};
use crate::tensor::Tensor;

type WriteHook = Box<dyn FnMut(usize) + Send>;

/// What the last generate call was asked to do.
#[derive(Default)]
struct Record {
    history: Vec<HistoryTurn>,
    prompt: Option<String>,
    max_tokens: Option<usize>,
    refused: usize,
}

pub(crate) struct ScriptedSession {
    pieces: Vec<Vec<u8>>,
    loaded: AtomicBool,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    delay: Duration,
    hook: Mutex<Option<WriteHook>>,
    config: Mutex<serde_json::Map<String, serde_json::Value>>,
    record: Mutex<Record>,
}

impl ScriptedSession {
    pub(crate) fn new(pieces: &[&str]) -> Self {
        Self::from_bytes(pieces.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    pub(crate) fn from_bytes(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            pieces,
            loaded: AtomicBool::new(true),
            fail_at: None,
            panic_at: None,
            delay: Duration::ZERO,
            hook: Mutex::new(None),
            config: Mutex::new(serde_json::Map::new()),
            record: Mutex::new(Record::default()),
        }
    }

    /// Runs `hook(index)` right before write `index`.
    pub(crate) fn before_write(&mut self, hook: impl FnMut(usize) + Send + 'static) {
        *self.hook.get_mut().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn fail_at(&mut self, index: usize) {
        self.fail_at = Some(index);
    }

    pub(crate) fn panic_at(&mut self, index: usize) {
        self.panic_at = Some(index);
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn last_history(&self) -> Vec<HistoryTurn> {
        self.record.lock().unwrap().history.clone()
    }

    pub(crate) fn last_prompt(&self) -> Option<String> {
        self.record.lock().unwrap().prompt.clone()
    }

    pub(crate) fn last_max_tokens(&self) -> Option<usize> {
        self.record.lock().unwrap().max_tokens
    }

    pub(crate) fn refused_writes(&self) -> usize {
        self.record.lock().unwrap().refused
    }
}

impl EngineSession for ScriptedSession {
    fn load(&self) -> Result<()> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        ensure!(self.is_loaded(), "model not loaded");
        Ok(text.bytes().map(i32::from).collect())
    }

    fn detokenize(&self, token: i32) -> Result<String> {
        let byte = u8::try_from(token).map_err(|_| anyhow::anyhow!("token {} out of range", token))?;
        Ok(char::from(byte).to_string())
    }

    fn apply_chat_template(&self, user_content: &str) -> Result<String> {
        Ok(format!("<user>{}</user><assistant>", user_content))
    }

    fn set_config(&self, json: &str) -> Result<()> {
        let serde_json::Value::Object(overlay) = serde_json::from_str(json)? else {
            bail!("config must be a JSON object");
        };
        self.config.lock().unwrap().extend(overlay);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut record = self.record.lock().unwrap();
        record.history.clear();
        record.prompt = None;
        Ok(())
    }

    fn generate(&self, prompt: Prompt<'_>, sink: &mut dyn TokenSink, max_tokens: usize) -> Result<()> {
        ensure!(self.is_loaded(), "model not loaded");
        {
            let mut record = self.record.lock().unwrap();
            match prompt {
                Prompt::Text(text) => record.prompt = Some(text.to_string()),
                Prompt::History(turns) => record.history = turns.to_vec(),
            }
            record.max_tokens = Some(max_tokens);
        }

        for (index, piece) in self.pieces.iter().enumerate().take(max_tokens) {
            if let Some(hook) = self.hook.lock().unwrap().as_mut() {
                hook(index);
            }
            if self.fail_at == Some(index) {
                bail!("scripted failure at write {}", index);
            }
            if self.panic_at == Some(index) {
                panic!("scripted panic at write {}", index);
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if sink.accept(piece) < piece.len() {
                self.record.lock().unwrap().refused += 1;
                break;
            }
        }
        Ok(())
    }

    fn default_max_tokens(&self) -> usize {
        self.config
            .lock()
            .unwrap()
            .get("max_new_tokens")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(64)
    }
}

/// Builds scripted sessions; the config path only has to exist.
pub(crate) struct ScriptedEngine {
    pieces: Vec<String>,
    delay: Duration,
}

impl ScriptedEngine {
    pub(crate) fn new(pieces: &[&str]) -> Self {
        Self {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Engine for ScriptedEngine {
    type Session = ScriptedSession;
    type Module = DoublingModule;

    fn create_session(&self, config_path: &Path) -> Result<ScriptedSession> {
        ensure!(config_path.exists(), "config file {} not found", config_path.display());
        let pieces: Vec<&str> = self.pieces.iter().map(String::as_str).collect();
        let session = ScriptedSession::new(&pieces).with_delay(self.delay);
        session.loaded.store(false, Ordering::SeqCst);
        Ok(session)
    }

    fn load_module(&self, path: &Path, spec: &ModuleSpec) -> Result<DoublingModule> {
        ensure!(path.exists(), "module file {} not found", path.display());
        Ok(DoublingModule {
            outputs: spec.outputs.len().max(1),
        })
    }
}

/// Doubles its first float input once per declared output.
pub(crate) struct DoublingModule {
    outputs: usize,
}

impl Module for DoublingModule {
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let Some(input) = inputs.first() else {
            bail!("expected at least one input");
        };
        let doubled: Vec<f32> = input.as_f32()?.iter().map(|v| v * 2.0).collect();
        (0..self.outputs)
            .map(|_| Tensor::from_f32(input.shape().to_vec(), input.format(), doubled.clone()))
            .collect()
    }
}
