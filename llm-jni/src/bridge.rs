//! Handle-based operations behind the JNI exports.
//!
//! Everything here is plain Rust: handles in, `Result`s out. The JNI layer
//! only converts arguments, calls one method, and maps the result to the
//! sentinel its caller expects.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, ensure, Result};
use common::{DataType, DimensionFormat, HistoryTurn};
use tracing::{debug, info};

use crate::cancel::CancellationTable;
use crate::handle::{Handle, HandleTable};
use crate::llm_engine::{Engine, EngineSession, Module, ModuleSpec, Prompt};
use crate::stream::{self, DeliveryError, StreamOutcome};
use crate::tensor::Tensor;

/// A session plus the lock that keeps its generations one at a time. Only
/// generations take it; the other session calls go straight through.
struct SessionSlot<S> {
    session: S,
    generation: Mutex<()>,
}

impl<S> SessionSlot<S> {
    fn begin_generation(&self, handle: Handle) -> Result<MutexGuard<'_, ()>> {
        self.generation
            .lock()
            .map_err(|_| anyhow!("session {} is unusable after a panic", handle))
    }
}

pub struct Bridge<E: Engine> {
    engine: E,
    sessions: HandleTable<SessionSlot<E::Session>>,
    modules: HandleTable<E::Module>,
    tensors: HandleTable<Mutex<Tensor>>,
    cancellations: CancellationTable,
}

fn lock_tensor(tensor: &Mutex<Tensor>) -> MutexGuard<'_, Tensor> {
    // Tensor writes are single copies; a panic cannot leave one half-done.
    tensor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E: Engine> Bridge<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            sessions: HandleTable::new("session"),
            modules: HandleTable::new("module"),
            tensors: HandleTable::new("tensor"),
            cancellations: CancellationTable::new(),
        }
    }

    pub fn cancellations(&self) -> &CancellationTable {
        &self.cancellations
    }

    // ---- sessions ----

    pub fn create(&self, config_path: impl AsRef<Path>) -> Result<Handle> {
        let session = self.engine.create_session(config_path.as_ref())?;
        let handle = self.sessions.insert(SessionSlot {
            session,
            generation: Mutex::new(()),
        });
        info!("Session {} created from {}", handle, config_path.as_ref().display());
        Ok(handle)
    }

    pub fn load(&self, handle: Handle) -> Result<()> {
        self.sessions.get(handle)?.session.load()
    }

    /// Cancels any running request, then forgets the session. The session is
    /// freed once an in-flight call on it returns. Returns whether it existed.
    pub fn destroy(&self, handle: Handle) -> bool {
        self.cancellations.cancel(handle);
        let existed = self.sessions.remove(handle).is_some();
        if existed {
            info!("Session {} released", handle);
        }
        existed
    }

    pub fn tokenize(&self, handle: Handle, text: &str) -> Result<Vec<i32>> {
        self.sessions.get(handle)?.session.tokenize(text)
    }

    pub fn detokenize(&self, handle: Handle, token: i32) -> Result<String> {
        self.sessions.get(handle)?.session.detokenize(token)
    }

    pub fn apply_chat_template(&self, handle: Handle, user_content: &str) -> Result<String> {
        self.sessions.get(handle)?.session.apply_chat_template(user_content)
    }

    pub fn set_config(&self, handle: Handle, json: &str) -> Result<()> {
        self.sessions.get(handle)?.session.set_config(json)
    }

    pub fn reset(&self, handle: Handle) -> Result<()> {
        self.sessions.get(handle)?.session.reset()
    }

    /// Whole-response generation on a raw prompt. `max_tokens` of `None`
    /// uses the session default.
    pub fn generate_blocking(&self, handle: Handle, prompt: &str, max_tokens: Option<usize>) -> Result<String> {
        self.collect(handle, Prompt::Text(prompt), max_tokens)
    }

    /// Whole-response generation over prior turns, rendered the same way as
    /// for [`Bridge::generate_stream`].
    pub fn generate_blocking_history(
        &self,
        handle: Handle,
        history: &[HistoryTurn],
        max_tokens: Option<usize>,
    ) -> Result<String> {
        self.collect(handle, Prompt::History(history), max_tokens)
    }

    fn collect(&self, handle: Handle, prompt: Prompt<'_>, max_tokens: Option<usize>) -> Result<String> {
        let slot = self.sessions.get(handle)?;
        let _generation = slot.begin_generation(handle)?;
        let session = &slot.session;
        ensure!(session.is_loaded(), "session {} has no model loaded", handle);
        let budget = max_tokens.unwrap_or_else(|| session.default_max_tokens());
        let outcome = stream::run_blocking(session, &self.cancellations, handle, prompt, budget)?;
        if outcome.cancelled {
            debug!("Generation on {} cancelled after {} bytes", handle, outcome.text.len());
        }
        Ok(outcome.text)
    }

    /// Streaming generation over prior turns; see [`stream::run_stream`].
    ///
    /// Generations on the same handle run one at a time. Other calls on the
    /// handle, including from inside `consumer`, do not wait for it.
    pub fn generate_stream<F>(
        &self,
        handle: Handle,
        history: &[HistoryTurn],
        max_tokens: Option<usize>,
        consumer: F,
    ) -> Result<StreamOutcome>
    where
        F: FnMut(&str) -> Result<bool, DeliveryError>,
    {
        let slot = self.sessions.get(handle)?;
        let _generation = slot.begin_generation(handle)?;
        let session = &slot.session;
        ensure!(session.is_loaded(), "session {} has no model loaded", handle);
        let budget = max_tokens.unwrap_or_else(|| session.default_max_tokens());
        stream::run_stream(session, &self.cancellations, handle, history, budget, consumer)
    }

    #[cfg(test)]
    pub(crate) fn with_session<R>(&self, handle: Handle, f: impl FnOnce(&E::Session) -> R) -> Result<R> {
        Ok(f(&self.sessions.get(handle)?.session))
    }

    /// Asks the running request on `handle` to stop. Returns whether one was
    /// running.
    pub fn cancel(&self, handle: Handle) -> bool {
        let found = self.cancellations.cancel(handle);
        debug!("Cancel on {}: {}", handle, if found { "flagged" } else { "nothing running" });
        found
    }

    // ---- modules and tensors ----

    pub fn create_module(&self, path: impl AsRef<Path>, spec: &ModuleSpec) -> Result<Handle> {
        let module = self.engine.load_module(path.as_ref(), spec)?;
        let handle = self.modules.insert(module);
        info!("Module {} created from {}", handle, path.as_ref().display());
        Ok(handle)
    }

    pub fn release_module(&self, handle: Handle) -> bool {
        self.modules.remove(handle).is_some()
    }

    /// Runs `module` on snapshots of `inputs` and registers each output as a
    /// new tensor handle owned by the caller.
    pub fn forward(&self, module: Handle, inputs: &[Handle]) -> Result<Vec<Handle>> {
        let runner = self.modules.get(module)?;
        let snapshot = inputs
            .iter()
            .map(|&h| Ok(lock_tensor(&*self.tensors.get(h)?).clone()))
            .collect::<Result<Vec<Tensor>>>()?;

        let outputs = runner.forward(&snapshot)?;
        debug!("Module {} forward: {} inputs -> {} outputs", module, snapshot.len(), outputs.len());
        Ok(outputs
            .into_iter()
            .map(|t| self.tensors.insert(Mutex::new(t)))
            .collect())
    }

    pub fn create_tensor(&self, shape: Vec<i32>, format: DimensionFormat, dtype: DataType) -> Result<Handle> {
        let tensor = Tensor::new(shape, format, dtype)?;
        Ok(self.tensors.insert(Mutex::new(tensor)))
    }

    pub fn set_float_data(&self, handle: Handle, values: &[f32]) -> Result<()> {
        let tensor = self.tensors.get(handle)?;
        let mut tensor = lock_tensor(&tensor);
        tensor.set_f32(values)
    }

    pub fn set_int_data(&self, handle: Handle, values: &[i32]) -> Result<()> {
        let tensor = self.tensors.get(handle)?;
        let mut tensor = lock_tensor(&tensor);
        tensor.set_i32(values)
    }

    pub fn get_float_data(&self, handle: Handle) -> Result<Vec<f32>> {
        let tensor = self.tensors.get(handle)?;
        let tensor = lock_tensor(&tensor);
        Ok(tensor.as_f32()?.to_vec())
    }

    pub fn get_shape(&self, handle: Handle) -> Result<Vec<i32>> {
        let tensor = self.tensors.get(handle)?;
        let tensor = lock_tensor(&tensor);
        Ok(tensor.shape().to_vec())
    }

    pub fn release_tensor(&self, handle: Handle) -> bool {
        self.tensors.remove(handle).is_some()
    }
}
