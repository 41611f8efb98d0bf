//! Desktop driver for the bridge: one chat turn, streamed to a writer, with
//! Ctrl-C and a timer wired to `cancel`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use common::HistoryTurn;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::handle::Handle;
use crate::llm_engine::Engine;
use crate::stream::{DeliveryError, StreamOutcome};

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub config: PathBuf,
    pub history: Vec<HistoryTurn>,
    pub max_tokens: Option<usize>,
    pub blocking: bool,
    pub cancel_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Streamed(StreamOutcome),
    Blocking { bytes: usize },
}

/// Cancels `handle` on Ctrl-C or once `after` elapses, whichever comes first.
pub fn spawn_canceller<E>(bridge: Arc<Bridge<E>>, handle: Handle, after: Option<Duration>) -> JoinHandle<()>
where
    E: Engine + 'static,
{
    tokio::spawn(async move {
        let timer = async {
            match after {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted, cancelling {}", handle),
            _ = timer => info!("Cancel timer fired for {}", handle),
        }
        bridge.cancel(handle);
    })
}

/// Runs one turn on a fresh session and tears the session down afterwards.
pub async fn run_chat<E, W>(bridge: Arc<Bridge<E>>, request: ChatRequest, out: W) -> Result<ChatOutcome>
where
    E: Engine + 'static,
    W: Write + Send + 'static,
{
    let handle = bridge.create(&request.config)?;
    let result = run_turn(bridge.clone(), handle, request, out).await;
    bridge.destroy(handle);
    result
}

async fn run_turn<E, W>(bridge: Arc<Bridge<E>>, handle: Handle, request: ChatRequest, mut out: W) -> Result<ChatOutcome>
where
    E: Engine + 'static,
    W: Write + Send + 'static,
{
    bridge.load(handle)?;
    let canceller = spawn_canceller(bridge.clone(), handle, request.cancel_after);

    let worker = bridge.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<ChatOutcome> {
        if request.blocking {
            let text = worker.generate_blocking_history(handle, &request.history, request.max_tokens)?;
            out.write_all(text.as_bytes())?;
            out.flush()?;
            return Ok(ChatOutcome::Blocking { bytes: text.len() });
        }

        let outcome = worker.generate_stream(handle, &request.history, request.max_tokens, |chunk| {
            out.write_all(chunk.as_bytes())
                .and_then(|_| out.flush())
                .map(|_| true)
                .map_err(|e| DeliveryError::Consumer(e.to_string()))
        })?;
        Ok(ChatOutcome::Streamed(outcome))
    })
    .await;
    canceller.abort();

    let outcome = outcome.map_err(|e| anyhow!("generation task failed: {}", e))??;
    if let ChatOutcome::Streamed(streamed) = &outcome {
        if streamed.chunks == 0 {
            warn!("Model produced no output");
        }
    }
    Ok(outcome)
}
