//! Turns one blocking generate call into an incremental, stoppable stream.
//!
//! The engine writes into a [`StreamRelay`] as if it were a plain buffer. The
//! relay batches those writes into natural chunks, hands each chunk to the
//! consumer, and starts refusing writes once the consumer says stop or the
//! request is cancelled. Refusing writes is the only way to cut a generation
//! short; the engine has no interrupt.

pub mod chunk;

use anyhow::{Context, Result};
use common::HistoryTurn;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancellationTable;
use crate::handle::Handle;
use crate::llm_engine::{EngineSession, Prompt, TokenSink};
use chunk::ChunkBuffer;

/// Why a chunk could not be delivered.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The consumer could not be reached from this thread. The chunk is kept
    /// and offered again at the next flush.
    #[error("call context unavailable: {0}")]
    ContextUnavailable(String),
    /// The consumer failed while handling the chunk. Treated as a stop.
    #[error("consumer failed: {0}")]
    Consumer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The engine finished on its own: budget or end-of-generation.
    Completed,
    /// The consumer returned false or failed.
    ConsumerStopped,
    /// A cancel for the handle was observed.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub chunks: usize,
    pub bytes: usize,
    /// Generated bytes that never reached the consumer because its context
    /// was unavailable at the final flush.
    pub dropped: usize,
    pub stop_reason: StopReason,
}

/// Output sink that relays chunks to a consumer.
pub struct StreamRelay<'a, F> {
    cancellations: &'a CancellationTable,
    handle: Handle,
    buffer: ChunkBuffer,
    stopped: Option<StopReason>,
    consumer: F,
    chunks: usize,
    bytes: usize,
    dropped: usize,
}

impl<'a, F> StreamRelay<'a, F>
where
    F: FnMut(&str) -> Result<bool, DeliveryError>,
{
    pub fn new(cancellations: &'a CancellationTable, handle: Handle, consumer: F) -> Self {
        Self {
            cancellations,
            handle,
            buffer: ChunkBuffer::new(),
            stopped: None,
            consumer,
            chunks: 0,
            bytes: 0,
            dropped: 0,
        }
    }

    /// Delivers whatever is left and reports how the stream ended.
    pub fn finish(mut self) -> StreamOutcome {
        if !self.buffer.is_empty() && self.stopped.is_none() {
            self.flush(true);
        }
        StreamOutcome {
            chunks: self.chunks,
            bytes: self.bytes,
            dropped: self.dropped,
            stop_reason: self.stopped.unwrap_or(StopReason::Completed),
        }
    }

    fn flush(&mut self, at_end: bool) {
        let (text, consumed) = if at_end {
            self.buffer.peek_all()
        } else {
            self.buffer.peek_text()
        };
        if text.is_empty() {
            return;
        }

        match (self.consumer)(&text) {
            Ok(keep_going) => {
                self.chunks += 1;
                self.bytes += text.len();
                trace!("Flushed {} bytes on {} (chunk {})", text.len(), self.handle, self.chunks);
                if keep_going {
                    self.buffer.consume(consumed);
                } else {
                    debug!("Stream on {} stopped by consumer", self.handle);
                    self.stop(StopReason::ConsumerStopped);
                }
            }
            Err(DeliveryError::ContextUnavailable(reason)) if at_end => {
                warn!(
                    "Final flush on {} failed, {} bytes lost: {}",
                    self.handle,
                    text.len(),
                    reason
                );
                self.dropped += text.len();
                self.buffer.clear();
            }
            Err(DeliveryError::ContextUnavailable(reason)) => {
                warn!("Skipping flush on {}, retrying at the next one: {}", self.handle, reason);
            }
            Err(DeliveryError::Consumer(reason)) => {
                warn!("Consumer failed on {}, stopping: {}", self.handle, reason);
                self.stop(StopReason::ConsumerStopped);
            }
        }
    }

    fn stop(&mut self, reason: StopReason) {
        self.stopped = Some(reason);
        self.buffer.clear();
    }
}

impl<F> TokenSink for StreamRelay<'_, F>
where
    F: FnMut(&str) -> Result<bool, DeliveryError>,
{
    fn accept(&mut self, bytes: &[u8]) -> usize {
        if self.stopped.is_some() || bytes.is_empty() {
            return 0;
        }
        if self.cancellations.check_flag(self.handle) {
            debug!("Generation on {} cancelled", self.handle);
            self.stopped = Some(StopReason::Cancelled);
            return 0;
        }

        if self.buffer.push(bytes) {
            self.flush(false);
        }
        bytes.len()
    }
}

/// Runs one streaming request on `session`.
///
/// The cancellation entry for `handle` exists exactly for the duration of
/// this call, whether it returns, fails or unwinds.
pub fn run_stream<S, F>(
    session: &S,
    cancellations: &CancellationTable,
    handle: Handle,
    history: &[HistoryTurn],
    max_tokens: usize,
    consumer: F,
) -> Result<StreamOutcome>
where
    S: EngineSession + ?Sized,
    F: FnMut(&str) -> Result<bool, DeliveryError>,
{
    let _registration = cancellations.register(handle);
    debug!(
        "Starting stream on {} with {} history turns, max_tokens={}",
        handle,
        history.len(),
        max_tokens
    );

    let mut relay = StreamRelay::new(cancellations, handle, consumer);
    session
        .generate(Prompt::History(history), &mut relay, max_tokens)
        .with_context(|| format!("stream generation on {} failed", handle))?;

    let outcome = relay.finish();
    info!(
        "Stream on {} ended ({:?}): {} chunks, {} bytes, {} dropped",
        handle, outcome.stop_reason, outcome.chunks, outcome.bytes, outcome.dropped
    );
    Ok(outcome)
}

/// Sink for the whole-response variant: keeps everything, but still honours
/// cancellation.
struct CollectSink<'a> {
    cancellations: &'a CancellationTable,
    handle: Handle,
    bytes: Vec<u8>,
    cancelled: bool,
}

impl TokenSink for CollectSink<'_> {
    fn accept(&mut self, bytes: &[u8]) -> usize {
        if self.cancelled || self.cancellations.check_flag(self.handle) {
            self.cancelled = true;
            return 0;
        }
        self.bytes.accept(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingOutcome {
    pub text: String,
    pub cancelled: bool,
}

/// Runs one whole-response request on `session`.
pub fn run_blocking<S>(
    session: &S,
    cancellations: &CancellationTable,
    handle: Handle,
    prompt: Prompt<'_>,
    max_tokens: usize,
) -> Result<BlockingOutcome>
where
    S: EngineSession + ?Sized,
{
    let _registration = cancellations.register(handle);
    let mut sink = CollectSink {
        cancellations,
        handle,
        bytes: Vec::new(),
        cancelled: false,
    };
    session
        .generate(prompt, &mut sink, max_tokens)
        .with_context(|| format!("generation on {} failed", handle))?;

    debug!("Generated {} bytes on {}", sink.bytes.len(), handle);
    Ok(BlockingOutcome {
        text: String::from_utf8_lossy(&sink.bytes).into_owned(),
        cancelled: sink.cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::scripted::ScriptedSession;
    use std::sync::Arc;

    fn handle() -> Handle {
        Handle::from_raw(11).unwrap()
    }

    fn collect(
        session: &ScriptedSession,
        table: &CancellationTable,
        history: &[HistoryTurn],
        max_tokens: usize,
        mut reply: impl FnMut(usize) -> bool,
    ) -> (Result<StreamOutcome>, Vec<String>) {
        let mut chunks = Vec::new();
        let result = run_stream(session, table, handle(), history, max_tokens, |chunk: &str| {
            chunks.push(chunk.to_string());
            Ok(reply(chunks.len()))
        });
        (result, chunks)
    }

    #[test]
    fn test_hello_there_scenario() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["Hello. ", " there"]);
        let history = vec![HistoryTurn::user("Hi")];

        let (result, chunks) = collect(&session, &table, &history, 5, |_| true);
        let outcome = result.unwrap();

        assert_eq!(chunks, vec!["Hello. ", " there"]);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.chunks, 2);
        assert_eq!(session.last_history(), history);
        assert_eq!(session.last_max_tokens(), Some(5));
        assert!(table.is_empty());
    }

    #[test]
    fn test_consumer_stop_on_first_flush() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["One.", " Two.", " Three."]);

        let (result, chunks) = collect(&session, &table, &[], 16, |_| false);
        let outcome = result.unwrap();

        assert_eq!(chunks, vec!["One."]);
        assert_eq!(outcome.stop_reason, StopReason::ConsumerStopped);
        // the next write was refused, so the engine stopped
        assert_eq!(session.refused_writes(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_no_flush_after_consumer_stop() {
        let table = CancellationTable::new();
        let pieces: Vec<String> = (0..20).map(|i| format!("word{}. ", i)).collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let session = ScriptedSession::new(&refs);

        let (result, chunks) = collect(&session, &table, &[], 100, |n| n < 3);
        assert_eq!(result.unwrap().stop_reason, StopReason::ConsumerStopped);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_concatenation_matches_engine_output() {
        let table = CancellationTable::new();
        let pieces = [
            "The", " quick", " brown", " fox", " jumps", " over", "\n", "the lazy dog",
            "！", "好", "的", "。", " and", " some", " trailing", " words",
        ];
        let session = ScriptedSession::new(&pieces);

        let (result, chunks) = collect(&session, &table, &[], 64, |_| true);
        let outcome = result.unwrap();

        assert_eq!(chunks.concat(), pieces.concat());
        assert_eq!(outcome.bytes, pieces.concat().len());
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_split_multibyte_char_arrives_intact() {
        let table = CancellationTable::new();
        let text = "fifteen chars. 好吗";
        let bytes = text.as_bytes();
        // cut inside the first CJK character, past the 16-byte threshold
        let session = ScriptedSession::from_bytes(vec![bytes[..16].to_vec(), bytes[16..].to_vec()]);

        let (result, chunks) = collect(&session, &table, &[], 8, |_| true);
        result.unwrap();
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| !c.contains('\u{FFFD}')));
    }

    #[test]
    fn test_budget_is_passed_through() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["a", "b", "c", "d"]);

        let (result, chunks) = collect(&session, &table, &[], 2, |_| true);
        result.unwrap();
        assert_eq!(chunks.concat(), "ab");
    }

    #[test]
    fn test_cancel_drops_subsequent_writes() {
        let table = Arc::new(CancellationTable::new());
        let mut session = ScriptedSession::new(&["First. ", "second ", "third ", "fourth"]);
        let cancel_table = table.clone();
        session.before_write(move |index| {
            if index == 1 {
                cancel_table.cancel(handle());
            }
        });

        let (result, chunks) = collect(&session, &table, &[], 10, |_| true);
        let outcome = result.unwrap();

        assert_eq!(chunks, vec!["First. "]);
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(session.refused_writes(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancelled_tail_is_not_flushed() {
        let table = Arc::new(CancellationTable::new());
        let mut session = ScriptedSession::new(&["no punctuation", " here"]);
        let cancel_table = table.clone();
        session.before_write(move |index| {
            if index == 1 {
                cancel_table.cancel(handle());
            }
        });

        let (result, chunks) = collect(&session, &table, &[], 10, |_| true);
        assert_eq!(result.unwrap().stop_reason, StopReason::Cancelled);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_engine_error_still_clears_flag() {
        let table = CancellationTable::new();
        let mut session = ScriptedSession::new(&["Partial. ", "never"]);
        session.fail_at(1);

        let (result, chunks) = collect(&session, &table, &[], 10, |_| true);
        assert!(result.is_err());
        assert_eq!(chunks, vec!["Partial. "]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_engine_panic_still_clears_flag() {
        let table = CancellationTable::new();
        let mut session = ScriptedSession::new(&["x", "y"]);
        session.panic_at(1);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_stream(&session, &table, handle(), &[], 10, |_: &str| Ok(true))
        }));
        assert!(result.is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_consumer_failure_is_a_stop() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["Boom. ", "after"]);
        let mut calls = 0;

        let outcome = run_stream(&session, &table, handle(), &[], 10, |_: &str| {
            calls += 1;
            Err(DeliveryError::Consumer("exception in onChunk".into()))
        })
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(outcome.stop_reason, StopReason::ConsumerStopped);
        assert_eq!(outcome.chunks, 0);
    }

    #[test]
    fn test_unavailable_context_keeps_text_for_next_flush() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["Lost? ", "Found."]);
        let mut delivered = Vec::new();
        let mut attempts = 0;

        let outcome = run_stream(&session, &table, handle(), &[], 10, |chunk: &str| {
            attempts += 1;
            if attempts == 1 {
                return Err(DeliveryError::ContextUnavailable("attach failed".into()));
            }
            delivered.push(chunk.to_string());
            Ok(true)
        })
        .unwrap();

        assert_eq!(delivered, vec!["Lost? Found."]);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
    }

    #[test]
    fn test_unavailable_context_at_end_reports_dropped_bytes() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["Sent. ", "no end"]);
        let mut attempts = 0;

        let outcome = run_stream(&session, &table, handle(), &[], 10, |chunk: &str| {
            attempts += 1;
            if attempts == 1 {
                assert_eq!(chunk, "Sent. ");
                return Ok(true);
            }
            Err(DeliveryError::ContextUnavailable("detached".into()))
        })
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.bytes, "Sent. ".len());
        assert_eq!(outcome.dropped, "no end".len());
        assert_eq!(outcome.stop_reason, StopReason::Completed);
    }

    #[test]
    fn test_blocking_renders_history() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["ok"]);
        let history = vec![HistoryTurn::system("Be brief."), HistoryTurn::user("Hi")];

        let outcome = run_blocking(&session, &table, handle(), Prompt::History(&history), 10).unwrap();
        assert_eq!(outcome.text, "ok");
        assert_eq!(session.last_history(), history);
        assert_eq!(session.last_prompt(), None);
    }

    #[test]
    fn test_blocking_collects_everything() {
        let table = CancellationTable::new();
        let session = ScriptedSession::new(&["Hello", ", ", "world"]);

        let outcome = run_blocking(&session, &table, handle(), Prompt::Text("greet"), 10).unwrap();
        assert_eq!(outcome.text, "Hello, world");
        assert!(!outcome.cancelled);
        assert_eq!(session.last_prompt().as_deref(), Some("greet"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_blocking_honours_cancel() {
        let table = Arc::new(CancellationTable::new());
        let mut session = ScriptedSession::new(&["keep", "drop", "drop"]);
        let cancel_table = table.clone();
        session.before_write(move |index| {
            if index == 1 {
                cancel_table.cancel(handle());
            }
        });

        let outcome = run_blocking(&session, &table, handle(), Prompt::Text("p"), 10).unwrap();
        assert_eq!(outcome.text, "keep");
        assert!(outcome.cancelled);
    }
}
