use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use llm_jni::chat::{run_chat, ChatOutcome, ChatRequest};
use llm_jni::util::{self, cmd::Args};
use llm_jni::{Bridge, LlamaEngine};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse().load_config()?;
    match args.log_level {
        Some(level) => util::init_logging_with(level.into()),
        None => util::init_logging(),
    }
    debug!("args: {:#?}", args);

    let request = ChatRequest {
        config: args.config.clone().ok_or_else(|| anyhow!("no session config"))?,
        history: args.history_turns()?,
        max_tokens: args.max_tokens.filter(|n| *n > 0),
        blocking: args.blocking,
        cancel_after: args.cancel_after_ms.map(Duration::from_millis),
    };
    info!("Session config: {}", request.config.display());

    let bridge = Arc::new(Bridge::new(LlamaEngine::new()?));
    let outcome = run_chat(bridge, request, std::io::stdout()).await?;
    println!();

    match outcome {
        ChatOutcome::Streamed(streamed) => info!(
            "Done ({:?}): {} chunks, {} bytes",
            streamed.stop_reason, streamed.chunks, streamed.bytes
        ),
        ChatOutcome::Blocking { bytes } => info!("Done: {} bytes", bytes),
    }
    Ok(())
}
