use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use common::HistoryTurn;

/// Chat with a local model through the streaming bridge.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML file supplying defaults for any flag not given on the command line
    #[arg(long, env = "LLM_CHAT_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Session config JSON (model path, sampling, context size)
    #[arg(short, long, env = "LLM_CHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// User message for this turn
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// System prompt placed before the history
    #[arg(long)]
    pub system: Option<String>,

    /// JSON file with prior turns: [{"role": "...", "content": "..."}]
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Token budget; omitted or 0 uses the session default
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Print the whole response at once instead of streaming it
    #[arg(long)]
    pub blocking: bool,

    /// Cancel generation after this many milliseconds
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,
}

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Values a settings file may supply.
#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct Settings {
    config: Option<PathBuf>,
    prompt: Option<String>,
    system: Option<String>,
    history: Option<PathBuf>,
    max_tokens: Option<usize>,
    blocking: Option<bool>,
    cancel_after_ms: Option<u64>,
    log_level: Option<LogLevel>,
}

impl Args {
    /// Fills unset flags from `--settings` and checks that a config and a
    /// prompt are known.
    pub fn load_config(mut self) -> Result<Self> {
        if let Some(path) = self.settings.clone() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings {}", path.display()))?;
            let settings: Settings =
                toml::from_str(&raw).with_context(|| format!("invalid settings {}", path.display()))?;
            let base = path.parent().unwrap_or(Path::new(""));

            self.config = self.config.or(settings.config.map(|p| base.join(p)));
            self.history = self.history.or(settings.history.map(|p| base.join(p)));
            self.prompt = self.prompt.or(settings.prompt);
            self.system = self.system.or(settings.system);
            self.max_tokens = self.max_tokens.or(settings.max_tokens);
            self.cancel_after_ms = self.cancel_after_ms.or(settings.cancel_after_ms);
            self.log_level = self.log_level.or(settings.log_level);
            self.blocking |= settings.blocking.unwrap_or(false);
        }

        if self.config.is_none() {
            return Err(anyhow!("no session config given; pass --config or set it in --settings"));
        }
        if self.prompt.is_none() {
            return Err(anyhow!("no prompt given; pass --prompt or set it in --settings"));
        }
        Ok(self)
    }

    /// System prompt, prior turns, then the new user message.
    pub fn history_turns(&self) -> Result<Vec<HistoryTurn>> {
        let mut turns = Vec::new();
        if let Some(system) = &self.system {
            turns.push(HistoryTurn::system(system.clone()));
        }
        if let Some(path) = &self.history {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read history {}", path.display()))?;
            let prior: Vec<HistoryTurn> =
                serde_json::from_str(&raw).with_context(|| format!("invalid history {}", path.display()))?;
            turns.extend(prior);
        }
        if let Some(prompt) = &self.prompt {
            turns.push(HistoryTurn::user(prompt.clone()));
        }
        Ok(turns)
    }
}
