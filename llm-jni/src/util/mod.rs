pub mod cmd;

use std::sync::Once;
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

static LOGGING: Once = Once::new();

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// Installs the fmt subscriber. `RUST_LOG` overrides the default level.
///
/// Safe to call more than once; only the first call has an effect, and a
/// subscriber installed by someone else is left alone.
pub fn init_logging() {
    init_logging_with(if cfg!(debug_assertions) { Level::DEBUG } else { Level::INFO });
}

pub fn init_logging_with(default_level: Level) {
    LOGGING.call_once(|| {
        #[cfg(not(debug_assertions))]
        let result = tracing_subscriber::fmt()
            .with_env_filter(env_filter(default_level))
            .with_ansi(!cfg!(windows))
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init();

        // Debug builds: show thread info, file, and line number
        #[cfg(debug_assertions)]
        let result = tracing_subscriber::fmt()
            .with_env_filter(env_filter(default_level))
            .with_ansi(!cfg!(windows))
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .compact()
            .try_init();

        if result.is_ok() {
            debug!("Logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        init_logging_with(Level::TRACE);
    }
}
