//! Diagnostics setup.
//!
//! The engine logs through `tracing`. Slurm levels map onto it as follows:
//! error and info keep their name, verbose is `info`, debug is `debug`, and
//! debug2/debug3 are `trace`.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Variable holding an `EnvFilter` directive, e.g. `spank_stack=debug`.
pub const SPANK_LOG_ENV: &str = "SPANK_LOG";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Info,
    Verbose,
    Debug,
    Debug2,
    Debug3,
}

impl LogLevel {
    pub fn tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Info | LogLevel::Verbose => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Debug2 | LogLevel::Debug3 => Level::TRACE,
        }
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(SPANK_LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level.tracing_level().to_string()))
}

/// Sends engine diagnostics to stderr. `$SPANK_LOG` overrides `level`.
///
/// Returns false when a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_logging(level: LogLevel) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}
