//! Tracing setup for Backwash
//!
//! The console shows relay events at the operator's level and only warnings
//! from the HTTP stack underneath. A per-run file under `logs/` keeps the
//! relay crates at trace, which is where per-chunk fan-out and eviction
//! detail ends up.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Log targets of the relay's own crates, binary included.
const RELAY_TARGETS: [&str; 3] = ["backwash", "backwash_core", "backwash_web"];

/// Filter directives raising the relay crates to `relay_level` over a
/// `base` level for everything else.
fn relay_directives(base: Level, relay_level: Level) -> String {
    let mut directives = base.to_string().to_lowercase();
    for target in RELAY_TARGETS {
        directives.push_str(&format!(",{target}={}", relay_level.to_string().to_lowercase()));
    }
    directives
}

/// Installs the console layer at `console_level` and writes
/// `backwash-last-run.log` in `logs_dir` (default `./logs`), replacing the
/// previous run's file. `RUST_LOG` overrides the console filter.
///
/// # Errors
///
/// - `std::io::Error` - Logs directory cannot be created or log file cannot be opened
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> std::io::Result<()> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;
    let log_file_path = logs_path.join("backwash-last-run.log");
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(relay_directives(Level::WARN, console_level)));
    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(relay_directives(Level::DEBUG, Level::TRACE)));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::debug!("Relay log file at {}", log_file_path.display());
    Ok(())
}

/// Console verbosity chosen with `--log-level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    /// Stream lifecycle, dumps, preloads and housekeeping reports
    Info,
    /// Vitals changes, listener seeding and metadata changes
    Debug,
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use backwash_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Warn.as_tracing_level(), tracing::Level::WARN);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_directives_raise_only_relay_crates() {
        assert_eq!(
            relay_directives(Level::WARN, Level::DEBUG),
            "warn,backwash=debug,backwash_core=debug,backwash_web=debug"
        );
    }

    #[test]
    fn test_directives_parse_as_filters() {
        for level in [Level::ERROR, Level::INFO, Level::TRACE] {
            assert!(EnvFilter::try_new(relay_directives(Level::WARN, level)).is_ok());
        }
    }
}
