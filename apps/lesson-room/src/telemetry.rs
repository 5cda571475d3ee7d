//! Subscriber setup for the binary. Everything this crate logs sits under the
//! `lesson_room` target tree and follows `--log-level`; the media, websocket
//! and HTTP stacks stay at `warn` unless `LESSON_ROOM_TRACE_DEPS` is set.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const ROOT_TARGET: &str = "lesson_room";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Filter directives: the session at the requested level, every other
    /// target capped at `warn` unless `verbose_deps`.
    pub fn directives(&self, verbose_deps: bool) -> String {
        let others = if verbose_deps {
            self.level
        } else {
            self.level.min(LogLevel::Warn)
        };
        format!("{},{ROOT_TARGET}={}", others.as_str(), self.level.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid LESSON_ROOM_LOG_FILTER: {0}")]
    Filter(String),
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var("LESSON_ROOM_LOG_FILTER") {
        Ok(raw) if !raw.trim().is_empty() => {
            EnvFilter::try_new(raw.trim()).map_err(|err| InitError::Filter(err.to_string()))?
        }
        _ => EnvFilter::new(config.directives(env_flag("LESSON_ROOM_TRACE_DEPS"))),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !matches!(value.trim(), "" | "0" | "false"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel) -> LogConfig {
        LogConfig { level, file: None }
    }

    #[test]
    fn session_follows_level_while_dependencies_stay_quiet() {
        assert_eq!(
            config(LogLevel::Trace).directives(false),
            "warn,lesson_room=trace"
        );
        assert_eq!(config(LogLevel::Info).directives(false), "warn,lesson_room=info");
        assert_eq!(
            config(LogLevel::Error).directives(false),
            "error,lesson_room=error"
        );
    }

    #[test]
    fn verbose_dependencies_follow_the_session_level() {
        assert_eq!(
            config(LogLevel::Debug).directives(true),
            "debug,lesson_room=debug"
        );
    }

    #[test]
    fn directives_parse_as_env_filter() {
        for level in [LogLevel::Error, LogLevel::Trace] {
            assert!(EnvFilter::try_new(config(level).directives(false)).is_ok());
        }
    }
}
