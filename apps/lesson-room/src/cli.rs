use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use lesson_room_core::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "lesson-room",
    about = "Join a tutoring lesson room as a peer-to-peer video participant",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "LESSON_ROOM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "LESSON_ROOM_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a lesson room and stay until Ctrl-C or the session ends
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(long, value_name = "ID", help = "Lesson id")]
    pub lesson: u64,

    #[arg(long, value_name = "ID", env = "LESSON_ROOM_USER_ID", help = "Local user id")]
    pub user: u64,

    #[arg(
        long,
        value_name = "TOKEN",
        env = "LESSON_ROOM_TOKEN",
        hide_env_values = true,
        help = "Bearer token for the REST API and signaling"
    )]
    pub token: String,

    #[arg(
        long = "refresh-token",
        value_name = "TOKEN",
        env = "LESSON_ROOM_REFRESH_TOKEN",
        hide_env_values = true,
        help = "Refresh token used to renew the bearer token after it expires"
    )]
    pub refresh_token: Option<String>,
}
