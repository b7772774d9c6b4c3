//! CLI command implementations.

pub mod classify;
pub mod run;
pub mod tables;

use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// Bad command-line input.
    #[error("{0}")]
    Usage(String),

    /// The engine failed.
    #[error(transparent)]
    Engine(#[from] groupsync_engine::SyncError),

    /// A machine table failed validation.
    #[error(transparent)]
    Table(#[from] groupsync_engine::fsm::FsmError),

    /// Output could not be rendered.
    #[error("output: {0}")]
    Output(#[from] serde_json::Error),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Checks an output format argument.
pub fn check_format(format: &str) -> CliResult<bool> {
    match format {
        "text" => Ok(false),
        "json" => Ok(true),
        other => Err(CliError::Usage(format!("unknown format {other:?}, expected text or json"))),
    }
}
