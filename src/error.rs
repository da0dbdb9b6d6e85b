//! Error types for veribench operations.
//!
//! Errors are split by subsystem:
//! - Configuration validation (fails before any process is spawned)
//! - Backend execution (process and container infrastructure)
//! - Job execution and output analysis
//! - Report writing

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating configuration.
///
/// These always propagate to the batch caller; nothing is spawned when
/// configuration is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Program path '{0}' must be absolute")]
    ProgramPathNotAbsolute(PathBuf),

    #[error("Program '{0}' does not exist or is not a file")]
    ProgramNotFound(PathBuf),

    #[error("Tool path '{0}' must be absolute")]
    ToolPathNotAbsolute(PathBuf),

    #[error("Tool '{tool}' is not available: {reason}")]
    ToolUnavailable { tool: PathBuf, reason: String },

    #[error("Mono executable path '{0}' must be absolute")]
    MonoPathNotAbsolute(PathBuf),

    #[error("Working directory '{path}' {reason}")]
    WorkingDirectory { path: PathBuf, reason: String },

    #[error("Time limit {hard}s leaves no room for the {grace}s shutdown grace period of {tool}")]
    SoftTimeoutTooSmall { tool: String, hard: u64, grace: u64 },

    #[error("{tool} reserves a shutdown grace period and therefore requires a finite time limit")]
    UnlimitedTimeWithGrace { tool: String },

    #[error("Argument '{arg}' is managed by the harness and must not be passed to {tool}")]
    ReservedArgument { tool: String, arg: String },

    #[error("Memory poll period must be greater than zero")]
    InvalidPollPeriod,

    #[error("No entry point found in '{program}' with boolean attribute '{attribute}'")]
    EntryPointNotFound { program: PathBuf, attribute: String },

    #[error("Invalid entry point attribute '{0}': must be a non-empty identifier")]
    InvalidEntryPointAttribute(String),

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Expected exactly one image matching '{reference}', found {found}")]
    ImageResolution { reference: String, found: usize },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Parallelism must be at least 1")]
    InvalidParallelism,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the execution backends.
///
/// Tool failures, timeouts and memory kills are not errors; they are
/// captured inside `BackendResult`. Only cancellation and infrastructure
/// problems surface here.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Empty command line")]
    EmptyCommandLine,

    #[error("Tool '{tool}' not found in {location}")]
    ToolMissing { tool: PathBuf, location: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Invalid backend result: {0}")]
    InvalidResult(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from running a single job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Missing execution fact '{0}' required by the analyser")]
    MissingFact(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// True when the job stopped because the run was cancelled rather
    /// than because something went wrong.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Backend(BackendError::Cancelled))
    }
}

/// Errors writing the batch report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report path already exists: {0}")]
    PathExists(PathBuf),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
