//! veribench: benchmark harness for program-verification tools.
//!
//! Runs verification tools over corpora of input programs under
//! wall-clock, memory and stack limits, either directly on the host or
//! inside a Docker container, and normalizes each tool's output into a
//! canonical outcome tag that is comparable across tools.

pub mod analyser;
pub mod backend;
pub mod cancel;
pub mod classify;
pub mod entry_point;
pub mod error;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod tools;

pub use analyser::AnalysisResult;
pub use backend::{Backend, BackendResult, BackendSpec, ResourceLimits};
pub use cancel::CancellationToken;
pub use classify::Outcome;
pub use error::{BackendError, ConfigError, JobError, ReportError};
pub use job::{EntryPointRule, Job, JobConfig};
pub use orchestrator::{BatchRun, Orchestrator, RunContext, RunState};
pub use report::{ProgramRecord, Report};
pub use tools::ToolKind;
