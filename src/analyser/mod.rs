//! Per-tool interpretation of raw execution output.
//!
//! The backend reports what happened (exit code, runtime, kills); the
//! analyser decides what it means for the tool at hand. Each tool gets
//! its own analyser because they disagree about everything: where the
//! verdict lives (log text vs exit code), which exit codes are benign
//! and whether a timeout still produced a usable answer.

pub mod boogie;
pub mod corral;
pub mod symbooglix;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::classify::{classify, Outcome};
use crate::error::JobError;
use crate::tools::ToolKind;

/// Execution facts plus analyser-computed fields for one job.
///
/// The execution facts are filled in from the backend result; the
/// analyser fields start at their defaults and are overwritten by
/// [`run_analysis`]. The canonical outcome tag is never stored here; it
/// is recomputed from these fields on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub program: PathBuf,
    /// Wall-clock runtime in seconds.
    pub total_time: f64,
    pub working_directory: PathBuf,
    /// `None` exactly when the backend killed the tool on timeout.
    pub exit_code: Option<i64>,
    pub out_of_memory: bool,
    pub log_file: PathBuf,
    /// The hard wall-clock limit fired and the backend killed the tool.
    pub backend_timeout: bool,
    /// Deadline in seconds handed to the tool itself, for tools that
    /// reserve a shutdown grace period.
    pub soft_timeout: Option<f64>,
    /// Host path of the tool's own output directory, for tools that
    /// write one.
    #[serde(default)]
    pub sbx_dir: Option<PathBuf>,
    /// Tri-state verdict: `Some(true)` confirmed defect, `Some(false)`
    /// none within the explored behaviour, `None` undeterminable.
    pub bug_found: Option<bool>,
    pub failed: bool,
    pub timeout_hit: bool,
    /// Tool-specific additions such as `bound_hit`.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AnalysisResult {
    /// Canonical outcome, derived fresh from the stored fields.
    pub fn outcome(&self) -> Outcome {
        classify(self)
    }

    /// True when the tool stopped at a configured exploration bound.
    /// Absent or null extras count as false.
    pub fn bound_hit(&self) -> bool {
        self.extra
            .get("bound_hit")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Verdict extraction over one finished run.
///
/// Implementations see the complete `AnalysisResult` built so far and
/// must reject construction when a fact they depend on is missing.
pub trait Analyser {
    /// Tri-state bug verdict; `None` marks results needing attention.
    fn found_bug(&self) -> Option<bool>;

    /// True for memory kills, unexpected exit codes or a tool-internal
    /// error. Running out of time alone is not a failure.
    fn failed(&self) -> bool;

    /// True when either the backend killed the tool on the hard limit or
    /// the tool reports hitting its own deadline.
    fn timed_out(&self) -> bool;

    fn ran_out_of_memory(&self) -> bool;

    /// Tool-specific fields merged into [`AnalysisResult::extra`].
    fn extra_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }
}

/// Runs the tool's analyser over `result` and merges the computed fields
/// back in. Out-of-memory always counts as a failure, whatever the
/// analyser said.
pub fn run_analysis(tool: ToolKind, result: &mut AnalysisResult) -> Result<(), JobError> {
    let (bug_found, failed, timed_out, out_of_memory, extra) = {
        let analyser = tool.analyser(result)?;
        (
            analyser.found_bug(),
            analyser.failed(),
            analyser.timed_out(),
            analyser.ran_out_of_memory(),
            analyser.extra_fields(),
        )
    };
    result.bug_found = bug_found;
    result.failed = failed || out_of_memory;
    result.timeout_hit = timed_out;
    result.extra.extend(extra);
    Ok(())
}

/// The tool's combined output, or `None` when the log is missing or
/// unreadable. Callers map absence to an unknown verdict.
pub(crate) fn read_log(result: &AnalysisResult) -> Option<String> {
    match std::fs::read_to_string(&result.log_file) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::error!(
                log = %result.log_file.display(),
                error = %err,
                "could not read tool log"
            );
            None
        }
    }
}
