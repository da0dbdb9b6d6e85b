//! Analyser for the Symbooglix symbolic execution engine.
//!
//! Unlike the log-scraping analysers, Symbooglix communicates its result
//! through a documented exit-code table, and it manages its own deadline:
//! the harness hands it a soft timeout shorter than the hard wall-clock
//! limit. Construction therefore requires the soft timeout and the tool's
//! output directory to be present.

use std::path::PathBuf;

use tracing::error;

use super::{AnalysisResult, Analyser};
use crate::error::JobError;

// from the tool's exit-code table
const ERRORS_NO_TIMEOUT: i64 = 2;
const NO_ERRORS_TIMEOUT: i64 = 3;
const ERRORS_TIMEOUT: i64 = 4;
const NO_ERRORS_BUT_SPECULATIVE_PATHS: i64 = 9;
const NO_ERRORS_BUT_HIT_BOUND: i64 = 10;

/// File Symbooglix writes its executor statistics to, inside its output
/// directory.
const EXECUTOR_INFO_FILE: &str = "executor_info.yml";

pub struct SymbooglixAnalyser<'a> {
    result: &'a AnalysisResult,
    soft_timeout: f64,
    sbx_dir: PathBuf,
}

impl<'a> SymbooglixAnalyser<'a> {
    pub fn new(result: &'a AnalysisResult) -> Result<Self, JobError> {
        let soft_timeout = result
            .soft_timeout
            .ok_or(JobError::MissingFact("soft_timeout"))?;
        let sbx_dir = result
            .sbx_dir
            .clone()
            .ok_or(JobError::MissingFact("sbx_dir"))?;
        Ok(Self {
            result,
            soft_timeout,
            sbx_dir,
        })
    }

    /// Parsed `executor_info.yml`, or `None` when the tool never wrote
    /// one (crash, kill) or the file does not parse.
    fn executor_info(&self) -> Option<serde_yaml::Value> {
        let path = self.sbx_dir.join(EXECUTOR_INFO_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                error!(path = %path.display(), error = %err, "could not read executor info");
                return None;
            }
        };
        match serde_yaml::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(path = %path.display(), error = %err, "could not parse executor info");
                None
            }
        }
    }

    fn instructions_executed(&self) -> Option<u64> {
        self.executor_info()?
            .get("instructions_executed")
            .and_then(serde_yaml::Value::as_u64)
    }
}

impl Analyser for SymbooglixAnalyser<'_> {
    fn found_bug(&self) -> Option<bool> {
        if self.result.backend_timeout {
            // killed before it could report; the exit code says nothing
            return None;
        }
        match self.result.exit_code {
            Some(ERRORS_NO_TIMEOUT) | Some(ERRORS_TIMEOUT) => Some(true),
            Some(0)
            | Some(NO_ERRORS_TIMEOUT)
            | Some(NO_ERRORS_BUT_SPECULATIVE_PATHS)
            | Some(NO_ERRORS_BUT_HIT_BOUND) => Some(false),
            _ => None,
        }
    }

    fn failed(&self) -> bool {
        if self.result.out_of_memory {
            return true;
        }
        if self.timed_out() {
            return false;
        }
        match self.result.exit_code {
            // speculative paths mean the answer cannot be trusted
            Some(NO_ERRORS_BUT_SPECULATIVE_PATHS) => true,
            Some(NO_ERRORS_BUT_HIT_BOUND) => false,
            Some(code) => code > ERRORS_TIMEOUT || code == 1,
            None => false,
        }
    }

    /// Timeouts surface three ways: the backend's hard kill, the tool's
    /// own timeout exit codes, or a runtime past the soft deadline.
    fn timed_out(&self) -> bool {
        if self.result.backend_timeout {
            return true;
        }
        if matches!(
            self.result.exit_code,
            Some(NO_ERRORS_TIMEOUT) | Some(ERRORS_TIMEOUT)
        ) {
            return true;
        }
        self.result.total_time > self.soft_timeout
    }

    fn ran_out_of_memory(&self) -> bool {
        self.result.out_of_memory
    }

    fn extra_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut extra = serde_json::Map::new();
        extra.insert(
            "bound_hit".to_string(),
            serde_json::Value::Bool(self.result.exit_code == Some(NO_ERRORS_BUT_HIT_BOUND)),
        );
        extra.insert(
            "speculative_paths_no_bug".to_string(),
            serde_json::Value::Bool(
                self.result.exit_code == Some(NO_ERRORS_BUT_SPECULATIVE_PATHS),
            ),
        );
        extra.insert(
            "instructions_executed".to_string(),
            self.instructions_executed()
                .map_or(serde_json::Value::Null, serde_json::Value::from),
        );
        extra
    }
}
