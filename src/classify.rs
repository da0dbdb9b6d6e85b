//! Canonical outcome classification.
//!
//! Collapses the per-tool analysis fields into one coarse tag that is
//! comparable across tools. The tag is always derived on demand from the
//! stored fields and never persisted alongside them, so the two cannot
//! drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::analyser::AnalysisResult;

/// Canonical cross-tool outcome of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Tool covered all behaviour without finding a defect.
    FullyExplored,
    /// No defect found, but exploration stopped at a configured bound.
    BoundHit,
    /// Tool reported a confirmed defect.
    BugFound,
    /// Tool ran out of time without failing otherwise.
    TimedOut,
    /// Tool was killed for exceeding the memory limit.
    OutOfMemory,
    /// Anything else; results needing human attention.
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Outcome::FullyExplored => "FULLY_EXPLORED",
            Outcome::BoundHit => "BOUND_HIT",
            Outcome::BugFound => "BUG_FOUND",
            Outcome::TimedOut => "TIMED_OUT",
            Outcome::OutOfMemory => "OUT_OF_MEMORY",
            Outcome::Unknown => "UNKNOWN",
        };
        write!(f, "{tag}")
    }
}

/// Maps analysis fields to one outcome. Total and deterministic; rules
/// are checked in order and the first match wins.
pub fn classify(result: &AnalysisResult) -> Outcome {
    if !result.failed && !result.timeout_hit && result.bug_found == Some(false) {
        return if result.bound_hit() {
            Outcome::BoundHit
        } else {
            Outcome::FullyExplored
        };
    }
    if result.bug_found == Some(true) {
        if result.failed || result.timeout_hit {
            // a bug verdict combined with failure or timeout means the
            // analyser itself is broken; keep the verdict, flag loudly
            error!(
                program = %result.program.display(),
                failed = result.failed,
                timeout_hit = result.timeout_hit,
                "bug reported alongside failure or timeout flags"
            );
        }
        return Outcome::BugFound;
    }
    if result.timeout_hit && !result.failed {
        return Outcome::TimedOut;
    }
    if result.out_of_memory {
        return Outcome::OutOfMemory;
    }
    Outcome::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn result(
        bug_found: Option<bool>,
        failed: bool,
        timeout_hit: bool,
        out_of_memory: bool,
    ) -> AnalysisResult {
        AnalysisResult {
            program: PathBuf::from("/corpus/a.bpl"),
            total_time: 1.0,
            working_directory: PathBuf::from("/tmp/wd"),
            exit_code: Some(0),
            out_of_memory,
            log_file: PathBuf::from("/tmp/wd/log.txt"),
            backend_timeout: false,
            soft_timeout: None,
            sbx_dir: None,
            bug_found,
            failed,
            timeout_hit,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_clean_exploration() {
        assert_eq!(
            classify(&result(Some(false), false, false, false)),
            Outcome::FullyExplored
        );
    }

    #[test]
    fn test_bound_hit_splits_clean_exploration() {
        let mut clean = result(Some(false), false, false, false);
        clean
            .extra
            .insert("bound_hit".to_string(), serde_json::Value::Bool(true));
        assert_eq!(classify(&clean), Outcome::BoundHit);
    }

    #[test]
    fn test_bug_found_wins_even_with_flags_set() {
        assert_eq!(
            classify(&result(Some(true), false, false, false)),
            Outcome::BugFound
        );
        // contradictory flags never reclassify a bug verdict
        assert_eq!(
            classify(&result(Some(true), true, false, false)),
            Outcome::BugFound
        );
        assert_eq!(
            classify(&result(Some(true), false, true, false)),
            Outcome::BugFound
        );
    }

    #[test]
    fn test_timeout_requires_no_failure() {
        assert_eq!(
            classify(&result(None, false, true, false)),
            Outcome::TimedOut
        );
        assert_eq!(classify(&result(None, true, true, false)), Outcome::Unknown);
    }

    #[test]
    fn test_out_of_memory() {
        assert_eq!(
            classify(&result(None, true, false, true)),
            Outcome::OutOfMemory
        );
        // timeout without failure is checked first
        assert_eq!(
            classify(&result(None, false, true, true)),
            Outcome::TimedOut
        );
    }

    #[test]
    fn test_everything_else_is_unknown() {
        assert_eq!(
            classify(&result(None, false, false, false)),
            Outcome::Unknown
        );
        assert_eq!(
            classify(&result(Some(false), true, false, false)),
            Outcome::Unknown
        );
    }

    #[test]
    fn test_classification_is_total() {
        // every combination of flags yields some outcome without panicking
        for bug in [None, Some(true), Some(false)] {
            for failed in [false, true] {
                for timeout in [false, true] {
                    for oom in [false, true] {
                        let _ = classify(&result(bug, failed, timeout, oom));
                    }
                }
            }
        }
    }

    #[test]
    fn test_serialized_tags_are_screaming_snake_case() {
        let yaml = serde_yaml::to_string(&Outcome::FullyExplored).unwrap();
        assert_eq!(yaml.trim(), "FULLY_EXPLORED");
        assert_eq!(Outcome::OutOfMemory.to_string(), "OUT_OF_MEMORY");
    }
}
