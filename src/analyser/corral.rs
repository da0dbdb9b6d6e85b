//! Analyser for the Corral bounded model checker.
//!
//! Corral's verdict is a literal line in its log. It also reports when
//! exploration stopped at the configured recursion bound, which keeps a
//! "no bug" verdict from being read as full coverage.

use tracing::warn;

use super::{read_log, AnalysisResult, Analyser};

const BUG_LINE: &str = "Program has a potential bug: True bug";
const BOUND_LINE: &str = "Reached recursion bound of";

pub struct CorralAnalyser<'a> {
    result: &'a AnalysisResult,
    log: Option<String>,
}

impl<'a> CorralAnalyser<'a> {
    pub fn new(result: &'a AnalysisResult) -> Self {
        Self {
            result,
            log: read_log(result),
        }
    }

    /// Tri-state like the bug verdict: `None` when the log is unreadable.
    fn hit_recursion_bound(&self) -> Option<bool> {
        self.log.as_deref().map(|log| log.contains(BOUND_LINE))
    }
}

impl Analyser for CorralAnalyser<'_> {
    fn found_bug(&self) -> Option<bool> {
        match self.log.as_deref() {
            Some(log) => Some(log.contains(BUG_LINE)),
            None => {
                warn!(program = %self.result.program.display(), "log unreadable, verdict unknown");
                None
            }
        }
    }

    fn failed(&self) -> bool {
        if self.result.out_of_memory {
            return true;
        }
        match self.result.exit_code {
            None => false,
            Some(0) => false,
            Some(_) => true,
        }
    }

    fn timed_out(&self) -> bool {
        self.result.backend_timeout
    }

    fn ran_out_of_memory(&self) -> bool {
        self.result.out_of_memory
    }

    fn extra_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut extra = serde_json::Map::new();
        extra.insert(
            "bound_hit".to_string(),
            serde_json::to_value(self.hit_recursion_bound()).unwrap_or(serde_json::Value::Null),
        );
        extra
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::result_with_log;
    use super::*;
    use crate::classify::Outcome;
    use crate::tools::ToolKind;

    #[test]
    fn test_true_bug_line() {
        let (result, _log) = result_with_log("Program has a potential bug: True bug\n");
        let analyser = CorralAnalyser::new(&result);
        assert_eq!(analyser.found_bug(), Some(true));
        assert!(!analyser.failed());
    }

    #[test]
    fn test_no_bug_without_bound() {
        let (mut result, _log) = result_with_log("No bugs found\n");
        super::super::run_analysis(ToolKind::Corral, &mut result).unwrap();
        assert_eq!(result.bug_found, Some(false));
        assert!(!result.bound_hit());
        assert_eq!(result.outcome(), Outcome::FullyExplored);
    }

    #[test]
    fn test_no_bug_at_recursion_bound() {
        let (mut result, _log) = result_with_log("Reached recursion bound of 4\nNo bugs found\n");
        super::super::run_analysis(ToolKind::Corral, &mut result).unwrap();
        assert_eq!(result.bug_found, Some(false));
        assert!(result.bound_hit());
        assert_eq!(result.outcome(), Outcome::BoundHit);
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let (mut result, _log) = result_with_log("stack trace...\n");
        result.exit_code = Some(1);
        let analyser = CorralAnalyser::new(&result);
        assert!(analyser.failed());
        assert_eq!(analyser.found_bug(), Some(false));
    }

    #[test]
    fn test_unreadable_log_is_unknown() {
        let (mut result, log) = result_with_log("");
        drop(log);
        result.log_file = std::path::PathBuf::from("/nonexistent/log.txt");

        let analyser = CorralAnalyser::new(&result);
        assert_eq!(analyser.found_bug(), None);
        assert_eq!(analyser.hit_recursion_bound(), None);
    }
}
