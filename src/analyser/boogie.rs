//! Analyser for the Boogie verifier.
//!
//! Boogie prints a summary line on success; its verdict lives entirely
//! in the log text. A missing summary means the run needs attention.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use super::{read_log, AnalysisResult, Analyser};

fn summary_regex() -> &'static Regex {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    SUMMARY.get_or_init(|| {
        Regex::new(r"Boogie program verifier finished with (\d+) verified, (?P<errors>\d+) error(s)?")
            .expect("valid regex")
    })
}

pub struct BoogieAnalyser<'a> {
    result: &'a AnalysisResult,
    log: Option<String>,
}

impl<'a> BoogieAnalyser<'a> {
    pub fn new(result: &'a AnalysisResult) -> Self {
        Self {
            result,
            log: read_log(result),
        }
    }

    /// Error count from the summary line, or `None` when the log never
    /// got one (crash, kill, truncated output).
    fn reported_errors(&self) -> Option<u64> {
        let log = self.log.as_deref()?;
        let caps = summary_regex().captures(log)?;
        caps["errors"].parse().ok()
    }
}

impl Analyser for BoogieAnalyser<'_> {
    fn found_bug(&self) -> Option<bool> {
        match self.reported_errors() {
            Some(errors) => Some(errors > 0),
            None => {
                warn!(program = %self.result.program.display(), "no verifier summary in log");
                None
            }
        }
    }

    fn failed(&self) -> bool {
        if self.result.out_of_memory {
            return true;
        }
        match self.result.exit_code {
            // killed on timeout; not a failure by itself
            None => false,
            Some(0) => self.reported_errors().is_none(),
            Some(_) => true,
        }
    }

    fn timed_out(&self) -> bool {
        self.result.backend_timeout
    }

    fn ran_out_of_memory(&self) -> bool {
        self.result.out_of_memory
    }
}
