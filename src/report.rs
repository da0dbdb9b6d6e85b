//! Per-program records and the batch report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::info;

use crate::analyser::AnalysisResult;
use crate::classify::Outcome;
use crate::error::ReportError;

/// One line of the report: the full analysis for a program, or a minimal
/// error entry when the job never produced a result.
#[derive(Debug, Clone)]
pub enum ProgramRecord {
    Completed(AnalysisResult),
    Error { program: PathBuf, error: String },
}

impl ProgramRecord {
    pub fn completed(result: AnalysisResult) -> Self {
        ProgramRecord::Completed(result)
    }

    pub fn error(program: PathBuf, error: impl Into<String>) -> Self {
        ProgramRecord::Error {
            program,
            error: error.into(),
        }
    }

    pub fn program(&self) -> &Path {
        match self {
            ProgramRecord::Completed(result) => &result.program,
            ProgramRecord::Error { program, .. } => program,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProgramRecord::Error { .. })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ProgramRecord::Completed(result) => Some(result.outcome()),
            ProgramRecord::Error { .. } => None,
        }
    }
}

impl Serialize for ProgramRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // the outcome tag is derived at write time, so the stored
            // fields and the tag can never disagree
            ProgramRecord::Completed(analysis) => {
                let value =
                    serde_json::to_value(analysis).map_err(serde::ser::Error::custom)?;
                let serde_json::Value::Object(mut map) = value else {
                    return Err(serde::ser::Error::custom(
                        "analysis result must serialize to a map",
                    ));
                };
                map.insert(
                    "result".to_string(),
                    serde_json::to_value(analysis.outcome())
                        .map_err(serde::ser::Error::custom)?,
                );
                map.serialize(serializer)
            }
            ProgramRecord::Error { program, error } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("program", program)?;
                map.serialize_entry("error", error)?;
                map.end()
            }
        }
    }
}

/// Ordered collection of per-program records for one batch run.
#[derive(Debug, Clone)]
pub struct Report {
    pub created_at: DateTime<Utc>,
    pub records: Vec<ProgramRecord>,
}

impl Report {
    pub fn new(records: Vec<ProgramRecord>) -> Self {
        Self {
            created_at: Utc::now(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.records.iter().filter(|rec| rec.is_error()).count()
    }

    /// Writes the records as a YAML list. Refuses to overwrite: batch
    /// results are too expensive to lose to a path collision.
    pub fn write_yaml(&self, path: &Path) -> Result<(), ReportError> {
        if path.exists() {
            return Err(ReportError::PathExists(path.to_path_buf()));
        }
        let mut output = format!("# report created at {}\n", self.created_at.to_rfc3339());
        output.push_str(&serde_yaml::to_string(&self.records)?);
        std::fs::write(path, output)?;
        info!(path = %path.display(), records = self.records.len(), "report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::testutil::result_with_log;
    use tempfile::TempDir;

    #[test]
    fn test_completed_record_carries_derived_result_tag() {
        let (mut analysis, _log) = result_with_log("");
        analysis.bug_found = Some(true);
        let record = ProgramRecord::completed(analysis);

        let yaml = serde_yaml::to_string(&record).unwrap();
        assert!(yaml.contains("result: BUG_FOUND"));
        assert!(yaml.contains("program:"));
    }

    #[test]
    fn test_error_record_is_minimal() {
        let record = ProgramRecord::error(PathBuf::from("/corpus/a.bpl"), "spawn failed");
        let value = serde_json::to_value(&record).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["error"], "spawn failed");
        assert!(record.outcome().is_none());
    }

    #[test]
    fn test_write_yaml_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.yml");
        let report = Report::new(vec![ProgramRecord::error(
            PathBuf::from("/corpus/a.bpl"),
            "boom",
        )]);

        report.write_yaml(&path).unwrap();
        let err = report.write_yaml(&path).unwrap_err();
        assert!(matches!(err, ReportError::PathExists(_)));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("error: boom"));
    }

    #[test]
    fn test_error_count() {
        let (analysis, _log) = result_with_log("");
        let report = Report::new(vec![
            ProgramRecord::completed(analysis),
            ProgramRecord::error(PathBuf::from("/corpus/b.bpl"), "x"),
            ProgramRecord::error(PathBuf::from("/corpus/c.bpl"), "y"),
        ]);
        assert_eq!(report.len(), 3);
        assert_eq!(report.error_count(), 2);
    }
}
