//! Structured per-stage results, emitted as a JUnit document when `--junit`
//! is given.

use crate::utils::error::KciError;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub name: String,
    pub elapsed: Duration,
    /// JSON snapshot of the post-stage state, carried as the case's stdout.
    pub snapshot: String,
    pub failure: Option<String>,
}

impl StageResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elapsed: Duration::ZERO,
            snapshot: String::new(),
            failure: None,
        }
    }
}

/// Write one test case per stage into `{dir}/{subcommand}.xml`.
pub fn write_report(
    results: &[StageResult],
    dir: &Path,
    subcommand: &str,
) -> Result<PathBuf, KciError> {
    let mut suite = TestSuite::new("kci");
    for result in results {
        let status = match &result.failure {
            Some(reason) => {
                let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                status.set_message(reason.clone());
                status
            }
            None => TestCaseStatus::success(),
        };
        let mut case = TestCase::new(result.name.clone(), status);
        case.set_time(result.elapsed);
        case.set_system_out(result.snapshot.clone());
        suite.add_test_case(case);
    }

    let mut report = Report::new("kci");
    report.add_test_suite(suite);

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.xml", subcommand));
    let serialized = report
        .to_string()
        .map_err(|e| KciError::parse(format!("Failed to serialize junit report: {}", e)))?;
    std::fs::write(&path, serialized)?;
    tracing::debug!("junit report written to {}", path.display());
    Ok(path)
}
