//! Stage results and the reports attached to them.

use serde::{Deserialize, Serialize};

use crate::stage::StageKind;
use crate::state::PhaseOutcome;

/// Final outcome of one stage (or of the dependency fetch).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Passed,
    Failed,
    /// Failed, but the stage allows failure.
    AdvisoryFailed,
    Cancelled,
}

impl StageOutcome {
    pub fn phase_outcome(&self) -> PhaseOutcome {
        match self {
            StageOutcome::Passed => PhaseOutcome::Succeeded,
            StageOutcome::Failed => PhaseOutcome::Failed,
            StageOutcome::AdvisoryFailed => PhaseOutcome::AdvisoryFailure,
            StageOutcome::Cancelled => PhaseOutcome::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Passed => "passed",
            StageOutcome::Failed => "failed",
            StageOutcome::AdvisoryFailed => "advisory_failed",
            StageOutcome::Cancelled => "cancelled",
        }
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// The dependency could not be resolved. Fatal.
    FetchError { reason: String },

    /// Sources do not match the formatter configuration. Advisory.
    FormatViolation { files: Vec<String> },

    /// Compilation failed. Fatal; the test stage never runs.
    BuildError {
        exit_code: Option<i32>,
        reason: String,
    },

    /// At least one test failed. Fatal.
    TestFailure {
        exit_code: Option<i32>,
        failed: Vec<String>,
        reason: String,
    },
}

impl StageFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            StageFailure::FetchError { .. } => "fetch_error",
            StageFailure::FormatViolation { .. } => "format_violation",
            StageFailure::BuildError { .. } => "build_error",
            StageFailure::TestFailure { .. } => "test_failure",
        }
    }

    pub fn summary(&self) -> String {
        match self {
            StageFailure::FetchError { reason } => format!("fetch error: {reason}"),
            StageFailure::FormatViolation { files } if files.is_empty() => {
                "format violation".to_string()
            }
            StageFailure::FormatViolation { files } => {
                format!("format violation in {} file(s)", files.len())
            }
            StageFailure::BuildError { reason, .. } => format!("build error: {reason}"),
            StageFailure::TestFailure { failed, reason, .. } if failed.is_empty() => {
                format!("test failure: {reason}")
            }
            StageFailure::TestFailure { failed, .. } => {
                format!("test failure: {}", failed.join(", "))
            }
        }
    }
}

/// One command executed as part of a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRecord {
    pub command: String,

    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,

    pub duration_ms: u64,
}

impl CommandRecord {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A file reported by the formatter, with the lines it would change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MisformattedFile {
    pub path: String,
    pub lines: Vec<u32>,
}

/// Output of the formatter gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatReport {
    pub files: Vec<MisformattedFile>,

    /// The formatter's diff output, verbatim.
    pub diff: String,
}

impl FormatReport {
    pub fn is_clean(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub status: TestStatus,
}

/// Per-test outcomes and toolchain versions from the test stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestReport {
    pub cases: Vec<TestCase>,

    /// Version lines printed by the toolchain probes.
    pub toolchain: Vec<String>,
}

impl TestReport {
    pub fn passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    pub fn ignored(&self) -> usize {
        self.count(TestStatus::Ignored)
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.cases
            .iter()
            .filter(|c| c.status == TestStatus::Failed)
            .map(|c| c.name.clone())
            .collect()
    }

    fn count(&self, status: TestStatus) -> usize {
        self.cases.iter().filter(|c| c.status == status).count()
    }
}

/// Stage-specific report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "report", rename_all = "snake_case")]
pub enum StageDetail {
    #[default]
    None,
    Format(FormatReport),
    Test(TestReport),
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub stage: StageKind,

    /// Exit code of the last command run (0 = success).
    pub exit_code: Option<i32>,

    /// Whether a failure of this stage halts the run.
    pub blocking: bool,

    pub outcome: StageOutcome,

    pub failure: Option<StageFailure>,

    pub commands: Vec<CommandRecord>,

    /// Captured stdout, each command prefixed by a `$ <command>` line.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    pub detail: StageDetail,
}

impl StageResult {
    pub fn name(&self) -> &'static str {
        self.stage.name()
    }

    /// Whether this stage passed outright.
    pub fn passed(&self) -> bool {
        self.outcome == StageOutcome::Passed
    }

    pub fn format_report(&self) -> Option<&FormatReport> {
        match &self.detail {
            StageDetail::Format(report) => Some(report),
            _ => None,
        }
    }

    pub fn test_report(&self) -> Option<&TestReport> {
        match &self.detail {
            StageDetail::Test(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: StageOutcome) -> StageResult {
        StageResult {
            stage: StageKind::Build,
            exit_code: Some(0),
            blocking: true,
            outcome,
            failure: None,
            commands: vec![],
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
            detail: StageDetail::None,
        }
    }

    #[test]
    fn test_stage_result_passed() {
        assert!(result(StageOutcome::Passed).passed());
        assert!(!result(StageOutcome::AdvisoryFailed).passed());
        assert!(!result(StageOutcome::Failed).passed());
    }

    #[test]
    fn test_outcome_maps_to_phase() {
        assert_eq!(
            StageOutcome::AdvisoryFailed.phase_outcome(),
            PhaseOutcome::AdvisoryFailure
        );
        assert_eq!(StageOutcome::Cancelled.phase_outcome(), PhaseOutcome::Cancelled);
    }

    #[test]
    fn test_report_counts() {
        let report = TestReport {
            cases: vec![
                TestCase {
                    name: "a".to_string(),
                    status: TestStatus::Passed,
                },
                TestCase {
                    name: "b".to_string(),
                    status: TestStatus::Failed,
                },
                TestCase {
                    name: "c".to_string(),
                    status: TestStatus::Ignored,
                },
            ],
            toolchain: vec![],
        };
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.ignored(), 1);
        assert_eq!(report.failed_names(), vec!["b"]);
    }

    #[test]
    fn test_failure_summary() {
        let failure = StageFailure::TestFailure {
            exit_code: Some(101),
            failed: vec!["tests::one".to_string(), "tests::two".to_string()],
            reason: "exit code 101".to_string(),
        };
        assert_eq!(failure.kind(), "test_failure");
        assert_eq!(failure.summary(), "test failure: tests::one, tests::two");

        let failure = StageFailure::FormatViolation {
            files: vec!["src/lib.rs".to_string()],
        };
        assert_eq!(failure.summary(), "format violation in 1 file(s)");
    }

    #[test]
    fn test_failure_serde_tag() {
        let failure = StageFailure::BuildError {
            exit_code: Some(101),
            reason: "exit code 101".to_string(),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "build_error");
        assert_eq!(json["exit_code"], 101);
    }
}
