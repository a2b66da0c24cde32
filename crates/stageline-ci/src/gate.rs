//! Gate evaluation for a finished run.

use serde::{Deserialize, Serialize};
use stageline_core::{PipelineRun, StageKind, StageOutcome};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Blocking problems (empty if passed).
    pub violations: Vec<String>,

    /// Non-blocking findings, e.g. formatting.
    pub advisories: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Pass/fail rules over a [`PipelineRun`].
pub struct RunGate;

impl RunGate {
    /// Evaluate a finished run.
    ///
    /// Gate rule:
    /// - The dependency fetch, when it ran, must have passed
    /// - Every blocking stage must have run and passed
    /// - Advisory failures are reported but never fail the gate
    pub fn evaluate(run: &PipelineRun) -> GateVerdict {
        let mut violations = Vec::new();
        let mut advisories = Vec::new();

        if let Some(dependency) = run.dependency() {
            match (&dependency.outcome, &dependency.failure) {
                (StageOutcome::Passed, _) => {}
                (StageOutcome::Cancelled, _) => violations.push(format!(
                    "Dependency '{}' fetch was cancelled",
                    dependency.path.display()
                )),
                (_, Some(failure)) => violations.push(failure.summary()),
                (_, None) => violations.push(format!(
                    "Dependency '{}' was not fetched",
                    dependency.path.display()
                )),
            }
        }

        for kind in StageKind::ORDER {
            let Some(result) = run.stage(kind) else {
                violations.push(format!("Stage '{}' never ran", kind.name()));
                continue;
            };
            let summary = result
                .failure
                .as_ref()
                .map(|f| f.summary())
                .unwrap_or_else(|| format!("exit code {:?}", result.exit_code));
            match result.outcome {
                StageOutcome::Passed => {}
                StageOutcome::AdvisoryFailed => {
                    advisories.push(format!("Stage '{}' (advisory): {}", kind.name(), summary))
                }
                StageOutcome::Failed => {
                    violations.push(format!("Stage '{}' failed: {}", kind.name(), summary))
                }
                StageOutcome::Cancelled => {
                    violations.push(format!("Stage '{}' was cancelled", kind.name()))
                }
            }
        }

        if !run.succeeded() && violations.is_empty() {
            violations.push(format!("Run ended in state {}", run.state()));
        }

        let passed = violations.is_empty();
        let message = if passed && advisories.is_empty() {
            "All stages passed".to_string()
        } else if passed {
            format!("Passed with {} advisory finding(s)", advisories.len())
        } else {
            format!("{} violation(s) found", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            advisories,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageline_core::{
        DependencyResult, FormatReport, MisformattedFile, PhaseOutcome, RunIdentity,
        RunInProgress, StageDetail, StageFailure, StageResult, SubmoduleStrategy,
    };

    fn dependency(outcome: StageOutcome) -> DependencyResult {
        DependencyResult {
            path: "dynamorio".into(),
            strategy: SubmoduleStrategy::Normal,
            revision: None,
            outcome,
            failure: (outcome == StageOutcome::Failed).then(|| StageFailure::FetchError {
                reason: "repository unreachable".to_string(),
            }),
            commands: Vec::new(),
            output: String::new(),
            duration_ms: 1,
        }
    }

    fn stage(kind: StageKind, outcome: StageOutcome) -> StageResult {
        let failure = match (kind, outcome) {
            (_, StageOutcome::Passed) | (_, StageOutcome::Cancelled) => None,
            (StageKind::Format, _) => Some(StageFailure::FormatViolation {
                files: vec!["src/main.rs".to_string()],
            }),
            (StageKind::Build, _) => Some(StageFailure::BuildError {
                exit_code: Some(101),
                reason: "`cargo build --verbose`: exit code 101".to_string(),
            }),
            (StageKind::Test, _) => Some(StageFailure::TestFailure {
                exit_code: Some(101),
                failed: vec!["tracer::parses".to_string()],
                reason: "exit code 101".to_string(),
            }),
        };
        let detail = match kind {
            StageKind::Format => StageDetail::Format(FormatReport {
                files: vec![MisformattedFile {
                    path: "src/main.rs".to_string(),
                    lines: vec![3],
                }],
                diff: String::new(),
            }),
            _ => StageDetail::None,
        };
        StageResult {
            stage: kind,
            exit_code: Some(if outcome == StageOutcome::Passed { 0 } else { 1 }),
            blocking: kind != StageKind::Format,
            outcome,
            failure,
            commands: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            detail,
        }
    }

    /// Drive a run through the state machine with the given outcomes.
    fn run_with(fetch: StageOutcome, stages: &[(StageKind, StageOutcome)]) -> PipelineRun {
        let mut run = RunInProgress::new(RunIdentity::new("b7", "master", "abc", "d"));
        run.advance(PhaseOutcome::Started).unwrap();
        run.record_dependency(dependency(fetch)).unwrap();
        run.advance(fetch.phase_outcome()).unwrap();
        for (kind, outcome) in stages {
            if run.state().is_terminal() {
                break;
            }
            run.record_stage(stage(*kind, *outcome)).unwrap();
            run.advance(outcome.phase_outcome()).unwrap();
        }
        run.finish().unwrap()
    }

    #[test]
    fn test_gate_passes_all_green() {
        let run = run_with(
            StageOutcome::Passed,
            &[
                (StageKind::Format, StageOutcome::Passed),
                (StageKind::Build, StageOutcome::Passed),
                (StageKind::Test, StageOutcome::Passed),
            ],
        );
        let verdict = RunGate::evaluate(&run);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
        assert_eq!(verdict.message, "All stages passed");
    }

    #[test]
    fn test_format_violation_is_advisory() {
        let run = run_with(
            StageOutcome::Passed,
            &[
                (StageKind::Format, StageOutcome::AdvisoryFailed),
                (StageKind::Build, StageOutcome::Passed),
                (StageKind::Test, StageOutcome::Passed),
            ],
        );
        let verdict = RunGate::evaluate(&run);
        assert!(verdict.passed);
        assert_eq!(verdict.advisories.len(), 1);
        assert!(verdict.advisories[0].contains("format violation"));
    }

    #[test]
    fn test_build_failure_blocks_and_test_skipped() {
        let run = run_with(
            StageOutcome::Passed,
            &[
                (StageKind::Format, StageOutcome::Passed),
                (StageKind::Build, StageOutcome::Failed),
                (StageKind::Test, StageOutcome::Passed),
            ],
        );
        let verdict = RunGate::evaluate(&run);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("Stage 'build' failed"));
        assert!(verdict.violations[1].contains("Stage 'test' never ran"));
    }

    #[test]
    fn test_fetch_failure_blocks() {
        let run = run_with(StageOutcome::Failed, &[]);
        let verdict = RunGate::evaluate(&run);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("fetch error"));
        assert_eq!(verdict.violations.len(), 4);
    }

    #[test]
    fn test_failed_tests_named() {
        let run = run_with(
            StageOutcome::Passed,
            &[
                (StageKind::Format, StageOutcome::Passed),
                (StageKind::Build, StageOutcome::Passed),
                (StageKind::Test, StageOutcome::Failed),
            ],
        );
        let verdict = RunGate::evaluate(&run);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("tracer::parses"));
    }
}
