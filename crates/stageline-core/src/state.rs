//! Pipeline run state machine.
//!
//! ```text
//! PENDING -> FETCHING -> FORMAT_CHECK -> BUILDING -> TESTING -> SUCCEEDED
//!               |            |  (advisory)  |           |
//!               +------------+--------------+-----------+-> FAILED
//! any non-terminal state --cancel--> CANCELLED
//! ```
//!
//! Every edge lives in [`RunState::next`]; anything not listed there is an
//! [`PipelineError::InvalidTransition`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Fetching,
    FormatCheck,
    Building,
    Testing,
    Succeeded,
    Failed,
    Cancelled,
}

/// How the phase owned by the current state ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Used only to leave `PENDING`.
    Started,
    Succeeded,
    /// Failed, but the stage allows failure.
    AdvisoryFailure,
    Failed,
    Cancelled,
}

/// A unit of work with its own cache save point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Format,
    Build,
    Test,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Format => "format",
            Phase::Build => "build",
            Phase::Test => "test",
        }
    }

    /// The run state in which this phase executes.
    pub fn state(&self) -> RunState {
        match self {
            Phase::Fetch => RunState::Fetching,
            Phase::Format => RunState::FormatCheck,
            Phase::Build => RunState::Building,
            Phase::Test => RunState::Testing,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fetch" => Ok(Phase::Fetch),
            "format" => Ok(Phase::Format),
            "build" => Ok(Phase::Build),
            "test" => Ok(Phase::Test),
            other => Err(crate::error::ConfigError::UnknownStage(other.to_string())),
        }
    }
}

impl RunState {
    /// Whether the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    /// The phase executed while in this state, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RunState::Fetching => Some(Phase::Fetch),
            RunState::FormatCheck => Some(Phase::Format),
            RunState::Building => Some(Phase::Build),
            RunState::Testing => Some(Phase::Test),
            _ => None,
        }
    }

    /// Apply the outcome of the current phase and return the next state.
    pub fn next(self, outcome: PhaseOutcome) -> Result<RunState, PipelineError> {
        use PhaseOutcome as O;
        use RunState as S;

        let next = match (self, outcome) {
            (S::Pending, O::Started) => S::Fetching,

            (S::Fetching, O::Succeeded) => S::FormatCheck,
            // The format check is the only advisory phase.
            (S::FormatCheck, O::Succeeded | O::AdvisoryFailure) => S::Building,
            (S::Building, O::Succeeded) => S::Testing,
            (S::Testing, O::Succeeded) => S::Succeeded,

            (S::Fetching | S::FormatCheck | S::Building | S::Testing, O::Failed) => S::Failed,

            (
                S::Pending | S::Fetching | S::FormatCheck | S::Building | S::Testing,
                O::Cancelled,
            ) => S::Cancelled,

            (from, outcome) => return Err(PipelineError::InvalidTransition { from, outcome }),
        };
        Ok(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Fetching => "FETCHING",
            RunState::FormatCheck => "FORMAT_CHECK",
            RunState::Building => "BUILDING",
            RunState::Testing => "TESTING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = RunState::Pending;
        state = state.next(PhaseOutcome::Started).unwrap();
        assert_eq!(state, RunState::Fetching);
        state = state.next(PhaseOutcome::Succeeded).unwrap();
        assert_eq!(state, RunState::FormatCheck);
        state = state.next(PhaseOutcome::Succeeded).unwrap();
        assert_eq!(state, RunState::Building);
        state = state.next(PhaseOutcome::Succeeded).unwrap();
        assert_eq!(state, RunState::Testing);
        state = state.next(PhaseOutcome::Succeeded).unwrap();
        assert_eq!(state, RunState::Succeeded);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_advisory_format_failure_continues_to_building() {
        let next = RunState::FormatCheck
            .next(PhaseOutcome::AdvisoryFailure)
            .unwrap();
        assert_eq!(next, RunState::Building);
    }

    #[test]
    fn test_fatal_failures_are_terminal() {
        for state in [RunState::Fetching, RunState::Building, RunState::Testing] {
            assert_eq!(state.next(PhaseOutcome::Failed).unwrap(), RunState::Failed);
        }
    }

    #[test]
    fn test_cancel_from_any_active_state() {
        for state in [
            RunState::Pending,
            RunState::Fetching,
            RunState::FormatCheck,
            RunState::Building,
            RunState::Testing,
        ] {
            assert_eq!(
                state.next(PhaseOutcome::Cancelled).unwrap(),
                RunState::Cancelled
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        for state in [RunState::Succeeded, RunState::Failed, RunState::Cancelled] {
            assert!(state.next(PhaseOutcome::Succeeded).is_err());
            assert!(state.next(PhaseOutcome::Cancelled).is_err());
        }
    }

    #[test]
    fn test_pending_only_accepts_start_or_cancel() {
        assert!(RunState::Pending.next(PhaseOutcome::Succeeded).is_err());
        assert!(RunState::Fetching.next(PhaseOutcome::Started).is_err());
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&RunState::FormatCheck).unwrap();
        assert_eq!(json, "\"FORMAT_CHECK\"");
        assert_eq!(RunState::FormatCheck.to_string(), "FORMAT_CHECK");
    }

    #[test]
    fn test_phase_state_mapping() {
        assert_eq!(Phase::Fetch.state(), RunState::Fetching);
        assert_eq!(RunState::Building.phase(), Some(Phase::Build));
        assert_eq!(RunState::Succeeded.phase(), None);
        assert_eq!("Build".parse::<Phase>().unwrap(), Phase::Build);
    }
}
