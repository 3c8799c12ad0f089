use thiserror::Error;

use crate::domain::run::{RunId, RunStatus};
use crate::flows::states::{RunAction, RunEvent, TransitionOutcome};

pub trait FlowDefinition {
    fn initial_state(&self) -> RunStatus;
    fn transition(
        &self,
        current: &RunStatus,
        event: &RunEvent,
    ) -> Result<TransitionOutcome, RunTransitionError>;
}

/// The run lifecycle:
/// `pending -> running -> (awaiting_clarification -> running)* -> completed | failed`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunFlow;

impl FlowDefinition for RunFlow {
    fn initial_state(&self) -> RunStatus {
        RunStatus::Pending
    }

    fn transition(
        &self,
        current: &RunStatus,
        event: &RunEvent,
    ) -> Result<TransitionOutcome, RunTransitionError> {
        transition_run(current, event)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("invalid run transition from {state} using event {event:?}")]
    InvalidTransition { state: RunStatus, event: RunEvent },
    #[error("run {run_id} already has an outstanding clarification")]
    ClarificationOutstanding { run_id: RunId },
}

fn transition_run(
    current: &RunStatus,
    event: &RunEvent,
) -> Result<TransitionOutcome, RunTransitionError> {
    use RunAction::{
        InvokeProviders, PersistClarification, RecordFailure, RecordResult, ResumeProvider,
    };
    use RunEvent::{
        CancelRequested, ClarificationRaised, ClarificationRejected, ClarificationResolved,
        Completed, Failed, Started,
    };
    use RunStatus::{AwaitingClarification, Failed as FailedState, Pending, Running};

    let (to, actions) = match (current, event) {
        (Pending, Started) => (Running, vec![InvokeProviders]),
        (Pending, Failed) => (FailedState, vec![RecordFailure]),
        (Running, ClarificationRaised) => (AwaitingClarification, vec![PersistClarification]),
        (Running, Completed) => (RunStatus::Completed, vec![RecordResult]),
        (Running, Failed) | (Running, CancelRequested) => (FailedState, vec![RecordFailure]),
        (AwaitingClarification, ClarificationResolved) => (Running, vec![ResumeProvider]),
        (AwaitingClarification, ClarificationRejected) => (FailedState, vec![RecordFailure]),
        _ => {
            return Err(RunTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}
