use serde::{Deserialize, Serialize};

use crate::domain::run::RunStatus;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
    Started,
    ClarificationRaised,
    ClarificationResolved,
    ClarificationRejected,
    Completed,
    Failed,
    CancelRequested,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunAction {
    InvokeProviders,
    PersistClarification,
    ResumeProvider,
    RecordResult,
    RecordFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: RunStatus,
    pub to: RunStatus,
    pub event: RunEvent,
    pub actions: Vec<RunAction>,
}
