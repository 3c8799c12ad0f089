use nexus_core::domain::clarification::{Clarification, ClarificationResponse};
use nexus_core::domain::run::{Run, RunFailure, RunStatus};
use nexus_core::errors::ApplicationError;

use crate::llm::Resumption;

/// What a validated clarification response does to its run.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Resume(Resumption),
    Reject(RunFailure),
}

/// Checks a submitted response against the run that owns the clarification.
///
/// `run` is whatever the ledger attributes the clarification id to. The id must name the
/// run's single outstanding clarification and the outcome must fit its kind; a kind
/// mismatch leaves the clarification outstanding.
pub fn check_submission(
    run: Option<Run>,
    response: &ClarificationResponse,
) -> Result<(Run, Clarification), ApplicationError> {
    let stale = || ApplicationError::StaleClarification {
        clarification_id: response.clarification_id.to_string(),
    };

    let run = run.ok_or_else(stale)?;
    if run.status != RunStatus::AwaitingClarification {
        return Err(stale());
    }
    let clarification = match &run.pending_clarification {
        Some(pending) if pending.id == response.clarification_id => pending.clone(),
        _ => return Err(stale()),
    };

    let kind = clarification.kind();
    if !response.outcome.accepts(kind) {
        return Err(ApplicationError::ClarificationMismatch {
            outcome: response.outcome.as_str().to_string(),
            kind: kind.as_str().to_string(),
        });
    }

    Ok((run, clarification))
}

pub fn resolve(clarification: &Clarification, response: &ClarificationResponse) -> Resolution {
    if response.outcome.is_rejection() {
        return Resolution::Reject(RunFailure::user_cancelled(format!(
            "clarification `{}` was {} by the user",
            clarification.id,
            response.outcome.as_str()
        )));
    }

    Resolution::Resume(Resumption {
        clarification_id: clarification.id.clone(),
        outcome: response.outcome.clone(),
        continuation: clarification.continuation.clone(),
    })
}
