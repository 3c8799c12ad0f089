use std::collections::HashMap;

use tokio::sync::RwLock;

use nexus_core::domain::clarification::ClarificationId;
use nexus_core::domain::run::{ConversationId, Run, RunId};

use super::{RepositoryError, RunRepository};

#[derive(Default)]
struct LedgerState {
    runs: HashMap<String, Run>,
    /// Every clarification ever raised, mapped to its run.
    clarifications: HashMap<String, RunId>,
    insertion_order: Vec<RunId>,
}

impl LedgerState {
    fn record_clarification(&mut self, run: &Run) {
        if let Some(clarification) = &run.pending_clarification {
            self.clarifications.entry(clarification.id.0.clone()).or_insert_with(|| run.id.clone());
        }
    }
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    state: RwLock<LedgerState>,
}

#[async_trait::async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.record_clarification(run);
        state.insertion_order.push(run.id.clone());
        state.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    async fn find_run(&self, id: &RunId) -> Result<Option<Run>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.runs.get(&id.0).cloned())
    }

    async fn find_run_by_clarification(
        &self,
        clarification_id: &ClarificationId,
    ) -> Result<Option<Run>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .clarifications
            .get(&clarification_id.0)
            .and_then(|run_id| state.runs.get(&run_id.0))
            .cloned())
    }

    async fn latest_run_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Run>, RepositoryError> {
        let state = self.state.read().await;
        let latest = state
            .insertion_order
            .iter()
            .enumerate()
            .filter_map(|(position, run_id)| {
                state.runs.get(&run_id.0).map(|run| (position, run))
            })
            .filter(|(_, run)| &run.conversation_id == conversation_id)
            .max_by_key(|(position, run)| (run.started_at, *position))
            .map(|(_, run)| run.clone());
        Ok(latest)
    }

    async fn update_run(&self, run: &Run, expected_version: u64) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let stored_version = match state.runs.get(&run.id.0) {
            Some(stored) => stored.state_version,
            None => return Err(RepositoryError::NotFound { run_id: run.id.0.clone() }),
        };
        if stored_version != expected_version {
            return Err(RepositoryError::VersionConflict {
                run_id: run.id.0.clone(),
                expected: expected_version,
                actual: stored_version,
            });
        }

        let next_version = expected_version + 1;
        let mut stored = run.clone();
        stored.state_version = next_version;
        state.record_clarification(&stored);
        state.runs.insert(stored.id.0.clone(), stored);
        Ok(next_version)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
