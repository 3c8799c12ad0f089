use async_trait::async_trait;
use thiserror::Error;

use nexus_core::domain::clarification::ClarificationId;
use nexus_core::domain::run::{ConversationId, Run, RunId};

pub mod memory;
pub mod run;

pub use memory::InMemoryRunRepository;
pub use run::SqlRunRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("run `{run_id}` not found")]
    NotFound { run_id: String },
    #[error("run `{run_id}` is at version {actual}, expected {expected}")]
    VersionConflict { run_id: String, expected: u64, actual: u64 },
}

/// Durable record of runs and every clarification they raised.
///
/// `update_run` is a compare-and-swap on `state_version`: the write only lands when the stored
/// version equals `expected_version`, and the stored version becomes `expected_version + 1`.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn insert_run(&self, run: &Run) -> Result<(), RepositoryError>;

    async fn find_run(&self, id: &RunId) -> Result<Option<Run>, RepositoryError>;

    async fn find_run_by_clarification(
        &self,
        clarification_id: &ClarificationId,
    ) -> Result<Option<Run>, RepositoryError>;

    async fn latest_run_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Run>, RepositoryError>;

    /// Returns the new state version.
    async fn update_run(&self, run: &Run, expected_version: u64) -> Result<u64, RepositoryError>;

    async fn ping(&self) -> Result<(), RepositoryError>;
}
