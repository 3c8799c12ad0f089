use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use nexus_core::domain::clarification::{
    Clarification, ClarificationId, ClarificationKind, ClarificationPayload,
};
use nexus_core::domain::provider::ProviderId;
use nexus_core::domain::registry::ToolRegistry;
use nexus_core::domain::run::{ConversationId, Run, RunFailure, RunId, RunStatus};

use super::{RepositoryError, RunRepository};
use crate::DbPool;

const RUN_SELECT: &str = "SELECT
        r.id,
        r.conversation_id,
        r.prompt,
        r.registry_name,
        r.registry_json,
        r.provider_id,
        r.status,
        r.result_json,
        r.failure_json,
        r.tools_used_json,
        r.state_version,
        r.started_at,
        r.completed_at,
        r.updated_at,
        c.id AS clarification_id,
        c.kind AS clarification_kind,
        c.prompt AS clarification_prompt,
        c.payload_json AS clarification_payload_json,
        c.continuation AS clarification_continuation,
        c.created_at AS clarification_created_at
     FROM run r
     LEFT JOIN clarification c ON c.id = r.pending_clarification_id";

pub struct SqlRunRepository {
    pool: DbPool,
}

impl SqlRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RunRepository for SqlRunRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let encoded = EncodedRun::from_run(run)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO run (
                id,
                conversation_id,
                prompt,
                registry_name,
                registry_json,
                provider_id,
                status,
                result_json,
                failure_json,
                tools_used_json,
                pending_clarification_id,
                state_version,
                started_at,
                completed_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id.0)
        .bind(&run.conversation_id.0)
        .bind(&run.prompt)
        .bind(&run.registry_name)
        .bind(encoded.registry_json.as_deref())
        .bind(run.provider_id.as_ref().map(ProviderId::as_str))
        .bind(run.status.as_str())
        .bind(encoded.result_json.as_deref())
        .bind(encoded.failure_json.as_deref())
        .bind(&encoded.tools_used_json)
        .bind(run.pending_clarification.as_ref().map(|c| c.id.as_str()))
        .bind(encode_version(&run.id, run.state_version)?)
        .bind(format_timestamp(run.started_at))
        .bind(run.completed_at.map(format_timestamp))
        .bind(format_timestamp(run.updated_at))
        .execute(&mut *tx)
        .await?;

        if let Some(clarification) = &run.pending_clarification {
            insert_clarification(&mut tx, clarification).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_run(&self, id: &RunId) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query(&format!("{RUN_SELECT} WHERE r.id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(run_from_row).transpose()
    }

    async fn find_run_by_clarification(
        &self,
        clarification_id: &ClarificationId,
    ) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{RUN_SELECT} WHERE r.id = (SELECT run_id FROM clarification WHERE id = ?)"
        ))
        .bind(&clarification_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(run_from_row).transpose()
    }

    async fn latest_run_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{RUN_SELECT}
             WHERE r.conversation_id = ?
             ORDER BY r.started_at DESC, r.rowid DESC
             LIMIT 1"
        ))
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(run_from_row).transpose()
    }

    async fn update_run(&self, run: &Run, expected_version: u64) -> Result<u64, RepositoryError> {
        let encoded = EncodedRun::from_run(run)?;
        let next_version = expected_version + 1;
        let mut tx = self.pool.begin().await?;

        if let Some(clarification) = &run.pending_clarification {
            insert_clarification(&mut tx, clarification).await?;
        }

        let updated = sqlx::query(
            "UPDATE run SET
                provider_id = ?,
                status = ?,
                result_json = ?,
                failure_json = ?,
                tools_used_json = ?,
                pending_clarification_id = ?,
                state_version = ?,
                completed_at = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(run.provider_id.as_ref().map(ProviderId::as_str))
        .bind(run.status.as_str())
        .bind(encoded.result_json.as_deref())
        .bind(encoded.failure_json.as_deref())
        .bind(&encoded.tools_used_json)
        .bind(run.pending_clarification.as_ref().map(|c| c.id.as_str()))
        .bind(encode_version(&run.id, next_version)?)
        .bind(run.completed_at.map(format_timestamp))
        .bind(format_timestamp(run.updated_at))
        .bind(&run.id.0)
        .bind(encode_version(&run.id, expected_version)?)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let actual = sqlx::query("SELECT state_version FROM run WHERE id = ?")
                .bind(&run.id.0)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;

            return match actual {
                Some(row) => Err(RepositoryError::VersionConflict {
                    run_id: run.id.0.clone(),
                    expected: expected_version,
                    actual: parse_version(row.try_get("state_version")?)?,
                }),
                None => Err(RepositoryError::NotFound { run_id: run.id.0.clone() }),
            };
        }

        tx.commit().await?;
        Ok(next_version)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        crate::connection::ping(&self.pool).await.map_err(RepositoryError::from)
    }
}

struct EncodedRun {
    registry_json: Option<String>,
    result_json: Option<String>,
    failure_json: Option<String>,
    tools_used_json: String,
}

impl EncodedRun {
    fn from_run(run: &Run) -> Result<Self, RepositoryError> {
        Ok(Self {
            registry_json: run.registry.as_ref().map(serde_json::to_string).transpose().map_err(
                |error| RepositoryError::Encode(format!("run `{}` registry: {error}", run.id)),
            )?,
            result_json: run.result.as_ref().map(serde_json::to_string).transpose().map_err(
                |error| RepositoryError::Encode(format!("run `{}` result: {error}", run.id)),
            )?,
            failure_json: run.failure.as_ref().map(serde_json::to_string).transpose().map_err(
                |error| RepositoryError::Encode(format!("run `{}` failure: {error}", run.id)),
            )?,
            tools_used_json: serde_json::to_string(&run.tools_used).map_err(|error| {
                RepositoryError::Encode(format!("run `{}` tools_used: {error}", run.id))
            })?,
        })
    }
}

async fn insert_clarification(
    tx: &mut Transaction<'_, Sqlite>,
    clarification: &Clarification,
) -> Result<(), RepositoryError> {
    let payload_json = serde_json::to_string(&clarification.payload).map_err(|error| {
        RepositoryError::Encode(format!("clarification `{}` payload: {error}", clarification.id))
    })?;

    // Clarifications are immutable once raised; re-persisting the same id is a no-op.
    sqlx::query(
        "INSERT INTO clarification (
            id,
            run_id,
            kind,
            prompt,
            payload_json,
            continuation,
            created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(&clarification.id.0)
    .bind(&clarification.run_id.0)
    .bind(clarification.kind().as_str())
    .bind(&clarification.prompt)
    .bind(payload_json)
    .bind(&clarification.continuation)
    .bind(format_timestamp(clarification.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn run_from_row(row: SqliteRow) -> Result<Run, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown run status `{status_raw}`")))?;

    let result = row
        .try_get::<Option<String>, _>("result_json")?
        .map(|raw| decode_json("result_json", &raw))
        .transpose()?;
    let failure = row
        .try_get::<Option<String>, _>("failure_json")?
        .map(|raw| decode_json::<RunFailure>("failure_json", &raw))
        .transpose()?;
    let tools_used =
        decode_json::<Vec<String>>("tools_used_json", &row.try_get::<String, _>("tools_used_json")?)?;
    let registry = row
        .try_get::<Option<String>, _>("registry_json")?
        .map(|raw| decode_json::<ToolRegistry>("registry_json", &raw))
        .transpose()?;

    Ok(Run {
        id: RunId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        prompt: row.try_get("prompt")?,
        registry_name: row.try_get("registry_name")?,
        registry,
        provider_id: row.try_get::<Option<String>, _>("provider_id")?.map(ProviderId),
        status,
        result,
        failure,
        tools_used,
        pending_clarification: clarification_from_row(&row)?,
        state_version: parse_version(row.try_get("state_version")?)?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn clarification_from_row(row: &SqliteRow) -> Result<Option<Clarification>, RepositoryError> {
    let Some(id) = row.try_get::<Option<String>, _>("clarification_id")? else {
        return Ok(None);
    };

    let kind_raw = row.try_get::<String, _>("clarification_kind")?;
    let kind = ClarificationKind::parse(&kind_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown clarification kind `{kind_raw}`"))
    })?;
    let payload = decode_json::<ClarificationPayload>(
        "clarification.payload_json",
        &row.try_get::<String, _>("clarification_payload_json")?,
    )?;
    if payload.kind() != kind {
        return Err(RepositoryError::Decode(format!(
            "clarification `{id}` kind `{kind_raw}` does not match its payload"
        )));
    }

    Ok(Some(Clarification {
        id: ClarificationId(id),
        run_id: RunId(row.try_get("id")?),
        prompt: row.try_get("clarification_prompt")?,
        payload,
        continuation: row.try_get("clarification_continuation")?,
        created_at: parse_timestamp(
            "clarification.created_at",
            row.try_get("clarification_created_at")?,
        )?,
    }))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}`: {error}")))
}

fn encode_version(run_id: &RunId, version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version).map_err(|_| {
        RepositoryError::Encode(format!("run `{run_id}` state_version {version} overflows i64"))
    })
}

fn parse_version(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `state_version` (expected non-negative): {value}"
        ))
    })
}

/// Fixed-width timestamps so lexical order in SQL matches chronological order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
