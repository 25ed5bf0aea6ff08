//! Persistence for finalized hearing runs and the operation audit log.
//!
//! The pipeline itself never writes; handlers call into this module after a run returns.

use anyhow::Result;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::hearing::orchestrator::StageOutcome;
use crate::hearing::schema::Stage;
use crate::models::session::HearingSessionRow;

const UPSERT_STAGE1: &str = r#"
    INSERT INTO hearing_sessions (session_id, stage1_transcript, stage1_data, ai_call_count)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (session_id) DO UPDATE SET
        stage1_transcript = EXCLUDED.stage1_transcript,
        stage1_data = EXCLUDED.stage1_data,
        ai_call_count = hearing_sessions.ai_call_count + EXCLUDED.ai_call_count,
        updated_at = NOW()
"#;

const UPSERT_STAGE2: &str = r#"
    INSERT INTO hearing_sessions (session_id, stage2_transcript, stage2_data, ai_call_count)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (session_id) DO UPDATE SET
        stage2_transcript = EXCLUDED.stage2_transcript,
        stage2_data = EXCLUDED.stage2_data,
        ai_call_count = hearing_sessions.ai_call_count + EXCLUDED.ai_call_count,
        updated_at = NOW()
"#;

/// Stores a finalized stage on the session and adds its model calls to the counter.
/// Re-running a stage overwrites that stage's columns only.
pub async fn save_stage_result(
    pool: &PgPool,
    session_id: Uuid,
    outcome: &StageOutcome,
) -> Result<()> {
    let query = match outcome.stage() {
        Stage::Stage1 => UPSERT_STAGE1,
        Stage::Stage2 => UPSERT_STAGE2,
    };
    let data = outcome.data_json()?;
    let ai_calls = i32::try_from(outcome.ai_calls())?;

    sqlx::query(query)
        .bind(session_id)
        .bind(outcome.transcript())
        .bind(&data)
        .bind(ai_calls)
        .execute(pool)
        .await?;

    info!(
        "Saved hearing stage {} for session {session_id} ({ai_calls} AI calls)",
        outcome.stage().number()
    );
    Ok(())
}

/// Returns the stored hearing results for a session, if any stage has completed.
pub async fn get_session(pool: &PgPool, session_id: Uuid) -> Result<Option<HearingSessionRow>> {
    let row = sqlx::query_as::<_, HearingSessionRow>(
        "SELECT * FROM hearing_sessions WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Appends an entry to the operation audit log.
/// CRITICAL: append-only. Never UPDATE or DELETE rows in operation_logs.
pub async fn record_operation(
    pool: &PgPool,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    details: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO operation_logs (id, action, resource_type, resource_id, details)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(action)
    .bind(resource_type)
    .bind(resource_id)
    .bind(details)
    .execute(pool)
    .await?;
    Ok(())
}

/// Audit action name for a stage run, e.g. `hearing.stage2.completed`.
pub fn operation_action(stage: Stage, succeeded: bool) -> String {
    let outcome = if succeeded { "completed" } else { "failed" };
    format!("hearing.stage{}.{outcome}", stage.number())
}
