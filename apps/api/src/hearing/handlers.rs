use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::hearing::audio::AudioInput;
use crate::hearing::chains::PersonalInfo;
use crate::hearing::orchestrator::StageOutcome;
use crate::hearing::schema::Stage;
use crate::hearing::store::{get_session, operation_action, record_operation, save_stage_result};
use crate::models::session::HearingSessionRow;
use crate::state::AppState;

const RESOURCE_TYPE: &str = "hearing_session";

#[derive(Deserialize)]
pub struct HearingRequest {
    pub audio_base64: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub personal_info: PersonalInfo,
}

#[derive(Debug, Serialize)]
pub struct HearingResponse {
    pub session_id: Uuid,
    pub stage: u8,
    pub transcript: String,
    pub data: Value,
    pub retry_count: u32,
    pub extraction_attempts: u32,
}

/// Accepts `1`, `2`, `stage1` or `stage2`.
pub fn parse_stage(raw: &str) -> Result<Stage, AppError> {
    let digits = raw.trim().trim_start_matches("stage");
    digits
        .parse::<u8>()
        .ok()
        .and_then(Stage::from_number)
        .ok_or_else(|| AppError::Validation(format!("Unknown hearing stage '{raw}'")))
}

/// Decoded size of a base64 payload, ignoring padding and embedded whitespace.
fn estimated_audio_bytes(encoded: &str) -> usize {
    let payload = encoded.rsplit_once(',').map_or(encoded, |(_, data)| data);
    let len = payload
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .count();
    len * 3 / 4
}

impl HearingResponse {
    fn from_outcome(session_id: Uuid, outcome: &StageOutcome) -> Result<Self, AppError> {
        Ok(Self {
            session_id,
            stage: outcome.stage().number(),
            transcript: outcome.transcript().to_string(),
            data: outcome.data_json().map_err(anyhow::Error::from)?,
            retry_count: outcome.retry_count(),
            extraction_attempts: outcome.extraction_attempts(),
        })
    }
}

/// POST /api/v1/sessions/:session_id/hearing/:stage
pub async fn handle_run_hearing(
    State(state): State<AppState>,
    Path((session_id, stage)): Path<(Uuid, String)>,
    Json(req): Json<HearingRequest>,
) -> Result<Json<HearingResponse>, AppError> {
    let stage = parse_stage(&stage)?;

    let audio_bytes = estimated_audio_bytes(&req.audio_base64);
    if audio_bytes > state.config.max_audio_bytes {
        return Err(AppError::PayloadTooLarge(format!(
            "Recording is {audio_bytes} bytes; the limit is {} bytes",
            state.config.max_audio_bytes
        )));
    }

    info!(
        "Hearing stage {} requested for session {session_id} (~{audio_bytes} bytes)",
        stage.number()
    );

    let cancel = CancellationToken::new();
    // Cancelling on drop also stops the deadline task once the run returns.
    let _guard = cancel.clone().drop_guard();
    spawn_deadline(cancel.clone(), state.config.request_timeout);

    let audio = AudioInput::new(req.audio_base64, req.mime_type);
    let result = state
        .pipeline
        .run_stage(stage, audio, req.personal_info, &cancel)
        .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if err.is_cancelled() {
                info!("Hearing stage {} cancelled for session {session_id}", stage.number());
            }
            audit(&state, session_id, stage, false, json!({ "error": &err })).await;
            return Err(err.into());
        }
    };

    if let Err(err) = save_stage_result(&state.db, session_id, &outcome).await {
        audit(
            &state,
            session_id,
            stage,
            false,
            json!({ "error": { "phase": "persistence", "message": format!("{err:#}") } }),
        )
        .await;
        return Err(err.into());
    }

    // The session row is committed; an audit failure from here on must not fail the request.
    audit(
        &state,
        session_id,
        stage,
        true,
        json!({
            "retry_count": outcome.retry_count(),
            "extraction_attempts": outcome.extraction_attempts(),
            "ai_calls": outcome.ai_calls(),
        }),
    )
    .await;

    Ok(Json(HearingResponse::from_outcome(session_id, &outcome)?))
}

/// Appends the run to `operation_logs`. A failed write is logged, never returned.
async fn audit(state: &AppState, session_id: Uuid, stage: Stage, succeeded: bool, details: Value) {
    let action = operation_action(stage, succeeded);
    if let Err(e) = record_operation(
        &state.db,
        &action,
        RESOURCE_TYPE,
        &session_id.to_string(),
        &details,
    )
    .await
    {
        warn!("Failed to record {action} for session {session_id}: {e:?}");
    }
}

/// GET /api/v1/sessions/:session_id/hearing
pub async fn handle_get_hearing(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<HearingSessionRow>, AppError> {
    let row = get_session(&state.db, session_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No hearing results for session {session_id}")))?;
    Ok(Json(row))
}

fn spawn_deadline(cancel: CancellationToken, timeout: std::time::Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                warn!("Hearing request exceeded {timeout:?}; cancelling");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    });
}
