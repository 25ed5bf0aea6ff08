use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Hearing results stored per interview session. Each stage's columns stay
/// `NULL` until that stage has been finalized at least once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HearingSessionRow {
    pub session_id: Uuid,
    pub stage1_transcript: Option<String>,
    pub stage1_data: Option<Value>,
    pub stage2_transcript: Option<String>,
    pub stage2_data: Option<Value>,
    pub ai_call_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
