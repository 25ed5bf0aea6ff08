//! Typed contracts for the hearing chains and the validator that guards them.
//!
//! Every model response passes through [`parse_response`] before the state machine
//! sees it. The validator walks a static field table, so a bad response is reported
//! with the offending field path instead of a generic serde message.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::llm_client::strip_json_fences;

// ────────────────────────────────────────────────────────────────────────────
// Field descriptors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Bool,
    /// Non-negative integer.
    Count,
    TextList,
    /// Array of objects, each validated against the nested field table.
    EntryList(&'static [FieldSpec]),
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldKind::Text => "string",
            FieldKind::Bool => "boolean",
            FieldKind::Count => "non-negative integer",
            FieldKind::TextList => "array of strings",
            FieldKind::EntryList(_) => "array of objects",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    /// Optional fields may be absent or `null`; when present they must match `kind`.
    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("expected a JSON object at '{path}', found {found}")]
    NotAnObject { path: String, found: &'static str },

    #[error("missing required field '{field}' (expected {expected})")]
    MissingField { field: String, expected: FieldKind },

    #[error("field '{field}' has the wrong type: expected {expected}, found {found}")]
    WrongType {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },
}

/// A shape that model responses are validated against.
pub trait Schema: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const FIELDS: &'static [FieldSpec];
}

/// Which hearing pass a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stage1,
    Stage2,
}

impl Stage {
    pub fn number(&self) -> u8 {
        match self {
            Stage::Stage1 => 1,
            Stage::Stage2 => 2,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Stage::Stage1),
            2 => Some(Stage::Stage2),
            _ => None,
        }
    }
}

/// A stage payload: a schema bound to the stage that produces it.
pub trait StageData: Schema {
    const STAGE: Stage;
}

// ────────────────────────────────────────────────────────────────────────────
// Contracts
// ────────────────────────────────────────────────────────────────────────────

/// Stage 1 — motivation, self-PR and preferences from the first recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Data {
    pub motivation: String,
    pub self_pr: String,
    pub preferences: String,
    pub hobbies: Option<String>,
}

impl Schema for Stage1Data {
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::required("motivation", FieldKind::Text),
        FieldSpec::required("self_pr", FieldKind::Text),
        FieldSpec::required("preferences", FieldKind::Text),
        FieldSpec::optional("hobbies", FieldKind::Text),
    ];
}

impl StageData for Stage1Data {
    const STAGE: Stage = Stage::Stage1;
}

/// One dated line of an education, work or qualification history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// "YYYY-MM" as spoken; not parsed further.
    pub year_month: String,
    pub description: String,
}

const HISTORY_ENTRY_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("year_month", FieldKind::Text),
    FieldSpec::required("description", FieldKind::Text),
];

/// Stage 2 — remaining biographical fields from the second recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Data {
    pub education: Vec<HistoryEntry>,
    pub work_history: Vec<HistoryEntry>,
    pub qualifications: Vec<HistoryEntry>,
    pub commute_time: Option<String>,
    pub dependents: Option<u32>,
    pub has_spouse: Option<bool>,
}

impl Schema for Stage2Data {
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::required("education", FieldKind::EntryList(HISTORY_ENTRY_FIELDS)),
        FieldSpec::required("work_history", FieldKind::EntryList(HISTORY_ENTRY_FIELDS)),
        FieldSpec::required("qualifications", FieldKind::EntryList(HISTORY_ENTRY_FIELDS)),
        FieldSpec::optional("commute_time", FieldKind::Text),
        FieldSpec::optional("dependents", FieldKind::Count),
        FieldSpec::optional("has_spouse", FieldKind::Bool),
    ];
}

impl StageData for Stage2Data {
    const STAGE: Stage = Stage::Stage2;
}

/// The reviewer's judgment of an extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub acceptable: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggested_fix: String,
}

impl Schema for QualityVerdict {
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::required("acceptable", FieldKind::Bool),
        FieldSpec::optional("issues", FieldKind::TextList),
        FieldSpec::optional("suggested_fix", FieldKind::Text),
    ];
}

impl QualityVerdict {
    /// A rejection standing in for a quality check that could not be completed.
    pub fn fail_closed(reason: impl fmt::Display) -> Self {
        Self {
            acceptable: false,
            issues: vec![format!("quality check could not be completed: {reason}")],
            suggested_fix: String::new(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

/// Parses a raw model response into `T`, rejecting anything that does not match
/// `T::FIELDS`. Pure: the same input always yields the same outcome.
pub fn parse_response<T: Schema>(raw: &str) -> Result<T, SchemaError> {
    let text = strip_json_fences(raw);
    let value: Value =
        serde_json::from_str(text).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
    validate_value::<T>(value)
}

/// Validates an already-parsed JSON value into `T`.
pub fn validate_value<T: Schema>(mut value: Value) -> Result<T, SchemaError> {
    check_object(&mut value, T::FIELDS, "")?;
    serde_json::from_value(value).map_err(|e| SchemaError::InvalidJson(e.to_string()))
}

/// Checks `value` against `fields` and drops `null` optionals so serde defaults apply.
fn check_object(value: &mut Value, fields: &[FieldSpec], path: &str) -> Result<(), SchemaError> {
    let object = match value {
        Value::Object(map) => map,
        other => {
            return Err(SchemaError::NotAnObject {
                path: if path.is_empty() { "$".to_string() } else { path.to_string() },
                found: json_type(other),
            })
        }
    };

    for spec in fields {
        let field_path = join_path(path, spec.name);
        let present = object.get(spec.name).map(|v| !v.is_null());
        match present {
            None | Some(false) if spec.required => {
                return Err(SchemaError::MissingField {
                    field: field_path,
                    expected: spec.kind,
                });
            }
            None => {}
            Some(false) => {
                object.remove(spec.name);
            }
            Some(true) => {
                if let Some(field) = object.get_mut(spec.name) {
                    check_kind(field, spec.kind, &field_path)?;
                }
            }
        }
    }

    strip_unknown(object, fields);
    Ok(())
}

fn check_kind(value: &mut Value, kind: FieldKind, path: &str) -> Result<(), SchemaError> {
    let matches = match (kind, &*value) {
        (FieldKind::Text, Value::String(_)) => true,
        (FieldKind::Bool, Value::Bool(_)) => true,
        (FieldKind::Count, Value::Number(n)) => n.as_u64().is_some_and(|n| n <= u32::MAX as u64),
        (FieldKind::TextList, Value::Array(items)) => {
            if let Some((i, bad)) = items.iter().enumerate().find(|(_, v)| !v.is_string()) {
                return Err(SchemaError::WrongType {
                    field: format!("{path}[{i}]"),
                    expected: FieldKind::Text,
                    found: json_type(bad),
                });
            }
            true
        }
        (FieldKind::EntryList(_), Value::Array(_)) => true,
        _ => false,
    };

    if !matches {
        return Err(SchemaError::WrongType {
            field: path.to_string(),
            expected: kind,
            found: json_type(value),
        });
    }

    if let (FieldKind::EntryList(nested), Value::Array(items)) = (kind, value) {
        for (i, item) in items.iter_mut().enumerate() {
            check_object(item, nested, &format!("{path}[{i}]"))?;
        }
    }
    Ok(())
}

/// Unknown keys are tolerated in responses but never forwarded.
fn strip_unknown(object: &mut Map<String, Value>, fields: &[FieldSpec]) {
    object.retain(|key, _| fields.iter().any(|f| f.name == key));
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
