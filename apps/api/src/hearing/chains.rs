//! Hearing chains — one typed operation per model call.
//!
//! Each chain builds its prompt from a stage template, makes exactly one provider
//! call, and validates the reply through [`schema::parse_response`]. No state is
//! kept between calls; retry policy lives in the state machine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hearing::audio::AudioInput;
use crate::hearing::error::ChainError;
use crate::hearing::prompts::{
    EXTRACTION_SYSTEM, FEEDBACK_TEMPLATE, QUALITY_SYSTEM, QUALITY_TEMPLATE, STAGE1_EXTRACTION_TEMPLATE,
    STAGE1_QUALITY_FOCUS, STAGE2_EXTRACTION_TEMPLATE, STAGE2_QUALITY_FOCUS,
    TRANSCRIPTION_INSTRUCTION,
};
use crate::hearing::schema::{parse_response, QualityVerdict, Stage, StageData};
use crate::llm_client::prompts::{CORRECTION_INSTRUCTION, GROUNDING_INSTRUCTION};
use crate::llm_client::{LlmError, ModelProvider};

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// Candidate details already known before the interview.
/// Read-only context for every extraction and quality prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalInfo {
    pub name: String,
    pub age: Option<u32>,
    pub birth_date: Option<NaiveDate>,
    pub prefecture: Option<String>,
}

impl PersonalInfo {
    /// Stated age, or the age derived from `birth_date` on `today`.
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        if self.age.is_some() {
            return self.age;
        }
        let birth = self.birth_date?;
        let mut years = today.year() - birth.year();
        if (today.month(), today.day()) < (birth.month(), birth.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }

    /// Renders the details as prompt lines, omitting unknown fields.
    pub fn render_as_of(&self, today: NaiveDate) -> String {
        let mut lines = vec![format!("- Name: {}", display_or_unknown(&self.name))];
        if let Some(age) = self.age_on(today) {
            lines.push(format!("- Age: {age}"));
        }
        if let Some(birth) = self.birth_date {
            lines.push(format!("- Birth date: {}", birth.format("%Y-%m-%d")));
        }
        if let Some(prefecture) = self.prefecture.as_deref().filter(|p| !p.trim().is_empty()) {
            lines.push(format!("- Prefecture: {prefecture}"));
        }
        lines.push(format!("- Today: {}", today.format("%Y-%m-%d")));
        lines.join("\n")
    }

    pub fn render(&self) -> String {
        self.render_as_of(Utc::now().date_naive())
    }
}

fn display_or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "(unknown)"
    } else {
        value
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stage configuration
// ────────────────────────────────────────────────────────────────────────────

/// The prompts that differ between the two hearing stages. The field table a reply
/// is validated against comes from the stage payload type (`D::FIELDS`).
/// One immutable instance per stage, shared by every run.
#[derive(Debug)]
pub struct StageConfig {
    pub extraction_template: &'static str,
    pub quality_focus: &'static str,
}

pub static STAGE1_CONFIG: StageConfig = StageConfig {
    extraction_template: STAGE1_EXTRACTION_TEMPLATE,
    quality_focus: STAGE1_QUALITY_FOCUS,
};

pub static STAGE2_CONFIG: StageConfig = StageConfig {
    extraction_template: STAGE2_EXTRACTION_TEMPLATE,
    quality_focus: STAGE2_QUALITY_FOCUS,
};

impl StageConfig {
    pub fn for_stage(stage: Stage) -> &'static StageConfig {
        match stage {
            Stage::Stage1 => &STAGE1_CONFIG,
            Stage::Stage2 => &STAGE2_CONFIG,
        }
    }

    /// Builds the extraction prompt. Non-empty `prior_issues` are embedded verbatim.
    pub fn extraction_prompt(
        &self,
        transcript: &str,
        personal_info: &str,
        prior_issues: &[String],
    ) -> String {
        let feedback = if prior_issues.is_empty() {
            String::new()
        } else {
            let issues = prior_issues
                .iter()
                .map(|issue| format!("- {issue}"))
                .collect::<Vec<_>>()
                .join("\n");
            FEEDBACK_TEMPLATE
                .replace("{correction_instruction}", CORRECTION_INSTRUCTION)
                .replace("{issues}", &issues)
        };

        self.extraction_template
            .replace("{grounding_instruction}", GROUNDING_INSTRUCTION)
            .replace("{personal_info}", personal_info)
            .replace("{feedback}", &feedback)
            .replace("{transcript}", transcript)
    }

    pub fn quality_prompt(&self, extracted_json: &str, transcript: &str, personal_info: &str) -> String {
        QUALITY_TEMPLATE
            .replace("{stage_focus}", self.quality_focus)
            .replace("{personal_info}", personal_info)
            .replace("{extracted_json}", extracted_json)
            .replace("{transcript}", transcript)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Chain seam
// ────────────────────────────────────────────────────────────────────────────

/// The three model operations the extraction machine drives, for stage payload `D`.
#[async_trait]
pub trait HearingChains<D: StageData>: Send + Sync {
    async fn transcribe(&self, audio: &AudioInput) -> Result<String, ChainError>;

    async fn extract(
        &self,
        transcript: &str,
        personal_info: &PersonalInfo,
        prior_issues: &[String],
    ) -> Result<D, ChainError>;

    /// Never fails: anything short of a valid verdict is a rejection.
    async fn check_quality(
        &self,
        extracted: &D,
        transcript: &str,
        personal_info: &PersonalInfo,
    ) -> QualityVerdict;
}

/// Production chains backed by a [`ModelProvider`].
#[derive(Clone)]
pub struct LlmChains {
    provider: Arc<dyn ModelProvider>,
}

impl LlmChains {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<D: StageData> HearingChains<D> for LlmChains {
    async fn transcribe(&self, audio: &AudioInput) -> Result<String, ChainError> {
        let blob = audio.decode()?;
        debug!(
            "Transcribing {} bytes of {}",
            blob.bytes.len(),
            blob.mime.as_str()
        );

        let text = self
            .provider
            .transcribe(&blob, TRANSCRIPTION_INSTRUCTION)
            .await
            .map_err(|e| match e {
                LlmError::EmptyContent => ChainError::EmptyTranscript,
                other => ChainError::Provider(other),
            })?;

        let text = text.trim();
        if text.is_empty() {
            return Err(ChainError::EmptyTranscript);
        }
        Ok(text.to_string())
    }

    async fn extract(
        &self,
        transcript: &str,
        personal_info: &PersonalInfo,
        prior_issues: &[String],
    ) -> Result<D, ChainError> {
        let config = StageConfig::for_stage(D::STAGE);
        let prompt = config.extraction_prompt(transcript, &personal_info.render(), prior_issues);

        let raw = self.provider.generate(&prompt, EXTRACTION_SYSTEM).await?;
        Ok(parse_response::<D>(&raw)?)
    }

    async fn check_quality(
        &self,
        extracted: &D,
        transcript: &str,
        personal_info: &PersonalInfo,
    ) -> QualityVerdict {
        let config = StageConfig::for_stage(D::STAGE);
        let extracted_json = match serde_json::to_string_pretty(extracted) {
            Ok(json) => json,
            Err(e) => return QualityVerdict::fail_closed(format!("could not serialize extraction: {e}")),
        };
        let prompt = config.quality_prompt(&extracted_json, transcript, &personal_info.render());

        match self.provider.generate(&prompt, QUALITY_SYSTEM).await {
            Ok(raw) => parse_response::<QualityVerdict>(&raw)
                .unwrap_or_else(|e| QualityVerdict::fail_closed(format!("malformed verdict: {e}"))),
            Err(e) => QualityVerdict::fail_closed(format!("provider error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::hearing::audio::AudioBlob;
    use crate::hearing::schema::{Stage1Data, Stage2Data};

    /// Provider double returning scripted replies and recording every prompt.
    struct ScriptedProvider {
        transcript: Mutex<Option<Result<String, LlmError>>>,
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                transcript: Mutex::new(None),
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn with_transcript(self: Arc<Self>, reply: Result<String, LlmError>) -> Arc<Self> {
            *self.transcript.lock().unwrap() = Some(reply);
            self
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn transcribe(&self, _audio: &AudioBlob, _instruction: &str) -> Result<String, LlmError> {
            self.transcript
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(LlmError::EmptyContent))
        }

        async fn generate(&self, prompt: &str, _system: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyContent))
        }
    }

    fn chains(provider: &Arc<ScriptedProvider>) -> LlmChains {
        LlmChains::new(provider.clone())
    }

    fn personal_info() -> PersonalInfo {
        PersonalInfo {
            name: "Sato Hanako".to_string(),
            age: Some(29),
            birth_date: None,
            prefecture: Some("Osaka".to_string()),
        }
    }

    const STAGE1_REPLY: &str = r#"{"motivation": "m", "self_pr": "s", "preferences": "p"}"#;

    fn audio() -> AudioInput {
        AudioInput::new("AAEC", Some("audio/webm".to_string()))
    }

    #[tokio::test]
    async fn test_transcribe_trims_provider_text() {
        let provider =
            ScriptedProvider::new(vec![]).with_transcript(Ok("  hello there \n".to_string()));
        let text = HearingChains::<Stage1Data>::transcribe(&chains(&provider), &audio())
            .await
            .unwrap();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn test_transcribe_rejects_blank_and_bad_input() {
        let provider = ScriptedProvider::new(vec![]).with_transcript(Ok("   ".to_string()));
        let err = HearingChains::<Stage1Data>::transcribe(&chains(&provider), &audio())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::EmptyTranscript));

        let provider = ScriptedProvider::new(vec![]);
        let err = HearingChains::<Stage1Data>::transcribe(
            &chains(&provider),
            &AudioInput::new("AAEC", Some("text/plain".to_string())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::UnsupportedMime(_)));

        let err = HearingChains::<Stage1Data>::transcribe(&chains(&provider), &AudioInput::new("", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::EmptyAudio));
    }

    #[tokio::test]
    async fn test_transcribe_provider_error() {
        let provider = ScriptedProvider::new(vec![]).with_transcript(Err(LlmError::Api {
            status: 503,
            message: "overloaded".to_string(),
        }));
        let err = HearingChains::<Stage1Data>::transcribe(&chains(&provider), &audio())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Provider(LlmError::Api { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_extract_validates_reply() {
        let provider = ScriptedProvider::new(vec![
            Ok(STAGE1_REPLY.to_string()),
            Ok(r#"{"motivation": "m"}"#.to_string()),
        ]);
        let chains = chains(&provider);

        let data = HearingChains::<Stage1Data>::extract(&chains, "transcript", &personal_info(), &[])
            .await
            .unwrap();
        assert_eq!(data.motivation, "m");

        let err = HearingChains::<Stage1Data>::extract(&chains, "transcript", &personal_info(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Schema(_)));
    }

    #[tokio::test]
    async fn test_extract_prompt_carries_context_and_feedback() {
        let provider = ScriptedProvider::new(vec![Ok(STAGE1_REPLY.to_string())]);
        let issues = vec!["self_pr lacks a concrete episode".to_string()];

        HearingChains::<Stage1Data>::extract(
            &chains(&provider),
            "I led the Namba store.",
            &personal_info(),
            &issues,
        )
        .await
        .unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("I led the Namba store."));
        assert!(prompts[0].contains("Sato Hanako"));
        assert!(prompts[0].contains("- self_pr lacks a concrete episode"));
        assert!(prompts[0].contains("REVIEWER FEEDBACK"));
        assert!(!prompts[0].contains("{transcript}"));
    }

    #[tokio::test]
    async fn test_extract_prompt_without_feedback_has_no_feedback_block() {
        let provider = ScriptedProvider::new(vec![Ok(
            r#"{"education": [], "work_history": [], "qualifications": []}"#.to_string(),
        )]);
        HearingChains::<Stage2Data>::extract(&chains(&provider), "transcript", &personal_info(), &[])
            .await
            .unwrap();
        let prompts = provider.prompts.lock().unwrap();
        assert!(!prompts[0].contains("REVIEWER FEEDBACK"));
        assert!(prompts[0].contains("\"work_history\""));
    }

    #[tokio::test]
    async fn test_check_quality_parses_verdict() {
        let provider = ScriptedProvider::new(vec![Ok(
            r#"{"acceptable": false, "issues": ["motivation is generic"], "suggested_fix": "cite the store"}"#
                .to_string(),
        )]);
        let data: Stage1Data = parse_response(STAGE1_REPLY).unwrap();
        let verdict =
            HearingChains::<Stage1Data>::check_quality(&chains(&provider), &data, "transcript", &personal_info())
                .await;
        assert!(!verdict.acceptable);
        assert_eq!(verdict.issues, vec!["motivation is generic".to_string()]);
        assert_eq!(verdict.suggested_fix, "cite the store");
        assert!(provider.prompts.lock().unwrap()[0].contains("\"motivation\": \"m\""));
    }

    #[tokio::test]
    async fn test_check_quality_fails_closed() {
        let data: Stage1Data = parse_response(STAGE1_REPLY).unwrap();

        let provider = ScriptedProvider::new(vec![Err(LlmError::Api {
            status: 500,
            message: "boom".to_string(),
        })]);
        let verdict =
            HearingChains::<Stage1Data>::check_quality(&chains(&provider), &data, "t", &personal_info())
                .await;
        assert!(!verdict.acceptable);
        assert!(verdict.issues[0].contains("provider error"));

        let provider = ScriptedProvider::new(vec![Ok(r#"{"issues": []}"#.to_string())]);
        let verdict =
            HearingChains::<Stage1Data>::check_quality(&chains(&provider), &data, "t", &personal_info())
                .await;
        assert!(!verdict.acceptable);
        assert!(verdict.issues[0].contains("malformed verdict"));
    }

    #[test]
    fn test_personal_info_age_from_birth_date() {
        let today = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        let info = PersonalInfo {
            name: "Tanaka".to_string(),
            age: None,
            birth_date: NaiveDate::from_ymd_opt(1997, 4, 2),
            prefecture: None,
        };
        assert_eq!(info.age_on(today), Some(28));

        let rendered = info.render_as_of(today);
        assert!(rendered.contains("- Age: 28"));
        assert!(rendered.contains("- Birth date: 1997-04-02"));
        assert!(!rendered.contains("Prefecture"));
    }

    #[test]
    fn test_personal_info_unknown_name() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let rendered = PersonalInfo::default().render_as_of(today);
        assert!(rendered.contains("- Name: (unknown)"));
    }

    #[test]
    fn test_stage_configs_are_distinct() {
        let one = StageConfig::for_stage(Stage::Stage1);
        let two = StageConfig::for_stage(Stage::Stage2);
        assert!(std::ptr::eq(one, &STAGE1_CONFIG));
        assert!(std::ptr::eq(two, &STAGE2_CONFIG));
        assert_ne!(one.extraction_template, two.extraction_template);
        assert_ne!(one.quality_focus, two.quality_focus);
    }
}
