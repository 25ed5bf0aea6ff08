//! Extraction state machine — the quality-gated loop at the heart of a hearing run.
//!
//! ```text
//! Start ─▶ Transcribing ─ok─▶ Extracting ─ok─▶ Validating ─accept─▶ Finalizing ─▶ Finalized
//!               │                 │  ▲             │
//!               │fail          fail│  └─ Retrying ◀┘reject (budget left)
//!               ▼                 ▼                 │reject (budget spent)
//!             Failed ◀────────────┴─────────────────┘
//! ```
//!
//! [`transition`] is a pure function of `(state, event, budget)`. [`ExtractionMachine`]
//! performs the chain call each state asks for, turns the outcome into an [`Event`],
//! and applies the resulting [`Effect`]s to its [`RunState`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hearing::audio::AudioInput;
use crate::hearing::chains::{HearingChains, PersonalInfo};
use crate::hearing::error::{ChainError, FailureKind, FailurePhase, PipelineError};
use crate::hearing::schema::{QualityVerdict, StageData};

/// Retry budget used when none is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Per-call timeout used when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry budget and per-call timeout for a run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// States, events, effects
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    Start,
    Transcribing,
    Extracting,
    Validating,
    Retrying,
    Finalizing,
    Finalized,
    Failed,
}

impl MachineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Finalized | MachineState::Failed)
    }

    /// The phase a failure in this state is attributed to.
    pub fn phase(&self) -> FailurePhase {
        match self {
            MachineState::Start | MachineState::Transcribing => FailurePhase::Transcription,
            MachineState::Extracting | MachineState::Retrying => FailurePhase::Extraction,
            MachineState::Validating
            | MachineState::Finalizing
            | MachineState::Finalized
            | MachineState::Failed => FailurePhase::Validation,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of the work done in a state, fed back into [`transition`].
#[derive(Debug)]
pub enum Event<D> {
    Begin,
    Transcribed(String),
    TranscriptionFailed(ChainError),
    Extracted(D),
    ExtractionFailed(ChainError),
    Judged(QualityVerdict),
    /// Advances the pass-through states (`Retrying`, `Finalizing`).
    Proceed,
    Cancelled,
}

impl<D> Event<D> {
    fn name(&self) -> &'static str {
        match self {
            Event::Begin => "Begin",
            Event::Transcribed(_) => "Transcribed",
            Event::TranscriptionFailed(_) => "TranscriptionFailed",
            Event::Extracted(_) => "Extracted",
            Event::ExtractionFailed(_) => "ExtractionFailed",
            Event::Judged(_) => "Judged",
            Event::Proceed => "Proceed",
            Event::Cancelled => "Cancelled",
        }
    }
}

/// A mutation of [`RunState`] requested by a transition.
#[derive(Debug, PartialEq)]
pub enum Effect<D> {
    StoreTranscript(String),
    StoreExtracted(D),
    StoreVerdict(QualityVerdict),
    /// Appends feedback for the next extraction attempt.
    RecordIssues(Vec<String>),
    ConsumeRetry,
    ComposeResult,
    Fail {
        phase: FailurePhase,
        kind: FailureKind,
        issue: String,
    },
}

/// How much of the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Budget {
    pub fn has_retry_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, PartialEq)]
pub struct Transition<D> {
    pub next: MachineState,
    pub effects: Vec<Effect<D>>,
}

impl<D> Transition<D> {
    fn to(next: MachineState, effects: Vec<Effect<D>>) -> Self {
        Self { next, effects }
    }

    fn fail(phase: FailurePhase, kind: FailureKind, issue: String) -> Self {
        Self::to(MachineState::Failed, vec![Effect::Fail { phase, kind, issue }])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transition function
// ────────────────────────────────────────────────────────────────────────────

/// Computes the next state and the effects to apply. Pure and total: any event a
/// state cannot handle moves the run to `Failed` instead of leaving it stuck.
pub fn transition<D>(state: MachineState, event: Event<D>, budget: Budget) -> Transition<D> {
    use MachineState::*;

    match (state, event) {
        (Start, Event::Begin) => Transition::to(Transcribing, vec![]),

        (Transcribing, Event::Transcribed(text)) => {
            if text.trim().is_empty() {
                Transition::fail(
                    FailurePhase::Transcription,
                    FailureKind::Transcription,
                    "transcription failed: provider returned an empty transcript".to_string(),
                )
            } else {
                Transition::to(Extracting, vec![Effect::StoreTranscript(text)])
            }
        }
        (Transcribing, Event::TranscriptionFailed(err)) => Transition::fail(
            FailurePhase::Transcription,
            FailureKind::Transcription,
            format!("transcription failed: {err}"),
        ),

        (Extracting, Event::Extracted(data)) => {
            Transition::to(Validating, vec![Effect::StoreExtracted(data)])
        }
        (Extracting, Event::ExtractionFailed(err)) => {
            let kind = match err {
                ChainError::Schema(_) => FailureKind::SchemaValidation,
                _ => FailureKind::ExtractionCall,
            };
            let issue = format!("extraction call failed: {err}");
            if budget.has_retry_left() {
                Transition::to(
                    Retrying,
                    vec![Effect::RecordIssues(vec![issue]), Effect::ConsumeRetry],
                )
            } else {
                Transition::fail(FailurePhase::Extraction, kind, issue)
            }
        }

        (Validating, Event::Judged(verdict)) if verdict.acceptable => {
            Transition::to(Finalizing, vec![Effect::StoreVerdict(verdict)])
        }
        (Validating, Event::Judged(verdict)) => {
            let feedback = verdict_feedback(&verdict);
            if budget.has_retry_left() {
                Transition::to(
                    Retrying,
                    vec![
                        Effect::StoreVerdict(verdict),
                        Effect::RecordIssues(feedback),
                        Effect::ConsumeRetry,
                    ],
                )
            } else {
                // Budget exhausted without an accepted verdict: hard failure.
                let issue = format!(
                    "quality check still rejected the extraction after {} retries",
                    budget.retry_count
                );
                Transition::to(
                    Failed,
                    vec![
                        Effect::StoreVerdict(verdict),
                        Effect::RecordIssues(feedback),
                        Effect::Fail {
                            phase: FailurePhase::Validation,
                            kind: FailureKind::QualityRejected,
                            issue,
                        },
                    ],
                )
            }
        }

        (Retrying, Event::Proceed) => Transition::to(Extracting, vec![]),
        (Finalizing, Event::Proceed) => Transition::to(Finalized, vec![Effect::ComposeResult]),

        (state, Event::Cancelled) if !state.is_terminal() => Transition::fail(
            state.phase(),
            FailureKind::Cancelled,
            format!("run cancelled while {state}"),
        ),

        (state, event) => Transition::fail(
            state.phase(),
            FailureKind::Internal,
            format!("event {} is not valid in state {state}", event.name()),
        ),
    }
}

/// Feedback carried into the next attempt: the verdict's issues plus its suggested fix.
fn verdict_feedback(verdict: &QualityVerdict) -> Vec<String> {
    let mut feedback: Vec<String> = verdict
        .issues
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty())
        .map(String::from)
        .collect();
    if feedback.is_empty() {
        feedback.push("quality check rejected the extraction without listing issues".to_string());
    }
    let fix = verdict.suggested_fix.trim();
    if !fix.is_empty() {
        feedback.push(format!("Suggested fix: {fix}"));
    }
    feedback
}

// ────────────────────────────────────────────────────────────────────────────
// Run state
// ────────────────────────────────────────────────────────────────────────────

/// The accepted output of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HearingResult<D> {
    pub transcript: String,
    pub data: D,
    pub retry_count: u32,
    pub extraction_attempts: u32,
}

/// Mutable state of one run. Owned by exactly one [`ExtractionMachine`].
#[derive(Debug)]
pub struct RunState<D> {
    pub state: MachineState,
    pub audio: AudioInput,
    pub personal_info: PersonalInfo,
    pub transcript: Option<String>,
    pub extracted: Option<D>,
    pub quality_verdict: Option<QualityVerdict>,
    pub retry_count: u32,
    pub extraction_attempts: u32,
    /// Accumulated, de-duplicated feedback for retries.
    pub issues: Vec<String>,
    pub result: Option<HearingResult<D>>,
}

impl<D: Clone> RunState<D> {
    pub fn new(audio: AudioInput, personal_info: PersonalInfo) -> Self {
        Self {
            state: MachineState::Start,
            audio,
            personal_info,
            transcript: None,
            extracted: None,
            quality_verdict: None,
            retry_count: 0,
            extraction_attempts: 0,
            issues: Vec::new(),
            result: None,
        }
    }

    fn budget(&self, max_retries: u32) -> Budget {
        Budget {
            retry_count: self.retry_count,
            max_retries,
        }
    }

    /// Applies `effects` in order. Returns the terminal error if one was requested.
    fn apply(&mut self, effects: Vec<Effect<D>>) -> Option<PipelineError> {
        let mut failure = None;
        for effect in effects {
            match effect {
                Effect::StoreTranscript(text) => self.transcript = Some(text),
                Effect::StoreExtracted(data) => self.extracted = Some(data),
                Effect::StoreVerdict(verdict) => self.quality_verdict = Some(verdict),
                Effect::RecordIssues(issues) => self.record_issues(issues),
                Effect::ConsumeRetry => self.retry_count += 1,
                Effect::ComposeResult => failure = self.compose_result(),
                Effect::Fail { phase, kind, issue } => {
                    failure = Some(self.failure(phase, kind, issue));
                }
            }
        }
        failure
    }

    fn record_issues(&mut self, issues: Vec<String>) {
        for issue in issues {
            if !self.issues.contains(&issue) {
                self.issues.push(issue);
            }
        }
    }

    fn compose_result(&mut self) -> Option<PipelineError> {
        match (&self.transcript, &self.extracted) {
            (Some(transcript), Some(data)) if !transcript.is_empty() => {
                self.result = Some(HearingResult {
                    transcript: transcript.clone(),
                    data: data.clone(),
                    retry_count: self.retry_count,
                    extraction_attempts: self.extraction_attempts,
                });
                None
            }
            _ => Some(self.failure(
                FailurePhase::Validation,
                FailureKind::Internal,
                "finalized without a transcript and extraction".to_string(),
            )),
        }
    }

    fn failure(&self, phase: FailurePhase, kind: FailureKind, issue: String) -> PipelineError {
        let mut issues = self.issues.clone();
        if !issues.contains(&issue) {
            issues.push(issue);
        }
        PipelineError {
            phase,
            kind,
            issues,
            retry_count: self.retry_count,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

enum Interrupted {
    TimedOut(Duration),
    Cancelled,
}

/// Drives one run to completion. Every chain call is raced against the per-call
/// timeout and the cancellation token.
pub struct ExtractionMachine<'a, D, C> {
    chains: &'a C,
    policy: RetryPolicy,
    cancel: &'a CancellationToken,
    run: RunState<D>,
}

impl<'a, D, C> ExtractionMachine<'a, D, C>
where
    D: StageData,
    C: HearingChains<D>,
{
    pub fn new(
        chains: &'a C,
        policy: RetryPolicy,
        cancel: &'a CancellationToken,
        run: RunState<D>,
    ) -> Self {
        Self {
            chains,
            policy,
            cancel,
            run,
        }
    }

    /// Runs until `Finalized` or `Failed`.
    pub async fn run(mut self) -> Result<HearingResult<D>, PipelineError> {
        let mut event = Event::Begin;
        loop {
            let from = self.run.state;
            let Transition { next, effects } =
                transition(from, event, self.run.budget(self.policy.max_retries));
            debug!(stage = ?D::STAGE, "Hearing run {from} -> {next}");

            let failure = self.run.apply(effects);
            self.run.state = next;

            match (next, failure) {
                (_, Some(err)) => {
                    self.run.state = MachineState::Failed;
                    warn!(stage = ?D::STAGE, "Hearing run failed: {err}");
                    return Err(err);
                }
                (MachineState::Finalized, None) => {
                    return self.run.result.take().ok_or_else(|| {
                        self.run.failure(
                            FailurePhase::Validation,
                            FailureKind::Internal,
                            "finalized without a result".to_string(),
                        )
                    });
                }
                (MachineState::Failed, None) => {
                    return Err(self.run.failure(
                        from.phase(),
                        FailureKind::Internal,
                        format!("run failed in {from} without a recorded cause"),
                    ));
                }
                _ => {}
            }

            event = self.step().await;
        }
    }

    /// Performs the work of the current state and reports its outcome.
    async fn step(&mut self) -> Event<D> {
        let chains = self.chains;
        match self.run.state {
            MachineState::Start => Event::Begin,
            MachineState::Transcribing => {
                match self.guarded(chains.transcribe(&self.run.audio)).await {
                    Ok(Ok(text)) => Event::Transcribed(text),
                    Ok(Err(err)) => Event::TranscriptionFailed(err),
                    Err(Interrupted::TimedOut(after)) => {
                        Event::TranscriptionFailed(ChainError::Timeout(after))
                    }
                    Err(Interrupted::Cancelled) => Event::Cancelled,
                }
            }
            MachineState::Extracting => {
                let Some(transcript) = self.run.transcript.as_deref() else {
                    return Event::ExtractionFailed(ChainError::EmptyTranscript);
                };
                self.run.extraction_attempts += 1;
                let call = chains.extract(transcript, &self.run.personal_info, &self.run.issues);
                match self.guarded(call).await {
                    Ok(Ok(data)) => Event::Extracted(data),
                    Ok(Err(err)) => Event::ExtractionFailed(err),
                    Err(Interrupted::TimedOut(after)) => {
                        Event::ExtractionFailed(ChainError::Timeout(after))
                    }
                    Err(Interrupted::Cancelled) => Event::Cancelled,
                }
            }
            MachineState::Validating => {
                let (Some(transcript), Some(extracted)) =
                    (self.run.transcript.as_deref(), self.run.extracted.as_ref())
                else {
                    return Event::Judged(QualityVerdict::fail_closed(
                        "nothing was extracted to judge",
                    ));
                };
                let call = chains.check_quality(extracted, transcript, &self.run.personal_info);
                match self.guarded(call).await {
                    Ok(verdict) => Event::Judged(verdict),
                    Err(Interrupted::TimedOut(after)) => Event::Judged(
                        QualityVerdict::fail_closed(format!("timed out after {after:?}")),
                    ),
                    Err(Interrupted::Cancelled) => Event::Cancelled,
                }
            }
            MachineState::Retrying | MachineState::Finalizing => {
                if self.cancel.is_cancelled() {
                    Event::Cancelled
                } else {
                    Event::Proceed
                }
            }
            // The driver returns before stepping a terminal state.
            MachineState::Finalized | MachineState::Failed => Event::Proceed,
        }
    }

    async fn guarded<F, T>(&self, call: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        let limit = self.policy.call_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            outcome = tokio::time::timeout(limit, call) => {
                outcome.map_err(|_| Interrupted::TimedOut(limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::hearing::schema::{SchemaError, Stage1Data};
    use crate::llm_client::LlmError;

    fn stage1(tag: &str) -> Stage1Data {
        Stage1Data {
            motivation: format!("motivation {tag}"),
            self_pr: format!("self pr {tag}"),
            preferences: "full-time".to_string(),
            hobbies: None,
        }
    }

    fn reject(issue: &str) -> QualityVerdict {
        QualityVerdict {
            acceptable: false,
            issues: vec![issue.to_string()],
            suggested_fix: format!("fix {issue}"),
        }
    }

    fn accept() -> QualityVerdict {
        QualityVerdict {
            acceptable: true,
            issues: vec![],
            suggested_fix: String::new(),
        }
    }

    enum Script<T> {
        Reply(T),
        Hang,
    }

    /// Chain double that replays scripted outcomes and records what it was given.
    struct ScriptedChains {
        transcript: Mutex<Option<Script<Result<String, ChainError>>>>,
        extractions: Mutex<VecDeque<Script<Result<Stage1Data, ChainError>>>>,
        verdicts: Mutex<VecDeque<Script<QualityVerdict>>>,
        transcribe_calls: AtomicU32,
        extract_calls: AtomicU32,
        quality_calls: AtomicU32,
        feedback_seen: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedChains {
        fn new(
            transcript: Result<String, ChainError>,
            extractions: Vec<Result<Stage1Data, ChainError>>,
            verdicts: Vec<QualityVerdict>,
        ) -> Self {
            Self {
                transcript: Mutex::new(Some(Script::Reply(transcript))),
                extractions: Mutex::new(extractions.into_iter().map(Script::Reply).collect()),
                verdicts: Mutex::new(verdicts.into_iter().map(Script::Reply).collect()),
                transcribe_calls: AtomicU32::new(0),
                extract_calls: AtomicU32::new(0),
                quality_calls: AtomicU32::new(0),
                feedback_seen: Mutex::new(Vec::new()),
            }
        }

        fn extract_calls(&self) -> u32 {
            self.extract_calls.load(Ordering::SeqCst)
        }

        fn quality_calls(&self) -> u32 {
            self.quality_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HearingChains<Stage1Data> for ScriptedChains {
        async fn transcribe(&self, _audio: &AudioInput) -> Result<String, ChainError> {
            self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
            let script = self.transcript.lock().unwrap().take();
            match script {
                Some(Script::Reply(reply)) => reply,
                Some(Script::Hang) => std::future::pending().await,
                None => Err(ChainError::EmptyTranscript),
            }
        }

        async fn extract(
            &self,
            _transcript: &str,
            _personal_info: &PersonalInfo,
            prior_issues: &[String],
        ) -> Result<Stage1Data, ChainError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            self.feedback_seen.lock().unwrap().push(prior_issues.to_vec());
            let script = self.extractions.lock().unwrap().pop_front();
            match script {
                Some(Script::Reply(reply)) => reply,
                Some(Script::Hang) => std::future::pending().await,
                None => Ok(stage1("default")),
            }
        }

        async fn check_quality(
            &self,
            _extracted: &Stage1Data,
            _transcript: &str,
            _personal_info: &PersonalInfo,
        ) -> QualityVerdict {
            self.quality_calls.fetch_add(1, Ordering::SeqCst);
            let script = self.verdicts.lock().unwrap().pop_front();
            match script {
                Some(Script::Reply(verdict)) => verdict,
                Some(Script::Hang) => std::future::pending().await,
                None => accept(),
            }
        }
    }

    fn run_state() -> RunState<Stage1Data> {
        RunState::new(
            AudioInput::new("AAEC", Some("audio/webm".to_string())),
            PersonalInfo::default(),
        )
    }

    async fn run(chains: &ScriptedChains) -> Result<HearingResult<Stage1Data>, PipelineError> {
        let cancel = CancellationToken::new();
        ExtractionMachine::new(chains, RetryPolicy::default(), &cancel, run_state())
            .run()
            .await
    }

    fn provider_down() -> ChainError {
        ChainError::Provider(LlmError::Api {
            status: 503,
            message: "unavailable".to_string(),
        })
    }

    // ── transition function ────────────────────────────────────────────────

    fn budget(retry_count: u32) -> Budget {
        Budget {
            retry_count,
            max_retries: 2,
        }
    }

    #[test]
    fn test_transition_happy_path() {
        let t = transition::<Stage1Data>(MachineState::Start, Event::Begin, budget(0));
        assert_eq!(t.next, MachineState::Transcribing);

        let t = transition::<Stage1Data>(
            MachineState::Transcribing,
            Event::Transcribed("hi".to_string()),
            budget(0),
        );
        assert_eq!(t.next, MachineState::Extracting);
        assert_eq!(t.effects, vec![Effect::StoreTranscript("hi".to_string())]);

        let t = transition(MachineState::Extracting, Event::Extracted(stage1("a")), budget(0));
        assert_eq!(t.next, MachineState::Validating);

        let t = transition::<Stage1Data>(MachineState::Validating, Event::Judged(accept()), budget(0));
        assert_eq!(t.next, MachineState::Finalizing);

        let t = transition::<Stage1Data>(MachineState::Finalizing, Event::Proceed, budget(0));
        assert_eq!(t.next, MachineState::Finalized);
        assert_eq!(t.effects, vec![Effect::ComposeResult]);
    }

    #[test]
    fn test_transition_rejection_with_budget_retries_with_feedback() {
        let t = transition::<Stage1Data>(
            MachineState::Validating,
            Event::Judged(reject("self_pr vague")),
            budget(1),
        );
        assert_eq!(t.next, MachineState::Retrying);
        assert!(t.effects.contains(&Effect::ConsumeRetry));
        assert!(t.effects.contains(&Effect::RecordIssues(vec![
            "self_pr vague".to_string(),
            "Suggested fix: fix self_pr vague".to_string(),
        ])));
    }

    #[test]
    fn test_transition_rejection_without_budget_fails_validation() {
        let t = transition::<Stage1Data>(
            MachineState::Validating,
            Event::Judged(reject("thin")),
            budget(2),
        );
        assert_eq!(t.next, MachineState::Failed);
        assert!(!t.effects.contains(&Effect::ConsumeRetry));
        assert!(t.effects.iter().any(|e| matches!(
            e,
            Effect::Fail {
                phase: FailurePhase::Validation,
                kind: FailureKind::QualityRejected,
                ..
            }
        )));
    }

    #[test]
    fn test_transition_schema_failure_counts_like_call_failure() {
        let schema_err = ChainError::Schema(SchemaError::InvalidJson("eof".to_string()));
        let t = transition::<Stage1Data>(
            MachineState::Extracting,
            Event::ExtractionFailed(schema_err),
            budget(0),
        );
        assert_eq!(t.next, MachineState::Retrying);
        assert!(t.effects.contains(&Effect::ConsumeRetry));

        let schema_err = ChainError::Schema(SchemaError::InvalidJson("eof".to_string()));
        let t = transition::<Stage1Data>(
            MachineState::Extracting,
            Event::ExtractionFailed(schema_err),
            budget(2),
        );
        assert_eq!(t.next, MachineState::Failed);
        assert!(matches!(
            t.effects[0],
            Effect::Fail {
                kind: FailureKind::SchemaValidation,
                phase: FailurePhase::Extraction,
                ..
            }
        ));
    }

    #[test]
    fn test_transition_blank_transcript_is_fatal() {
        let t = transition::<Stage1Data>(
            MachineState::Transcribing,
            Event::Transcribed("  ".to_string()),
            budget(0),
        );
        assert_eq!(t.next, MachineState::Failed);
    }

    #[test]
    fn test_transition_cancel_and_invalid_events_fail() {
        let t = transition::<Stage1Data>(MachineState::Validating, Event::Cancelled, budget(0));
        assert_eq!(t.next, MachineState::Failed);
        assert!(matches!(
            t.effects[0],
            Effect::Fail {
                kind: FailureKind::Cancelled,
                phase: FailurePhase::Validation,
                ..
            }
        ));

        let t = transition::<Stage1Data>(MachineState::Start, Event::Judged(accept()), budget(0));
        assert_eq!(t.next, MachineState::Failed);
        assert!(matches!(
            t.effects[0],
            Effect::Fail {
                kind: FailureKind::Internal,
                ..
            }
        ));
    }

    #[test]
    fn test_verdict_feedback_never_empty() {
        let verdict = QualityVerdict {
            acceptable: false,
            issues: vec!["  ".to_string()],
            suggested_fix: String::new(),
        };
        assert_eq!(verdict_feedback(&verdict).len(), 1);
    }

    // ── driver scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_transcription_failure_is_fatal() {
        let chains = ScriptedChains::new(Err(provider_down()), vec![], vec![]);
        let err = run(&chains).await.unwrap_err();

        assert_eq!(err.phase, FailurePhase::Transcription);
        assert_eq!(err.kind, FailureKind::Transcription);
        assert!(!err.issues.is_empty());
        assert_eq!(err.retry_count, 0);
        assert_eq!(chains.extract_calls(), 0);
        assert_eq!(chains.quality_calls(), 0);
    }

    #[tokio::test]
    async fn test_accepted_first_try() {
        let chains = ScriptedChains::new(
            Ok("I want to join.".to_string()),
            vec![Ok(stage1("first"))],
            vec![accept()],
        );
        let result = run(&chains).await.unwrap();

        assert_eq!(result.transcript, "I want to join.");
        assert_eq!(result.data, stage1("first"));
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.extraction_attempts, 1);
        assert_eq!(chains.extract_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_twice_then_accepted() {
        let chains = ScriptedChains::new(
            Ok("transcript".to_string()),
            vec![Ok(stage1("1")), Ok(stage1("2")), Ok(stage1("3"))],
            vec![reject("first"), reject("second"), accept()],
        );
        let result = run(&chains).await.unwrap();

        assert_eq!(result.retry_count, 2);
        assert_eq!(result.data, stage1("3"));
        assert_eq!(chains.extract_calls(), 3);
        assert_eq!(chains.extract_calls(), result.retry_count + 1);
    }

    #[tokio::test]
    async fn test_rejected_every_time_fails_validation() {
        let chains = ScriptedChains::new(
            Ok("transcript".to_string()),
            vec![],
            vec![reject("a"), reject("b"), reject("c"), accept()],
        );
        let err = run(&chains).await.unwrap_err();

        assert_eq!(err.phase, FailurePhase::Validation);
        assert_eq!(err.kind, FailureKind::QualityRejected);
        assert_eq!(err.retry_count, 2);
        assert_eq!(chains.extract_calls(), 3);
        assert_eq!(chains.quality_calls(), 3);
        assert!(err.issues.contains(&"c".to_string()));
        assert!(err.issues.last().unwrap().contains("after 2 retries"));
    }

    #[tokio::test]
    async fn test_feedback_reaches_next_extraction() {
        let chains = ScriptedChains::new(
            Ok("transcript".to_string()),
            vec![],
            vec![reject("motivation is generic"), accept()],
        );
        run(&chains).await.unwrap();

        let feedback = chains.feedback_seen.lock().unwrap();
        assert!(feedback[0].is_empty());
        assert!(feedback[1].contains(&"motivation is generic".to_string()));
        assert!(feedback[1].contains(&"Suggested fix: fix motivation is generic".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_extraction_consumes_budget_like_call_error() {
        let malformed = || ChainError::Schema(SchemaError::InvalidJson("eof".to_string()));

        let schema_chains = ScriptedChains::new(
            Ok("t".to_string()),
            vec![Err(malformed()), Ok(stage1("ok"))],
            vec![accept()],
        );
        let call_chains = ScriptedChains::new(
            Ok("t".to_string()),
            vec![Err(provider_down()), Ok(stage1("ok"))],
            vec![accept()],
        );

        let from_schema = run(&schema_chains).await.unwrap();
        let from_call = run(&call_chains).await.unwrap();
        assert_eq!(from_schema.retry_count, 1);
        assert_eq!(from_schema.retry_count, from_call.retry_count);
        assert_eq!(schema_chains.extract_calls(), call_chains.extract_calls());
    }

    #[tokio::test]
    async fn test_extraction_failures_exhaust_budget() {
        let chains = ScriptedChains::new(
            Ok("t".to_string()),
            vec![Err(provider_down()), Err(provider_down()), Err(provider_down())],
            vec![],
        );
        let err = run(&chains).await.unwrap_err();

        assert_eq!(err.phase, FailurePhase::Extraction);
        assert_eq!(err.kind, FailureKind::ExtractionCall);
        assert_eq!(err.retry_count, 2);
        assert_eq!(chains.extract_calls(), 3);
        assert_eq!(chains.quality_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_timeout_consumes_retry() {
        let chains = ScriptedChains::new(Ok("t".to_string()), vec![], vec![accept()]);
        chains.extractions.lock().unwrap().push_back(Script::Hang);

        let result = run(&chains).await.unwrap();
        assert_eq!(result.retry_count, 1);
        assert_eq!(chains.extract_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_timeout_fails_closed() {
        let chains = ScriptedChains::new(Ok("t".to_string()), vec![], vec![]);
        chains.verdicts.lock().unwrap().push_back(Script::Hang);

        let result = run(&chains).await.unwrap();
        assert_eq!(result.retry_count, 1);
        assert_eq!(chains.quality_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcription_timeout_is_fatal() {
        let chains = ScriptedChains::new(Ok("unused".to_string()), vec![], vec![]);
        *chains.transcript.lock().unwrap() = Some(Script::Hang);

        let err = run(&chains).await.unwrap_err();
        assert_eq!(err.phase, FailurePhase::Transcription);
        assert!(err.issues[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_during_call() {
        let chains = ScriptedChains::new(Ok("t".to_string()), vec![], vec![]);
        chains.extractions.lock().unwrap().push_back(Script::Hang);

        let cancel = CancellationToken::new();
        let machine =
            ExtractionMachine::new(&chains, RetryPolicy::default(), &cancel, run_state());
        let trigger = cancel.clone();
        let (outcome, _) = tokio::join!(machine.run(), async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });

        let err = outcome.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.phase, FailurePhase::Extraction);
        assert_eq!(chains.quality_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let chains = ScriptedChains::new(Ok("t".to_string()), vec![], vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ExtractionMachine::new(&chains, RetryPolicy::default(), &cancel, run_state())
            .run()
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.phase, FailurePhase::Transcription);
    }

    #[tokio::test]
    async fn test_zero_budget_fails_on_first_rejection() {
        let chains = ScriptedChains::new(Ok("t".to_string()), vec![], vec![reject("x")]);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };

        let err = ExtractionMachine::new(&chains, policy, &cancel, run_state())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.retry_count, 0);
        assert_eq!(chains.extract_calls(), 1);
    }
}
