//! Stage orchestrator — selects the stage, builds a fresh run, drives it to the end.
//!
//! Holds no per-run state: every call gets its own [`RunState`], so concurrent
//! sessions can share one pipeline.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hearing::audio::AudioInput;
use crate::hearing::chains::{HearingChains, LlmChains, PersonalInfo};
use crate::hearing::error::PipelineError;
use crate::hearing::machine::{ExtractionMachine, HearingResult, RetryPolicy, RunState};
use crate::hearing::schema::{Stage, Stage1Data, Stage2Data, StageData};

/// The accepted result of either stage.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StageOutcome {
    Stage1(HearingResult<Stage1Data>),
    Stage2(HearingResult<Stage2Data>),
}

impl StageOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutcome::Stage1(_) => Stage::Stage1,
            StageOutcome::Stage2(_) => Stage::Stage2,
        }
    }

    pub fn transcript(&self) -> &str {
        match self {
            StageOutcome::Stage1(r) => &r.transcript,
            StageOutcome::Stage2(r) => &r.transcript,
        }
    }

    pub fn data_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            StageOutcome::Stage1(r) => serde_json::to_value(&r.data),
            StageOutcome::Stage2(r) => serde_json::to_value(&r.data),
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            StageOutcome::Stage1(r) => r.retry_count,
            StageOutcome::Stage2(r) => r.retry_count,
        }
    }

    pub fn extraction_attempts(&self) -> u32 {
        match self {
            StageOutcome::Stage1(r) => r.extraction_attempts,
            StageOutcome::Stage2(r) => r.extraction_attempts,
        }
    }

    /// Model calls made by the run: one transcription plus an extraction and a
    /// quality check per attempt.
    pub fn ai_calls(&self) -> u32 {
        1 + 2 * self.extraction_attempts()
    }
}

/// Runs one hearing stage end to end. The HTTP layer holds this as a trait object.
#[async_trait]
pub trait HearingRunner: Send + Sync {
    async fn run_stage(
        &self,
        stage: Stage,
        audio: AudioInput,
        personal_info: PersonalInfo,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError>;
}

/// Runs hearing stages with a fixed set of chains and retry policy.
pub struct HearingPipeline<C = LlmChains> {
    chains: C,
    policy: RetryPolicy,
}

impl<C> HearingPipeline<C>
where
    C: HearingChains<Stage1Data> + HearingChains<Stage2Data>,
{
    pub fn new(chains: C, policy: RetryPolicy) -> Self {
        Self { chains, policy }
    }

    /// Runs the machine for stage payload `D`.
    pub async fn run<D>(
        &self,
        audio: AudioInput,
        personal_info: PersonalInfo,
        cancel: &CancellationToken,
    ) -> Result<HearingResult<D>, PipelineError>
    where
        D: StageData,
        C: HearingChains<D>,
    {
        let run = RunState::new(audio, personal_info);
        ExtractionMachine::new(&self.chains, self.policy, cancel, run)
            .run()
            .await
    }
}

#[async_trait]
impl<C> HearingRunner for HearingPipeline<C>
where
    C: HearingChains<Stage1Data> + HearingChains<Stage2Data>,
{
    async fn run_stage(
        &self,
        stage: Stage,
        audio: AudioInput,
        personal_info: PersonalInfo,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError> {
        let outcome = match stage {
            Stage::Stage1 => {
                StageOutcome::Stage1(self.run::<Stage1Data>(audio, personal_info, cancel).await?)
            }
            Stage::Stage2 => {
                StageOutcome::Stage2(self.run::<Stage2Data>(audio, personal_info, cancel).await?)
            }
        };

        info!(
            "Hearing stage {} finalized after {} extraction attempt(s)",
            stage.number(),
            outcome.extraction_attempts()
        );
        Ok(outcome)
    }
}
