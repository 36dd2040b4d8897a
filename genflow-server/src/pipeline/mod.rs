//! The generation pipeline: seven ordered stages and the runner that drives
//! them under a wall-clock budget.

mod runner;

pub use runner::Pipeline;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::model::{GenerationOptions, GenerationRecord, GenerationState, OutputPayload, Usage};

/// Internal stage identifiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    RecallContext,
    EnhancePrompt,
    Generate,
    QualityCheck,
    Moderate,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Parse,
        Stage::RecallContext,
        Stage::EnhancePrompt,
        Stage::Generate,
        Stage::QualityCheck,
        Stage::Moderate,
        Stage::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::RecallContext => "recall-context",
            Stage::EnhancePrompt => "enhance-prompt",
            Stage::Generate => "generate",
            Stage::QualityCheck => "quality-check",
            Stage::Moderate => "moderate",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated state handed from stage to stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub record: GenerationRecord,
    /// Working prompt. Starts as the request prompt; parse normalizes it and
    /// enhance-prompt rewrites it.
    pub prompt: String,
    /// Filled in by parse.
    pub options: GenerationOptions,
    /// Recent persona memory, newest first.
    pub memory: Vec<String>,
    pub draft: Option<String>,
    pub quality_score: Option<f64>,
    pub model: Option<String>,
    pub usage: Usage,
    pub extra: BTreeMap<String, String>,
    /// Set by persist; otherwise assembled from the fields above.
    pub output: Option<OutputPayload>,
}

impl StageContext {
    pub fn new(record: GenerationRecord) -> Self {
        Self {
            prompt: record.prompt.clone(),
            record,
            options: GenerationOptions::default(),
            memory: Vec::new(),
            draft: None,
            quality_score: None,
            model: None,
            usage: Usage::default(),
            extra: BTreeMap::new(),
            output: None,
        }
    }

    /// Output payload for an approved run. `None` if nothing was drafted.
    pub fn assemble_output(&self) -> Option<OutputPayload> {
        if let Some(out) = &self.output {
            return Some(out.clone());
        }
        let content = self.draft.clone()?;
        Some(OutputPayload {
            content,
            quality_score: self.quality_score.unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            usage: self.usage.clone(),
            extra: self.extra.clone(),
        })
    }
}

/// How a stage declines to continue. The variant picks the terminal state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageSignal {
    /// Infrastructure or input fault. Ends in `error`.
    #[error("{0}")]
    Fault(String),

    /// Content explicitly declined. Ends in `rejected`.
    #[error("{0}")]
    Rejected(String),

    /// Content needs human review. Ends in `flagged`.
    #[error("{0}")]
    Flagged(String),
}

/// One pipeline step.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run the stage, returning the updated context and a progress message.
    async fn execute(&self, ctx: StageContext) -> Result<(StageContext, String), StageSignal>;
}

/// Present only on the last event of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalInfo {
    pub state: GenerationState,
    /// Finished content; `Some` only for `approved`.
    pub content: Option<String>,
}

/// Emitted after each completed stage and once at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub terminal: Option<TerminalInfo>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}
