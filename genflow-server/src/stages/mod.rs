//! Built-in stage executors.
//!
//! With an API key, enhance-prompt and generate call Claude. Without one they
//! fall back to deterministic offline implementations, which keeps the whole
//! pipeline runnable in tests and local setups.

mod context;
mod generate;
mod parse;
mod persist;
mod review;

pub use parse::{MAX_PROMPT_CHARS, validate_request};

use std::sync::Arc;

use crate::db::Db;
use crate::llm::LlmClient;
use crate::pipeline::StageExecutor;

/// Knobs for the review stages and context recall.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub min_quality: f64,
    pub blocked_terms: Vec<String>,
    pub review_terms: Vec<String>,
    /// How many memory entries recall-context loads.
    pub memory_depth: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            min_quality: 0.3,
            blocked_terms: Vec::new(),
            review_terms: Vec::new(),
            memory_depth: 5,
        }
    }
}

impl StageSettings {
    pub fn from_config(config: &crate::config::ServerConfig) -> Self {
        Self {
            min_quality: config.min_quality,
            blocked_terms: normalize_terms(&config.blocked_terms),
            review_terms: normalize_terms(&config.review_terms),
            ..Self::default()
        }
    }
}

fn normalize_terms(terms: &[String]) -> Vec<String> {
    terms
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// The seven default executors, in stage order.
pub fn default_stages(
    db: Arc<Db>,
    llm: Option<Arc<LlmClient>>,
    settings: StageSettings,
) -> [Arc<dyn StageExecutor>; 7] {
    [
        Arc::new(parse::ParseStage),
        Arc::new(context::RecallContextStage {
            db,
            depth: settings.memory_depth,
        }),
        Arc::new(context::EnhancePromptStage { llm: llm.clone() }),
        Arc::new(generate::GenerateStage { llm }),
        Arc::new(review::QualityCheckStage {
            min_quality: settings.min_quality,
        }),
        Arc::new(review::ModerateStage {
            blocked: settings.blocked_terms,
            review: settings.review_terms,
        }),
        Arc::new(persist::PersistStage),
    ]
}
