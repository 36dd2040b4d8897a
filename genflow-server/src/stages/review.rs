use std::collections::HashSet;

use async_trait::async_trait;

use crate::pipeline::{StageContext, StageExecutor, StageSignal};

pub(super) struct QualityCheckStage {
    pub min_quality: f64,
}

#[async_trait]
impl StageExecutor for QualityCheckStage {
    async fn execute(&self, mut ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        let draft = ctx
            .draft
            .as_deref()
            .ok_or_else(|| StageSignal::Fault("no draft to review".to_string()))?;
        let score = quality_score(draft);
        if score < self.min_quality {
            return Err(StageSignal::Rejected(format!(
                "quality too low ({score:.2} < {:.2})",
                self.min_quality
            )));
        }
        ctx.quality_score = Some(score);
        Ok((ctx, format!("Quality score {score:.2}")))
    }
}

/// Heuristic score in `0.0..=1.0`: word variety, length and a closing mark.
pub(super) fn quality_score(draft: &str) -> f64 {
    let words: Vec<String> = draft.split_whitespace().map(|w| w.to_lowercase()).collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique = words.iter().collect::<HashSet<_>>().len() as f64;
    let variety = unique / words.len() as f64;
    let length = (words.len() as f64 / 8.0).min(1.0);
    let closed = draft
        .trim_end()
        .split_whitespace()
        .next_back()
        .is_some_and(|w| w.starts_with('#') || w.ends_with(['.', '!', '?']));
    let score = 0.2 + 0.4 * variety + 0.2 * length + if closed { 0.2 } else { 0.0 };
    score.clamp(0.0, 1.0)
}

pub(super) struct ModerateStage {
    /// Lowercased.
    pub blocked: Vec<String>,
    pub review: Vec<String>,
}

#[async_trait]
impl StageExecutor for ModerateStage {
    async fn execute(&self, ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        let draft = ctx.draft.as_deref().unwrap_or_default().to_lowercase();
        if let Some(term) = self.blocked.iter().find(|t| draft.contains(t.as_str())) {
            return Err(StageSignal::Rejected(format!("content contains blocked term `{term}`")));
        }
        if let Some(term) = self.review.iter().find(|t| draft.contains(t.as_str())) {
            return Err(StageSignal::Flagged(format!("content mentions `{term}`, held for review")));
        }
        Ok((ctx, "Content cleared".to_string()))
    }
}
