use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Db;
use crate::llm::{CompletionOptions, LlmClient};
use crate::pipeline::{StageContext, StageExecutor, StageSignal};

const ENHANCE_SYSTEM: &str = "You turn a short request into a precise brief for a single social media post. \
Keep the author's intent and any stated tone. Do not repeat recent posts. \
Reply with the brief only.";

pub(super) struct RecallContextStage {
    pub db: Arc<Db>,
    pub depth: usize,
}

#[async_trait]
impl StageExecutor for RecallContextStage {
    async fn execute(&self, mut ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        let rows = self
            .db
            .recent_memory(&ctx.record.persona_id, self.depth)
            .map_err(|e| StageSignal::Fault(format!("memory lookup failed: {e}")))?;
        ctx.memory = rows.into_iter().map(|r| r.summary).collect();
        let message = match ctx.memory.len() {
            0 => "No earlier posts for this persona".to_string(),
            1 => "Recalled 1 earlier post".to_string(),
            n => format!("Recalled {n} earlier posts"),
        };
        Ok((ctx, message))
    }
}

pub(super) struct EnhancePromptStage {
    pub llm: Option<Arc<LlmClient>>,
}

#[async_trait]
impl StageExecutor for EnhancePromptStage {
    async fn execute(&self, mut ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        let brief = template_brief(&ctx);
        let Some(llm) = &self.llm else {
            ctx.prompt = brief;
            return Ok((ctx, "Prompt prepared".to_string()));
        };

        let completion = llm
            .complete(ENHANCE_SYSTEM, &brief, CompletionOptions::default())
            .await
            .map_err(|e| StageSignal::Fault(format!("prompt enhancement failed: {e:#}")))?;
        ctx.usage.input_tokens += completion.usage.input_tokens;
        ctx.usage.output_tokens += completion.usage.output_tokens;
        let text = completion.text.trim();
        ctx.prompt = if text.is_empty() { brief } else { text.to_string() };
        Ok((ctx, "Prompt enhanced".to_string()))
    }
}

/// Deterministic brief: tone, recent posts, then the request.
fn template_brief(ctx: &StageContext) -> String {
    let mut brief = String::new();
    if let Some(tone) = &ctx.options.tone {
        brief.push_str(&format!("Tone: {tone}\n"));
    }
    if !ctx.memory.is_empty() {
        brief.push_str("Recent posts:\n");
        for m in &ctx.memory {
            brief.push_str(&format!("- {m}\n"));
        }
    }
    brief.push_str(&format!("Request: {}", ctx.prompt));
    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::new_text;

    #[tokio::test]
    async fn offline_brief_includes_tone_and_memory() {
        let db = Arc::new(Db::open_memory().unwrap());
        db.insert_memory("p1", "g0", "Opening soon").unwrap();
        let rec = db.insert_generation(&new_text("p1", "grand opening")).unwrap();

        let mut ctx = StageContext::new(rec);
        ctx.options.tone = Some("cheerful".into());
        let recall = RecallContextStage { db, depth: 5 };
        let (ctx, msg) = recall.execute(ctx).await.unwrap();
        assert_eq!(msg, "Recalled 1 earlier post");

        let (ctx, _) = EnhancePromptStage { llm: None }.execute(ctx).await.unwrap();
        assert_eq!(
            ctx.prompt,
            "Tone: cheerful\nRecent posts:\n- Opening soon\nRequest: grand opening"
        );
    }
}
