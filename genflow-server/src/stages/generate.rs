use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{CompletionOptions, LlmClient};
use crate::model::{GenerationKind, Usage};
use crate::pipeline::{StageContext, StageExecutor, StageSignal};

const GENERATE_SYSTEM: &str = "You write one social media post from the brief you are given. \
Stay under 280 characters unless the brief asks otherwise. Reply with the post text only.";

const OFFLINE_MODEL: &str = "offline";

pub(super) struct GenerateStage {
    pub llm: Option<Arc<LlmClient>>,
}

#[async_trait]
impl StageExecutor for GenerateStage {
    async fn execute(&self, mut ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        if ctx.record.kind == GenerationKind::Image {
            return Err(StageSignal::Fault("no image generation backend is configured".to_string()));
        }

        let Some(llm) = &self.llm else {
            let draft = compose_offline(&ctx);
            ctx.usage.output_tokens += draft.split_whitespace().count() as u64;
            ctx.draft = Some(draft);
            ctx.model = Some(OFFLINE_MODEL.to_string());
            ctx.extra.insert("provider".into(), OFFLINE_MODEL.into());
            return Ok((ctx, "Draft composed".to_string()));
        };

        let opts = CompletionOptions {
            max_tokens: ctx.options.max_tokens.unwrap_or(1024),
            temperature: ctx.options.temperature,
        };
        let completion = llm
            .complete(GENERATE_SYSTEM, &ctx.prompt, opts)
            .await
            .map_err(|e| StageSignal::Fault(format!("generation failed: {e:#}")))?;

        let Usage {
            input_tokens,
            output_tokens,
        } = completion.usage;
        ctx.usage.input_tokens += input_tokens;
        ctx.usage.output_tokens += output_tokens;
        ctx.draft = Some(completion.text.trim().to_string());
        ctx.model = Some(completion.model);
        ctx.extra.insert("provider".into(), "anthropic".into());
        Ok((ctx, "Draft generated".to_string()))
    }
}

/// Deterministic post built from the request itself.
fn compose_offline(ctx: &StageContext) -> String {
    let request = ctx.record.prompt.trim().trim_end_matches(['.', '!', '?']);
    let mut chars = request.chars();
    let mut post: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    post.push('.');
    if let Some(tone) = &ctx.options.tone {
        let tag: String = tone.chars().filter(|c| c.is_alphanumeric()).collect();
        if !tag.is_empty() {
            post.push_str(&format!(" #{tag}"));
        }
    }
    post
}
