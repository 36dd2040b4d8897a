use async_trait::async_trait;

use crate::model::{GenerationOptions, ModelParams};
use crate::pipeline::{StageContext, StageExecutor, StageSignal};

pub const MAX_PROMPT_CHARS: usize = 4000;
const MAX_TONE_CHARS: usize = 64;

/// Check a prompt and its model parameters.
///
/// Returns the trimmed prompt and the typed options, or a message naming
/// the first problem found.
pub fn validate_request(prompt: &str, params: &ModelParams) -> Result<(String, GenerationOptions), String> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err("prompt must not be empty".to_string());
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(format!("prompt exceeds {MAX_PROMPT_CHARS} characters"));
    }

    let mut options = GenerationOptions::default();
    for (key, value) in params {
        match key.as_str() {
            "temperature" => {
                let t = value
                    .as_f64()
                    .filter(|t| (0.0..=1.0).contains(t))
                    .ok_or("temperature must be a number between 0 and 1")?;
                options.temperature = Some(t);
            }
            "max_tokens" => {
                let n = value
                    .as_u64()
                    .filter(|n| (1..=4096).contains(n))
                    .ok_or("max_tokens must be an integer between 1 and 4096")?;
                options.max_tokens = Some(n as u32);
            }
            "tone" => {
                let tone = value
                    .as_str()
                    .map(str::trim)
                    .filter(|t| !t.is_empty() && t.chars().count() <= MAX_TONE_CHARS)
                    .ok_or("tone must be a short non-empty string")?;
                options.tone = Some(tone.to_string());
            }
            other => return Err(format!("unknown model parameter `{other}`")),
        }
    }
    Ok((prompt.to_string(), options))
}

pub(super) struct ParseStage;

#[async_trait]
impl StageExecutor for ParseStage {
    async fn execute(&self, mut ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        let (prompt, options) =
            validate_request(&ctx.record.prompt, &ctx.record.params).map_err(StageSignal::Fault)?;
        ctx.prompt = prompt;
        ctx.options = options;
        Ok((ctx, "Request parsed".to_string()))
    }
}
