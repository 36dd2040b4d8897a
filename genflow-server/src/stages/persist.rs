use async_trait::async_trait;

use crate::pipeline::{StageContext, StageExecutor, StageSignal};

/// Finalizes the output payload. The persona memory entry is recorded by
/// the terminal write itself, so a run that loses its claim leaves none.
pub(super) struct PersistStage;

#[async_trait]
impl StageExecutor for PersistStage {
    async fn execute(&self, mut ctx: StageContext) -> Result<(StageContext, String), StageSignal> {
        let mut output = ctx
            .assemble_output()
            .ok_or_else(|| StageSignal::Fault("nothing to persist".to_string()))?;
        output
            .extra
            .insert("total_tokens".into(), (output.usage.input_tokens + output.usage.output_tokens).to_string());

        ctx.output = Some(output);
        Ok((ctx, "Saved".to_string()))
    }
}
