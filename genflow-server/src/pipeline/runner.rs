use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{ProgressEvent, Stage, StageContext, StageExecutor, StageSignal, TerminalInfo};
use crate::claim::ClaimTicket;
use crate::db::Db;
use crate::model::{GenerationId, GenerationRecord, GenerationState, TerminalOutcome, now_secs};

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Ordered stage executors plus the wall-clock budget for one run.
pub struct Pipeline {
    stages: Vec<(Stage, Arc<dyn StageExecutor>)>,
    budget: Duration,
}

impl Pipeline {
    /// Executors are given in [`Stage::ALL`] order.
    pub fn new(executors: [Arc<dyn StageExecutor>; 7], budget: Duration) -> Self {
        let stages = Stage::ALL.into_iter().zip(executors).collect();
        Self { stages, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Execute every stage for a claimed record and perform its single
    /// terminal write.
    ///
    /// `emit` is fire-and-forget: it is called after each completed stage and
    /// once more with the terminal event. Stage calls still in flight when the
    /// budget runs out are left to finish on their own; their results are
    /// dropped.
    pub async fn run<F>(
        &self,
        record: GenerationRecord,
        claim: &ClaimTicket,
        db: &Db,
        mut emit: F,
    ) -> TerminalOutcome
    where
        F: FnMut(ProgressEvent),
    {
        let id = record.id.clone();
        let deadline = Instant::now() + self.budget;
        let run_started = Instant::now();

        let (last_stage, outcome) = self.drive(StageContext::new(record), deadline, &mut emit).await;

        let outcome = write_terminal(db, &id, &claim.token, outcome).await;

        tracing::info!(
            generation_id = %id,
            state = %outcome.state(),
            elapsed_ms = run_started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );

        let message = match &outcome {
            TerminalOutcome::Approved(_) => "Generation complete".to_string(),
            other => other.reason().unwrap_or_default().to_string(),
        };
        emit(ProgressEvent {
            stage: last_stage,
            message,
            terminal: Some(TerminalInfo {
                state: outcome.state(),
                content: outcome.output().map(|o| o.content.clone()),
            }),
        });
        outcome
    }

    /// Run stages until one declines, the budget runs out, or all finish.
    /// Returns the last stage reached and the classified outcome.
    async fn drive<F>(
        &self,
        mut ctx: StageContext,
        deadline: Instant,
        emit: &mut F,
    ) -> (Stage, TerminalOutcome)
    where
        F: FnMut(ProgressEvent),
    {
        let id = ctx.record.id.clone();
        for (stage, exec) in &self.stages {
            let stage = *stage;
            if Instant::now() >= deadline {
                return (stage, self.timed_out(&id, stage));
            }

            let started = Instant::now();
            tracing::debug!(generation_id = %id, %stage, "Stage started");
            let exec = Arc::clone(exec);
            let handle = tokio::spawn(async move { exec.execute(ctx).await });

            let result = match tokio::time::timeout_at(deadline, handle).await {
                Err(_) => return (stage, self.timed_out(&id, stage)),
                Ok(Err(join_err)) => {
                    tracing::error!(generation_id = %id, %stage, "Stage task failed: {join_err}");
                    return (stage, TerminalOutcome::Error(format!("{stage} failed unexpectedly")));
                }
                Ok(Ok(result)) => result,
            };

            match result {
                Ok((next, message)) => {
                    tracing::debug!(
                        generation_id = %id,
                        %stage,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Stage finished"
                    );
                    ctx = next;
                    emit(ProgressEvent {
                        stage,
                        message,
                        terminal: None,
                    });
                }
                Err(signal) => {
                    tracing::info!(generation_id = %id, %stage, "Stage declined: {signal}");
                    return (stage, classify(signal));
                }
            }
        }

        match ctx.assemble_output() {
            Some(output) => (Stage::Persist, TerminalOutcome::Approved(output)),
            None => (
                Stage::Persist,
                TerminalOutcome::Error("pipeline produced no content".to_string()),
            ),
        }
    }

    fn timed_out(&self, id: &GenerationId, stage: Stage) -> TerminalOutcome {
        tracing::warn!(
            generation_id = %id,
            %stage,
            budget_secs = self.budget.as_secs(),
            "Pipeline budget exceeded"
        );
        TerminalOutcome::Error(format!(
            "timed out after {}s budget during {stage}",
            self.budget.as_secs()
        ))
    }
}

/// Persist the outcome under `token` and return what clients should be told.
///
/// A failing write is retried with backoff. Whatever ends up reported is
/// either the stored terminal state or an error without content; an outcome
/// that was never saved is not surfaced as if it were.
async fn write_terminal(
    db: &Db,
    id: &GenerationId,
    token: &str,
    outcome: TerminalOutcome,
) -> TerminalOutcome {
    let mut attempt = 1;
    loop {
        match db.complete(id, token, &outcome, now_secs()) {
            Ok(true) => return outcome,
            Ok(false) => {
                tracing::warn!(generation_id = %id, "Terminal write refused, claim no longer held");
                return match db.get_generation(id) {
                    Ok(Some(stored)) if stored.state.is_terminal() => stored_outcome(stored),
                    _ => TerminalOutcome::Error("claim was taken over by another run".to_string()),
                };
            }
            Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                tracing::warn!(generation_id = %id, attempt, "Terminal write failed, retrying: {e}");
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(generation_id = %id, attempt, "Terminal write failed: {e}");
                return TerminalOutcome::Error("result could not be saved".to_string());
            }
        }
    }
}

fn classify(signal: StageSignal) -> TerminalOutcome {
    match signal {
        StageSignal::Fault(reason) => TerminalOutcome::Error(reason),
        StageSignal::Rejected(reason) => TerminalOutcome::Rejected(reason),
        StageSignal::Flagged(reason) => TerminalOutcome::Flagged(reason),
    }
}

/// Rebuild the outcome another writer persisted.
fn stored_outcome(rec: GenerationRecord) -> TerminalOutcome {
    let reason = rec.error_reason.unwrap_or_default();
    match (rec.state, rec.output) {
        (GenerationState::Approved, Some(out)) => TerminalOutcome::Approved(out),
        (GenerationState::Rejected, _) => TerminalOutcome::Rejected(reason),
        (GenerationState::Flagged, _) => TerminalOutcome::Flagged(reason),
        _ => TerminalOutcome::Error(reason),
    }
}
