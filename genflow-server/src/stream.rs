//! Stream adapter: bridges one client connection to a generation's lifecycle.
//!
//! On attach the record's current state picks one of three paths:
//! - terminal: send the final event and close;
//! - processing: poll the store until terminal or the budget runs out;
//! - pending: try to claim, and on success run the pipeline with progress
//!   pushed live to this connection. A lost race falls back to the other two.
//!
//! Each attach runs on its own task. Dropping the receiver detaches the sink
//! but never cancels a pipeline run.

use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::claim::{ClaimCoordinator, ClaimOutcome};
use crate::db::Db;
use crate::model::{GenerationId, GenerationRecord, GenerationState};
use crate::pipeline::{Pipeline, ProgressEvent, Stage};

/// Internal stage -> public label. Stages missing here are never surfaced.
const PUBLIC_STAGES: &[(Stage, &str)] = &[
    (Stage::Parse, "preparing"),
    (Stage::RecallContext, "preparing"),
    (Stage::EnhancePrompt, "enhancing"),
    (Stage::Generate, "generating"),
    (Stage::QualityCheck, "reviewing"),
    (Stage::Moderate, "reviewing"),
];

const HEARTBEAT_LABEL: &str = "processing";

pub fn public_stage(stage: Stage) -> Option<&'static str> {
    PUBLIC_STAGES
        .iter()
        .find(|(s, _)| *s == stage)
        .map(|(_, label)| *label)
}

/// Label carried by the final event.
fn final_label(state: GenerationState) -> &'static str {
    match state {
        GenerationState::Approved => "complete",
        other => other.as_str(),
    }
}

/// One event as sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(skip)]
    pub is_final: bool,
    pub generation_id: GenerationId,
    pub stage: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<GenerationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl StreamEvent {
    /// Final event for a record that is already terminal.
    fn from_terminal_record(rec: &GenerationRecord) -> Self {
        let message = match rec.state {
            GenerationState::Approved => "Generation complete".to_string(),
            _ => rec.error_reason.clone().unwrap_or_default(),
        };
        Self {
            is_final: true,
            generation_id: rec.id.clone(),
            stage: final_label(rec.state),
            message,
            state: Some(rec.state),
            content: rec.output.as_ref().map(|o| o.content.clone()),
        }
    }

    /// Map a runner event. `None` for stages without a public label.
    fn from_progress(id: &GenerationId, ev: ProgressEvent) -> Option<Self> {
        match ev.terminal {
            Some(terminal) => Some(Self {
                is_final: true,
                generation_id: id.clone(),
                stage: final_label(terminal.state),
                message: ev.message,
                state: Some(terminal.state),
                content: terminal.content,
            }),
            None => Some(Self {
                is_final: false,
                generation_id: id.clone(),
                stage: public_stage(ev.stage)?,
                message: ev.message,
                state: None,
                content: None,
            }),
        }
    }

    fn heartbeat(id: &GenerationId) -> Self {
        Self {
            is_final: false,
            generation_id: id.clone(),
            stage: HEARTBEAT_LABEL,
            message: "Still working".to_string(),
            state: Some(GenerationState::Processing),
            content: None,
        }
    }

    pub fn to_sse(&self) -> Event {
        let name = if self.is_final { "final" } else { "progress" };
        Event::default()
            .event(name)
            .data(serde_json::to_string(self).unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub heartbeat: bool,
    /// Whether a `processing` record may be re-claimed on attach.
    pub lease: Option<Duration>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            heartbeat: true,
            lease: None,
        }
    }
}

pub struct StreamAdapter {
    db: Arc<Db>,
    claims: ClaimCoordinator,
    pipeline: Arc<Pipeline>,
    settings: StreamSettings,
}

impl StreamAdapter {
    pub fn new(db: Arc<Db>, pipeline: Arc<Pipeline>, settings: StreamSettings) -> Self {
        Self {
            db,
            claims: ClaimCoordinator::new(settings.lease),
            pipeline,
            settings,
        }
    }

    /// Attach a connection to `record` as read by the caller.
    ///
    /// Returns the receiving end of the connection's event sink. The sender
    /// is dropped after the final event, or when polling gives up.
    pub fn attach(self: &Arc<Self>, record: GenerationRecord) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Arc::clone(self);
        tokio::spawn(async move { adapter.drive(record, tx).await });
        rx
    }

    async fn drive(&self, record: GenerationRecord, tx: mpsc::UnboundedSender<StreamEvent>) {
        let id = record.id.clone();
        match record.state {
            s if s.is_terminal() => {
                let _ = tx.send(StreamEvent::from_terminal_record(&record));
            }
            GenerationState::Processing if self.settings.lease.is_none() => {
                self.poll(&id, &tx).await;
            }
            _ => self.claim_and_run(record, &tx).await,
        }
    }

    async fn claim_and_run(&self, mut record: GenerationRecord, tx: &mpsc::UnboundedSender<StreamEvent>) {
        let id = record.id.clone();
        let ticket = match self.claims.try_claim(&self.db, &id) {
            Ok(ClaimOutcome::Claimed(ticket)) => ticket,
            Ok(ClaimOutcome::AlreadyProcessing) => return self.poll(&id, tx).await,
            Ok(ClaimOutcome::AlreadyTerminal(rec)) => {
                let _ = tx.send(StreamEvent::from_terminal_record(&rec));
                return;
            }
            Ok(ClaimOutcome::NotFound) => return,
            Err(e) => {
                tracing::error!(generation_id = %id, "Claim failed: {e}");
                return;
            }
        };

        record.state = GenerationState::Processing;
        record.claimed_at = Some(ticket.claimed_at);

        let mut detached = false;
        self.pipeline
            .run(record, &ticket, &self.db, |ev| {
                let Some(event) = StreamEvent::from_progress(&id, ev) else {
                    return;
                };
                if tx.send(event).is_err() && !detached {
                    detached = true;
                    tracing::info!(generation_id = %id, "Client gone, pipeline continues without a listener");
                }
            })
            .await;
    }

    /// Read-only fallback for connections that do not hold the claim.
    async fn poll(&self, id: &GenerationId, tx: &mpsc::UnboundedSender<StreamEvent>) {
        let deadline = Instant::now() + self.pipeline.budget();
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(generation_id = %id, "Poll budget exhausted, closing stream");
                    return;
                }
                _ = tx.closed() => return,
            }

            let state = match self.db.get_state(id) {
                Ok(Some(state)) => state,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(generation_id = %id, "Poll failed: {e}");
                    continue;
                }
            };
            if state.is_terminal() {
                match self.db.get_generation(id) {
                    Ok(Some(rec)) => {
                        let _ = tx.send(StreamEvent::from_terminal_record(&rec));
                        return;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(generation_id = %id, "Poll failed: {e}");
                        continue;
                    }
                }
            }
            if self.settings.heartbeat && tx.send(StreamEvent::heartbeat(id)).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::new_text;
    use crate::model::now_secs;
    use crate::pipeline::StageExecutor;
    use crate::pipeline::testing::{Counting, echo_draft, happy_path};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(20),
            heartbeat: true,
            lease: None,
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn adapter(db: &Arc<Db>, pipeline: Pipeline, settings: StreamSettings) -> Arc<StreamAdapter> {
        Arc::new(StreamAdapter::new(Arc::clone(db), Arc::new(pipeline), settings))
    }

    fn counting_pipeline(calls: &Arc<AtomicUsize>, delay: Duration, budget: Duration) -> Pipeline {
        let counting: Arc<dyn StageExecutor> = Arc::new(Counting {
            calls: Arc::clone(calls),
            delay,
        });
        let mut stages = Stage::ALL.map(|_| Arc::clone(&counting));
        stages[3] = echo_draft();
        Pipeline::new(stages, budget)
    }

    #[test]
    fn public_vocabulary_collapses_and_drops() {
        assert_eq!(public_stage(Stage::Parse), Some("preparing"));
        assert_eq!(public_stage(Stage::RecallContext), Some("preparing"));
        assert_eq!(public_stage(Stage::Generate), Some("generating"));
        assert_eq!(public_stage(Stage::Moderate), Some("reviewing"));
        assert_eq!(public_stage(Stage::Persist), None);
    }

    #[tokio::test]
    async fn claiming_attach_streams_live_progress() {
        let db = Arc::new(Db::open_memory().unwrap());
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        let adapter = adapter(&db, Pipeline::new(happy_path(), Duration::from_secs(5)), fast_settings());

        let events = collect(adapter.attach(rec.clone())).await;
        let labels: Vec<_> = events.iter().map(|e| e.stage).collect();
        assert_eq!(
            labels,
            ["preparing", "preparing", "enhancing", "generating", "reviewing", "reviewing", "complete"]
        );
        let last = events.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.state, Some(GenerationState::Approved));
        assert_eq!(last.content.as_deref(), Some("draft: hello"));
        assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
    }

    #[tokio::test]
    async fn attach_after_terminal_replays_final_without_running() {
        let db = Arc::new(Db::open_memory().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter = adapter(
            &db,
            counting_pipeline(&calls, Duration::ZERO, Duration::from_secs(5)),
            fast_settings(),
        );
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        collect(adapter.attach(rec.clone())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let terminal = db.get_generation(&rec.id).unwrap().unwrap();
        let events = collect(adapter.attach(terminal)).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_final);
        assert_eq!(events[0].stage, "complete");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn concurrent_attaches_run_the_pipeline_once() {
        let db = Arc::new(Db::open_memory().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter = adapter(
            &db,
            counting_pipeline(&calls, Duration::from_millis(10), Duration::from_secs(5)),
            fast_settings(),
        );
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();

        // Every attacher read the record while it was still pending.
        let receivers: Vec<_> = (0..4).map(|_| adapter.attach(rec.clone())).collect();
        let mut finals = 0;
        for rx in receivers {
            let events = collect(rx).await;
            let last = events.last().unwrap();
            assert!(last.is_final);
            assert_eq!(last.state, Some(GenerationState::Approved));
            // Nothing follows the final event.
            assert_eq!(events.iter().position(|e| e.is_final), Some(events.len() - 1));
            finals += 1;
        }
        assert_eq!(finals, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn processing_attach_polls_until_terminal() {
        let db = Arc::new(Db::open_memory().unwrap());
        let adapter = adapter(&db, Pipeline::new(happy_path(), Duration::from_secs(5)), fast_settings());
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        assert!(db.claim(&rec.id, "elsewhere", now_secs(), None).unwrap());
        let processing = db.get_generation(&rec.id).unwrap().unwrap();

        let rx = adapter.attach(processing);
        let writer = {
            let db = Arc::clone(&db);
            let id = rec.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let outcome = crate::model::TerminalOutcome::Flagged("needs a human".into());
                db.complete(&id, "elsewhere", &outcome, now_secs()).unwrap()
            })
        };

        let events = collect(rx).await;
        assert!(writer.await.unwrap());
        assert!(events.iter().any(|e| e.stage == "processing" && !e.is_final));
        let last = events.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.stage, "flagged");
        assert_eq!(last.message, "needs a human");
        assert!(last.content.is_none());
    }

    #[tokio::test]
    async fn polling_gives_up_at_budget_without_final() {
        let db = Arc::new(Db::open_memory().unwrap());
        let adapter = adapter(
            &db,
            Pipeline::new(happy_path(), Duration::from_millis(150)),
            fast_settings(),
        );
        let rec = db.insert_generation(&new_text("p1", "stuck")).unwrap();
        db.claim(&rec.id, "crashed-runner", now_secs(), None).unwrap();
        let processing = db.get_generation(&rec.id).unwrap().unwrap();

        let events = collect(adapter.attach(processing)).await;
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| !e.is_final && e.stage == "processing"));
        assert_eq!(db.get_state(&rec.id).unwrap(), Some(GenerationState::Processing));
    }

    #[tokio::test]
    async fn disconnect_does_not_cancel_the_run() {
        let db = Arc::new(Db::open_memory().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter = adapter(
            &db,
            counting_pipeline(&calls, Duration::from_millis(20), Duration::from_secs(5)),
            fast_settings(),
        );
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        drop(adapter.attach(rec.clone()));

        let started = Instant::now();
        while !db.get_state(&rec.id).unwrap().unwrap().is_terminal() {
            assert!(started.elapsed() < Duration::from_secs(5), "run never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(db.get_state(&rec.id).unwrap(), Some(GenerationState::Approved));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn zero_budget_surfaces_timeout_as_final_event() {
        let db = Arc::new(Db::open_memory().unwrap());
        let adapter = adapter(&db, Pipeline::new(happy_path(), Duration::ZERO), fast_settings());
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();

        let events = collect(adapter.attach(rec.clone())).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, "error");
        assert!(events[0].message.contains("timed out"));
        assert_eq!(db.get_state(&rec.id).unwrap(), Some(GenerationState::Error));
    }

    #[tokio::test]
    async fn lease_lets_attach_take_over_stale_processing() {
        let db = Arc::new(Db::open_memory().unwrap());
        let settings = StreamSettings {
            lease: Some(Duration::from_secs(60)),
            ..fast_settings()
        };
        let adapter = adapter(&db, Pipeline::new(happy_path(), Duration::from_secs(5)), settings);
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        db.claim(&rec.id, "crashed-runner", now_secs(), None).unwrap();
        db.set_claimed_at(&rec.id, now_secs() - 600).unwrap();
        let stale = db.get_generation(&rec.id).unwrap().unwrap();

        let events = collect(adapter.attach(stale)).await;
        assert_eq!(events.last().unwrap().state, Some(GenerationState::Approved));
    }

    #[test]
    fn sse_payload_omits_empty_fields() {
        let ev = StreamEvent::heartbeat(&GenerationId::new());
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["stage"], "processing");
        assert!(json.get("content").is_none());
        assert!(json.get("is_final").is_none());
    }
}
