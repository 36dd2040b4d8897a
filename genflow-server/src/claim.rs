//! Claim coordination: the exclusive `pending -> processing` transition.
//!
//! Exactly one caller per generation id observes [`ClaimOutcome::Claimed`].
//! The guarantee rests on the store's conditional update; nothing here holds
//! a lock across the read-back.

use std::time::Duration;

use crate::db::Db;
use crate::error::StoreError;
use crate::model::{GenerationId, GenerationRecord, now_secs};

/// Proof of a won claim. Its token fences the single terminal write.
#[derive(Debug, Clone)]
pub struct ClaimTicket {
    pub token: String,
    pub claimed_at: i64,
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(ClaimTicket),
    AlreadyProcessing,
    AlreadyTerminal(GenerationRecord),
    NotFound,
}

pub struct ClaimCoordinator {
    lease: Option<Duration>,
}

impl ClaimCoordinator {
    /// `lease` of `None` never re-claims a `processing` record.
    pub fn new(lease: Option<Duration>) -> Self {
        Self { lease }
    }

    pub fn try_claim(&self, db: &Db, id: &GenerationId) -> Result<ClaimOutcome, StoreError> {
        let token = crate::ids::random_token(32);
        let now = now_secs();
        let lease_cutoff = self.lease.map(|l| now - l.as_secs() as i64);

        if db.claim(id, &token, now, lease_cutoff)? {
            tracing::info!(generation_id = %id, "Claim won");
            return Ok(ClaimOutcome::Claimed(ClaimTicket { token, claimed_at: now }));
        }

        let outcome = match db.get_generation(id)? {
            None => ClaimOutcome::NotFound,
            Some(rec) if rec.state.is_terminal() => ClaimOutcome::AlreadyTerminal(rec),
            Some(_) => ClaimOutcome::AlreadyProcessing,
        };
        tracing::debug!(generation_id = %id, ?outcome, "Claim not taken");
        Ok(outcome)
    }
}
