//! Per-persona sliding-window rate gate.
//!
//! Stateless: every check recounts the persona's records in the store, so
//! there are no counters to keep in sync.

use std::time::Duration;

use crate::db::Db;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct RateGate {
    ceiling: u64,
    window: Duration,
    retry_after: Duration,
}

impl RateGate {
    /// Retry-after equals the window length.
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            ceiling: ceiling as u64,
            window,
            retry_after: window,
        }
    }

    /// Count records created for `persona_id` in `(now - window, now]` and
    /// reject at or above the ceiling. Runs before any record is created.
    pub fn check(&self, db: &Db, persona_id: &str, now: i64) -> Result<RateDecision, StoreError> {
        let since = now - self.window.as_secs() as i64;
        let recent = db.count_recent(persona_id, since)?;
        if recent >= self.ceiling {
            tracing::info!(persona_id, recent, ceiling = self.ceiling, "Rate limited");
            return Ok(RateDecision::Rejected {
                retry_after_secs: self.retry_after.as_secs(),
            });
        }
        Ok(RateDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::new_text;
    use crate::model::now_secs;

    #[test]
    fn thirty_first_request_is_rejected_until_oldest_ages_out() {
        let db = Db::open_memory().unwrap();
        let gate = RateGate::new(30, Duration::from_secs(3600));
        let mut ids = Vec::new();
        for i in 0..30 {
            assert_eq!(gate.check(&db, "p1", now_secs()).unwrap(), RateDecision::Allowed);
            ids.push(db.insert_generation(&new_text("p1", &format!("post {i}"))).unwrap().id);
        }

        match gate.check(&db, "p1", now_secs()).unwrap() {
            RateDecision::Rejected { retry_after_secs } => assert_eq!(retry_after_secs, 3600),
            RateDecision::Allowed => panic!("31st request should be rejected"),
        }
        // Other personas are unaffected.
        assert_eq!(gate.check(&db, "p2", now_secs()).unwrap(), RateDecision::Allowed);

        db.set_created_at(&ids[0], now_secs() - 3601).unwrap();
        assert_eq!(gate.check(&db, "p1", now_secs()).unwrap(), RateDecision::Allowed);
    }
}
