//! SQLite persistence layer: the generation record store.
//!
//! Holds generation records, the minimal persona ownership table, and the
//! per-persona memory. Uses WAL mode so polling readers do not block the
//! runner's writes.
//!
//! Every lifecycle mutation is a single conditional `UPDATE` scoped to one
//! id. The connection mutex only serializes access to the non-`Sync`
//! connection; exclusivity of a claim comes from the `WHERE` clause, so two
//! `Db` handles on the same file (or two processes) still agree.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::model::{
    GenerationId, GenerationKind, GenerationRecord, GenerationState, ModelParams, NewGeneration,
    OutputPayload, Persona, TerminalOutcome, now_secs,
};

type Result<T> = std::result::Result<T, StoreError>;

const GENERATION_COLUMNS: &str = "id, persona_id, requester, kind, prompt, params_json, state, \
     output_json, error_reason, created_at, claimed_at, completed_at";

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Mutex<Connection>,
}

/// One memory entry recorded for a persona.
#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub generation_id: String,
    pub summary: String,
    pub created_at: i64,
}

/// Counts used by the health endpoint and the boot report.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub terminal: u64,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS personas (
                id         TEXT PRIMARY KEY,
                owner      TEXT NOT NULL,
                name       TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_personas_owner ON personas(owner);

            CREATE TABLE IF NOT EXISTS generations (
                id           TEXT PRIMARY KEY,
                persona_id   TEXT NOT NULL,
                requester    TEXT NOT NULL,
                kind         TEXT NOT NULL,
                prompt       TEXT NOT NULL,
                params_json  TEXT NOT NULL DEFAULT '{}',
                state        TEXT NOT NULL DEFAULT 'pending',
                output_json  TEXT,
                error_reason TEXT,
                created_at   INTEGER NOT NULL,
                claimed_at   INTEGER,
                claim_token  TEXT,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_generations_persona_created
                ON generations(persona_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_generations_state
                ON generations(state);

            CREATE TRIGGER IF NOT EXISTS generations_terminal_immutable
                BEFORE UPDATE ON generations
                WHEN OLD.state IN ('approved', 'rejected', 'flagged', 'error')
            BEGIN
                SELECT RAISE(ABORT, 'terminal generation is immutable');
            END;

            CREATE TABLE IF NOT EXISTS persona_memory (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                persona_id    TEXT NOT NULL,
                generation_id TEXT NOT NULL,
                summary       TEXT NOT NULL,
                created_at    INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_persona_memory_persona
                ON persona_memory(persona_id, id DESC);
            ",
        )?;
        Ok(())
    }

    // ── Personas ───────────────────────────────────────────────────────

    pub fn insert_persona(&self, owner: &str, name: &str) -> Result<Persona> {
        let persona = Persona {
            id: crate::ids::generate(),
            owner: owner.to_string(),
            name: name.to_string(),
            created_at: now_secs(),
        };
        self.conn.lock().execute(
            "INSERT INTO personas (id, owner, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![persona.id, persona.owner, persona.name, persona.created_at],
        )?;
        Ok(persona)
    }

    pub fn get_persona(&self, id: &str) -> Result<Option<Persona>> {
        let conn = self.conn.lock();
        let persona = conn
            .query_row(
                "SELECT id, owner, name, created_at FROM personas WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Persona {
                        id: row.get(0)?,
                        owner: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(persona)
    }

    pub fn list_personas(&self, owner: &str) -> Result<Vec<Persona>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner, name, created_at FROM personas WHERE owner = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok(Persona {
                id: row.get(0)?,
                owner: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Generations ────────────────────────────────────────────────────

    /// Insert a new `pending` generation and return the stored record.
    pub fn insert_generation(&self, new: &NewGeneration) -> Result<GenerationRecord> {
        let record = GenerationRecord {
            id: GenerationId::new(),
            persona_id: new.persona_id.clone(),
            requester: new.requester.clone(),
            kind: new.kind,
            prompt: new.prompt.clone(),
            params: new.params.clone(),
            state: GenerationState::Pending,
            output: None,
            error_reason: None,
            created_at: now_secs(),
            claimed_at: None,
            completed_at: None,
        };
        let params_json = serde_json::to_string(&record.params)?;
        self.conn.lock().execute(
            "INSERT INTO generations (id, persona_id, requester, kind, prompt, params_json, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                record.id.as_str(),
                record.persona_id,
                record.requester,
                record.kind.as_str(),
                record.prompt,
                params_json,
                record.created_at,
            ],
        )?;
        Ok(record)
    }

    pub fn get_generation(&self, id: &GenerationId) -> Result<Option<GenerationRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {GENERATION_COLUMNS} FROM generations WHERE id = ?1");
        let raw = conn
            .query_row(&sql, params![id.as_str()], RawGeneration::from_row)
            .optional()?;
        raw.map(RawGeneration::into_record).transpose()
    }

    /// Read only the lifecycle state. Used by the polling fallback.
    pub fn get_state(&self, id: &GenerationId) -> Result<Option<GenerationState>> {
        let conn = self.conn.lock();
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM generations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        state
            .map(|s| GenerationState::parse(&s).ok_or_else(|| StoreError::Corrupt(format!("state {s}"))))
            .transpose()
    }

    /// Newest-first history for one persona.
    pub fn list_generations(&self, persona_id: &str, limit: usize) -> Result<Vec<GenerationRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {GENERATION_COLUMNS} FROM generations
             WHERE persona_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![persona_id, limit as i64], RawGeneration::from_row)?;
        let raws = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawGeneration::into_record).collect()
    }

    /// The `pending -> processing` edge.
    ///
    /// One statement: succeeds for exactly one caller per id. When
    /// `lease_cutoff` is set, a `processing` record claimed before the cutoff
    /// is taken over as well. Returns true if this call won the claim.
    pub fn claim(
        &self,
        id: &GenerationId,
        claim_token: &str,
        now: i64,
        lease_cutoff: Option<i64>,
    ) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE generations
             SET state = 'processing', claimed_at = ?2, claim_token = ?3
             WHERE id = ?1
               AND (state = 'pending'
                    OR (?4 IS NOT NULL AND state = 'processing' AND claimed_at < ?4))",
            params![id.as_str(), now, claim_token, lease_cutoff],
        )?;
        Ok(changed == 1)
    }

    /// The `processing -> terminal` edge, fenced by the claim token.
    ///
    /// Returns false if the record is no longer held by `claim_token`
    /// (already terminal, or taken over after lease expiry). An approved
    /// outcome also records its persona memory entry, in the same
    /// transaction, so only the run that wins the write is remembered.
    pub fn complete(
        &self,
        id: &GenerationId,
        claim_token: &str,
        outcome: &TerminalOutcome,
        now: i64,
    ) -> Result<bool> {
        let output_json = outcome.output().map(serde_json::to_string).transpose()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE generations
             SET state = ?3, output_json = ?4, error_reason = ?5, completed_at = ?6
             WHERE id = ?1 AND state = 'processing' AND claim_token = ?2",
            params![
                id.as_str(),
                claim_token,
                outcome.state().as_str(),
                output_json,
                outcome.reason(),
                now,
            ],
        )?;
        if changed != 1 {
            return Ok(false);
        }
        if let Some(output) = outcome.output() {
            tx.execute(
                "INSERT INTO persona_memory (persona_id, generation_id, summary, created_at)
                 SELECT persona_id, id, ?2, ?3 FROM generations WHERE id = ?1",
                params![id.as_str(), output.summary(), now],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn count_recent(&self, persona_id: &str, since: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM generations WHERE persona_id = ?1 AND created_at >= ?2",
            params![persona_id, since],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn state_counts(&self) -> Result<StateCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM generations GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = StateCounts::default();
        for row in rows {
            let (state, n) = row?;
            match GenerationState::parse(&state) {
                Some(GenerationState::Pending) => counts.pending += n as u64,
                Some(GenerationState::Processing) => counts.processing += n as u64,
                Some(_) => counts.terminal += n as u64,
                None => return Err(StoreError::Corrupt(format!("state {state}"))),
            }
        }
        Ok(counts)
    }

    /// `processing` records claimed before `cutoff`.
    pub fn count_stale_processing(&self, cutoff: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM generations WHERE state = 'processing' AND claimed_at < ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Persona memory ─────────────────────────────────────────────────

    /// Seed a memory entry directly.
    #[cfg(test)]
    pub(crate) fn insert_memory(&self, persona_id: &str, generation_id: &str, summary: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO persona_memory (persona_id, generation_id, summary, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![persona_id, generation_id, summary, now_secs()],
        )?;
        Ok(())
    }

    /// Most recent memory entries, newest first.
    pub fn recent_memory(&self, persona_id: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT generation_id, summary, created_at FROM persona_memory
             WHERE persona_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![persona_id, limit as i64], |row| {
            Ok(MemoryRow {
                generation_id: row.get(0)?,
                summary: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rewrite `created_at` of a non-terminal record.
    #[cfg(test)]
    pub(crate) fn set_created_at(&self, id: &GenerationId, created_at: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE generations SET created_at = ?2 WHERE id = ?1",
            params![id.as_str(), created_at],
        )?;
        Ok(())
    }

    /// Make every terminal write fail, as a full or broken disk would.
    #[cfg(test)]
    pub(crate) fn break_terminal_writes(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "CREATE TRIGGER generations_write_fails
                BEFORE UPDATE OF completed_at ON generations
             BEGIN
                SELECT RAISE(ABORT, 'disk I/O error');
             END;",
        )?;
        Ok(())
    }

    /// Rewrite `claimed_at` of a `processing` record.
    #[cfg(test)]
    pub(crate) fn set_claimed_at(&self, id: &GenerationId, claimed_at: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE generations SET claimed_at = ?2 WHERE id = ?1",
            params![id.as_str(), claimed_at],
        )?;
        Ok(())
    }
}

/// Column values as stored, before enum/JSON decoding.
struct RawGeneration {
    id: String,
    persona_id: String,
    requester: String,
    kind: String,
    prompt: String,
    params_json: String,
    state: String,
    output_json: Option<String>,
    error_reason: Option<String>,
    created_at: i64,
    claimed_at: Option<i64>,
    completed_at: Option<i64>,
}

impl RawGeneration {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            persona_id: row.get(1)?,
            requester: row.get(2)?,
            kind: row.get(3)?,
            prompt: row.get(4)?,
            params_json: row.get(5)?,
            state: row.get(6)?,
            output_json: row.get(7)?,
            error_reason: row.get(8)?,
            created_at: row.get(9)?,
            claimed_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<GenerationRecord> {
        let id = GenerationId::parse(&self.id)
            .ok_or_else(|| StoreError::Corrupt(format!("generation id {}", self.id)))?;
        let kind = GenerationKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("kind {}", self.kind)))?;
        let state = GenerationState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("state {}", self.state)))?;
        let params: ModelParams = serde_json::from_str(&self.params_json)?;
        let output: Option<OutputPayload> = self
            .output_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(GenerationRecord {
            id,
            persona_id: self.persona_id,
            requester: self.requester,
            kind,
            prompt: self.prompt,
            params,
            state,
            output,
            error_reason: self.error_reason,
            created_at: self.created_at,
            claimed_at: self.claimed_at,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::Usage;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    pub(crate) fn new_text(persona_id: &str, prompt: &str) -> NewGeneration {
        NewGeneration {
            persona_id: persona_id.to_string(),
            requester: "did:plc:alice".to_string(),
            kind: GenerationKind::Text,
            prompt: prompt.to_string(),
            params: ModelParams::new(),
        }
    }

    pub(crate) fn sample_output() -> OutputPayload {
        OutputPayload {
            content: "hello world".into(),
            quality_score: 0.8,
            model: "offline".into(),
            usage: Usage { input_tokens: 3, output_tokens: 2 },
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn insert_and_read_pending() {
        let db = Db::open_memory().unwrap();
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        let loaded = db.get_generation(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.state, GenerationState::Pending);
        assert_eq!(loaded.prompt, "hello");
        assert!(loaded.output.is_none());
        assert_eq!(db.get_state(&rec.id).unwrap(), Some(GenerationState::Pending));
    }

    #[test]
    fn claim_succeeds_once() {
        let db = Db::open_memory().unwrap();
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        assert!(db.claim(&rec.id, "a", now_secs(), None).unwrap());
        assert!(!db.claim(&rec.id, "b", now_secs(), None).unwrap());
        assert_eq!(db.get_state(&rec.id).unwrap(), Some(GenerationState::Processing));
    }

    #[test]
    fn claim_is_exclusive_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.db");
        let first = Db::open(&path).unwrap();
        let rec = first.insert_generation(&new_text("p1", "race")).unwrap();

        // Separate handles share no mutex; only the UPDATE decides.
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                let id = rec.id.clone();
                std::thread::spawn(move || {
                    let db = Db::open(&path).unwrap();
                    db.claim(&id, &format!("token-{i}"), now_secs(), None).unwrap()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn complete_requires_matching_claim_token() {
        let db = Db::open_memory().unwrap();
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        db.claim(&rec.id, "mine", now_secs(), None).unwrap();

        let outcome = TerminalOutcome::Approved(sample_output());
        assert!(!db.complete(&rec.id, "theirs", &outcome, now_secs()).unwrap());
        assert!(db.complete(&rec.id, "mine", &outcome, now_secs()).unwrap());

        let loaded = db.get_generation(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.state, GenerationState::Approved);
        assert_eq!(loaded.output.unwrap().content, "hello world");
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn only_the_winning_approved_write_is_remembered() {
        let db = Db::open_memory().unwrap();
        let approved = TerminalOutcome::Approved(sample_output());

        let kept = db.insert_generation(&new_text("p1", "kept")).unwrap();
        db.claim(&kept.id, "mine", now_secs(), None).unwrap();
        assert!(!db.complete(&kept.id, "theirs", &approved, now_secs()).unwrap());
        assert!(db.recent_memory("p1", 5).unwrap().is_empty());
        assert!(db.complete(&kept.id, "mine", &approved, now_secs()).unwrap());

        let declined = db.insert_generation(&new_text("p1", "declined")).unwrap();
        db.claim(&declined.id, "t", now_secs(), None).unwrap();
        db.complete(&declined.id, "t", &TerminalOutcome::Flagged("review".into()), now_secs())
            .unwrap();

        let mem = db.recent_memory("p1", 5).unwrap();
        assert_eq!(mem.len(), 1);
        assert_eq!(mem[0].generation_id, kept.id.as_str());
        assert_eq!(mem[0].summary, "hello world");
    }

    #[test]
    fn failed_terminal_write_leaves_no_trace() {
        let db = Db::open_memory().unwrap();
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        db.claim(&rec.id, "t", now_secs(), None).unwrap();
        db.break_terminal_writes().unwrap();

        let approved = TerminalOutcome::Approved(sample_output());
        assert!(db.complete(&rec.id, "t", &approved, now_secs()).is_err());
        assert_eq!(db.get_state(&rec.id).unwrap(), Some(GenerationState::Processing));
        assert!(db.recent_memory("p1", 5).unwrap().is_empty());
    }

    #[test]
    fn terminal_records_are_write_once() {
        let db = Db::open_memory().unwrap();
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        db.claim(&rec.id, "t", now_secs(), None).unwrap();
        db.complete(&rec.id, "t", &TerminalOutcome::Rejected("nope".into()), now_secs())
            .unwrap();

        // The runner path refuses...
        let again = TerminalOutcome::Approved(sample_output());
        assert!(!db.complete(&rec.id, "t", &again, now_secs()).unwrap());
        assert!(!db.claim(&rec.id, "t2", now_secs(), Some(now_secs() + 10)).unwrap());
        // ...and so does a raw update, via the trigger.
        assert!(db.set_created_at(&rec.id, 0).is_err());

        let loaded = db.get_generation(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.state, GenerationState::Rejected);
        assert_eq!(loaded.error_reason.as_deref(), Some("nope"));
        assert!(loaded.output.is_none());
    }

    #[test]
    fn expired_lease_can_be_reclaimed() {
        let db = Db::open_memory().unwrap();
        let rec = db.insert_generation(&new_text("p1", "hello")).unwrap();
        let now = now_secs();
        db.claim(&rec.id, "old", now, None).unwrap();
        db.set_claimed_at(&rec.id, now - 1000).unwrap();

        // Without a lease nothing happens.
        assert!(!db.claim(&rec.id, "new", now, None).unwrap());
        // With a cutoff after the old claim the record is taken over.
        assert!(db.claim(&rec.id, "new", now, Some(now - 500)).unwrap());
        // The superseded runner can no longer write.
        let outcome = TerminalOutcome::Error("late".into());
        assert!(!db.complete(&rec.id, "old", &outcome, now).unwrap());
        assert!(db.complete(&rec.id, "new", &outcome, now).unwrap());
    }

    #[test]
    fn count_recent_uses_created_at_window() {
        let db = Db::open_memory().unwrap();
        let a = db.insert_generation(&new_text("p1", "a")).unwrap();
        db.insert_generation(&new_text("p1", "b")).unwrap();
        db.insert_generation(&new_text("p2", "c")).unwrap();
        let now = now_secs();
        assert_eq!(db.count_recent("p1", now - 3600).unwrap(), 2);
        db.set_created_at(&a.id, now - 7200).unwrap();
        assert_eq!(db.count_recent("p1", now - 3600).unwrap(), 1);
    }

    #[test]
    fn memory_is_newest_first() {
        let db = Db::open_memory().unwrap();
        db.insert_memory("p1", "g1", "first").unwrap();
        db.insert_memory("p1", "g2", "second").unwrap();
        db.insert_memory("p2", "g3", "other").unwrap();
        let mem = db.recent_memory("p1", 10).unwrap();
        assert_eq!(mem.len(), 2);
        assert_eq!(mem[0].summary, "second");
        assert_eq!(mem[1].generation_id, "g1");
    }

    #[test]
    fn personas_are_scoped_by_owner() {
        let db = Db::open_memory().unwrap();
        let p = db.insert_persona("alice", "Poet").unwrap();
        db.insert_persona("bob", "Critic").unwrap();
        assert_eq!(db.get_persona(&p.id).unwrap().unwrap().owner, "alice");
        assert_eq!(db.list_personas("alice").unwrap().len(), 1);
        assert!(db.get_persona("missing").unwrap().is_none());
    }

    #[test]
    fn state_counts_and_stale_processing() {
        let db = Arc::new(Db::open_memory().unwrap());
        let a = db.insert_generation(&new_text("p1", "a")).unwrap();
        db.insert_generation(&new_text("p1", "b")).unwrap();
        let now = now_secs();
        db.claim(&a.id, "t", now - 100, None).unwrap();
        let counts = db.state_counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(db.count_stale_processing(now - 50).unwrap(), 1);
        assert_eq!(db.count_stale_processing(now - 200).unwrap(), 0);
    }
}
