//! Generation records and their lifecycle states.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids;

/// Externally visible generation id (a ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(String);

impl GenerationId {
    pub fn new() -> Self {
        Self(ids::generate())
    }

    /// Parse an id supplied by a client. Returns `None` if it is not a ULID.
    pub fn parse(s: &str) -> Option<Self> {
        ids::is_valid(s).then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of content a generation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Text,
    Image,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Text => "text",
            GenerationKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(GenerationKind::Text),
            "image" => Some(GenerationKind::Image),
            _ => None,
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a generation record.
///
/// `Pending -> Processing` is the only non-terminal edge; every other edge
/// leaves `Processing` for one of the four terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Pending,
    Processing,
    Approved,
    Rejected,
    Flagged,
    Error,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Pending => "pending",
            GenerationState::Processing => "processing",
            GenerationState::Approved => "approved",
            GenerationState::Rejected => "rejected",
            GenerationState::Flagged => "flagged",
            GenerationState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GenerationState::Pending),
            "processing" => Some(GenerationState::Processing),
            "approved" => Some(GenerationState::Approved),
            "rejected" => Some(GenerationState::Rejected),
            "flagged" => Some(GenerationState::Flagged),
            "error" => Some(GenerationState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Approved
                | GenerationState::Rejected
                | GenerationState::Flagged
                | GenerationState::Error
        )
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-request model parameters. Validated by the parse stage.
pub type ModelParams = BTreeMap<String, serde_json::Value>;

/// Model parameters after validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tone: Option<String>,
}

/// Token accounting reported by the generate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Terminal output attached to an approved generation. Written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub content: String,
    pub quality_score: f64,
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
    /// Free-form provider metadata (cost breakdown, provider request ids).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Characters of approved content kept as a persona memory entry.
pub const MEMORY_SUMMARY_CHARS: usize = 140;

impl OutputPayload {
    /// The memory entry recorded for this output once it is approved.
    pub fn summary(&self) -> String {
        self.content.chars().take(MEMORY_SUMMARY_CHARS).collect()
    }
}

/// Input for creating a generation; everything the requester controls.
#[derive(Debug, Clone)]
pub struct NewGeneration {
    pub persona_id: String,
    pub requester: String,
    pub kind: GenerationKind,
    pub prompt: String,
    pub params: ModelParams,
}

/// A persisted generation row.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    pub id: GenerationId,
    pub persona_id: String,
    pub requester: String,
    pub kind: GenerationKind,
    pub prompt: String,
    pub params: ModelParams,
    pub state: GenerationState,
    pub output: Option<OutputPayload>,
    pub error_reason: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    pub claimed_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// How a pipeline run ended. Maps 1:1 onto the terminal states.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Approved(OutputPayload),
    Rejected(String),
    Flagged(String),
    Error(String),
}

impl TerminalOutcome {
    pub fn state(&self) -> GenerationState {
        match self {
            TerminalOutcome::Approved(_) => GenerationState::Approved,
            TerminalOutcome::Rejected(_) => GenerationState::Rejected,
            TerminalOutcome::Flagged(_) => GenerationState::Flagged,
            TerminalOutcome::Error(_) => GenerationState::Error,
        }
    }

    pub fn output(&self) -> Option<&OutputPayload> {
        match self {
            TerminalOutcome::Approved(out) => Some(out),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TerminalOutcome::Approved(_) => None,
            TerminalOutcome::Rejected(r) | TerminalOutcome::Flagged(r) | TerminalOutcome::Error(r) => {
                Some(r)
            }
        }
    }
}

/// A persona, reduced to what ownership checks need.
#[derive(Debug, Clone, Serialize)]
pub struct Persona {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub created_at: i64,
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
