//! Bearer credentials and one-time stream tickets.
//!
//! Credential format: `b64url(requester).expiry.b64url(hmac)` where the MAC is
//! HMAC-SHA256 over `b64url(requester).expiry` with the shared secret.

use std::time::Duration;

use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::model::GenerationId;
use crate::ttl::ExpiringMap;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no signing secret configured")]
    NoSecret,
    #[error("malformed credential")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("credential expired")]
    Expired,
}

/// Mints and verifies bearer credentials.
pub struct Authenticator {
    secret: Vec<u8>,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::NoSecret);
        }
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::NoSecret)
    }

    /// Credential for `requester`, valid until `now + ttl`.
    pub fn mint(&self, requester: &str, ttl: Duration, now: i64) -> Result<String, AuthError> {
        let payload = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(requester.as_bytes()),
            now + ttl.as_secs() as i64
        );
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{sig}"))
    }

    /// Returns the requester id the credential was minted for.
    pub fn verify(&self, token: &str, now: i64) -> Result<String, AuthError> {
        let (payload, sig) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
        let (subject, expiry) = payload.split_once('.').ok_or(AuthError::Malformed)?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

        let expiry: i64 = expiry.parse().map_err(|_| AuthError::Malformed)?;
        if expiry <= now {
            return Err(AuthError::Expired);
        }
        let subject = URL_SAFE_NO_PAD.decode(subject).map_err(|_| AuthError::Malformed)?;
        String::from_utf8(subject).map_err(|_| AuthError::Malformed)
    }
}

/// `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Clone)]
struct StreamTicket {
    generation_id: GenerationId,
    requester: String,
}

/// One-time stream tickets for transports that cannot send headers.
pub struct TicketStore {
    tickets: ExpiringMap<String, StreamTicket>,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: ExpiringMap::new(ttl),
        }
    }

    pub fn issue(&self, generation_id: &GenerationId, requester: &str) -> String {
        let ticket = crate::ids::random_token(32);
        self.tickets.insert(
            ticket.clone(),
            StreamTicket {
                generation_id: generation_id.clone(),
                requester: requester.to_string(),
            },
        );
        ticket
    }

    /// Consume a ticket. Returns the requester if it was issued for
    /// `generation_id` and has not expired.
    pub fn redeem(&self, ticket: &str, generation_id: &GenerationId) -> Option<String> {
        let entry = self.tickets.take(&ticket.to_string())?;
        (entry.generation_id == *generation_id).then_some(entry.requester)
    }

    pub fn sweep(&self) -> usize {
        self.tickets.sweep()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
