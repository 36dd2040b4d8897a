//! ULID-based identifiers for generations and personas.
//!
//! Format: 26-character Crockford base32 string, time-sortable.
//! Structure: 48 bits timestamp (ms since epoch) + 80 bits random.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Length of every id handed out by this crate.
pub const ULID_LEN: usize = 26;

/// Generate a new ULID string.
pub fn generate() -> String {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u128;
    let random: u128 = rand::thread_rng().r#gen::<u128>() & RANDOM_MASK;
    encode((now_ms << RANDOM_BITS) | random)
}

const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

/// Crockford base32, most significant digit first. 26 digits hold 130 bits,
/// so the leading digit only ever carries the top three.
fn encode(mut value: u128) -> String {
    let mut buf = [0u8; ULID_LEN];
    for slot in buf.iter_mut().rev() {
        *slot = CROCKFORD[(value & 0x1F) as usize];
        value >>= 5;
    }
    buf.iter().map(|&b| b as char).collect()
}

/// True if `s` is shaped like an id produced by [`generate`].
pub fn is_valid(s: &str) -> bool {
    s.len() == ULID_LEN && s.bytes().all(|b| CROCKFORD.contains(&b))
}

/// Random URL-safe token of `len` characters (stream tickets, claim tokens).
pub fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
