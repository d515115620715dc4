use rand::Rng;
use sha2::{Digest, Sha256};

const ADMIN_KEY_PREFIX: &str = "tw_sk_";

/// Generate an admin API key. Returns `(full_key, sha256_hash)`.
/// Key format: `tw_sk_` + 32 random bytes hex-encoded.
pub fn generate_api_key() -> (String, String) {
    let raw = random_hex(32);
    let full_key = format!("{ADMIN_KEY_PREFIX}{raw}");
    let hash = hash_token(&full_key);
    (full_key, hash)
}

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a bearer token has the admin key shape.
pub fn is_api_key(token: &str) -> bool {
    token
        .strip_prefix(ADMIN_KEY_PREFIX)
        .is_some_and(|rest| rest.len() == 64 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Extract the first 8 chars after `tw_sk_` for display/identification.
pub fn key_prefix(full_key: &str) -> String {
    full_key
        .strip_prefix(ADMIN_KEY_PREFIX)
        .map(|rest| rest.chars().take(8).collect())
        .unwrap_or_default()
}

/// Compare two hex digests without short-circuiting on the first mismatch.
pub fn digests_match(left: &str, right: &str) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.bytes()
        .zip(right.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn random_hex(bytes: usize) -> String {
    let buf: Vec<u8> = (0..bytes).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    hex::encode(buf)
}
