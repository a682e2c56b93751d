//! Small shared helpers.

use sha2::{Digest, Sha256};

/// Hash an email address for logging (privacy).
///
/// Logs never carry raw addresses; the truncated digest is stable across
/// case and surrounding whitespace so the same member correlates.
pub fn hash_email(email: &str) -> String {
    let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
    hex::encode(digest)[..12].to_string()
}
