//! Conversation-key derivation
//!
//! A conversation between two participants is addressed by a key derived
//! from their ids, independent of who initiates. The key doubles as the
//! stored document identity, which is what lets concurrent creators
//! converge on one record.

use crate::error::{KindredError, Result};

/// Separator joining the ordered pair. Reserved: never valid inside a
/// participant identifier, which keeps the derivation injective over
/// unordered pairs.
pub const PAIR_SEPARATOR: char = ':';

/// Derive the canonical conversation key for an unordered pair.
///
/// Commutative: `conversation_key(a, b) == conversation_key(b, a)`. Fails
/// with `InvalidIdentity` when either id is empty, contains the separator,
/// or the two ids are equal (self-conversation is disallowed).
pub fn conversation_key(a: &str, b: &str) -> Result<String> {
    if a.is_empty() || b.is_empty() {
        return Err(KindredError::InvalidIdentity(
            "empty participant id".to_string(),
        ));
    }
    if a.contains(PAIR_SEPARATOR) || b.contains(PAIR_SEPARATOR) {
        return Err(KindredError::InvalidIdentity(format!(
            "participant id contains reserved '{}'",
            PAIR_SEPARATOR
        )));
    }
    if a == b {
        return Err(KindredError::InvalidIdentity(format!(
            "self-conversation for {}",
            a
        )));
    }

    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok(format!("{}{}{}", low, PAIR_SEPARATOR, high))
}

/// Sorted participant pair backing a conversation key.
pub fn participant_pair(a: &str, b: &str) -> Result<[String; 2]> {
    // Same validation as the key itself.
    conversation_key(a, b)?;
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok([low.to_string(), high.to_string()])
}
