//! Byte-key layout shared by the RocksDB-backed stores.
//!
//! Keys are string segments joined by the unit separator (0x1F), optionally
//! followed by a big-endian integer suffix so lexicographic iteration matches
//! numeric order.

use crate::error::{PipelineError, Result};

pub const SEP: u8 = 0x1F;

/// Rejects values that cannot be used as a key segment. Control characters
/// (the separator among them) would let two distinct keys collide.
pub fn check_segment(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PipelineError::InvalidRequest(format!("{name} cannot be empty")));
    }
    if value.chars().any(char::is_control) {
        return Err(PipelineError::InvalidRequest(format!(
            "{name} cannot contain control characters"
        )));
    }
    Ok(())
}

pub fn key_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    let mut iter = parts.iter();
    if let Some(first) = iter.next() {
        key.extend_from_slice(first.as_bytes());
    }
    for part in iter {
        key.push(SEP);
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Prefix covering every key that starts with `parts`, including the
/// trailing separator so `acct-1` does not match `acct-10`.
pub fn prefix_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = key_with_segments(parts);
    key.push(SEP);
    key
}

pub fn key_with_u64(parts: &[&str], value: u64) -> Vec<u8> {
    let mut key = prefix_with_segments(parts);
    key.extend_from_slice(&value.to_be_bytes());
    key
}

pub fn shard_segment(shard: u16) -> String {
    format!("{shard:05}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffix_sorts_numerically() {
        let low = key_with_u64(&["feed", "00001"], 9);
        let high = key_with_u64(&["feed", "00001"], 256);
        assert!(low < high);
        assert_eq!(&high[high.len() - 8..], &256u64.to_be_bytes());
    }

    #[test]
    fn segments_reject_separator_and_control_bytes() {
        assert!(check_segment("accountId", "A1").is_ok());
        for value in ["", "A1\u{1f}x", "A1\nx", "\u{0}"] {
            assert!(matches!(
                check_segment("accountId", value),
                Err(PipelineError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn prefixes_do_not_overlap_on_shared_stems() {
        let prefix = prefix_with_segments(&["item", "acct-1"]);
        let other = key_with_segments(&["item", "acct-10", "v1"]);
        assert!(!other.starts_with(&prefix));
        let own = key_with_segments(&["item", "acct-1", "v1"]);
        assert!(own.starts_with(&prefix));
    }
}
