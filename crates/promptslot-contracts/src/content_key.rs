use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const KEY_PREFIX: &str = "ps-";
const KEY_HEX_LEN: usize = 16;

/// Deterministic identifier for a placeholder, derived from its normalized content.
///
/// Two placeholders with equal normalized content share a key, and therefore share
/// the in-flight job slot and the result routing, no matter which document they
/// live in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn derive(normalized: &str) -> Self {
        Self(format!("{KEY_PREFIX}{}", short_hash(normalized)))
    }

    /// Derives from raw placeholder text, stripping delimiters first.
    pub fn from_raw(raw: &str, start_delimiter: &str, end_delimiter: &str) -> Self {
        Self::derive(&normalize_content(raw, start_delimiter, end_delimiter))
    }

    /// Wraps a key read back from markup or the wire. Returns `None` for anything
    /// this module could not have produced.
    pub fn parse(value: &str) -> Option<Self> {
        let hex_part = value.strip_prefix(KEY_PREFIX)?;
        if hex_part.len() != KEY_HEX_LEN || !hex_part.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strips a surrounding delimiter pair (when present), folds newlines and whitespace
/// runs into single spaces, and trims.
pub fn normalize_content(raw: &str, start_delimiter: &str, end_delimiter: &str) -> String {
    let mut inner = raw.trim();
    if !start_delimiter.is_empty() && !end_delimiter.is_empty() {
        if let Some(stripped) = inner
            .strip_prefix(start_delimiter)
            .and_then(|rest| rest.strip_suffix(end_delimiter))
        {
            inner = stripped;
        }
    }
    inner.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(KEY_HEX_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_delimiters_and_newlines() {
        assert_eq!(normalize_content("<<cat\ngirl>>", "<<", ">>"), "cat girl");
        assert_eq!(normalize_content("  a   sunny\r\n day ", "<<", ">>"), "a sunny day");
        assert_eq!(normalize_content("<<only start", "<<", ">>"), "<<only start");
    }

    #[test]
    fn equal_content_gives_equal_keys() {
        let a = ContentKey::from_raw("<<catgirl>>", "<<", ">>");
        let b = ContentKey::derive("catgirl");
        let c = ContentKey::derive("catboy");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("ps-"));
        assert_eq!(a.as_str().len(), 3 + 16);
    }

    #[test]
    fn parse_accepts_only_derived_shape() {
        let key = ContentKey::derive("catgirl");
        assert_eq!(ContentKey::parse(key.as_str()), Some(key));
        assert_eq!(ContentKey::parse("ps-xyz"), None);
        assert_eq!(ContentKey::parse("catgirl"), None);
    }

    #[test]
    fn serializes_as_plain_string() -> anyhow::Result<()> {
        let key = ContentKey::derive("catgirl");
        let raw = serde_json::to_string(&key)?;
        assert_eq!(raw, format!("\"{}\"", key.as_str()));
        Ok(())
    }
}
