use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LabnavError;
use crate::normalization::normalize_query;

const SCOPE_SEPARATOR: char = '\u{1f}';

/// Content-addressed cache key: BLAKE3 over the normalized query text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_query(query: &str) -> Self {
        Self::hash(&normalize_query(query))
    }

    /// Folds an optional document-type filter into the key. Without a filter
    /// the result equals [`Fingerprint::from_query`].
    pub fn scoped(query: &str, doc_type: Option<&str>) -> Self {
        let normalized = normalize_query(query);
        match doc_type.map(normalize_query).filter(|d| !d.is_empty()) {
            Some(doc_type) => {
                Self::hash(&format!("{normalized}{SCOPE_SEPARATOR}{doc_type}"))
            }
            None => Self::hash(&normalized),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn hash(normalized: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalized.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl FromStr for Fingerprint {
    type Err = LabnavError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(value.trim())
            .map_err(|e| LabnavError::validation(format!("fingerprint is not hex: {e}")))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| {
            LabnavError::validation("fingerprint must be 64 hex characters")
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_differences_share_a_fingerprint() {
        let a = Fingerprint::from_query("how to extract RNA");
        let b = Fingerprint::from_query("  How to   EXTRACT rna\n");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::from_query("how to extract DNA"));
    }

    #[test]
    fn doc_type_scope_changes_key_only_when_present() {
        let plain = Fingerprint::from_query("pcr cycling");
        assert_eq!(Fingerprint::scoped("pcr cycling", None), plain);
        assert_eq!(Fingerprint::scoped("pcr cycling", Some("  ")), plain);
        assert_ne!(Fingerprint::scoped("pcr cycling", Some("protocol")), plain);
        assert_eq!(
            Fingerprint::scoped("pcr cycling", Some("Protocol")),
            Fingerprint::scoped("PCR cycling", Some("protocol"))
        );
    }

    #[test]
    fn hex_roundtrip_and_validation() {
        let fp = Fingerprint::from_query("qpcr primers");
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), fp);
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let fp = Fingerprint::from_query("western blot");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
