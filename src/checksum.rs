//! Checksum utilities for work directories and reproducibility checks

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA256 checksum, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum from a string
    pub fn from_str(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    /// Compute one checksum over a sequence of named parts.
    ///
    /// Names and contents are length-prefixed so that moving bytes between
    /// neighbouring parts changes the digest.
    pub fn from_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut hasher = Sha256::new();
        for (name, content) in parts {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(content);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_consistency() {
        let checksum1 = Checksum::from_str("com.google.protobuf:protobuf-java:3.25.1");
        let checksum2 = Checksum::from_str("com.google.protobuf:protobuf-java:3.25.1");
        assert_eq!(checksum1, checksum2);
        assert_eq!(checksum1.as_str().len(), 64);
    }

    #[test]
    fn test_checksum_different_content() {
        let checksum1 = Checksum::from_str("io.grpc:grpc-api:1.60.0");
        let checksum2 = Checksum::from_str("io.grpc:grpc-api:1.61.0");
        assert_ne!(checksum1, checksum2);
    }

    #[test]
    fn test_parts_are_boundary_sensitive() {
        let a = Checksum::from_parts([("a.proto", &b"xy"[..]), ("b.proto", &b"z"[..])]);
        let b = Checksum::from_parts([("a.proto", &b"x"[..]), ("b.proto", &b"yz"[..])]);
        assert_ne!(a, b);
    }
}
