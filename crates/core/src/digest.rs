//! Object digest types and incremental hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;

/// Digest algorithms supported by the offer.
///
/// Every object carries the algorithm its digest was computed with, so reads
/// can re-verify content against the referential entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl DigestAlgorithm {
    /// Canonical algorithm name, as persisted in the referential.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Parse a persisted algorithm name.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            "SHA-512" => Ok(DigestAlgorithm::Sha512),
            other => Err(crate::Error::InvalidDigest(format!(
                "unknown digest algorithm: {other}"
            ))),
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
        }
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        DigestAlgorithm::Sha256
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed digest: algorithm plus lowercase hex value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl ObjectDigest {
    /// Build from an already-hex-encoded value, validating its length.
    pub fn from_hex(algorithm: DigestAlgorithm, hex: impl Into<String>) -> crate::Result<Self> {
        let hex = hex.into();
        if hex.len() != algorithm.digest_len() * 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(crate::Error::InvalidDigest(format!(
                "invalid {algorithm} digest value: {hex}"
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Compute the digest of an in-memory buffer.
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Debug for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectDigest({}:{})", self.algorithm, &self.hex[..16])
    }
}

impl fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

enum HasherInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher used while streaming object bytes to disk.
pub struct Hasher {
    algorithm: DigestAlgorithm,
    inner: HasherInner,
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner = match algorithm {
            DigestAlgorithm::Sha256 => HasherInner::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => HasherInner::Sha512(Sha512::new()),
        };
        Self { algorithm, inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha256(h) => h.update(data),
            HasherInner::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ObjectDigest {
        let bytes: Vec<u8> = match self.inner {
            HasherInner::Sha256(h) => h.finalize().to_vec(),
            HasherInner::Sha512(h) => h.finalize().to_vec(),
        };
        let hex = bytes.iter().map(|b| format!("{b:02x}")).collect();
        ObjectDigest {
            algorithm: self.algorithm,
            hex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_oneshot() {
        let mut hasher = Hasher::new(DigestAlgorithm::Sha256);
        hasher.update(b"hello ");
        hasher.update(b"world");
        let incremental = hasher.finalize();

        let oneshot = ObjectDigest::compute(DigestAlgorithm::Sha256, b"hello world");
        assert_eq!(incremental, oneshot);
        assert_eq!(incremental.hex.len(), 64);
    }

    #[test]
    fn from_hex_rejects_bad_values() {
        assert!(ObjectDigest::from_hex(DigestAlgorithm::Sha256, "abc").is_err());
        assert!(ObjectDigest::from_hex(DigestAlgorithm::Sha256, "zz".repeat(32)).is_err());

        let ok = ObjectDigest::from_hex(DigestAlgorithm::Sha256, "AB".repeat(32)).unwrap();
        assert_eq!(ok.hex, "ab".repeat(32));
    }

    #[test]
    fn algorithm_name_roundtrip() {
        for algo in [DigestAlgorithm::Sha256, DigestAlgorithm::Sha512] {
            assert_eq!(DigestAlgorithm::parse(algo.as_str()).unwrap(), algo);
        }
        assert!(DigestAlgorithm::parse("MD5").is_err());
    }
}
