//! Content hashing primitives.
//!
//! All kernel hashes are SHA-256 over domain-prefixed canonical bytes. The
//! domain prefix keeps a gate-input hash from ever colliding with a ledger
//! entry hash even if the payloads happen to agree.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Domain prefix for gate input hashes.
pub const GATE_INPUT_DOMAIN: &[u8] = b"warden.gate.input:";

/// Domain prefix for decision signatures.
pub const DECISION_SIG_DOMAIN: &[u8] = b"warden.gate.decision:";

/// Domain prefix for ledger entry hashes.
pub const LEDGER_ENTRY_DOMAIN: &[u8] = b"warden.ledger.entry:";

/// A 32-byte SHA-256 digest, serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The all-zero digest used as `prev_hash` of the first ledger entry.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hashes the concatenation of `parts` under the given domain prefix.
    #[must_use]
    pub fn of_parts(domain: &[u8], parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    /// Returns the digest as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Borrows the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Error parsing a digest from hex.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid digest: expected 64 hex characters")]
pub struct DigestParseError;

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(DigestParseError);
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|_| DigestParseError)?;
        Ok(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
