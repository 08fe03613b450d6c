//! Account addresses: bech32 human-readable form over raw bytes

use crate::error::{SequencerError, SequencerResult};

use bech32::{FromBase32, ToBase32, Variant};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// On-chain account identifier.
///
/// Equality and hashing only look at the raw bytes; the encoded form is
/// carried for logging and for ledger clients that speak bech32.
#[derive(Clone)]
pub struct Address {
    bytes: Vec<u8>,
    encoded: String,
}

impl Address {
    /// Build an address from raw bytes and a human-readable prefix
    pub fn from_bytes(hrp: &str, bytes: impl Into<Vec<u8>>) -> SequencerResult<Self> {
        let bytes = bytes.into();
        let encoded = bech32::encode(hrp, bytes.to_base32(), Variant::Bech32)
            .map_err(|e| SequencerError::InvalidAddress(format!("{}: {}", hrp, e)))?;

        Ok(Self { bytes, encoded })
    }

    /// Parse a bech32 encoded address
    pub fn from_bech32(encoded: &str) -> SequencerResult<Self> {
        let (_, data, variant) = bech32::decode(encoded)
            .map_err(|e| SequencerError::InvalidAddress(format!("{}: {}", encoded, e)))?;
        if variant != Variant::Bech32 {
            return Err(SequencerError::InvalidAddress(format!(
                "{}: expected bech32, got bech32m",
                encoded
            )));
        }

        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| SequencerError::InvalidAddress(format!("{}: {}", encoded, e)))?;

        Ok(Self {
            bytes,
            encoded: encoded.to_lowercase(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bech32(&self) -> &str {
        &self.encoded
    }

    /// Human-readable prefix of the encoded form
    pub fn hrp(&self) -> &str {
        self.encoded
            .rsplit_once('1')
            .map(|(hrp, _)| hrp)
            .unwrap_or_default()
    }

    /// An address without raw bytes cannot own an account
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.encoded)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Address::from_bech32(&encoded).map_err(de::Error::custom)
    }
}
