//! Group identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::MarmotStorageError;

/// Length of a group id in bytes.
pub const GROUP_ID_LEN: usize = 32;

/// Random 32-byte group identifier.
///
/// The same value names the group inside the engine, in storage and in the
/// `h` tag of every Nostr event carrying its traffic. Serializes as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId([u8; GROUP_ID_LEN]);

impl GroupId {
    /// Wrap raw bytes
    pub const fn from_bytes(bytes: [u8; GROUP_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id
    pub fn random() -> Result<Self, MarmotStorageError> {
        let mut bytes = [0u8; GROUP_ID_LEN];
        getrandom::fill(&mut bytes).map_err(|e| MarmotStorageError::Database(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Parse from a byte slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MarmotStorageError> {
        let arr: [u8; GROUP_ID_LEN] = bytes.try_into().map_err(|_| {
            MarmotStorageError::Deserialization(format!(
                "group id must be {GROUP_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse from hex
    pub fn from_hex(value: &str) -> Result<Self, MarmotStorageError> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| MarmotStorageError::Deserialization(format!("group id hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Borrow the raw bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Copy out the raw bytes
    pub fn to_bytes(&self) -> [u8; GROUP_ID_LEN] {
        self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A short prefix is enough to correlate log lines.
        write!(f, "GroupId({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for GroupId {
    type Err = MarmotStorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for GroupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}
