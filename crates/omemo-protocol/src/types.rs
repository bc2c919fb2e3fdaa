use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Normalized bare account identifier ("user@domain").
///
/// Parsing drops any `/resource` suffix and lowercases, so two spellings of
/// the same account compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        let bare = trimmed.split_once('/').map_or(trimmed, |(bare, _)| bare);
        let bare = bare.to_lowercase();

        if bare.is_empty() {
            return Err(ProtocolError::InvalidIdentifier(raw.to_string()));
        }
        if let Some((local, domain)) = bare.split_once('@') {
            if local.is_empty() || domain.is_empty() || domain.contains('@') {
                return Err(ProtocolError::InvalidIdentifier(raw.to_string()));
            }
        }

        Ok(Self(bare))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

/// Per-account device identifier. Always in `1..=DeviceId::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct DeviceId(u32);

impl DeviceId {
    pub const MAX: u32 = 0x7FFF_FFFF;

    pub fn new(id: u32) -> Result<Self, ProtocolError> {
        if id == 0 || id > Self::MAX {
            return Err(ProtocolError::InvalidDeviceId(id));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for u32 {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Build an ordered, duplicate-free device list from raw ids.
/// Ids outside the valid range are dropped.
pub fn device_list_from_raw(raw: &[u32]) -> Vec<DeviceId> {
    let mut list: Vec<DeviceId> = Vec::with_capacity(raw.len());
    for &id in raw {
        match DeviceId::new(id) {
            Ok(device) if !list.contains(&device) => list.push(device),
            Ok(_) => {}
            Err(e) => tracing::debug!("skipping device list entry: {e}"),
        }
    }
    list
}

/// The content key of one message, wrapped for a single destination device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Destination device.
    pub device_id: DeviceId,
    /// True when `data` is a session-establishing (prekey) message.
    pub prekey: bool,
    /// Serialized ratchet message carrying key ‖ tag.
    pub data: Vec<u8>,
}

/// Everything the stanza layer needs to transmit one encrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Device that produced every key in `keys`.
    pub sender_device_id: DeviceId,
    pub keys: Vec<WrappedKey>,
    pub iv: [u8; 12],
    /// AES-GCM ciphertext without the tag (the tag travels inside each key).
    pub payload: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Keys addressed to `device_id`. A well-formed envelope yields at most one.
    pub fn keys_for(&self, device_id: DeviceId) -> impl Iterator<Item = &WrappedKey> {
        self.keys.iter().filter(move |k| k.device_id == device_id)
    }
}
