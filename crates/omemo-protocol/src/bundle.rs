//! Published bundle and pub/sub item shapes.
//!
//! Bundles travel base64-encoded, the way they appear inside the pub/sub
//! payload. [`PreKeyBundleData`] is the decoded binary form used for key
//! agreement.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::NS_BASE;

/// A one-time pre-key as published (base64 public key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPreKey {
    pub id: u32,
    pub public_key: String,
}

/// A device bundle as published on its pub/sub node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBundle {
    /// Namespace of the bundle element; must be [`NS_BASE`].
    pub namespace: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: String,
    pub signed_pre_key_signature: String,
    pub identity_key: String,
    pub pre_keys: Vec<PublishedPreKey>,
}

/// Decoded bundle, ready for key agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundleData {
    /// Serialized identity public key.
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    /// Serialized signed pre-key public key.
    pub signed_prekey: Vec<u8>,
    /// Signature over the signed pre-key by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    /// One-time pre-keys: (id, serialized public key).
    pub prekeys: Vec<(u32, Vec<u8>)>,
}

impl PublishedBundle {
    pub fn encode(data: &PreKeyBundleData) -> Self {
        Self {
            namespace: NS_BASE.to_string(),
            signed_pre_key_id: data.signed_prekey_id,
            signed_pre_key_public: STANDARD.encode(&data.signed_prekey),
            signed_pre_key_signature: STANDARD.encode(&data.signed_prekey_signature),
            identity_key: STANDARD.encode(&data.identity_key),
            pre_keys: data
                .prekeys
                .iter()
                .map(|(id, key)| PublishedPreKey {
                    id: *id,
                    public_key: STANDARD.encode(key),
                })
                .collect(),
        }
    }

    pub fn decode(&self) -> Result<PreKeyBundleData, ProtocolError> {
        let identity_key = decode_required(&self.identity_key, "identity key")?;
        let signed_prekey = decode_required(&self.signed_pre_key_public, "signed pre-key")?;
        let signed_prekey_signature =
            decode_required(&self.signed_pre_key_signature, "signed pre-key signature")?;

        let mut prekeys = Vec::with_capacity(self.pre_keys.len());
        for prekey in &self.pre_keys {
            prekeys.push((prekey.id, decode_required(&prekey.public_key, "pre-key")?));
        }

        Ok(PreKeyBundleData {
            identity_key,
            signed_prekey_id: self.signed_pre_key_id,
            signed_prekey,
            signed_prekey_signature,
            prekeys,
        })
    }
}

fn decode_required(value: &str, field: &str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = STANDARD.decode(value.trim())?;
    if bytes.is_empty() {
        return Err(ProtocolError::MalformedBundle(format!("empty {field}")));
    }
    Ok(bytes)
}

/// Payload of a single pub/sub item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PubSubPayload {
    Bundle(PublishedBundle),
    DeviceList { namespace: String, devices: Vec<u32> },
}

/// Response of a pub/sub item retrieval for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubItems {
    pub node: String,
    pub items: Vec<PubSubPayload>,
}

impl PubSubItems {
    /// The single bundle published on `node`.
    ///
    /// Fails unless the response belongs to `node` and carries exactly one
    /// bundle in the [`NS_BASE`] namespace.
    pub fn single_bundle(&self, node: &str) -> Result<&PublishedBundle, ProtocolError> {
        if self.node != node {
            return Err(ProtocolError::MalformedBundle(format!(
                "expected items for node {node}, got {}",
                self.node
            )));
        }

        let mut bundles = self.items.iter().filter_map(|item| match item {
            PubSubPayload::Bundle(b) if b.namespace == NS_BASE => Some(b),
            _ => None,
        });

        match (bundles.next(), bundles.next()) {
            (Some(bundle), None) => Ok(bundle),
            (None, _) => Err(ProtocolError::MalformedBundle("found no bundle".into())),
            (Some(_), Some(_)) => Err(ProtocolError::MalformedBundle(
                "found more than one bundle".into(),
            )),
        }
    }

    /// Raw device ids from the first device list item in the [`NS_BASE`] namespace.
    pub fn device_list(&self) -> Option<&[u32]> {
        self.items.iter().find_map(|item| match item {
            PubSubPayload::DeviceList { namespace, devices } if namespace == NS_BASE => {
                Some(devices.as_slice())
            }
            _ => None,
        })
    }
}
