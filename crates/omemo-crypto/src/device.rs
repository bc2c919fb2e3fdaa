//! One ratchet session per remote device.
//!
//! Uses X3DH key agreement over the device's published bundle to establish
//! the session on first use, then the Double Ratchet to wrap and unwrap
//! content keys.

use std::sync::Arc;
use std::time::SystemTime;

use libsignal_protocol::{
    message_decrypt, message_decrypt_prekey, message_encrypt, process_prekey_bundle,
    CiphertextMessage, CiphertextMessageType, PreKeySignalMessage, ProtocolAddress, SignalMessage,
};
use omemo_protocol::{DeviceId, Identifier, WrappedKey};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::error::{OmemoError, Result};
use crate::pubsub::BundleService;
use crate::stores::SignalStores;

/// libsignal address of one device: name = bare identifier.
pub fn device_address(identifier: &Identifier, device_id: DeviceId) -> ProtocolAddress {
    ProtocolAddress::new(identifier.to_string(), device_id.get().into())
}

pub struct Device {
    identifier: Identifier,
    device_id: DeviceId,
    address: ProtocolAddress,
    stores: SignalStores,
    service: Arc<dyn BundleService>,
}

impl Device {
    pub fn new(
        identifier: Identifier,
        device_id: DeviceId,
        stores: SignalStores,
        service: Arc<dyn BundleService>,
    ) -> Self {
        let address = device_address(&identifier, device_id);
        Self {
            identifier,
            device_id,
            address,
            stores,
            service,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn address(&self) -> &ProtocolAddress {
        &self.address
    }

    pub fn has_session(&self) -> bool {
        self.stores.kv().has_session(&self.address)
    }

    /// Wrap `key_material` for this device.
    ///
    /// Returns `Ok(None)` when no session exists and the device's bundle
    /// cannot be fetched or parsed: the device is unreachable for this
    /// message, which is not an error for the whole send.
    pub async fn encrypt(&mut self, key_material: &[u8]) -> Result<Option<WrappedKey>> {
        if !self.has_session() {
            let bundle = match self
                .stores
                .kv()
                .pre_key_bundle(self.service.as_ref(), &self.identifier, self.device_id)
                .await
            {
                Ok(bundle) => bundle,
                Err(e @ (OmemoError::Fetch { .. } | OmemoError::Parse(_))) => {
                    warn!(address = %self.address, "device unreachable: {e}");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            process_prekey_bundle(
                &self.address,
                &mut self.stores.session,
                &mut self.stores.identity,
                &bundle,
                SystemTime::now(),
                &mut OsRng,
            )
            .await
            .map_err(OmemoError::from_encrypt)?;

            info!(address = %self.address, "session established from bundle");
        }

        let ciphertext = message_encrypt(
            key_material,
            &self.address,
            &mut self.stores.session,
            &mut self.stores.identity,
            SystemTime::now(),
        )
        .await
        .map_err(OmemoError::from_encrypt)?;

        let prekey = match ciphertext.message_type() {
            CiphertextMessageType::PreKey => true,
            CiphertextMessageType::Whisper => false,
            other => {
                return Err(OmemoError::Crypto(format!(
                    "unexpected ratchet message type {other:?}"
                )))
            }
        };

        debug!(address = %self.address, prekey, "content key wrapped");

        Ok(Some(WrappedKey {
            device_id: self.device_id,
            prekey,
            data: ciphertext.serialize().to_vec(),
        }))
    }

    /// Unwrap a key sent by this device.
    ///
    /// A prekey message establishes (or refreshes) the session from the
    /// key-agreement material it embeds and consumes the one-time pre-key.
    pub async fn decrypt(&mut self, data: &[u8], is_prekey: bool) -> Result<Vec<u8>> {
        let plaintext = if is_prekey {
            let msg = PreKeySignalMessage::try_from(data)
                .map_err(|e| OmemoError::Decryption(e.to_string()))?;
            message_decrypt_prekey(
                &msg,
                &self.address,
                &mut self.stores.session,
                &mut self.stores.identity,
                &mut self.stores.prekey,
                &mut self.stores.signed_prekey,
                &mut self.stores.kyber,
                &mut OsRng,
            )
            .await
            .map_err(OmemoError::from_decrypt)?
        } else {
            let msg = SignalMessage::try_from(data)
                .map_err(|e| OmemoError::Decryption(e.to_string()))?;
            message_decrypt(
                &CiphertextMessage::SignalMessage(msg),
                &self.address,
                &mut self.stores.session,
                &mut self.stores.identity,
                &mut self.stores.prekey,
                &mut self.stores.signed_prekey,
                &mut self.stores.kyber,
                &mut OsRng,
            )
            .await
            .map_err(OmemoError::from_decrypt)?
        };

        debug!(address = %self.address, is_prekey, "content key unwrapped");
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustPolicy;
    use crate::kv::KeyValueStore;
    use crate::pubsub::MemoryPubSub;

    fn id(raw: &str) -> Identifier {
        Identifier::parse(raw).unwrap()
    }

    #[test]
    fn address_uses_bare_identifier_and_device() {
        let address = device_address(&id("Bob@Example.org/laptop"), DeviceId::new(7).unwrap());
        assert_eq!(address.name(), "bob@example.org");
        assert_eq!(u32::from(address.device_id()), 7);
    }

    #[tokio::test]
    async fn missing_bundle_makes_device_unreachable() {
        let hub = MemoryPubSub::new();
        let stores = SignalStores::new(KeyValueStore::in_memory(), TrustPolicy::Strict);
        let mut device = Device::new(
            id("bob@example.org"),
            DeviceId::new(7).unwrap(),
            stores,
            Arc::new(hub.client(id("alice@example.org"))),
        );

        assert!(!device.has_session());
        assert!(device.encrypt(&[0u8; 32]).await.unwrap().is_none());
        assert!(!device.has_session());
    }

    #[tokio::test]
    async fn garbage_is_a_decryption_error() {
        let hub = MemoryPubSub::new();
        let stores = SignalStores::new(KeyValueStore::in_memory(), TrustPolicy::Strict);
        let mut device = Device::new(
            id("bob@example.org"),
            DeviceId::new(7).unwrap(),
            stores,
            Arc::new(hub.client(id("alice@example.org"))),
        );

        assert!(matches!(
            device.decrypt(b"not a ratchet message", true).await,
            Err(OmemoError::Decryption(_))
        ));
        assert!(matches!(
            device.decrypt(b"not a ratchet message", false).await,
            Err(OmemoError::Decryption(_))
        ));
    }
}
