//! Per-recipient encryption across all of a peer's devices.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use omemo_protocol::{DeviceId, EncryptedEnvelope, Identifier, WrappedKey};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::content_key::{self, IV_SIZE};
use crate::device::Device;
use crate::error::{OmemoError, Result};
use crate::pubsub::BundleService;
use crate::stores::SignalStores;

/// Lazily populated cache of [`Device`] handles for one identifier.
///
/// Handles carry no state of their own beyond their address; all session
/// state lives in the store, so dropping the cache loses nothing.
pub struct DeviceRegistry {
    identifier: Identifier,
    devices: BTreeMap<DeviceId, Device>,
    stores: SignalStores,
    service: Arc<dyn BundleService>,
}

impl DeviceRegistry {
    pub fn new(
        identifier: Identifier,
        stores: SignalStores,
        service: Arc<dyn BundleService>,
    ) -> Self {
        Self {
            identifier,
            devices: BTreeMap::new(),
            stores,
            service,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn get_mut(&mut self, device_id: DeviceId) -> &mut Device {
        let Self {
            identifier,
            devices,
            stores,
            service,
        } = self;
        devices.entry(device_id).or_insert_with(|| {
            Device::new(identifier.clone(), device_id, stores.clone(), service.clone())
        })
    }

    /// Mutable handles for `ids`, created on first use.
    fn select(&mut self, ids: &[DeviceId]) -> Vec<&mut Device> {
        for id in ids {
            self.get_mut(*id);
        }
        self.devices
            .iter_mut()
            .filter(|(id, _)| ids.contains(id))
            .map(|(_, device)| device)
            .collect()
    }

    /// Drop every cached handle.
    pub fn forget(&mut self) {
        self.devices.clear();
    }

    /// Unwrap `key` as sent by `sender_device` and open the payload with it.
    pub async fn decrypt(
        &mut self,
        sender_device: DeviceId,
        key: &WrappedKey,
        iv: &[u8; IV_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let device = self.get_mut(sender_device);
        let material = Zeroizing::new(device.decrypt(&key.data, key.prekey).await?);
        content_key::open(&material, iv, payload)
    }
}

/// Encrypts for one remote identifier and decrypts what it sends.
pub struct Peer {
    devices: DeviceRegistry,
}

impl Peer {
    pub fn new(
        identifier: Identifier,
        stores: SignalStores,
        service: Arc<dyn BundleService>,
    ) -> Self {
        Self {
            devices: DeviceRegistry::new(identifier, stores, service),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        self.devices.identifier()
    }

    /// Encrypt `plaintext` once and wrap its key for every device of this
    /// peer and every other device of the local account.
    ///
    /// Devices that cannot be reached are skipped. Fails with
    /// [`OmemoError::NoReachablePeer`] if no key could be wrapped at all, or
    /// with [`OmemoError::TrustViolation`] if every attempted device was
    /// rejected for an untrusted identity.
    pub async fn encrypt(
        &mut self,
        plaintext: &[u8],
        own: &mut DeviceRegistry,
        local_device: DeviceId,
    ) -> Result<EncryptedEnvelope> {
        let store = self.devices.stores.kv().clone();
        let note_to_self = self.identifier() == own.identifier();

        let remote_ids = if note_to_self {
            Vec::new()
        } else {
            store.device_list(self.identifier())?
        };
        let own_ids: Vec<DeviceId> = store
            .own_device_list()?
            .into_iter()
            .filter(|id| *id != local_device)
            .collect();

        let sealed = content_key::seal(plaintext)?;
        let material = sealed.key_material.as_bytes();

        let mut targets = self.devices.select(&remote_ids);
        targets.extend(own.select(&own_ids));
        let attempted = targets.len();

        let outcomes = join_all(targets.into_iter().map(|device| async move {
            let address = device.address().to_string();
            (address, device.encrypt(material).await)
        }))
        .await;

        let mut keys = Vec::with_capacity(attempted);
        let mut untrusted = Vec::new();
        for (address, outcome) in outcomes {
            match outcome {
                Ok(Some(key)) => keys.push(key),
                Ok(None) => {}
                Err(OmemoError::TrustViolation { address }) => {
                    warn!(%address, "skipping device with untrusted identity");
                    untrusted.push(address);
                }
                Err(e) => warn!(%address, "could not wrap key: {e}"),
            }
        }

        if keys.is_empty() {
            if attempted > 0 && untrusted.len() == attempted {
                return Err(OmemoError::TrustViolation {
                    address: untrusted.join(", "),
                });
            }
            return Err(OmemoError::NoReachablePeer(self.identifier().clone()));
        }

        debug!(
            peer = %self.identifier(),
            wrapped = keys.len(),
            attempted,
            "message encrypted"
        );

        Ok(EncryptedEnvelope {
            sender_device_id: local_device,
            keys,
            iv: sealed.iv,
            payload: sealed.payload,
        })
    }

    pub async fn decrypt(
        &mut self,
        sender_device: DeviceId,
        key: &WrappedKey,
        iv: &[u8; IV_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.devices.decrypt(sender_device, key, iv, payload).await
    }

    /// Drop cached device handles, e.g. after the peer's sessions are removed.
    pub fn forget_devices(&mut self) {
        self.devices.forget();
    }
}
