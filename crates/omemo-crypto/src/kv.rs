//! Typed key-value layer over an opaque namespaced backend.
//!
//! Every value is serialized with postcard, so binary key material
//! round-trips byte-for-byte whatever the backend stores natively.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use libsignal_protocol::{PreKeyBundle, ProtocolAddress};
use omemo_protocol::{bundle_node, DeviceId, Identifier};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{OmemoError, Result};
use crate::identity::SerializableIdentityKeyPair;
use crate::prekey::to_signal_bundle;
use crate::pubsub::BundleService;

const KEY_DEVICE_ID: &str = "deviceId";
const KEY_IDENTITY_KEY_PAIR: &str = "identityKey";
const KEY_REGISTRATION_ID: &str = "registrationId";
const KEY_PUBLISHED: &str = "published";
const KEY_OWN_DEVICE_LIST: &str = "deviceList";
const KEY_PREKEY_INDEX: &str = "preKeyIndex";
const KEY_NEXT_PREKEY_ID: &str = "nextPreKeyId";
const KEY_SIGNED_PREKEY_ID: &str = "signedPreKeyId";

const PREFIX_DEVICE_LIST: &str = "deviceList:";
const PREFIX_SESSION: &str = "session:";
const PREFIX_SESSION_INDEX: &str = "sessionIndex:";
const PREFIX_IDENTITYKEY: &str = "identityKey:";
const PREFIX_PREKEY: &str = "25519KeypreKey:";
const PREFIX_SIGNEDPREKEY: &str = "25519KeysignedKey:";

/// Persistent namespaced key-value backend supplied by the host.
pub trait StorageBackend: Send + Sync {
    fn set_item(&self, namespace: &str, key: &str, value: Vec<u8>);
    fn get_item(&self, namespace: &str, key: &str) -> Option<Vec<u8>>;
    fn remove_item(&self, namespace: &str, key: &str);
    /// All keys currently stored under `namespace`.
    fn keys(&self, namespace: &str) -> Vec<String>;
}

/// Process-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    items: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>> {
        self.items.lock().unwrap_or_else(|p| {
            warn!("storage mutex poisoned, recovering");
            p.into_inner()
        })
    }
}

impl StorageBackend for MemoryBackend {
    fn set_item(&self, namespace: &str, key: &str, value: Vec<u8>) {
        self.items()
            .insert((namespace.to_string(), key.to_string()), value);
    }

    fn get_item(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.items()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn remove_item(&self, namespace: &str, key: &str) {
        self.items()
            .remove(&(namespace.to_string(), key.to_string()));
    }

    fn keys(&self, namespace: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .items()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Storage key of a device address: "name.device_id".
pub(crate) fn address_key(addr: &ProtocolAddress) -> String {
    format!("{}.{}", addr.name(), addr.device_id())
}

/// Cheap, clonable handle over a backend namespace.
#[derive(Clone)]
pub struct KeyValueStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    /// Store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), "store")
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ── Generic accessors ───────────────────────────────────────────────

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        check_key(key)?;
        match self.backend.get_item(&self.namespace, key) {
            None => Ok(None),
            Some(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| OmemoError::Storage(format!("failed to decode {key}: {e}"))),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        check_key(key)?;
        let bytes = postcard::to_allocvec(value)
            .map_err(|e| OmemoError::Storage(format!("failed to encode {key}: {e}")))?;
        self.backend.set_item(&self.namespace, key, bytes);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.backend.remove_item(&self.namespace, key);
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.backend.get_item(&self.namespace, key).is_some()
    }

    // ── Device lists ────────────────────────────────────────────────────

    pub fn own_device_list(&self) -> Result<Vec<DeviceId>> {
        self.get_or(KEY_OWN_DEVICE_LIST, Vec::new())
    }

    pub fn set_own_device_list(&self, devices: &[DeviceId]) -> Result<()> {
        self.put(KEY_OWN_DEVICE_LIST, devices)
    }

    pub fn device_list(&self, identifier: &Identifier) -> Result<Vec<DeviceId>> {
        self.get_or(&format!("{PREFIX_DEVICE_LIST}{identifier}"), Vec::new())
    }

    pub fn set_device_list(&self, identifier: &Identifier, devices: &[DeviceId]) -> Result<()> {
        self.put(&format!("{PREFIX_DEVICE_LIST}{identifier}"), devices)
    }

    // ── Local device identity ───────────────────────────────────────────

    /// True once device id, identity key pair and registration id exist.
    pub fn is_ready(&self) -> bool {
        self.contains(KEY_DEVICE_ID)
            && self.contains(KEY_IDENTITY_KEY_PAIR)
            && self.contains(KEY_REGISTRATION_ID)
    }

    pub fn is_published(&self) -> Result<bool> {
        self.get_or(KEY_PUBLISHED, false)
    }

    pub fn set_published(&self, published: bool) -> Result<()> {
        self.put(KEY_PUBLISHED, &published)
    }

    pub fn device_id(&self) -> Result<Option<DeviceId>> {
        self.get(KEY_DEVICE_ID)
    }

    pub fn set_device_id(&self, device_id: DeviceId) -> Result<()> {
        self.put(KEY_DEVICE_ID, &device_id)
    }

    pub fn identity_key_pair(&self) -> Result<Option<SerializableIdentityKeyPair>> {
        self.get(KEY_IDENTITY_KEY_PAIR)
    }

    pub fn set_identity_key_pair(&self, pair: &SerializableIdentityKeyPair) -> Result<()> {
        self.put(KEY_IDENTITY_KEY_PAIR, pair)
    }

    pub fn local_registration_id(&self) -> Result<Option<u32>> {
        self.get(KEY_REGISTRATION_ID)
    }

    pub fn set_local_registration_id(&self, registration_id: u32) -> Result<()> {
        self.put(KEY_REGISTRATION_ID, &registration_id)
    }

    // ── Remote identities ───────────────────────────────────────────────

    /// Trust on first use: unknown devices are trusted, known ones only with
    /// the exact same key bytes.
    pub fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
    ) -> Result<bool> {
        match self.load_identity(address)? {
            None => Ok(true),
            Some(stored) => Ok(stored == identity_key),
        }
    }

    pub fn load_identity(&self, address: &ProtocolAddress) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{PREFIX_IDENTITYKEY}{}", address_key(address)))
    }

    /// Overwrite the recorded identity key. Returns true if a *different*
    /// key was recorded before.
    pub fn save_identity(&self, address: &ProtocolAddress, identity_key: &[u8]) -> Result<bool> {
        let key = format!("{PREFIX_IDENTITYKEY}{}", address_key(address));
        let existing: Option<Vec<u8>> = self.get(&key)?;
        self.put(&key, identity_key)?;
        Ok(existing.is_some_and(|old| old != identity_key))
    }

    // ── Pre-keys ────────────────────────────────────────────────────────

    pub fn load_pre_key(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{PREFIX_PREKEY}{id}"))
    }

    pub fn store_pre_key(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put(&format!("{PREFIX_PREKEY}{id}"), record)?;
        let mut index = self.pre_key_index()?;
        if index.insert(id) {
            self.put(KEY_PREKEY_INDEX, &index)?;
        }
        Ok(())
    }

    pub fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.remove(&format!("{PREFIX_PREKEY}{id}"))?;
        let mut index = self.pre_key_index()?;
        if index.remove(&id) {
            self.put(KEY_PREKEY_INDEX, &index)?;
        }
        debug!(pre_key_id = id, "one-time pre-key removed");
        Ok(())
    }

    /// Ids of the one-time pre-keys still stored, ascending.
    pub fn pre_key_ids(&self) -> Result<Vec<u32>> {
        Ok(self.pre_key_index()?.into_iter().collect())
    }

    fn pre_key_index(&self) -> Result<BTreeSet<u32>> {
        self.get_or(KEY_PREKEY_INDEX, BTreeSet::new())
    }

    /// Id the next generated one-time pre-key should use.
    pub fn next_pre_key_id(&self) -> Result<u32> {
        self.get_or(KEY_NEXT_PREKEY_ID, 1)
    }

    pub fn set_next_pre_key_id(&self, id: u32) -> Result<()> {
        self.put(KEY_NEXT_PREKEY_ID, &id)
    }

    pub fn load_signed_pre_key(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{PREFIX_SIGNEDPREKEY}{id}"))
    }

    pub fn store_signed_pre_key(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put(&format!("{PREFIX_SIGNEDPREKEY}{id}"), record)?;
        self.put(KEY_SIGNED_PREKEY_ID, &id)
    }

    pub fn remove_signed_pre_key(&self, id: u32) -> Result<()> {
        self.remove(&format!("{PREFIX_SIGNEDPREKEY}{id}"))
    }

    /// Id of the most recently stored signed pre-key.
    pub fn current_signed_pre_key_id(&self) -> Result<Option<u32>> {
        self.get(KEY_SIGNED_PREKEY_ID)
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn load_session(&self, address: &ProtocolAddress) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{PREFIX_SESSION}{}", address_key(address)))
    }

    pub fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> Result<()> {
        self.put(&format!("{PREFIX_SESSION}{}", address_key(address)), record)?;
        let device: u32 = address.device_id().into();
        let mut index = self.session_index(address.name())?;
        if index.insert(device) {
            self.put(&format!("{PREFIX_SESSION_INDEX}{}", address.name()), &index)?;
        }
        Ok(())
    }

    pub fn remove_session(&self, address: &ProtocolAddress) -> Result<()> {
        self.remove(&format!("{PREFIX_SESSION}{}", address_key(address)))?;
        let device: u32 = address.device_id().into();
        let mut index = self.session_index(address.name())?;
        if index.remove(&device) {
            self.put(&format!("{PREFIX_SESSION_INDEX}{}", address.name()), &index)?;
        }
        Ok(())
    }

    pub fn has_session(&self, address: &ProtocolAddress) -> bool {
        self.contains(&format!("{PREFIX_SESSION}{}", address_key(address)))
    }

    /// Devices of `identifier` that currently have a stored session.
    pub fn session_devices(&self, identifier: &Identifier) -> Result<Vec<DeviceId>> {
        self.session_index(identifier.as_str())?
            .into_iter()
            .map(|id| DeviceId::new(id).map_err(OmemoError::from))
            .collect()
    }

    /// Remove every session of `identifier`. Returns how many were removed.
    pub fn remove_all_sessions(&self, identifier: &Identifier) -> Result<usize> {
        let index = self.session_index(identifier.as_str())?;
        for device in &index {
            let address = ProtocolAddress::new(identifier.to_string(), (*device).into());
            self.remove(&format!("{PREFIX_SESSION}{}", address_key(&address)))?;
        }
        self.remove(&format!("{PREFIX_SESSION_INDEX}{identifier}"))?;
        Ok(index.len())
    }

    fn session_index(&self, name: &str) -> Result<BTreeSet<u32>> {
        self.get_or(&format!("{PREFIX_SESSION_INDEX}{name}"), BTreeSet::new())
    }

    // ── Bundles ─────────────────────────────────────────────────────────

    /// Fetch and parse the published bundle of one remote device.
    pub async fn pre_key_bundle(
        &self,
        service: &dyn BundleService,
        identifier: &Identifier,
        device_id: DeviceId,
    ) -> Result<PreKeyBundle> {
        let node = bundle_node(device_id);
        let items = service
            .retrieve_items(&node, identifier)
            .await
            .map_err(|e| OmemoError::Fetch {
                node: node.clone(),
                reason: e.to_string(),
            })?;

        let data = items
            .single_bundle(&node)
            .and_then(|bundle| bundle.decode())
            .map_err(|e| OmemoError::Parse(e.to_string()))?;

        to_signal_bundle(&data, device_id)
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(OmemoError::InvalidArgument(
            "tried to access the store with an empty key".into(),
        ));
    }
    Ok(())
}
