//! The account-level entry point: encrypt outbound, decrypt inbound, track
//! device lists and per-peer enablement.

use std::collections::HashMap;
use std::sync::Arc;

use libsignal_protocol::IdentityKey;
use omemo_protocol::{device_list_from_raw, DeviceId, EncryptedEnvelope, Identifier};
use tracing::{debug, info, warn};

use crate::bootstrap::{self, fetch_device_list, publish_bundle, publish_device_list};
use crate::config::EngineConfig;
use crate::device::device_address;
use crate::error::{OmemoError, Result};
use crate::identity::fingerprint;
use crate::kv::{KeyValueStore, StorageBackend};
use crate::peer::{DeviceRegistry, Peer};
use crate::prekey::generate_prekeys;
use crate::pubsub::BundleService;
use crate::stores::SignalStores;

const PREFIX_ENABLED: &str = "enabled:";

/// What the host should put on the wire for one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encryption is disabled for the peer; send the text unchanged.
    Plaintext(String),
    Encrypted(EncryptedEnvelope),
}

/// Encryption engine of one local account.
///
/// Every operation that advances a ratchet takes `&mut self`, so one engine
/// runs at most one encryption or decryption at a time. Hosts that share an
/// engine between tasks wrap it in a `tokio::sync::Mutex`. The futures are
/// not `Send`; drive them on a current-thread runtime or a `LocalSet`.
pub struct Omemo {
    own: Identifier,
    store: KeyValueStore,
    stores: SignalStores,
    service: Arc<dyn BundleService>,
    config: EngineConfig,
    peers: HashMap<Identifier, Peer>,
    own_devices: DeviceRegistry,
}

fn peer_entry<'a>(
    peers: &'a mut HashMap<Identifier, Peer>,
    identifier: &Identifier,
    stores: &SignalStores,
    service: &Arc<dyn BundleService>,
) -> &'a mut Peer {
    peers
        .entry(identifier.clone())
        .or_insert_with(|| Peer::new(identifier.clone(), stores.clone(), service.clone()))
}

impl Omemo {
    pub fn new(
        own: Identifier,
        backend: Arc<dyn StorageBackend>,
        service: Arc<dyn BundleService>,
        config: EngineConfig,
    ) -> Self {
        let store = KeyValueStore::new(backend, config.storage_namespace.clone());
        let stores = SignalStores::new(store.clone(), config.trust_policy);
        let own_devices = DeviceRegistry::new(own.clone(), stores.clone(), service.clone());
        Self {
            own,
            store,
            stores,
            service,
            config,
            peers: HashMap::new(),
            own_devices,
        }
    }

    pub fn own_identifier(&self) -> &Identifier {
        &self.own
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    /// The local device id, once bootstrap has run.
    pub fn device_id(&self) -> Result<DeviceId> {
        if !self.store.is_ready() {
            return Err(OmemoError::NotReady);
        }
        self.store.device_id()?.ok_or(OmemoError::NotReady)
    }

    /// Generate and publish the local device if needed.
    pub async fn prepare(&mut self) -> Result<DeviceId> {
        bootstrap::prepare(&self.own, &mut self.stores, self.service.as_ref(), &self.config).await
    }

    /// Encrypt `plaintext` for every device of `peer` and every other
    /// device of the local account.
    pub async fn encrypt_outbound(
        &mut self,
        peer: &Identifier,
        plaintext: &str,
    ) -> Result<EncryptedEnvelope> {
        let local = self.device_id()?;

        if *peer != self.own && self.store.device_list(peer)?.is_empty() {
            match fetch_device_list(self.service.as_ref(), peer).await {
                Ok(list) => {
                    debug!(%peer, devices = list.len(), "fetched device list");
                    self.store.set_device_list(peer, &list)?;
                }
                Err(e) => warn!(%peer, "device list unknown: {e}"),
            }
        }

        let Self {
            peers,
            own_devices,
            stores,
            service,
            ..
        } = self;
        peer_entry(peers, peer, stores, service)
            .encrypt(plaintext.as_bytes(), own_devices, local)
            .await
    }

    /// Decrypt an envelope received from `from`.
    ///
    /// The envelope must carry exactly one key addressed to the local device.
    pub async fn decrypt_inbound(
        &mut self,
        from: &Identifier,
        envelope: &EncryptedEnvelope,
    ) -> Result<String> {
        let local = self.device_id()?;

        let addressed: Vec<_> = envelope.keys_for(local).collect();
        let [key] = addressed.as_slice() else {
            return Err(OmemoError::Addressing {
                device_id: local,
                found: addressed.len(),
            });
        };

        let prekeys_before = if key.prekey {
            Some(self.store.pre_key_ids()?.len())
        } else {
            None
        };

        let sender = envelope.sender_device_id;
        let plaintext = if *from == self.own {
            self.own_devices
                .decrypt(sender, key, &envelope.iv, &envelope.payload)
                .await?
        } else {
            peer_entry(&mut self.peers, from, &self.stores, &self.service)
                .decrypt(sender, key, &envelope.iv, &envelope.payload)
                .await?
        };

        let text = String::from_utf8(plaintext)
            .map_err(|e| OmemoError::Decryption(format!("plaintext is not UTF-8: {e}")))?;

        if let Some(before) = prekeys_before {
            if self.store.pre_key_ids()?.len() < before {
                self.after_prekey_consumed().await;
            }
        }

        Ok(text)
    }

    /// A one-time pre-key was used up: top up if low and republish the
    /// bundle without it. Failures here do not affect the delivered message.
    async fn after_prekey_consumed(&mut self) {
        let result = match self.replenish_prekeys().await {
            Ok(0) => match self.device_id() {
                Ok(local) => publish_bundle(&self.stores, self.service.as_ref(), local).await,
                Err(e) => Err(e),
            },
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("could not republish bundle after pre-key use: {e}");
        }
    }

    /// Encrypt when enabled for `peer`, pass the text through otherwise.
    ///
    /// A failed encryption is returned as an error; it never degrades to
    /// plaintext.
    pub async fn process_outbound(
        &mut self,
        peer: &Identifier,
        plaintext: &str,
    ) -> Result<Outbound> {
        if !self.is_enabled(peer)? {
            return Ok(Outbound::Plaintext(plaintext.to_string()));
        }
        self.encrypt_outbound(peer, plaintext)
            .await
            .map(Outbound::Encrypted)
    }

    /// Apply a device-list notification from `from`, replacing the stored list.
    ///
    /// For the own account the local device is kept in the list; if the
    /// update omits it, it is re-added and the corrected list republished.
    pub async fn handle_device_list_update(
        &mut self,
        from: &Identifier,
        raw: &[u32],
    ) -> Result<()> {
        let mut list = device_list_from_raw(raw);

        if *from != self.own {
            debug!(identifier = %from, devices = list.len(), "device list updated");
            return self.store.set_device_list(from, &list);
        }

        let local = self.store.device_id()?.filter(|_| self.store.is_ready());
        match local {
            Some(local) if !list.contains(&local) => {
                warn!(%local, "own device list is missing the local device, republishing");
                list.push(local);
                self.store.set_own_device_list(&list)?;
                publish_device_list(self.service.as_ref(), &list).await
            }
            _ => self.store.set_own_device_list(&list),
        }
    }

    pub fn is_enabled(&self, peer: &Identifier) -> Result<bool> {
        self.store.get_or(&format!("{PREFIX_ENABLED}{peer}"), false)
    }

    /// Enable or disable encryption for `peer`. Enabling prepares the local
    /// device first.
    pub async fn set_enabled(&mut self, peer: &Identifier, enabled: bool) -> Result<()> {
        if enabled {
            self.prepare().await?;
        }
        self.store.put(&format!("{PREFIX_ENABLED}{peer}"), &enabled)?;
        info!(%peer, enabled, "encryption toggled");
        Ok(())
    }

    /// Flip encryption for `peer`. Returns the new state.
    pub async fn toggle(&mut self, peer: &Identifier) -> Result<bool> {
        let enabled = !self.is_enabled(peer)?;
        self.set_enabled(peer, enabled).await?;
        Ok(enabled)
    }

    /// Top up one-time pre-keys once fewer than the configured threshold
    /// remain, and republish the bundle. Returns how many were generated.
    pub async fn replenish_prekeys(&mut self) -> Result<usize> {
        let local = self.device_id()?;
        let remaining = self.store.pre_key_ids()?.len();
        if remaining >= self.config.prekey_replenish_threshold as usize {
            return Ok(0);
        }

        let count = (self.config.initial_prekey_count as usize).saturating_sub(remaining);
        let generated = generate_prekeys(&mut self.stores, count as u32).await?;
        publish_bundle(&self.stores, self.service.as_ref(), local).await?;

        info!(remaining, generated = generated.len(), "pre-keys replenished");
        Ok(generated.len())
    }

    /// Remove every session with `identifier`. Returns how many were removed.
    pub fn remove_all_sessions(&mut self, identifier: &Identifier) -> Result<usize> {
        let removed = self.store.remove_all_sessions(identifier)?;
        if *identifier == self.own {
            self.own_devices.forget();
        } else if let Some(peer) = self.peers.get_mut(identifier) {
            peer.forget_devices();
        }
        info!(%identifier, removed, "sessions removed");
        Ok(removed)
    }

    /// Accept `identity_key` for one device, replacing any stored key.
    /// Returns whether the stored key changed.
    pub fn trust_identity(
        &mut self,
        identifier: &Identifier,
        device_id: DeviceId,
        identity_key: &[u8],
    ) -> Result<bool> {
        IdentityKey::decode(identity_key)
            .map_err(|e| OmemoError::InvalidArgument(format!("not an identity key: {e}")))?;

        let address = device_address(identifier, device_id);
        let changed = self.store.save_identity(&address, identity_key)?;
        info!(
            %address,
            changed,
            fingerprint = %fingerprint(identity_key),
            "identity trusted"
        );
        Ok(changed)
    }

    /// Display fingerprint of the local identity key.
    pub fn fingerprint(&self) -> Result<String> {
        let pair = self.store.identity_key_pair()?.ok_or(OmemoError::NotReady)?;
        Ok(fingerprint(&pair.public_key))
    }

    /// Display fingerprint of the stored identity key of a remote device.
    pub fn remote_fingerprint(
        &self,
        identifier: &Identifier,
        device_id: DeviceId,
    ) -> Result<Option<String>> {
        let address = device_address(identifier, device_id);
        Ok(self
            .store
            .load_identity(&address)?
            .map(|key| fingerprint(&key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustPolicy;
    use crate::kv::MemoryBackend;
    use crate::pubsub::MemoryPubSub;
    use omemo_protocol::{bundle_node, PubSubPayload, NS_DEVICELIST};

    fn id(raw: &str) -> Identifier {
        Identifier::parse(raw).unwrap()
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            initial_prekey_count: 5,
            prekey_replenish_threshold: 3,
            ..EngineConfig::default()
        }
    }

    fn engine(hub: &MemoryPubSub, raw: &str, config: EngineConfig) -> Omemo {
        let own = id(raw);
        Omemo::new(
            own.clone(),
            Arc::new(MemoryBackend::new()),
            Arc::new(hub.client(own)),
            config,
        )
    }

    async fn device(hub: &MemoryPubSub, raw: &str) -> Omemo {
        let mut omemo = engine(hub, raw, small_config());
        omemo.prepare().await.unwrap();
        omemo
    }

    /// Hand the currently published device list of `owner` to `to`.
    async fn deliver_device_list(hub: &MemoryPubSub, to: &mut Omemo, owner: &Identifier) {
        let Some(PubSubPayload::DeviceList { devices, .. }) = hub.item(owner, NS_DEVICELIST) else {
            panic!("no device list published for {owner}");
        };
        to.handle_device_list_update(owner, &devices).await.unwrap();
    }

    fn published_prekeys(hub: &MemoryPubSub, owner: &Identifier, device_id: DeviceId) -> usize {
        match hub.item(owner, &bundle_node(device_id)) {
            Some(PubSubPayload::Bundle(bundle)) => bundle.pre_keys.len(),
            other => panic!("no bundle published: {other:?}"),
        }
    }

    // ── Bootstrap ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn prepare_generates_and_publishes() {
        let hub = MemoryPubSub::new();
        let alice = device(&hub, "alice@example.org").await;
        let local = alice.device_id().unwrap();

        assert!(alice.is_ready());
        assert!(alice.store().is_published().unwrap());
        assert_eq!(alice.store().own_device_list().unwrap(), vec![local]);
        assert_eq!(alice.store().pre_key_ids().unwrap().len(), 5);
        assert_eq!(published_prekeys(&hub, alice.own_identifier(), local), 5);
        assert_eq!(alice.fingerprint().unwrap().len(), 64 + 7);
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let hub = MemoryPubSub::new();
        let mut alice = device(&hub, "alice@example.org").await;
        let first = alice.device_id().unwrap();
        let fingerprint = alice.fingerprint().unwrap();

        assert_eq!(alice.prepare().await.unwrap(), first);
        assert_eq!(alice.fingerprint().unwrap(), fingerprint);
    }

    #[tokio::test]
    async fn second_device_joins_published_list() {
        let hub = MemoryPubSub::new();
        let alice1 = device(&hub, "alice@example.org").await;
        let alice2 = device(&hub, "alice@example.org").await;

        let own = alice2.store().own_device_list().unwrap();
        assert_eq!(own, vec![alice1.device_id().unwrap(), alice2.device_id().unwrap()]);
    }

    #[tokio::test]
    async fn unprepared_engine_is_not_ready() {
        let hub = MemoryPubSub::new();
        let mut alice = engine(&hub, "alice@example.org", small_config());

        assert!(matches!(alice.device_id(), Err(OmemoError::NotReady)));
        assert!(matches!(
            alice.encrypt_outbound(&id("bob@example.org"), "hi").await,
            Err(OmemoError::NotReady)
        ));
        assert!(matches!(alice.fingerprint(), Err(OmemoError::NotReady)));
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn roundtrip_to_every_recipient_device() {
        let hub = MemoryPubSub::new();
        let alice_id = id("alice@example.org");
        let mut alice1 = device(&hub, "alice@example.org").await;
        let mut alice2 = device(&hub, "alice@example.org").await;
        let mut bob1 = device(&hub, "bob@example.org").await;
        let mut bob2 = device(&hub, "bob@example.org").await;
        deliver_device_list(&hub, &mut alice1, &alice_id).await;

        let envelope = alice1
            .encrypt_outbound(&id("bob@example.org"), "hello all devices")
            .await
            .unwrap();

        // Two remote devices plus the sender's other device.
        assert_eq!(envelope.keys.len(), 3);
        assert_eq!(envelope.sender_device_id, alice1.device_id().unwrap());

        for recipient in [&mut bob1, &mut bob2, &mut alice2] {
            let text = recipient.decrypt_inbound(&alice_id, &envelope).await.unwrap();
            assert_eq!(text, "hello all devices");
        }
    }

    #[tokio::test]
    async fn unreachable_device_is_skipped() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob1 = device(&hub, "bob@example.org").await;
        let bob2 = device(&hub, "bob@example.org").await;

        hub.set_unavailable(&bob_id, &bundle_node(bob2.device_id().unwrap()), true);

        let envelope = alice.encrypt_outbound(&bob_id, "partial").await.unwrap();
        assert_eq!(envelope.keys.len(), 1);
        assert_eq!(envelope.keys[0].device_id, bob1.device_id().unwrap());
        assert_eq!(
            bob1.decrypt_inbound(alice.own_identifier(), &envelope).await.unwrap(),
            "partial"
        );
    }

    #[tokio::test]
    async fn no_reachable_device_fails() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let bob = device(&hub, "bob@example.org").await;

        hub.set_unavailable(&bob_id, &bundle_node(bob.device_id().unwrap()), true);
        assert!(matches!(
            alice.encrypt_outbound(&bob_id, "nobody home").await,
            Err(OmemoError::NoReachablePeer(peer)) if peer == bob_id
        ));

        // An account that never published anything.
        assert!(matches!(
            alice.encrypt_outbound(&id("carol@example.org"), "hi").await,
            Err(OmemoError::NoReachablePeer(_))
        ));
    }

    #[tokio::test]
    async fn note_to_self_reaches_other_own_devices() {
        let hub = MemoryPubSub::new();
        let alice_id = id("alice@example.org");
        let mut alice1 = device(&hub, "alice@example.org").await;
        let mut alice2 = device(&hub, "alice@example.org").await;
        deliver_device_list(&hub, &mut alice1, &alice_id).await;

        let envelope = alice1.encrypt_outbound(&alice_id, "note").await.unwrap();
        assert_eq!(envelope.keys.len(), 1);
        assert_eq!(envelope.keys[0].device_id, alice2.device_id().unwrap());
        assert_eq!(alice2.decrypt_inbound(&alice_id, &envelope).await.unwrap(), "note");
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    #[tokio::test]
    async fn first_contact_then_reply_then_normal_message() {
        let hub = MemoryPubSub::new();
        let alice_id = id("alice@example.org");
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;
        let bob_device = bob.device_id().unwrap();
        let bob_address = device_address(&bob_id, bob_device);

        let first = alice.encrypt_outbound(&bob_id, "hi bob").await.unwrap();
        assert_eq!(hub.retrievals(&bob_id, &bundle_node(bob_device)), 1);
        assert!(alice.store().has_session(&bob_address));
        assert_eq!(first.keys.len(), 1);
        assert!(first.keys[0].prekey);
        assert_eq!(bob.decrypt_inbound(&alice_id, &first).await.unwrap(), "hi bob");

        let reply = bob.encrypt_outbound(&alice_id, "hi alice").await.unwrap();
        assert!(!reply.keys[0].prekey);
        assert_eq!(alice.decrypt_inbound(&bob_id, &reply).await.unwrap(), "hi alice");

        let second = alice.encrypt_outbound(&bob_id, "again").await.unwrap();
        assert!(!second.keys[0].prekey);
        assert_eq!(hub.retrievals(&bob_id, &bundle_node(bob_device)), 1);
        assert_eq!(bob.decrypt_inbound(&alice_id, &second).await.unwrap(), "again");
    }

    #[tokio::test]
    async fn consumed_prekey_is_republished() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;
        let bob_device = bob.device_id().unwrap();

        let envelope = alice.encrypt_outbound(&bob_id, "hi").await.unwrap();
        bob.decrypt_inbound(alice.own_identifier(), &envelope).await.unwrap();

        assert_eq!(bob.store().pre_key_ids().unwrap().len(), 4);
        assert_eq!(published_prekeys(&hub, &bob_id, bob_device), 4);
    }

    #[tokio::test]
    async fn removed_sessions_are_reestablished() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;
        let bob_device = bob.device_id().unwrap();

        let first = alice.encrypt_outbound(&bob_id, "one").await.unwrap();
        bob.decrypt_inbound(alice.own_identifier(), &first).await.unwrap();

        assert_eq!(alice.remove_all_sessions(&bob_id).unwrap(), 1);
        assert!(!alice.store().has_session(&device_address(&bob_id, bob_device)));
        assert_eq!(alice.remove_all_sessions(&bob_id).unwrap(), 0);

        let second = alice.encrypt_outbound(&bob_id, "two").await.unwrap();
        assert!(second.keys[0].prekey);
        assert_eq!(hub.retrievals(&bob_id, &bundle_node(bob_device)), 2);
        assert_eq!(bob.decrypt_inbound(alice.own_identifier(), &second).await.unwrap(), "two");
    }

    // ── Inbound validation ──────────────────────────────────────────────

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;

        let mut envelope = alice.encrypt_outbound(&bob_id, "integrity").await.unwrap();
        envelope.payload[0] ^= 0x01;
        assert!(matches!(
            bob.decrypt_inbound(alice.own_identifier(), &envelope).await,
            Err(OmemoError::Decryption(_))
        ));
    }

    /// Copy of `envelope` with one byte of the first wrapped key flipped.
    fn flip(envelope: &EncryptedEnvelope, position: usize, mask: u8) -> EncryptedEnvelope {
        let mut tampered = envelope.clone();
        tampered.keys[0].data[position] ^= mask;
        tampered
    }

    /// Version header, ratchet ciphertext and trailing byte of a wrapped key.
    fn tamper_positions(envelope: &EncryptedEnvelope) -> [(usize, u8); 3] {
        let len = envelope.keys[0].data.len();
        [(0, 0x80), (len - 20, 0x01), (len - 1, 0x01)]
    }

    #[tokio::test]
    async fn tampered_prekey_message_is_rejected() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;

        let envelope = alice.encrypt_outbound(&bob_id, "integrity").await.unwrap();
        assert!(envelope.keys[0].prekey);

        for (position, mask) in tamper_positions(&envelope) {
            let tampered = flip(&envelope, position, mask);
            let result = bob.decrypt_inbound(alice.own_identifier(), &tampered).await;
            assert!(
                matches!(result, Err(OmemoError::Decryption(_))),
                "byte {position}: {result:?}"
            );
        }
        assert_eq!(
            bob.decrypt_inbound(alice.own_identifier(), &envelope).await.unwrap(),
            "integrity"
        );
    }

    #[tokio::test]
    async fn tampered_normal_message_is_rejected() {
        let hub = MemoryPubSub::new();
        let alice_id = id("alice@example.org");
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;

        let first = alice.encrypt_outbound(&bob_id, "hi bob").await.unwrap();
        bob.decrypt_inbound(&alice_id, &first).await.unwrap();

        let reply = bob.encrypt_outbound(&alice_id, "integrity").await.unwrap();
        assert!(!reply.keys[0].prekey);

        for (position, mask) in tamper_positions(&reply) {
            let tampered = flip(&reply, position, mask);
            let result = alice.decrypt_inbound(&bob_id, &tampered).await;
            assert!(
                matches!(result, Err(OmemoError::Decryption(_))),
                "byte {position}: {result:?}"
            );
        }
        assert_eq!(alice.decrypt_inbound(&bob_id, &reply).await.unwrap(), "integrity");
    }

    #[tokio::test]
    async fn envelope_must_address_local_device_once() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;
        let bob_device = bob.device_id().unwrap();

        let envelope = alice.encrypt_outbound(&bob_id, "once").await.unwrap();

        let mut none = envelope.clone();
        none.keys.clear();
        assert!(matches!(
            bob.decrypt_inbound(alice.own_identifier(), &none).await,
            Err(OmemoError::Addressing { found: 0, device_id }) if device_id == bob_device
        ));

        let mut twice = envelope.clone();
        twice.keys.push(twice.keys[0].clone());
        assert!(matches!(
            bob.decrypt_inbound(alice.own_identifier(), &twice).await,
            Err(OmemoError::Addressing { found: 2, .. })
        ));
    }

    // ── Device lists ────────────────────────────────────────────────────

    #[tokio::test]
    async fn device_list_update_overwrites() {
        let hub = MemoryPubSub::new();
        let carol = id("carol@example.org");
        let mut alice = device(&hub, "alice@example.org").await;

        alice.handle_device_list_update(&carol, &[1, 2]).await.unwrap();
        alice.handle_device_list_update(&carol, &[3, 0, 3]).await.unwrap();
        assert_eq!(
            alice.store().device_list(&carol).unwrap(),
            vec![DeviceId::new(3).unwrap()]
        );
    }

    #[tokio::test]
    async fn own_list_without_local_device_is_repaired() {
        let hub = MemoryPubSub::new();
        let alice_id = id("alice@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let local = alice.device_id().unwrap();
        let other = DeviceId::new(999).unwrap();

        alice.handle_device_list_update(&alice_id, &[999]).await.unwrap();

        assert_eq!(alice.store().own_device_list().unwrap(), vec![other, local]);
        match hub.item(&alice_id, NS_DEVICELIST) {
            Some(PubSubPayload::DeviceList { devices, .. }) => {
                assert_eq!(devices, vec![999, local.get()])
            }
            other => panic!("unexpected device list item: {other:?}"),
        }
    }

    // ── Enablement ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn enabling_bootstraps_and_switches_to_envelopes() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let _bob = device(&hub, "bob@example.org").await;
        let mut alice = engine(&hub, "alice@example.org", small_config());

        assert!(!alice.is_enabled(&bob_id).unwrap());
        assert_eq!(
            alice.process_outbound(&bob_id, "plain").await.unwrap(),
            Outbound::Plaintext("plain".into())
        );
        assert!(!alice.is_ready());

        assert!(alice.toggle(&bob_id).await.unwrap());
        assert!(alice.is_ready());
        assert!(matches!(
            alice.process_outbound(&bob_id, "secret").await.unwrap(),
            Outbound::Encrypted(_)
        ));

        assert!(!alice.toggle(&bob_id).await.unwrap());
        assert!(matches!(
            alice.process_outbound(&bob_id, "plain again").await.unwrap(),
            Outbound::Plaintext(_)
        ));
    }

    #[tokio::test]
    async fn failed_encryption_never_falls_back_to_plaintext() {
        let hub = MemoryPubSub::new();
        let carol = id("carol@example.org");
        let mut alice = device(&hub, "alice@example.org").await;

        alice.set_enabled(&carol, true).await.unwrap();
        assert!(matches!(
            alice.process_outbound(&carol, "hi").await,
            Err(OmemoError::NoReachablePeer(_))
        ));
    }

    // ── Pre-keys ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn replenish_tops_up_below_threshold() {
        let hub = MemoryPubSub::new();
        let mut alice = device(&hub, "alice@example.org").await;
        let local = alice.device_id().unwrap();

        assert_eq!(alice.replenish_prekeys().await.unwrap(), 0);

        for id in alice.store().pre_key_ids().unwrap().into_iter().take(3) {
            alice.store().remove_pre_key(id).unwrap();
        }
        assert_eq!(alice.replenish_prekeys().await.unwrap(), 3);

        let ids = alice.store().pre_key_ids().unwrap();
        assert_eq!(ids.len(), 5);
        assert!(ids.iter().all(|id| *id >= 4));
        assert_eq!(published_prekeys(&hub, alice.own_identifier(), local), 5);
    }

    // ── Trust ───────────────────────────────────────────────────────────

    fn public_identity(omemo: &Omemo) -> Vec<u8> {
        omemo
            .store()
            .identity_key_pair()
            .unwrap()
            .unwrap()
            .public_key
            .clone()
    }

    #[tokio::test]
    async fn strict_policy_requires_confirmation() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let mut alice = device(&hub, "alice@example.org").await;
        let mut bob = device(&hub, "bob@example.org").await;
        let bob_device = bob.device_id().unwrap();
        let stale = crate::generate_identity_key_pair().identity_key().serialize().to_vec();

        alice.trust_identity(&bob_id, bob_device, &stale).unwrap();
        assert!(matches!(
            alice.encrypt_outbound(&bob_id, "blocked").await,
            Err(OmemoError::TrustViolation { .. })
        ));

        let actual = public_identity(&bob);
        assert!(alice.trust_identity(&bob_id, bob_device, &actual).unwrap());
        let envelope = alice.encrypt_outbound(&bob_id, "confirmed").await.unwrap();
        assert_eq!(
            bob.decrypt_inbound(alice.own_identifier(), &envelope).await.unwrap(),
            "confirmed"
        );
        assert_eq!(
            alice.remote_fingerprint(&bob_id, bob_device).unwrap(),
            Some(bob.fingerprint().unwrap())
        );
    }

    #[tokio::test]
    async fn last_write_wins_accepts_changed_identity() {
        let hub = MemoryPubSub::new();
        let bob_id = id("bob@example.org");
        let config = EngineConfig {
            trust_policy: TrustPolicy::LastWriteWins,
            ..small_config()
        };
        let mut alice = engine(&hub, "alice@example.org", config);
        alice.prepare().await.unwrap();
        let bob = device(&hub, "bob@example.org").await;
        let bob_device = bob.device_id().unwrap();
        let stale = crate::generate_identity_key_pair().identity_key().serialize().to_vec();

        alice.trust_identity(&bob_id, bob_device, &stale).unwrap();
        alice.encrypt_outbound(&bob_id, "accepted").await.unwrap();
        assert_eq!(
            alice.remote_fingerprint(&bob_id, bob_device).unwrap(),
            Some(bob.fingerprint().unwrap())
        );
    }

    #[tokio::test]
    async fn trust_identity_rejects_garbage() {
        let hub = MemoryPubSub::new();
        let mut alice = device(&hub, "alice@example.org").await;
        assert!(matches!(
            alice.trust_identity(&id("bob@example.org"), DeviceId::new(1).unwrap(), b"junk"),
            Err(OmemoError::InvalidArgument(_))
        ));
    }
}
