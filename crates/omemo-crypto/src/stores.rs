//! libsignal store traits backed by the [`KeyValueStore`].
//!
//! Each store is a thin view over the same key-value handle, so libsignal
//! can borrow the session and identity stores mutably at the same time.

use libsignal_protocol::{
    Direction, GenericSignedPreKey, IdentityKey, IdentityKeyPair, IdentityKeyStore, KyberPreKeyId,
    KyberPreKeyRecord, KyberPreKeyStore, PreKeyId, PreKeyRecord, PreKeyStore, ProtocolAddress,
    SessionRecord, SessionStore, SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord,
    SignedPreKeyStore,
};
use tracing::warn;

use crate::config::TrustPolicy;
use crate::identity::fingerprint;
use crate::kv::KeyValueStore;

/// All libsignal stores bundled together.
#[derive(Clone)]
pub struct SignalStores {
    pub identity: OmemoIdentityStore,
    pub prekey: OmemoPreKeyStore,
    pub signed_prekey: OmemoSignedPreKeyStore,
    pub session: OmemoSessionStore,
    pub kyber: OmemoKyberPreKeyStore,
}

impl SignalStores {
    pub fn new(kv: KeyValueStore, trust_policy: TrustPolicy) -> Self {
        Self {
            identity: OmemoIdentityStore {
                kv: kv.clone(),
                trust_policy,
            },
            prekey: OmemoPreKeyStore { kv: kv.clone() },
            signed_prekey: OmemoSignedPreKeyStore { kv: kv.clone() },
            session: OmemoSessionStore { kv },
            kyber: OmemoKyberPreKeyStore,
        }
    }

    pub fn kv(&self) -> &KeyValueStore {
        &self.session.kv
    }
}

fn storage_error(e: crate::error::OmemoError) -> SignalProtocolError {
    e.into_signal()
}

// ── Identity Key Store ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct OmemoIdentityStore {
    kv: KeyValueStore,
    trust_policy: TrustPolicy,
}

#[async_trait::async_trait(?Send)]
impl IdentityKeyStore for OmemoIdentityStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        let pair = self
            .kv
            .identity_key_pair()
            .map_err(storage_error)?
            .ok_or_else(|| SignalProtocolError::InvalidArgument("local identity missing".into()))?;
        pair.to_identity_key_pair().map_err(storage_error)
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        self.kv
            .local_registration_id()
            .map_err(storage_error)?
            .ok_or_else(|| SignalProtocolError::InvalidArgument("registration id missing".into()))
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SignalProtocolError> {
        let serialized = identity.serialize();
        let changed = self
            .kv
            .save_identity(address, &serialized)
            .map_err(storage_error)?;
        if changed {
            warn!(
                %address,
                fingerprint = %fingerprint(&serialized),
                "identity key changed"
            );
        }
        Ok(changed)
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        let trusted = self
            .kv
            .is_trusted_identity(address, &identity.serialize())
            .map_err(storage_error)?;
        if trusted {
            return Ok(true);
        }
        match self.trust_policy {
            TrustPolicy::Strict => {
                warn!(%address, "rejecting changed identity key");
                Ok(false)
            }
            TrustPolicy::LastWriteWins => {
                warn!(%address, "accepting changed identity key (last write wins)");
                Ok(true)
            }
        }
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        match self.kv.load_identity(address).map_err(storage_error)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(IdentityKey::decode(&bytes)?)),
        }
    }
}

// ── Kyber Pre-Key Store ────────────────────────────────────────────────
// OMEMO bundles carry no post-quantum (Kyber) keys, but the decrypt
// functions require a KyberPreKeyStore. This is a no-op stub.

#[derive(Clone)]
pub struct OmemoKyberPreKeyStore;

#[async_trait::async_trait(?Send)]
impl KyberPreKeyStore for OmemoKyberPreKeyStore {
    async fn get_kyber_pre_key(
        &self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        Err(SignalProtocolError::InvalidKyberPreKeyId)
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }
}

// ── Pre-Key Store ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OmemoPreKeyStore {
    kv: KeyValueStore,
}

#[async_trait::async_trait(?Send)]
impl PreKeyStore for OmemoPreKeyStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        let bytes = self
            .kv
            .load_pre_key(id.into())
            .map_err(storage_error)?
            .ok_or(SignalProtocolError::InvalidPreKeyId)?;
        PreKeyRecord::deserialize(&bytes)
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.kv
            .store_pre_key(id.into(), &record.serialize()?)
            .map_err(storage_error)
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        self.kv.remove_pre_key(id.into()).map_err(storage_error)
    }
}

// ── Signed Pre-Key Store ────────────────────────────────────────────────

#[derive(Clone)]
pub struct OmemoSignedPreKeyStore {
    kv: KeyValueStore,
}

#[async_trait::async_trait(?Send)]
impl SignedPreKeyStore for OmemoSignedPreKeyStore {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        let bytes = self
            .kv
            .load_signed_pre_key(id.into())
            .map_err(storage_error)?
            .ok_or(SignalProtocolError::InvalidSignedPreKeyId)?;
        SignedPreKeyRecord::deserialize(&bytes)
    }

    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.kv
            .store_signed_pre_key(id.into(), &record.serialize()?)
            .map_err(storage_error)
    }
}

// ── Session Store ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OmemoSessionStore {
    kv: KeyValueStore,
}

#[async_trait::async_trait(?Send)]
impl SessionStore for OmemoSessionStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        match self.kv.load_session(address).map_err(storage_error)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
        }
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        self.kv
            .store_session(address, &record.serialize()?)
            .map_err(storage_error)
    }
}
