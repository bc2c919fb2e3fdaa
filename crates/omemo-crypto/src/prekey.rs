//! Pre-key and signed pre-key generation, and bundle conversion.
//!
//! One-time pre-keys are consumed by the first prekey message that uses
//! them. The signed pre-key is a medium-term key signed by the identity key.

use libsignal_protocol::{
    GenericSignedPreKey, IdentityKey, IdentityKeyPair, KeyPair, PreKeyBundle, PreKeyId,
    PreKeyRecord, PreKeyStore, PublicKey, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
    Timestamp,
};
use omemo_protocol::{DeviceId, PreKeyBundleData};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;

use crate::error::{OmemoError, Result};
use crate::kv::KeyValueStore;
use crate::stores::SignalStores;

/// Largest one-time pre-key id before ids wrap around to 1.
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFE;

/// Id of the signed pre-key generated at bootstrap.
pub const INITIAL_SIGNED_PREKEY_ID: u32 = 1;

/// Generate `count` one-time pre-keys, continuing from the stored id counter.
/// Returns the ids generated.
pub async fn generate_prekeys(stores: &mut SignalStores, count: u32) -> Result<Vec<u32>> {
    let store = stores.kv().clone();
    let mut next = store.next_pre_key_id()?;
    let mut ids = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let id = PreKeyId::from(next);
        let key_pair = KeyPair::generate(&mut OsRng);
        let record = PreKeyRecord::new(id, &key_pair);
        stores.prekey.save_pre_key(id, &record).await?;
        ids.push(next);
        next = if next >= MAX_PREKEY_ID { 1 } else { next + 1 };
    }

    store.set_next_pre_key_id(next)?;
    Ok(ids)
}

/// Generate a signed pre-key under `id` and store it as the current one.
pub async fn generate_signed_prekey(
    stores: &mut SignalStores,
    identity_key_pair: &IdentityKeyPair,
    id: u32,
) -> Result<()> {
    let signed_prekey_id = SignedPreKeyId::from(id);
    let signed_key_pair = KeyPair::generate(&mut OsRng);
    let timestamp_millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let timestamp = Timestamp::from_epoch_millis(timestamp_millis);

    let signature = identity_key_pair
        .private_key()
        .calculate_signature(&signed_key_pair.public_key.serialize(), &mut OsRng)?;

    let signed_record =
        SignedPreKeyRecord::new(signed_prekey_id, timestamp, &signed_key_pair, &signature);
    stores
        .signed_prekey
        .save_signed_pre_key(signed_prekey_id, &signed_record)
        .await?;

    Ok(())
}

/// Assemble the local device's publishable bundle from stored key material.
pub fn local_bundle(store: &KeyValueStore) -> Result<PreKeyBundleData> {
    let identity = store.identity_key_pair()?.ok_or(OmemoError::NotReady)?;
    let signed_id = store.current_signed_pre_key_id()?.ok_or(OmemoError::NotReady)?;
    let signed_bytes = store
        .load_signed_pre_key(signed_id)?
        .ok_or(OmemoError::NotReady)?;
    let signed = SignedPreKeyRecord::deserialize(&signed_bytes)?;

    let mut prekeys = Vec::new();
    for id in store.pre_key_ids()? {
        let Some(bytes) = store.load_pre_key(id)? else {
            continue;
        };
        let record = PreKeyRecord::deserialize(&bytes)?;
        prekeys.push((id, record.public_key()?.serialize().to_vec()));
    }

    Ok(PreKeyBundleData {
        identity_key: identity.public_key.clone(),
        signed_prekey_id: signed_id,
        signed_prekey: signed.public_key()?.serialize().to_vec(),
        signed_prekey_signature: signed.signature()?.to_vec(),
        prekeys,
    })
}

/// Convert a fetched bundle into libsignal's key-agreement parameters,
/// picking one of the published one-time pre-keys at random.
///
/// Published bundles carry no registration id; 0 is used.
pub fn to_signal_bundle(data: &PreKeyBundleData, device_id: DeviceId) -> Result<PreKeyBundle> {
    let parse = |e: libsignal_protocol::SignalProtocolError| OmemoError::Parse(e.to_string());

    let identity_key = IdentityKey::decode(&data.identity_key).map_err(parse)?;
    let signed_prekey = PublicKey::deserialize(&data.signed_prekey).map_err(parse)?;

    let prekey = match data.prekeys.choose(&mut OsRng) {
        Some((id, bytes)) => Some((
            PreKeyId::from(*id),
            PublicKey::deserialize(bytes).map_err(parse)?,
        )),
        None => None,
    };

    PreKeyBundle::new(
        0,
        device_id.get().into(),
        prekey,
        SignedPreKeyId::from(data.signed_prekey_id),
        signed_prekey,
        data.signed_prekey_signature.clone(),
        identity_key,
    )
    .map_err(parse)
}
