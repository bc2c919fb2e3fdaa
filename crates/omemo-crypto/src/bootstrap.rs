//! First-run generation and publication of the local device's key material.

use omemo_protocol::{
    bundle_node, device_list_from_raw, DeviceId, Identifier, PubSubPayload, PublishedBundle,
    NS_BASE, NS_DEVICELIST,
};
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{OmemoError, Result};
use crate::identity::{generate_identity_key_pair, SerializableIdentityKeyPair};
use crate::prekey::{
    generate_prekeys, generate_signed_prekey, local_bundle, INITIAL_SIGNED_PREKEY_ID,
};
use crate::pubsub::BundleService;
use crate::stores::SignalStores;

/// Registration ids are drawn from this range.
const REGISTRATION_ID_RANGE: std::ops::RangeInclusive<u32> = 1..=16380;

/// Make sure the local device exists and is published.
///
/// Generates identity, registration id, device id, signed pre-key and
/// one-time pre-keys when the store has none. The device id is written last
/// so an interrupted bootstrap is redone from scratch.
pub async fn prepare(
    own: &Identifier,
    stores: &mut SignalStores,
    service: &dyn BundleService,
    config: &EngineConfig,
) -> Result<DeviceId> {
    let store = stores.kv().clone();

    if let Some(device_id) = store.device_id()?.filter(|_| store.is_ready()) {
        if !store.is_published()? {
            publish(own, stores, service).await?;
        }
        return Ok(device_id);
    }

    info!(identifier = %own, "generating local device");

    let mut own_list = match fetch_device_list(service, own).await {
        Ok(list) => list,
        Err(e) => {
            debug!("no published device list for own account: {e}");
            store.own_device_list()?
        }
    };

    let identity = generate_identity_key_pair();
    store.set_identity_key_pair(&SerializableIdentityKeyPair::from_identity_key_pair(&identity))?;
    store.set_local_registration_id(OsRng.gen_range(REGISTRATION_ID_RANGE))?;

    generate_signed_prekey(stores, &identity, INITIAL_SIGNED_PREKEY_ID).await?;
    generate_prekeys(stores, config.initial_prekey_count).await?;

    let device_id = loop {
        let candidate = DeviceId::new(OsRng.gen_range(1..=DeviceId::MAX))?;
        if !own_list.contains(&candidate) {
            break candidate;
        }
    };
    own_list.push(device_id);
    store.set_own_device_list(&own_list)?;
    store.set_published(false)?;
    store.set_device_id(device_id)?;

    info!(identifier = %own, %device_id, "local device generated");

    publish(own, stores, service).await?;
    Ok(device_id)
}

/// Publish the local bundle and the own device list.
pub async fn publish(
    own: &Identifier,
    stores: &SignalStores,
    service: &dyn BundleService,
) -> Result<()> {
    let store = stores.kv();
    let device_id = store.device_id()?.ok_or(OmemoError::NotReady)?;

    publish_bundle(stores, service, device_id).await?;
    publish_device_list(service, &store.own_device_list()?).await?;
    store.set_published(true)?;

    info!(identifier = %own, %device_id, "bundle and device list published");
    Ok(())
}

pub async fn publish_bundle(
    stores: &SignalStores,
    service: &dyn BundleService,
    device_id: DeviceId,
) -> Result<()> {
    let node = bundle_node(device_id);
    let bundle = PublishedBundle::encode(&local_bundle(stores.kv())?);
    debug!(%node, prekeys = bundle.pre_keys.len(), "publishing bundle");

    service
        .publish_items(&node, PubSubPayload::Bundle(bundle))
        .await
        .map_err(|e| OmemoError::Fetch {
            node,
            reason: e.to_string(),
        })
}

pub async fn publish_device_list(service: &dyn BundleService, devices: &[DeviceId]) -> Result<()> {
    let payload = PubSubPayload::DeviceList {
        namespace: NS_BASE.into(),
        devices: devices.iter().map(|id| id.get()).collect(),
    };
    service
        .publish_items(NS_DEVICELIST, payload)
        .await
        .map_err(|e| OmemoError::Fetch {
            node: NS_DEVICELIST.into(),
            reason: e.to_string(),
        })
}

/// Retrieve the published device list of `identifier`.
pub async fn fetch_device_list(
    service: &dyn BundleService,
    identifier: &Identifier,
) -> Result<Vec<DeviceId>> {
    let items = service
        .retrieve_items(NS_DEVICELIST, identifier)
        .await
        .map_err(|e| OmemoError::Fetch {
            node: NS_DEVICELIST.into(),
            reason: e.to_string(),
        })?;

    match items.device_list() {
        Some(raw) => Ok(device_list_from_raw(raw)),
        None => {
            warn!(%identifier, "device list node holds no device list");
            Err(OmemoError::Parse(format!("no device list in {NS_DEVICELIST}")))
        }
    }
}
