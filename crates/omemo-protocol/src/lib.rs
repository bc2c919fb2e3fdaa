//! Shared data model for the OMEMO encryption layer.
//!
//! Account identifiers, device ids, the envelope handed to the stanza layer,
//! and the shapes published to / retrieved from the bundle pub/sub service.

pub mod bundle;
pub mod error;
pub mod types;

pub use bundle::{PreKeyBundleData, PubSubItems, PubSubPayload, PublishedBundle, PublishedPreKey};
pub use error::ProtocolError;
pub use types::{device_list_from_raw, DeviceId, EncryptedEnvelope, Identifier, WrappedKey};

/// Base namespace of the encryption payload and of published bundles.
pub const NS_BASE: &str = "eu.siacs.conversations.axolotl";

/// Pub/sub node carrying an account's device list.
pub const NS_DEVICELIST: &str = "eu.siacs.conversations.axolotl.devicelist";

/// Prefix of the per-device bundle node; the device id is appended.
pub const NS_BUNDLES: &str = "eu.siacs.conversations.axolotl.bundles:";

/// Node name holding the bundle of `device_id`.
pub fn bundle_node(device_id: DeviceId) -> String {
    format!("{}{}", NS_BUNDLES, device_id)
}
