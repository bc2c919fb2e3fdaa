//! OMEMO encryption core: multi-device end-to-end encryption over Signal
//! Protocol sessions.
//!
//! This crate provides:
//! - A namespaced key-value store holding all key material and sessions
//! - libsignal store adapters with a configurable identity trust policy
//! - Identity, pre-key and signed pre-key generation, and bundle publication
//! - Per-device sessions (X3DH + Double Ratchet) wrapping one content key
//! - AES-128-GCM content encryption fanned out to every recipient device

pub mod bootstrap;
pub mod config;
pub mod content_key;
pub mod device;
pub mod error;
pub mod identity;
pub mod kv;
pub mod omemo;
pub mod peer;
pub mod prekey;
pub mod pubsub;
pub mod stores;

pub use config::{EngineConfig, TrustPolicy};
pub use device::{device_address, Device};
pub use error::{OmemoError, Result};
pub use identity::{fingerprint, generate_identity_key_pair, SerializableIdentityKeyPair};
pub use kv::{KeyValueStore, MemoryBackend, StorageBackend};
pub use omemo::{Omemo, Outbound};
pub use peer::{DeviceRegistry, Peer};
pub use pubsub::{BundleService, FetchError, MemoryPubSub, PubSubClient};
pub use stores::SignalStores;
