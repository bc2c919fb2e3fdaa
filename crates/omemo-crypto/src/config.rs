use serde::Deserialize;

/// How a changed identity key for an already known device is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Reject the new key until it is confirmed with `Omemo::trust_identity`.
    #[default]
    Strict,
    /// Accept the new key, overwrite the stored one and log the change.
    LastWriteWins,
}

/// Engine configuration, usually embedded in the host's TOML config.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Namespace under which all key material is stored in the backend.
    #[serde(default = "default_storage_namespace")]
    pub storage_namespace: String,

    /// Number of one-time pre-keys generated at bootstrap and per replenish.
    #[serde(default = "default_initial_prekey_count")]
    pub initial_prekey_count: u32,

    /// Replenish once fewer than this many one-time pre-keys remain.
    #[serde(default = "default_prekey_replenish_threshold")]
    pub prekey_replenish_threshold: u32,

    #[serde(default)]
    pub trust_policy: TrustPolicy,
}

fn default_storage_namespace() -> String {
    "store".into()
}

fn default_initial_prekey_count() -> u32 {
    100
}

fn default_prekey_replenish_threshold() -> u32 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_namespace: default_storage_namespace(),
            initial_prekey_count: default_initial_prekey_count(),
            prekey_replenish_threshold: default_prekey_replenish_threshold(),
            trust_policy: TrustPolicy::default(),
        }
    }
}
