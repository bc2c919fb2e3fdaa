use omemo_crypto::EngineConfig;
use serde::Deserialize;

/// Loopback demo configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct DemoConfig {
    /// Account that sends the first message.
    #[serde(default = "default_sender")]
    pub sender: String,

    #[serde(default = "default_recipient")]
    pub recipient: String,

    /// Number of devices registered for the sender account.
    #[serde(default = "default_devices")]
    pub sender_devices: u32,

    #[serde(default = "default_devices")]
    pub recipient_devices: u32,

    /// Settings shared by every engine in the demo.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_sender() -> String {
    "alice@example.org".into()
}

fn default_recipient() -> String {
    "bob@example.org".into()
}

fn default_devices() -> u32 {
    2
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            sender: default_sender(),
            recipient: default_recipient(),
            sender_devices: default_devices(),
            recipient_devices: default_devices(),
            engine: EngineConfig::default(),
        }
    }
}
