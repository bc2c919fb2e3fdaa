use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid account identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid device id: {0} (must be in 1..=2147483647)")]
    InvalidDeviceId(u32),

    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("invalid base64 in bundle: {0}")]
    Base64(#[from] base64::DecodeError),
}
