use libsignal_protocol::SignalProtocolError;
use omemo_protocol::{DeviceId, Identifier, ProtocolError};
use thiserror::Error;

pub type Result<T, E = OmemoError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum OmemoError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("untrusted identity key for {address}")]
    TrustViolation { address: String },

    #[error("could not retrieve {node}: {reason}")]
    Fetch { node: String, reason: String },

    #[error("could not parse bundle: {0}")]
    Parse(String),

    #[error("could not encrypt for any device of {0}")]
    NoReachablePeer(Identifier),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("authentication tag has {len} bytes, expected 16")]
    AuthTag { len: usize },

    #[error("found {found} keys addressed to device {device_id}, expected exactly one")]
    Addressing { device_id: DeviceId, found: usize },

    #[error("local device is not prepared (missing device id, identity or registration id)")]
    NotReady,

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("signal protocol error: {0}")]
    Signal(#[from] SignalProtocolError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl OmemoError {
    /// Map a ratchet error raised while unwrapping an inbound key.
    pub(crate) fn from_decrypt(e: SignalProtocolError) -> Self {
        match e {
            SignalProtocolError::UntrustedIdentity(address) => Self::TrustViolation {
                address: address.to_string(),
            },
            other => Self::Decryption(other.to_string()),
        }
    }

    /// Map a ratchet error raised while establishing a session or wrapping a key.
    pub(crate) fn from_encrypt(e: SignalProtocolError) -> Self {
        match e {
            SignalProtocolError::UntrustedIdentity(address) => Self::TrustViolation {
                address: address.to_string(),
            },
            other => Self::Signal(other),
        }
    }

    pub(crate) fn into_signal(self) -> SignalProtocolError {
        SignalProtocolError::InvalidArgument(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_tag_display() {
        let e = OmemoError::AuthTag { len: 4 };
        assert!(e.to_string().contains("4 bytes"));
    }

    #[test]
    fn addressing_display() {
        let e = OmemoError::Addressing {
            device_id: DeviceId::new(7).unwrap(),
            found: 2,
        };
        let msg = e.to_string();
        assert!(msg.contains("found 2"));
        assert!(msg.contains("device 7"));
    }

    #[test]
    fn crypto_display() {
        let e = OmemoError::Crypto("RNG failed".into());
        assert_eq!(e.to_string(), "cryptographic failure: RNG failed");
    }

    #[test]
    fn untrusted_identity_maps_to_trust_violation() {
        let address = libsignal_protocol::ProtocolAddress::new("bob@example.org".into(), 3.into());
        let e = OmemoError::from_decrypt(SignalProtocolError::UntrustedIdentity(address));
        assert!(matches!(e, OmemoError::TrustViolation { .. }));
    }

    #[test]
    fn from_protocol_error() {
        let e: OmemoError = ProtocolError::InvalidDeviceId(0).into();
        assert!(e.to_string().contains("device id"));
    }
}
