//! Symmetric AES-128-GCM encryption of message content.
//!
//! Each outbound message gets a fresh key and IV. The exported key and the
//! 16-byte GCM tag are concatenated into the 32-byte blob that is wrapped
//! once per recipient device; the ciphertext itself travels without its tag.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{OmemoError, Result};

pub const KEY_SIZE: usize = 16;
pub const GCM_TAG_SIZE: usize = 16;
pub const IV_SIZE: usize = 12;

/// Size of the wrapped blob: key ‖ tag.
pub const KEY_MATERIAL_SIZE: usize = KEY_SIZE + GCM_TAG_SIZE;

/// Key ‖ tag of one message. Lives only for the duration of one
/// encrypt or decrypt call.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_MATERIAL_SIZE]);

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Output of [`seal`].
pub struct SealedContent {
    pub iv: [u8; IV_SIZE],
    /// Ciphertext without the tag.
    pub payload: Vec<u8>,
    pub key_material: KeyMaterial,
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_128_GCM, key)
        .map_err(|_| OmemoError::Crypto("invalid content key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under a freshly generated key and IV.
pub fn seal(plaintext: &[u8]) -> Result<SealedContent> {
    let rng = SystemRandom::new();

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    rng.fill(&mut key[..])
        .map_err(|_| OmemoError::Crypto("RNG failed".into()))?;

    let mut iv = [0u8; IV_SIZE];
    rng.fill(&mut iv)
        .map_err(|_| OmemoError::Crypto("RNG failed".into()))?;

    let mut in_out = plaintext.to_vec();
    let tag = aead_key(&key[..])?
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
        .map_err(|_| OmemoError::Crypto("encryption failed".into()))?;

    let mut material = [0u8; KEY_MATERIAL_SIZE];
    material[..KEY_SIZE].copy_from_slice(&key[..]);
    material[KEY_SIZE..].copy_from_slice(tag.as_ref());

    Ok(SealedContent {
        iv,
        payload: in_out,
        key_material: KeyMaterial(material),
    })
}

/// Decrypt `payload` with an unwrapped key ‖ tag blob.
///
/// Fails with [`OmemoError::AuthTag`] unless exactly 16 tag bytes follow the
/// key, and with [`OmemoError::Decryption`] if authentication fails.
pub fn open(key_material: &[u8], iv: &[u8; IV_SIZE], payload: &[u8]) -> Result<Vec<u8>> {
    if key_material.len() < KEY_SIZE {
        return Err(OmemoError::AuthTag { len: 0 });
    }
    let (key, tag) = key_material.split_at(KEY_SIZE);
    if tag.len() != GCM_TAG_SIZE {
        return Err(OmemoError::AuthTag { len: tag.len() });
    }

    let mut in_out = Vec::with_capacity(payload.len() + GCM_TAG_SIZE);
    in_out.extend_from_slice(payload);
    in_out.extend_from_slice(tag);

    let plaintext = aead_key(key)?
        .open_in_place(Nonce::assume_unique_for_key(*iv), Aad::empty(), &mut in_out)
        .map_err(|_| OmemoError::Decryption("content authentication failed".into()))?;

    Ok(plaintext.to_vec())
}
