//! Symmetric primitives for the vault engine.
//!
//! AES-256-GCM for file contents and key wrapping, HKDF-SHA256 for deriving
//! the password wrapping key. Key size: 32 bytes. Nonce: 12 bytes (random).
//! Tag: 16 bytes.
//!
//! Ciphertext wire format (the "combined blob"):
//!   [ nonce (12 bytes) | ciphertext + tag (16 bytes) ]

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CofferError, Result};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Domain-separation label for the wrapping-key derivation. Part of the
/// on-disk contract: changing it invalidates every existing vault.
pub const KDF_INFO: &[u8] = b"com.loganross.coffer.v1";

/// 32-byte key that seals file contents. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CofferError::DecryptionFailed)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// 32-byte key derived from the user's password. Used only to wrap and
/// unwrap the master key, never to seal file contents.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey([u8; KEY_LEN]);

/// Output of [`seal`]: the persistable blob plus the raw nonce and tag so
/// the manifest can record them separately.
pub struct SealedBlob {
    pub combined: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

pub fn generate_master_key() -> MasterKey {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    MasterKey(bytes)
}

/// Fresh random salt. Salts are public; they are stored ungated in the
/// secret store next to the wrapped master key.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// HKDF-SHA256(IKM = password bytes, salt, info = [`KDF_INFO`], L = 32).
pub fn derive_wrapping_key(password: &str, salt: &[u8]) -> WrappingKey {
    let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut key = [0u8; KEY_LEN];
    hk.expand(KDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    WrappingKey(key)
}

/// Encrypt `plaintext`, prepending a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<SealedBlob> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CofferError::EncryptionFailed)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CofferError::EncryptionFailed)?;

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&ciphertext[ciphertext.len() - TAG_LEN..]);

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(SealedBlob {
        combined,
        nonce,
        tag,
    })
}

/// Decrypt a combined blob. Any failure — malformed blob, mismatched tag,
/// wrong key — collapses into [`CofferError::DecryptionFailed`]; this is
/// the sole wrong-password detector for file contents.
pub fn open(combined: &[u8], key: &[u8; KEY_LEN]) -> Result<Zeroizing<Vec<u8>>> {
    if combined.len() < NONCE_LEN + TAG_LEN {
        return Err(CofferError::DecryptionFailed);
    }
    let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CofferError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CofferError::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}

/// Seal the master key's raw bytes with the wrapping key. The output is
/// what the secret store persists as the wrapped-master-key slot.
pub fn wrap_master_key(master: &MasterKey, wrapping: &WrappingKey) -> Result<Vec<u8>> {
    Ok(seal(master.as_bytes(), &wrapping.0)?.combined)
}

/// Unwrap failure means the wrapping key was derived from the wrong
/// password; the caller cannot tell which step rejected.
pub fn unwrap_master_key(wrapped: &[u8], wrapping: &WrappingKey) -> Result<MasterKey> {
    let plaintext = open(wrapped, &wrapping.0).map_err(|_| CofferError::WrongPassword)?;
    MasterKey::try_from_slice(&plaintext).map_err(|_| CofferError::WrongPassword)
}
