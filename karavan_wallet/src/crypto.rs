//! Encryption of the persisted wallet data.

#[allow(deprecated)]
use aes_gcm_siv::aead::generic_array::GenericArray;
use aes_gcm_siv::aead::AeadMutInPlace;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit};
use rand::{thread_rng, Rng};

use crate::Error;

/// Length in bytes of an AES-GCM-SIV nonce.
pub const NONCE_LEN: usize = 12;

/// Create a cipher from 32 key bytes.
#[allow(deprecated)]
pub fn cipher_from_key_bytes(key_bytes: [u8; 32]) -> Aes256GcmSiv {
    let key = GenericArray::from_slice(&key_bytes);
    Aes256GcmSiv::new(key)
}

/// Encrypt a payload with a random nonce, returning `nonce || ciphertext`.
///
/// NOTE: `allow(deprecated)` cannot be removed until aes-gcm-siv 0.12 is released
#[allow(deprecated)]
pub fn encrypt_with_random_nonce(
    cipher: &mut Aes256GcmSiv,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    thread_rng().fill(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    cipher.encrypt_in_place(nonce, b"", &mut buffer)?;

    let mut result = Vec::with_capacity(NONCE_LEN + buffer.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&buffer);
    Ok(result)
}

/// Decrypt a payload encrypted with [`encrypt_with_random_nonce`].
#[allow(deprecated)]
pub fn decrypt_with_nonce_prefix(cipher: &mut Aes256GcmSiv, data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() < NONCE_LEN {
        return Err(Error::Aes("Encrypted data too short - missing nonce".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = GenericArray::from_slice(nonce_bytes);

    let mut buffer = ciphertext.to_vec();
    cipher.decrypt_in_place(nonce, b"", &mut buffer)?;
    Ok(buffer)
}
