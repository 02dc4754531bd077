//! Sealing of wallet secrets at rest.
//!
//! Secrets are encrypted with AES-256-GCM under a key derived from the user's
//! password with Argon2id. Every sealed record carries its own salt and nonce,
//! so records written under an earlier unlock still open with the same password.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Algorithm, Argon2, ParamsBuilder, Version,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use zeroize::Zeroizing;

use crate::wallet::types::SecretMaterial;

const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const SALT_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: invalid password or corrupted data")]
    Decrypt,

    #[error("Malformed sealed secret: {0}")]
    Malformed(String),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// A secret as it is written to the store. All fields are hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Derives an encryption key from a password using Argon2id.
pub fn derive_encryption_key(
    password: &str,
    salt: &[u8; SALT_SIZE],
    params: KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, SealError> {
    let params = ParamsBuilder::new()
        .m_cost(params.memory_kib)
        .t_cost(params.iterations)
        .p_cost(params.parallelism)
        .output_len(KEY_SIZE)
        .build()
        .map_err(|e| SealError::KeyDerivation(format!("invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt_string =
        SaltString::encode_b64(salt).map_err(|e| SealError::KeyDerivation(e.to_string()))?;

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt_string)
        .map_err(|e| SealError::KeyDerivation(e.to_string()))?;

    let hash_bytes = password_hash
        .hash
        .ok_or_else(|| SealError::KeyDerivation("no output".to_string()))?;

    if hash_bytes.len() != KEY_SIZE {
        return Err(SealError::KeyDerivation(format!(
            "unexpected key length {}",
            hash_bytes.len()
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(hash_bytes.as_bytes());
    Ok(key)
}

/// Holds the unlock password and the keys derived from it.
///
/// Dropping the sealer drops every derived key; nothing can be sealed or
/// opened afterwards.
pub struct SecretSealer {
    password: Zeroizing<String>,
    params: KdfParams,
    salt: [u8; SALT_SIZE],
    keys: Mutex<HashMap<[u8; SALT_SIZE], Zeroizing<[u8; KEY_SIZE]>>>,
}

impl SecretSealer {
    /// Derive the sealing key for a fresh salt. This is the expensive step.
    pub fn new(password: &str, params: KdfParams) -> Result<Self, SealError> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let key = derive_encryption_key(password, &salt, params)?;

        let mut keys = HashMap::new();
        keys.insert(salt, key);
        Ok(Self {
            password: Zeroizing::new(password.to_string()),
            params,
            salt,
            keys: Mutex::new(keys),
        })
    }

    fn key_for(&self, salt: &[u8; SALT_SIZE]) -> Result<Zeroizing<[u8; KEY_SIZE]>, SealError> {
        if let Some(key) = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(salt)
        {
            return Ok(key.clone());
        }

        let key = derive_encryption_key(&self.password, salt, self.params)?;
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*salt, key.clone());
        Ok(key)
    }

    pub fn seal(&self, secret: &SecretMaterial) -> Result<SealedSecret, SealError> {
        let key = self.key_for(&self.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| SealError::Encrypt)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(&Nonce::from(nonce), secret.expose().as_bytes())
            .map_err(|_| SealError::Encrypt)?;

        Ok(SealedSecret {
            salt: hex::encode(self.salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<SecretMaterial, SealError> {
        let salt: [u8; SALT_SIZE] = decode_fixed(&sealed.salt, "salt")?;
        let nonce: [u8; NONCE_SIZE] = decode_fixed(&sealed.nonce, "nonce")?;
        let ciphertext = hex::decode(&sealed.ciphertext)
            .map_err(|e| SealError::Malformed(format!("ciphertext: {}", e)))?;

        let key = self.key_for(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| SealError::Decrypt)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(&Nonce::from(nonce), ciphertext.as_slice())
                .map_err(|_| SealError::Decrypt)?,
        );

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| SealError::Malformed("secret is not UTF-8".to_string()))?;
        Ok(SecretMaterial::new(text))
    }
}

fn decode_fixed<const N: usize>(raw: &str, field: &str) -> Result<[u8; N], SealError> {
    hex::decode(raw)
        .map_err(|e| SealError::Malformed(format!("{}: {}", field, e)))?
        .try_into()
        .map_err(|_| SealError::Malformed(format!("{} must be {} bytes", field, N)))
}
