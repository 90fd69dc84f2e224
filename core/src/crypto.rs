use argon2::Argon2;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::hooks::DataFilter;
use crate::{Error, Result};

const KEY_CHECK_PLAINTEXT: &[u8] = b"strata key check";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl Default for KdfParams {
    fn default() -> Self {
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations: 1,
            memory: 65536,
            parallelism: 4,
            salt,
        }
    }
}

pub struct MasterKey {
    key: Vec<u8>,
}

impl MasterKey {
    pub fn derive_from_password(password: &str, params: &KdfParams) -> Result<Self> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(params.memory, params.iterations, params.parallelism, Some(32))
                .map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut key = vec![0u8; 32];
        argon2
            .hash_password_into(password.as_bytes(), &params.salt, &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Encryption("Key must be 32 bytes".to_string()));
        }

        let key = Key::from_slice(key);
        let cipher = ChaCha20Poly1305::new(key);
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 12 {
            return Err(Error::Encryption("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, encrypted)
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

/// Encryption settings recorded in the repository config. The key check is a
/// known plaintext encrypted with the derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub kdf_params: KdfParams,
    pub key_check: Vec<u8>,
}

impl EncryptionConfig {
    pub fn generate(password: &str) -> Result<(Self, EncryptionFilter)> {
        let kdf_params = KdfParams::default();
        let key = MasterKey::derive_from_password(password, &kdf_params)?;
        let encryptor = Encryptor::new(key.as_bytes())?;
        let key_check = encryptor.encrypt(KEY_CHECK_PLAINTEXT)?;
        Ok((
            Self {
                kdf_params,
                key_check,
            },
            EncryptionFilter { encryptor },
        ))
    }

    pub fn unlock(&self, password: &str) -> Result<EncryptionFilter> {
        let key = MasterKey::derive_from_password(password, &self.kdf_params)?;
        let encryptor = Encryptor::new(key.as_bytes())?;
        match encryptor.decrypt(&self.key_check) {
            Ok(plain) if plain == KEY_CHECK_PLAINTEXT => Ok(EncryptionFilter { encryptor }),
            _ => Err(Error::InvalidPassword),
        }
    }
}

/// ChaCha20-Poly1305 filter over everything stored through the repository.
pub struct EncryptionFilter {
    encryptor: Encryptor,
}

impl EncryptionFilter {
    pub fn from_key(key: &[u8]) -> Result<Self> {
        Ok(Self {
            encryptor: Encryptor::new(key)?,
        })
    }
}

impl DataFilter for EncryptionFilter {
    fn name(&self) -> &str {
        "encryption"
    }

    fn filter_write(&self, data: Vec<u8>, _toplevel: &str) -> Result<Vec<u8>> {
        self.encryptor.encrypt(&data)
    }

    fn filter_read(&self, data: Vec<u8>, _toplevel: &str) -> Result<Vec<u8>> {
        self.encryptor.decrypt(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory: 1024,
            parallelism: 1,
            ..KdfParams::default()
        }
    }

    #[test]
    fn test_encryption_roundtrip() {
        let key = MasterKey::generate();
        let encryptor = Encryptor::new(key.as_bytes()).unwrap();

        let plaintext = b"Hello, Strata!";
        let ciphertext = encryptor.encrypt(plaintext).unwrap();
        assert_ne!(&ciphertext[12..], plaintext);
        let decrypted = encryptor.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_wrong_password_is_detected() {
        let params = fast_params();
        let key = MasterKey::derive_from_password("right", &params).unwrap();
        let encryptor = Encryptor::new(key.as_bytes()).unwrap();
        let config = EncryptionConfig {
            kdf_params: params,
            key_check: encryptor.encrypt(KEY_CHECK_PLAINTEXT).unwrap(),
        };

        assert!(config.unlock("right").is_ok());
        assert!(matches!(config.unlock("wrong"), Err(Error::InvalidPassword)));
    }

    #[test]
    fn test_filter_roundtrip() {
        let filter = EncryptionFilter::from_key(MasterKey::generate().as_bytes()).unwrap();
        let stored = filter.filter_write(b"chunk".to_vec(), "chunks").unwrap();
        assert_eq!(filter.filter_read(stored, "chunks").unwrap(), b"chunk");
    }
}
