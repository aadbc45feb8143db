//! Per-buffer encryption for parallel sockets on SSL-negotiated sessions.
//!
//! Each buffer is sealed with a fresh IV and a freshly built cipher; the IV
//! travels with the ciphertext so the receiving side decrypts every message
//! independently.

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::config::{CipherConfig, EncryptionAlgorithm};
use crate::errors::{TransferFault, TransferResult};
use crate::session::NegotiatedSession;

/// AES block size, which is also the CBC IV length.
pub const AES_IV_LEN: usize = 16;

/// One encrypted frame: the IV and the ciphertext it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionBuffer {
    pub initialization_vector: Vec<u8>,
    pub encrypted_data: Vec<u8>,
}

impl EncryptionBuffer {
    /// Length of `iv || ciphertext` as written on the wire.
    pub fn wire_len(&self) -> usize {
        self.initialization_vector.len() + self.encrypted_data.len()
    }
}

pub trait ParallelCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> TransferResult<EncryptionBuffer>;

    fn decrypt(&self, buffer: &EncryptionBuffer) -> TransferResult<Vec<u8>>;

    fn iv_len(&self) -> usize;
}

/// AES-CBC with PKCS#7 padding; the key is derived with PBKDF2-HMAC-SHA1
/// from the session secret.
pub struct AesCbcCipher {
    algorithm: EncryptionAlgorithm,
    key: Vec<u8>,
}

impl AesCbcCipher {
    /// Derive a key using a random salt of `config.salt_size` bytes.
    pub fn new(shared_secret: &[u8], config: &CipherConfig) -> TransferResult<Self> {
        let mut salt = vec![0u8; config.salt_size];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(shared_secret, &salt, config)
    }

    /// Derive a key from an explicit salt, for peers that already agreed on one.
    pub fn with_salt(shared_secret: &[u8], salt: &[u8], config: &CipherConfig) -> TransferResult<Self> {
        if shared_secret.is_empty() {
            return Err(TransferFault::Cipher("empty shared secret".into()));
        }
        if config.hash_rounds == 0 {
            return Err(TransferFault::Cipher("hash rounds must be positive".into()));
        }
        if config.key_size != config.algorithm.key_size() {
            return Err(TransferFault::Cipher(format!(
                "key size {} does not match {:?}",
                config.key_size, config.algorithm
            )));
        }

        let mut key = vec![0u8; config.key_size];
        pbkdf2::pbkdf2_hmac::<Sha1>(shared_secret, salt, config.hash_rounds, &mut key);
        Ok(Self {
            algorithm: config.algorithm,
            key,
        })
    }

    fn seal(&self, iv: &[u8], plain: &[u8]) -> TransferResult<Vec<u8>> {
        let sealed = match self.algorithm {
            EncryptionAlgorithm::Aes256Cbc => cbc::Encryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                .map_err(|_| invalid_length())?
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            EncryptionAlgorithm::Aes192Cbc => cbc::Encryptor::<aes::Aes192>::new_from_slices(&self.key, iv)
                .map_err(|_| invalid_length())?
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            EncryptionAlgorithm::Aes128Cbc => cbc::Encryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                .map_err(|_| invalid_length())?
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
        };
        Ok(sealed)
    }

    fn open(&self, iv: &[u8], sealed: &[u8]) -> TransferResult<Vec<u8>> {
        let opened = match self.algorithm {
            EncryptionAlgorithm::Aes256Cbc => cbc::Decryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                .map_err(|_| invalid_length())?
                .decrypt_padded_vec_mut::<Pkcs7>(sealed),
            EncryptionAlgorithm::Aes192Cbc => cbc::Decryptor::<aes::Aes192>::new_from_slices(&self.key, iv)
                .map_err(|_| invalid_length())?
                .decrypt_padded_vec_mut::<Pkcs7>(sealed),
            EncryptionAlgorithm::Aes128Cbc => cbc::Decryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                .map_err(|_| invalid_length())?
                .decrypt_padded_vec_mut::<Pkcs7>(sealed),
        };
        opened.map_err(|_| TransferFault::Cipher("invalid padding in decrypted buffer".into()))
    }
}

impl ParallelCipher for AesCbcCipher {
    fn encrypt(&self, plain: &[u8]) -> TransferResult<EncryptionBuffer> {
        let mut iv = vec![0u8; AES_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let encrypted_data = self.seal(&iv, plain)?;
        Ok(EncryptionBuffer {
            initialization_vector: iv,
            encrypted_data,
        })
    }

    fn decrypt(&self, buffer: &EncryptionBuffer) -> TransferResult<Vec<u8>> {
        if buffer.initialization_vector.len() != AES_IV_LEN {
            return Err(TransferFault::Cipher(format!(
                "initialization vector must be {} bytes, got {}",
                AES_IV_LEN,
                buffer.initialization_vector.len()
            )));
        }
        self.open(&buffer.initialization_vector, &buffer.encrypted_data)
    }

    fn iv_len(&self) -> usize {
        AES_IV_LEN
    }
}

fn invalid_length() -> TransferFault {
    TransferFault::Cipher("invalid key or IV length".into())
}

/// Build the cipher for a session. Calling this on a session that did not
/// negotiate SSL is a programming error and fails immediately.
pub fn cipher_for_session(session: &NegotiatedSession) -> TransferResult<Box<dyn ParallelCipher>> {
    if !session.ssl_negotiated {
        log::error!("should not be trying to encrypt, session is not ssl configured");
        return Err(TransferFault::Configuration(
            "attempt to encrypt a transfer when SSL not configured".into(),
        ));
    }
    log::debug!("initializing {:?} cipher for parallel transfer", session.cipher.algorithm);
    Ok(Box::new(AesCbcCipher::new(&session.shared_secret, &session.cipher)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesCbcCipher {
        AesCbcCipher::new(b"negotiated-secret", &CipherConfig::default()).unwrap()
    }

    #[test]
    fn round_trips_payload_sizes() {
        let cipher = cipher();
        for len in [0usize, 1, 4096, 10 * 1024 * 1024] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = cipher.encrypt(&plain).unwrap();
            assert_eq!(sealed.initialization_vector.len(), AES_IV_LEN);
            assert!(sealed.encrypted_data.len() > plain.len());
            assert_eq!(cipher.decrypt(&sealed).unwrap(), plain, "length {len}");
        }
    }

    #[test]
    fn every_buffer_gets_its_own_iv() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same bytes").unwrap();
        let b = cipher.encrypt(b"same bytes").unwrap();
        assert_ne!(a.initialization_vector, b.initialization_vector);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[test]
    fn decrypt_uses_the_accompanying_iv() {
        let cipher = cipher();
        let first = cipher.encrypt(b"first message").unwrap();
        let second = cipher.encrypt(b"second message").unwrap();
        assert_eq!(cipher.decrypt(&second).unwrap(), b"second message");
        assert_eq!(cipher.decrypt(&first).unwrap(), b"first message");

        let swapped = EncryptionBuffer {
            initialization_vector: second.initialization_vector.clone(),
            encrypted_data: first.encrypted_data.clone(),
        };
        assert_ne!(cipher.decrypt(&swapped).ok().as_deref(), Some(&b"first message"[..]));
    }

    #[test]
    fn same_salt_derives_same_key() {
        let config = CipherConfig::default();
        let sender = AesCbcCipher::with_salt(b"secret", b"12345678", &config).unwrap();
        let receiver = AesCbcCipher::with_salt(b"secret", b"12345678", &config).unwrap();
        let sealed = sender.encrypt(b"payload").unwrap();
        assert_eq!(receiver.decrypt(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn aes128_round_trip() {
        let config = CipherConfig {
            algorithm: EncryptionAlgorithm::Aes128Cbc,
            key_size: 16,
            ..CipherConfig::default()
        };
        let cipher = AesCbcCipher::new(b"secret", &config).unwrap();
        let sealed = cipher.encrypt(b"short").unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"short");
    }

    #[test]
    fn rejects_short_iv() {
        let cipher = cipher();
        let buffer = EncryptionBuffer {
            initialization_vector: vec![0u8; 4],
            encrypted_data: vec![0u8; 16],
        };
        assert!(matches!(cipher.decrypt(&buffer), Err(TransferFault::Cipher(_))));
    }

    #[test]
    fn plain_session_cannot_build_cipher() {
        let session = NegotiatedSession::plain("localhost", 1247, 2, 77);
        assert!(matches!(
            cipher_for_session(&session),
            Err(TransferFault::Configuration(_))
        ));
    }

    #[test]
    fn ssl_session_builds_cipher() {
        let session = NegotiatedSession::plain("localhost", 1247, 2, 77)
            .with_encryption(b"secret".to_vec(), CipherConfig::default());
        let cipher = cipher_for_session(&session).unwrap();
        assert_eq!(cipher.iv_len(), AES_IV_LEN);
    }
}
