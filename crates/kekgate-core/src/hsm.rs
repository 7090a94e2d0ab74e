//! The gateway seam between the key manager and the PKCS#11 subsystem.
//!
//! `HsmGateway` is the only surface the rest of the crate talks to; the
//! hardware implementation lives in [`crate::pkcs11`], while [`SoftHsm`]
//! keeps AES-256 material in process memory for tests and development
//! deployments.

use std::{collections::HashMap, sync::Arc};

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use parking_lot::Mutex;
use rand::{RngCore, rngs::OsRng};

use crate::{
    aead::NONCE_LEN,
    error::{KekError, KekResult},
};

/// An AEAD handle bound to one HSM-resident key. Sealing appends the 16-byte
/// GCM tag to the returned ciphertext; opening expects it there.
pub trait KekCipher: Send + Sync {
    fn seal(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> KekResult<Vec<u8>>;
    fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> KekResult<Vec<u8>>;
}

/// Long-lived binding to the key store of a single token.
///
/// Implementations must be safe for concurrent AEAD use once construction
/// returns; the gateway itself does no locking around seal/open.
pub trait HsmGateway: Send + Sync {
    /// Look up a secret key by its label attribute and wrap it in an AEAD
    /// handle. `Ok(None)` means the token has no such object.
    fn find_aead(&self, label: &str) -> KekResult<Option<Arc<dyn KekCipher>>>;

    /// Create an AES-256 token key under `label` with the given unique id.
    fn generate_key(&self, label: &str, id: &[u8]) -> KekResult<()>;

    /// Remove the token object. Deleting an absent key is not an error.
    fn delete_key(&self, label: &str) -> KekResult<()>;
}

struct SoftCipher {
    cipher: Aes256Gcm,
}

impl KekCipher for SoftCipher {
    fn seal(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> KekResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(KekError::Hsm("bad nonce length".into()));
        }
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| KekError::Hsm("seal failed".into()))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> KekResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(KekError::InvalidCiphertext);
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| KekError::DecryptionFailed)
    }
}

/// Software gateway holding AES-256-GCM keys in process memory.
///
/// Key material never leaves the map once inserted; there is deliberately no
/// export surface.
#[derive(Default)]
pub struct SoftHsm {
    keys: Mutex<HashMap<String, Arc<SoftCipher>>>,
}

impl SoftHsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a key with caller-chosen material. Test hook: lets two
    /// gateway instances share a key.
    pub fn insert_key(&self, label: &str, key: &[u8; 32]) {
        let cipher = Aes256Gcm::new_from_slice(key).expect("AES-256 key length");
        self.keys
            .lock()
            .insert(label.to_owned(), Arc::new(SoftCipher { cipher }));
    }

    pub fn key_labels(&self) -> Vec<String> {
        self.keys.lock().keys().cloned().collect()
    }
}

impl HsmGateway for SoftHsm {
    fn find_aead(&self, label: &str) -> KekResult<Option<Arc<dyn KekCipher>>> {
        Ok(self
            .keys
            .lock()
            .get(label)
            .cloned()
            .map(|c| c as Arc<dyn KekCipher>))
    }

    fn generate_key(&self, label: &str, _id: &[u8]) -> KekResult<()> {
        let mut material = [0u8; 32];
        OsRng.fill_bytes(&mut material);
        self.insert_key(label, &material);
        Ok(())
    }

    fn delete_key(&self, label: &str) -> KekResult<()> {
        self.keys.lock().remove(label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_round_trips() {
        let hsm = SoftHsm::new();
        hsm.generate_key("kek-test-v1", &[1; 8]).expect("generate");
        let cipher = hsm
            .find_aead("kek-test-v1")
            .expect("lookup")
            .expect("present");

        let nonce = [9u8; NONCE_LEN];
        let sealed = cipher.seal(&nonce, b"payload", b"aad").expect("seal");
        assert_ne!(sealed, b"payload");
        let opened = cipher.open(&nonce, &sealed, b"aad").expect("open");
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let hsm = SoftHsm::new();
        hsm.generate_key("kek-test-v1", &[1; 8]).expect("generate");
        let cipher = hsm.find_aead("kek-test-v1").unwrap().unwrap();
        let nonce = [9u8; NONCE_LEN];
        let sealed = cipher.seal(&nonce, b"payload", b"aad").expect("seal");
        assert!(matches!(
            cipher.open(&nonce, &sealed, b"other"),
            Err(KekError::DecryptionFailed)
        ));
    }

    #[test]
    fn deleted_key_is_gone() {
        let hsm = SoftHsm::new();
        hsm.generate_key("kek-test-v1", &[1; 8]).expect("generate");
        hsm.delete_key("kek-test-v1").expect("delete");
        assert!(hsm.find_aead("kek-test-v1").expect("lookup").is_none());
        // deleting again is a no-op
        hsm.delete_key("kek-test-v1").expect("idempotent delete");
    }
}
