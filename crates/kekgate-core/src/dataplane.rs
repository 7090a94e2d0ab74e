//! Transport-facing adapter for the AEAD dataplane.
//!
//! Resolves policy, decodes payloads, delegates to the key manager, and
//! records metrics. Plaintext buffers are zeroed on every exit path; the
//! shim owns no policy of its own.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::{
    acl::{AccessPolicy, PeerIdentity},
    error::{KekError, KekResult},
    manager::KeyManager,
};

/// Ceiling on the decoded payload size.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SealedPayload {
    /// Base64-encoded `nonce || body || tag` frame.
    pub ciphertext: String,
    /// Label the payload was sealed under; clients echo it back to decrypt.
    pub key_label: String,
}

pub struct Dataplane {
    manager: Arc<KeyManager>,
    policy: Arc<AccessPolicy>,
}

impl Dataplane {
    pub fn new(manager: Arc<KeyManager>, policy: Arc<AccessPolicy>) -> Self {
        Self { manager, policy }
    }

    pub fn manager(&self) -> &KeyManager {
        &self.manager
    }

    pub fn encrypt(
        &self,
        peer: &PeerIdentity,
        context: &str,
        plaintext_b64: &str,
    ) -> KekResult<SealedPayload> {
        let request_id = Uuid::new_v4();
        self.policy.check_access(peer, context).inspect_err(|err| {
            warn!(%request_id, error = %err, "encrypt denied");
            metrics::counter!("kekgate_access_denied_total").increment(1);
        })?;

        let mut plaintext = decode_payload(plaintext_b64)?;
        let result = self.manager.encrypt(
            &plaintext,
            context,
            peer.primary_ou().unwrap_or_default(),
            &peer.common_name,
        );
        plaintext.zeroize();

        match result {
            Ok((ciphertext, key_label)) => {
                metrics::counter!("kekgate_encrypt_total").increment(1);
                debug!(%request_id, label = %key_label, "payload sealed");
                Ok(SealedPayload {
                    ciphertext: B64.encode(ciphertext),
                    key_label,
                })
            }
            Err(err) => {
                metrics::counter!("kekgate_encrypt_failed_total").increment(1);
                warn!(%request_id, error = %err, "encrypt failed");
                Err(err)
            }
        }
    }

    pub fn decrypt(
        &self,
        peer: &PeerIdentity,
        context: &str,
        ciphertext_b64: &str,
        key_label: &str,
    ) -> KekResult<String> {
        let request_id = Uuid::new_v4();
        self.policy.check_access(peer, context).inspect_err(|err| {
            warn!(%request_id, error = %err, "decrypt denied");
            metrics::counter!("kekgate_access_denied_total").increment(1);
        })?;

        let ciphertext = decode_payload(ciphertext_b64)?;
        let result = self.manager.decrypt(
            &ciphertext,
            context,
            peer.primary_ou().unwrap_or_default(),
            &peer.common_name,
            key_label,
        );

        match result {
            Ok(mut plaintext) => {
                metrics::counter!("kekgate_decrypt_total").increment(1);
                debug!(%request_id, label = %key_label, "payload opened");
                let encoded = B64.encode(&plaintext);
                plaintext.zeroize();
                Ok(encoded)
            }
            Err(err) => {
                metrics::counter!("kekgate_decrypt_failed_total").increment(1);
                warn!(%request_id, error = %err, "decrypt failed");
                Err(err)
            }
        }
    }
}

fn decode_payload(encoded: &str) -> KekResult<Vec<u8>> {
    let mut decoded = B64.decode(encoded).map_err(|_| KekError::InvalidBase64)?;
    if decoded.len() > MAX_PAYLOAD_BYTES {
        decoded.zeroize();
        return Err(KekError::PayloadTooLarge);
    }
    Ok(decoded)
}
