//! The envelope cryptography contract: AAD construction and ciphertext
//! framing. Pure functions, no I/O.
//!
//! Wire format of a sealed payload: `nonce(12) || encrypted body || tag(16)`,
//! produced by AES-256-GCM. The nonce is drawn fresh from the OS CSPRNG for
//! every seal.

use sha2::{Digest, Sha256};

use crate::{
    config::KeyMode,
    error::{KekError, KekResult},
};

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Build the Additional Authenticated Data binding a ciphertext to its
/// context and client identity.
///
/// The NUL separator cannot occur in X.509 name strings, so the hash is
/// injective on `(context, identifier)` pairs: `context="exchange"` with
/// `cn="key|admin"` and `context="exchange|key"` with `cn="admin"` produce
/// different digests.
pub fn build_aad(context: &str, client_ou: &str, client_cn: &str, mode: KeyMode) -> [u8; 32] {
    let identifier = match mode {
        KeyMode::Shared => client_ou,
        KeyMode::Private => client_cn,
    };
    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update([0x00]);
    hasher.update(identifier.as_bytes());
    hasher.finalize().into()
}

/// Split a framed ciphertext into its nonce and sealed body.
pub fn split_frame(ciphertext: &[u8]) -> KekResult<(&[u8], &[u8])> {
    if ciphertext.len() < NONCE_LEN {
        return Err(KekError::InvalidCiphertext);
    }
    Ok(ciphertext.split_at(NONCE_LEN))
}
