use thiserror::Error;

pub type KekResult<T> = Result<T, KekError>;

/// Error surface of the envelope-encryption core.
///
/// Policy and crypto variants keep their display text free of any
/// caller-supplied field so the transport can forward them verbatim.
#[derive(Debug, Error)]
pub enum KekError {
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("payload too large")]
    PayloadTooLarge,

    #[error("certificate revoked")]
    CertificateRevoked,
    #[error("certificate has no organizational unit")]
    MissingOu,
    #[error("access denied: unknown organizational unit")]
    UnknownOu,
    #[error("access denied: insufficient permissions")]
    ContextNotAllowed,

    #[error("no key configured for context")]
    NoKeyForContext,
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("metadata entry missing for context: {0}")]
    ConfigMismatch(String),
    #[error("current KEK not loaded: {0}")]
    CurrentMissing(String),
    #[error("no AES keys loaded from configuration")]
    NoKeysConfigured,
    #[error("KEK integrity verification failed for {0}: checksum mismatch")]
    IntegrityViolation(String),
    #[error("invalid key label format: {0} (expected name-v1)")]
    InvalidLabel(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HSM error: {0}")]
    Hsm(String),
    #[error("metadata I/O error: {0}")]
    MetadataIo(String),
    #[error("lock error: {0}")]
    Lock(String),
}

impl KekError {
    pub fn hsm<E: std::fmt::Display>(err: E) -> Self {
        Self::Hsm(err.to_string())
    }

    pub fn metadata_io<E: std::fmt::Display>(err: E) -> Self {
        Self::MetadataIo(err.to_string())
    }

    pub fn lock<E: std::fmt::Display>(err: E) -> Self {
        Self::Lock(err.to_string())
    }

    pub fn invalid_config<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
