//! kekgate core: KEK lifecycle management and the envelope-encryption
//! dataplane backed by a PKCS#11 HSM. The transport front-end and the admin
//! CLI interact exclusively with this crate.

pub mod acl;
pub mod aead;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod hsm;
pub mod manager;
pub mod metadata;
pub mod pkcs11;
pub mod reload;
pub mod rotation;

pub use acl::{AccessPolicy, PeerIdentity};
pub use aead::{NONCE_LEN, TAG_LEN, build_aad, split_frame};
pub use config::{
    AclConfig, HsmSettings, KeyConfig, KeyKind, KeyMode, RateLimitConfig, ServiceConfig,
};
pub use dataplane::{Dataplane, MAX_PAYLOAD_BYTES, SealedPayload};
pub use error::{KekError, KekResult};
pub use hsm::{HsmGateway, KekCipher, SoftHsm};
pub use manager::{KeyManager, LoadedKey};
pub use metadata::{KeyEntry, KeyVersion, Metadata, MetadataStore, label_checksum};
pub use pkcs11::Pkcs11Gateway;
pub use reload::ReloadHandle;
pub use rotation::{
    CleanupOptions, CleanupReport, RotationEngine, RotationOutcome, RotationStatus,
};
