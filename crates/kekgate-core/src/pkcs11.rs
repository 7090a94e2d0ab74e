//! PKCS#11 gateway.
//!
//! Holds one read-write session against the token whose label matches the
//! configured slot id. The session is opened and logged in once at startup
//! and reused for the lifetime of the process; PKCS#11 errors are surfaced
//! as [`KekError::Hsm`] and the session is never re-established (a dead
//! session is fatal, by lifecycle design the process restarts).

use std::sync::Arc;

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    mechanism::{Mechanism, aead::GcmParams},
    object::{Attribute, KeyType, ObjectClass, ObjectHandle},
    session::{Session, UserType},
    types::AuthPin,
};
use tracing::info;

use crate::{
    aead::TAG_LEN,
    error::{KekError, KekResult},
    hsm::{HsmGateway, KekCipher},
};

pub struct Pkcs11Gateway {
    // Kept alive so the library is not finalized while sessions exist.
    _context: Pkcs11,
    session: Arc<Session>,
}

impl Pkcs11Gateway {
    /// Initialise the PKCS#11 library, select the slot whose token label
    /// matches `token_label`, open a read-write session and log in.
    pub fn open(lib_path: &str, token_label: &str, pin: &str) -> KekResult<Self> {
        let context = Pkcs11::new(lib_path).map_err(KekError::hsm)?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(KekError::hsm)?;

        let slot = context
            .get_slots_with_token()
            .map_err(KekError::hsm)?
            .into_iter()
            .find(|slot| {
                context
                    .get_token_info(*slot)
                    .map(|token| token.label().trim_end() == token_label)
                    .unwrap_or(false)
            })
            .ok_or_else(|| KekError::Hsm(format!("no token labelled '{token_label}' found")))?;

        let session = context.open_rw_session(slot).map_err(KekError::hsm)?;
        session
            .login(UserType::User, Some(&AuthPin::new(pin.to_owned())))
            .map_err(KekError::hsm)?;
        info!(token = token_label, "PKCS#11 session established");

        Ok(Self {
            _context: context,
            session: Arc::new(session),
        })
    }

    fn find_handle(&self, label: &str) -> KekResult<Option<ObjectHandle>> {
        let template = [
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::Label(label.as_bytes().to_vec()),
        ];
        let handles = self.session.find_objects(&template).map_err(KekError::hsm)?;
        Ok(handles.first().copied())
    }
}

impl HsmGateway for Pkcs11Gateway {
    fn find_aead(&self, label: &str) -> KekResult<Option<Arc<dyn KekCipher>>> {
        Ok(self.find_handle(label)?.map(|handle| {
            Arc::new(Pkcs11Aead {
                session: Arc::clone(&self.session),
                handle,
            }) as Arc<dyn KekCipher>
        }))
    }

    fn generate_key(&self, label: &str, id: &[u8]) -> KekResult<()> {
        let template = [
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::AES),
            Attribute::ValueLen(32.into()),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Id(id.to_vec()),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Encrypt(true),
            Attribute::Decrypt(true),
            Attribute::Wrap(true),
            Attribute::Unwrap(true),
            Attribute::Extractable(false),
        ];
        self.session
            .generate_key(&Mechanism::AesKeyGen, &template)
            .map_err(KekError::hsm)?;
        info!(label, "generated AES-256 KEK on token");
        Ok(())
    }

    fn delete_key(&self, label: &str) -> KekResult<()> {
        match self.find_handle(label)? {
            Some(handle) => {
                self.session.destroy_object(handle).map_err(KekError::hsm)?;
                info!(label, "destroyed KEK on token");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// AEAD handle delegating seal/open to the token via CKM_AES_GCM.
struct Pkcs11Aead {
    session: Arc<Session>,
    handle: ObjectHandle,
}

impl KekCipher for Pkcs11Aead {
    fn seal(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> KekResult<Vec<u8>> {
        let mut iv = nonce.to_vec();
        let params = GcmParams::new(&mut iv, aad, ((TAG_LEN * 8) as u64).into());
        self.session
            .encrypt(&Mechanism::AesGcm(params), self.handle, plaintext)
            .map_err(KekError::hsm)
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> KekResult<Vec<u8>> {
        let mut iv = nonce.to_vec();
        let params = GcmParams::new(&mut iv, aad, ((TAG_LEN * 8) as u64).into());
        self.session
            .decrypt(&Mechanism::AesGcm(params), self.handle, ciphertext)
            .map_err(|_| KekError::DecryptionFailed)
    }
}
