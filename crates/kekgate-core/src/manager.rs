//! The key manager: owns the live map of loaded KEK ciphers, the
//! context-to-current-label map, and per-label metadata, and publishes the
//! AEAD dataplane.
//!
//! All maps are replaced together: loads build a fresh [`KeyState`] off to
//! the side and swap it in behind the writer lock, so readers either see the
//! old snapshot or the new one, never a mix. AEAD handles captured by a
//! reader before the swap stay valid until the reader drops them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration as StdDuration, SystemTime},
};

use parking_lot::{Mutex, RwLock};
use rand::{RngCore, rngs::OsRng};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::{
    aead::{NONCE_LEN, build_aad, split_frame},
    config::{HsmSettings, KeyConfig, KeyKind, KeyMode},
    error::{KekError, KekResult},
    hsm::{HsmGateway, KekCipher},
    metadata::{Metadata, MetadataStore, label_checksum},
    reload::ReloadHandle,
};

/// One loaded KEK version.
pub struct LoadedKey {
    cipher: Arc<dyn KekCipher>,
    pub version: u32,
    pub created_at: OffsetDateTime,
    pub rotation_interval: Duration,
    pub mode: KeyMode,
}

impl LoadedKey {
    pub fn needs_rotation(&self, now: OffsetDateTime) -> bool {
        !self.rotation_interval.is_zero() && now > self.created_at + self.rotation_interval
    }
}

#[derive(Default)]
struct KeyState {
    keys: HashMap<String, Arc<LoadedKey>>,
    context_to_label: HashMap<String, String>,
}

pub struct KeyManager {
    gateway: Arc<dyn HsmGateway>,
    store: MetadataStore,
    contexts: BTreeMap<String, KeyConfig>,
    state: RwLock<Arc<KeyState>>,
    last_mod_time: Mutex<Option<SystemTime>>,
}

impl KeyManager {
    /// Load every active and overlap version named by the metadata document.
    /// Startup failures are fatal to the caller.
    pub fn new(gateway: Arc<dyn HsmGateway>, settings: &HsmSettings) -> KekResult<Self> {
        let manager = Self {
            gateway,
            store: MetadataStore::new(&settings.metadata_file),
            contexts: settings.keys.clone(),
            state: RwLock::new(Arc::new(KeyState::default())),
            last_mod_time: Mutex::new(None),
        };
        let metadata = manager.store.load()?;
        let state = manager.build_state(&metadata)?;
        *manager.state.write() = Arc::new(state);
        if let Ok(modified) = manager.store.modified() {
            *manager.last_mod_time.lock() = Some(modified);
        }

        let due = manager.keys_needing_rotation();
        if !due.is_empty() {
            warn!(labels = ?due, "KEKs are past their rotation interval");
        }
        Ok(manager)
    }

    /// Build the in-memory view for a metadata document without touching the
    /// published state. Any error leaves the previously loaded maps intact.
    fn build_state(&self, metadata: &Metadata) -> KekResult<KeyState> {
        let now = OffsetDateTime::now_utc();
        let mut keys: HashMap<String, Arc<LoadedKey>> = HashMap::new();
        let mut context_to_label = HashMap::new();

        for (context, key_config) in &self.contexts {
            if key_config.kind != KeyKind::Aes {
                continue;
            }
            let entry = metadata
                .rotation
                .get(context)
                .ok_or_else(|| KekError::ConfigMismatch(context.clone()))?;
            context_to_label.insert(context.clone(), entry.current.clone());

            for version in &entry.versions {
                let cipher = match self.gateway.find_aead(&version.label) {
                    Ok(Some(cipher)) => cipher,
                    Ok(None) => {
                        warn!(label = %version.label, "KEK not found in token, skipping version");
                        continue;
                    }
                    Err(err) => {
                        warn!(label = %version.label, error = %err, "KEK lookup failed, skipping version");
                        continue;
                    }
                };

                match version.checksum.as_deref() {
                    Some(expected) if !expected.is_empty() => {
                        let computed = label_checksum(&version.label);
                        if computed != expected {
                            return Err(KekError::IntegrityViolation(version.label.clone()));
                        }
                    }
                    _ => {
                        warn!(label = %version.label, "no checksum recorded, run update-checksums");
                    }
                }

                let created_at = match version.created_at {
                    Some(at) => at,
                    None => {
                        warn!(label = %version.label, "version has no creation timestamp, assuming now");
                        now
                    }
                };

                keys.insert(
                    version.label.clone(),
                    Arc::new(LoadedKey {
                        cipher,
                        version: version.version,
                        created_at,
                        rotation_interval: Duration::days(i64::from(
                            entry.rotation_interval_days,
                        )),
                        mode: key_config.mode,
                    }),
                );
                info!(label = %version.label, version = version.version, "loaded KEK");
            }

            if !keys.contains_key(&entry.current) {
                return Err(KekError::CurrentMissing(entry.current.clone()));
            }
        }

        if keys.is_empty() {
            return Err(KekError::NoKeysConfigured);
        }
        Ok(KeyState {
            keys,
            context_to_label,
        })
    }

    /// Reload the metadata document if its mtime advanced since the last
    /// successful or attempted load. Returns whether a reload happened.
    pub fn try_reload(&self) -> KekResult<bool> {
        let modified = match self.store.modified() {
            Ok(modified) => modified,
            Err(_) => {
                warn!(path = %self.store.path().display(), "metadata file not found");
                return Ok(false);
            }
        };
        {
            let mut last = self.last_mod_time.lock();
            if matches!(*last, Some(prev) if modified <= prev) {
                return Ok(false);
            }
            *last = Some(modified);
        }

        info!(path = %self.store.path().display(), "metadata file changed");
        let metadata = self.store.load()?;
        let state = self.build_state(&metadata)?;
        let contexts = state.context_to_label.len();
        let total_keys = state.keys.len();
        *self.state.write() = Arc::new(state);
        info!(contexts, total_keys, "KEK hot reload complete");
        Ok(true)
    }

    /// Start the periodic reload task. Load errors are logged and swallowed;
    /// the previous state stays in effect.
    pub fn spawn_reload(self: &Arc<Self>, interval: StdDuration) -> ReloadHandle {
        let manager = Arc::clone(self);
        ReloadHandle::spawn("metadata", interval, move || {
            if let Err(err) = manager.try_reload() {
                warn!(error = %err, "metadata reload failed, keeping previous key set");
            }
        })
    }

    /// Seal `plaintext` under the current KEK of `context`. Returns the
    /// framed ciphertext `nonce || body || tag` and the label it was sealed
    /// under, which the client must echo back to decrypt.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        context: &str,
        client_ou: &str,
        client_cn: &str,
    ) -> KekResult<(Vec<u8>, String)> {
        let state = Arc::clone(&self.state.read());
        let label = state
            .context_to_label
            .get(context)
            .ok_or(KekError::NoKeyForContext)?;
        let key = state
            .keys
            .get(label)
            .ok_or_else(|| KekError::KeyNotFound(label.clone()))?;

        let aad = build_aad(context, client_ou, client_cn, key.mode);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = key.cipher.seal(&nonce, plaintext, &aad)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&sealed);
        Ok((framed, label.clone()))
    }

    /// Open a framed ciphertext under the named label. The caller supplies
    /// the label, which permits decrypting with a retired but still-loaded
    /// overlap version.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        context: &str,
        client_ou: &str,
        client_cn: &str,
        label: &str,
    ) -> KekResult<Vec<u8>> {
        let state = Arc::clone(&self.state.read());
        let key = state
            .keys
            .get(label)
            .ok_or_else(|| KekError::KeyNotFound(label.to_owned()))?;

        let (nonce, body) = split_frame(ciphertext)?;
        let aad = build_aad(context, client_ou, client_cn, key.mode);
        key.cipher.open(nonce, body, &aad)
    }

    /// Labels whose rotation interval has elapsed. Report-only; consumed by
    /// the admin CLI and by startup warnings.
    pub fn keys_needing_rotation(&self) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        let state = self.state.read();
        let mut due: Vec<String> = state
            .keys
            .iter()
            .filter(|(_, key)| key.needs_rotation(now))
            .map(|(label, _)| label.clone())
            .collect();
        due.sort_unstable();
        due
    }

    pub fn key_labels(&self) -> Vec<String> {
        let state = self.state.read();
        let mut labels: Vec<String> = state.keys.keys().cloned().collect();
        labels.sort_unstable();
        labels
    }

    pub fn has_key(&self, label: &str) -> bool {
        self.state.read().keys.contains_key(label)
    }

    pub fn label_for_context(&self, context: &str) -> KekResult<String> {
        self.state
            .read()
            .context_to_label
            .get(context)
            .cloned()
            .ok_or(KekError::NoKeyForContext)
    }
}
