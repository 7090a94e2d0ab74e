//! Authorization of verified mTLS peers: OU to context allow-lists plus a
//! hot-reloaded revocation set.
//!
//! Denials never echo user-controlled fields. A failed revocation reload
//! keeps the previously validated set; deleting the revocation file clears
//! the set, which supports a remove-and-replace authoring workflow.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    config::AclConfig,
    error::{KekError, KekResult},
    reload::ReloadHandle,
};

/// Identity extracted from a verified peer certificate by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub common_name: String,
    pub organizational_units: Vec<String>,
}

impl PeerIdentity {
    pub fn new(common_name: impl Into<String>, ous: impl IntoIterator<Item = String>) -> Self {
        Self {
            common_name: common_name.into(),
            organizational_units: ous.into_iter().collect(),
        }
    }

    pub fn primary_ou(&self) -> Option<&str> {
        self.organizational_units.first().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct RevokedDoc {
    #[serde(default)]
    revoked: Vec<RevokedEntry>,
}

#[derive(Debug, Deserialize)]
struct RevokedEntry {
    #[serde(default)]
    cn: String,
    #[allow(dead_code)]
    #[serde(default)]
    serial: String,
    #[allow(dead_code)]
    #[serde(default)]
    reason: String,
    #[allow(dead_code)]
    #[serde(default)]
    date: String,
}

pub struct AccessPolicy {
    mappings: HashMap<String, HashSet<String>>,
    revoked_file: PathBuf,
    revoked: RwLock<Arc<HashSet<String>>>,
    last_mod_time: Mutex<Option<SystemTime>>,
}

impl AccessPolicy {
    /// Build the policy and perform the initial revocation load. A missing
    /// file starts with an empty set; a malformed file is a startup error.
    pub fn new(config: &AclConfig) -> KekResult<Self> {
        let mappings = config
            .mappings
            .iter()
            .map(|(ou, contexts)| (ou.clone(), contexts.iter().cloned().collect()))
            .collect();
        let policy = Self {
            mappings,
            revoked_file: config.revoked_file.clone(),
            revoked: RwLock::new(Arc::new(HashSet::new())),
            last_mod_time: Mutex::new(None),
        };

        match std::fs::read_to_string(&policy.revoked_file) {
            Ok(contents) => {
                let revoked = parse_revoked(&contents)?;
                info!(count = revoked.len(), "loaded revocation list");
                *policy.revoked.write() = Arc::new(revoked);
                if let Ok(meta) = std::fs::metadata(&policy.revoked_file) {
                    *policy.last_mod_time.lock() = meta.modified().ok();
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %policy.revoked_file.display(), "no revocation file, starting empty");
            }
            Err(err) => return Err(KekError::metadata_io(err)),
        }
        Ok(policy)
    }

    /// Authorize `peer` for `context`.
    pub fn check_access(&self, peer: &PeerIdentity, context: &str) -> KekResult<()> {
        if self.revoked.read().contains(&peer.common_name) {
            return Err(KekError::CertificateRevoked);
        }
        let Some(ou) = peer.primary_ou() else {
            return Err(KekError::MissingOu);
        };
        let Some(allowed) = self.mappings.get(ou) else {
            return Err(KekError::UnknownOu);
        };
        if !allowed.contains(context) {
            return Err(KekError::ContextNotAllowed);
        }
        Ok(())
    }

    pub fn is_revoked(&self, common_name: &str) -> bool {
        self.revoked.read().contains(common_name)
    }

    /// Reload the revocation file if its mtime advanced. Validation failures
    /// leave the previous set untouched; a vanished file clears the set.
    pub fn try_reload(&self) -> KekResult<bool> {
        let modified = match std::fs::metadata(&self.revoked_file) {
            Ok(meta) => meta.modified().map_err(KekError::metadata_io)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut last = self.last_mod_time.lock();
                let had_entries = !self.revoked.read().is_empty();
                if last.is_some() || had_entries {
                    *self.revoked.write() = Arc::new(HashSet::new());
                    *last = None;
                    info!("revocation file deleted, cleared revocation list");
                }
                return Ok(false);
            }
            Err(err) => return Err(KekError::metadata_io(err)),
        };

        {
            let mut last = self.last_mod_time.lock();
            if matches!(*last, Some(prev) if modified <= prev) {
                return Ok(false);
            }
            *last = Some(modified);
        }

        let contents = std::fs::read_to_string(&self.revoked_file).map_err(KekError::metadata_io)?;
        let revoked = parse_revoked(&contents)?;
        let count = revoked.len();
        *self.revoked.write() = Arc::new(revoked);
        info!(count, "revocation list reloaded");
        Ok(true)
    }

    /// Start the periodic reload task. Errors are logged and swallowed.
    pub fn spawn_reload(self: &Arc<Self>, interval: Duration) -> ReloadHandle {
        let policy = Arc::clone(self);
        ReloadHandle::spawn("revocation", interval, move || {
            if let Err(err) = policy.try_reload() {
                warn!(error = %err, "revocation reload failed, keeping previous set");
            }
        })
    }
}

/// Parse and validate a revocation document: every entry needs a non-empty
/// CN and duplicates are rejected.
fn parse_revoked(contents: &str) -> KekResult<HashSet<String>> {
    let doc: RevokedDoc = serde_yaml::from_str(contents).map_err(KekError::invalid_config)?;
    let mut revoked = HashSet::with_capacity(doc.revoked.len());
    for (index, entry) in doc.revoked.iter().enumerate() {
        if entry.cn.is_empty() {
            return Err(KekError::invalid_config(format!(
                "revoked entry {index} has an empty cn"
            )));
        }
        if !revoked.insert(entry.cn.clone()) {
            return Err(KekError::invalid_config(format!(
                "revoked entry {index} duplicates an earlier cn"
            )));
        }
    }
    Ok(revoked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn acl_config(dir: &TempDir) -> AclConfig {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "Trading".to_string(),
            vec!["exchange-key".to_string(), "2fa".to_string()],
        );
        mappings.insert("Support".to_string(), vec!["2fa".to_string()]);
        AclConfig {
            revoked_file: dir.path().join("revoked.yaml"),
            mappings,
        }
    }

    fn peer(cn: &str, ous: &[&str]) -> PeerIdentity {
        PeerIdentity::new(cn, ous.iter().map(|s| s.to_string()))
    }

    #[test]
    fn allows_mapped_context_and_denies_everything_else() {
        let dir = TempDir::new().expect("tempdir");
        let policy = AccessPolicy::new(&acl_config(&dir)).expect("policy");

        policy
            .check_access(&peer("trader-1", &["Trading"]), "exchange-key")
            .expect("allowed");
        assert!(matches!(
            policy.check_access(&peer("trader-1", &["Trading"]), "payroll"),
            Err(KekError::ContextNotAllowed)
        ));
        assert!(matches!(
            policy.check_access(&peer("trader-1", &["Facilities"]), "exchange-key"),
            Err(KekError::UnknownOu)
        ));
        assert!(matches!(
            policy.check_access(&peer("trader-1", &[]), "exchange-key"),
            Err(KekError::MissingOu)
        ));
    }

    #[test]
    fn only_the_first_ou_is_consulted() {
        let dir = TempDir::new().expect("tempdir");
        let policy = AccessPolicy::new(&acl_config(&dir)).expect("policy");
        assert!(matches!(
            policy.check_access(&peer("x", &["Support", "Trading"]), "exchange-key"),
            Err(KekError::ContextNotAllowed)
        ));
    }

    #[test]
    fn revoked_cn_is_denied_before_ou_checks() {
        let dir = TempDir::new().expect("tempdir");
        let config = acl_config(&dir);
        std::fs::write(&config.revoked_file, "revoked:\n  - cn: trader-bad\n").unwrap();
        let policy = AccessPolicy::new(&config).expect("policy");

        assert!(policy.is_revoked("trader-bad"));
        assert!(matches!(
            policy.check_access(&peer("trader-bad", &["Trading"]), "exchange-key"),
            Err(KekError::CertificateRevoked)
        ));
    }

    #[test]
    fn reload_picks_up_new_revocations() {
        let dir = TempDir::new().expect("tempdir");
        let config = acl_config(&dir);
        let policy = AccessPolicy::new(&config).expect("policy");
        policy
            .check_access(&peer("trader-bad", &["Trading"]), "exchange-key")
            .expect("authorized before revocation");

        std::fs::write(&config.revoked_file, "revoked:\n  - cn: trader-bad\n").unwrap();
        assert!(policy.try_reload().expect("reload"));
        assert!(matches!(
            policy.check_access(&peer("trader-bad", &["Trading"]), "exchange-key"),
            Err(KekError::CertificateRevoked)
        ));
    }

    #[test]
    fn invalid_reload_keeps_previous_set() {
        let dir = TempDir::new().expect("tempdir");
        let config = acl_config(&dir);
        std::fs::write(&config.revoked_file, "revoked:\n  - cn: trader-bad\n").unwrap();
        let policy = AccessPolicy::new(&config).expect("policy");

        // duplicate CN fails validation; the set must be unchanged
        std::fs::write(
            &config.revoked_file,
            "revoked:\n  - cn: other\n  - cn: other\n",
        )
        .unwrap();
        bump_mtime(&config.revoked_file);
        assert!(policy.try_reload().is_err());
        assert!(policy.is_revoked("trader-bad"));
        assert!(!policy.is_revoked("other"));

        // empty CN is rejected the same way
        std::fs::write(&config.revoked_file, "revoked:\n  - serial: '42'\n").unwrap();
        bump_mtime(&config.revoked_file);
        assert!(policy.try_reload().is_err());
        assert!(policy.is_revoked("trader-bad"));
    }

    #[test]
    fn deleting_the_file_clears_the_set() {
        let dir = TempDir::new().expect("tempdir");
        let config = acl_config(&dir);
        std::fs::write(&config.revoked_file, "revoked:\n  - cn: trader-bad\n").unwrap();
        let policy = AccessPolicy::new(&config).expect("policy");
        assert!(policy.is_revoked("trader-bad"));

        std::fs::remove_file(&config.revoked_file).unwrap();
        policy.try_reload().expect("reload after delete");
        assert!(!policy.is_revoked("trader-bad"));

        // re-authoring the file takes effect on the next reload
        std::fs::write(&config.revoked_file, "revoked:\n  - cn: trader-worse\n").unwrap();
        assert!(policy.try_reload().expect("reload"));
        assert!(policy.is_revoked("trader-worse"));
    }

    fn bump_mtime(path: &std::path::Path) {
        // Coarse mtime clocks can make two consecutive writes look identical.
        let contents = std::fs::read(path).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(path, contents).unwrap();
    }
}
