//! Durable journal of per-context rotation state.
//!
//! The document is YAML mapping context names to their ordered version
//! lists. Writes go through a timestamped backup followed by
//! truncate-write-fsync; rotation and cleanup serialize on an advisory
//! exclusive lock held on a sidecar `<path>.lock` file. Hot-reload readers
//! never take the lock.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use tracing::{info, warn};

use crate::error::{KekError, KekResult};

/// Integrity marker stored next to each version record. Detects label
/// substitution in the document; it proves nothing about the HSM object
/// itself.
pub fn label_checksum(label: &str) -> String {
    hex::encode(Sha256::digest(label.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    pub label: String,
    pub version: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub current: String,
    #[serde(default)]
    pub rotation_interval_days: u32,
    pub versions: Vec<KeyVersion>,
}

impl KeyEntry {
    pub fn find(&self, label: &str) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.label == label)
    }

    pub fn current_version(&self) -> Option<&KeyVersion> {
        self.find(&self.current)
    }

    pub fn highest_version(&self) -> u32 {
        self.versions.iter().map(|v| v.version).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub rotation: BTreeMap<String, KeyEntry>,
}

impl Metadata {
    /// Schema validation: versions strictly increasing, labels unique within
    /// a context, `current` present in the version list.
    pub fn validate(&self) -> KekResult<()> {
        for (context, entry) in &self.rotation {
            if entry.versions.is_empty() {
                return Err(KekError::invalid_config(format!(
                    "context {context} has no versions"
                )));
            }
            for pair in entry.versions.windows(2) {
                if pair[1].version <= pair[0].version {
                    return Err(KekError::invalid_config(format!(
                        "context {context}: versions are not strictly increasing at {}",
                        pair[1].label
                    )));
                }
            }
            let mut labels: Vec<&str> = entry.versions.iter().map(|v| v.label.as_str()).collect();
            labels.sort_unstable();
            if labels.windows(2).any(|w| w[0] == w[1]) {
                return Err(KekError::invalid_config(format!(
                    "context {context} has duplicate version labels"
                )));
            }
            if entry.current_version().is_none() {
                return Err(KekError::invalid_config(format!(
                    "context {context}: current label {} is not in the version list",
                    entry.current
                )));
            }
        }
        Ok(())
    }
}

const BACKUP_STAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time of the document, for reload polling.
    pub fn modified(&self) -> KekResult<SystemTime> {
        let meta = std::fs::metadata(&self.path).map_err(KekError::metadata_io)?;
        meta.modified().map_err(KekError::metadata_io)
    }

    pub fn load(&self) -> KekResult<Metadata> {
        let contents = std::fs::read_to_string(&self.path).map_err(KekError::metadata_io)?;
        let metadata: Metadata = serde_yaml::from_str(&contents).map_err(KekError::metadata_io)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Persist the document: copy the prior content to a timestamped backup
    /// sibling, then truncate, write, and fsync the live file.
    pub fn save(&self, metadata: &Metadata) -> KekResult<()> {
        self.backup_existing();

        let serialized = serde_yaml::to_string(metadata).map_err(KekError::metadata_io)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(KekError::metadata_io)?;
        file.write_all(serialized.as_bytes())
            .map_err(KekError::metadata_io)?;
        file.sync_all().map_err(KekError::metadata_io)?;
        Ok(())
    }

    fn backup_existing(&self) {
        let Ok(previous) = std::fs::read(&self.path) else {
            return;
        };
        let stamp = OffsetDateTime::now_utc()
            .format(BACKUP_STAMP)
            .unwrap_or_else(|_| "unknown".into());
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".backup-{stamp}"));
        let backup = PathBuf::from(name);
        match std::fs::write(&backup, previous) {
            Ok(()) => info!(path = %backup.display(), "metadata backup written"),
            Err(err) => warn!(error = %err, "failed to write metadata backup"),
        }
    }

    /// Acquire the exclusive advisory lock serializing rotation and cleanup.
    /// Blocks until the lock is granted; released when the guard drops.
    pub fn lock(&self) -> KekResult<MetadataLock> {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".lock");
        let lock_path = PathBuf::from(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(KekError::lock)?;
        FileExt::lock_exclusive(&file).map_err(KekError::lock)?;
        Ok(MetadataLock {
            file,
            path: lock_path,
        })
    }
}

/// RAII guard over the sidecar lock file.
pub struct MetadataLock {
    file: File,
    path: PathBuf,
}

impl Drop for MetadataLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Metadata {
        let mut rotation = BTreeMap::new();
        rotation.insert(
            "exchange-key".to_string(),
            KeyEntry {
                current: "kek-exchange-v2".into(),
                rotation_interval_days: 90,
                versions: vec![
                    KeyVersion {
                        label: "kek-exchange-v1".into(),
                        version: 1,
                        created_at: Some(OffsetDateTime::now_utc()),
                        checksum: Some(label_checksum("kek-exchange-v1")),
                    },
                    KeyVersion {
                        label: "kek-exchange-v2".into(),
                        version: 2,
                        created_at: Some(OffsetDateTime::now_utc()),
                        checksum: Some(label_checksum("kek-exchange-v2")),
                    },
                ],
            },
        );
        Metadata { rotation }
    }

    #[test]
    fn round_trips_through_yaml() {
        let dir = TempDir::new().expect("tempdir");
        let store = MetadataStore::new(dir.path().join("metadata.yaml"));
        store.save(&sample()).expect("save");
        let loaded = store.load().expect("load");
        let entry = &loaded.rotation["exchange-key"];
        assert_eq!(entry.current, "kek-exchange-v2");
        assert_eq!(entry.versions.len(), 2);
        assert_eq!(entry.highest_version(), 2);
    }

    #[test]
    fn accepts_legacy_entries_without_timestamps() {
        let doc = r#"
rotation:
  exchange-key:
    current: kek-exchange-v1
    versions:
      - label: kek-exchange-v1
        version: 1
"#;
        let metadata: Metadata = serde_yaml::from_str(doc).expect("parse");
        metadata.validate().expect("valid");
        let version = &metadata.rotation["exchange-key"].versions[0];
        assert!(version.created_at.is_none());
        assert!(version.checksum.is_none());
        assert_eq!(metadata.rotation["exchange-key"].rotation_interval_days, 0);
    }

    #[test]
    fn rejects_out_of_order_versions() {
        let mut metadata = sample();
        metadata
            .rotation
            .get_mut("exchange-key")
            .unwrap()
            .versions
            .swap(0, 1);
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn rejects_current_absent_from_versions() {
        let mut metadata = sample();
        metadata.rotation.get_mut("exchange-key").unwrap().current = "kek-exchange-v9".into();
        assert!(matches!(
            metadata.validate(),
            Err(KekError::InvalidConfig(_))
        ));
    }

    #[test]
    fn save_leaves_a_backup_of_prior_content() {
        let dir = TempDir::new().expect("tempdir");
        let store = MetadataStore::new(dir.path().join("metadata.yaml"));
        store.save(&sample()).expect("first save");
        store.save(&sample()).expect("second save");
        let backups = std::fs::read_dir(dir.path())
            .expect("readdir")
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .contains("metadata.yaml.backup-")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let dir = TempDir::new().expect("tempdir");
        let store = MetadataStore::new(dir.path().join("metadata.yaml"));
        {
            let _guard = store.lock().expect("first lock");
        }
        let _again = store.lock().expect("second lock");
    }

    #[test]
    fn checksum_is_hex_sha256_of_label() {
        let digest = label_checksum("kek-exchange-v1");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(digest, label_checksum("kek-exchange-v2"));
    }
}
