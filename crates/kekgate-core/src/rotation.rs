//! Rotation and cleanup of versioned KEKs.
//!
//! Both operations run inside the exclusive metadata lock. Rotation creates
//! the HSM object before touching the document; cleanup destroys HSM objects
//! first and aborts a context on HSM failure without modifying its entry.
//! Neither notifies the running service: the hot-reload loop picks up the
//! mtime change.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::{
    error::{KekError, KekResult},
    hsm::HsmGateway,
    metadata::{KeyVersion, MetadataStore, label_checksum},
};

/// Parse a `<base>-v<N>` label into its base name and version number.
pub fn parse_label(label: &str) -> KekResult<(&str, u32)> {
    let parts: Vec<&str> = label.split("-v").collect();
    if parts.len() != 2 {
        return Err(KekError::InvalidLabel(label.to_owned()));
    }
    let version = parts[1]
        .parse::<u32>()
        .map_err(|_| KekError::InvalidLabel(label.to_owned()))?;
    Ok((parts[0], version))
}

/// Unique id for a new HSM object: the big-endian nanosecond clock, which is
/// strictly increasing between key generations on one host.
pub fn key_id_from_clock() -> [u8; 8] {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos as u64).to_be_bytes()
}

#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub context: String,
    pub previous_label: String,
    pub previous_version: u32,
    pub new_label: String,
    pub new_version: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupOptions {
    pub max_versions: usize,
    pub cleanup_after_days: i64,
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub contexts: Vec<ContextCleanup>,
    pub total_deleted: usize,
}

#[derive(Debug)]
pub struct ContextCleanup {
    pub context: String,
    pub kept: usize,
    pub deleted: Vec<KeyVersion>,
}

#[derive(Debug, Clone)]
pub struct RotationStatus {
    pub context: String,
    pub current: String,
    pub version: u32,
    pub total_versions: usize,
    pub rotation_interval_days: u32,
    pub created_at: OffsetDateTime,
    pub next_rotation: OffsetDateTime,
}

impl RotationStatus {
    /// Days until the next rotation; negative when overdue.
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        (self.next_rotation - now).whole_days()
    }

    pub fn overdue(&self, now: OffsetDateTime) -> bool {
        now > self.next_rotation
    }
}

/// Interval assumed for status reporting when a context has no explicit
/// rotation policy.
const STATUS_FALLBACK_INTERVAL_DAYS: u32 = 90;

pub struct RotationEngine {
    gateway: Arc<dyn HsmGateway>,
    store: MetadataStore,
}

impl RotationEngine {
    pub fn new(gateway: Arc<dyn HsmGateway>, store: MetadataStore) -> Self {
        Self { gateway, store }
    }

    /// Advance `context` to a new KEK version.
    ///
    /// The new version number is one past the highest recorded version, not
    /// the current one, so a rerun after a partial failure stays monotonic.
    pub fn rotate(&self, context: &str) -> KekResult<RotationOutcome> {
        let _lock = self.store.lock()?;
        let mut metadata = self.store.load()?;
        let entry = metadata
            .rotation
            .get_mut(context)
            .ok_or_else(|| KekError::ConfigMismatch(context.to_owned()))?;
        if entry.versions.is_empty() {
            return Err(KekError::invalid_config(format!(
                "no versions recorded for context {context}"
            )));
        }
        let current = entry
            .current_version()
            .ok_or_else(|| KekError::CurrentMissing(entry.current.clone()))?
            .clone();

        let new_version = entry.highest_version() + 1;
        let (base, _) = parse_label(&current.label)?;
        let new_label = format!("{base}-v{new_version}");
        if entry.find(&new_label).is_some() {
            return Err(KekError::invalid_config(format!(
                "version {new_label} already exists, cannot create duplicate"
            )));
        }

        self.gateway.generate_key(&new_label, &key_id_from_clock())?;

        entry.versions.push(KeyVersion {
            label: new_label.clone(),
            version: new_version,
            created_at: Some(OffsetDateTime::now_utc()),
            checksum: Some(label_checksum(&new_label)),
        });
        entry.current = new_label.clone();
        self.store.save(&metadata)?;

        info!(
            context,
            old_label = %current.label,
            new_label = %new_label,
            "KEK rotation committed"
        );
        Ok(RotationOutcome {
            context: context.to_owned(),
            previous_label: current.label,
            previous_version: current.version,
            new_label,
            new_version,
        })
    }

    /// Prune old versions by age and count.
    ///
    /// For each context, versions are walked in list order and partitioned
    /// into keep and delete sets; the label equal to `current` is always
    /// kept. `confirm` is consulted per context when deletions are pending
    /// and `force` is off.
    pub fn cleanup(
        &self,
        opts: &CleanupOptions,
        mut confirm: impl FnMut(&str, &[KeyVersion]) -> bool,
    ) -> KekResult<CleanupReport> {
        let _lock = self.store.lock()?;
        let mut metadata = self.store.load()?;
        let now = OffsetDateTime::now_utc();
        let cutoff = now - Duration::days(opts.cleanup_after_days);

        let mut report = CleanupReport::default();
        let mut modified = false;

        for (context, entry) in metadata.rotation.iter_mut() {
            if entry.versions.len() <= 1 {
                continue;
            }

            let mut keep: Vec<KeyVersion> = Vec::new();
            let mut delete: Vec<KeyVersion> = Vec::new();
            for version in &entry.versions {
                if version.label == entry.current {
                    keep.push(version.clone());
                    continue;
                }
                let too_old = version.created_at.is_some_and(|at| at < cutoff);
                // counting this entry: the kept set can never grow past
                // max_versions, current included
                let over_count = keep.len() + delete.len() + 1 >= opts.max_versions;
                if too_old || over_count {
                    delete.push(version.clone());
                } else {
                    keep.push(version.clone());
                }
            }

            if delete.is_empty() {
                continue;
            }
            if !opts.dry_run && !opts.force && !confirm(context, &delete) {
                info!(context, "cleanup skipped by operator");
                continue;
            }

            if !opts.dry_run {
                let mut aborted = false;
                for version in &delete {
                    if let Err(err) = self.gateway.delete_key(&version.label) {
                        warn!(
                            context,
                            label = %version.label,
                            error = %err,
                            "HSM deletion failed, leaving context untouched"
                        );
                        aborted = true;
                        break;
                    }
                    info!(context, label = %version.label, "deleted KEK version");
                }
                if aborted {
                    continue;
                }
                entry.versions = keep.clone();
                modified = true;
            }

            report.total_deleted += delete.len();
            report.contexts.push(ContextCleanup {
                context: context.clone(),
                kept: keep.len(),
                deleted: delete,
            });
        }

        if modified && !opts.dry_run {
            self.store.save(&metadata)?;
        }
        Ok(report)
    }

    /// Recompute the checksum of every version record. Returns how many
    /// records changed.
    pub fn update_checksums(&self, dry_run: bool) -> KekResult<usize> {
        let _lock = self.store.lock()?;
        let mut metadata = self.store.load()?;
        let mut updated = 0;
        for entry in metadata.rotation.values_mut() {
            for version in &mut entry.versions {
                let computed = label_checksum(&version.label);
                if version.checksum.as_deref() != Some(computed.as_str()) {
                    version.checksum = Some(computed);
                    updated += 1;
                }
            }
        }
        if updated > 0 && !dry_run {
            self.store.save(&metadata)?;
        }
        Ok(updated)
    }

    /// Per-context rotation posture, for the admin surface.
    pub fn rotation_status(&self) -> KekResult<Vec<RotationStatus>> {
        let metadata = self.store.load()?;
        let now = OffsetDateTime::now_utc();
        let mut statuses = Vec::with_capacity(metadata.rotation.len());
        for (context, entry) in &metadata.rotation {
            let Some(current) = entry.current_version() else {
                warn!(context, current = %entry.current, "current version not found");
                continue;
            };
            let interval_days = if entry.rotation_interval_days == 0 {
                STATUS_FALLBACK_INTERVAL_DAYS
            } else {
                entry.rotation_interval_days
            };
            let created_at = current.created_at.unwrap_or(now);
            statuses.push(RotationStatus {
                context: context.clone(),
                current: entry.current.clone(),
                version: current.version,
                total_versions: entry.versions.len(),
                rotation_interval_days: interval_days,
                created_at,
                next_rotation: created_at + Duration::days(i64::from(interval_days)),
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hsm::SoftHsm,
        metadata::{KeyEntry, Metadata},
    };
    use tempfile::TempDir;

    fn version_aged(label: &str, number: u32, age_days: i64) -> KeyVersion {
        KeyVersion {
            label: label.to_owned(),
            version: number,
            created_at: Some(OffsetDateTime::now_utc() - Duration::days(age_days)),
            checksum: Some(label_checksum(label)),
        }
    }

    fn engine_with(
        dir: &TempDir,
        entry: KeyEntry,
    ) -> (Arc<SoftHsm>, RotationEngine, MetadataStore) {
        let mut metadata = Metadata::default();
        metadata.rotation.insert("exchange-key".into(), entry);
        let store = MetadataStore::new(dir.path().join("metadata.yaml"));
        store.save(&metadata).expect("seed metadata");

        let hsm = Arc::new(SoftHsm::new());
        for version in &metadata.rotation["exchange-key"].versions {
            hsm.generate_key(&version.label, &[0; 8]).unwrap();
        }
        let engine = RotationEngine::new(
            Arc::clone(&hsm) as Arc<dyn HsmGateway>,
            MetadataStore::new(dir.path().join("metadata.yaml")),
        );
        (hsm, engine, store)
    }

    #[test]
    fn parses_well_formed_labels_only() {
        assert_eq!(parse_label("kek-exchange-v3").unwrap(), ("kek-exchange", 3));
        assert!(parse_label("kek-exchange").is_err());
        assert!(parse_label("kek-v1-v2").is_err());
        assert!(parse_label("kek-exchange-vX").is_err());
    }

    #[test]
    fn rotation_appends_and_flips_current() {
        let dir = TempDir::new().expect("tempdir");
        let (hsm, engine, store) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v1".into(),
                rotation_interval_days: 90,
                versions: vec![version_aged("kek-exchange-v1", 1, 100)],
            },
        );

        let outcome = engine.rotate("exchange-key").expect("rotate");
        assert_eq!(outcome.previous_label, "kek-exchange-v1");
        assert_eq!(outcome.new_label, "kek-exchange-v2");
        assert_eq!(outcome.new_version, 2);

        let metadata = store.load().expect("reload");
        let entry = &metadata.rotation["exchange-key"];
        assert_eq!(entry.current, "kek-exchange-v2");
        assert_eq!(entry.versions.len(), 2);
        let added = entry.find("kek-exchange-v2").expect("recorded");
        assert_eq!(added.checksum.as_deref(), Some(label_checksum("kek-exchange-v2").as_str()));
        assert!(added.created_at.is_some());
        assert!(hsm.find_aead("kek-exchange-v2").unwrap().is_some());
    }

    #[test]
    fn rotation_increments_past_the_highest_version() {
        let dir = TempDir::new().expect("tempdir");
        // current lags behind the highest recorded version, as after a
        // partially rolled-back rotation
        let (_, engine, _) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v1".into(),
                rotation_interval_days: 0,
                versions: vec![
                    version_aged("kek-exchange-v1", 1, 10),
                    version_aged("kek-exchange-v3", 3, 5),
                ],
            },
        );
        let outcome = engine.rotate("exchange-key").expect("rotate");
        assert_eq!(outcome.new_version, 4);
        assert_eq!(outcome.new_label, "kek-exchange-v4");
    }

    #[test]
    fn rotation_of_unknown_context_fails() {
        let dir = TempDir::new().expect("tempdir");
        let (_, engine, _) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v1".into(),
                rotation_interval_days: 0,
                versions: vec![version_aged("kek-exchange-v1", 1, 1)],
            },
        );
        assert!(matches!(
            engine.rotate("payroll"),
            Err(KekError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn cleanup_respects_age_count_and_current() {
        let dir = TempDir::new().expect("tempdir");
        // ages 200d, 50d, 20d; current is v3
        let (hsm, engine, store) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v3".into(),
                rotation_interval_days: 90,
                versions: vec![
                    version_aged("kek-exchange-v1", 1, 200),
                    version_aged("kek-exchange-v2", 2, 50),
                    version_aged("kek-exchange-v3", 3, 20),
                ],
            },
        );

        let report = engine
            .cleanup(
                &CleanupOptions {
                    max_versions: 3,
                    cleanup_after_days: 30,
                    dry_run: false,
                    force: true,
                },
                |_, _| true,
            )
            .expect("cleanup");

        assert_eq!(report.total_deleted, 2);
        let metadata = store.load().expect("reload");
        let entry = &metadata.rotation["exchange-key"];
        assert_eq!(entry.versions.len(), 1);
        assert_eq!(entry.versions[0].label, "kek-exchange-v3");
        assert!(hsm.find_aead("kek-exchange-v1").unwrap().is_none());
        assert!(hsm.find_aead("kek-exchange-v2").unwrap().is_none());
        assert!(hsm.find_aead("kek-exchange-v3").unwrap().is_some());
    }

    #[test]
    fn cleanup_count_eviction_spares_young_versions_within_limit() {
        let dir = TempDir::new().expect("tempdir");
        let (_, engine, store) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v4".into(),
                rotation_interval_days: 0,
                versions: vec![
                    version_aged("kek-exchange-v1", 1, 10),
                    version_aged("kek-exchange-v2", 2, 8),
                    version_aged("kek-exchange-v3", 3, 6),
                    version_aged("kek-exchange-v4", 4, 1),
                ],
            },
        );

        let report = engine
            .cleanup(
                &CleanupOptions {
                    max_versions: 3,
                    cleanup_after_days: 30,
                    dry_run: false,
                    force: true,
                },
                |_, _| true,
            )
            .expect("cleanup");

        // nothing is old enough; only the count rule fires once three slots
        // are occupied
        assert_eq!(report.total_deleted, 1);
        let metadata = store.load().expect("reload");
        let entry = &metadata.rotation["exchange-key"];
        assert_eq!(entry.versions.len(), 3);
        assert!(entry.find("kek-exchange-v4").is_some());
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let (hsm, engine, store) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v2".into(),
                rotation_interval_days: 0,
                versions: vec![
                    version_aged("kek-exchange-v1", 1, 200),
                    version_aged("kek-exchange-v2", 2, 1),
                ],
            },
        );

        let report = engine
            .cleanup(
                &CleanupOptions {
                    max_versions: 3,
                    cleanup_after_days: 30,
                    dry_run: true,
                    force: false,
                },
                |_, _| panic!("dry run must not prompt"),
            )
            .expect("cleanup");

        assert_eq!(report.total_deleted, 1);
        assert!(hsm.find_aead("kek-exchange-v1").unwrap().is_some());
        assert_eq!(store.load().unwrap().rotation["exchange-key"].versions.len(), 2);
    }

    #[test]
    fn declined_confirmation_skips_the_context() {
        let dir = TempDir::new().expect("tempdir");
        let (hsm, engine, store) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v2".into(),
                rotation_interval_days: 0,
                versions: vec![
                    version_aged("kek-exchange-v1", 1, 200),
                    version_aged("kek-exchange-v2", 2, 1),
                ],
            },
        );

        let report = engine
            .cleanup(
                &CleanupOptions {
                    max_versions: 3,
                    cleanup_after_days: 30,
                    dry_run: false,
                    force: false,
                },
                |_, _| false,
            )
            .expect("cleanup");

        assert_eq!(report.total_deleted, 0);
        assert!(hsm.find_aead("kek-exchange-v1").unwrap().is_some());
        assert_eq!(store.load().unwrap().rotation["exchange-key"].versions.len(), 2);
    }

    #[test]
    fn update_checksums_fills_missing_digests() {
        let dir = TempDir::new().expect("tempdir");
        let mut entry = KeyEntry {
            current: "kek-exchange-v1".into(),
            rotation_interval_days: 0,
            versions: vec![version_aged("kek-exchange-v1", 1, 1)],
        };
        entry.versions[0].checksum = None;
        let (_, engine, store) = engine_with(&dir, entry);

        assert_eq!(engine.update_checksums(true).expect("dry run"), 1);
        assert!(store.load().unwrap().rotation["exchange-key"].versions[0]
            .checksum
            .is_none());

        assert_eq!(engine.update_checksums(false).expect("persist"), 1);
        let reloaded = store.load().expect("reload");
        assert_eq!(
            reloaded.rotation["exchange-key"].versions[0].checksum.as_deref(),
            Some(label_checksum("kek-exchange-v1").as_str())
        );
        assert_eq!(engine.update_checksums(false).expect("idempotent"), 0);
    }

    #[test]
    fn status_reports_overdue_contexts_with_fallback_interval() {
        let dir = TempDir::new().expect("tempdir");
        let (_, engine, _) = engine_with(
            &dir,
            KeyEntry {
                current: "kek-exchange-v1".into(),
                rotation_interval_days: 0,
                versions: vec![version_aged("kek-exchange-v1", 1, 100)],
            },
        );
        let statuses = engine.rotation_status().expect("status");
        assert_eq!(statuses.len(), 1);
        let status = &statuses[0];
        assert_eq!(status.rotation_interval_days, STATUS_FALLBACK_INTERVAL_DAYS);
        let now = OffsetDateTime::now_utc();
        assert!(status.overdue(now));
        assert!(status.days_remaining(now) < 0);
    }
}
