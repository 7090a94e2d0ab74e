//! Operator CLI for the KEK lifecycle: rotation, retention cleanup, checksum
//! maintenance, and out-of-band key creation/deletion.
//!
//! Commands mutate the metadata document under its exclusive lock and talk
//! to the token directly; the running service notices changes through its
//! hot-reload loop, so no restart is required after a rotation.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use kekgate_core::{
    CleanupOptions, HsmGateway, KeyVersion, MetadataStore, Pkcs11Gateway, RotationEngine,
    ServiceConfig, SoftHsm,
    rotation::key_id_from_clock,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

#[derive(Parser, Debug)]
#[command(name = "kekgate-admin", version, about = "kekgate key administration")]
struct Cli {
    /// Path to the service configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rotate a context to a new KEK version.
    Rotate { context: String },
    /// Report the rotation posture of every context.
    RotationStatus,
    /// Delete old KEK versions by age and count.
    CleanupOldVersions {
        /// Show what would be deleted without deleting anything.
        #[arg(long)]
        dry_run: bool,
        /// Delete without prompting per context.
        #[arg(long)]
        force: bool,
    },
    /// Recompute the checksum of every version record and persist.
    UpdateChecksums {
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete one HSM object. Does not touch the metadata document.
    DeleteKek {
        #[arg(long)]
        label: String,
        /// Required; deletion is irreversible.
        #[arg(long)]
        confirm: bool,
    },
    /// Create the first KEK of a new context out of band.
    CreateKek {
        label: String,
        #[arg(long, default_value_t = 1)]
        version: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let store = MetadataStore::new(&config.hsm.metadata_file);

    match cli.command {
        Commands::Rotate { context } => {
            let engine = RotationEngine::new(token_gateway(&config)?, store);
            let outcome = engine.rotate(&context)?;
            println!("Rotation completed for context {}", outcome.context);
            println!(
                "  old: {} (version {})",
                outcome.previous_label, outcome.previous_version
            );
            println!("  new: {} (version {})", outcome.new_label, outcome.new_version);
            println!();
            println!("The service picks the new KEK up on its next metadata reload.");
            println!(
                "After the overlap period, retire the old version with cleanup-old-versions."
            );
        }
        Commands::RotationStatus => {
            let engine = RotationEngine::new(Arc::new(SoftHsm::new()), store);
            let now = OffsetDateTime::now_utc();
            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header([
                "Context",
                "Current",
                "Version",
                "Versions",
                "Created",
                "Next rotation",
                "Status",
            ]);
            for status in engine.rotation_status()? {
                let state = if status.overdue(now) {
                    format!("NEEDS ROTATION ({} days overdue)", -status.days_remaining(now))
                } else {
                    format!("OK ({} days remaining)", status.days_remaining(now))
                };
                table.add_row([
                    status.context.clone(),
                    status.current.clone(),
                    status.version.to_string(),
                    status.total_versions.to_string(),
                    format_timestamp(status.created_at),
                    format_timestamp(status.next_rotation),
                    state,
                ]);
            }
            println!("{table}");
        }
        Commands::CleanupOldVersions { dry_run, force } => {
            let gateway: Arc<dyn HsmGateway> = if dry_run {
                // nothing is deleted in a dry run, so the token is not opened
                Arc::new(SoftHsm::new())
            } else {
                token_gateway(&config)?
            };
            let engine = RotationEngine::new(gateway, store);
            let opts = CleanupOptions {
                max_versions: config.hsm.max_versions,
                cleanup_after_days: config.hsm.cleanup_after_days,
                dry_run,
                force,
            };
            println!("Max versions to keep: {}", opts.max_versions);
            println!("Delete versions older than: {} days", opts.cleanup_after_days);
            if dry_run {
                println!("DRY RUN MODE - no changes will be made");
            }
            println!();

            let report = engine.cleanup(&opts, prompt_for_deletion)?;
            for context in &report.contexts {
                println!(
                    "Context {}: kept {}, deleted {}",
                    context.context,
                    context.kept,
                    context.deleted.len()
                );
                for version in &context.deleted {
                    println!("  - {} (v{})", version.label, version.version);
                }
            }
            println!();
            if dry_run {
                println!("DRY RUN COMPLETE - would delete {} versions", report.total_deleted);
            } else {
                println!("CLEANUP COMPLETE - deleted {} versions", report.total_deleted);
            }
        }
        Commands::UpdateChecksums { dry_run } => {
            let engine = RotationEngine::new(Arc::new(SoftHsm::new()), store);
            let updated = engine.update_checksums(dry_run)?;
            if dry_run {
                println!("{updated} checksum(s) would be updated");
            } else {
                println!("{updated} checksum(s) updated");
            }
        }
        Commands::DeleteKek { label, confirm } => {
            if !confirm {
                bail!("refusing to delete {label} without --confirm");
            }
            token_gateway(&config)?.delete_key(&label)?;
            println!("Deleted KEK {label} from the token.");
            println!("Metadata was not modified; prune it with cleanup-old-versions.");
        }
        Commands::CreateKek { label, version } => {
            let id = key_id_from_clock();
            token_gateway(&config)?.generate_key(&label, &id)?;
            println!(
                "Created KEK {label} (version {version}, id {})",
                hex_id(&id)
            );
            println!("Record it in the metadata document to make it loadable.");
        }
    }
    Ok(())
}

fn token_gateway(config: &ServiceConfig) -> anyhow::Result<Arc<dyn HsmGateway>> {
    let gateway = Pkcs11Gateway::open(
        &config.hsm.pkcs11_lib,
        &config.hsm.slot_id,
        config.hsm.pin()?,
    )?;
    Ok(Arc::new(gateway))
}

fn prompt_for_deletion(context: &str, pending: &[KeyVersion]) -> bool {
    print!(
        "Delete {} version(s) for context {}? (yes/no): ",
        pending.len(),
        context
    );
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim().eq_ignore_ascii_case("yes")
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn hex_id(id: &[u8]) -> String {
    id.iter().map(|byte| format!("{byte:02x}")).collect()
}
