//! Typed service configuration.
//!
//! The configuration file is YAML with a fixed schema; context entries under
//! `hsm.keys` are validated into a closed set of key kinds. The HSM PIN is
//! never read from the file, only from the `HSM_PIN` environment variable.

use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{KekError, KekResult};

pub const PIN_ENV: &str = "HSM_PIN";
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub hsm: HsmSettings,
    pub acl: AclConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct HsmSettings {
    pub pkcs11_lib: String,
    /// Token label used to select the PKCS#11 slot.
    pub slot_id: String,
    /// User PIN, populated from `HSM_PIN` only.
    #[serde(skip)]
    pub pin: Option<Zeroizing<String>>,
    pub metadata_file: PathBuf,
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    #[serde(default = "default_cleanup_after_days")]
    pub cleanup_after_days: i64,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    pub keys: BTreeMap<String, KeyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    #[serde(rename = "type")]
    pub kind: KeyKind,
    #[serde(default)]
    pub mode: KeyMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Aes,
    Rsa,
}

/// Addressing policy of a KEK. Shared keys bind ciphertexts to the client's
/// organizational unit; private keys bind to the individual common name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    #[default]
    Shared,
    Private,
}

#[derive(Debug, Deserialize)]
pub struct AclConfig {
    pub revoked_file: PathBuf,
    /// OU -> allowed context names.
    pub mappings: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u64,
    #[serde(default = "default_burst")]
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_max_versions() -> usize {
    3
}

fn default_cleanup_after_days() -> i64 {
    30
}

fn default_reload_interval_secs() -> u64 {
    30
}

fn default_requests_per_second() -> u64 {
    100
}

fn default_burst() -> u64 {
    200
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

impl ServiceConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> KekResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(KekError::invalid_config)?;
        let mut cfg: ServiceConfig =
            serde_yaml::from_str(&contents).map_err(KekError::invalid_config)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolve the configuration file path, honouring `CONFIG_PATH`.
    pub fn path_from_env() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(lib) = env::var("HSM_PKCS11_LIB") {
            self.hsm.pkcs11_lib = lib;
        }
        if let Ok(slot) = env::var("HSM_SLOT_ID") {
            self.hsm.slot_id = slot;
        }
        if let Ok(pin) = env::var(PIN_ENV) {
            self.hsm.pin = Some(Zeroizing::new(pin));
        }
        if let Ok(level) = env::var("HSM_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("HSM_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    fn validate(&self) -> KekResult<()> {
        if self.server.port == 0 {
            return Err(KekError::invalid_config("server.port is required"));
        }
        if self.hsm.pkcs11_lib.is_empty() {
            return Err(KekError::invalid_config("hsm.pkcs11_lib is required"));
        }
        if self.hsm.slot_id.is_empty() {
            return Err(KekError::invalid_config("hsm.slot_id is required"));
        }
        if self.hsm.keys.is_empty() {
            return Err(KekError::invalid_config("hsm.keys cannot be empty"));
        }
        if self.acl.mappings.is_empty() {
            return Err(KekError::invalid_config("acl.mappings cannot be empty"));
        }
        Ok(())
    }
}

impl HsmSettings {
    /// The user PIN; errors if `HSM_PIN` was not provided.
    pub fn pin(&self) -> KekResult<&str> {
        self.pin
            .as_deref()
            .map(String::as_str)
            .ok_or_else(|| KekError::invalid_config("HSM_PIN environment variable not set"))
    }
}
