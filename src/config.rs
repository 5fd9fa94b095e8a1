//! Configuration management for Chunkdrop Server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Minimum length of the server secret
pub const MIN_SECRET_LEN: usize = 32;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CHUNKDROP_SECRET is not set")]
    MissingSecret,

    #[error("CHUNKDROP_SECRET must be at least {MIN_SECRET_LEN} characters long")]
    WeakSecret,

    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub ids: IdConfig,
    pub limits: LimitsConfig,
    pub retention: RetentionConfig,
    pub policy: PolicyConfig,
    pub crypto: CryptoConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server-wide secret. Keys chunk encryption, chunk naming,
    /// fingerprints and hashed identifiers.
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// How public identifiers are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMode {
    /// Random identifiers that grow on collision
    Random,
    /// Digest of (name, time, secret, fingerprint)
    Hashed,
}

impl FromStr for IdMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(IdMode::Random),
            "hashed" => Ok(IdMode::Hashed),
            _ => Err(ConfigError::Invalid {
                var: "ID_MODE",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdConfig {
    pub mode: IdMode,
    /// Truncate hashed identifiers to the shortest free prefix
    pub short_hash: bool,
}

/// Upload limits. Values <= 0 disable the corresponding check.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_storage_bytes: i64,
    pub per_uploader_daily_bytes: i64,
    pub per_uploader_daily_files: i64,
    pub max_file_size_bytes: i64,
}

/// Retention windows. Values <= 0 disable the corresponding sweep.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub file_retention_days: i64,
    pub audit_log_retention_days: i64,
    pub collection_expiration_days: i64,
    /// Age after which unmerged chunks are treated as abandoned
    pub orphan_chunk_age_hours: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub blocked_mime_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CryptoConfig {
    pub kdf_iterations: u32,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub chunk_timeout_secs: u64,
    pub merge_timeout_secs: u64,
}

/// Turn a `<= 0 disables` setting into an optional limit
pub fn enabled(value: i64) -> Option<u64> {
    (value > 0).then_some(value as u64)
}

impl LimitsConfig {
    pub fn max_storage_bytes(&self) -> Option<u64> {
        enabled(self.max_storage_bytes)
    }

    pub fn per_uploader_daily_bytes(&self) -> Option<u64> {
        enabled(self.per_uploader_daily_bytes)
    }

    pub fn per_uploader_daily_files(&self) -> Option<u64> {
        enabled(self.per_uploader_daily_files)
    }

    pub fn max_file_size_bytes(&self) -> Option<u64> {
        enabled(self.max_file_size_bytes)
    }

    /// Whether any quota check is configured at all
    pub fn any_quota(&self) -> bool {
        self.max_storage_bytes().is_some()
            || self.per_uploader_daily_bytes().is_some()
            || self.per_uploader_daily_files().is_some()
    }
}

/// Orphan age used when the configured value is not positive
const DEFAULT_ORPHAN_CHUNK_AGE_HOURS: i64 = 24;

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Orphan sweeping cannot be disabled
    pub fn orphan_chunk_age(&self) -> chrono::Duration {
        let hours = if self.orphan_chunk_age_hours > 0 {
            self.orphan_chunk_age_hours
        } else {
            DEFAULT_ORPHAN_CHUNK_AGE_HOURS
        };
        chrono::Duration::hours(hours)
    }

    pub fn file_retention(&self) -> Option<chrono::Duration> {
        enabled(self.file_retention_days).map(|d| chrono::Duration::days(d as i64))
    }

    pub fn audit_log_retention(&self) -> Option<chrono::Duration> {
        enabled(self.audit_log_retention_days).map(|d| chrono::Duration::days(d as i64))
    }

    pub fn collection_expiration(&self) -> Option<chrono::Duration> {
        enabled(self.collection_expiration_days).map(|d| chrono::Duration::days(d as i64))
    }
}

impl TimeoutConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

pub fn default_blocked_mime_types() -> Vec<String> {
    [
        "application/x-msdownload",
        "application/x-msdos-program",
        "application/x-executable",
        "application/x-dosexec",
        "application/x-msi",
        "application/x-sh",
        "application/x-bat",
        "application/x-ms-dos-executable",
        "application/vnd.microsoft.portable-executable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                secret: String::new(),
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("./uploads"),
            },
            database: DatabaseConfig {
                url: "sqlite:./chunkdrop.db".to_string(),
            },
            ids: IdConfig {
                mode: IdMode::Random,
                short_hash: true,
            },
            limits: LimitsConfig {
                max_storage_bytes: 100 * 1024 * 1024 * 1024,
                per_uploader_daily_bytes: 1024 * 1024 * 1024,
                per_uploader_daily_files: 100,
                max_file_size_bytes: 10 * 1024 * 1024 * 1024,
            },
            retention: RetentionConfig {
                file_retention_days: 30,
                audit_log_retention_days: 90,
                collection_expiration_days: 7,
                orphan_chunk_age_hours: DEFAULT_ORPHAN_CHUNK_AGE_HOURS,
                sweep_interval_secs: 60 * 60,
            },
            policy: PolicyConfig {
                blocked_mime_types: default_blocked_mime_types(),
            },
            crypto: CryptoConfig {
                kdf_iterations: 100_000,
            },
            timeouts: TimeoutConfig {
                chunk_timeout_secs: 120,
                merge_timeout_secs: 600,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let secret = env::var("CHUNKDROP_SECRET").map_err(|_| ConfigError::MissingSecret)?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret);
        }

        let mode = match env::var("ID_MODE") {
            Ok(value) => value.parse::<IdMode>()?,
            Err(_) => defaults.ids.mode,
        };

        let blocked_mime_types = match env::var("BLOCKED_MIME_TYPES") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.policy.blocked_mime_types,
        };

        Ok(Config {
            server: ServerConfig { secret },
            storage: StorageConfig {
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.upload_dir),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            ids: IdConfig {
                mode,
                short_hash: parse_var("SHORT_HASH", defaults.ids.short_hash)?,
            },
            limits: LimitsConfig {
                max_storage_bytes: parse_var("MAX_STORAGE_BYTES", defaults.limits.max_storage_bytes)?,
                per_uploader_daily_bytes: parse_var(
                    "PER_UPLOADER_DAILY_BYTES",
                    defaults.limits.per_uploader_daily_bytes,
                )?,
                per_uploader_daily_files: parse_var(
                    "PER_UPLOADER_DAILY_FILES",
                    defaults.limits.per_uploader_daily_files,
                )?,
                max_file_size_bytes: parse_var(
                    "MAX_FILE_SIZE_BYTES",
                    defaults.limits.max_file_size_bytes,
                )?,
            },
            retention: RetentionConfig {
                file_retention_days: parse_var(
                    "FILE_RETENTION_DAYS",
                    defaults.retention.file_retention_days,
                )?,
                audit_log_retention_days: parse_var(
                    "AUDIT_LOG_RETENTION_DAYS",
                    defaults.retention.audit_log_retention_days,
                )?,
                collection_expiration_days: parse_var(
                    "COLLECTION_EXPIRATION_DAYS",
                    defaults.retention.collection_expiration_days,
                )?,
                orphan_chunk_age_hours: parse_var(
                    "ORPHAN_CHUNK_AGE_HOURS",
                    defaults.retention.orphan_chunk_age_hours,
                )?,
                sweep_interval_secs: parse_var(
                    "SWEEP_INTERVAL_SECS",
                    defaults.retention.sweep_interval_secs,
                )?,
            },
            policy: PolicyConfig { blocked_mime_types },
            crypto: CryptoConfig {
                kdf_iterations: parse_var("KDF_ITERATIONS", defaults.crypto.kdf_iterations)?,
            },
            timeouts: TimeoutConfig {
                chunk_timeout_secs: parse_var(
                    "CHUNK_TIMEOUT_SECS",
                    defaults.timeouts.chunk_timeout_secs,
                )?,
                merge_timeout_secs: parse_var(
                    "MERGE_TIMEOUT_SECS",
                    defaults.timeouts.merge_timeout_secs,
                )?,
            },
        })
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_limits() {
        let mut limits = Config::default().limits;
        limits.max_storage_bytes = 0;
        limits.per_uploader_daily_bytes = -1;
        limits.per_uploader_daily_files = 0;

        assert_eq!(limits.max_storage_bytes(), None);
        assert_eq!(limits.per_uploader_daily_bytes(), None);
        assert!(!limits.any_quota());
        assert_eq!(limits.max_file_size_bytes(), Some(10 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_id_mode_parsing() {
        assert_eq!("random".parse::<IdMode>().unwrap(), IdMode::Random);
        assert_eq!(" Hashed ".parse::<IdMode>().unwrap(), IdMode::Hashed);
        assert!(matches!(
            "uuid".parse::<IdMode>(),
            Err(ConfigError::Invalid { var: "ID_MODE", .. })
        ));
    }

    #[test]
    fn test_default_blocklist_covers_windows_executables() {
        let config = Config::default();
        assert!(config
            .policy
            .blocked_mime_types
            .iter()
            .any(|m| m == "application/x-msdownload"));
    }
}
