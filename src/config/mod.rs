//! Runtime configuration.
//!
//! Values come from `casedesk.toml` (see [`Settings`]) and may be overridden
//! per key through `CASEDESK_*` environment variables.

mod helpers;
mod settings;

use std::path::{Component, PathBuf};

use secrecy::SecretString;

pub use settings::{
    AuditSettings, DEFAULT_ALLOWED_MIME_TYPES, DEFAULT_MAX_UPLOAD_BYTES, DatabaseSettings,
    LoggingSettings, Settings, StorageSettings, UploadSettings,
};

use crate::error::ConfigError;
use helpers::{optional_env, parse_bool_env, parse_list_env, parse_string_env, parse_u64_env};

/// Default location of the settings file, overridable with `CASEDESK_CONFIG`.
pub fn settings_path() -> PathBuf {
    std::env::var_os("CASEDESK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("casedesk.toml"))
}

/// Default libSQL file: `<data dir>/casedesk/casedesk.db`.
pub fn default_libsql_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("casedesk").join("casedesk.db"))
        .unwrap_or_else(|| PathBuf::from("casedesk.db"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    LibSql,
    Memory,
}

impl DatabaseBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "libsql" | "sqlite" => Ok(Self::LibSql),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "CASEDESK_DB_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }
}

/// Upper bound for the activity window, keeping date arithmetic in range.
const MAX_RECENT_ACTIVITY_DAYS: u64 = 36_500;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: PathBuf,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
    pub recent_activity_days: u64,
}

impl DatabaseConfig {
    /// In-memory store, used for tests and `--ephemeral` runs.
    pub fn memory() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            libsql_path: default_libsql_path(),
            libsql_url: None,
            libsql_auth_token: None,
            recent_activity_days: DatabaseSettings::default().recent_activity_days,
        }
    }

    pub fn recent_activity_window(&self) -> chrono::Duration {
        let days = self.recent_activity_days.min(MAX_RECENT_ACTIVITY_DAYS);
        chrono::Duration::days(i64::try_from(days).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Filesystem,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root: PathBuf,
}

/// Upload acceptance rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let settings = UploadSettings::default();
        Self {
            max_bytes: settings.max_bytes,
            allowed_mime_types: settings.allowed_mime_types,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditConfig {
    pub trail_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { trail_limit: 50 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
    /// Colored output; only applies to the pretty format.
    pub ansi: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub uploads: UploadConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Read the settings file and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Settings::load(&settings_path())?;
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: resolve_database(&settings.database)?,
            storage: resolve_storage(&settings.storage)?,
            uploads: resolve_uploads(&settings.uploads)?,
            audit: AuditConfig {
                trail_limit: usize::try_from(parse_u64_env(
                    "CASEDESK_AUDIT_TRAIL_LIMIT",
                    settings.audit.trail_limit,
                )?)
                .unwrap_or(usize::MAX),
            },
            logging: resolve_logging(&settings.logging)?,
        })
    }
}

fn resolve_database(settings: &DatabaseSettings) -> Result<DatabaseConfig, ConfigError> {
    let backend = DatabaseBackend::from_str(&parse_string_env(
        "CASEDESK_DB_BACKEND",
        settings.backend.clone(),
    )?)?;
    let libsql_path = optional_env("CASEDESK_LIBSQL_PATH")?
        .or_else(|| settings.libsql_path.clone())
        .map(PathBuf::from)
        .unwrap_or_else(default_libsql_path);
    let libsql_url = optional_env("CASEDESK_LIBSQL_URL")?.or_else(|| settings.libsql_url.clone());
    let libsql_auth_token = optional_env("CASEDESK_LIBSQL_AUTH_TOKEN")?.map(SecretString::from);

    if libsql_url.is_some() && libsql_auth_token.is_none() {
        return Err(ConfigError::MissingRequired {
            key: "CASEDESK_LIBSQL_AUTH_TOKEN".to_string(),
            hint: "a remote libSQL URL needs an auth token".to_string(),
        });
    }

    Ok(DatabaseConfig {
        backend,
        libsql_path,
        libsql_url,
        libsql_auth_token,
        recent_activity_days: parse_u64_env(
            "CASEDESK_RECENT_ACTIVITY_DAYS",
            settings.recent_activity_days,
        )?,
    })
}

fn resolve_storage(settings: &StorageSettings) -> Result<StorageConfig, ConfigError> {
    let backend = match parse_string_env("CASEDESK_STORAGE_BACKEND", settings.backend.clone())?
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "fs" | "filesystem" => StorageBackend::Filesystem,
        "memory" => StorageBackend::Memory,
        other => {
            return Err(ConfigError::InvalidValue {
                key: "CASEDESK_STORAGE_BACKEND".to_string(),
                message: format!("unsupported storage backend '{other}'"),
            });
        }
    };
    let raw_root = parse_string_env("CASEDESK_STORAGE_ROOT", settings.root.clone())?;
    Ok(StorageConfig {
        backend,
        root: validate_storage_root(&raw_root)?,
    })
}

fn resolve_uploads(settings: &UploadSettings) -> Result<UploadConfig, ConfigError> {
    let max_bytes = parse_u64_env("CASEDESK_MAX_UPLOAD_BYTES", settings.max_bytes)?;
    if max_bytes == 0 {
        return Err(ConfigError::InvalidValue {
            key: "CASEDESK_MAX_UPLOAD_BYTES".to_string(),
            message: "upload ceiling must be greater than zero".to_string(),
        });
    }
    let allowed_mime_types =
        parse_list_env("CASEDESK_ALLOWED_MIME_TYPES", &settings.allowed_mime_types)?;
    if allowed_mime_types.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "CASEDESK_ALLOWED_MIME_TYPES".to_string(),
            message: "at least one file type must be accepted".to_string(),
        });
    }
    Ok(UploadConfig {
        max_bytes,
        allowed_mime_types,
    })
}

fn resolve_logging(settings: &LoggingSettings) -> Result<LoggingConfig, ConfigError> {
    let format = match parse_string_env("CASEDESK_LOG_FORMAT", settings.format.clone())?
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "pretty" | "text" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        other => {
            return Err(ConfigError::InvalidValue {
                key: "CASEDESK_LOG_FORMAT".to_string(),
                message: format!("unsupported log format '{other}'"),
            });
        }
    };
    Ok(LoggingConfig {
        format,
        filter: settings.filter.clone(),
        ansi: parse_bool_env("CASEDESK_LOG_ANSI", settings.ansi)?,
    })
}

fn validate_storage_root(raw: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "CASEDESK_STORAGE_ROOT".to_string(),
            message: "storage root must not be empty".to_string(),
        });
    }

    let raw_path = PathBuf::from(trimmed);
    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::ParentDir => {
                return Err(ConfigError::InvalidValue {
                    key: "CASEDESK_STORAGE_ROOT".to_string(),
                    message: "storage root must not contain '..' components".to_string(),
                });
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "CASEDESK_STORAGE_ROOT".to_string(),
            message: "storage root must not be empty".to_string(),
        });
    }
    Ok(normalized)
}
