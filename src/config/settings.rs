//! On-disk settings file (`casedesk.toml`).
//!
//! Every section is optional; missing keys take the defaults below. Secrets
//! are never read from this file, only from the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

pub const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/jpg",
    "image/png",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub uploads: UploadSettings,
    pub audit: AuditSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: String,
    pub libsql_path: Option<String>,
    pub libsql_url: Option<String>,
    pub recent_activity_days: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            libsql_path: None,
            libsql_url: None,
            recent_activity_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: String,
    pub root: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "fs".to_string(),
            root: "storage/documents".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub trail_limit: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self { trail_limit: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: String,
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
            filter: "casedesk=info".to_string(),
            ansi: true,
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_unset_keys() {
        let settings = Settings::from_toml(
            "[uploads]\nmax_bytes = 2048\n\n[database]\nbackend = \"memory\"\n",
        )
        .expect("parse");

        assert_eq!(settings.uploads.max_bytes, 2048);
        assert_eq!(
            settings.uploads.allowed_mime_types.len(),
            DEFAULT_ALLOWED_MIME_TYPES.len()
        );
        assert_eq!(settings.database.backend, "memory");
        assert_eq!(settings.database.recent_activity_days, 7);
        assert_eq!(settings.audit.trail_limit, 50);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let err = Settings::from_toml("[uploads\nmax_bytes = 1").expect_err("must fail");
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
