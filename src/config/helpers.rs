//! Environment lookups shared by the config resolvers.
//!
//! Every helper names the offending key in its error so a bad `.env` line is
//! easy to find.

use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

pub(crate) fn parse_string_env(key: &str, default: String) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or(default))
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => parse_bool(key, &raw),
        None => Ok(default),
    }
}

pub(crate) fn parse_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(key)? {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected an unsigned integer: {e}"),
            }),
        None => Ok(default),
    }
}

/// Comma-separated list; blank entries are dropped.
pub(crate) fn parse_list_env(key: &str, default: &[String]) -> Result<Vec<String>, ConfigError> {
    match optional_env(key)? {
        Some(raw) => Ok(parse_csv(&raw)),
        None => Ok(default.to_vec()),
    }
}

pub(crate) fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("K", "Yes").expect("yes"));
        assert!(!parse_bool("K", " off ").expect("off"));
        let err = parse_bool("CASEDESK_FLAG", "maybe").expect_err("must reject");
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "CASEDESK_FLAG");
    }

    #[test]
    fn parse_csv_trims_lowercases_and_drops_blanks() {
        assert_eq!(
            parse_csv(" application/PDF, ,image/png,"),
            vec!["application/pdf".to_string(), "image/png".to_string()]
        );
    }

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let key = "CASEDESK_TEST_KEY_THAT_IS_NEVER_SET";
        assert_eq!(parse_u64_env(key, 7).expect("default"), 7);
        assert_eq!(
            parse_string_env(key, "fallback".to_string()).expect("default"),
            "fallback"
        );
        assert!(parse_bool_env(key, true).expect("default"));
    }
}
