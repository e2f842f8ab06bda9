// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment and TOML configuration loading for the governance substrate.
//!
//! Two layers, matching the external interface contract:
//!
//! 1. **Required environment variables** (`MATHISON_STORE_BACKEND`,
//!    `MATHISON_STORE_PATH`) — the process refuses to boot if either is
//!    missing or the backend name is unrecognized ([`ErrorCode::StoreMisconfigured`](gov_errors::ErrorCode::StoreMisconfigured)).
//! 2. **Optional TOML tuning** ([`GovConfig`]) — operational knobs the spec
//!    leaves unspecified (HMAC secret location, default token TTL, receipt
//!    rotation threshold), layered on top of the required minimum.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the store backend (`FILE` or `SQLITE`).
pub const STORE_BACKEND_VAR: &str = "MATHISON_STORE_BACKEND";
/// Environment variable naming the store's root path or file.
pub const STORE_PATH_VAR: &str = "MATHISON_STORE_PATH";

/// Default per-segment rotation threshold for the file receipt store (4 MiB).
pub const DEFAULT_ROTATION_BYTES: u64 = 4 * 1024 * 1024;
/// Rotation thresholds below this many bytes are advisory-warned as too small.
pub const SMALL_ROTATION_THRESHOLD_BYTES: u64 = 4 * 1024;
/// Default token TTL in seconds when no TOML override is present (Invariant T1).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 300;
/// Token TTLs above this many seconds generate an advisory warning — the
/// spec's Invariant T1 caps the *default* at 5 minutes, not every token, but
/// an operator-configured default this large deserves a second look.
pub const LARGE_TOKEN_TTL_THRESHOLD_SECS: u64 = 3_600;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `MATHISON_STORE_BACKEND`/`MATHISON_STORE_PATH` are missing or invalid.
    /// Maps to response code `STORE_MISCONFIGURED`; the process must refuse
    /// to accept traffic.
    #[error("store misconfigured: {detail}")]
    StoreMisconfigured {
        /// Human-readable detail (which variable, and why).
        detail: String,
    },
    /// The requested TOML tuning file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation of the tuning layer failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The receipt rotation threshold is unusually small.
    SmallRotationThreshold {
        /// The configured threshold, in bytes.
        bytes: u64,
    },
    /// The default token TTL is unusually large.
    LargeDefaultTokenTtl {
        /// The configured TTL, in seconds.
        secs: u64,
    },
    /// No HMAC secret path was configured; the caller must initialize the
    /// key some other way (e.g. directly via `gov_crypto::init_hmac_key`)
    /// before any receipt is signed.
    MissingHmacSecretPath,
}

impl From<ConfigError> for gov_errors::GovError {
    fn from(err: ConfigError) -> Self {
        let code = match err {
            ConfigError::StoreMisconfigured { .. } => gov_errors::ErrorCode::StoreMisconfigured,
            ConfigError::FileNotFound { .. } | ConfigError::ParseError { .. } | ConfigError::ValidationError { .. } => {
                gov_errors::ErrorCode::Internal
            }
        };
        gov_errors::GovError::new(code, err.to_string())
    }
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SmallRotationThreshold { bytes } => {
                write!(f, "receipt rotation threshold is small ({bytes} bytes)")
            }
            Self::LargeDefaultTokenTtl { secs } => {
                write!(f, "default token TTL is large ({secs}s)")
            }
            Self::MissingHmacSecretPath => {
                write!(f, "no hmac_secret_path configured; the HMAC key must be initialized out-of-band")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store backend
// ---------------------------------------------------------------------------

/// Which durable receipt-store realization the process is configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreBackend {
    /// Segmented JSONL files, rotated by size.
    File,
    /// A single SQLite table guarded by append-only triggers.
    Sqlite,
}

impl StoreBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "FILE" => Some(Self::File),
            "SQLITE" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::File => "FILE",
            Self::Sqlite => "SQLITE",
        })
    }
}

/// The required minimum: which backend to use and where its store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEnv {
    /// The selected backend.
    pub backend: StoreBackend,
    /// The backend's root directory (file) or file path (SQLite).
    pub path: PathBuf,
}

/// Load and validate [`STORE_BACKEND_VAR`]/[`STORE_PATH_VAR`] from the
/// process environment.
///
/// # Errors
///
/// Returns [`ConfigError::StoreMisconfigured`] if either variable is absent
/// or the backend name is not `FILE`/`SQLITE`, matching the external
/// interface contract's "process refuses to boot" requirement.
pub fn load_store_env() -> Result<StoreEnv, ConfigError> {
    load_store_env_from(|key| std::env::var(key).ok())
}

/// Same as [`load_store_env`] but sourced from an arbitrary lookup function —
/// used by tests to avoid mutating the real process environment.
pub fn load_store_env_from(lookup: impl Fn(&str) -> Option<String>) -> Result<StoreEnv, ConfigError> {
    let raw_backend = lookup(STORE_BACKEND_VAR).ok_or_else(|| ConfigError::StoreMisconfigured {
        detail: format!("{STORE_BACKEND_VAR} is not set"),
    })?;
    let backend = StoreBackend::parse(raw_backend.trim()).ok_or_else(|| ConfigError::StoreMisconfigured {
        detail: format!("{STORE_BACKEND_VAR}={raw_backend:?} is not one of FILE, SQLITE"),
    })?;
    let raw_path = lookup(STORE_PATH_VAR).ok_or_else(|| ConfigError::StoreMisconfigured {
        detail: format!("{STORE_PATH_VAR} is not set"),
    })?;
    if raw_path.trim().is_empty() {
        return Err(ConfigError::StoreMisconfigured { detail: format!("{STORE_PATH_VAR} must not be empty") });
    }
    Ok(StoreEnv { backend, path: PathBuf::from(raw_path) })
}

// ---------------------------------------------------------------------------
// GovConfig (operational tuning)
// ---------------------------------------------------------------------------

/// Operational tuning layered on top of the required [`StoreEnv`].
///
/// Every field has a sensible default; the spec leaves all of them
/// unspecified, so a missing or absent TOML file is not an error.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct GovConfig {
    /// Path to a file holding the 32-byte HMAC secret (C1). `None` means the
    /// caller must initialize the key out-of-band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac_secret_path: Option<String>,
    /// Default capability-token TTL in seconds (Invariant T1: must stay
    /// `<= 300` to honor the spec's "default lifetime <= 5 minutes").
    #[serde(default = "default_token_ttl_secs")]
    pub default_token_ttl_secs: u64,
    /// Receipt-store segment rotation threshold in bytes (file realization).
    #[serde(default = "default_rotation_bytes")]
    pub receipt_rotation_bytes: u64,
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_rotation_bytes() -> u64 {
    DEFAULT_ROTATION_BYTES
}

impl Default for GovConfig {
    fn default() -> Self {
        Self {
            hmac_secret_path: None,
            default_token_ttl_secs: default_token_ttl_secs(),
            receipt_rotation_bytes: default_rotation_bytes(),
        }
    }
}

/// Load a [`GovConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`GovConfig::default()`].
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] if `path` is `Some` and the file
/// does not exist, or [`ConfigError::ParseError`] if it is not valid TOML.
pub fn load_gov_config(path: Option<&Path>) -> Result<GovConfig, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .map_err(|_| ConfigError::FileNotFound { path: p.display().to_string() })?;
            parse_toml(&content)
        }
        None => Ok(GovConfig::default()),
    }
}

/// Parse a TOML string into a [`GovConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] if `content` is not valid TOML or does
/// not match the expected shape.
pub fn parse_toml(content: &str) -> Result<GovConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
}

/// Validate a [`GovConfig`], returning advisory warnings.
///
/// Hard errors (zero TTL, zero rotation threshold) come back as
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if any hard constraint is violated.
pub fn validate_gov_config(config: &GovConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.default_token_ttl_secs == 0 {
        errors.push("default_token_ttl_secs must be positive".to_string());
    } else if config.default_token_ttl_secs > LARGE_TOKEN_TTL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeDefaultTokenTtl { secs: config.default_token_ttl_secs });
    }

    if config.receipt_rotation_bytes == 0 {
        errors.push("receipt_rotation_bytes must be positive".to_string());
    } else if config.receipt_rotation_bytes < SMALL_ROTATION_THRESHOLD_BYTES {
        warnings.push(ConfigWarning::SmallRotationThreshold { bytes: config.receipt_rotation_bytes });
    }

    if config.hmac_secret_path.is_none() {
        warnings.push(ConfigWarning::MissingHmacSecretPath);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Read the HMAC secret bytes from [`GovConfig::hmac_secret_path`], if set.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] if a path is configured but the
/// file cannot be read.
pub fn read_hmac_secret(config: &GovConfig) -> Result<Option<Vec<u8>>, ConfigError> {
    match &config.hmac_secret_path {
        None => Ok(None),
        Some(p) => {
            let bytes = std::fs::read(p).map_err(|_| ConfigError::FileNotFound { path: p.clone() })?;
            Ok(Some(bytes))
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn store_env_loads_valid_file_backend() {
        let env = env_map(&[(STORE_BACKEND_VAR, "FILE"), (STORE_PATH_VAR, "/var/lib/gov/receipts")]);
        let result = load_store_env_from(|k| env.get(k).cloned()).unwrap();
        assert_eq!(result.backend, StoreBackend::File);
        assert_eq!(result.path, PathBuf::from("/var/lib/gov/receipts"));
    }

    #[test]
    fn store_env_loads_valid_sqlite_backend() {
        let env = env_map(&[(STORE_BACKEND_VAR, "SQLITE"), (STORE_PATH_VAR, "/var/lib/gov/receipts.db")]);
        let result = load_store_env_from(|k| env.get(k).cloned()).unwrap();
        assert_eq!(result.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn store_env_rejects_missing_backend() {
        let env = env_map(&[(STORE_PATH_VAR, "/tmp/x")]);
        let err = load_store_env_from(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::StoreMisconfigured { .. }));
    }

    #[test]
    fn store_env_rejects_missing_path() {
        let env = env_map(&[(STORE_BACKEND_VAR, "FILE")]);
        let err = load_store_env_from(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::StoreMisconfigured { .. }));
    }

    #[test]
    fn store_env_rejects_unrecognized_backend() {
        let env = env_map(&[(STORE_BACKEND_VAR, "POSTGRES"), (STORE_PATH_VAR, "/tmp/x")]);
        let err = load_store_env_from(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::StoreMisconfigured { .. }));
    }

    #[test]
    fn store_env_rejects_empty_path() {
        let env = env_map(&[(STORE_BACKEND_VAR, "FILE"), (STORE_PATH_VAR, "   ")]);
        let err = load_store_env_from(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::StoreMisconfigured { .. }));
    }

    #[test]
    #[serial]
    fn store_env_reads_real_process_environment() {
        // SAFETY: serialized via #[serial] so no concurrent test observes
        // a half-set environment.
        unsafe {
            std::env::set_var(STORE_BACKEND_VAR, "FILE");
            std::env::set_var(STORE_PATH_VAR, "/tmp/gov-test-receipts");
        }
        let result = load_store_env().unwrap();
        assert_eq!(result.backend, StoreBackend::File);
        unsafe {
            std::env::remove_var(STORE_BACKEND_VAR);
            std::env::remove_var(STORE_PATH_VAR);
        }
    }

    #[test]
    fn default_gov_config_is_valid_with_one_warning() {
        let cfg = GovConfig::default();
        let warnings = validate_gov_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::MissingHmacSecretPath));
    }

    #[test]
    fn parse_toml_overrides_defaults() {
        let toml_str = r#"
            hmac_secret_path = "/etc/gov/hmac.key"
            default_token_ttl_secs = 120
            receipt_rotation_bytes = 1048576
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.hmac_secret_path.as_deref(), Some("/etc/gov/hmac.key"));
        assert_eq!(cfg.default_token_ttl_secs, 120);
        assert_eq!(cfg.receipt_rotation_bytes, 1_048_576);
    }

    #[test]
    fn parse_empty_toml_uses_defaults() {
        let cfg = parse_toml("").unwrap();
        assert_eq!(cfg.default_token_ttl_secs, DEFAULT_TOKEN_TTL_SECS);
        assert_eq!(cfg.receipt_rotation_bytes, DEFAULT_ROTATION_BYTES);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_rejects_zero_ttl() {
        let cfg = GovConfig { default_token_ttl_secs: 0, ..GovConfig::default() };
        let err = validate_gov_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_rejects_zero_rotation() {
        let cfg = GovConfig { receipt_rotation_bytes: 0, ..GovConfig::default() };
        let err = validate_gov_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_warns_on_small_rotation_threshold() {
        let cfg = GovConfig {
            hmac_secret_path: Some("/etc/gov/hmac.key".into()),
            receipt_rotation_bytes: 100,
            ..GovConfig::default()
        };
        let warnings = validate_gov_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::SmallRotationThreshold { bytes: 100 }));
    }

    #[test]
    fn validation_warns_on_large_default_ttl() {
        let cfg = GovConfig {
            hmac_secret_path: Some("/etc/gov/hmac.key".into()),
            default_token_ttl_secs: 7200,
            ..GovConfig::default()
        };
        let warnings = validate_gov_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::LargeDefaultTokenTtl { secs: 7200 }));
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_gov_config(Some(Path::new("/nonexistent/gov.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_gov_config(None).unwrap();
        assert_eq!(cfg, GovConfig::default());
    }

    #[test]
    fn load_from_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gov.toml");
        std::fs::write(&path, "default_token_ttl_secs = 60\n").unwrap();
        let cfg = load_gov_config(Some(&path)).unwrap();
        assert_eq!(cfg.default_token_ttl_secs, 60);
    }

    #[test]
    fn read_hmac_secret_returns_none_when_unset() {
        let cfg = GovConfig::default();
        assert_eq!(read_hmac_secret(&cfg).unwrap(), None);
    }

    #[test]
    fn read_hmac_secret_reads_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmac.key");
        std::fs::write(&path, b"a-32-byte-secret-value-padded!!!").unwrap();
        let cfg = GovConfig { hmac_secret_path: Some(path.display().to_string()), ..GovConfig::default() };
        let secret = read_hmac_secret(&cfg).unwrap().unwrap();
        assert_eq!(secret, b"a-32-byte-secret-value-padded!!!".to_vec());
    }

    #[test]
    fn read_hmac_secret_errors_on_missing_file() {
        let cfg = GovConfig { hmac_secret_path: Some("/nonexistent/hmac.key".into()), ..GovConfig::default() };
        let err = read_hmac_secret(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn store_backend_display_matches_wire_names() {
        assert_eq!(StoreBackend::File.to_string(), "FILE");
        assert_eq!(StoreBackend::Sqlite.to_string(), "SQLITE");
    }

    #[test]
    fn store_misconfigured_maps_to_matching_error_code() {
        let err = ConfigError::StoreMisconfigured { detail: "missing var".to_string() };
        let gov_err: gov_errors::GovError = err.into();
        assert_eq!(gov_err.code, gov_errors::ErrorCode::StoreMisconfigured);
    }
}
