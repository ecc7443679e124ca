//! Library and CLI configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MIMETRUST_CONFIG` (environment variable)
//! 2. `~/.config/mimetrust/config.toml` (Linux/macOS)
//!    `%APPDATA%\mimetrust\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! The library never reads this file on its own: callers hand the relevant
//! section (`MimeConfig`, `StashConfig`, `PkixConfig`) to the constructors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// MIME parser limits and leniency switches.
    pub mime: MimeConfig,
    /// Part stash storage.
    pub stash: StashConfig,
    /// Certificate validation and revocation checking.
    pub pkix: PkixConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// MIME parser limits and leniency switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MimeConfig {
    /// Maximum bytes of preamble skipped before the first boundary.
    pub preamble_max_size: usize,
    /// Maximum size of a single part's header block.
    pub headers_max_size: usize,
    /// Maximum size of the first part's body (0 = unlimited).
    pub first_part_max_bytes: u64,
    /// Hand out part bodies without undoing their Content-Transfer-Encoding.
    pub raw_parts: bool,
    /// Compare the `start` parameter with Content-ID ignoring angle brackets.
    pub lax_start_param: bool,
    /// Treat a multipart body with no parts as a single empty part.
    pub lax_empty_multipart: bool,
    /// Fail on unknown charsets instead of falling back to `default_charset`.
    pub strict_charset: bool,
    /// Charset assumed when a Content-Type names none or an unknown one.
    pub default_charset: String,
    /// Read and stash the whole message as soon as it is opened.
    pub always_validate: bool,
}

/// Part stash storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Bytes kept in memory by the hybrid stash before spilling to disk.
    pub memory_limit: u64,
    /// Spill directory (defaults to the system temp directory).
    pub dir: Option<PathBuf>,
}

/// Certificate validation and revocation checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkixConfig {
    /// Also trust the platform's root certificates.
    pub use_default_anchors: bool,
    /// Critical extension OIDs accepted in addition to the built-in set.
    pub permitted_critical_extensions: Vec<String>,
    /// Number of revocation-checker pipelines kept.
    pub checker_cache_size: usize,
    pub crl_min_age_secs: u64,
    pub crl_max_age_secs: u64,
    /// Used when a CRL has no nextUpdate.
    pub crl_default_age_secs: u64,
    pub ocsp_min_age_secs: u64,
    pub ocsp_max_age_secs: u64,
    /// Used when an OCSP response has no nextUpdate.
    pub ocsp_default_age_secs: u64,
    /// Refresh this long before a CRL or OCSP response expires.
    pub early_retrieval_secs: u64,
    /// Send a nonce with OCSP requests.
    pub ocsp_use_nonce: bool,
    /// Validation level per facility: "validate", "validatepath" or "revocation".
    pub facilities: BTreeMap<String, String>,
}

impl PkixConfig {
    /// Cache age bounds for CRLs.
    pub fn crl_ages(&self) -> CacheAges {
        CacheAges {
            min: Duration::from_secs(self.crl_min_age_secs),
            max: Duration::from_secs(self.crl_max_age_secs),
            default: Duration::from_secs(self.crl_default_age_secs),
            early_retrieval: Duration::from_secs(self.early_retrieval_secs),
        }
    }

    /// Cache age bounds for OCSP responses.
    pub fn ocsp_ages(&self) -> CacheAges {
        CacheAges {
            min: Duration::from_secs(self.ocsp_min_age_secs),
            max: Duration::from_secs(self.ocsp_max_age_secs),
            default: Duration::from_secs(self.ocsp_default_age_secs),
            early_retrieval: Duration::from_secs(self.early_retrieval_secs),
        }
    }
}

/// Freshness bounds for one revocation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAges {
    pub min: Duration,
    pub max: Duration,
    pub default: Duration,
    pub early_retrieval: Duration,
}

impl CacheAges {
    /// How long an artifact valid for `remaining` more time may be served.
    ///
    /// `None` means the artifact carries no expiry of its own.
    pub fn time_to_live(&self, remaining: Option<Duration>) -> Duration {
        match remaining {
            None => self.default.clamp(self.min, self.max.max(self.min)),
            Some(left) => left
                .saturating_sub(self.early_retrieval)
                .clamp(self.min, self.max.max(self.min)),
        }
    }
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for MimeConfig {
    fn default() -> Self {
        Self {
            preamble_max_size: 32 * 1024, // 32 KB
            headers_max_size: 32 * 1024,  // 32 KB
            first_part_max_bytes: 0,
            raw_parts: false,
            lax_start_param: false,
            lax_empty_multipart: false,
            strict_charset: false,
            default_charset: "ISO-8859-1".to_string(),
            always_validate: false,
        }
    }
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            memory_limit: 512 * 1024, // 512 KB
            dir: None,
        }
    }
}

impl Default for PkixConfig {
    fn default() -> Self {
        Self {
            use_default_anchors: false,
            permitted_critical_extensions: Vec::new(),
            checker_cache_size: 1000,
            crl_min_age_secs: 60,
            crl_max_age_secs: 24 * 60 * 60,
            crl_default_age_secs: 60 * 60,
            ocsp_min_age_secs: 60,
            ocsp_max_age_secs: 24 * 60 * 60,
            ocsp_default_age_secs: 60 * 60,
            early_retrieval_secs: 60,
            ocsp_use_nonce: true,
            facilities: BTreeMap::new(),
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MIMETRUST_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mimetrust").join("config.toml"))
}

/// Return the cache directory used for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mimetrust")
}

/// Directory the hybrid stash spills into.
pub fn stash_dir(config: &StashConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.mime.preamble_max_size, 32 * 1024);
        assert_eq!(cfg.mime.headers_max_size, 32 * 1024);
        assert!(!cfg.mime.lax_empty_multipart);
        assert_eq!(cfg.pkix.checker_cache_size, 1000);
        assert!(cfg.pkix.ocsp_use_nonce);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let mut cfg = Config::default();
        cfg.pkix
            .facilities
            .insert("routing".to_string(), "revocation".to_string());
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.mime.default_charset, cfg.mime.default_charset);
        assert_eq!(parsed.stash.memory_limit, cfg.stash.memory_limit);
        assert_eq!(
            parsed.pkix.facilities.get("routing").map(String::as_str),
            Some("revocation")
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[mime]
lax_start_param = true

[pkix]
crl_max_age_secs = 600
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert!(cfg.mime.lax_start_param);
        assert_eq!(cfg.pkix.crl_max_age_secs, 600);
        // Other fields use defaults
        assert_eq!(cfg.mime.headers_max_size, 32 * 1024);
        assert_eq!(cfg.pkix.ocsp_max_age_secs, 24 * 60 * 60);
    }

    #[test]
    fn test_time_to_live_is_clamped() {
        let ages = PkixConfig::default().crl_ages();
        // Expires in 30s: minus 60s early retrieval, then clamped up to min.
        assert_eq!(
            ages.time_to_live(Some(Duration::from_secs(30))),
            Duration::from_secs(60)
        );
        // Expires in a week: clamped down to max.
        assert_eq!(
            ages.time_to_live(Some(Duration::from_secs(7 * 24 * 3600))),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            ages.time_to_live(Some(Duration::from_secs(3600))),
            Duration::from_secs(3540)
        );
        assert_eq!(ages.time_to_live(None), Duration::from_secs(3600));
    }
}
