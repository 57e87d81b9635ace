//! Configuration loading for WSI services
//!
//! TOML config with load-or-default semantics: a missing file yields the
//! compiled defaults, a malformed file is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub logging: LoggingConfig,
    pub import: ImportTuning,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. "info" or "wsi_ingest=debug"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Import pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportTuning {
    /// Concurrent parse-worker loops per phase
    pub max_concurrent_rows: usize,
    /// Starting bulk-write batch size
    pub batch_save_start: usize,
    /// Adaptive batch-size floor
    pub batch_save_min: usize,
    /// Adaptive batch-size ceiling
    pub batch_save_max: usize,
    /// How many years back to load same-identity history
    pub years_back: usize,
    /// Uploader sleep when its queues are empty but parsing is ongoing (ms)
    pub uploader_idle_ms: u64,
    /// Delay before a completed job's progress entry is garbage-collected (s)
    pub progress_gc_secs: u64,
    /// Score-weights cache TTL (s)
    pub weights_ttl_secs: u64,
    /// Wait between rescore bulk-patch retries (ms)
    pub rescore_retry_ms: u64,
    /// Collect revalidation paths only for imports smaller than this
    pub revalidate_row_cap: usize,
}

impl Default for ImportTuning {
    fn default() -> Self {
        ImportTuning {
            max_concurrent_rows: 20,
            batch_save_start: 60,
            batch_save_min: 40,
            batch_save_max: 100,
            years_back: 20,
            uploader_idle_ms: 1000,
            progress_gc_secs: 10,
            weights_ttl_secs: 10,
            rescore_retry_ms: 100,
            revalidate_row_cap: 50,
        }
    }
}

/// Fuzzy-matching thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum similarity for a CSV header to map to a canonical field
    pub column_similarity_threshold: f64,
    /// Minimum similarity for two company names to resolve to one place
    pub company_similarity_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            column_similarity_threshold: 0.92,
            company_similarity_threshold: 0.9,
        }
    }
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Write configuration to a TOML file (parent directories created).
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Initialize tracing with an env-filter directive (tests and binaries).
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_toml_config(Path::new("/does/not/exist.toml")).unwrap();
        assert_eq!(config.import.max_concurrent_rows, 20);
        assert_eq!(config.import.batch_save_start, 60);
        assert_eq!(config.matching.column_similarity_threshold, 0.92);
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsi.toml");

        let mut config = TomlConfig::default();
        config.import.batch_save_start = 80;
        config.logging.level = "debug".to_string();
        write_toml_config(&config, &path).unwrap();

        let loaded = load_toml_config(&path).unwrap();
        assert_eq!(loaded.import.batch_save_start, 80);
        assert_eq!(loaded.logging.level, "debug");
        // Untouched values keep defaults
        assert_eq!(loaded.import.batch_save_min, 40);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str("[import]\nmax_concurrent_rows = 4\n").unwrap();
        assert_eq!(config.import.max_concurrent_rows, 4);
        assert_eq!(config.import.batch_save_max, 100);
    }
}
