use std::path::PathBuf;
use std::time::Duration;

use taskmine_core::recompute::DEFAULT_TOLERANCE_PCT;
use taskmine_core::schema::SCHEMA_CACHE_TTL;

const DEFAULT_PORT: u16 = 5000;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// `(dataset name, file name inside data_dir)`
    pub dataset_files: Vec<(String, String)>,
    pub log_dir: PathBuf,
    pub tolerance_pct: f64,
    pub enable_tracing: bool,
    pub schema_cache_ttl: Duration,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let tolerance_pct = get("TOLERANCE_PCT", "")
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite() && *t >= 0.0)
            .unwrap_or(DEFAULT_TOLERANCE_PCT);

        let schema_cache_ttl = get("SCHEMA_CACHE_TTL_SECS", "")
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(SCHEMA_CACHE_TTL);

        Self {
            data_dir: PathBuf::from(get("TASKMINE_DATA_DIR", "./data")),
            dataset_files: vec![
                ("salesforce".to_string(), get("SALESFORCE_DATA_FILE", "salesforce.json")),
                ("amadeus".to_string(), get("AMADEUS_DATA_FILE", "amadeus.json")),
            ],
            log_dir: PathBuf::from(get("LOG_DIR", "./logs")),
            tolerance_pct,
            enable_tracing: matches!(
                get("ENABLE_TRACING", "true").to_lowercase().as_str(),
                "true" | "1" | "yes"
            ),
            schema_cache_ttl,
            port: get("PORT", "").parse().unwrap_or(DEFAULT_PORT),
        }
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.log_dir.join("traces")
    }

    pub fn kpi_dir(&self) -> PathBuf {
        self.log_dir.join("kpis")
    }
}
