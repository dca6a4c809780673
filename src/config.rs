//! Configuration management for Quarry.
//!
//! Handles loading configuration from a TOML file and `QUARRY_*` environment
//! variables. The resulting [`EngineConfig`] is validated once and then owned,
//! unchanged, by the engine.

use crate::error::{QuarryError, Result};
use crate::result::{DateFields, Parallelism};
use crate::service::MAX_PAGE_SIZE;
use crate::storage::S3Path;
use crate::template::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Where query results are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// Create a table from the query and read its Parquet objects.
    #[default]
    Objects,
    /// Page through the service's result set.
    Pages,
}

/// Object storage backend for result objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    /// A local directory standing in for buckets, see `storage_root`.
    Local,
    Memory,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workgroup queries run under.
    #[serde(default)]
    pub workgroup: String,

    /// `s3://` location results and created tables are written to.
    #[serde(default)]
    pub output_location: String,

    /// Database for created tables and statements. Defaults to the workgroup.
    #[serde(default)]
    pub database: Option<String>,

    /// Result workers: 1 inline, -1 all execution units, n > 1 fixed.
    #[serde(default = "default_worker_count")]
    pub worker_count: i64,

    #[serde(default)]
    pub debug: bool,

    /// Seconds between status polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Columns parsed as timestamps.
    #[serde(default = "default_date_fields")]
    pub date_fields: Vec<String>,

    /// Rows per result page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub result_source: ResultSource,

    #[serde(default = "default_region")]
    pub region: String,

    /// Query service endpoint. Defaults to the regional Athena endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Price per TiB scanned, for cost estimates.
    #[serde(default = "default_price_per_tib_usd")]
    pub price_per_tib_usd: f64,

    #[serde(default)]
    pub storage: StorageBackend,

    /// Root directory of the `local` storage backend.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
}

fn default_worker_count() -> i64 {
    1
}

fn default_poll_interval_secs() -> f64 {
    5.0
}

fn default_date_fields() -> Vec<String> {
    vec![
        "date".to_string(),
        "event_date".to_string(),
        "report_date".to_string(),
    ]
}

fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_price_per_tib_usd() -> f64 {
    5.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workgroup: String::new(),
            output_location: String::new(),
            database: None,
            worker_count: default_worker_count(),
            debug: false,
            poll_interval_secs: default_poll_interval_secs(),
            date_fields: default_date_fields(),
            page_size: default_page_size(),
            result_source: ResultSource::default(),
            region: default_region(),
            endpoint: None,
            price_per_tib_usd: default_price_per_tib_usd(),
            storage: StorageBackend::default(),
            storage_root: None,
        }
    }
}

impl EngineConfig {
    /// Creates a config with the two required settings and defaults for the rest.
    pub fn new(workgroup: impl Into<String>, output_location: impl Into<String>) -> Self {
        Self {
            workgroup: workgroup.into(),
            output_location: output_location.into(),
            ..Self::default()
        }
    }

    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quarry")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| QuarryError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            QuarryError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Loads the file (or the default path), then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let mut config = Self::load_from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `QUARRY_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QUARRY_WORKGROUP") {
            self.workgroup = v;
        }
        if let Some(v) = lookup("QUARRY_OUTPUT_LOCATION") {
            self.output_location = v;
        }
        if let Some(v) = lookup("QUARRY_DATABASE") {
            self.database = Some(v);
        }
        if let Some(v) = lookup("QUARRY_WORKER_COUNT") {
            self.worker_count = v.trim().parse().map_err(|_| {
                QuarryError::config(format!("QUARRY_WORKER_COUNT is not an integer: {v:?}"))
            })?;
        }
        if let Some(v) = lookup("QUARRY_DEBUG") {
            self.debug = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(v) = lookup("QUARRY_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Some(v) = lookup("QUARRY_REGION") {
            self.region = v;
        }
        Ok(())
    }

    /// Checks every setting the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.workgroup.trim().is_empty() {
            return Err(QuarryError::config("workgroup is required"));
        }
        if self.output_location.trim().is_empty() {
            return Err(QuarryError::config("output_location is required"));
        }
        self.output_path()?;
        self.parallelism()?;

        let database = self.database();
        if !is_valid_identifier(database) {
            return Err(QuarryError::config(format!(
                "database '{database}' is not a valid identifier"
            )));
        }

        if !(self.poll_interval_secs.is_finite() && self.poll_interval_secs > 0.0) {
            return Err(QuarryError::config(format!(
                "poll_interval_secs must be positive, got {}",
                self.poll_interval_secs
            )));
        }
        if let Err(e) = Duration::try_from_secs_f64(self.poll_interval_secs) {
            return Err(QuarryError::config(format!(
                "poll_interval_secs {} is out of range: {e}",
                self.poll_interval_secs
            )));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(QuarryError::config(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if !(self.price_per_tib_usd.is_finite() && self.price_per_tib_usd >= 0.0) {
            return Err(QuarryError::config("price_per_tib_usd must not be negative"));
        }

        let endpoint = self.endpoint_url();
        let url = Url::parse(&endpoint)
            .map_err(|e| QuarryError::config(format!("Invalid endpoint '{endpoint}': {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(QuarryError::config(format!(
                "Invalid endpoint scheme '{}'. Expected 'http' or 'https'",
                url.scheme()
            )));
        }

        if self.storage == StorageBackend::Local && self.storage_root.is_none() {
            return Err(QuarryError::config(
                "storage_root is required for the local storage backend",
            ));
        }
        Ok(())
    }

    /// Database for created tables and statements.
    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.workgroup)
    }

    /// Falls back to the default for values `validate()` rejects.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_poll_interval_secs()))
    }

    pub fn output_path(&self) -> Result<S3Path> {
        S3Path::parse(&self.output_location)
    }

    pub fn parallelism(&self) -> Result<Parallelism> {
        Parallelism::from_worker_count(self.worker_count)
    }

    pub fn date_fields(&self) -> DateFields {
        DateFields::new(&self.date_fields)
    }

    /// Configured endpoint, or the public endpoint of `region`.
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://athena.{}.amazonaws.com", self.region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> EngineConfig {
        EngineConfig::new("analytics", "s3://query-results/athena/")
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
workgroup = "analytics"
output_location = "s3://query-results/athena/"
worker_count = -1
poll_interval_secs = 0.5
date_fields = ["day"]
result_source = "pages"
storage = "local"
storage_root = "/tmp/quarry"
"#;

        let config = EngineConfig::parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.workgroup, "analytics");
        assert_eq!(config.worker_count, -1);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.result_source, ResultSource::Pages);
        assert_eq!(config.storage, StorageBackend::Local);
        assert!(config.date_fields().contains("day"));
        assert!(!config.date_fields().contains("date"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unrepresentable_poll_interval() {
        let mut config = EngineConfig::new("analytics", "s3://results/athena");
        config.poll_interval_secs = 1e30;
        assert!(matches!(config.validate(), Err(QuarryError::Config(_))));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::parse_toml("", Path::new("test.toml")).unwrap();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.result_source, ResultSource::Objects);
        assert_eq!(config.storage, StorageBackend::S3);
        assert_eq!(config.price_per_tib_usd, 5.0);
        assert!(config.date_fields().contains("event_date"));
        assert_eq!(config.endpoint_url(), "https://athena.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = EngineConfig::parse_toml("worker_count = \"many\"", Path::new("bad.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let config = EngineConfig::load_from_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(config.workgroup.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workgroup = \"wg\"\noutput_location = \"s3://b/p\"\n").unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.workgroup, "wg");
        assert_eq!(config.output_path().unwrap().bucket(), "b");
    }

    #[test]
    fn test_database_defaults_to_workgroup() {
        let mut config = valid();
        assert_eq!(config.database(), "analytics");
        config.database = Some("reporting".to_string());
        assert_eq!(config.database(), "reporting");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QUARRY_WORKGROUP", "from_env"),
            ("QUARRY_WORKER_COUNT", "8"),
            ("QUARRY_DEBUG", "true"),
            ("QUARRY_REGION", "eu-west-1"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.workgroup, "from_env");
        assert_eq!(config.worker_count, 8);
        assert!(config.debug);
        assert_eq!(config.endpoint_url(), "https://athena.eu-west-1.amazonaws.com");
        assert_eq!(config.output_location, "s3://query-results/athena/");
    }

    #[test]
    fn test_env_worker_count_must_be_integer() {
        let mut config = valid();
        let err = config
            .apply_env(|key| (key == "QUARRY_WORKER_COUNT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(valid().validate().is_ok());

        let cases: Vec<(&str, Box<dyn Fn(&mut EngineConfig)>)> = vec![
            ("workgroup", Box::new(|c: &mut EngineConfig| c.workgroup.clear())),
            ("output_location", Box::new(|c: &mut EngineConfig| c.output_location.clear())),
            ("S3 URL", Box::new(|c: &mut EngineConfig| c.output_location = "/tmp/out".into())),
            ("worker_count", Box::new(|c: &mut EngineConfig| c.worker_count = 0)),
            ("worker_count", Box::new(|c: &mut EngineConfig| c.worker_count = -3)),
            ("database", Box::new(|c: &mut EngineConfig| c.database = Some("bad db".into()))),
            ("poll_interval_secs", Box::new(|c: &mut EngineConfig| c.poll_interval_secs = 0.0)),
            ("out of range", Box::new(|c: &mut EngineConfig| c.poll_interval_secs = 1e30)),
            ("page_size", Box::new(|c: &mut EngineConfig| c.page_size = 5000)),
            ("endpoint", Box::new(|c: &mut EngineConfig| c.endpoint = Some("not a url".into()))),
            ("scheme", Box::new(|c: &mut EngineConfig| c.endpoint = Some("ftp://proxy".into()))),
            ("storage_root", Box::new(|c: &mut EngineConfig| c.storage = StorageBackend::Local)),
        ];

        for (expected, mutate) in cases {
            let mut config = valid();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "expected '{expected}' in: {err}"
            );
        }
    }
}
