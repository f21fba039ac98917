//! Configuration for tidemark jobs
//!
//! A config file describes one extraction job plus the collaborators it runs
//! with:
//!
//! ```yaml
//! job:
//!   connection:
//!     host: localhost
//!     user: app
//!     password: ${DB_PASSWORD}
//!     database: shop
//!   table: orders
//!   key_columns: [id]
//! retry:
//!   max_attempts: 5
//! watermark_store:
//!   type: file
//!   dir: /var/lib/tidemark
//! emitter:
//!   type: jsonl
//!   dir: /var/lib/tidemark/out
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing. Unknown fields are rejected.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tidemark_rdbc::connection::ConnectionConfig;
use tidemark_rdbc::security::validate_sql_identifier;
use validator::Validate;

use crate::engine::{JobOptions, Mode};
use crate::retry::BackoffPolicy;
use crate::source::TableRef;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// A string that is redacted whenever it is printed or serialized
///
/// ```rust
/// use tidemark::config::SensitiveString;
///
/// let secret = SensitiveString::new("hunter2");
/// assert_eq!(format!("{secret:?}"), "[REDACTED]");
/// assert_eq!(secret.expose_secret(), "hunter2");
/// ```
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// The plain value; only for handing to the driver
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TidemarkConfig {
    /// The extraction job
    pub job: JobConfig,

    /// Backoff for transient query failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where watermarks are persisted
    #[serde(default)]
    pub watermark_store: WatermarkStoreConfig,

    /// Where batches are delivered
    #[serde(default)]
    pub emitter: EmitterConfig,

    /// Consecutive failed watermark writes tolerated before the job fails
    #[serde(default = "default_max_watermark_write_failures")]
    pub max_watermark_write_failures: u32,
}

fn default_max_watermark_write_failures() -> u32 {
    5
}

/// Source database connection
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Database host
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Database port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Login user
    #[validate(length(min = 1))]
    pub user: String,

    /// Login password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Database (MySQL schema) holding the table
    #[validate(length(min = 1, max = 64))]
    pub database: String,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 100, max = 300_000))]
    pub connect_timeout_ms: u64,

    /// Per-query timeout in milliseconds (0 = none)
    #[serde(default)]
    pub query_timeout_ms: u64,
}

fn default_port() -> u16 {
    3306
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl ConnectionSettings {
    /// Driver-level connection configuration
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(&self.host, self.port, &self.database)
            .with_credentials(
                &self.user,
                self.password.as_ref().map(|p| p.expose_secret().to_string()),
            )
            .with_connect_timeout(self.connect_timeout_ms)
            .with_query_timeout(self.query_timeout_ms)
    }
}

/// One extraction job
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Source connection
    #[validate(nested)]
    pub connection: ConnectionSettings,

    /// Table to extract
    #[validate(length(min = 1, max = 64))]
    pub table: String,

    /// Schema qualifier; defaults to the connection's database
    #[serde(default)]
    pub schema: Option<String>,

    /// Projection; empty selects every column
    #[serde(default)]
    pub columns: Vec<String>,

    /// Ordering key; defaults to the table's primary key
    #[serde(default)]
    pub key_columns: Option<Vec<String>>,

    /// Rows per poll
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: u64,

    /// Disable the row limit entirely
    #[serde(default)]
    pub unbounded: bool,

    /// Pause between polls in continuous mode
    #[serde(default)]
    pub poll_interval_ms: u64,

    /// Stop at the end of the table or keep polling
    #[serde(default)]
    pub mode: Mode,
}

fn default_batch_size() -> u64 {
    100_000
}

impl JobConfig {
    /// Identity the watermark is stored under: `host:port/database/table`,
    /// or `host:port/database/schema.table` when a schema is set
    pub fn identity(&self) -> String {
        let table = match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        };
        format!(
            "{}:{}/{}/{}",
            self.connection.host, self.connection.port, self.connection.database, table
        )
    }

    /// Fully qualified source table
    pub fn table_ref(&self) -> TableRef {
        let schema = self
            .schema
            .clone()
            .unwrap_or_else(|| self.connection.database.clone());
        TableRef::new(&self.table).with_schema(schema)
    }

    /// Row limit per poll, `None` when unbounded
    pub fn limit(&self) -> Option<u64> {
        (!self.unbounded).then_some(self.batch_size)
    }

    fn validate_identifiers(&self) -> anyhow::Result<()> {
        let check = |what: &str, name: &str| {
            validate_sql_identifier(name)
                .map_err(|e| anyhow::anyhow!("invalid {} '{}': {}", what, name, e))
        };

        check("table", &self.table)?;
        check("database", &self.connection.database)?;
        if let Some(schema) = &self.schema {
            check("schema", schema)?;
        }
        for column in &self.columns {
            check("column", column.trim())?;
        }
        for key in self.key_columns.iter().flatten() {
            if !key.trim().is_empty() {
                check("key column", key.trim())?;
            }
        }
        Ok(())
    }

    fn validate_keys_in_projection(&self) -> anyhow::Result<()> {
        if self.columns.is_empty() {
            return Ok(());
        }
        for key in self.key_columns.iter().flatten().map(|k| k.trim()) {
            if key.is_empty() {
                continue;
            }
            if !self.columns.iter().any(|c| c.trim().eq_ignore_ascii_case(key)) {
                anyhow::bail!(
                    "key column '{}' must be part of the configured columns",
                    key
                );
            }
        }
        Ok(())
    }
}

/// Backoff settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per query, including the first
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    #[validate(range(min = 1))]
    pub initial_delay_ms: u64,

    /// Upper bound for a single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Backoff policy described by these settings
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
    }
}

/// Watermark store backend
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WatermarkStoreConfig {
    /// Process-local, lost on exit
    Memory,
    /// One JSON file per job in `dir`
    File {
        /// Directory holding the watermark files
        dir: PathBuf,
    },
}

impl Default for WatermarkStoreConfig {
    fn default() -> Self {
        Self::File {
            dir: PathBuf::from("./tidemark-state"),
        }
    }
}

/// Emitter backend
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum EmitterConfig {
    /// JSON lines on standard output
    #[default]
    Stdout,
    /// One `.jsonl` file per batch below `dir`
    Jsonl {
        /// Output directory
        dir: PathBuf,
    },
}

impl TidemarkConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate ranges, identifiers and cross-field constraints
    pub fn validate(&self) -> anyhow::Result<()> {
        Validate::validate(&self.job).map_err(|e| anyhow::anyhow!("Invalid job: {}", e))?;
        Validate::validate(&self.retry).map_err(|e| anyhow::anyhow!("Invalid retry: {}", e))?;

        self.job.validate_identifiers()?;
        self.job.validate_keys_in_projection()?;

        self.retry
            .to_policy()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid retry: {}", e))?;

        if self.max_watermark_write_failures == 0 {
            anyhow::bail!("max_watermark_write_failures must be at least 1");
        }
        if self.job.mode == Mode::OneShot && self.job.poll_interval_ms > 0 {
            tracing::warn!("poll_interval_ms has no effect in one_shot mode");
        }
        Ok(())
    }

    /// Engine options for the configured job
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            job_id: self.job.identity(),
            table: self.job.table_ref(),
            columns: self
                .job
                .columns
                .iter()
                .map(|c| c.trim().to_string())
                .collect(),
            key_columns: self.job.key_columns.clone(),
            limit: self.job.limit(),
            mode: self.job.mode,
            poll_interval: Duration::from_millis(self.job.poll_interval_ms),
            backoff: self.retry.to_policy(),
            max_watermark_write_failures: self.max_watermark_write_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
job:
  connection:
    host: db.internal
    user: extractor
    database: shop
  table: orders
"#;

    #[test]
    fn test_defaults() {
        let config = TidemarkConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.job.connection.port, 3306);
        assert_eq!(config.job.batch_size, 100_000);
        assert_eq!(config.job.limit(), Some(100_000));
        assert_eq!(config.job.mode, Mode::OneShot);
        assert_eq!(config.max_watermark_write_failures, 5);
        assert_eq!(config.retry.to_policy(), BackoffPolicy::default());
        assert_eq!(config.emitter, EmitterConfig::Stdout);
        assert_eq!(config.job.identity(), "db.internal:3306/shop/orders");
        assert_eq!(config.job.table_ref().to_string(), "shop.orders");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
job:
  connection:
    host: localhost
    port: 3307
    user: app
    password: s3cret
    database: shop
  table: orders
  columns: [id, customer_id, total]
  key_columns: [id]
  batch_size: 500
  poll_interval_ms: 250
  mode: continuous
retry:
  max_attempts: 3
  initial_delay_ms: 100
  max_delay_ms: 1000
  multiplier: 3.0
watermark_store:
  type: memory
emitter:
  type: jsonl
  dir: /tmp/out
max_watermark_write_failures: 2
"#;
        let config = TidemarkConfig::from_yaml(yaml).unwrap();
        let options = config.job_options();
        assert_eq!(options.job_id, "localhost:3307/shop/orders");
        assert_eq!(options.limit, Some(500));
        assert_eq!(options.mode, Mode::Continuous);
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert_eq!(options.backoff.max_attempts, 3);
        assert_eq!(options.max_watermark_write_failures, 2);
        assert_eq!(config.watermark_store, WatermarkStoreConfig::Memory);
        assert_eq!(
            config.emitter,
            EmitterConfig::Jsonl {
                dir: PathBuf::from("/tmp/out")
            }
        );

        let conn = config.job.connection.to_connection_config();
        assert_eq!(conn.password.as_deref(), Some("s3cret"));
        assert_eq!(conn.port, 3307);
    }

    #[test]
    fn test_schema_is_part_of_identity() {
        let archive = format!("{MINIMAL}  schema: archive\n");
        let staging = format!("{MINIMAL}  schema: staging\n");
        let archive = TidemarkConfig::from_yaml(&archive).unwrap();
        let staging = TidemarkConfig::from_yaml(&staging).unwrap();
        let default = TidemarkConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(archive.job.identity(), "db.internal:3306/shop/archive.orders");
        assert_ne!(archive.job.identity(), staging.job.identity());
        assert_ne!(archive.job.identity(), default.job.identity());
        assert_eq!(archive.job_options().job_id, archive.job.identity());
        assert_eq!(archive.job.table_ref().to_string(), "archive.orders");
    }

    #[test]
    fn test_unbounded_disables_limit() {
        let yaml = format!("{MINIMAL}  unbounded: true\n");
        let config = TidemarkConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.job.limit(), None);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = format!("{MINIMAL}  batchsize: 10\n");
        assert!(TidemarkConfig::from_yaml(&yaml).is_err());

        let yaml = format!("{MINIMAL}extra: true\n");
        assert!(TidemarkConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let yaml = format!("{MINIMAL}  batch_size: 0\n");
        assert!(TidemarkConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_key_outside_projection_rejected() {
        let yaml = format!("{MINIMAL}  columns: [total]\n  key_columns: [id]\n");
        let err = TidemarkConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("key column 'id'"), "{err}");
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let yaml = MINIMAL.replace("table: orders", "table: \"orders; DROP TABLE x\"");
        assert!(TidemarkConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_non_growing_backoff_rejected() {
        let yaml = format!("{MINIMAL}retry:\n  multiplier: 1.0\n");
        let err = TidemarkConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("multiplier"), "{err}");
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TIDEMARK_TEST_DB_HOST", "replica-2");
        let expanded = TidemarkConfig::expand_env_vars(
            "host: ${TIDEMARK_TEST_DB_HOST}\nport: ${TIDEMARK_TEST_UNSET_PORT:-3307}\nuser: ${TIDEMARK_TEST_UNSET_USER}",
        );
        assert_eq!(expanded, "host: replica-2\nport: 3307\nuser: ");
    }

    #[test]
    fn test_password_redacted() {
        let yaml = MINIMAL.replace("user: extractor", "user: extractor\n    password: hunter2");
        let config = TidemarkConfig::from_yaml(&yaml).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        let dumped = serde_yaml::to_string(&config).unwrap();
        assert!(!dumped.contains("hunter2"));
        assert!(dumped.contains("***REDACTED***"));
    }
}
