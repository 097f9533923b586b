use crate::observability::LogLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

type ConfigMap = Map<String, Value>;

/// What the binary does with a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    Execute,
    Tune,
    ValidateResults,
    ValidateDatabase,
    CreateValidation,
}

impl FromStr for DriverMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "execute" => Ok(DriverMode::Execute),
            "tune" | "automatic" => Ok(DriverMode::Tune),
            "validate_results" => Ok(DriverMode::ValidateResults),
            "validate_database" => Ok(DriverMode::ValidateDatabase),
            "create_validation" | "create_validation_params" => Ok(DriverMode::CreateValidation),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Name of a registered component plus its free-form properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(default)]
    pub properties: Value,
}

impl ComponentSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: Value::Null,
        }
    }
}

/// Settings of the throughput search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningConfig {
    /// Length of each bounded probe in the coarse phase.
    pub estimate_test_time_ms: u64,
    /// The search stops once `hi - lo` drops below this.
    pub tolerance: f64,
    pub ratio_min: f64,
    pub ratio_max: f64,
    /// Fine phase searches `[best, best * fine_expansion]`.
    pub fine_expansion: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            estimate_test_time_ms: 5 * 60 * 1_000,
            tolerance: 1e-5,
            ratio_min: 1e-9,
            ratio_max: 1.0,
            fine_expansion: 5.0,
        }
    }
}

/// Complete driver configuration, loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub name: String,
    pub mode: DriverMode,
    pub connector: ComponentSpec,
    pub workload: ComponentSpec,
    /// Measured operations; `None` runs the stream to exhaustion.
    pub operation_count: Option<u64>,
    pub warmup_count: u64,
    pub skip_count: u64,
    pub thread_count: usize,
    pub queue_capacity: usize,
    pub status_display_interval_ms: u64,
    pub time_compression_ratio: f64,
    pub ignore_scheduled_start_times: bool,
    pub spinner_sleep_ms: u64,
    pub dependency_wait_timeout_ms: u64,
    pub start_delay_ms: u64,
    pub results_dir: Option<PathBuf>,
    pub flush_log: bool,
    pub record_delayed_operations: bool,
    /// Cases read by `validate_database` and written by `create_validation`.
    pub database_validation_file: Option<PathBuf>,
    pub validation_parameters_size: u64,
    pub validation_serialization_check: bool,
    /// Results log analyzed by `validate_results`; defaults to the one in
    /// `results_dir`.
    pub results_log: Option<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub tuning: TuningConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "finbench".to_string(),
            mode: DriverMode::Execute,
            connector: ComponentSpec::named("dummy"),
            workload: ComponentSpec::named("synthetic"),
            operation_count: None,
            warmup_count: 0,
            skip_count: 0,
            thread_count: 1,
            queue_capacity: 1_000,
            status_display_interval_ms: 2_000,
            time_compression_ratio: 1.0,
            ignore_scheduled_start_times: false,
            spinner_sleep_ms: 100,
            dependency_wait_timeout_ms: 60_000,
            start_delay_ms: 5_000,
            results_dir: None,
            flush_log: false,
            record_delayed_operations: true,
            database_validation_file: None,
            validation_parameters_size: 1_000,
            validation_serialization_check: true,
            results_log: None,
            log_level: "info".to_string(),
            log_file: None,
            tuning: TuningConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Parses and validates a JSON document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: DriverConfig =
            serde_json::from_value(value).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value =
            serde_json::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merges a JSON patch over this configuration and re-validates the
    /// result. Returns the sorted dotted keys that changed.
    pub fn patch(&mut self, patch: Value) -> Result<Vec<String>, ConfigError> {
        let patch_map = patch
            .as_object()
            .cloned()
            .ok_or_else(|| ConfigError::InvalidPatch("patch must be a JSON object".into()))?;
        let mut next = match self.to_value() {
            Value::Object(map) => map,
            _ => ConfigMap::new(),
        };
        let mut changed = BTreeMap::new();
        merge_map(&mut next, &patch_map, "", &mut changed);
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        *self = Self::from_value(Value::Object(next))?;
        Ok(changed.into_keys().collect())
    }

    /// Applies `key=value` overrides; dotted keys address nested sections.
    /// Values parse as JSON and fall back to plain strings.
    pub fn apply_overrides<'a>(
        &mut self,
        overrides: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, ConfigError> {
        let mut patch = ConfigMap::new();
        for entry in overrides {
            let (key, raw) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidOverride(entry.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidOverride(entry.to_string()));
            }
            let value = serde_json::from_str(raw.trim())
                .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
            insert_dotted(&mut patch, key, value);
        }
        self.patch(Value::Object(patch))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::Invalid("thread_count must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if !(self.time_compression_ratio > 0.0 && self.time_compression_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "time_compression_ratio must be within (0, 1], got {}",
                self.time_compression_ratio
            )));
        }
        if self.spinner_sleep_ms == 0 {
            return Err(ConfigError::Invalid("spinner_sleep_ms must be > 0".into()));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        LogLevel::from_str(&self.log_level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log_level '{}'", self.log_level)))?;
        let tuning = &self.tuning;
        if !(tuning.ratio_min > 0.0 && tuning.ratio_min < tuning.ratio_max && tuning.ratio_max <= 1.0) {
            return Err(ConfigError::Invalid(
                "tuning bounds must satisfy 0 < ratio_min < ratio_max <= 1".into(),
            ));
        }
        if !(tuning.tolerance > 0.0) {
            return Err(ConfigError::Invalid("tuning.tolerance must be > 0".into()));
        }
        if tuning.fine_expansion < 1.0 {
            return Err(ConfigError::Invalid("tuning.fine_expansion must be >= 1".into()));
        }
        match self.mode {
            DriverMode::ValidateDatabase if self.database_validation_file.is_none() => Err(
                ConfigError::Invalid("validate_database mode needs database_validation_file".into()),
            ),
            DriverMode::CreateValidation if self.database_validation_file.is_none() => Err(
                ConfigError::Invalid("create_validation mode needs database_validation_file".into()),
            ),
            DriverMode::CreateValidation if self.validation_parameters_size == 0 => Err(
                ConfigError::Invalid("validation_parameters_size must be > 0".into()),
            ),
            DriverMode::ValidateResults if self.results_log.is_none() && self.results_dir.is_none() => {
                Err(ConfigError::Invalid(
                    "validate_results mode needs results_log or results_dir".into(),
                ))
            }
            // Probes are judged from the persisted results log.
            DriverMode::Tune if self.results_dir.is_none() => {
                Err(ConfigError::Invalid("tune mode needs results_dir".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_str(&self.log_level).unwrap_or(LogLevel::Info)
    }

    pub fn spinner_sleep(&self) -> Duration {
        Duration::from_millis(self.spinner_sleep_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_display_interval_ms)
    }

    pub fn dependency_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_wait_timeout_ms)
    }
}

fn insert_dotted(map: &mut ConfigMap, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(ConfigMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(ConfigMap::new());
            }
            if let Value::Object(inner) = entry {
                insert_dotted(inner, rest, value);
            }
        }
    }
}

// Nested objects merge key by key; every other value replaces.
fn merge_map(
    base: &mut ConfigMap,
    patch: &ConfigMap,
    prefix: &str,
    changed: &mut BTreeMap<String, ()>,
) {
    for (key, value) in patch {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let entry = base.entry(key.clone()).or_insert(Value::Null);
        match (entry, value) {
            (Value::Object(inner), Value::Object(patch_inner)) => {
                merge_map(inner, patch_inner, &path, changed);
            }
            (entry, value) => {
                if entry != value {
                    *entry = value.clone();
                    changed.insert(path, ());
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Parse(String),
    #[error("invalid config patch: {0}")]
    InvalidPatch(String),
    #[error("override '{0}' is not key=value")]
    InvalidOverride(String),
    #[error("unknown mode '{0}'")]
    UnknownMode(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
