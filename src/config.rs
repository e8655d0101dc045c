/// Layered configuration
///
/// Sources, lowest precedence first:
/// 1. Built-in defaults
/// 2. A TOML file (explicit path, or `opguard.toml` in the platform config dir)
/// 3. Environment variables `OPGUARD__SECTION__KEY`
///
/// Durations are written as human strings such as `"250ms"` or `"1m 30s"`;
/// bare integers are read as seconds.
use crate::error::CoordinatorSettings;
use crate::retry::{PolicyRegistry, RetryPolicy, DEFAULT_ATTEMPT_LOG_CAPACITY};
use crate::{OpguardError, OpguardResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "opguard.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "OPGUARD";

/// Serde helpers for `Duration` as humantime strings
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Seconds(u64),
    }

    impl Repr {
        fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
            match self {
                Repr::Text(text) => humantime::parse_duration(text.trim()).map_err(E::custom),
                Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            }
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Repr::deserialize(deserializer)?.into_duration()
    }

    pub mod option {
        use super::Repr;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<Repr>::deserialize(deserializer)?
                .map(Repr::into_duration)
                .transpose()
        }
    }
}

/// Retry section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fallback policy for unknown operation types
    pub default: RetryPolicy,

    /// Extra or overriding policies by operation type
    pub policies: HashMap<String, RetryPolicy>,

    /// Install the built-in presets before `policies`
    pub presets: bool,

    /// Recent attempts kept by the engine
    pub attempt_log_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: RetryPolicy::default(),
            policies: HashMap::new(),
            presets: true,
            attempt_log_capacity: DEFAULT_ATTEMPT_LOG_CAPACITY,
        }
    }
}

impl RetryConfig {
    /// Build the policy registry described by this section
    pub fn build_registry(&self) -> OpguardResult<PolicyRegistry> {
        let registry = if self.presets {
            PolicyRegistry::with_presets()
        } else {
            PolicyRegistry::new(RetryPolicy::default())
        };
        registry.set_default(self.default.clone())?;

        for (operation_type, policy) in &self.policies {
            let mut policy = policy.clone();
            policy.operation_type = operation_type.clone();
            registry.set_policy(policy)?;
        }
        Ok(registry)
    }
}

/// Checkpoint section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub max_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: crate::checkpoint::DEFAULT_MAX_CHECKPOINTS,
        }
    }
}

/// Orchestrator section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Finished operations kept in history
    pub history_limit: usize,

    /// Timeout applied to operations started without one
    #[serde(with = "duration_format::option")]
    pub default_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_limit: crate::cancellation::DEFAULT_HISTORY_LIMIT,
            default_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Worker pool section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of blocking workers; defaults to the CPU count
    pub size: Option<usize>,
}

impl WorkerPoolConfig {
    pub fn effective_size(&self) -> usize {
        self.size.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Audit log section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,

    /// Database file; defaults to `audit.db` in the platform data dir
    pub path: Option<PathBuf>,
}

impl AuditConfig {
    pub fn effective_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("audit.db"))
                .unwrap_or_else(|| PathBuf::from("opguard-audit.db"))
        })
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Also write daily-rotated log files here
    pub directory: Option<PathBuf>,

    /// File name prefix for rotated logs
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            file_prefix: "opguard.log".to_string(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpguardConfig {
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub orchestrator: OrchestratorConfig,
    pub coordinator: CoordinatorSettings,
    pub worker_pool: WorkerPoolConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

impl OpguardConfig {
    /// Load from defaults, an optional file and the environment
    ///
    /// An explicit `path` must exist; the platform default file is optional.
    pub fn load(path: Option<&Path>) -> OpguardResult<Self> {
        let defaults = ::config::Config::try_from(&OpguardConfig::default())?;
        let mut builder = ::config::Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(OpguardError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                builder = builder.add_source(::config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    tracing::debug!(path = %default_path.display(), "Looking for config file");
                    builder =
                        builder.add_source(::config::File::from(default_path).required(false));
                }
            }
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: OpguardConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the types cannot express
    pub fn validate(&self) -> OpguardResult<()> {
        self.retry.default.validate()?;
        for (operation_type, policy) in &self.retry.policies {
            policy.validate().map_err(|e| match e {
                OpguardError::Config(message) => {
                    OpguardError::Config(format!("policy '{}': {}", operation_type, message))
                }
                other => other,
            })?;
        }
        if self.checkpoint.max_checkpoints == 0 {
            return Err(OpguardError::Config(
                "checkpoint.max_checkpoints must be at least 1".to_string(),
            ));
        }
        if self.coordinator.history_limit == 0 {
            return Err(OpguardError::Config(
                "coordinator.history_limit must be at least 1".to_string(),
            ));
        }
        if self.worker_pool.size == Some(0) {
            return Err(OpguardError::Config(
                "worker_pool.size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "opguard", "opguard")
}

/// `opguard.toml` in the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::retry::BackoffStrategy;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timing {
        #[serde(with = "duration_format")]
        delay: Duration,
        #[serde(with = "duration_format::option", default)]
        timeout: Option<Duration>,
    }

    #[test]
    fn test_duration_format_roundtrip() {
        let timing = Timing {
            delay: Duration::from_millis(1500),
            timeout: None,
        };
        let json = serde_json::to_string(&timing).unwrap();
        assert_eq!(json, r#"{"delay":"1s 500ms","timeout":null}"#);
        assert_eq!(serde_json::from_str::<Timing>(&json).unwrap(), timing);
    }

    #[test]
    fn test_duration_format_accepts_seconds() {
        let timing: Timing = serde_json::from_str(r#"{"delay": 3, "timeout": "2m"}"#).unwrap();
        assert_eq!(timing.delay, Duration::from_secs(3));
        assert_eq!(timing.timeout, Some(Duration::from_secs(120)));

        assert!(serde_json::from_str::<Timing>(r#"{"delay": "soon"}"#).is_err());
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[retry.default]
max_attempts = 5
base_delay = "200ms"

[retry.policies.search]
max_attempts = 2
backoff = "fibonacci"

[checkpoint]
max_checkpoints = 10

[coordinator.category_thresholds]
network = 3
"#
        )
        .unwrap();

        let config = OpguardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.retry.default.max_attempts, 5);
        assert_eq!(config.retry.default.base_delay, Duration::from_millis(200));
        assert_eq!(config.checkpoint.max_checkpoints, 10);
        assert_eq!(
            config.coordinator.category_thresholds.get(&ErrorCategory::Network),
            Some(&3)
        );
        // untouched keys keep their defaults
        assert_eq!(
            config.coordinator.category_thresholds.get(&ErrorCategory::Coordination),
            Some(&5)
        );
        assert_eq!(config.orchestrator.default_timeout, Some(Duration::from_secs(300)));

        let registry = config.retry.build_registry().unwrap();
        let search = registry.get("search");
        assert_eq!(search.operation_type, "search");
        assert_eq!(search.backoff, BackoffStrategy::Fibonacci);
        assert_eq!(registry.get("unknown").max_attempts, 5);
        assert!(registry.contains("external_api"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = OpguardConfig::load(Some(Path::new("/nonexistent/opguard.toml"))).unwrap_err();
        assert!(matches!(err, OpguardError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = OpguardConfig::default();
        assert!(config.validate().is_ok());
        config.worker_pool.size = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_pool_size_defaults_to_cpus() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.effective_size(), num_cpus::get().max(1));
        assert_eq!(WorkerPoolConfig { size: Some(3) }.effective_size(), 3);
    }
}
