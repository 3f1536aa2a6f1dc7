use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::types::StageName;

/// Top-level rfpflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Stage services keyed by stage name (`[stages.rfp_analyzer]`).
    #[serde(default)]
    pub stages: BTreeMap<String, StageEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound for a single stage call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    /// Upper bound for a whole run (0 = no deadline).
    #[serde(default = "default_run_deadline")]
    pub run_deadline_secs: u64,
    /// Recorded on stored insights.
    #[serde(default = "default_model_used")]
    pub model_used: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout(),
            run_deadline_secs: default_run_deadline(),
            model_used: default_model_used(),
        }
    }
}

fn default_stage_timeout() -> u64 { 120 }
fn default_run_deadline() -> u64 { 900 }
fn default_model_used() -> String { "unspecified".to_string() }

/// Run registry retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of run records kept in memory (LRU eviction).
    #[serde(default = "default_registry_capacity")]
    pub capacity: usize,
    /// Records older than this are treated as gone.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_registry_capacity(),
            ttl_secs: None,
        }
    }
}

fn default_registry_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding documents and insights.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String { "~/.rfpflow/rfpflow.db".to_string() }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.rfpflow/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-stage, 3 = per-stage with detail (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// A stage implemented by an HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEndpointConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides `workflow.stage_timeout_secs` for this stage.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WorkflowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references and validating
    /// stage names.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WorkflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for name in self.stages.keys() {
            if StageName::from_name(name).is_none() {
                return Err(WorkflowError::Config(format!(
                    "Unknown stage '{}' in [stages]",
                    name
                )));
            }
        }
        if self.registry.capacity == 0 {
            return Err(WorkflowError::Config(
                "registry.capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Endpoint configured for a stage, if any.
    pub fn stage_endpoint(&self, stage: StageName) -> Option<&StageEndpointConfig> {
        self.stages.get(stage.as_str())
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database)
    }

    /// Resolve the JSONL log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.rfpflow/logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    tracing::warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.workflow.stage_timeout_secs, 120);
        assert_eq!(config.workflow.run_deadline_secs, 900);
        assert_eq!(config.registry.capacity, 256);
        assert!(config.registry.ttl_secs.is_none());
        assert!(config.log.is_none());
        assert!(config.stages.is_empty());
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let err = AppConfig::parse(
            r#"
[stages.summarizer]
endpoint = "http://localhost:9000"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = AppConfig::parse("[registry]\ncapacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("RFPFLOW_TEST_STAGE_KEY", "sk-stage");
        let config = AppConfig::parse(
            r#"
[stages.rfp_analyzer]
endpoint = "http://localhost:9000/analyze"
api_key = "${RFPFLOW_TEST_STAGE_KEY}"
"#,
        )
        .unwrap();
        let stage = config.stage_endpoint(StageName::RfpAnalyzer).unwrap();
        assert_eq!(stage.api_key.as_deref(), Some("sk-stage"));
    }

    #[test]
    fn test_unset_env_var_kept_verbatim() {
        assert_eq!(
            expand_env_vars("key = \"${RFPFLOW_SURELY_UNSET_VAR}\""),
            "key = \"${RFPFLOW_SURELY_UNSET_VAR}\""
        );
    }

    #[test]
    fn test_database_path_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let config = AppConfig::default();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/home/tester/.rfpflow/rfpflow.db")
        );
    }
}
