use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MachinistError, Result};

/// Top-level Machinist configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
}

/// LLM endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ModelConfig {
    /// Copy of this config with a different sampling temperature.
    pub fn with_temperature(&self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.3
}

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30_000
}

/// Workflow limits and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-turn ceiling on recoverable step failures. Reaching it routes the
    /// turn to synthesis with whatever results accumulated so far.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Upper bound on answer confidence for a degraded turn.
    #[serde(default = "default_degraded_confidence_cap")]
    pub degraded_confidence_cap: f64,
    /// Corrective synthesis retries after a failed validation.
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    /// Longest plan the planner may produce.
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    /// How many prior messages are carried into a turn.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_planner_temperature")]
    pub planner_temperature: f32,
    #[serde(default = "default_synthesis_temperature")]
    pub synthesis_temperature: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            degraded_confidence_cap: default_degraded_confidence_cap(),
            max_repair_attempts: default_max_repair_attempts(),
            max_plan_steps: default_max_plan_steps(),
            history_window: default_history_window(),
            planner_temperature: default_planner_temperature(),
            synthesis_temperature: default_synthesis_temperature(),
        }
    }
}

fn default_retry_ceiling() -> u32 {
    3
}
fn default_degraded_confidence_cap() -> f64 {
    0.35
}
fn default_max_repair_attempts() -> u32 {
    2
}
fn default_max_plan_steps() -> usize {
    5
}
fn default_history_window() -> usize {
    20
}
fn default_planner_temperature() -> f32 {
    0.1
}
fn default_synthesis_temperature() -> f32 {
    0.3
}

/// Persistence and retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_manuals_dir")]
    pub manuals_dir: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Passages returned per lookup.
    #[serde(default = "default_search_k")]
    pub search_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            manuals_dir: default_manuals_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            search_k: default_search_k(),
        }
    }
}

fn default_db_path() -> String {
    "machinist.db".to_string()
}
fn default_manuals_dir() -> String {
    "manuals".to_string()
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_search_k() -> usize {
    3
}

/// Web search tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    pub api_key: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MachinistError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| MachinistError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.memory.db_path)
    }

    /// Resolve the manuals directory (expand ~).
    pub fn manuals_dir(&self) -> PathBuf {
        expand_home(&self.memory.manuals_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
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
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [model]
            model_id = "phi-3-mini-4k-instruct"
            "#,
        )
        .unwrap();

        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.max_tokens, 2048);
        assert_eq!(config.orchestrator.retry_ceiling, 3);
        assert_eq!(config.orchestrator.max_repair_attempts, 2);
        assert!(config.orchestrator.degraded_confidence_cap < 0.4);
        assert_eq!(config.memory.chunk_size, 1000);
        assert_eq!(config.memory.chunk_overlap, 200);
        assert_eq!(config.memory.search_k, 3);
        assert!(config.web_search.is_none());
    }

    #[test]
    fn test_orchestrator_overrides() {
        let config: AppConfig = toml::from_str(
            r#"
            [model]
            model_id = "m"

            [orchestrator]
            retry_ceiling = 5
            degraded_confidence_cap = 0.25
            max_plan_steps = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.retry_ceiling, 5);
        assert_eq!(config.orchestrator.degraded_confidence_cap, 0.25);
        assert_eq!(config.orchestrator.max_plan_steps, 3);
        // Untouched fields keep defaults
        assert_eq!(config.orchestrator.history_window, 20);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("MACHINIST_TEST_VAR", "value-123");
        let out = expand_env_vars("key = \"${MACHINIST_TEST_VAR}\"");
        assert_eq!(out, "key = \"value-123\"");
        std::env::remove_var("MACHINIST_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing_kept() {
        let out = expand_env_vars("key = \"${MACHINIST_UNSET_VAR}\"");
        assert_eq!(out, "key = \"${MACHINIST_UNSET_VAR}\"");
    }

    #[test]
    fn test_with_temperature() {
        let config: AppConfig = toml::from_str("[model]\nmodel_id = \"m\"").unwrap();
        let planner = config.model.with_temperature(0.1);
        assert_eq!(planner.temperature, 0.1);
        assert_eq!(planner.model_id, config.model.model_id);
    }
}
