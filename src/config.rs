//! Runtime settings
//!
//! Defaults, overridden by environment variables (the CLI loads `.env` first),
//! overridden in turn by command-line flags.
//!
//! | Variable                      | Default                     |
//! |-------------------------------|-----------------------------|
//! | `CODEACT_WORKSPACE_DIR`       | `agent_workspace`           |
//! | `LLM_MODEL_NAME`              | `ollama:qwen3`              |
//! | `OLLAMA_URL`                  | `http://localhost:11434`    |
//! | `OPENAI_BASE_URL`             | `https://api.openai.com/v1` |
//! | `OPENAI_API_KEY`              | unset                       |
//! | `CODEACT_PYTHON`              | `python3`                   |
//! | `CODEACT_EXEC_TIMEOUT_MS`     | `30000`                     |
//! | `CODEACT_MAX_OUTPUT_CHARS`    | `20000`                     |
//! | `CODEACT_MAX_STEPS`           | `5`                         |
//! | `CODEACT_RUNS_DIR`            | `~/.codeact/runs`           |
//! | `CODEACT_LOG_JSON`            | `false`                     |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset (no export)           |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::agent::{CycleConfig, RunStore};
use crate::session::{RegistryConfig, WorkerSettings};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Parent directory of every session workspace
    pub workspace_dir: PathBuf,
    /// `provider:model`
    pub model: String,
    pub ollama_url: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    /// HTTP timeout for one model call
    pub request_timeout: Duration,
    pub python_command: String,
    pub exec_timeout_ms: u64,
    pub max_output_chars: usize,
    pub max_steps: usize,
    pub runs_dir: PathBuf,
    pub log_json: bool,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("agent_workspace"),
            model: "ollama:qwen3".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            request_timeout: Duration::from_secs(300),
            python_command: "python3".to_string(),
            exec_timeout_ms: 30_000,
            max_output_chars: 20_000,
            max_steps: 5,
            runs_dir: RunStore::default_dir(),
            log_json: false,
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Self::default();

        if let Some(dir) = text("CODEACT_WORKSPACE_DIR") {
            settings.workspace_dir = PathBuf::from(dir);
        }
        if let Some(model) = text("LLM_MODEL_NAME") {
            settings.model = model;
        }
        if let Some(url) = text("OLLAMA_URL") {
            settings.ollama_url = url;
        }
        if let Some(url) = text("OPENAI_BASE_URL") {
            settings.openai_base_url = url;
        }
        settings.openai_api_key = text("OPENAI_API_KEY");
        if let Some(python) = text("CODEACT_PYTHON") {
            settings.python_command = python;
        }
        if let Some(dir) = text("CODEACT_RUNS_DIR") {
            settings.runs_dir = PathBuf::from(dir);
        }
        settings.otlp_endpoint = text("OTEL_EXPORTER_OTLP_ENDPOINT");

        settings.exec_timeout_ms = parse_or(
            "CODEACT_EXEC_TIMEOUT_MS",
            text("CODEACT_EXEC_TIMEOUT_MS"),
            settings.exec_timeout_ms,
        );
        settings.max_output_chars = parse_or(
            "CODEACT_MAX_OUTPUT_CHARS",
            text("CODEACT_MAX_OUTPUT_CHARS"),
            settings.max_output_chars,
        );
        settings.max_steps = parse_or(
            "CODEACT_MAX_STEPS",
            text("CODEACT_MAX_STEPS"),
            settings.max_steps,
        );
        settings.log_json = parse_or("CODEACT_LOG_JSON", text("CODEACT_LOG_JSON"), false);

        settings
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            python_command: self.python_command.clone(),
            exec_timeout: Duration::from_millis(self.exec_timeout_ms),
            max_output_chars: self.max_output_chars,
            ..WorkerSettings::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            base_dir: self.workspace_dir.clone(),
            worker: self.worker_settings(),
            ..RegistryConfig::default()
        }
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            max_steps: self.max_steps,
            ..CycleConfig::default()
        }
    }
}

/// Parse `raw`, keeping `default` when it is missing, malformed or zero-like
fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if value != T::default() || raw == "false" => value,
        _ => {
            warn!(key, value = %raw, "Ignoring invalid setting");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]);
        assert_eq!(settings.workspace_dir, PathBuf::from("agent_workspace"));
        assert_eq!(settings.model, "ollama:qwen3");
        assert_eq!(settings.exec_timeout_ms, 30_000);
        assert_eq!(settings.max_steps, 5);
        assert!(settings.openai_api_key.is_none());
        assert!(settings.otlp_endpoint.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let settings = settings_from(&[
            ("CODEACT_WORKSPACE_DIR", "/srv/ws"),
            ("LLM_MODEL_NAME", "openai:gpt-4o-mini"),
            ("OPENAI_API_KEY", "sk-test"),
            ("CODEACT_EXEC_TIMEOUT_MS", "1500"),
            ("CODEACT_MAX_STEPS", "12"),
            ("CODEACT_LOG_JSON", "true"),
        ]);
        assert_eq!(settings.workspace_dir, PathBuf::from("/srv/ws"));
        assert_eq!(settings.model, "openai:gpt-4o-mini");
        assert_eq!(settings.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.worker_settings().exec_timeout, Duration::from_millis(1500));
        assert_eq!(settings.cycle_config().max_steps, 12);
        assert!(settings.log_json);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let settings = settings_from(&[
            ("CODEACT_EXEC_TIMEOUT_MS", "soon"),
            ("CODEACT_MAX_OUTPUT_CHARS", "-5"),
            ("CODEACT_MAX_STEPS", "0"),
            ("OPENAI_API_KEY", "   "),
        ]);
        assert_eq!(settings.exec_timeout_ms, 30_000);
        assert_eq!(settings.max_output_chars, 20_000);
        assert_eq!(settings.max_steps, 5);
        assert!(settings.openai_api_key.is_none());
    }

    #[test]
    fn test_registry_config_carries_worker_settings() {
        let settings = settings_from(&[("CODEACT_PYTHON", "uv run python")]);
        let registry = settings.registry_config();
        assert_eq!(registry.worker.python_command, "uv run python");
        assert!(registry.max_sessions.is_none());
    }
}
