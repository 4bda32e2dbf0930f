pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Backend request timeout in seconds.
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    pub base_path: String,
    pub http_use_env_proxy: bool,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    base_path: String,
    #[serde(default)]
    http_use_env_proxy: bool,
}

/// `runtime_worker_threads: 4` pins the pool size, `runtime_worker_threads: ~`
/// leaves it to tokio.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            timeout: wire.timeout,
            runtime_worker_threads: match wire.runtime_worker_threads {
                Some(RuntimeThreadsSetting::Fixed(threads)) => Some(threads),
                Some(RuntimeThreadsSetting::Auto(())) | None => None,
            },
            base_path: wire.base_path,
            http_use_env_proxy: wire.http_use_env_proxy,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            runtime_worker_threads: None,
            base_path: String::new(),
            http_use_env_proxy: false,
        }
    }
}

/// One framed chat backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Regex rewrite applied to relayed content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Answer with the compacted conversation instead of calling a backend.
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_true")]
    pub enable_tool_calls: bool,
    #[serde(default)]
    pub rewrite_rules: Vec<RewriteRule>,
    /// Literal markers removed from relayed content, even when split across units.
    #[serde(default)]
    pub strip_markers: Vec<String>,
    #[serde(default)]
    pub tool_prompt_template: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            echo: false,
            enable_tool_calls: true,
            rewrite_rules: Vec::new(),
            strip_markers: Vec::new(),
            tool_prompt_template: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl AppConfig {
    /// Backend serving `model`: the first one listing it, else the default one.
    #[must_use]
    pub fn backend_for_model(&self, model: &str) -> Option<&BackendConfig> {
        self.backends
            .iter()
            .find(|backend| backend.models.iter().any(|listed| listed == model))
            .or_else(|| self.backends.iter().find(|backend| backend.is_default))
    }
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8000);
        assert!(!config.server.http_use_env_proxy);
        assert_eq!(config.backends.len(), 2);
        assert!(config.features.enable_tool_calls);
        assert!(!config.features.echo);
    }

    #[test]
    fn test_server_defaults_when_section_missing() {
        let config = parse_config(
            "backends:\n  - name: a\n    base_url: http://127.0.0.1:9000\n    models: [m]\n    is_default: true\n",
        )
        .unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.timeout, 180);
        assert_eq!(config.server.runtime_worker_threads, None);
        assert_eq!(config.features.log_level, "INFO");
    }

    #[test]
    fn test_runtime_worker_threads_null_means_auto() {
        let config = parse_config(
            "server:\n  runtime_worker_threads: ~\nbackends:\n  - name: a\n    base_url: http://127.0.0.1:9000\n    models: [m]\n",
        )
        .unwrap();
        assert_eq!(config.server.runtime_worker_threads, None);

        let config = parse_config(
            "server:\n  runtime_worker_threads: 2\nbackends:\n  - name: a\n    base_url: http://127.0.0.1:9000\n    models: [m]\n",
        )
        .unwrap();
        assert_eq!(config.server.runtime_worker_threads, Some(2));
    }

    #[test]
    fn test_backend_for_model_falls_back_to_default() {
        let config = parse_config(
            "backends:\n  - name: a\n    base_url: http://a.local\n    models: [alpha]\n  - name: b\n    base_url: http://b.local\n    models: [beta]\n    is_default: true\n",
        )
        .unwrap();
        assert_eq!(config.backend_for_model("alpha").map(|b| b.name.as_str()), Some("a"));
        assert_eq!(config.backend_for_model("gamma").map(|b| b.name.as_str()), Some("b"));
    }
}
