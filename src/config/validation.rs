use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_backends(config)?;
    validate_log_level(config)?;
    validate_rewrite_rules(config)?;
    validate_prompt_template(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    let base_path = server.base_path.trim();
    if !base_path.is_empty() && !base_path.starts_with('/') {
        return Err(validation_err("server.base_path must start with '/'"));
    }
    Ok(())
}

fn validate_backends(config: &AppConfig) -> Result<(), ConfigError> {
    if config.backends.is_empty() {
        return Err(validation_err("backends cannot be empty"));
    }

    let mut names = HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        if backend.name.trim().is_empty() {
            return Err(validation_err(format!(
                "backends[{index}].name cannot be empty"
            )));
        }
        if !names.insert(backend.name.as_str()) {
            return Err(validation_err(format!(
                "backends[{index}].name '{}' is duplicated",
                backend.name
            )));
        }
        validate_http_url(&backend.name, "base_url", &backend.base_url)?;
        if let Some(proxy) = backend.proxy.as_deref() {
            validate_http_url(&backend.name, "proxy", proxy)?;
        }
        if backend
            .api_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(validation_err(format!(
                "Backend '{}': api_key cannot be empty when set",
                backend.name
            )));
        }
        if backend.models.is_empty() && !backend.is_default {
            return Err(validation_err(format!(
                "Backend '{}' must list at least one model or be the default",
                backend.name
            )));
        }
        let mut models = HashSet::new();
        for model in &backend.models {
            if model.trim().is_empty() {
                return Err(validation_err(format!(
                    "Backend '{}': model name cannot be empty",
                    backend.name
                )));
            }
            if !models.insert(model.as_str()) {
                return Err(validation_err(format!(
                    "Backend '{}': duplicate model entry '{model}'",
                    backend.name
                )));
            }
        }
    }

    if config.backends.iter().filter(|b| b.is_default).count() > 1 {
        return Err(validation_err("at most one backend can be the default"));
    }
    Ok(())
}

fn validate_http_url(backend: &str, field_name: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(validation_err(format!(
            "Backend '{backend}': {field_name} cannot be empty"
        )));
    }
    let parsed = url::Url::parse(value).map_err(|err| {
        validation_err(format!(
            "Backend '{backend}': {field_name} is not a valid URL: {err}"
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Backend '{backend}': {field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_rewrite_rules(config: &AppConfig) -> Result<(), ConfigError> {
    for (index, rule) in config.features.rewrite_rules.iter().enumerate() {
        if let Err(err) = regex_lite::Regex::new(&rule.pattern) {
            return Err(validation_err(format!(
                "features.rewrite_rules[{index}].pattern is invalid: {err}"
            )));
        }
    }
    if config.features.strip_markers.iter().any(String::is_empty) {
        return Err(validation_err("features.strip_markers contains an empty marker"));
    }
    Ok(())
}

fn validate_prompt_template(config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(ref tmpl) = config.features.tool_prompt_template {
        if !tmpl.contains("{tools_list}") || !tmpl.contains("{trigger_signal}") {
            return Err(validation_err(
                "tool_prompt_template must contain {tools_list} and {trigger_signal} placeholders",
            ));
        }
    }
    Ok(())
}
