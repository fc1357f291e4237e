pub mod schema;

use crate::error::{CastError, Result};
use schema::Settings;
use std::net::SocketAddr;
use std::path::Path;

/// Load and parse daemon settings from a TOML file.
///
/// # Errors
/// Returns `CastError::ConfigNotFound` if the file doesn't exist,
/// `CastError::Io` on read errors, `CastError::TomlParse` on syntax errors,
/// or `CastError::Config` on validation failures.
pub fn load(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(CastError::ConfigNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let content = expand_env_vars(&content);
    let settings: Settings = toml::from_str(&content)?;

    validate(&settings)?;
    Ok(settings)
}

/// Expand `${VAR}` and `$VAR` patterns in the settings string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                } else {
                    // Keep original if env var not found
                    use std::fmt::Write;
                    let _ = write!(result, "${{{var_name}}}");
                }
            } else {
                let var_name: String = chars
                    .by_ref()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if var_name.is_empty() {
                    result.push('$');
                } else if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                } else {
                    result.push('$');
                    result.push_str(&var_name);
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Validate settings constraints.
fn validate(settings: &Settings) -> Result<()> {
    if settings.server.bind.parse::<SocketAddr>().is_err() {
        return Err(CastError::Config(format!(
            "server.bind '{}' is not a valid socket address",
            settings.server.bind
        )));
    }

    if settings.engine.host.trim().is_empty() {
        return Err(CastError::Config("engine.host must not be empty".to_string()));
    }
    if settings.engine.port == 0 {
        return Err(CastError::Config("engine.port must not be 0".to_string()));
    }
    if settings.engine.reconnect_base_ms == 0 {
        return Err(CastError::Config(
            "engine.reconnect_base_ms must be at least 1".to_string(),
        ));
    }
    if settings.engine.reconnect_cap_ms < settings.engine.reconnect_base_ms {
        return Err(CastError::Config(
            "engine.reconnect_cap_ms must be >= engine.reconnect_base_ms".to_string(),
        ));
    }
    if settings.engine.action_timeout_ms == 0 {
        return Err(CastError::Config(
            "engine.action_timeout_ms must be at least 1".to_string(),
        ));
    }

    if settings.sessions.queue_capacity == 0 {
        return Err(CastError::Config(
            "sessions.queue_capacity must be at least 1".to_string(),
        ));
    }
    if settings.sessions.failure_threshold == 0 {
        return Err(CastError::Config(
            "sessions.failure_threshold must be at least 1".to_string(),
        ));
    }

    Ok(())
}
