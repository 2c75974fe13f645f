use std::time::Duration;

use planning_core::types::SessionIdentity;

/// Default debounce between the last edit and the autosave write.
const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 1500;

/// Default HTTP request timeout.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Sync daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the planning REST API.
    pub api_url: String,
    /// WebSocket URL of the push channel.
    pub ws_url: String,
    pub user_id: String,
    /// Session id of this client (default: a fresh UUID v4).
    pub session_id: String,
    /// Bearer token sent with every REST request, if set.
    pub auth_token: Option<String>,
    pub autosave_debounce: Duration,
    pub request_timeout: Duration,
}

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                | Default          |
    /// |------------------------|------------------|
    /// | `PLANNING_API_URL`     | required         |
    /// | `PLANNING_WS_URL`      | required         |
    /// | `PLANNING_USER_ID`     | required         |
    /// | `PLANNING_SESSION_ID`  | new UUID v4      |
    /// | `PLANNING_AUTH_TOKEN`  | none             |
    /// | `AUTOSAVE_DEBOUNCE_MS` | `1500`           |
    /// | `REQUEST_TIMEOUT_SECS` | `30`             |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let api_url = required("PLANNING_API_URL")?;
        let ws_url = required("PLANNING_WS_URL")?;
        let user_id = required("PLANNING_USER_ID")?;
        let session_id =
            var("PLANNING_SESSION_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let auth_token = var("PLANNING_AUTH_TOKEN");

        let autosave_debounce_ms = parse_u64(
            "AUTOSAVE_DEBOUNCE_MS",
            var("AUTOSAVE_DEBOUNCE_MS"),
            DEFAULT_AUTOSAVE_DEBOUNCE_MS,
        )?;
        let request_timeout_secs = parse_u64(
            "REQUEST_TIMEOUT_SECS",
            var("REQUEST_TIMEOUT_SECS"),
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;

        Ok(Self {
            api_url,
            ws_url,
            user_id,
            session_id,
            auth_token,
            autosave_debounce: Duration::from_millis(autosave_debounce_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }

    /// The user and session this daemon acts as.
    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(self.user_id.clone(), self.session_id.clone())
    }
}

fn parse_u64(name: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: "a non-negative integer",
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("PLANNING_API_URL", "http://localhost:5000/api"),
        ("PLANNING_WS_URL", "ws://localhost:5100"),
        ("PLANNING_USER_ID", "u1"),
    ];

    #[test]
    fn defaults_apply() {
        let config = SyncConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(config.autosave_debounce, Duration::from_millis(1500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.auth_token.is_none());
        assert!(uuid::Uuid::parse_str(&config.session_id).is_ok());
    }

    #[test]
    fn missing_required_variable() {
        let err = SyncConfig::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert_matches!(err, ConfigError::Missing("PLANNING_USER_ID"));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("AUTOSAVE_DEBOUNCE_MS", "soon"));

        let err = SyncConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { name: "AUTOSAVE_DEBOUNCE_MS", .. });
    }

    #[test]
    fn explicit_session_is_kept() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PLANNING_SESSION_ID", "s1"));

        let identity = SyncConfig::from_lookup(lookup(&vars)).unwrap().identity();
        assert_eq!(identity, SessionIdentity::new("u1", "s1"));
    }
}
