use std::time::Duration;

use crate::errors::SupervisorError;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Configuration for the HTTP generation endpoint.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Base URL of the assistant API.
    pub base_url: String,
    /// Bearer token from the auth collaborator, if the API requires one.
    pub api_token: Option<String>,
    /// Overall request timeout; bounds the whole streamed response.
    pub timeout: Duration,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Builds a config from `HEARTH_API_URL` and `HEARTH_API_TOKEN`.
    pub fn from_env() -> Result<Self, SupervisorError> {
        let base_url = std::env::var("HEARTH_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(SupervisorError::Config(format!(
                "HEARTH_API_URL must be an http(s) URL, got `{base_url}`"
            )));
        }
        let mut config = Self::new(base_url);
        if let Ok(token) = std::env::var("HEARTH_API_TOKEN")
            && !token.trim().is_empty()
        {
            config.api_token = Some(token);
        }
        Ok(config)
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn message_url(&self) -> String {
        format!("{}/api/chat/message", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_url_trims_trailing_slash() {
        let config = EndpointConfig::new("https://hearth.example/");
        assert_eq!(config.message_url(), "https://hearth.example/api/chat/message");
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = EndpointConfig::default()
            .api_token("secret")
            .timeout(Duration::from_secs(5));
        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
