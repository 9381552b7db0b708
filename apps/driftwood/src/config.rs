use std::env;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Driftwood client configuration
#[derive(Debug, Clone)]
pub struct Config {
    base_url: Url,
    ws_url: Url,
    api_key: Option<String>,
}

impl Config {
    /// Build a configuration from an explicit server address. Bare hosts get
    /// a scheme inferred: local/private hosts default to http, everything
    /// else to https.
    pub fn new(server: impl AsRef<str>) -> Result<Self, ConfigError> {
        let mut base = server.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ConfigError::Invalid("server base url cannot be empty".into()));
        }
        if !base.contains("://") {
            base = format!("{}{}", infer_scheme(&base), base);
        }
        let base_url = Url::parse(&base)
            .map_err(|err| ConfigError::Invalid(format!("invalid server url: {err}")))?;
        let ws_url = derive_ws_url(&base_url)?;
        Ok(Self {
            base_url,
            ws_url,
            api_key: None,
        })
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = env::var("DRIFTWOOD_SERVER").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let mut config = Self::new(server)?;
        if let Ok(ws) = env::var("DRIFTWOOD_WS_URL") {
            let trimmed = ws.trim();
            if !trimmed.is_empty() {
                config.ws_url = Url::parse(trimmed)
                    .map_err(|err| ConfigError::Invalid(format!("invalid ws url: {err}")))?;
            }
        }
        config.api_key = env::var("DRIFTWOOD_API_KEY").ok().filter(|k| !k.trim().is_empty());
        Ok(config)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn ws_url(&self) -> &Url {
        &self.ws_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }
}

fn derive_ws_url(base: &Url) -> Result<Url, ConfigError> {
    let scheme = match base.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::Invalid("cannot derive websocket scheme".into()))?;
    ws.join("ws")
        .map_err(|err| ConfigError::Invalid(format!("cannot derive websocket url: {err}")))
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
    {
        "http://"
    } else {
        "https://"
    }
}
