//! Client configuration
//!
//! Options are plain serde structs so they can be built in code or loaded
//! from a TOML file. Validation happens once, when the client is created.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

static CLIENT_ID_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9%./_]+$"));

/// Longest client id the server accepts
pub const MAX_CLIENT_ID_LEN: usize = 48;

/// Options accepted by [`crate::Client::new`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientOptions {
    /// Service URL, e.g. `amqp://localhost:5672`
    pub service: String,
    /// Client identifier; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a PEM file of trusted certificates (amqps only)
    #[serde(default)]
    pub tls_trust_certificate: Option<String>,
    /// Check the server certificate's name against the service host
    #[serde(default = "default_tls_verify_name")]
    pub tls_verify_name: bool,
    /// Delay between completion polls; 0 yields to the scheduler instead
    #[serde(default)]
    pub poll_interval_ms: u64,
    /// Delay between receive polls while connected
    #[serde(default = "default_receive_interval")]
    pub receive_interval_ms: u64,
}

fn default_tls_verify_name() -> bool {
    true
}

fn default_receive_interval() -> u64 {
    50
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid service URL: {0}")]
    InvalidService(String),
    #[error("Invalid client id: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientOptions {
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
            id: None,
            user: None,
            password: None,
            tls_trust_certificate: None,
            tls_verify_name: default_tls_verify_name(),
            poll_interval_ms: 0,
            receive_interval_ms: default_receive_interval(),
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, user: U, password: P) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls_trust_certificate<S: Into<String>>(mut self, path: S) -> Self {
        self.tls_trust_certificate = Some(path.into());
        self
    }

    pub fn with_tls_verify_name(mut self, verify: bool) -> Self {
        self.tls_verify_name = verify;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_receive_interval(mut self, interval: Duration) -> Self {
        self.receive_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Load options from a TOML file and validate them
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options: ClientOptions = toml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Check the options and return the service URL to connect to
    ///
    /// Credentials, when given, are carried in the returned URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let mut service = parse_service(&self.service)?;

        if let Some(id) = &self.id {
            validate_client_id(id)?;
        }

        match (&self.user, &self.password) {
            (Some(_), None) => {
                return Err(ConfigError::InvalidConfig(
                    "user was specified without a password".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(ConfigError::InvalidConfig(
                    "password was specified without a user".to_string(),
                ))
            }
            (Some(user), Some(password)) => service
                .set_username(user)
                .and_then(|()| service.set_password(Some(password)))
                .map_err(|()| {
                    ConfigError::InvalidService(format!("{}: cannot carry credentials", self.service))
                })?,
            (None, None) => {}
        }

        if self.tls_trust_certificate.is_some() && service.scheme() != "amqps" {
            return Err(ConfigError::InvalidConfig(
                "tls_trust_certificate requires an amqps service".to_string(),
            ));
        }

        Ok(service)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn receive_interval(&self) -> Duration {
        Duration::from_millis(self.receive_interval_ms)
    }
}

/// Parse and check a service URL
fn parse_service(service: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(service).map_err(|e| ConfigError::InvalidService(format!("{service}: {e}")))?;

    match url.scheme() {
        "amqp" | "amqps" => {}
        other => {
            return Err(ConfigError::InvalidService(format!(
                "{service}: unsupported scheme '{other}'"
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidService(format!("{service}: missing host")));
    }

    Ok(url)
}

/// Validate client id format
fn validate_client_id(id: &str) -> Result<(), ConfigError> {
    if id.len() > MAX_CLIENT_ID_LEN {
        return Err(ConfigError::InvalidClientId(format!(
            "Client id '{id}' is longer than {MAX_CLIENT_ID_LEN} characters"
        )));
    }

    let matches = match CLIENT_ID_PATTERN.as_ref() {
        Ok(pattern) => pattern.is_match(id),
        Err(e) => return Err(ConfigError::InvalidClientId(e.to_string())),
    };

    if !matches {
        return Err(ConfigError::InvalidClientId(format!(
            "Client id '{id}' must match pattern [A-Za-z0-9%./_]+"
        )));
    }

    Ok(())
}

/// Generate a client id of the form `AUTO_xxxxxxx`
pub fn generate_client_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("AUTO_{}", &hex[..7])
}
