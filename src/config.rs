//! Framework configuration.
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4000
//! playground = false
//!
//! [schema]
//! max_depth = 15
//! introspection = false
//!
//! [http]
//! batching = true
//! max_batch_size = 10
//! ```

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. `0` picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Route serving GraphQL over GET, POST and WebSocket.
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Serve GraphiQL on `GET path` requests that carry no query.
    #[serde(default = "default_playground")]
    pub playground: bool,

    /// Allow cross-origin requests from any origin.
    #[serde(default = "default_cors")]
    pub cors: bool,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_path() -> String {
    "/graphql".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_playground() -> bool {
    true
}

fn default_cors() -> bool {
    true
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            health_path: default_health_path(),
            playground: default_playground(),
            cors: default_cors(),
            schema: SchemaConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl FrameworkConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, path) in [("path", &self.path), ("health_path", &self.health_path)] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("{key} must start with '/'")));
            }
        }
        if self.path == self.health_path {
            return Err(ConfigError::Invalid(
                "path and health_path must differ".into(),
            ));
        }
        self.socket_addr()?;
        self.schema.validate()?;
        self.http.validate()
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid listen address: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Maximum query depth. Unlimited when absent.
    #[serde(default)]
    pub max_depth: Option<usize>,

    /// Maximum query complexity. Unlimited when absent.
    #[serde(default)]
    pub max_complexity: Option<usize>,

    #[serde(default = "default_introspection")]
    pub introspection: bool,
}

fn default_introspection() -> bool {
    true
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            max_complexity: None,
            introspection: default_introspection(),
        }
    }
}

impl SchemaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == Some(0) {
            return Err(ConfigError::Invalid("schema.max_depth must be > 0".into()));
        }
        if self.max_complexity == Some(0) {
            return Err(ConfigError::Invalid(
                "schema.max_complexity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Accept JSON arrays of operations in POST bodies.
    #[serde(default = "default_batching")]
    pub batching: bool,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum POST body size in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_batching() -> bool {
    false
}

fn default_max_batch_size() -> usize {
    10
}

fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            batching: default_batching(),
            max_batch_size: default_max_batch_size(),
            body_limit: default_body_limit(),
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batching && self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "http.max_batch_size must be > 0 when batching is enabled".into(),
            ));
        }
        if self.body_limit == 0 {
            return Err(ConfigError::Invalid("http.body_limit must be > 0".into()));
        }
        Ok(())
    }
}
