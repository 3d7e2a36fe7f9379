//! Server configuration.
//!
//! A single JSON object read once at startup. A missing file yields the
//! defaults; a file that exists but does not parse is a startup error.

use crate::core::error::ChatError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
    pub cert_file: String,
    pub key_file: String,
    pub users_file: String,
    pub tokens_file: String,
    pub max_connections: usize,
    /// Messages per second allowed on one connection.
    pub rate_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 6697,
            cert_file: "cert.pem".to_string(),
            key_file: "key.pem".to_string(),
            users_file: "users.json".to_string(),
            tokens_file: "tokens.json".to_string(),
            max_connections: 100,
            rate_limit: 10,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
            Err(e) => Err(ChatError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config =
            ServerConfig::load(Path::new("/nonexistent/ironchat-config.json")).unwrap();
        assert_eq!(config.port, 6697);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.rate_limit, 10);
    }

    #[test]
    fn partial_config_keeps_defaults_for_the_rest() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 7000, "rateLimit": 3}"#).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.rate_limit, 3);
        assert_eq!(config.users_file, "users.json");
        assert_eq!(config.tokens_file, "tokens.json");
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let config = ServerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("certFile"));
        assert!(json.contains("maxConnections"));
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, config.port);
    }
}
