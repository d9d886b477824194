//! Configuration file structures for the edge-orchestrator.
//!
//! A configuration file holds the orchestrator settings and the worker
//! definitions to run.
//!
//! # Example
//!
//! ```toml
//! [orchestrator.server]
//! host = "127.0.0.1"
//! port = 8787
//!
//! [orchestrator.proxy]
//! upstream = "https://example.com"
//!
//! [[workers]]
//! name = "api"
//! routes = ["*/api/*"]
//! compatibility_date = "2024-09-01"
//! script = { format = "modules", modules = [{ name = "index.mjs", path = "./api.mjs" }] }
//!
//! [[workers.bindings]]
//! name = "CACHE"
//! type = "kv_namespace"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::{OrchestratorConfig, WorkerDefinition};

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Worker definitions; the first is the entrypoint.
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{BindingKind, ScriptSource};

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.orchestrator.server.port, 8787);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [orchestrator.server]
            host = "0.0.0.0"
            port = 9000

            [orchestrator.proxy]
            unsafe_proxy_shared_secret = "s3cret"
            strip_cf_connecting_ip = false

            [[workers]]
            name = "api"
            routes = ["*/api", "*/api/*"]
            compatibility_date = "2024-09-01"
            compatibility_flags = ["nodejs_compat"]
            script = { format = "modules", modules = [{ name = "index.mjs", contents = "export default {}" }] }

            [[workers.bindings]]
            name = "AUTH"
            type = "service"
            target = "auth"

            [[workers.bindings]]
            name = "DB"
            type = "d1_database"

            [[workers]]
            name = "auth"
            script = { format = "script", code = "addEventListener('fetch', () => {})" }
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.orchestrator.server.host, "0.0.0.0");
        assert_eq!(config.orchestrator.server.port, 9000);
        assert_eq!(
            config.orchestrator.proxy.unsafe_proxy_shared_secret.as_deref(),
            Some("s3cret")
        );
        assert!(!config.orchestrator.proxy.strip_cf_connecting_ip);

        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].routes, vec!["*/api", "*/api/*"]);
        assert!(matches!(
            config.workers[0].bindings[0].kind,
            BindingKind::Service { ref target, .. } if target == "auth"
        ));
        assert!(matches!(
            config.workers[1].script,
            ScriptSource::Script { code: Some(_), .. }
        ));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
