//! JSON configuration file loading. Field names match the wire
//! contract in `SPEC_FULL.md` exactly.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
    #[serde(rename = "logFile", default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub pprof: bool,
    #[serde(rename = "httpAddr")]
    pub http_addr: String,
    #[serde(rename = "SSHAddr")]
    pub ssh_addr: String,
    pub domain: String,
    #[serde(rename = "privateKey")]
    pub private_key: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        Config::parse(&contents, path_ref.display().to_string())
    }

    fn parse(contents: &str, path: String) -> Result<Config, ConfigError> {
        serde_json::from_str(contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_full_config() {
        let json = r#"{
            "logLevel": "debug",
            "logFile": "/var/log/webtun.log",
            "pprof": true,
            "httpAddr": "0.0.0.0:8080",
            "SSHAddr": "0.0.0.0:2222",
            "domain": "example.com",
            "privateKey": "-----BEGIN KEY-----\n...\n-----END KEY-----\n"
        }"#;
        let cfg = Config::parse(json, "test".into()).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.log_file.as_deref(), Some("/var/log/webtun.log"));
        assert!(cfg.pprof);
        assert_eq!(cfg.domain, "example.com");
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let json = r#"{
            "httpAddr": "0.0.0.0:8080",
            "SSHAddr": "0.0.0.0:2222",
            "domain": "example.com",
            "privateKey": "pem"
        }"#;
        let cfg = Config::parse(json, "test".into()).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.log_file.is_none());
        assert!(!cfg.pprof);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let json = r#"{
            "httpAddr": "0.0.0.0:8080",
            "SSHAddr": "0.0.0.0:2222",
            "domain": "example.com"
        }"#;
        assert!(Config::parse(json, "test".into()).is_err());
    }
}
