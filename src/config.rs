//! Configuration management for trackrelay
//!
//! Loads settings from TOML file at ~/.trackrelay/config.toml

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Audit ring configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Storage destinations, authoritative first
    #[serde(default, rename = "destination")]
    pub destinations: Vec<DestinationConfig>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host name or address to bind. The tracking devices dial this, so it
    /// usually has to be an externally visible interface.
    pub name: String,

    /// Listener port. Defaults to 80, or 443 once TLS is configured.
    #[serde(default)]
    pub port: Option<u16>,

    /// PEM certificate chain; TLS needs this and key_file together.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// PEM private key.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional log file; without it everything goes to stdout only.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

/// Audit ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// How many request records the in-memory ring retains
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

fn default_audit_capacity() -> usize {
    crate::audit::DEFAULT_CAPACITY
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            capacity: default_audit_capacity(),
        }
    }
}

/// One storage destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination kind ("directory" or "memory")
    pub kind: String,

    /// Directory path, required for the directory kind
    #[serde(default)]
    pub path: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let expanded_path = expand_path(path);

        if !expanded_path.exists() {
            return Err(CoreError::Config(format!(
                "Configuration file not found: {}",
                expanded_path.display()
            )));
        }

        let content = std::fs::read_to_string(&expanded_path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|p| p.join(".trackrelay").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".trackrelay/config.toml"))
    }

    /// Whether both TLS files are configured
    pub fn tls_enabled(&self) -> bool {
        self.server.cert_file.is_some() && self.server.key_file.is_some()
    }

    /// Effective listener port: explicit, else 443 with TLS, else 80
    pub fn port(&self) -> u16 {
        self.server
            .port
            .unwrap_or(if self.tls_enabled() { 443 } else { 80 })
    }

    /// Get the listener socket address
    pub fn server_addr(&self) -> SocketAddr {
        use std::net::ToSocketAddrs;

        format!("{}:{}", self.server.name, self.port())
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.port())))
    }

    /// The authoritative destination's directory, home of the credential
    /// file and the track catalog
    pub fn authoritative_path(&self) -> Result<PathBuf> {
        let first = self
            .destinations
            .first()
            .ok_or_else(|| CoreError::Config("no destinations configured".to_string()))?;
        let path = first
            .path
            .as_deref()
            .ok_or_else(|| CoreError::Config("first destination needs a path".to_string()))?;
        Ok(expand_path(Path::new(path)))
    }

    /// Check the parts serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() {
            return Err(CoreError::Config("server.name must not be empty".to_string()));
        }
        if self.server.cert_file.is_some() != self.server.key_file.is_some() {
            return Err(CoreError::Config(
                "cert_file and key_file must be configured together".to_string(),
            ));
        }
        if self.destinations.is_empty() {
            return Err(CoreError::Config(
                "at least one [[destination]] is required".to_string(),
            ));
        }
        let first = &self.destinations[0];
        if first.kind != "directory" {
            return Err(CoreError::Config(format!(
                "the first destination must be kind = \"directory\", not \"{}\"",
                first.kind
            )));
        }
        if first.path.is_none() {
            return Err(CoreError::Config(
                "the first destination needs a path".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a default configuration file at the given path
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        // Write a well-commented config file
        let content = r#"# trackrelay configuration

[server]
# Host to bind. Tracking devices dial this name, so it usually has to be
# reachable from outside.
name = "0.0.0.0"

# Port to listen on (default: 80, or 443 once TLS is configured)
# port = 80

# Enable TLS by configuring both files:
# cert_file = "/etc/trackrelay/cert.pem"
# key_file = "/etc/trackrelay/key.pem"

[log]
# trace | debug | info | warn | error
level = "info"

# Optional log file, next to stdout:
# file = "/var/log/trackrelay.log"

[audit]
# How many request audit records to keep in memory
capacity = 1024

# Storage destinations in fan-out order. The first one is authoritative:
# it must be a directory, it assigns track ids, and it holds the .users
# credential file (one user:password per line).
[[destination]]
kind = "directory"
path = "~/.trackrelay/tracks"

# Mirrors are best effort. Add as many as needed:
# [[destination]]
# kind = "memory"
"#;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;

        Ok(())
    }
}

/// Expand ~ to home directory in paths
pub fn expand_path(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~").unwrap());
        }
    }
    path.to_path_buf()
}
