//! Configuration

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::protocol::User;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Verbose,
    #[default]
    Normal,
    Silent,
}

impl LogLevel {
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "verbose" => LogLevel::Verbose,
            "silent" | "quiet" => LogLevel::Silent,
            _ => LogLevel::Normal,
        }
    }

    pub fn to_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "trace",
            LogLevel::Verbose => "debug",
            LogLevel::Normal => "info",
            LogLevel::Silent => "warn",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Normal => "normal",
            LogLevel::Silent => "silent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Protocol version spoken on the listener (1, 2 or 3; only 3 is
    /// implemented by this build).
    #[serde(default = "default_version")]
    pub version: u8,

    /// user name -> password
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// The TLS 1.3 host whose handshake we borrow.
    #[serde(default = "default_cover_addr")]
    pub cover_addr: String,

    /// Where authenticated tunnel traffic is forwarded.
    #[serde(default = "default_forward_addr")]
    pub forward_addr: String,

    #[serde(default = "default_connect_timeout")]
    pub cover_connect_timeout: u64,

    #[serde(default = "default_connect_timeout")]
    pub forward_connect_timeout: u64,

    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_listen() -> String {
    "0.0.0.0:443".to_string()
}
fn default_version() -> u8 {
    3
}
fn default_cover_addr() -> String {
    "www.google.com:443".to_string()
}
fn default_forward_addr() -> String {
    "127.0.0.1:8388".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert("default".to_string(), "change-this-password".to_string());

        Self {
            listen: default_listen(),
            version: default_version(),
            users,
            cover_addr: default_cover_addr(),
            forward_addr: default_forward_addr(),
            cover_connect_timeout: default_connect_timeout(),
            forward_connect_timeout: default_connect_timeout(),
            log_level: LogLevel::default(),
        }
    }
}

impl RelayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::InvalidConfig(e.to_string()))?;

        let config: RelayConfig =
            toml::from_str(&content).map_err(|e| RelayError::InvalidConfig(e.to_string()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(RelayError::InvalidConfig("no users configured".into()));
        }
        for (user, password) in &self.users {
            if password.is_empty() {
                return Err(RelayError::InvalidConfig(format!(
                    "user '{user}' has an empty password"
                )));
            }
        }
        if !matches!(self.version, 1..=3) {
            return Err(RelayError::InvalidConfig(format!(
                "unknown protocol version: {}",
                self.version
            )));
        }
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(RelayError::InvalidConfig(format!(
                "listen address '{}' is not ip:port",
                self.listen
            )));
        }
        for (name, addr) in [("cover_addr", &self.cover_addr), ("forward_addr", &self.forward_addr)] {
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => {
                    return Err(RelayError::InvalidConfig(format!(
                        "{name} '{addr}' is not host:port"
                    )))
                }
            }
        }
        Ok(())
    }

    /// The user table in a stable order, so tag collisions resolve the same
    /// way on every run.
    pub fn users_vec(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .map(|(name, password)| User::new(name.clone(), password.clone().into_bytes()))
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }
}
