// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tool configuration.
//!
//! The on-disk layout is a single JSON document with one section per mode.
//! Ports are stored as strings so existing `config.json` files keep loading.

use crate::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where outbound client connections dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(rename = "ServerIp", default = "default_loopback")]
    pub server_ip: String,

    #[serde(rename = "ServerPort", default = "default_port")]
    pub server_port: String,
}

/// Where the inbound server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_any")]
    pub tcp_addr: String,

    #[serde(default = "default_port")]
    pub tcp_port: String,
}

/// Relay listen address and downstream target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    #[serde(default = "default_any")]
    pub src_addr: String,

    #[serde(default = "default_relay_port")]
    pub src_port: String,

    #[serde(default = "default_loopback")]
    pub dst_addr: String,

    #[serde(default = "default_port")]
    pub dst_port: String,
}

/// Whole configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "Client", default)]
    pub client: ClientConfig,

    #[serde(rename = "Server", default)]
    pub server: ServerConfig,

    #[serde(rename = "Transfer", default)]
    pub transfer: TransferConfig,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(rename = "reconnectIntervalMs", default = "default_reconnect_ms")]
    pub reconnect_interval_ms: u64,
}

fn default_loopback() -> String {
    "127.0.0.1".to_string()
}

fn default_any() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> String {
    "8080".to_string()
}

fn default_relay_port() -> String {
    "9090".to_string()
}

fn default_reconnect_ms() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_ip: default_loopback(),
            server_port: default_port(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: default_any(),
            tcp_port: default_port(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            src_addr: default_any(),
            src_port: default_relay_port(),
            dst_addr: default_loopback(),
            dst_port: default_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            transfer: TransferConfig::default(),
            reconnect_interval_ms: default_reconnect_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, writing the defaults first if it is missing or empty.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let empty = match std::fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if empty {
            let config = Self::default();
            config.to_file(path)?;
            return Ok(config);
        }
        Self::from_file(path)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_endpoint("Client", &self.client.server_ip, &self.client.server_port)?;
        check_endpoint("Server", &self.server.tcp_addr, &self.server.tcp_port)?;
        check_endpoint(
            "Transfer source",
            &self.transfer.src_addr,
            &self.transfer.src_port,
        )?;
        check_endpoint(
            "Transfer destination",
            &self.transfer.dst_addr,
            &self.transfer.dst_port,
        )?;
        if self.reconnect_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnectIntervalMs cannot be 0".into(),
            ));
        }
        Ok(())
    }

    /// Address outbound connections dial.
    pub fn client_address(&self) -> String {
        join(&self.client.server_ip, &self.client.server_port)
    }

    /// Address the server listens on.
    pub fn server_address(&self) -> String {
        join(&self.server.tcp_addr, &self.server.tcp_port)
    }

    /// Address the relay listens on.
    pub fn transfer_src_address(&self) -> String {
        join(&self.transfer.src_addr, &self.transfer.src_port)
    }

    /// Address every relay pair dials.
    pub fn transfer_dst_address(&self) -> String {
        join(&self.transfer.dst_addr, &self.transfer.dst_port)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::fixed(Duration::from_millis(self.reconnect_interval_ms))
    }
}

fn join(host: &str, port: &str) -> String {
    format!("{}:{}", host, port)
}

fn check_endpoint(section: &str, host: &str, port: &str) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{}: address is empty", section)));
    }
    if port.parse::<u16>().is_err() {
        return Err(ConfigError::Invalid(format!(
            "{}: invalid port '{}'",
            section, port
        )));
    }
    Ok(())
}
