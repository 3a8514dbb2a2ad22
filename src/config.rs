// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving link settings.

use anyhow::{Context, Result};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::constants::{
    config::{DEFAULT_CHUNK_SIZE, READ_BUFFER_SIZE, WRITE_QUEUE_DEPTH},
    CLASSIC_SERVICE_NAME, CLASSIC_SERVICE_UUID, CLIENT_CONFIG_DESCRIPTOR_UUID,
    SEND_CHARACTERISTIC_UUID,
};
use crate::bluetooth::{LeSettings, SearchRequest, SendSpeed, SessionSettings};
use crate::error::Error;

const APP_DIR: &str = "bt-link";

/// Get a sanitized hostname suitable for Bluetooth device name.
/// Bluetooth names should only contain alphanumeric chars, spaces, and hyphens.
fn get_sanitized_hostname() -> String {
    let hostname = gethostname().to_string_lossy().to_string();
    let sanitized: String = hostname
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "bt-chat".to_string()
    } else {
        trimmed.to_string()
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for persisted state.
    #[serde(skip)]
    pub data_dir: PathBuf,

    pub classic: ClassicConfig,
    pub le: LeConfig,
    pub reconnect: ReconnectConfig,
    pub search: SearchRequest,
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassicConfig {
    /// RFCOMM service record UUID (SPP by default).
    pub service_uuid: Uuid,
    /// Name of the listening service record.
    pub service_name: String,
    pub read_buffer_size: usize,
    pub write_queue_depth: usize,
}

impl Default for ClassicConfig {
    fn default() -> Self {
        Self {
            service_uuid: CLASSIC_SERVICE_UUID,
            service_name: CLASSIC_SERVICE_NAME.to_string(),
            read_buffer_size: READ_BUFFER_SIZE,
            write_queue_depth: WRITE_QUEUE_DEPTH,
        }
    }
}

impl ClassicConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            read_buffer_size: self.read_buffer_size,
            write_queue_depth: self.write_queue_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeConfig {
    pub send_characteristic_uuid: Uuid,
    pub notify_descriptor_uuid: Uuid,
    /// Bytes per characteristic write.
    pub chunk_size: usize,
    pub discovery_settle_ms: u64,
    pub discovery_timeout_ms: u64,
    pub send_speed: SendSpeed,
}

impl Default for LeConfig {
    fn default() -> Self {
        Self {
            send_characteristic_uuid: SEND_CHARACTERISTIC_UUID,
            notify_descriptor_uuid: CLIENT_CONFIG_DESCRIPTOR_UUID,
            chunk_size: DEFAULT_CHUNK_SIZE,
            discovery_settle_ms: 1500,
            discovery_timeout_ms: 5000,
            send_speed: SendSpeed::Medium,
        }
    }
}

impl LeConfig {
    pub fn settings(&self, write_queue_depth: usize) -> LeSettings {
        LeSettings {
            send_characteristic: self.send_characteristic_uuid,
            notify_descriptor: self.notify_descriptor_uuid,
            chunk_size: self.chunk_size,
            discovery_settle: Duration::from_millis(self.discovery_settle_ms),
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            send_speed: self.send_speed,
            write_queue_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub tick_ms: u64,
    /// Act on every n-th tick only.
    pub retry_every_ticks: u32,
    /// Forget the remembered peer after this many failed connects (0 = never).
    pub give_up_after: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 1000,
            retry_every_ticks: 5,
            give_up_after: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name used in auto-replies. Defaults to the hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Answer "Hello..." messages with "Hi, I am <name>".
    pub auto_reply: bool,
    pub discoverable_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            auto_reply: true,
            discoverable_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(get_sanitized_hostname)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            classic: ClassicConfig::default(),
            le: LeConfig::default(),
            reconnect: ReconnectConfig::default(),
            search: SearchRequest::default(),
            app: AppConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = default_config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let mut config = Self::load_from(&config_dir.join("config.toml"))?;

        config.data_dir = default_data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            let config = Self::default();
            config.save_to(path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&default_config_dir().join("config.toml"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.le.chunk_size == 0 {
            return Err(Error::Config("le.chunk_size must be at least 1".into()));
        }
        if self.classic.read_buffer_size == 0 {
            return Err(Error::Config(
                "classic.read_buffer_size must be at least 1".into(),
            ));
        }
        if self.classic.write_queue_depth == 0 {
            return Err(Error::Config(
                "classic.write_queue_depth must be at least 1".into(),
            ));
        }
        if self.reconnect.tick_ms == 0 {
            return Err(Error::Config("reconnect.tick_ms must be at least 1".into()));
        }
        if self.search.phases.is_empty() {
            return Err(Error::Config("search needs at least one phase".into()));
        }
        Ok(())
    }
}
