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

//! Storage for the remembered auto-connect peer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::bluetooth::Address;
use crate::error::Result;

/// Holds the address of the last peer a connect succeeded to.
pub trait AutoConnectStore: Send + Sync {
    fn load(&self) -> Option<Address>;
    fn save(&self, address: Address) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTarget {
    mac: Address,
    saved_at: chrono::DateTime<chrono::Local>,
}

/// JSON file store, `<data_dir>/auto_connect.json`.
pub struct JsonAutoConnectStore {
    path: PathBuf,
    cached: Mutex<Option<Address>>,
}

impl JsonAutoConnectStore {
    /// Create or open the store. A corrupt file is treated as empty.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("auto_connect.json");
        let cached = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<StoredTarget>(&content) {
                Ok(stored) => {
                    debug!("Remembered peer {} (saved {})", stored.mac, stored.saved_at);
                    Some(stored.mac)
                }
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            path,
            cached: Mutex::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AutoConnectStore for JsonAutoConnectStore {
    fn load(&self) -> Option<Address> {
        *self.cached.lock()
    }

    fn save(&self, address: Address) -> Result<()> {
        let mut cached = self.cached.lock();
        if *cached == Some(address) {
            return Ok(());
        }
        let stored = StoredTarget {
            mac: address,
            saved_at: chrono::Local::now(),
        };
        let content = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&self.path, content)?;
        *cached = Some(address);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut cached = self.cached.lock();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        *cached = None;
        Ok(())
    }
}

/// In-memory store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryAutoConnectStore {
    target: Mutex<Option<Address>>,
}

impl MemoryAutoConnectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(address: Address) -> Self {
        Self {
            target: Mutex::new(Some(address)),
        }
    }
}

impl AutoConnectStore for MemoryAutoConnectStore {
    fn load(&self) -> Option<Address> {
        *self.target.lock()
    }

    fn save(&self, address: Address) -> Result<()> {
        *self.target.lock() = Some(address);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.target.lock() = None;
        Ok(())
    }
}
