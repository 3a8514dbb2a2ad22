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

//! Shared connection state.
//!
//! The searching flag, the auto-connect target and the current scan
//! results are read by the scan callbacks, the reconnect timer and explicit
//! connect calls. They live behind one lock so those three never race.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::bluetooth::{Address, Device};

/// Lifecycle of a single link.
///
/// There is no disconnecting state. A link tears down under its own lock,
/// aborting workers and releasing the transport handle in one step, so no
/// caller can observe a link halfway through closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Connecting => "Connecting...",
            LinkState::Connected => "Connected",
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self, LinkState::Idle)
    }
}

#[derive(Debug, Default)]
struct Inner {
    searching: bool,
    auto_connect: Option<Address>,
    failures: u32,
    matched_this_cycle: bool,
    found: Vec<Device>,
}

/// State shared between the manager, its listeners and the reconnect policy.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_searching(&self) -> bool {
        self.inner.lock().searching
    }

    /// Starting a search opens a new scan cycle.
    pub fn set_searching(&self, searching: bool) {
        let mut inner = self.inner.lock();
        if searching && !inner.searching {
            inner.matched_this_cycle = false;
        }
        inner.searching = searching;
    }

    pub fn auto_connect_target(&self) -> Option<Address> {
        self.inner.lock().auto_connect
    }

    pub fn set_auto_connect_target(&self, target: Option<Address>) {
        let mut inner = self.inner.lock();
        inner.auto_connect = target;
        inner.failures = 0;
    }

    /// Remember a scan hit. Returns false if the address was already known.
    pub fn record_found(&self, device: &Device) -> bool {
        let mut inner = self.inner.lock();
        match inner.found.iter_mut().find(|d| d.address == device.address) {
            Some(existing) => {
                if !device.name.is_empty() {
                    existing.name = device.name.clone();
                }
                false
            }
            None => {
                inner.found.push(device.clone());
                true
            }
        }
    }

    pub fn found_devices(&self) -> Vec<Device> {
        self.inner.lock().found.clone()
    }

    pub fn find_found(&self, address: Address) -> Option<Device> {
        self.inner
            .lock()
            .found
            .iter()
            .find(|d| d.address == address)
            .cloned()
    }

    pub fn clear_found(&self) {
        self.inner.lock().found.clear();
    }

    /// Claim the one auto-connect allowed per scan cycle.
    ///
    /// True only if `device` is the target and nothing matched it yet in the
    /// current cycle.
    pub fn claim_auto_connect(&self, device: &Device) -> bool {
        let mut inner = self.inner.lock();
        if inner.auto_connect != Some(device.address) || inner.matched_this_cycle {
            return false;
        }
        inner.matched_this_cycle = true;
        true
    }

    /// Count a failed connect to the target. Returns true when the target was
    /// dropped because `give_up_after` consecutive attempts failed.
    pub fn record_connect_failure(&self, address: Address, give_up_after: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.auto_connect != Some(address) {
            return false;
        }
        inner.failures += 1;
        if give_up_after > 0 && inner.failures >= give_up_after {
            inner.auto_connect = None;
            inner.failures = 0;
            return true;
        }
        false
    }

    pub fn reset_failures(&self) {
        self.inner.lock().failures = 0;
    }
}
