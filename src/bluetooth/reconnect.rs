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

//! Auto-reconnect policy.
//!
//! A periodic check that brings the remembered peer back. It only acts while
//! no client link is busy and no search is running, and then only on every
//! `retry_every_ticks`-th idle tick. The policy is also an [`EventTap`]: a
//! scan hit on the remembered address connects straight away, at most once
//! per scan cycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::device::Device;
use super::events::{BluetoothEvent, EventTap};
use super::manager::ConnectionManager;
use crate::config::ReconnectConfig;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Disabled,
    NoTarget,
    /// A client link is connected or connecting.
    Busy,
    Searching,
    /// Idle, but not this tick's turn.
    Waiting,
    Connecting(Device),
    SearchStarted,
    OpeningRadio,
    /// The manager is gone or the adapter refused the request.
    Failed,
}

pub struct AutoReconnect {
    manager: Weak<ConnectionManager>,
    config: ReconnectConfig,
    idle_ticks: AtomicU32,
}

impl AutoReconnect {
    /// Create the policy and register it as a tap on the manager's events.
    pub fn new(manager: &Arc<ConnectionManager>, config: ReconnectConfig) -> Arc<Self> {
        let policy = Arc::new(Self {
            manager: Arc::downgrade(manager),
            config,
            idle_ticks: AtomicU32::new(0),
        });
        manager.add_tap(policy.clone());
        policy
    }

    /// Run one check.
    pub async fn tick(&self) -> TickOutcome {
        if !self.config.enabled {
            return TickOutcome::Disabled;
        }
        let Some(manager) = self.manager.upgrade() else {
            return TickOutcome::Failed;
        };
        let Some(target) = manager.auto_connect_target() else {
            return TickOutcome::NoTarget;
        };
        if manager.client_state().is_busy() {
            self.idle_ticks.store(0, Ordering::Relaxed);
            return TickOutcome::Busy;
        }
        if manager.is_searching() {
            return TickOutcome::Searching;
        }

        let ticks = self.idle_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % self.config.retry_every_ticks.max(1) != 0 {
            return TickOutcome::Waiting;
        }

        if let Some(device) = manager.shared_state().find_found(target) {
            info!("Reconnecting to {}", device);
            manager.connect(&device);
            return TickOutcome::Connecting(device);
        }

        if manager.is_opened().await {
            debug!("Searching for {}", target);
            match manager.search() {
                Ok(()) => TickOutcome::SearchStarted,
                Err(e) => {
                    warn!("Reconnect search failed: {}", e);
                    TickOutcome::Failed
                }
            }
        } else {
            debug!("Opening radio to look for {}", target);
            match manager.open().await {
                Ok(()) => TickOutcome::OpeningRadio,
                Err(e) => {
                    warn!("Reconnect open failed: {}", e);
                    TickOutcome::Failed
                }
            }
        }
    }

    /// Tick on the configured period until the manager is dropped.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Auto-reconnect running every {:?}", self.config.tick());
            loop {
                ticker.tick().await;
                if self.tick().await == TickOutcome::Failed && self.manager.strong_count() == 0 {
                    debug!("Connection manager gone, stopping auto-reconnect");
                    break;
                }
            }
        })
    }
}

impl EventTap for AutoReconnect {
    fn on_event(&self, event: &BluetoothEvent) {
        let BluetoothEvent::DeviceFound { device } = event else {
            return;
        };
        if !self.config.enabled {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if manager.client_state().is_busy() {
            return;
        }
        if manager.shared_state().claim_auto_connect(device) {
            info!("Remembered peer {} found, connecting", device);
            manager.connect(device);
        }
    }
}
