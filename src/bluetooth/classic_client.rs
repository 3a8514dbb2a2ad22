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

//! Classic (RFCOMM) client link.
//!
//! Holds at most one outbound connection. `connect` and `write` never
//! block: the connect runs on its own task and the established stream is
//! handed to a [`Session`]. Every worker carries the generation it was
//! started with; after a teardown the generation moves on and late workers
//! drop their results silently.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::Device;
use super::events::{BluetoothEvent, ConnectedDetail, Emitter};
use super::session::{Outbound, Session, SessionOwner, SessionSettings};
use super::transport::RfcommConnector;
use crate::error::Error;
use crate::state::LinkState;

enum ClientLink {
    Idle,
    Connecting {
        device: Device,
        task: Option<JoinHandle<()>>,
    },
    Connected {
        device: Device,
        session: Session,
    },
}

struct Slot {
    generation: u64,
    link: ClientLink,
}

impl Slot {
    /// Drop whatever the link holds and invalidate its workers. Returns the
    /// device plus every payload the session had not finished writing.
    fn teardown(&mut self) -> Option<(Device, Vec<Outbound>)> {
        self.generation += 1;
        match std::mem::replace(&mut self.link, ClientLink::Idle) {
            ClientLink::Idle => None,
            ClientLink::Connecting { device, task } => {
                if let Some(task) = task {
                    task.abort();
                }
                Some((device, Vec::new()))
            }
            ClientLink::Connected { device, session } => Some((device, session.close())),
        }
    }
}

struct ClientInner {
    this: Weak<ClientInner>,
    connector: Arc<dyn RfcommConnector>,
    emitter: Emitter,
    service_uuid: Uuid,
    settings: SessionSettings,
    slot: Mutex<Slot>,
}

/// RFCOMM client link.
#[derive(Clone)]
pub struct ClassicClient {
    inner: Arc<ClientInner>,
}

impl ClassicClient {
    pub fn new(
        connector: Arc<dyn RfcommConnector>,
        emitter: Emitter,
        service_uuid: Uuid,
        settings: SessionSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| ClientInner {
            this: this.clone(),
            connector,
            emitter,
            service_uuid,
            settings,
            slot: Mutex::new(Slot {
                generation: 0,
                link: ClientLink::Idle,
            }),
        });
        Self { inner }
    }

    /// Connect to `device`.
    ///
    /// Already connected to it: emits `Connected { AlreadyConnected }` and
    /// does nothing else. A connect already in flight: the request is
    /// logged and ignored.
    pub fn connect(&self, device: &Device) {
        self.inner.start_connect(device.clone(), None);
    }

    /// Send `payload` to `device`, connecting first if needed.
    pub fn write(&self, device: &Device, payload: impl Into<Vec<u8>>) {
        let outbound = Outbound::new(payload);
        let slot = self.inner.slot.lock();
        match &slot.link {
            ClientLink::Connected {
                device: current,
                session,
            } if current == device => {
                let result = session.enqueue(outbound);
                drop(slot);
                if let Err(e) = result {
                    warn!("Write to {} refused: {}", device, e);
                    self.inner
                        .emitter
                        .emit(BluetoothEvent::WriteFailed { reason: e.to_string() });
                }
            }
            ClientLink::Connecting { device: pending, .. } => {
                warn!(
                    "Connect to {} in flight, ignoring write to {}",
                    pending, device
                );
            }
            _ => {
                drop(slot);
                self.inner.start_connect(device.clone(), Some(outbound));
            }
        }
    }

    /// Close the socket and stop all workers. Returns the device that was
    /// connected or being connected, if any.
    pub fn disconnect(&self) -> Option<Device> {
        let (device, unsent) = self.inner.slot.lock().teardown()?;
        info!("Disconnected from {}", device);
        if !unsent.is_empty() {
            debug!("Discarded {} queued writes", unsent.len());
        }
        Some(device)
    }

    /// Suppress all further events, then disconnect.
    pub fn shutdown(&self) {
        self.inner.emitter.destroy();
        self.disconnect();
    }

    pub fn state(&self) -> LinkState {
        match self.inner.slot.lock().link {
            ClientLink::Idle => LinkState::Idle,
            ClientLink::Connecting { .. } => LinkState::Connecting,
            ClientLink::Connected { .. } => LinkState::Connected,
        }
    }

    pub fn connected_device(&self) -> Option<Device> {
        match &self.inner.slot.lock().link {
            ClientLink::Connected { device, .. } => Some(device.clone()),
            _ => None,
        }
    }

    pub fn connecting_device(&self) -> Option<Device> {
        match &self.inner.slot.lock().link {
            ClientLink::Connecting { device, .. } => Some(device.clone()),
            _ => None,
        }
    }

    pub fn is_connected_to(&self, device: &Device) -> bool {
        self.connected_device().as_ref() == Some(device)
    }
}

impl ClientInner {
    fn start_connect(&self, device: Device, pending: Option<Outbound>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let mut slot = self.slot.lock();
        match &slot.link {
            ClientLink::Connecting { device: current, .. } => {
                warn!(
                    "Connect to {} already in flight, ignoring request for {}",
                    current, device
                );
                return;
            }
            ClientLink::Connected {
                device: current, ..
            } if *current == device && pending.is_none() => {
                drop(slot);
                debug!("Already connected to {}", device);
                self.emitter.emit(BluetoothEvent::Connected {
                    device,
                    detail: ConnectedDetail::AlreadyConnected,
                });
                return;
            }
            _ => {}
        }

        if let Some((previous, unsent)) = slot.teardown() {
            info!(
                "Closing link to {} before connecting to {} ({} writes discarded)",
                previous,
                device,
                unsent.len()
            );
        }
        let generation = slot.generation;
        slot.link = ClientLink::Connecting {
            device: device.clone(),
            task: None,
        };
        drop(slot);

        self.emitter.emit(BluetoothEvent::Connecting {
            device: device.clone(),
        });

        let task = tokio::spawn(this.connect_worker(device, generation, pending));
        let mut slot = self.slot.lock();
        let current = slot.generation;
        match &mut slot.link {
            ClientLink::Connecting { task: handle, .. } if current == generation => {
                *handle = Some(task);
            }
            // Torn down while the worker was being spawned
            _ if current != generation => task.abort(),
            _ => {}
        }
    }

    async fn connect_worker(
        self: Arc<Self>,
        device: Device,
        generation: u64,
        pending: Option<Outbound>,
    ) {
        info!("Connecting to {}", device);
        let result = self.connector.connect(&device, self.service_uuid).await;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                {
                    let mut slot = self.slot.lock();
                    if slot.generation != generation {
                        debug!("Dropping stale connect failure for {}", device);
                        return;
                    }
                    slot.link = ClientLink::Idle;
                }
                warn!("Connect to {} failed: {}", device, e);
                self.emitter.emit(BluetoothEvent::ConnectFailed {
                    device,
                    reason: e.to_string(),
                });
                if let Some(outbound) = pending.filter(|o| o.retried) {
                    debug!("Giving up on {} byte write", outbound.payload.len());
                    self.emitter.emit(BluetoothEvent::WriteFailed {
                        reason: format!("reconnect failed: {}", e),
                    });
                }
                return;
            }
        };

        {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                debug!("Dropping stale connection to {}", device);
                return;
            }
            let owner: Weak<dyn SessionOwner> = self.this.clone();
            let session = Session::spawn(
                stream,
                generation,
                self.emitter.clone(),
                owner,
                self.settings,
            );
            slot.link = ClientLink::Connected {
                device: device.clone(),
                session,
            };
        }

        info!("Connected to {}", device);
        self.emitter.emit(BluetoothEvent::ConnectSucceeded { device });

        if let Some(outbound) = pending {
            let result = {
                let slot = self.slot.lock();
                match &slot.link {
                    ClientLink::Connected { session, .. } if slot.generation == generation => {
                        session.enqueue(outbound)
                    }
                    _ => Err(Error::NotConnected),
                }
            };
            if let Err(e) = result {
                warn!("Deferred write failed: {}", e);
                self.emitter
                    .emit(BluetoothEvent::WriteFailed { reason: e.to_string() });
            }
        }
    }
}

impl ClientInner {
    /// Resend the first payload that has not been retried yet over a fresh
    /// connection; report every other one as failed.
    fn recover_unsent(&self, device: Device, unsent: Vec<Outbound>, reason: &str) {
        if self.emitter.is_destroyed() {
            return;
        }

        let mut retry = None;
        for outbound in unsent {
            if retry.is_none() && !outbound.retried {
                retry = Some(outbound);
                continue;
            }
            warn!(
                "Write of {} bytes to {} failed: {}",
                outbound.payload.len(),
                device,
                reason
            );
            self.emitter.emit(BluetoothEvent::WriteFailed {
                reason: reason.to_string(),
            });
        }

        if let Some(outbound) = retry {
            info!("Reconnecting to {} to retry a {} byte write", device, outbound.payload.len());
            self.start_connect(device, Some(outbound.retry()));
        }
    }
}

impl SessionOwner for ClientInner {
    fn on_read_failed(&self, generation: u64, reason: String) {
        let torn_down = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            slot.teardown()
        };
        let Some((device, unsent)) = torn_down else {
            return;
        };

        warn!("Lost connection to {}: {}", device, reason);
        let lost = format!("connection lost: {}", reason);
        self.emitter.emit(BluetoothEvent::ReadFailed { reason });
        self.recover_unsent(device, unsent, &lost);
    }

    fn on_write_failed(&self, generation: u64, reason: String) {
        let torn_down = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            slot.teardown()
        };
        if let Some((device, unsent)) = torn_down {
            warn!("Write to {} failed: {}", device, reason);
            self.recover_unsent(device, unsent, &reason);
        }
    }
}
