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

//! Classic (RFCOMM) server link.
//!
//! Accepts one inbound client at a time. As soon as a client is accepted the
//! accept worker re-arms itself, so a listener is always up. The listener
//! that produced the current client stays open alongside the accepted
//! socket until the next client replaces them; together with the re-armed
//! listener that makes at most two listener generations alive at once.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::Device;
use super::events::{BluetoothEvent, Emitter};
use super::session::{Outbound, Session, SessionOwner, SessionSettings};
use super::transport::{RfcommAcceptor, RfcommListener};
use crate::error::Error;

struct AcceptWorker {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// The accepted client plus the listener it came from.
struct ActiveClient {
    generation: u64,
    device: Device,
    session: Session,
    _listener: Box<dyn RfcommListener>,
}

#[derive(Default)]
struct ServerSlot {
    generation: u64,
    accepting: Option<AcceptWorker>,
    active: Option<ActiveClient>,
}

impl ServerSlot {
    fn is_accepting(&self, generation: u64) -> bool {
        self.accepting
            .as_ref()
            .map(|w| w.generation == generation)
            .unwrap_or(false)
    }

    fn is_active(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .map(|c| c.generation == generation)
            .unwrap_or(false)
    }

    fn stop_accepting(&mut self) {
        if let Some(worker) = self.accepting.take() {
            if let Some(task) = worker.task {
                task.abort();
            }
        }
    }
}

struct ServerInner {
    this: Weak<ServerInner>,
    acceptor: Arc<dyn RfcommAcceptor>,
    emitter: Emitter,
    service_name: String,
    service_uuid: Uuid,
    settings: SessionSettings,
    slot: Mutex<ServerSlot>,
}

/// RFCOMM server link.
#[derive(Clone)]
pub struct ClassicServer {
    inner: Arc<ServerInner>,
}

impl ClassicServer {
    pub fn new(
        acceptor: Arc<dyn RfcommAcceptor>,
        emitter: Emitter,
        service_name: impl Into<String>,
        service_uuid: Uuid,
        settings: SessionSettings,
    ) -> Self {
        let service_name = service_name.into();
        let inner = Arc::new_cyclic(|this| ServerInner {
            this: this.clone(),
            acceptor,
            emitter,
            service_name,
            service_uuid,
            settings,
            slot: Mutex::new(ServerSlot::default()),
        });
        Self { inner }
    }

    /// Start (or restart) the accept worker.
    pub fn start_accepting(&self) {
        self.inner.start_accepting();
    }

    /// Stop listening. An already accepted client stays connected.
    pub fn stop_accepting(&self) {
        let mut slot = self.inner.slot.lock();
        slot.stop_accepting();
        slot.generation += 1;
    }

    /// Send `payload` to the accepted client. No retry on failure.
    pub fn write(&self, payload: impl Into<Vec<u8>>) {
        let result = {
            let slot = self.inner.slot.lock();
            match &slot.active {
                Some(client) => client.session.enqueue(Outbound::new(payload)),
                None => Err(Error::NotConnected),
            }
        };
        if let Err(e) = result {
            warn!("Server write refused: {}", e);
            self.inner
                .emitter
                .emit(BluetoothEvent::WriteFailed { reason: e.to_string() });
        }
    }

    /// Close the accepted socket and every listener. Returns the client that
    /// was connected, if any.
    pub fn disconnect(&self) -> Option<Device> {
        let client = {
            let mut slot = self.inner.slot.lock();
            slot.stop_accepting();
            slot.generation += 1;
            slot.active.take()
        };
        client.map(|client| {
            info!("Server disconnected {}", client.device);
            client.device
        })
    }

    pub fn shutdown(&self) {
        self.inner.emitter.destroy();
        self.disconnect();
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.slot.lock().accepting.is_some()
    }

    pub fn connected_device(&self) -> Option<Device> {
        self.inner
            .slot
            .lock()
            .active
            .as_ref()
            .map(|c| c.device.clone())
    }
}

impl ServerInner {
    fn start_accepting(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.emitter.is_destroyed() {
            return;
        }

        let generation = {
            let mut slot = self.slot.lock();
            if slot.accepting.is_some() {
                debug!("Restarting accept worker");
            }
            slot.stop_accepting();
            slot.generation += 1;
            slot.accepting = Some(AcceptWorker {
                generation: slot.generation,
                task: None,
            });
            slot.generation
        };

        self.emitter.emit(BluetoothEvent::AcceptConnecting);

        let task = tokio::spawn(this.accept_worker(generation));
        let mut slot = self.slot.lock();
        match slot.accepting.as_mut() {
            Some(worker) if worker.generation == generation => worker.task = Some(task),
            _ => task.abort(),
        }
    }

    async fn accept_worker(self: Arc<Self>, generation: u64) {
        let mut listener = match self
            .acceptor
            .listen(&self.service_name, self.service_uuid)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.accept_failed(generation, format!("listen failed: {}", e));
                return;
            }
        };
        info!(
            "RFCOMM server listening as '{}' ({})",
            self.service_name, self.service_uuid
        );

        let (stream, device) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.accept_failed(generation, e.to_string());
                return;
            }
        };
        info!("Connection from: {}", device);

        if !self.slot.lock().is_accepting(generation) {
            debug!("Dropping stale accepted connection from {}", device);
            return;
        }
        self.emitter.emit(BluetoothEvent::AcceptConnected {
            device: device.clone(),
        });

        let previous = {
            let mut slot = self.slot.lock();
            if !slot.is_accepting(generation) {
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
            // Our own handle; dropping it does not abort this task
            slot.accepting = None;
            slot.active.replace(ActiveClient {
                generation,
                device,
                session,
                _listener: listener,
            })
        };

        // Close the previous listener/socket pair before a third listener opens
        if let Some(previous) = previous {
            debug!("Closing previous client {}", previous.device);
            let unsent = previous.session.close();
            self.fail_unsent(unsent, "client replaced");
        }

        self.start_accepting();
    }

    fn accept_failed(&self, generation: u64, reason: String) {
        {
            let mut slot = self.slot.lock();
            if !slot.is_accepting(generation) {
                return;
            }
            slot.accepting = None;
        }
        warn!("Accept failed: {}", reason);
        self.emitter.emit(BluetoothEvent::AcceptFailed { reason });
    }
}

impl ServerInner {
    /// Report every payload the lost client never received.
    fn fail_unsent(&self, unsent: Vec<Outbound>, reason: &str) {
        for outbound in unsent {
            warn!("Server write of {} bytes failed: {}", outbound.payload.len(), reason);
            self.emitter.emit(BluetoothEvent::WriteFailed {
                reason: reason.to_string(),
            });
        }
    }
}

impl SessionOwner for ServerInner {
    fn on_read_failed(&self, generation: u64, reason: String) {
        let client = {
            let mut slot = self.slot.lock();
            if !slot.is_active(generation) {
                return;
            }
            slot.stop_accepting();
            slot.active.take()
        };
        let unsent = match client {
            Some(client) => {
                warn!("Client {} lost: {}", client.device, reason);
                client.session.close()
            }
            None => Vec::new(),
        };

        let lost = format!("connection lost: {}", reason);
        self.emitter.emit(BluetoothEvent::ReadFailed { reason });
        self.fail_unsent(unsent, &lost);
        self.start_accepting();
    }

    fn on_write_failed(&self, generation: u64, reason: String) {
        let (unsent, still_accepting) = {
            let mut slot = self.slot.lock();
            if !slot.is_active(generation) {
                return;
            }
            let unsent = slot
                .active
                .take()
                .map(|client| client.session.close())
                .unwrap_or_default();
            (unsent, slot.accepting.is_some())
        };

        self.fail_unsent(unsent, &reason);
        if !still_accepting {
            self.start_accepting();
        }
    }
}
