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

//! LE (GATT) client link.
//!
//! `Idle -> Connecting -> ServiceDiscovery -> EnablingNotifications -> Ready`,
//! with a remote disconnect or a local teardown going back to `Idle` from
//! anywhere. Discovery starts after a settle delay on a watchdog task that
//! also bounds how long the whole setup may take. Writes are queued to a
//! single writer task running the chunked flow control in [`super::flow`].
//!
//! GATT callbacks carry the generation of the connect that created them.
//! Callbacks from an older generation are ignored. GATT handle methods are
//! never called with the link lock held, since a stack may call back from
//! inside them.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::constants::{
    config::{DEFAULT_CHUNK_SIZE, WRITE_QUEUE_DEPTH},
    timing::{DISCOVERY_SETTLE, DISCOVERY_TIMEOUT},
    CLIENT_CONFIG_DESCRIPTOR_UUID, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
    GATT_ERROR, SEND_CHARACTERISTIC_UUID,
};
use super::device::Device;
use super::events::{BluetoothEvent, ConnectedDetail, Emitter};
use super::flow::{self, ChunkSink, FlowTiming, SendSpeed};
use super::transport::{
    GattCallbacks, GattCharacteristic, GattConnectionState, GattConnector, GattHandle,
    GATT_SUCCESS,
};
use crate::state::LinkState;

/// Where the LE link is in its setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LePhase {
    Idle,
    Connecting,
    ServiceDiscovery,
    EnablingNotifications,
    Ready,
}

impl LePhase {
    pub fn link_state(self) -> LinkState {
        match self {
            LePhase::Idle => LinkState::Idle,
            LePhase::Ready => LinkState::Connected,
            _ => LinkState::Connecting,
        }
    }
}

/// LE link parameters.
#[derive(Debug, Clone)]
pub struct LeSettings {
    pub send_characteristic: Uuid,
    pub notify_descriptor: Uuid,
    pub chunk_size: usize,
    pub discovery_settle: Duration,
    pub discovery_timeout: Duration,
    pub send_speed: SendSpeed,
    pub write_queue_depth: usize,
}

impl Default for LeSettings {
    fn default() -> Self {
        Self {
            send_characteristic: SEND_CHARACTERISTIC_UUID,
            notify_descriptor: CLIENT_CONFIG_DESCRIPTOR_UUID,
            chunk_size: DEFAULT_CHUNK_SIZE,
            discovery_settle: DISCOVERY_SETTLE,
            discovery_timeout: DISCOVERY_TIMEOUT,
            send_speed: SendSpeed::default(),
            write_queue_depth: WRITE_QUEUE_DEPTH,
        }
    }
}

/// Payloads handed to the writer that have no outcome yet.
#[derive(Default)]
struct Outstanding {
    count: usize,
    closed: bool,
}

struct LeWriter {
    tx: mpsc::Sender<Vec<u8>>,
    confirmations: watch::Sender<u64>,
    outstanding: Arc<Mutex<Outstanding>>,
    task: JoinHandle<()>,
}

impl LeWriter {
    fn send(&self, payload: Vec<u8>) -> Result<(), &'static str> {
        let mut outstanding = self.outstanding.lock();
        if outstanding.closed {
            return Err("writer stopped");
        }
        match self.tx.try_send(payload) {
            Ok(()) => {
                outstanding.count += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err("write queue full"),
            Err(mpsc::error::TrySendError::Closed(_)) => Err("writer stopped"),
        }
    }

    /// Stop reporting outcomes. Returns how many payloads never got one.
    fn close(&self) -> usize {
        let mut outstanding = self.outstanding.lock();
        outstanding.closed = true;
        outstanding.count
    }
}

impl Drop for LeWriter {
    fn drop(&mut self) {
        self.outstanding.lock().closed = true;
        self.task.abort();
    }
}

struct LeSlot {
    generation: u64,
    phase: LePhase,
    device: Option<Device>,
    handle: Option<Arc<dyn GattHandle>>,
    characteristic: Option<GattCharacteristic>,
    connect_task: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    writer: Option<LeWriter>,
    /// Payload of a `write` that had to connect first.
    pending: Option<Vec<u8>>,
}

impl LeSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: LePhase::Idle,
            device: None,
            handle: None,
            characteristic: None,
            connect_task: None,
            watchdog: None,
            writer: None,
            pending: None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.phase != LePhase::Idle
    }

    /// Count of accepted writes that will now never complete: the ones the
    /// writer holds plus a write still waiting for the link to come up.
    fn abandon_writes(&mut self) -> usize {
        let queued = self.writer.as_ref().map(LeWriter::close).unwrap_or(0);
        queued + usize::from(self.pending.take().is_some())
    }

    /// Reset to idle. The handle is returned so the caller can disconnect it
    /// after releasing the lock.
    fn teardown(&mut self) -> (Option<Device>, Option<Arc<dyn GattHandle>>) {
        self.generation += 1;
        self.phase = LePhase::Idle;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
        self.writer = None;
        self.characteristic = None;
        self.pending = None;
        (self.device.take(), self.handle.take())
    }
}

struct LeInner {
    this: Weak<LeInner>,
    connector: Arc<dyn GattConnector>,
    emitter: Emitter,
    settings: LeSettings,
    slot: Mutex<LeSlot>,
}

/// GATT client link.
#[derive(Clone)]
pub struct LeClient {
    inner: Arc<LeInner>,
}

impl LeClient {
    pub fn new(connector: Arc<dyn GattConnector>, emitter: Emitter, settings: LeSettings) -> Self {
        let inner = Arc::new_cyclic(|this| LeInner {
            this: this.clone(),
            connector,
            emitter,
            settings,
            slot: Mutex::new(LeSlot::new()),
        });
        Self { inner }
    }

    /// Connect to `device`. See the module docs for the phases.
    pub fn connect(&self, device: &Device) {
        {
            let slot = self.inner.slot.lock();
            if let Some(current) = slot.device.as_ref() {
                if slot.phase == LePhase::Ready && current == device {
                    drop(slot);
                    debug!("Already connected to {}", device);
                    self.inner.emitter.emit(BluetoothEvent::Connected {
                        device: device.clone(),
                        detail: ConnectedDetail::AlreadyConnected,
                    });
                    return;
                }
                if slot.phase != LePhase::Ready {
                    warn!(
                        "Connect to {} already in flight, ignoring request for {}",
                        current, device
                    );
                    return;
                }
            }
        }
        self.inner.start_connect(device.clone(), None);
    }

    /// Send `payload` to `device`.
    ///
    /// Idle (or connected elsewhere): connects and sends once ready.
    /// Mid-setup: refused with `WriteFailed`.
    pub fn write(&self, device: &Device, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        let refused = {
            let slot = self.inner.slot.lock();
            let ready_here =
                slot.phase == LePhase::Ready && slot.device.as_ref() == Some(device);
            if ready_here {
                match slot.writer.as_ref().map(|w| w.send(payload)) {
                    Some(Ok(())) => return,
                    Some(Err(reason)) => reason.to_string(),
                    None => "writer stopped".to_string(),
                }
            } else if matches!(slot.phase, LePhase::Idle | LePhase::Ready) {
                drop(slot);
                self.inner.start_connect(device.clone(), Some(payload));
                return;
            } else {
                format!("link not ready ({:?})", slot.phase)
            }
        };
        warn!("LE write to {} refused: {}", device, refused);
        self.inner
            .emitter
            .emit(BluetoothEvent::WriteFailed { reason: refused });
    }

    /// Tear down the GATT connection and stop all workers.
    pub fn disconnect(&self) -> Option<Device> {
        let (device, handle) = self.inner.slot.lock().teardown();
        if let Some(handle) = handle {
            handle.disconnect();
        }
        if let Some(device) = &device {
            info!("Disconnected from {}", device);
        }
        device
    }

    pub fn shutdown(&self) {
        self.inner.emitter.destroy();
        self.disconnect();
    }

    pub fn phase(&self) -> LePhase {
        self.inner.slot.lock().phase
    }

    pub fn state(&self) -> LinkState {
        self.phase().link_state()
    }

    pub fn connected_device(&self) -> Option<Device> {
        let slot = self.inner.slot.lock();
        match slot.phase {
            LePhase::Ready => slot.device.clone(),
            _ => None,
        }
    }

    pub fn connecting_device(&self) -> Option<Device> {
        let slot = self.inner.slot.lock();
        match slot.phase {
            LePhase::Idle | LePhase::Ready => None,
            _ => slot.device.clone(),
        }
    }

    pub fn is_connected_to(&self, device: &Device) -> bool {
        self.connected_device().as_ref() == Some(device)
    }
}

impl LeInner {
    fn start_connect(&self, device: Device, pending: Option<Vec<u8>>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let (generation, previous) = {
            let mut slot = self.slot.lock();
            let (previous, handle) = slot.teardown();
            slot.phase = LePhase::Connecting;
            slot.device = Some(device.clone());
            slot.pending = pending;
            (slot.generation, previous.zip(handle))
        };
        if let Some((previous, handle)) = previous {
            info!("Closing GATT link to {} before connecting to {}", previous, device);
            handle.disconnect();
        }

        self.emitter.emit(BluetoothEvent::Connecting {
            device: device.clone(),
        });

        let task = tokio::spawn(this.connect_worker(device, generation));
        let mut slot = self.slot.lock();
        if slot.is_current(generation) && slot.phase == LePhase::Connecting {
            slot.connect_task = Some(task);
        } else if !slot.is_current(generation) {
            task.abort();
        }
    }

    async fn connect_worker(self: Arc<Self>, device: Device, generation: u64) {
        info!("Connecting GATT to {}", device);
        let callbacks: Arc<dyn GattCallbacks> = Arc::new(LinkCallbacks {
            inner: self.this.clone(),
            generation,
        });

        let handle = match self.connector.connect_gatt(&device, callbacks).await {
            Ok(handle) => handle,
            Err(e) => {
                {
                    let mut slot = self.slot.lock();
                    if !slot.is_current(generation) {
                        return;
                    }
                    slot.teardown();
                }
                warn!("GATT connect to {} failed: {}", device, e);
                self.emitter.emit(BluetoothEvent::ConnectFailed {
                    device,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let mut slot = self.slot.lock();
        if !slot.is_current(generation) {
            drop(slot);
            debug!("Dropping stale GATT connection to {}", device);
            handle.disconnect();
            return;
        }
        info!("GATT connected to {}, discovering services", device);
        slot.handle = Some(handle);
        slot.phase = LePhase::ServiceDiscovery;
        slot.connect_task = None;
        slot.watchdog = Some(tokio::spawn(self.clone().watchdog(generation)));
    }

    /// Settle, ask for services, then fail the connect if setup has not
    /// finished within the discovery timeout.
    async fn watchdog(self: Arc<Self>, generation: u64) {
        tokio::time::sleep(self.settings.discovery_settle).await;

        let handle = {
            let slot = self.slot.lock();
            if !slot.is_current(generation) {
                return;
            }
            slot.handle.clone()
        };
        let Some(handle) = handle else {
            self.emit_unknown("GATT handle missing before service discovery");
            return;
        };
        debug!("Starting service discovery");
        if !handle.discover_services() {
            warn!("Service discovery request refused");
        }

        tokio::time::sleep(self.settings.discovery_timeout).await;

        let (device, handle, reason) = {
            let mut slot = self.slot.lock();
            if !slot.is_current(generation) || slot.phase == LePhase::Ready {
                return;
            }
            let reason = match slot.phase {
                LePhase::EnablingNotifications => "enabling notifications timed out",
                _ => "service discovery timed out",
            };
            slot.watchdog = None;
            let (device, handle) = slot.teardown();
            (device, handle, reason)
        };
        if let Some(handle) = handle {
            handle.disconnect();
        }
        if let Some(device) = device {
            warn!("Connect to {} failed: {}", device, reason);
            self.emitter.emit(BluetoothEvent::ConnectFailed {
                device,
                reason: reason.to_string(),
            });
        }
    }

    fn emit_unknown(&self, reason: &str) {
        warn!("Unknown GATT error: {}", reason);
        self.emitter.emit(BluetoothEvent::Unknown {
            reason: reason.to_string(),
        });
    }

    fn fail_connect(&self, generation: u64, reason: &str) {
        let (device, handle) = {
            let mut slot = self.slot.lock();
            if !slot.is_current(generation) {
                return;
            }
            slot.teardown()
        };
        if let Some(handle) = handle {
            handle.disconnect();
        }
        if let Some(device) = device {
            warn!("Connect to {} failed: {}", device, reason);
            self.emitter.emit(BluetoothEvent::ConnectFailed {
                device,
                reason: reason.to_string(),
            });
        }
    }

    fn on_connection_state_change(
        &self,
        generation: u64,
        status: i32,
        state: GattConnectionState,
    ) {
        if !self.slot.lock().is_current(generation) {
            return;
        }
        if status == GATT_ERROR {
            self.emit_unknown("GATT error 133, device must be rescanned");
        }

        match state {
            GattConnectionState::Connected => {
                let has_handle = {
                    let slot = self.slot.lock();
                    if !slot.is_current(generation) {
                        return;
                    }
                    slot.handle.is_some()
                };
                if has_handle {
                    debug!("GATT link up");
                } else {
                    self.emit_unknown("GATT handle missing on connect");
                }
            }
            GattConnectionState::Disconnected => {
                let (device, handle, abandoned) = {
                    let mut slot = self.slot.lock();
                    if !slot.is_current(generation) {
                        return;
                    }
                    let abandoned = slot.abandon_writes();
                    let (device, handle) = slot.teardown();
                    (device, handle, abandoned)
                };
                if let Some(handle) = handle {
                    handle.disconnect();
                }
                info!("GATT link dropped with {} writes outstanding", abandoned);
                self.emitter.emit(BluetoothEvent::Disconnected { device });
                for _ in 0..abandoned {
                    self.emitter.emit(BluetoothEvent::WriteFailed {
                        reason: "link lost".to_string(),
                    });
                }
            }
        }
    }

    fn on_services_discovered(&self, generation: u64, status: i32) {
        if status != GATT_SUCCESS {
            warn!("Service discovery finished with status {}", status);
            return;
        }

        let (handle, device) = {
            let slot = self.slot.lock();
            if !slot.is_current(generation) {
                return;
            }
            if slot.phase != LePhase::ServiceDiscovery {
                debug!("Ignoring discovery result in {:?}", slot.phase);
                return;
            }
            (slot.handle.clone(), slot.device.clone())
        };
        let Some(handle) = handle else {
            self.emit_unknown("GATT handle missing after service discovery");
            return;
        };

        let services = handle.services();
        debug!("Discovered {} services", services.len());
        let characteristic = services
            .into_iter()
            .flat_map(|service| service.characteristics)
            .find(|c| c.uuid == self.settings.send_characteristic);

        let Some(characteristic) = characteristic else {
            self.fail_connect(generation, "send characteristic not found");
            return;
        };
        debug!(
            "Send characteristic {} in service {}",
            characteristic.uuid, characteristic.service
        );

        {
            let mut slot = self.slot.lock();
            if !slot.is_current(generation) || slot.phase != LePhase::ServiceDiscovery {
                return;
            }
            slot.phase = LePhase::EnablingNotifications;
            slot.characteristic = Some(characteristic.clone());
        }

        if !handle.set_characteristic_notification(&characteristic, true) {
            warn!("Enabling notifications was refused");
        }
        if let Some(device) = device {
            self.emitter.emit(BluetoothEvent::Connected {
                device,
                detail: ConnectedDetail::ListenerArmed,
            });
        }

        let issued = self.write_notify_descriptors(handle.as_ref(), &characteristic);
        if issued == 0 {
            debug!("No descriptor writes issued, link ready");
            self.mark_ready(generation);
        }
    }

    /// Write the client configuration descriptor, or every descriptor by
    /// notify/indicate property when it is absent. Returns the writes issued.
    fn write_notify_descriptors(
        &self,
        handle: &dyn GattHandle,
        characteristic: &GattCharacteristic,
    ) -> usize {
        let descriptor = self.settings.notify_descriptor;
        if characteristic.has_descriptor(descriptor) {
            return usize::from(handle.write_descriptor(
                characteristic,
                descriptor,
                &ENABLE_NOTIFICATION_VALUE,
            ));
        }

        debug!("No client config descriptor, using fallback notification setup");
        let value: &[u8] = if characteristic.properties.notify {
            &ENABLE_NOTIFICATION_VALUE
        } else if characteristic.properties.indicate {
            &ENABLE_INDICATION_VALUE
        } else {
            return 0;
        };
        let mut issued = 0;
        for uuid in &characteristic.descriptors {
            if handle.write_descriptor(characteristic, *uuid, value) {
                issued += 1;
            }
        }
        issued
    }

    fn mark_ready(&self, generation: u64) {
        let device = {
            let mut slot = self.slot.lock();
            if !slot.is_current(generation) || slot.phase != LePhase::EnablingNotifications {
                return;
            }
            let (Some(handle), Some(characteristic)) =
                (slot.handle.clone(), slot.characteristic.clone())
            else {
                return;
            };

            let (tx, rx) = mpsc::channel(self.settings.write_queue_depth.max(1));
            let (confirmations, confirmed) = watch::channel(0u64);
            let outstanding = Arc::new(Mutex::new(Outstanding::default()));
            let sink = CharacteristicSink {
                handle,
                characteristic,
            };
            let task = tokio::spawn(write_loop(
                sink,
                rx,
                confirmed,
                outstanding.clone(),
                self.emitter.clone(),
                self.settings.chunk_size,
                self.settings.send_speed.timing(),
            ));

            slot.phase = LePhase::Ready;
            slot.writer = Some(LeWriter {
                tx,
                confirmations,
                outstanding,
                task,
            });
            if let Some(task) = slot.watchdog.take() {
                task.abort();
            }
            slot.device.clone()
        };

        let Some(device) = device else {
            return;
        };
        info!("LE link to {} ready", device);
        self.emitter.emit(BluetoothEvent::ConnectSucceeded { device });

        let refused = {
            let mut slot = self.slot.lock();
            if !slot.is_current(generation) {
                return;
            }
            let Some(payload) = slot.pending.take() else {
                return;
            };
            match slot.writer.as_ref() {
                Some(writer) => writer.send(payload).is_err(),
                None => true,
            }
        };
        if refused {
            self.emitter.emit(BluetoothEvent::WriteFailed {
                reason: "writer stopped".to_string(),
            });
        }
    }

    fn on_descriptor_write(&self, generation: u64, descriptor: Uuid, success: bool) {
        if !success {
            warn!("Descriptor {} write failed", descriptor);
            return;
        }
        debug!("Descriptor {} written", descriptor);
        self.mark_ready(generation);
    }

    fn on_characteristic_write(&self, generation: u64, success: bool) {
        let slot = self.slot.lock();
        if slot.generation != generation {
            return;
        }
        match (&slot.writer, success) {
            (Some(writer), true) => writer.confirmations.send_modify(|n| *n += 1),
            (_, false) => warn!("Characteristic write reported failure"),
            (None, true) => {}
        }
    }

    fn on_characteristic_changed(&self, generation: u64, value: &[u8]) {
        if !self.slot.lock().is_current(generation) {
            return;
        }
        let text = String::from_utf8_lossy(value).into_owned();
        debug!("Notification: {} bytes", value.len());
        self.emitter.emit(BluetoothEvent::ReadSucceeded { text });
    }
}

/// Callbacks bound to one connect attempt.
struct LinkCallbacks {
    inner: Weak<LeInner>,
    generation: u64,
}

impl GattCallbacks for LinkCallbacks {
    fn on_connection_state_change(&self, status: i32, state: GattConnectionState) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connection_state_change(self.generation, status, state);
        }
    }

    fn on_services_discovered(&self, status: i32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_services_discovered(self.generation, status);
        }
    }

    fn on_characteristic_changed(&self, _characteristic: Uuid, value: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_characteristic_changed(self.generation, value);
        }
    }

    fn on_characteristic_write(&self, _characteristic: Uuid, success: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_characteristic_write(self.generation, success);
        }
    }

    fn on_descriptor_write(&self, descriptor: Uuid, success: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_descriptor_write(self.generation, descriptor, success);
        }
    }
}

struct CharacteristicSink {
    handle: Arc<dyn GattHandle>,
    characteristic: GattCharacteristic,
}

impl ChunkSink for CharacteristicSink {
    fn write_chunk(&self, chunk: &[u8]) -> bool {
        self.handle.write_characteristic(&self.characteristic, chunk)
    }
}

async fn write_loop(
    sink: CharacteristicSink,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut confirmed: watch::Receiver<u64>,
    outstanding: Arc<Mutex<Outstanding>>,
    emitter: Emitter,
    chunk_size: usize,
    timing: FlowTiming,
) {
    while let Some(payload) = rx.recv().await {
        let result = flow::send_payload(&sink, &payload, chunk_size, timing, &mut confirmed).await;
        {
            let mut outstanding = outstanding.lock();
            if outstanding.closed {
                return;
            }
            outstanding.count = outstanding.count.saturating_sub(1);
        }
        match result {
            Ok(chunks) => {
                debug!("Payload of {} bytes confirmed in {} chunks", payload.len(), chunks);
                emitter.emit(BluetoothEvent::WriteSucceeded);
            }
            Err(e) => {
                warn!("LE write failed: {}", e);
                emitter.emit(BluetoothEvent::WriteFailed { reason: e.to_string() });
            }
        }
    }
}
