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

//! In-memory transports for driving the links without a radio.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use bt_link::bluetooth::constants::{CLIENT_CONFIG_DESCRIPTOR_UUID, SEND_CHARACTERISTIC_UUID};
use bt_link::bluetooth::{
    Address, AdapterStateListener, BluetoothAdapter, BluetoothEvent, CharacteristicProperties,
    Device, DeviceScanner, GattCallbacks, GattCharacteristic, GattConnector,
    GattHandle, GattService, RadioState, RfcommAcceptor, RfcommConnector, RfcommListener,
    RfcommStream, SearchCallbacks, SearchRequest, TransportError, TransportResult, Transports,
};

pub const PIPE_SIZE: usize = 4096;

pub fn classic_device(last: u8) -> Device {
    Device::classic(Address::new([0x00, 0x11, 0x22, 0x33, 0x44, last]), "phone")
}

pub fn le_device(last: u8) -> Device {
    Device::low_energy(Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last]), "watch")
}

/// Next event, failing the test if none arrives.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<BluetoothEvent>) -> BluetoothEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn next_events(
    rx: &mut mpsc::UnboundedReceiver<BluetoothEvent>,
    count: usize,
) -> Vec<BluetoothEvent> {
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        events.push(next_event(rx).await);
    }
    events
}

/// Assert nothing else is delivered for a while.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<BluetoothEvent>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Poll `condition` until it holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub async fn read_text(peer: &mut DuplexStream) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(30), peer.read(&mut buf))
        .await
        .expect("timed out reading peer")
        .expect("peer read failed");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct FakeAdapter {
    opened: AtomicBool,
    listener: Mutex<Option<Arc<dyn AdapterStateListener>>>,
    pub open_calls: AtomicUsize,
    pub discoverable: Mutex<Option<Duration>>,
    pub name: Mutex<String>,
    pub bonded: Mutex<Vec<Device>>,
}

impl FakeAdapter {
    pub fn new(opened: bool) -> Arc<Self> {
        Arc::new(Self {
            opened: AtomicBool::new(opened),
            listener: Mutex::new(None),
            open_calls: AtomicUsize::new(0),
            discoverable: Mutex::new(None),
            name: Mutex::new("fake-adapter".to_string()),
            bonded: Mutex::new(Vec::new()),
        })
    }

    /// Simulate the radio changing state on its own.
    pub fn set_radio(&self, state: RadioState) {
        self.opened.store(state == RadioState::Opened, Ordering::SeqCst);
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_state_changed(state);
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }
}

#[async_trait]
impl BluetoothAdapter for FakeAdapter {
    async fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    async fn open(&self) -> TransportResult<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.set_radio(RadioState::Opened);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.set_radio(RadioState::Closed);
        Ok(())
    }

    fn set_state_listener(&self, listener: Option<Arc<dyn AdapterStateListener>>) {
        *self.listener.lock() = listener;
    }

    async fn bonded_devices(&self) -> TransportResult<Vec<Device>> {
        Ok(self.bonded.lock().clone())
    }

    async fn create_bond(&self, device: &Device) -> TransportResult<()> {
        self.bonded.lock().push(device.clone());
        Ok(())
    }

    async fn set_discoverable(&self, duration: Duration) -> TransportResult<()> {
        *self.discoverable.lock() = Some(duration);
        Ok(())
    }

    async fn local_name(&self) -> TransportResult<String> {
        Ok(self.name.lock().clone())
    }

    async fn set_local_name(&self, name: &str) -> TransportResult<()> {
        *self.name.lock() = name.to_string();
        Ok(())
    }

    async fn local_address(&self) -> TransportResult<Address> {
        Ok(Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeScanner {
    active: Mutex<Option<Arc<dyn SearchCallbacks>>>,
    pub requests: Mutex<Vec<SearchRequest>>,
    pub fail: AtomicBool,
}

impl FakeScanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn found(&self, device: Device) {
        let active = self.active.lock().clone();
        if let Some(callbacks) = active {
            callbacks.on_device_found(device);
        }
    }

    /// Run the plan to completion.
    pub fn finish(&self) {
        let active = self.active.lock().take();
        if let Some(callbacks) = active {
            callbacks.on_search_stopped();
        }
    }

    pub fn searches(&self) -> usize {
        self.requests.lock().len()
    }
}

impl DeviceScanner for FakeScanner {
    fn search(
        &self,
        request: SearchRequest,
        callbacks: Arc<dyn SearchCallbacks>,
    ) -> TransportResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable("scanner busy"));
        }
        self.requests.lock().push(request);
        *self.active.lock() = Some(callbacks.clone());
        callbacks.on_search_started();
        Ok(())
    }

    fn stop_search(&self) {
        let active = self.active.lock().take();
        if let Some(callbacks) = active {
            callbacks.on_search_canceled();
        }
    }
}

// ---------------------------------------------------------------------------
// RFCOMM
// ---------------------------------------------------------------------------

/// How the next outbound connect behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
    /// Connects, but every write fails.
    BrokenWrite,
}

/// A stream that reads from its pipe and refuses every write.
pub struct BrokenWriteStream {
    inner: DuplexStream,
}

impl AsyncRead for BrokenWriteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BrokenWriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct FakeRfcommConnector {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    peers_tx: mpsc::UnboundedSender<DuplexStream>,
    peers: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    pub connects: Mutex<Vec<Device>>,
    blocked: AtomicBool,
    gate: Notify,
}

impl FakeRfcommConnector {
    pub fn new() -> Arc<Self> {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            peers_tx,
            peers: tokio::sync::Mutex::new(peers),
            connects: Mutex::new(Vec::new()),
            blocked: AtomicBool::new(false),
            gate: Notify::new(),
        })
    }

    /// Queue outcomes for the next connects. Unqueued connects succeed.
    pub fn push_outcomes(&self, outcomes: &[ConnectOutcome]) {
        self.outcomes.lock().extend(outcomes.iter().copied());
    }

    /// Hold connects until [`Self::release`].
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    /// Remote end of the next established connection.
    pub async fn next_peer(&self) -> DuplexStream {
        let mut peers = self.peers.lock().await;
        tokio::time::timeout(Duration::from_secs(30), peers.recv())
            .await
            .expect("timed out waiting for connect")
            .expect("connector dropped")
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }
}

#[async_trait]
impl RfcommConnector for FakeRfcommConnector {
    async fn connect(&self, device: &Device, _service: Uuid) -> TransportResult<RfcommStream> {
        self.connects.lock().push(device.clone());
        if self.blocked.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }

        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(ConnectOutcome::Accept);
        if outcome == ConnectOutcome::Refuse {
            return Err(TransportError::refused("connection refused"));
        }

        let (local, remote) = tokio::io::duplex(PIPE_SIZE);
        let _ = self.peers_tx.send(remote);
        match outcome {
            ConnectOutcome::BrokenWrite => Ok(Box::new(BrokenWriteStream { inner: local })),
            _ => Ok(Box::new(local)),
        }
    }
}

type Incoming = (DuplexStream, Device);

pub struct FakeAcceptor {
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>>,
    pub listens: AtomicUsize,
    pub fail_listen: AtomicBool,
}

impl FakeAcceptor {
    pub fn new() -> Arc<Self> {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        Arc::new(Self {
            incoming_tx,
            incoming: Arc::new(tokio::sync::Mutex::new(incoming)),
            listens: AtomicUsize::new(0),
            fail_listen: AtomicBool::new(false),
        })
    }

    /// A remote device connects; returns its end of the link.
    pub fn dial(&self, device: Device) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(PIPE_SIZE);
        let _ = self.incoming_tx.send((local, device));
        remote
    }

    pub fn listen_count(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RfcommAcceptor for FakeAcceptor {
    async fn listen(
        &self,
        _name: &str,
        _service: Uuid,
    ) -> TransportResult<Box<dyn RfcommListener>> {
        if self.fail_listen.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable("no adapter"));
        }
        self.listens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeListener {
            incoming: self.incoming.clone(),
        }))
    }
}

struct FakeListener {
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>>,
}

#[async_trait]
impl RfcommListener for FakeListener {
    async fn accept(&mut self) -> TransportResult<(RfcommStream, Device)> {
        let (stream, device) = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::other("acceptor closed"))?;
        Ok((Box::new(stream), device))
    }
}

// ---------------------------------------------------------------------------
// GATT
// ---------------------------------------------------------------------------

pub struct FakeGatt {
    pub confirm_writes: AtomicBool,
    /// Characteristic writes still allowed a confirmation.
    pub confirm_budget: Arc<AtomicUsize>,
    pub has_cccd: AtomicBool,
    pub respond_to_discovery: AtomicBool,
    pub has_send_characteristic: AtomicBool,
    pub refuse_connect: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: Arc<AtomicUsize>,
    pub chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    pub descriptor_writes: Arc<Mutex<Vec<(Uuid, Vec<u8>)>>>,
    callbacks: Mutex<Option<Arc<dyn GattCallbacks>>>,
}

impl FakeGatt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            confirm_writes: AtomicBool::new(true),
            confirm_budget: Arc::new(AtomicUsize::new(usize::MAX)),
            has_cccd: AtomicBool::new(true),
            respond_to_discovery: AtomicBool::new(true),
            has_send_characteristic: AtomicBool::new(true),
            refuse_connect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: Arc::new(AtomicUsize::new(0)),
            chunks: Arc::new(Mutex::new(Vec::new())),
            descriptor_writes: Arc::new(Mutex::new(Vec::new())),
            callbacks: Mutex::new(None),
        })
    }

    /// Callbacks of the most recent connection.
    pub fn callbacks(&self) -> Arc<dyn GattCallbacks> {
        self.callbacks.lock().clone().expect("no GATT connection yet")
    }

    /// Data chunks written so far, nudges excluded.
    pub fn data_chunks(&self) -> Vec<Vec<u8>> {
        self.chunks
            .lock()
            .iter()
            .filter(|c| !c.is_empty())
            .cloned()
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn services(&self) -> Vec<GattService> {
        let service = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
        let uuid = if self.has_send_characteristic.load(Ordering::SeqCst) {
            SEND_CHARACTERISTIC_UUID
        } else {
            Uuid::from_u128(0x0000ffe9_0000_1000_8000_00805f9b34fb)
        };
        let descriptors = if self.has_cccd.load(Ordering::SeqCst) {
            vec![CLIENT_CONFIG_DESCRIPTOR_UUID]
        } else {
            Vec::new()
        };
        vec![GattService {
            uuid: service,
            characteristics: vec![GattCharacteristic {
                uuid,
                service,
                properties: CharacteristicProperties {
                    write: true,
                    notify: true,
                    ..Default::default()
                },
                descriptors,
            }],
        }]
    }
}

#[async_trait]
impl GattConnector for FakeGatt {
    async fn connect_gatt(
        &self,
        _device: &Device,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> TransportResult<Arc<dyn GattHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::refused("gatt connect refused"));
        }
        *self.callbacks.lock() = Some(callbacks.clone());
        Ok(Arc::new(FakeGattHandle {
            callbacks,
            services: self.services(),
            respond_to_discovery: self.respond_to_discovery.load(Ordering::SeqCst),
            confirm_writes: self.confirm_writes.load(Ordering::SeqCst),
            confirm_budget: self.confirm_budget.clone(),
            chunks: self.chunks.clone(),
            descriptor_writes: self.descriptor_writes.clone(),
            disconnects: self.disconnects.clone(),
        }))
    }
}

struct FakeGattHandle {
    callbacks: Arc<dyn GattCallbacks>,
    services: Vec<GattService>,
    respond_to_discovery: bool,
    confirm_writes: bool,
    confirm_budget: Arc<AtomicUsize>,
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    descriptor_writes: Arc<Mutex<Vec<(Uuid, Vec<u8>)>>>,
    disconnects: Arc<AtomicUsize>,
}

impl GattHandle for FakeGattHandle {
    fn discover_services(&self) -> bool {
        if self.respond_to_discovery {
            let callbacks = self.callbacks.clone();
            tokio::spawn(async move { callbacks.on_services_discovered(0) });
        }
        true
    }

    fn services(&self) -> Vec<GattService> {
        self.services.clone()
    }

    fn set_characteristic_notification(&self, _: &GattCharacteristic, _: bool) -> bool {
        true
    }

    fn write_descriptor(&self, _: &GattCharacteristic, descriptor: Uuid, value: &[u8]) -> bool {
        self.descriptor_writes.lock().push((descriptor, value.to_vec()));
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move { callbacks.on_descriptor_write(descriptor, true) });
        true
    }

    fn write_characteristic(&self, characteristic: &GattCharacteristic, value: &[u8]) -> bool {
        self.chunks.lock().push(value.to_vec());
        let within_budget = self
            .confirm_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.confirm_writes && within_budget {
            let callbacks = self.callbacks.clone();
            let uuid = characteristic.uuid;
            tokio::spawn(async move { callbacks.on_characteristic_write(uuid, true) });
        }
        true
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Fakes {
    pub adapter: Arc<FakeAdapter>,
    pub scanner: Arc<FakeScanner>,
    pub connector: Arc<FakeRfcommConnector>,
    pub acceptor: Arc<FakeAcceptor>,
    pub gatt: Arc<FakeGatt>,
}

impl Fakes {
    pub fn new(radio_opened: bool) -> Self {
        Self {
            adapter: FakeAdapter::new(radio_opened),
            scanner: FakeScanner::new(),
            connector: FakeRfcommConnector::new(),
            acceptor: FakeAcceptor::new(),
            gatt: FakeGatt::new(),
        }
    }

    pub fn transports(&self) -> Transports {
        Transports {
            adapter: self.adapter.clone(),
            scanner: self.scanner.clone(),
            rfcomm_connector: self.connector.clone(),
            rfcomm_acceptor: self.acceptor.clone(),
            gatt: self.gatt.clone(),
        }
    }
}
