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

//! BlueZ implementation of the transport primitives.
//!
//! Built on `bluer`. Classic links share one RFCOMM profile registered for
//! the service UUID; its connection requests are routed to the outbound
//! connect waiting for that address, or else to the listener queue. GATT
//! requests are spawned onto the runtime and report back through the
//! [`GattCallbacks`] like any other stack.

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Descriptor};
use bluer::rfcomm::{ConnectRequest, Profile, ReqError};
use bluer::{
    AdapterEvent, AdapterProperty, AddressType, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::constants::CLIENT_CONFIG_DESCRIPTOR_UUID;
use super::device::{Address, Device, TransportKind};
use super::manager::Transports;
use super::transport::{
    AdapterStateListener, BluetoothAdapter, CharacteristicProperties, DeviceScanner,
    GattCallbacks, GattCharacteristic, GattConnectionState, GattConnector, GattHandle,
    GattService, RadioState, RfcommAcceptor, RfcommConnector, RfcommListener, RfcommStream,
    ScanTransport, SearchCallbacks, SearchRequest, TransportError, TransportErrorKind,
    TransportResult, GATT_SUCCESS,
};

/// Status reported when a GATT request fails.
const GATT_FAILURE: i32 = 257;

/// How long an outbound connect waits for BlueZ to hand over the socket.
const PROFILE_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        let kind = match err.kind {
            bluer::ErrorKind::NotReady => TransportErrorKind::Unavailable,
            bluer::ErrorKind::ConnectionAttemptFailed => TransportErrorKind::Refused,
            bluer::ErrorKind::NotPermitted | bluer::ErrorKind::NotAuthorized => {
                TransportErrorKind::Rejected
            }
            _ => TransportErrorKind::Other,
        };
        TransportError::new(kind, err.to_string())
    }
}

fn to_bluer(address: Address) -> bluer::Address {
    bluer::Address::new(address.0)
}

fn from_bluer(address: bluer::Address) -> Address {
    Address::new(address.0)
}

/// Look up name and transport kind of a remote device.
async fn describe_device(adapter: &bluer::Adapter, address: bluer::Address) -> TransportResult<Device> {
    let device = adapter.device(address)?;
    let name = device.name().await.ok().flatten().unwrap_or_default();
    let kind = match device.address_type().await {
        Ok(AddressType::BrEdr) => TransportKind::Classic,
        Ok(_) => TransportKind::LowEnergy,
        Err(_) => TransportKind::Classic,
    };
    Ok(Device::new(from_bluer(address), name, kind))
}

/// Session and default adapter shared by all BlueZ transports.
pub struct Bluez {
    session: bluer::Session,
    adapter: bluer::Adapter,
}

impl Bluez {
    pub async fn new() -> TransportResult<Arc<Self>> {
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());
        Ok(Arc::new(Self { session, adapter }))
    }

    /// Build the full transport set on this adapter.
    pub async fn transports(self: &Arc<Self>) -> TransportResult<Transports> {
        let adapter = Arc::new(BluezAdapter::new(self.clone()).await?);
        let rfcomm = Arc::new(BluezRfcomm::new(self.clone()));
        Ok(Transports {
            adapter,
            scanner: Arc::new(BluezScanner::new(self.clone())),
            rfcomm_connector: rfcomm.clone(),
            rfcomm_acceptor: rfcomm,
            gatt: Arc::new(BluezGatt::new(self.clone())),
        })
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

type SharedListener = Arc<Mutex<Option<Arc<dyn AdapterStateListener>>>>;

pub struct BluezAdapter {
    bluez: Arc<Bluez>,
    listener: SharedListener,
    watcher: JoinHandle<()>,
}

impl BluezAdapter {
    async fn new(bluez: Arc<Bluez>) -> TransportResult<Self> {
        let listener: SharedListener = Arc::new(Mutex::new(None));
        let events = bluez.adapter.events().await?;
        let watcher = tokio::spawn(watch_power(events, listener.clone()));
        Ok(Self {
            bluez,
            listener,
            watcher,
        })
    }
}

async fn watch_power(
    events: impl futures::Stream<Item = AdapterEvent>,
    listener: SharedListener,
) {
    pin_mut!(events);
    while let Some(event) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let state = if powered {
                RadioState::Opened
            } else {
                RadioState::Closed
            };
            debug!("Adapter power changed: {:?}", state);
            let current = listener.lock().clone();
            if let Some(current) = current {
                current.on_state_changed(state);
            }
        }
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl BluetoothAdapter for BluezAdapter {
    async fn is_opened(&self) -> bool {
        self.bluez.adapter.is_powered().await.unwrap_or(false)
    }

    async fn open(&self) -> TransportResult<()> {
        self.bluez.adapter.set_powered(true).await?;
        self.bluez.adapter.set_pairable(true).await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.bluez.adapter.set_powered(false).await?;
        Ok(())
    }

    fn set_state_listener(&self, listener: Option<Arc<dyn AdapterStateListener>>) {
        *self.listener.lock() = listener;
    }

    async fn bonded_devices(&self) -> TransportResult<Vec<Device>> {
        let mut devices = Vec::new();
        for address in self.bluez.adapter.device_addresses().await? {
            let device = self.bluez.adapter.device(address)?;
            if device.is_paired().await.unwrap_or(false) {
                devices.push(describe_device(&self.bluez.adapter, address).await?);
            }
        }
        Ok(devices)
    }

    async fn create_bond(&self, device: &Device) -> TransportResult<()> {
        let remote = self.bluez.adapter.device(to_bluer(device.address))?;
        if !remote.is_paired().await? {
            remote.pair().await?;
        }
        Ok(())
    }

    async fn set_discoverable(&self, duration: Duration) -> TransportResult<()> {
        let secs = u32::try_from(duration.as_secs()).unwrap_or(u32::MAX);
        self.bluez.adapter.set_discoverable_timeout(secs).await?;
        self.bluez.adapter.set_discoverable(true).await?;
        Ok(())
    }

    async fn local_name(&self) -> TransportResult<String> {
        Ok(self.bluez.adapter.alias().await?)
    }

    async fn set_local_name(&self, name: &str) -> TransportResult<()> {
        self.bluez.adapter.set_alias(name.to_string()).await?;
        Ok(())
    }

    async fn local_address(&self) -> TransportResult<Address> {
        Ok(from_bluer(self.bluez.adapter.address().await?))
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct RunningSearch {
    task: JoinHandle<()>,
    callbacks: Arc<dyn SearchCallbacks>,
}

pub struct BluezScanner {
    bluez: Arc<Bluez>,
    running: Mutex<Option<RunningSearch>>,
}

impl BluezScanner {
    fn new(bluez: Arc<Bluez>) -> Self {
        Self {
            bluez,
            running: Mutex::new(None),
        }
    }
}

async fn run_search(
    adapter: bluer::Adapter,
    request: SearchRequest,
    callbacks: Arc<dyn SearchCallbacks>,
) {
    callbacks.on_search_started();

    for phase in &request.phases {
        for _ in 0..phase.repeat.max(1) {
            let filter = DiscoveryFilter {
                transport: match phase.transport {
                    ScanTransport::Classic => DiscoveryTransport::BrEdr,
                    ScanTransport::LowEnergy => DiscoveryTransport::Le,
                },
                ..Default::default()
            };
            if let Err(e) = adapter.set_discovery_filter(filter).await {
                warn!("Failed to set discovery filter: {}", e);
            }

            let events = match adapter.discover_devices().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Discovery failed: {}", e);
                    callbacks.on_search_stopped();
                    return;
                }
            };
            pin_mut!(events);

            let deadline = tokio::time::sleep(phase.duration());
            pin_mut!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            match describe_device(&adapter, address).await {
                                Ok(device) => callbacks.on_device_found(device),
                                Err(e) => debug!("Skipping {}: {}", address, e),
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }

    callbacks.on_search_stopped();
}

impl DeviceScanner for BluezScanner {
    fn search(
        &self,
        request: SearchRequest,
        callbacks: Arc<dyn SearchCallbacks>,
    ) -> TransportResult<()> {
        self.stop_search();
        let task = tokio::spawn(run_search(
            self.bluez.adapter.clone(),
            request,
            callbacks.clone(),
        ));
        *self.running.lock() = Some(RunningSearch { task, callbacks });
        Ok(())
    }

    fn stop_search(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            if !running.task.is_finished() {
                running.task.abort();
                running.callbacks.on_search_canceled();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RFCOMM
// ---------------------------------------------------------------------------

type PendingOutbound = Arc<Mutex<HashMap<bluer::Address, oneshot::Sender<ConnectRequest>>>>;

struct ProfileRouter {
    uuid: Uuid,
    outbound: PendingOutbound,
    inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<ConnectRequest>>>,
    listeners: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for ProfileRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct BluezRfcomm {
    bluez: Arc<Bluez>,
    router: tokio::sync::Mutex<Option<Arc<ProfileRouter>>>,
}

impl BluezRfcomm {
    fn new(bluez: Arc<Bluez>) -> Self {
        Self {
            bluez,
            router: tokio::sync::Mutex::new(None),
        }
    }

    /// Register the profile for `uuid` on first use.
    async fn router(&self, uuid: Uuid) -> TransportResult<Arc<ProfileRouter>> {
        let mut router = self.router.lock().await;
        if let Some(existing) = router.as_ref() {
            if existing.uuid == uuid {
                return Ok(existing.clone());
            }
            warn!("Re-registering RFCOMM profile for {}", uuid);
        }

        let profile = Profile {
            uuid,
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = self.bluez.session.register_profile(profile).await?;
        info!("RFCOMM profile registered (UUID: {})", uuid);

        let outbound: PendingOutbound = Arc::new(Mutex::new(HashMap::new()));
        let listeners = Arc::new(AtomicUsize::new(0));
        let (inbound_tx, inbound_rx) = mpsc::channel(4);

        let task = {
            let outbound = outbound.clone();
            let listeners = listeners.clone();
            tokio::spawn(async move {
                while let Some(request) = handle.next().await {
                    let address = request.device();
                    let waiting = outbound.lock().remove(&address);
                    if let Some(waiting) = waiting {
                        if let Err(request) = waiting.send(request) {
                            request.reject(ReqError::Canceled);
                        }
                    } else if listeners.load(Ordering::SeqCst) == 0 {
                        debug!("Rejecting {}, not accepting", address);
                        request.reject(ReqError::Rejected);
                    } else if let Err(e) = inbound_tx.try_send(request) {
                        warn!("Inbound RFCOMM queue full, rejecting {}", address);
                        if let mpsc::error::TrySendError::Full(request) = e {
                            request.reject(ReqError::Rejected);
                        }
                    }
                }
                warn!("RFCOMM profile handle closed");
            })
        };

        let registered = Arc::new(ProfileRouter {
            uuid,
            outbound,
            inbound: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            listeners,
            task,
        });
        *router = Some(registered.clone());
        Ok(registered)
    }
}

#[async_trait]
impl RfcommConnector for BluezRfcomm {
    async fn connect(&self, device: &Device, service: Uuid) -> TransportResult<RfcommStream> {
        let router = self.router(service).await?;
        let address = to_bluer(device.address);
        let remote = self.bluez.adapter.device(address)?;

        let (tx, rx) = oneshot::channel();
        router.outbound.lock().insert(address, tx);

        let result = async {
            remote.connect_profile(&service).await?;
            let request = tokio::time::timeout(PROFILE_CONNECT_TIMEOUT, rx)
                .await
                .map_err(|_| TransportError::new(TransportErrorKind::Timeout, "profile connect timed out"))?
                .map_err(|_| TransportError::other("profile handle closed"))?;
            let stream = request.accept()?;
            Ok::<RfcommStream, TransportError>(Box::new(stream))
        }
        .await;

        router.outbound.lock().remove(&address);
        result
    }
}

#[async_trait]
impl RfcommAcceptor for BluezRfcomm {
    async fn listen(&self, _name: &str, service: Uuid) -> TransportResult<Box<dyn RfcommListener>> {
        let router = self.router(service).await?;
        router.listeners.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(BluezListener {
            adapter: self.bluez.adapter.clone(),
            router,
        }))
    }
}

struct BluezListener {
    adapter: bluer::Adapter,
    router: Arc<ProfileRouter>,
}

impl Drop for BluezListener {
    fn drop(&mut self) {
        self.router.listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RfcommListener for BluezListener {
    async fn accept(&mut self) -> TransportResult<(RfcommStream, Device)> {
        let request = self
            .router
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::other("profile handle closed"))?;
        let address = request.device();
        let stream = request.accept()?;
        let device = match describe_device(&self.adapter, address).await {
            Ok(device) => device,
            Err(_) => Device::classic(from_bluer(address), ""),
        };
        Ok((Box::new(stream), device))
    }
}

// ---------------------------------------------------------------------------
// GATT
// ---------------------------------------------------------------------------

pub struct BluezGatt {
    bluez: Arc<Bluez>,
}

impl BluezGatt {
    fn new(bluez: Arc<Bluez>) -> Self {
        Self { bluez }
    }
}

#[async_trait]
impl GattConnector for BluezGatt {
    async fn connect_gatt(
        &self,
        device: &Device,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> TransportResult<Arc<dyn GattHandle>> {
        let remote = self.bluez.adapter.device(to_bluer(device.address))?;
        if !remote.is_connected().await? {
            remote.connect().await?;
        }

        let events = remote.events().await?;
        let handle = Arc::new(BluezGattHandle {
            device: remote,
            callbacks: callbacks.clone(),
            services: Arc::new(Mutex::new(Vec::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            writing: Arc::new(AtomicBool::new(false)),
            subscribed: watch::channel(None).0,
            tasks: Mutex::new(Vec::new()),
        });
        handle.track(tokio::spawn(watch_connection(events, callbacks)));
        Ok(handle)
    }
}

async fn watch_connection(
    events: impl futures::Stream<Item = DeviceEvent>,
    callbacks: Arc<dyn GattCallbacks>,
) {
    pin_mut!(events);
    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            callbacks.on_connection_state_change(GATT_SUCCESS, GattConnectionState::Disconnected);
            return;
        }
    }
}

type DescriptorMap = HashMap<Uuid, Descriptor>;

/// Wait for the notify subscription to settle. A handle dropped first
/// counts as a failed subscription.
async fn subscription_outcome(mut state: watch::Receiver<Option<bool>>) -> bool {
    match state.wait_for(Option::is_some).await {
        Ok(outcome) => *outcome == Some(true),
        Err(_) => false,
    }
}

struct BluezGattHandle {
    device: bluer::Device,
    callbacks: Arc<dyn GattCallbacks>,
    services: Arc<Mutex<Vec<GattService>>>,
    characteristics: Arc<Mutex<HashMap<Uuid, (Characteristic, DescriptorMap)>>>,
    writing: Arc<AtomicBool>,
    /// Outcome of the notify subscription, `None` until it settles.
    subscribed: watch::Sender<Option<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BluezGattHandle {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn characteristic(&self, uuid: Uuid) -> Option<(Characteristic, DescriptorMap)> {
        self.characteristics.lock().get(&uuid).cloned()
    }
}

type Discovered = (
    Vec<GattService>,
    HashMap<Uuid, (Characteristic, DescriptorMap)>,
);

async fn discover(device: &bluer::Device) -> bluer::Result<Discovered> {
    let mut services = Vec::new();
    let mut handles = HashMap::new();

    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            let flags = characteristic.flags().await?;
            let mut descriptors = DescriptorMap::new();
            for descriptor in characteristic.descriptors().await? {
                descriptors.insert(descriptor.uuid().await?, descriptor);
            }
            characteristics.push(GattCharacteristic {
                uuid,
                service: service_uuid,
                properties: CharacteristicProperties {
                    read: flags.read,
                    write: flags.write,
                    write_without_response: flags.write_without_response,
                    notify: flags.notify,
                    indicate: flags.indicate,
                },
                descriptors: descriptors.keys().copied().collect(),
            });
            handles.insert(uuid, (characteristic, descriptors));
        }
        services.push(GattService {
            uuid: service_uuid,
            characteristics,
        });
    }
    Ok((services, handles))
}

impl GattHandle for BluezGattHandle {
    fn discover_services(&self) -> bool {
        let device = self.device.clone();
        let callbacks = self.callbacks.clone();
        let services = self.services.clone();
        let characteristics = self.characteristics.clone();
        self.track(tokio::spawn(async move {
            match discover(&device).await {
                Ok((found, handles)) => {
                    *services.lock() = found;
                    *characteristics.lock() = handles;
                    callbacks.on_services_discovered(GATT_SUCCESS);
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    callbacks.on_services_discovered(GATT_FAILURE);
                }
            }
        }));
        true
    }

    fn services(&self) -> Vec<GattService> {
        self.services.lock().clone()
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> bool {
        if !enable {
            return true;
        }
        let Some((remote, _)) = self.characteristic(characteristic.uuid) else {
            return false;
        };
        let uuid = characteristic.uuid;
        let callbacks = self.callbacks.clone();
        let subscribed = self.subscribed.clone();
        self.track(tokio::spawn(async move {
            let values = match remote.notify().await {
                Ok(values) => values,
                Err(e) => {
                    warn!("Subscribing to {} failed: {}", uuid, e);
                    subscribed.send_replace(Some(false));
                    return;
                }
            };
            subscribed.send_replace(Some(true));
            pin_mut!(values);
            while let Some(value) = values.next().await {
                callbacks.on_characteristic_changed(uuid, &value);
            }
            debug!("Notification stream for {} ended", uuid);
        }));
        true
    }

    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        let callbacks = self.callbacks.clone();

        // BlueZ owns the client configuration descriptor and writes it when
        // the notify subscription starts
        if descriptor == CLIENT_CONFIG_DESCRIPTOR_UUID {
            let subscribed = self.subscribed.subscribe();
            self.track(tokio::spawn(async move {
                let success = subscription_outcome(subscribed).await;
                callbacks.on_descriptor_write(descriptor, success);
            }));
            return true;
        }

        let Some((_, descriptors)) = self.characteristic(characteristic.uuid) else {
            return false;
        };
        let Some(remote) = descriptors.get(&descriptor).cloned() else {
            return false;
        };
        let value = value.to_vec();
        self.track(tokio::spawn(async move {
            let result = remote.write(&value).await;
            if let Err(e) = &result {
                warn!("Descriptor {} write failed: {}", descriptor, e);
            }
            callbacks.on_descriptor_write(descriptor, result.is_ok());
        }));
        true
    }

    fn write_characteristic(&self, characteristic: &GattCharacteristic, value: &[u8]) -> bool {
        let Some((remote, _)) = self.characteristic(characteristic.uuid) else {
            return false;
        };
        if self.writing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let uuid = characteristic.uuid;
        let value = value.to_vec();
        let writing = self.writing.clone();
        let callbacks = self.callbacks.clone();
        self.track(tokio::spawn(async move {
            let result = remote.write(&value).await;
            writing.store(false, Ordering::SeqCst);
            if let Err(e) = &result {
                debug!("Characteristic write failed: {}", e);
            }
            callbacks.on_characteristic_write(uuid, result.is_ok());
        }));
        true
    }

    fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let device = self.device.clone();
        tokio::spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("GATT disconnect: {}", e);
            }
        });
    }
}
