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

//! Connection manager facade.
//!
//! Single entry point for upper layers. Owns the Classic client, the Classic
//! server and the LE client, routes `connect`/`write` by the device's
//! transport kind and wraps the adapter and scanner. Links report only
//! through the shared [`EventChannel`].

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::classic_client::ClassicClient;
use super::classic_server::ClassicServer;
use super::device::{Address, Device, TransportKind};
use super::events::{BluetoothEvent, ConnectedDetail, Emitter, EventChannel, EventTap};
use super::le_client::LeClient;
use super::transport::{
    AdapterStateListener, BluetoothAdapter, DeviceScanner, GattConnector, RadioState,
    RfcommAcceptor, RfcommConnector, SearchCallbacks, SearchRequest,
};
use crate::config::Config;
use crate::error::Result;
use crate::state::{LinkState, SharedState};
use crate::storage::AutoConnectStore;

/// The transport primitives the manager is built on.
#[derive(Clone)]
pub struct Transports {
    pub adapter: Arc<dyn BluetoothAdapter>,
    pub scanner: Arc<dyn DeviceScanner>,
    pub rfcomm_connector: Arc<dyn RfcommConnector>,
    pub rfcomm_acceptor: Arc<dyn RfcommAcceptor>,
    pub gatt: Arc<dyn GattConnector>,
}

pub struct ConnectionManager {
    adapter: Arc<dyn BluetoothAdapter>,
    scanner: Arc<dyn DeviceScanner>,
    channel: EventChannel,
    emitter: Emitter,
    classic_client: ClassicClient,
    classic_server: ClassicServer,
    le_client: LeClient,
    state: Arc<SharedState>,
    store: Arc<dyn AutoConnectStore>,
    search_request: SearchRequest,
    search_listener: Arc<SearchListener>,
}

impl ConnectionManager {
    /// Build the manager and its links. Must be called inside a tokio runtime.
    pub fn new(
        transports: Transports,
        config: &Config,
        store: Arc<dyn AutoConnectStore>,
    ) -> Arc<Self> {
        let channel = EventChannel::new();
        let state = SharedState::new();
        state.set_auto_connect_target(store.load());
        if let Some(target) = state.auto_connect_target() {
            info!("Remembered auto-connect peer: {}", target);
        }

        let session_settings = config.classic.session_settings();
        let classic_client = ClassicClient::new(
            transports.rfcomm_connector,
            Emitter::new(channel.clone()),
            config.classic.service_uuid,
            session_settings,
        );
        let classic_server = ClassicServer::new(
            transports.rfcomm_acceptor,
            Emitter::new(channel.clone()),
            config.classic.service_name.clone(),
            config.classic.service_uuid,
            session_settings,
        );
        let le_client = LeClient::new(
            transports.gatt,
            Emitter::new(channel.clone()),
            config.le.settings(config.classic.write_queue_depth),
        );

        let emitter = Emitter::new(channel.clone());
        channel.add_tap(Arc::new(Bookkeeper {
            state: state.clone(),
            store: store.clone(),
            give_up_after: config.reconnect.give_up_after,
        }));

        let manager = Arc::new(ConnectionManager {
            adapter: transports.adapter,
            scanner: transports.scanner,
            channel,
            emitter: emitter.clone(),
            classic_client,
            classic_server,
            le_client,
            state: state.clone(),
            store,
            search_request: config.search.clone(),
            search_listener: Arc::new(SearchListener { state, emitter }),
        });

        manager
            .adapter
            .set_state_listener(Some(Arc::new(RadioListener {
                manager: Arc::downgrade(&manager),
            })));
        manager
    }

    // -- Observer ----------------------------------------------------------

    /// Register the observer, replacing any previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BluetoothEvent> {
        self.channel.subscribe()
    }

    pub fn unsubscribe(&self) {
        self.channel.unsubscribe();
    }

    pub fn add_tap(&self, tap: Arc<dyn EventTap>) {
        self.channel.add_tap(tap);
    }

    // -- Radio -------------------------------------------------------------

    pub async fn is_opened(&self) -> bool {
        self.adapter.is_opened().await
    }

    pub async fn open(&self) -> Result<()> {
        info!("Opening Bluetooth");
        self.adapter.open().await?;
        Ok(())
    }

    /// Tear everything down, then power the radio off.
    pub async fn close(&self) -> Result<()> {
        info!("Closing Bluetooth");
        self.stop_search();
        self.disconnect_links();
        self.adapter.close().await?;
        Ok(())
    }

    /// Search if the radio is on, otherwise switch it on.
    pub async fn open_and_search(&self) -> Result<()> {
        if self.is_opened().await {
            self.search()
        } else {
            self.open().await
        }
    }

    fn on_radio_state(&self, state: RadioState) {
        match state {
            RadioState::Opened => {
                info!("Bluetooth opened");
                self.emitter.emit(BluetoothEvent::RadioOpened);
            }
            RadioState::Closed => {
                info!("Bluetooth closed");
                self.stop_search();
                self.disconnect_links();
                self.state.clear_found();
                self.emitter.emit(BluetoothEvent::RadioClosed);
            }
        }
    }

    fn disconnect_links(&self) {
        self.classic_server.disconnect();
        self.classic_client.disconnect();
        self.le_client.disconnect();
    }

    // -- Discovery ---------------------------------------------------------

    /// Start the configured scan plan.
    pub fn search(&self) -> Result<()> {
        self.search_with(self.search_request.clone())
    }

    pub fn search_with(&self, request: SearchRequest) -> Result<()> {
        debug!("Starting search with {} phases", request.phases.len());
        self.state.set_searching(true);
        let listener: Arc<dyn SearchCallbacks> = self.search_listener.clone();
        if let Err(e) = self.scanner.search(request, listener) {
            self.state.set_searching(false);
            warn!("Search failed to start: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn stop_search(&self) {
        self.scanner.stop_search();
        self.state.set_searching(false);
    }

    pub fn is_searching(&self) -> bool {
        self.state.is_searching()
    }

    /// Devices found since the radio was last opened.
    pub fn searched_devices(&self) -> Vec<Device> {
        self.state.found_devices()
    }

    // -- Client ------------------------------------------------------------

    pub fn connect(&self, device: &Device) {
        match device.kind {
            TransportKind::LowEnergy => self.le_client.connect(device),
            TransportKind::Classic => self.classic_client.connect(device),
        }
    }

    pub fn write(&self, device: &Device, payload: impl Into<Vec<u8>>) {
        match device.kind {
            TransportKind::LowEnergy => self.le_client.write(device, payload),
            TransportKind::Classic => self.classic_client.write(device, payload),
        }
    }

    /// User-initiated disconnect of both client links.
    ///
    /// Forgets the auto-connect peer. Emits one `Disconnected` per link that
    /// was actually torn down, so repeated calls stay quiet.
    pub fn disconnect(&self) {
        let classic = self.classic_client.disconnect();
        let le = self.le_client.disconnect();
        self.forget_auto_connect();
        for device in classic.into_iter().chain(le) {
            self.emitter.emit(BluetoothEvent::Disconnected {
                device: Some(device),
            });
        }
    }

    /// Client state across both transports.
    pub fn client_state(&self) -> LinkState {
        match (self.classic_client.state(), self.le_client.state()) {
            (LinkState::Connected, _) | (_, LinkState::Connected) => LinkState::Connected,
            (LinkState::Connecting, _) | (_, LinkState::Connecting) => LinkState::Connecting,
            _ => LinkState::Idle,
        }
    }

    pub fn connected_device(&self) -> Option<Device> {
        self.classic_client
            .connected_device()
            .or_else(|| self.le_client.connected_device())
    }

    pub fn connecting_device(&self) -> Option<Device> {
        self.classic_client
            .connecting_device()
            .or_else(|| self.le_client.connecting_device())
    }

    pub fn classic_client(&self) -> &ClassicClient {
        &self.classic_client
    }

    pub fn le_client(&self) -> &LeClient {
        &self.le_client
    }

    // -- Server ------------------------------------------------------------

    pub fn start_accepting(&self) {
        self.classic_server.start_accepting();
    }

    pub fn stop_accepting(&self) {
        self.classic_server.stop_accepting();
    }

    pub fn server_write(&self, payload: impl Into<Vec<u8>>) {
        self.classic_server.write(payload);
    }

    pub fn server_disconnect(&self) -> Option<Device> {
        self.classic_server.disconnect()
    }

    pub fn accepted_device(&self) -> Option<Device> {
        self.classic_server.connected_device()
    }

    pub fn classic_server(&self) -> &ClassicServer {
        &self.classic_server
    }

    // -- Auto-connect target -----------------------------------------------

    pub fn auto_connect_target(&self) -> Option<Address> {
        self.state.auto_connect_target()
    }

    pub fn set_auto_connect_target(&self, address: Address) -> Result<()> {
        self.state.set_auto_connect_target(Some(address));
        self.store.save(address)
    }

    fn forget_auto_connect(&self) {
        if self.state.auto_connect_target().is_none() {
            return;
        }
        self.state.set_auto_connect_target(None);
        if let Err(e) = self.store.clear() {
            error!("Failed to clear auto-connect peer: {}", e);
        }
        info!("Auto-connect peer forgotten");
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.state
    }

    // -- Adapter -----------------------------------------------------------

    pub async fn bonded_devices(&self) -> Result<Vec<Device>> {
        Ok(self.adapter.bonded_devices().await?)
    }

    pub async fn create_bond(&self, device: &Device) -> Result<()> {
        self.adapter.create_bond(device).await?;
        Ok(())
    }

    pub async fn set_discoverable(&self, duration: Duration) -> Result<()> {
        self.adapter.set_discoverable(duration).await?;
        info!("Discoverable for {:?}", duration);
        Ok(())
    }

    pub async fn local_name(&self) -> Result<String> {
        Ok(self.adapter.local_name().await?)
    }

    pub async fn set_local_name(&self, name: &str) -> Result<()> {
        self.adapter.set_local_name(name).await?;
        info!("Bluetooth name set to: {}", name);
        Ok(())
    }

    pub async fn local_address(&self) -> Result<Address> {
        Ok(self.adapter.local_address().await?)
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Release everything. No event is delivered afterwards.
    pub fn shutdown(&self) {
        info!("Shutting down connection manager");
        self.adapter.set_state_listener(None);
        self.channel.unsubscribe();
        self.emitter.destroy();
        self.scanner.stop_search();
        self.state.set_searching(false);
        self.classic_server.shutdown();
        self.classic_client.shutdown();
        self.le_client.shutdown();
    }
}

struct RadioListener {
    manager: Weak<ConnectionManager>,
}

impl AdapterStateListener for RadioListener {
    fn on_state_changed(&self, state: RadioState) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_radio_state(state);
        }
    }
}

struct SearchListener {
    state: Arc<SharedState>,
    emitter: Emitter,
}

impl SearchCallbacks for SearchListener {
    fn on_search_started(&self) {
        self.state.set_searching(true);
        self.emitter.emit(BluetoothEvent::SearchStarted);
    }

    fn on_device_found(&self, device: Device) {
        if self.state.record_found(&device) {
            debug!("Found {:?}", device);
        }
        self.emitter.emit(BluetoothEvent::DeviceFound { device });
    }

    fn on_search_canceled(&self) {
        self.state.set_searching(false);
        self.emitter.emit(BluetoothEvent::SearchCanceled);
    }

    fn on_search_stopped(&self) {
        self.state.set_searching(false);
        self.emitter.emit(BluetoothEvent::SearchStopped);
    }
}

/// Keeps the auto-connect target in step with connection outcomes.
struct Bookkeeper {
    state: Arc<SharedState>,
    store: Arc<dyn AutoConnectStore>,
    give_up_after: u32,
}

impl EventTap for Bookkeeper {
    fn on_event(&self, event: &BluetoothEvent) {
        match event {
            BluetoothEvent::ConnectSucceeded { device }
            | BluetoothEvent::Connected {
                device,
                detail: ConnectedDetail::AlreadyConnected,
            } => {
                if self.state.auto_connect_target() == Some(device.address) {
                    self.state.reset_failures();
                    return;
                }
                self.state.set_auto_connect_target(Some(device.address));
                match self.store.save(device.address) {
                    Ok(()) => info!("Auto-connect peer is now {}", device.address),
                    Err(e) => error!("Failed to save auto-connect peer: {}", e),
                }
            }
            BluetoothEvent::ConnectFailed { device, .. } => {
                if self
                    .state
                    .record_connect_failure(device.address, self.give_up_after)
                {
                    warn!(
                        "Giving up on {} after {} failed connects",
                        device.address, self.give_up_after
                    );
                    if let Err(e) = self.store.clear() {
                        error!("Failed to clear auto-connect peer: {}", e);
                    }
                }
            }
            _ => {}
        }
    }
}
