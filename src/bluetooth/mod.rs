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

//! Bluetooth links.
//!
//! Classic RFCOMM client and server, LE GATT client, and the
//! [`ConnectionManager`] that routes between them. Platform access goes
//! through the traits in [`transport`]; the BlueZ implementation lives in
//! `bluez` behind the `bluez` feature.

#[cfg(feature = "bluez")]
pub mod bluez;
mod classic_client;
mod classic_server;
pub mod constants;
mod device;
mod events;
pub mod flow;
mod le_client;
mod manager;
mod reconnect;
mod session;
pub mod transport;

pub use classic_client::ClassicClient;
pub use classic_server::ClassicServer;
pub use device::{Address, Device, InvalidAddress, TransportKind};
pub use events::{BluetoothEvent, ConnectedDetail, Emitter, EventChannel, EventKind, EventTap};
pub use flow::{ChunkFlow, FlowAction, FlowTiming, SendSpeed};
pub use le_client::{LeClient, LePhase, LeSettings};
pub use manager::{ConnectionManager, Transports};
pub use reconnect::{AutoReconnect, TickOutcome};
pub use session::SessionSettings;
pub use transport::{
    AdapterStateListener, BluetoothAdapter, CharacteristicProperties, DeviceScanner,
    GattCallbacks, GattCharacteristic, GattConnectionState, GattConnector, GattHandle,
    GattService, RadioState, RfcommAcceptor, RfcommConnector, RfcommListener, RfcommStream,
    ScanTransport, SearchCallbacks, SearchPhase, SearchRequest, TransportError,
    TransportErrorKind, TransportResult,
};
