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

//! Transport primitives consumed by the links.
//!
//! These traits are the boundary to the OS Bluetooth stack: the adapter
//! toggle, the scanner, RFCOMM sockets and the GATT client. The links own
//! the handles they get back and never share them. A BlueZ implementation
//! lives in the `bluez` module; tests plug in in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::device::{Address, Device};

/// Broad classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Radio off or adapter missing.
    Unavailable,
    /// Remote refused or could not be reached.
    Refused,
    /// Socket-level I/O failure.
    Io,
    /// The stack did not answer in time.
    Timeout,
    /// The stack rejected the request outright.
    Rejected,
    Other,
}

/// Error returned by the transport primitives.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Refused, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Radio power state reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Opened,
    Closed,
}

/// Receives radio state changes.
pub trait AdapterStateListener: Send + Sync {
    fn on_state_changed(&self, state: RadioState);
}

/// The local Bluetooth adapter.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    async fn is_opened(&self) -> bool;

    /// Power the radio on. Completion is reported through the state listener.
    async fn open(&self) -> TransportResult<()>;

    /// Power the radio off.
    async fn close(&self) -> TransportResult<()>;

    /// Install (or remove) the single radio state listener.
    fn set_state_listener(&self, listener: Option<Arc<dyn AdapterStateListener>>);

    /// Devices paired at the OS level.
    async fn bonded_devices(&self) -> TransportResult<Vec<Device>>;

    async fn create_bond(&self, device: &Device) -> TransportResult<()>;

    async fn set_discoverable(&self, duration: Duration) -> TransportResult<()>;

    async fn local_name(&self) -> TransportResult<String>;

    async fn set_local_name(&self, name: &str) -> TransportResult<()>;

    async fn local_address(&self) -> TransportResult<Address>;
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Which radio a scan phase listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTransport {
    Classic,
    LowEnergy,
}

/// One step of a scan plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPhase {
    pub transport: ScanTransport,
    pub duration_ms: u64,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

fn default_repeat() -> u32 {
    1
}

impl SearchPhase {
    pub fn new(transport: ScanTransport, duration_ms: u64, repeat: u32) -> Self {
        Self {
            transport,
            duration_ms,
            repeat,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// An ordered scan plan, run once per search cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub phases: Vec<SearchPhase>,
}

impl Default for SearchRequest {
    /// LE for 5 s three times, Classic for 5 s, then a short LE sweep.
    fn default() -> Self {
        Self {
            phases: vec![
                SearchPhase::new(ScanTransport::LowEnergy, 5000, 3),
                SearchPhase::new(ScanTransport::Classic, 5000, 1),
                SearchPhase::new(ScanTransport::LowEnergy, 2000, 1),
            ],
        }
    }
}

/// Receives scan progress.
pub trait SearchCallbacks: Send + Sync {
    fn on_search_started(&self);
    fn on_device_found(&self, device: Device);
    /// The scan was stopped before the plan finished.
    fn on_search_canceled(&self);
    /// The plan ran to completion.
    fn on_search_stopped(&self);
}

/// Device discovery. Calls return immediately; progress arrives on the callbacks.
pub trait DeviceScanner: Send + Sync {
    fn search(&self, request: SearchRequest, callbacks: Arc<dyn SearchCallbacks>)
        -> TransportResult<()>;

    fn stop_search(&self);
}

// ---------------------------------------------------------------------------
// RFCOMM
// ---------------------------------------------------------------------------

/// A connected RFCOMM byte stream.
pub trait RfcommIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RfcommIo for T {}

pub type RfcommStream = Box<dyn RfcommIo>;

/// Opens outbound RFCOMM connections to a service record.
#[async_trait]
pub trait RfcommConnector: Send + Sync {
    async fn connect(&self, device: &Device, service: Uuid) -> TransportResult<RfcommStream>;
}

/// Opens listening RFCOMM sockets.
#[async_trait]
pub trait RfcommAcceptor: Send + Sync {
    async fn listen(&self, name: &str, service: Uuid)
        -> TransportResult<Box<dyn RfcommListener>>;
}

/// A listening socket. Dropping it closes it.
#[async_trait]
pub trait RfcommListener: Send {
    async fn accept(&mut self) -> TransportResult<(RfcommStream, Device)>;
}

// ---------------------------------------------------------------------------
// GATT
// ---------------------------------------------------------------------------

/// Status reported by successful GATT operations.
pub const GATT_SUCCESS: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// Owning service.
    pub service: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Asynchronous notifications from the GATT client.
///
/// Delivered on the stack's own context. Implementations must not block.
pub trait GattCallbacks: Send + Sync {
    fn on_connection_state_change(&self, status: i32, state: GattConnectionState);
    fn on_services_discovered(&self, status: i32);
    fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]);
    fn on_characteristic_write(&self, characteristic: Uuid, success: bool);
    fn on_descriptor_write(&self, descriptor: Uuid, success: bool);
}

/// An open GATT connection.
///
/// Requests return whether the stack accepted them; results arrive on the
/// [`GattCallbacks`] handed to [`GattConnector::connect_gatt`]. Only one
/// write may be in flight at a time.
pub trait GattHandle: Send + Sync {
    fn discover_services(&self) -> bool;
    fn services(&self) -> Vec<GattService>;
    fn set_characteristic_notification(&self, characteristic: &GattCharacteristic, enable: bool)
        -> bool;
    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;
    fn write_characteristic(&self, characteristic: &GattCharacteristic, value: &[u8]) -> bool;
    fn disconnect(&self);
}

/// Opens GATT connections.
#[async_trait]
pub trait GattConnector: Send + Sync {
    /// Resolves once the radio-level link is up.
    async fn connect_gatt(
        &self,
        device: &Device,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> TransportResult<Arc<dyn GattHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_search_plan() {
        let plan = SearchRequest::default();
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[0].transport, ScanTransport::LowEnergy);
        assert_eq!(plan.phases[0].repeat, 3);
        assert_eq!(plan.phases[1].transport, ScanTransport::Classic);
        assert_eq!(plan.phases[2].duration(), Duration::from_millis(2000));
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let refused: TransportError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope").into();
        assert_eq!(refused.kind, TransportErrorKind::Refused);
        let broken: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(broken.kind, TransportErrorKind::Io);
        assert_eq!(broken.to_string(), "pipe");
    }

    #[test]
    fn test_phase_repeat_defaults_to_one() {
        let phase: SearchPhase =
            toml::from_str("transport = \"classic\"\nduration_ms = 1000").unwrap();
        assert_eq!(phase.repeat, 1);
    }
}
