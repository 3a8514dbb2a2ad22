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

//! Lifecycle events and the channel that delivers them.
//!
//! Every I/O worker reports through an [`EventChannel`]. The channel has at
//! most one observer (an unbounded mpsc receiver handed out by
//! [`EventChannel::subscribe`]) plus any number of in-process taps that the
//! connection manager uses for its own bookkeeping.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::device::Device;

/// Why a `Connected` event was emitted instead of a full connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedDetail {
    /// `connect` was called for the device the link is already connected to.
    AlreadyConnected,
    /// LE only: notifications are enabled, the descriptor write is pending.
    ListenerArmed,
}

/// Everything the core reports to its observer.
#[derive(Debug, Clone, PartialEq)]
pub enum BluetoothEvent {
    RadioOpened,
    RadioClosed,

    AcceptConnecting,
    AcceptConnected { device: Device },
    AcceptFailed { reason: String },

    Connecting { device: Device },
    Connected { device: Device, detail: ConnectedDetail },
    ConnectSucceeded { device: Device },
    ConnectFailed { device: Device, reason: String },
    Disconnected { device: Option<Device> },

    ReadSucceeded { text: String },
    ReadFailed { reason: String },
    WriteSucceeded,
    WriteFailed { reason: String },

    SearchStarted,
    DeviceFound { device: Device },
    SearchCanceled,
    SearchStopped,

    /// Transport-level anomaly; the device should be rescanned.
    Unknown { reason: String },
}

/// Flat event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BleOpen,
    BleClose,
    AcceptConnecting,
    AcceptConnectSuccess,
    AcceptConnectFailed,
    Connecting,
    Connected,
    ConnectSuccess,
    ConnectFailed,
    Disconnected,
    ReadSuccess,
    ReadFailed,
    WriteSuccess,
    WriteFailed,
    SearchStart,
    SearchDevice,
    SearchCancel,
    SearchStop,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BleOpen => "BLE_OPEN",
            EventKind::BleClose => "BLE_CLOSE",
            EventKind::AcceptConnecting => "ACCEPT_CONNECTING",
            EventKind::AcceptConnectSuccess => "ACCEPT_CONNECT_SUCCESS",
            EventKind::AcceptConnectFailed => "ACCEPT_CONNECT_FAILED",
            EventKind::Connecting => "CONNECTING",
            EventKind::Connected => "CONNECTED",
            EventKind::ConnectSuccess => "CONNECT_SUCCESS",
            EventKind::ConnectFailed => "CONNECT_FAILED",
            EventKind::Disconnected => "DISCONNECTED",
            EventKind::ReadSuccess => "READ_SUCCESS",
            EventKind::ReadFailed => "READ_FAILED",
            EventKind::WriteSuccess => "WRITE_SUCCESS",
            EventKind::WriteFailed => "WRITE_FAILED",
            EventKind::SearchStart => "SEARCH_START",
            EventKind::SearchDevice => "SEARCH_DEVICE",
            EventKind::SearchCancel => "SEARCH_CANCEL",
            EventKind::SearchStop => "SEARCH_STOP",
            EventKind::Unknown => "UNKNOWN",
        }
    }
}

impl BluetoothEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BluetoothEvent::RadioOpened => EventKind::BleOpen,
            BluetoothEvent::RadioClosed => EventKind::BleClose,
            BluetoothEvent::AcceptConnecting => EventKind::AcceptConnecting,
            BluetoothEvent::AcceptConnected { .. } => EventKind::AcceptConnectSuccess,
            BluetoothEvent::AcceptFailed { .. } => EventKind::AcceptConnectFailed,
            BluetoothEvent::Connecting { .. } => EventKind::Connecting,
            BluetoothEvent::Connected { .. } => EventKind::Connected,
            BluetoothEvent::ConnectSucceeded { .. } => EventKind::ConnectSuccess,
            BluetoothEvent::ConnectFailed { .. } => EventKind::ConnectFailed,
            BluetoothEvent::Disconnected { .. } => EventKind::Disconnected,
            BluetoothEvent::ReadSucceeded { .. } => EventKind::ReadSuccess,
            BluetoothEvent::ReadFailed { .. } => EventKind::ReadFailed,
            BluetoothEvent::WriteSucceeded => EventKind::WriteSuccess,
            BluetoothEvent::WriteFailed { .. } => EventKind::WriteFailed,
            BluetoothEvent::SearchStarted => EventKind::SearchStart,
            BluetoothEvent::DeviceFound { .. } => EventKind::SearchDevice,
            BluetoothEvent::SearchCanceled => EventKind::SearchCancel,
            BluetoothEvent::SearchStopped => EventKind::SearchStop,
            BluetoothEvent::Unknown { .. } => EventKind::Unknown,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BluetoothEvent::AcceptFailed { .. }
                | BluetoothEvent::ConnectFailed { .. }
                | BluetoothEvent::ReadFailed { .. }
                | BluetoothEvent::WriteFailed { .. }
                | BluetoothEvent::Unknown { .. }
        )
    }
}

/// Human-readable status line, suitable for direct display.
impl fmt::Display for BluetoothEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BluetoothEvent::RadioOpened => write!(f, "Bluetooth opened"),
            BluetoothEvent::RadioClosed => write!(f, "Bluetooth closed"),
            BluetoothEvent::AcceptConnecting => write!(f, "Waiting for a client"),
            BluetoothEvent::AcceptConnected { device } => {
                write!(f, "Client connected: {}", device.display_name())
            }
            BluetoothEvent::AcceptFailed { reason } => write!(f, "Accept failed: {}", reason),
            BluetoothEvent::Connecting { device } => {
                write!(f, "Connecting to {}", device.display_name())
            }
            BluetoothEvent::Connected { device, detail } => match detail {
                ConnectedDetail::AlreadyConnected => {
                    write!(f, "Already connected to {}", device.display_name())
                }
                ConnectedDetail::ListenerArmed => {
                    write!(f, "Listening to {}", device.display_name())
                }
            },
            BluetoothEvent::ConnectSucceeded { device } => {
                write!(f, "Connected to {}", device.display_name())
            }
            BluetoothEvent::ConnectFailed { device, reason } => {
                write!(f, "Connect to {} failed: {}", device.display_name(), reason)
            }
            BluetoothEvent::Disconnected { device: Some(device) } => {
                write!(f, "Disconnected from {}", device.display_name())
            }
            BluetoothEvent::Disconnected { device: None } => write!(f, "Disconnected"),
            BluetoothEvent::ReadSucceeded { text } => write!(f, "Received: {}", text),
            BluetoothEvent::ReadFailed { reason } => write!(f, "Read failed: {}", reason),
            BluetoothEvent::WriteSucceeded => write!(f, "Sent"),
            BluetoothEvent::WriteFailed { reason } => write!(f, "Send failed: {}", reason),
            BluetoothEvent::SearchStarted => write!(f, "Searching"),
            BluetoothEvent::DeviceFound { device } => write!(f, "Found {}", device),
            BluetoothEvent::SearchCanceled => write!(f, "Search canceled"),
            BluetoothEvent::SearchStopped => write!(f, "Search finished"),
            BluetoothEvent::Unknown { reason } => write!(f, "Unknown error: {}", reason),
        }
    }
}

/// In-process listener that sees every event after the observer.
///
/// Taps run synchronously on the emitting task and must not block.
pub trait EventTap: Send + Sync {
    fn on_event(&self, event: &BluetoothEvent);
}

#[derive(Default)]
struct ChannelInner {
    observer: Mutex<Option<mpsc::UnboundedSender<BluetoothEvent>>>,
    taps: Mutex<Vec<Arc<dyn EventTap>>>,
}

/// Ordered, fire-and-forget event delivery to a single observer.
#[derive(Clone, Default)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the observer, replacing any previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BluetoothEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.observer.lock().replace(tx).is_some() {
            debug!("Replacing previous event observer");
        }
        rx
    }

    /// Detach the observer. Events emitted afterwards are dropped.
    pub fn unsubscribe(&self) {
        self.inner.observer.lock().take();
    }

    pub fn add_tap(&self, tap: Arc<dyn EventTap>) {
        self.inner.taps.lock().push(tap);
    }

    pub fn emit(&self, event: BluetoothEvent) {
        trace!("Event {}: {}", event.kind().as_str(), event);

        {
            let mut observer = self.inner.observer.lock();
            if let Some(tx) = observer.as_ref() {
                if tx.send(event.clone()).is_err() {
                    debug!("Event observer went away, detaching");
                    *observer = None;
                }
            }
        }

        let taps = self.inner.taps.lock().clone();
        for tap in taps {
            tap.on_event(&event);
        }
    }
}

/// A link's view of the channel.
///
/// Once [`Emitter::destroy`] has been called every later emission is
/// dropped, so workers still unwinding after shutdown stay silent.
#[derive(Clone)]
pub struct Emitter {
    channel: EventChannel,
    destroyed: Arc<AtomicBool>,
}

impl Emitter {
    pub fn new(channel: EventChannel) -> Self {
        Self {
            channel,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn emit(&self, event: BluetoothEvent) {
        if self.is_destroyed() {
            debug!("Dropping {} after shutdown", event.kind().as_str());
            return;
        }
        self.channel.emit(event);
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
