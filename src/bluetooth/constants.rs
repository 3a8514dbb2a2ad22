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

//! Well-known UUIDs, chunk sizing and timing constants for both transports.

use std::time::Duration;
use uuid::Uuid;

/// Standard SPP UUID, used as the RFCOMM service record for Classic links.
pub const CLASSIC_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Service name registered with the SDP record of the listening socket.
pub const CLASSIC_SERVICE_NAME: &str = "BLE";

/// Characteristic used for both send (write) and receive (notify).
pub const SEND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor (enables notifications).
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that turns notifications on.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value that turns indications on.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Android's generic GATT_ERROR; the device must be rediscovered by a scan.
pub const GATT_ERROR: i32 = 133;

/// BLE sizing.
pub mod config {
    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Bytes per characteristic write for a given MTU.
    pub fn chunk_size(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD).max(1)
    }

    /// Chunk size for the default MTU (the classic 20-byte attribute write).
    pub const DEFAULT_CHUNK_SIZE: usize = DEFAULT_MTU - ATT_OVERHEAD;

    /// RFCOMM read buffer; one read() call defines one message.
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Pending writes per link before new ones are refused.
    pub const WRITE_QUEUE_DEPTH: usize = 32;
}

/// Timing constants.
pub mod timing {
    use super::Duration;

    /// Wait after the radio-level connect before asking for services.
    /// Discovery started earlier frequently returns nothing.
    pub const DISCOVERY_SETTLE: Duration = Duration::from_millis(1500);

    /// How long discovery may take before the connect counts as failed.
    pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Period of the auto-reconnect check.
    pub const RECONNECT_TICK: Duration = Duration::from_secs(1);
}

/// Write-confirmation polling checkpoints for BLE flow control.
pub mod flow {
    /// Polls after which a zero-length nudge write is issued.
    pub const NUDGE_CHECKPOINTS: [u32; 3] = [40, 80, 180];

    /// Poll after which the whole send is abandoned.
    pub const ABORT_CHECKPOINT: u32 = 300;
}
