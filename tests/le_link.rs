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

//! LE GATT client link. Runs on a paused clock so discovery delays and
//! confirmation polling complete instantly.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use bt_link::bluetooth::constants::{
    CLIENT_CONFIG_DESCRIPTOR_UUID, ENABLE_NOTIFICATION_VALUE, SEND_CHARACTERISTIC_UUID,
};
use bt_link::bluetooth::{
    BluetoothEvent, ConnectedDetail, Device, Emitter, EventChannel, GattConnectionState,
    LeClient, LePhase, LeSettings,
};
use common::*;

fn client() -> (LeClient, Arc<FakeGatt>, mpsc::UnboundedReceiver<BluetoothEvent>) {
    let channel = EventChannel::new();
    let rx = channel.subscribe();
    let gatt = FakeGatt::new();
    let client = LeClient::new(gatt.clone(), Emitter::new(channel), LeSettings::default());
    (client, gatt, rx)
}

fn setup_events(device: &Device) -> Vec<BluetoothEvent> {
    vec![
        BluetoothEvent::Connecting { device: device.clone() },
        BluetoothEvent::Connected {
            device: device.clone(),
            detail: ConnectedDetail::ListenerArmed,
        },
        BluetoothEvent::ConnectSucceeded { device: device.clone() },
    ]
}

async fn connected(
    client: &LeClient,
    rx: &mut mpsc::UnboundedReceiver<BluetoothEvent>,
    device: &Device,
) {
    client.connect(device);
    assert_eq!(next_events(rx, 3).await, setup_events(device));
}

#[tokio::test(start_paused = true)]
async fn test_connect_enables_notifications() {
    let (client, gatt, mut rx) = client();
    let device = le_device(1);

    connected(&client, &mut rx, &device).await;

    assert_eq!(client.phase(), LePhase::Ready);
    assert!(client.is_connected_to(&device));
    assert_eq!(
        *gatt.descriptor_writes.lock(),
        vec![(CLIENT_CONFIG_DESCRIPTOR_UUID, ENABLE_NOTIFICATION_VALUE.to_vec())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ready_without_descriptor_write() {
    let (client, gatt, mut rx) = client();
    gatt.has_cccd.store(false, Ordering::SeqCst);
    let device = le_device(2);

    connected(&client, &mut rx, &device).await;
    assert!(gatt.descriptor_writes.lock().is_empty());
    assert_eq!(client.phase(), LePhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_connect_again_reports_already_connected() {
    let (client, gatt, mut rx) = client();
    let device = le_device(3);

    connected(&client, &mut rx, &device).await;
    client.connect(&device);
    assert_eq!(
        next_event(&mut rx).await,
        BluetoothEvent::Connected {
            device,
            detail: ConnectedDetail::AlreadyConnected,
        }
    );
    assert_eq!(gatt.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_payload_is_chunked() {
    let (client, gatt, mut rx) = client();
    let device = le_device(4);
    connected(&client, &mut rx, &device).await;

    let payload = "x".repeat(45);
    client.write(&device, payload.clone());
    assert_eq!(next_event(&mut rx).await, BluetoothEvent::WriteSucceeded);

    let chunks = gatt.data_chunks();
    let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![20, 20, 5]);
    assert_eq!(chunks.concat(), payload.into_bytes());
    assert_quiet(&mut rx).await;
}

#[tokio::test(start_paused = true)]
async fn test_write_when_idle_connects_first() {
    let (client, gatt, mut rx) = client();
    let device = le_device(5);

    client.write(&device, "hello");
    let mut expected = setup_events(&device);
    expected.push(BluetoothEvent::WriteSucceeded);
    assert_eq!(next_events(&mut rx, 4).await, expected);
    assert_eq!(gatt.data_chunks(), vec![b"hello".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_write_during_setup_is_refused() {
    let (client, gatt, mut rx) = client();
    gatt.respond_to_discovery.store(false, Ordering::SeqCst);
    let device = le_device(6);

    client.connect(&device);
    next_event(&mut rx).await;
    client.write(&device, "too early");
    match next_event(&mut rx).await {
        BluetoothEvent::WriteFailed { reason } => assert!(reason.starts_with("link not ready")),
        other => panic!("expected WriteFailed, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_write_times_out() {
    let (client, gatt, mut rx) = client();
    gatt.confirm_writes.store(false, Ordering::SeqCst);
    let device = le_device(7);
    connected(&client, &mut rx, &device).await;

    client.write(&device, "abc");
    assert_eq!(
        next_event(&mut rx).await,
        BluetoothEvent::WriteFailed {
            reason: "Timed out waiting for write confirmation".into()
        }
    );
    // One data chunk plus a nudge at each checkpoint
    assert_eq!(gatt.data_chunks().len(), 1);
    assert_eq!(gatt.chunks.lock().len(), 4);
    assert_eq!(client.phase(), LePhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_multi_chunk_write_fails_when_later_chunk_unconfirmed() {
    let (client, gatt, mut rx) = client();
    let device = le_device(15);
    connected(&client, &mut rx, &device).await;
    gatt.confirm_budget.store(2, Ordering::SeqCst);

    client.write(&device, "y".repeat(45));
    assert_eq!(
        next_event(&mut rx).await,
        BluetoothEvent::WriteFailed {
            reason: "Timed out waiting for write confirmation".into()
        }
    );
    assert_quiet(&mut rx).await;

    let sizes: Vec<usize> = gatt.data_chunks().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![20, 20, 5]);
    // Three nudges after the last chunk, none after the confirmed ones
    assert_eq!(gatt.chunks.lock().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_fails_connect() {
    let (client, gatt, mut rx) = client();
    gatt.has_send_characteristic.store(false, Ordering::SeqCst);
    let device = le_device(8);

    client.connect(&device);
    assert_eq!(
        next_events(&mut rx, 2).await,
        vec![
            BluetoothEvent::Connecting { device: device.clone() },
            BluetoothEvent::ConnectFailed {
                device,
                reason: "send characteristic not found".into()
            },
        ]
    );
    assert_eq!(client.phase(), LePhase::Idle);
    assert_eq!(gatt.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_timeout_fails_connect() {
    let (client, gatt, mut rx) = client();
    gatt.respond_to_discovery.store(false, Ordering::SeqCst);
    let device = le_device(9);

    client.connect(&device);
    assert_eq!(
        next_events(&mut rx, 2).await,
        vec![
            BluetoothEvent::Connecting { device: device.clone() },
            BluetoothEvent::ConnectFailed {
                device,
                reason: "service discovery timed out".into()
            },
        ]
    );
    assert_eq!(gatt.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_gatt_connect() {
    let (client, gatt, mut rx) = client();
    gatt.refuse_connect.store(true, Ordering::SeqCst);
    let device = le_device(10);

    client.connect(&device);
    next_event(&mut rx).await;
    assert!(matches!(
        next_event(&mut rx).await,
        BluetoothEvent::ConnectFailed { .. }
    ));
    assert_eq!(client.phase(), LePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_notification_is_read() {
    let (client, gatt, mut rx) = client();
    let device = le_device(11);
    connected(&client, &mut rx, &device).await;

    gatt.callbacks()
        .on_characteristic_changed(SEND_CHARACTERISTIC_UUID, b"pong");
    assert_eq!(
        next_event(&mut rx).await,
        BluetoothEvent::ReadSucceeded { text: "pong".into() }
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_disconnect() {
    let (client, gatt, mut rx) = client();
    let device = le_device(12);
    connected(&client, &mut rx, &device).await;

    gatt.callbacks()
        .on_connection_state_change(0, GattConnectionState::Disconnected);
    assert_eq!(
        next_event(&mut rx).await,
        BluetoothEvent::Disconnected {
            device: Some(device)
        }
    );
    assert_eq!(client.phase(), LePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_remote_disconnect_fails_unfinished_write() {
    let (client, gatt, mut rx) = client();
    gatt.confirm_writes.store(false, Ordering::SeqCst);
    let device = le_device(16);
    connected(&client, &mut rx, &device).await;

    client.write(&device, "z".repeat(60));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(gatt.data_chunks().len(), 1);

    gatt.callbacks()
        .on_connection_state_change(0, GattConnectionState::Disconnected);
    assert_eq!(
        next_events(&mut rx, 2).await,
        vec![
            BluetoothEvent::Disconnected {
                device: Some(device)
            },
            BluetoothEvent::WriteFailed {
                reason: "link lost".into()
            },
        ]
    );
    assert_quiet(&mut rx).await;
}

#[tokio::test(start_paused = true)]
async fn test_local_disconnect_drops_unfinished_write_quietly() {
    let (client, gatt, mut rx) = client();
    gatt.confirm_writes.store(false, Ordering::SeqCst);
    let device = le_device(17);
    connected(&client, &mut rx, &device).await;

    client.write(&device, "queued");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(client.disconnect(), Some(device));
    assert_quiet(&mut rx).await;
}

#[tokio::test(start_paused = true)]
async fn test_gatt_error_is_unknown() {
    let (client, gatt, mut rx) = client();
    let device = le_device(13);
    connected(&client, &mut rx, &device).await;

    gatt.callbacks()
        .on_connection_state_change(133, GattConnectionState::Disconnected);
    assert!(matches!(
        next_event(&mut rx).await,
        BluetoothEvent::Unknown { .. }
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        BluetoothEvent::Disconnected { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stale_callbacks_are_ignored() {
    let (client, gatt, mut rx) = client();
    let device = le_device(14);
    connected(&client, &mut rx, &device).await;
    let stale = gatt.callbacks();

    assert_eq!(client.disconnect(), Some(device));
    assert_eq!(gatt.disconnects.load(Ordering::SeqCst), 1);

    stale.on_characteristic_changed(SEND_CHARACTERISTIC_UUID, b"late");
    stale.on_connection_state_change(0, GattConnectionState::Disconnected);
    assert_quiet(&mut rx).await;
}
