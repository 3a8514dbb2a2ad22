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

//! bt-chat: a small Bluetooth chat over the BlueZ stack.
//!
//! Opens the radio, makes the adapter discoverable, accepts Classic peers,
//! and keeps reconnecting to the remembered peer. Lines typed on stdin go
//! to whichever peer is connected.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bt_link::bluetooth::bluez::Bluez;
use bt_link::storage::JsonAutoConnectStore;
use bt_link::{AutoReconnect, BluetoothEvent, Config, ConnectionManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bt_link=info,bt_chat=info")),
        )
        .init();

    info!("Starting bt-chat v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let store = Arc::new(JsonAutoConnectStore::new(&config.data_dir)?);
    info!("Auto-connect store: {}", store.path().display());

    let bluez = Bluez::new().await?;
    let transports = bluez.transports().await?;
    let manager = ConnectionManager::new(transports, &config, store);
    let mut events = manager.subscribe();

    let reconnect = AutoReconnect::new(&manager, config.reconnect.clone()).spawn();

    let name = config.app.device_name();
    let discoverable = Duration::from_secs(config.app.discoverable_secs);

    if manager.is_opened().await {
        start_session(&manager, discoverable).await;
    } else if let Err(e) = manager.open().await {
        error!("Failed to power on adapter: {}", e);
    }

    info!("Ready as '{}'. Type a line to send it.", name);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if event.is_failure() {
                    warn!("{}", event);
                } else {
                    info!("{}", event);
                }
                match event {
                    BluetoothEvent::RadioOpened => start_session(&manager, discoverable).await,
                    BluetoothEvent::ReadSucceeded { text } => {
                        if config.app.auto_reply && text.starts_with("Hello") {
                            manager.server_write(format!("Hi, I am {}", name));
                        }
                    }
                    _ => {}
                }
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    match manager.connected_device() {
                        Some(device) => manager.write(&device, line),
                        None => manager.server_write(line),
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Reading stdin failed: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    reconnect.abort();
    manager.shutdown();
    info!("bt-chat stopped");
    Ok(())
}

/// Make the adapter visible, scan, and listen for inbound peers.
async fn start_session(manager: &Arc<ConnectionManager>, discoverable: Duration) {
    if let Err(e) = manager.set_discoverable(discoverable).await {
        warn!("Failed to make adapter discoverable: {}", e);
    }
    if let Err(e) = manager.search() {
        warn!("Failed to start search: {}", e);
    }
    manager.start_accepting();
}
