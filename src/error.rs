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

//! Error types for bt-link.
//!
//! Links never return these to callers; failures are turned into
//! [`BluetoothEvent`](crate::bluetooth::BluetoothEvent) variants and the
//! error's `Display` becomes the event's reason string. Adapter-level
//! operations and storage return them directly.

use std::io;
use thiserror::Error;

use crate::bluetooth::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// No transport handle where one was required.
    #[error("Not connected")]
    NotConnected,

    /// Another operation already owns the link.
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
