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

//! BLE write flow control.
//!
//! The GATT client allows one characteristic write in flight and has no
//! blocking write. A payload is therefore cut into chunks and each chunk
//! is written, then waited on until the stack confirms it. The wait is
//! driven by a single poll timer feeding [`ChunkFlow`]: at fixed poll
//! checkpoints a zero-length nudge write is issued to shake loose a lost
//! confirmation, and past the final checkpoint the whole send is abandoned.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::constants::flow::{ABORT_CHECKPOINT, NUDGE_CHECKPOINTS};
use super::transport::TransportError;
use crate::error::Error;

/// Pacing tier for LE writes. Slower tiers suit flakier stacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendSpeed {
    High,
    #[default]
    Medium,
    Low,
}

impl SendSpeed {
    fn tier(self) -> u64 {
        match self {
            SendSpeed::High => 0,
            SendSpeed::Medium => 1,
            SendSpeed::Low => 2,
        }
    }

    pub fn timing(self) -> FlowTiming {
        let tier = self.tier();
        FlowTiming {
            pre_send_delay: Duration::from_millis(5 + 10 * tier),
            poll_interval: Duration::from_millis(10 + 10 * tier),
            retry_delay: Duration::from_millis(1000 + 500 * tier),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTiming {
    /// Pause before every chunk write.
    pub pre_send_delay: Duration,
    /// Period of the confirmation poll.
    pub poll_interval: Duration,
    /// Pause before re-issuing a chunk write the stack refused.
    pub retry_delay: Duration,
}

/// What to do after a poll without confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Wait,
    Nudge { checkpoint: u32 },
    Abort,
}

/// Confirmation wait for a single chunk.
#[derive(Debug, Clone)]
pub struct ChunkFlow {
    polls: u32,
    nudges: Vec<u32>,
    abort: u32,
}

impl Default for ChunkFlow {
    fn default() -> Self {
        Self::with_checkpoints(&NUDGE_CHECKPOINTS, ABORT_CHECKPOINT)
    }
}

impl ChunkFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoints(nudges: &[u32], abort: u32) -> Self {
        Self {
            polls: 0,
            nudges: nudges.to_vec(),
            abort,
        }
    }

    pub fn on_poll(&mut self) -> FlowAction {
        self.polls += 1;
        if self.polls >= self.abort {
            FlowAction::Abort
        } else if self.nudges.contains(&self.polls) {
            FlowAction::Nudge {
                checkpoint: self.polls,
            }
        } else {
            FlowAction::Wait
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

/// Where chunks go. Returns whether the stack accepted the write.
pub trait ChunkSink: Send + Sync {
    fn write_chunk(&self, chunk: &[u8]) -> bool;
}

/// Number of writes needed for `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Send `payload` chunk by chunk, waiting for a confirmation after each.
///
/// `confirmations` is bumped by the GATT write callback. Returns the number
/// of chunks written.
pub async fn send_payload<S: ChunkSink + ?Sized>(
    sink: &S,
    payload: &[u8],
    chunk_size: usize,
    timing: FlowTiming,
    confirmations: &mut watch::Receiver<u64>,
) -> Result<usize, Error> {
    let mut sent = 0;
    for chunk in payload.chunks(chunk_size.max(1)) {
        tokio::time::sleep(timing.pre_send_delay).await;

        confirmations.borrow_and_update();
        if !sink.write_chunk(chunk) {
            warn!("Chunk write refused, retrying in {:?}", timing.retry_delay);
            tokio::time::sleep(timing.retry_delay).await;
            confirmations.borrow_and_update();
            if !sink.write_chunk(chunk) {
                return Err(Error::Transport(TransportError::rejected(
                    "characteristic write refused",
                )));
            }
        }

        await_confirmation(sink, timing.poll_interval, confirmations).await?;
        sent += 1;
    }
    debug!("Sent {} bytes in {} chunks", payload.len(), sent);
    Ok(sent)
}

async fn await_confirmation<S: ChunkSink + ?Sized>(
    sink: &S,
    poll_interval: Duration,
    confirmations: &mut watch::Receiver<u64>,
) -> Result<(), Error> {
    let mut flow = ChunkFlow::new();
    let start = tokio::time::Instant::now() + poll_interval;
    let mut ticker = tokio::time::interval_at(start, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = confirmations.changed() => {
                return changed.map_err(|_| Error::NotConnected);
            }
            _ = ticker.tick() => match flow.on_poll() {
                FlowAction::Wait => {}
                FlowAction::Nudge { checkpoint } => {
                    if sink.write_chunk(&[]) {
                        debug!("No confirmation after {} polls, nudged", checkpoint);
                    } else {
                        warn!("Nudge write refused at poll {}", checkpoint);
                    }
                }
                FlowAction::Abort => {
                    warn!("No write confirmation after {} polls, giving up", flow.polls());
                    return Err(Error::Timeout("write confirmation".to_string()));
                }
            }
        }
    }
}
