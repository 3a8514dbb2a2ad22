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

//! A live RFCOMM session: one read worker and one writer task.
//!
//! Both Classic links hand an established stream to [`Session::spawn`].
//! Reads are emitted as `ReadSucceeded` in wire order, one event per read()
//! call. Writes go through a bounded queue drained by a single writer, so
//! each payload is flushed completely before the next one starts.
//! [`Session::close`] aborts both tasks and hands back every payload that
//! was queued or still being written.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{BluetoothEvent, Emitter};
use super::transport::RfcommStream;
use crate::error::Error;

/// A payload waiting for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub payload: Vec<u8>,
    /// Set once the payload has already gone through a reconnect-and-retry.
    pub retried: bool,
}

impl Outbound {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            retried: false,
        }
    }

    pub fn retry(self) -> Self {
        Self {
            retried: true,
            ..self
        }
    }
}

/// The link that owns a session. Called from the session's tasks.
pub trait SessionOwner: Send + Sync {
    /// The read loop ended. The session is finished.
    fn on_read_failed(&self, generation: u64, reason: String);

    /// A write failed and the writer stopped. The failed payload is still
    /// held by the session and comes back first from [`Session::close`].
    fn on_write_failed(&self, generation: u64, reason: String);
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub read_buffer_size: usize,
    pub write_queue_depth: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: super::constants::config::READ_BUFFER_SIZE,
            write_queue_depth: super::constants::config::WRITE_QUEUE_DEPTH,
        }
    }
}

#[derive(Default)]
struct WriteQueue {
    pending: VecDeque<Outbound>,
    in_flight: Option<Outbound>,
    closed: bool,
}

impl WriteQueue {
    fn next(&mut self) -> Option<Outbound> {
        if self.closed {
            return None;
        }
        let outbound = self.pending.pop_front()?;
        self.in_flight = Some(outbound.clone());
        Some(outbound)
    }

    /// Everything not yet flushed, oldest first.
    fn drain(&mut self) -> Vec<Outbound> {
        self.closed = true;
        self.in_flight
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .collect()
    }
}

struct Shared {
    queue: Mutex<WriteQueue>,
    wake: Notify,
}

pub struct Session {
    generation: u64,
    capacity: usize,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Start the read and write workers for `stream`.
    ///
    /// `generation` is passed back to the owner so it can ignore reports from
    /// a session it has already replaced.
    pub fn spawn(
        stream: RfcommStream,
        generation: u64,
        emitter: Emitter,
        owner: Weak<dyn SessionOwner>,
        settings: SessionSettings,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            queue: Mutex::new(WriteQueue::default()),
            wake: Notify::new(),
        });

        let reader = tokio::spawn(read_loop(
            read_half,
            settings.read_buffer_size.max(1),
            generation,
            emitter.clone(),
            owner.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            shared.clone(),
            generation,
            emitter,
            owner,
        ));

        debug!("Session {} started", generation);
        Self {
            generation,
            capacity: settings.write_queue_depth.max(1),
            shared,
            reader,
            writer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a payload for the writer without waiting.
    pub fn enqueue(&self, outbound: Outbound) -> Result<(), Error> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(Error::NotConnected);
            }
            if queue.pending.len() >= self.capacity {
                return Err(Error::Busy("write queue full".to_string()));
            }
            queue.pending.push_back(outbound);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop both workers and return the payloads that were never confirmed
    /// as written, the one being written first.
    pub fn close(self) -> Vec<Outbound> {
        let unsent = self.shared.queue.lock().drain();
        if !unsent.is_empty() {
            debug!(
                "Session {} closed with {} unsent payloads",
                self.generation,
                unsent.len()
            );
        }
        unsent
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.queue.lock().closed = true;
        self.reader.abort();
        self.writer.abort();
        debug!("Session {} closed", self.generation);
    }
}

async fn read_loop(
    mut reader: ReadHalf<RfcommStream>,
    buffer_size: usize,
    generation: u64,
    emitter: Emitter,
    owner: Weak<dyn SessionOwner>,
) {
    let mut buf = vec![0u8; buffer_size];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Connection closed by remote");
                break "connection closed by remote".to_string();
            }
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                debug!("Received {} bytes", n);
                emitter.emit(BluetoothEvent::ReadSucceeded { text });
            }
            Err(e) => {
                warn!("Read error: {}", e);
                break e.to_string();
            }
        }
    };

    if let Some(owner) = owner.upgrade() {
        owner.on_read_failed(generation, reason);
    }
}

async fn write_loop(
    mut writer: WriteHalf<RfcommStream>,
    shared: Arc<Shared>,
    generation: u64,
    emitter: Emitter,
    owner: Weak<dyn SessionOwner>,
) {
    loop {
        let next = shared.queue.lock().next();
        let Some(outbound) = next else {
            let closed = shared.queue.lock().closed;
            if closed {
                return;
            }
            shared.wake.notified().await;
            continue;
        };

        let result = async {
            writer.write_all(&outbound.payload).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                // A close that raced the flush already handed the payload back
                let confirmed = shared.queue.lock().in_flight.take().is_some();
                if !confirmed {
                    return;
                }
                debug!("Sent {} bytes", outbound.payload.len());
                emitter.emit(BluetoothEvent::WriteSucceeded);
            }
            Err(e) => {
                warn!("Write error: {}", e);
                if let Some(owner) = owner.upgrade() {
                    owner.on_write_failed(generation, e.to_string());
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::events::EventChannel;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        read_failures: Mutex<Vec<(u64, String)>>,
        write_failures: Mutex<Vec<u64>>,
    }

    impl SessionOwner for Recorder {
        fn on_read_failed(&self, generation: u64, reason: String) {
            self.read_failures.lock().push((generation, reason));
        }

        fn on_write_failed(&self, generation: u64, _reason: String) {
            self.write_failures.lock().push(generation);
        }
    }

    fn spawn_session(
        stream: RfcommStream,
        owner: &Arc<Recorder>,
    ) -> (Session, mpsc::UnboundedReceiver<BluetoothEvent>) {
        let channel = EventChannel::new();
        let rx = channel.subscribe();
        let weak: Weak<dyn SessionOwner> = Arc::downgrade(owner) as Weak<dyn SessionOwner>;
        let session = Session::spawn(stream, 7, Emitter::new(channel), weak, SessionSettings::default());
        (session, rx)
    }

    #[tokio::test]
    async fn test_reads_and_writes() {
        let (local, mut remote) = duplex(1024);
        let owner = Arc::new(Recorder::default());
        let (session, mut events) = spawn_session(Box::new(local), &owner);

        session.enqueue(Outbound::new("hello")).unwrap();
        assert_eq!(events.recv().await.unwrap(), BluetoothEvent::WriteSucceeded);
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"Hi").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            BluetoothEvent::ReadSucceeded { text: "Hi".into() }
        );
        assert!(session.close().is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_reports_read_failure() {
        let (local, remote) = duplex(64);
        let owner = Arc::new(Recorder::default());
        let (session, _events) = spawn_session(Box::new(local), &owner);
        drop(remote);

        for _ in 0..50 {
            if !owner.read_failures.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let failures = owner.read_failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, session.generation());
        assert_eq!(failures[0].1, "connection closed by remote");
    }

    #[tokio::test]
    async fn test_close_returns_unflushed_payloads_in_order() {
        // Two bytes of pipe: the first payload blocks the writer mid-write
        let (local, _remote) = duplex(2);
        let owner = Arc::new(Recorder::default());
        let (session, mut events) = spawn_session(Box::new(local), &owner);

        session.enqueue(Outbound::new("first")).unwrap();
        session.enqueue(Outbound::new("second")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let unsent = session.close();
        assert_eq!(unsent, vec![Outbound::new("first"), Outbound::new("second")]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_after_drain_is_refused() {
        let (local, _remote) = duplex(64);
        let owner = Arc::new(Recorder::default());
        let (session, _events) = spawn_session(Box::new(local), &owner);

        session.shared.queue.lock().drain();
        assert!(matches!(
            session.enqueue(Outbound::new("late")),
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_payload_for_close() {
        let (local, remote) = duplex(64);
        drop(remote);
        let owner = Arc::new(Recorder::default());
        let (session, mut events) = spawn_session(Box::new(local), &owner);

        session.enqueue(Outbound::new("lost")).unwrap();
        for _ in 0..50 {
            if !owner.write_failures.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(owner.write_failures.lock().clone(), vec![7]);
        assert_eq!(session.close(), vec![Outbound::new("lost")]);
        assert!(!matches!(events.try_recv(), Ok(BluetoothEvent::WriteSucceeded)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_lossy() {
        let (local, mut remote) = duplex(64);
        let owner = Arc::new(Recorder::default());
        let (_session, mut events) = spawn_session(Box::new(local), &owner);
        remote.write_all(&[b'o', b'k', 0xFF]).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            BluetoothEvent::ReadSucceeded { text: "ok\u{FFFD}".into() }
        );
    }
}
