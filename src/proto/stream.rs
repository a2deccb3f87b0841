// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stream (Channel): a named, server-allocated data pipe multiplexed over a
// Connection. Grounded on original_source/src/core/inc/iincstream.cpp
// (iINCStream): attach/detach driven through the Operation machinery,
// ATTACHING/ATTACHED/DETACHING/ERROR states, an inbound queue for READ mode,
// and ACK-driven flow control per spec.md §4.G.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::IncError;
use crate::proto::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMode(u8);

impl StreamMode {
    pub const READ: StreamMode = StreamMode(0x1);
    pub const WRITE: StreamMode = StreamMode(0x2);
    pub const READ_WRITE: StreamMode = StreamMode(0x3);

    pub fn can_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn can_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Detached,
    Attaching,
    Attached,
    Detaching,
    Error,
}

struct Inbox {
    queue: VecDeque<Bytes>,
}

/// A named sub-flow within a Connection, identified by a server-allocated
/// `u32` channel id. Data arrives via [`Stream::deliver`] (called by the
/// owning Connection's dispatch loop) and is drained via [`Stream::read`];
/// writers call [`crate::proto::Context::write_stream`], which enqueues a
/// `BINARY_DATA` message on the parent connection.
pub struct Stream {
    name: String,
    mode: StreamMode,
    channel_id: AtomicU32,
    state: Mutex<StreamState>,
    inbox: Mutex<Inbox>,
    notify: Notify,
    connection: Arc<Connection>,
    /// Per-stream outstanding unacked packet count, mirrored against the
    /// server's inflight window (spec §4.G) — incremented on write,
    /// decremented on ack.
    inflight: AtomicU64,
}

impl Stream {
    pub fn new(name: impl Into<String>, mode: StreamMode, connection: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mode,
            channel_id: AtomicU32::new(0),
            state: Mutex::new(StreamState::Detached),
            inbox: Mutex::new(Inbox { queue: VecDeque::new() }),
            notify: Notify::new(),
            connection,
            inflight: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: StreamState) {
        *self.state.lock().unwrap() = s;
    }

    /// Begin attach: caller has already sent STREAM_OPEN and is awaiting the
    /// HANDSHAKE_ACK carrying the allocated channel id via an Operation.
    /// Mirrors `iINCStream::attach`.
    pub fn begin_attach(&self) -> Result<(), IncError> {
        if self.state() != StreamState::Detached {
            return Err(IncError::InvalidState);
        }
        self.set_state(StreamState::Attaching);
        Ok(())
    }

    /// The server granted `channel_id`: transition ATTACHING → ATTACHED.
    /// A no-op if the stream was detached (cancelled) while the request
    /// was in flight, matching the original's cancellation race handling.
    pub fn on_channel_allocated(&self, channel_id: u32) {
        if self.state() != StreamState::Attaching {
            return;
        }
        self.channel_id.store(channel_id, Ordering::Release);
        self.set_state(StreamState::Attached);
    }

    /// The server rejected the STREAM_OPEN, or the request operation timed
    /// out/failed/was cancelled.
    pub fn on_attach_failed(&self) {
        if self.state() == StreamState::Attaching {
            self.set_state(StreamState::Error);
        }
    }

    /// Begin detach: send STREAM_CLOSE and wait for the server's ack (or a
    /// failure/timeout, which still forces DETACHED — spec §4.G).
    pub fn begin_detach(&self) -> bool {
        match self.state() {
            StreamState::Detached | StreamState::Detaching => return false,
            StreamState::Attaching => {
                // Cancel before any channel was allocated.
                self.channel_id.store(0, Ordering::Release);
                self.set_state(StreamState::Detached);
                return false;
            }
            _ => {}
        }
        self.inbox.lock().unwrap().queue.clear();
        self.set_state(StreamState::Detaching);
        true
    }

    /// The server confirmed (or the release operation failed/timed out —
    /// detach completes regardless, per spec).
    pub fn on_detach_complete(&self) {
        self.channel_id.store(0, Ordering::Release);
        self.set_state(StreamState::Detached);
    }

    /// The owning Context lost its connection: force this stream into
    /// ERROR so the application observes the flap (unless already
    /// detached).
    pub fn on_connection_lost(&self) {
        if self.state() == StreamState::Detached {
            return;
        }
        self.inbox.lock().unwrap().queue.clear();
        self.channel_id.store(0, Ordering::Release);
        self.set_state(StreamState::Error);
    }

    /// The owning Context reconnected and is about to re-issue STREAM_OPEN
    /// for this stream. `begin_attach` only accepts a `Detached` stream, so
    /// a stream left in ERROR by `on_connection_lost` has to pass back
    /// through here first. No-op unless currently ERROR.
    pub(crate) fn prepare_for_reattach(&self) {
        if self.state() == StreamState::Error {
            self.set_state(StreamState::Detached);
        }
    }

    /// Queue inbound data delivered by the connection's dispatch loop for
    /// this stream's channel id.
    pub fn deliver(&self, data: Bytes) {
        self.inbox.lock().unwrap().queue.push_back(data);
        self.notify.notify_waiters();
    }

    /// Non-blocking read of the next queued chunk, or `None` if empty.
    pub fn read(&self) -> Option<Bytes> {
        if self.state() != StreamState::Attached || !self.mode.can_read() {
            return None;
        }
        self.inbox.lock().unwrap().queue.pop_front()
    }

    pub fn chunks_available(&self) -> usize {
        self.inbox.lock().unwrap().queue.len()
    }

    pub fn can_write(&self) -> bool {
        self.state() == StreamState::Attached && self.mode.can_write()
    }

    /// Outstanding unacked packets this stream has sent.
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn note_sent(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    /// The peer acked `seq_num` (`bytes` is informational, used for
    /// diagnostics/credit accounting by the caller).
    pub fn ack_data_received(&self, _seq_num: u32, _bytes: usize) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
