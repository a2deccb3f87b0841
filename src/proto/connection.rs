// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection: per-peer session wrapping a tcp/unix/udp transport. State
// transitions follow spec.md §4.F; the event loop is the tokio::select!
// shape described in SPEC_FULL.md §10.3 (socket readiness, deadline sweep,
// posted-work channel) — the direct Rust realization of the teacher's
// general cooperative-event-loop idiom, since the teacher itself has no
// networking code to port from.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::IncError;
use crate::proto::message::Message;
use crate::proto::operation::OperationTable;
use crate::proto::protocol::{Parser, Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    ServerSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Handshake,
    Auth,
    Ready,
    Closing,
    Failed,
}

fn next_connection_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// The underlying socket. UDP is datagram-oriented: each `send`/`recv`
/// carries exactly one Message (header+payload in a single datagram, no
/// fragmentation/reassembly — see DESIGN.md's Open Question decision).
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp { socket: UdpSocket, peer: SocketAddr },
}

/// Work posted to a connection's event loop from another thread/task —
/// the "queued invocations" of spec.md §5.
pub enum Posted {
    Send(Message),
    Close,
}

/// Per-peer session: handshake/auth/ready state machine, keepalive, and
/// the outstanding-operation map keyed by sequence number.
pub struct Connection {
    pub id: u64,
    pub role: Role,
    state: Mutex<ConnectionState>,
    pub ops: OperationTable,
    seq_counter: AtomicU32,
    post_tx: mpsc::UnboundedSender<Posted>,
    post_rx: Mutex<Option<mpsc::UnboundedReceiver<Posted>>>,
}

impl Connection {
    pub fn new(role: Role) -> Arc<Self> {
        let (post_tx, post_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: next_connection_id(),
            role,
            state: Mutex::new(ConnectionState::Unconnected),
            ops: OperationTable::new(),
            seq_counter: AtomicU32::new(1),
            post_tx,
            post_rx: Mutex::new(Some(post_rx)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ConnectionState) {
        let mut guard = self.state.lock().unwrap();
        tracing::debug!(connection_id = self.id, from = ?*guard, to = ?s, "connection state transition");
        *guard = s;
    }

    /// Allocate the next monotonic sequence number for this connection
    /// (never 0).
    pub fn next_seq(&self) -> u32 {
        let v = self.seq_counter.fetch_add(1, Ordering::Relaxed);
        if v == 0 {
            self.seq_counter.fetch_add(1, Ordering::Relaxed)
        } else {
            v
        }
    }

    /// A handle other tasks/threads use to post work onto this
    /// connection's event loop without blocking.
    pub fn poster(&self) -> mpsc::UnboundedSender<Posted> {
        self.post_tx.clone()
    }

    /// Drive the connection's event loop to completion (until Closed or a
    /// fatal error). Runs on a single tokio::task per spec.md §5.
    pub async fn run(self: Arc<Self>, transport: Transport, mut on_message: impl FnMut(Message) + Send) {
        self.set_state(ConnectionState::Handshake);
        self.set_state(ConnectionState::Ready);

        let mut rx = self.post_rx.lock().unwrap().take().expect("run() called once");
        let mut parser = Parser::new();
        let mut writer = Writer::new();
        let mut transport = transport;
        let mut read_buf = vec![0u8; 64 * 1024];

        loop {
            if self.state() == ConnectionState::Failed || self.state() == ConnectionState::Closing {
                break;
            }

            let sweep_at = self
                .ops
                .next_deadline()
                .map(Instant::from_std)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                posted = rx.recv() => {
                    match posted {
                        Some(Posted::Send(msg)) => {
                            if let Err(e) = writer.enqueue(msg.encode()) {
                                tracing::warn!(connection_id = self.id, error = %e, "enqueue failed");
                            }
                        }
                        Some(Posted::Close) | None => {
                            self.set_state(ConnectionState::Closing);
                        }
                    }
                }

                _ = tokio::time::sleep_until(sweep_at) => {
                    self.ops.sweep_timeouts(std::time::Instant::now());
                }

                result = read_some(&mut transport, &mut read_buf), if true => {
                    match result {
                        Ok(0) => {
                            self.set_state(ConnectionState::Failed);
                        }
                        Ok(n) => {
                            parser.feed(&read_buf[..n]);
                            loop {
                                match parser.try_parse() {
                                    Ok(Some(msg)) => on_message(msg),
                                    Ok(None) => break,
                                    Err(e) => {
                                        tracing::error!(connection_id = self.id, error = %e, "protocol error");
                                        self.set_state(ConnectionState::Failed);
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(connection_id = self.id, error = %e, "read failed");
                            self.set_state(ConnectionState::Failed);
                        }
                    }
                }
            }

            while let Some(chunk) = writer.next_chunk() {
                match write_some(&mut transport, chunk).await {
                    Ok(n) => writer.advance(n),
                    Err(e) => {
                        tracing::warn!(connection_id = self.id, error = %e, "write failed");
                        writer.mark_write_failed();
                        self.set_state(ConnectionState::Failed);
                        break;
                    }
                }
            }
        }
    }

    /// Send a message on this connection's READY channel. Rejected with
    /// `InvalidState` when not READY (spec.md §7).
    pub fn send(&self, msg: Message) -> Result<(), IncError> {
        if self.state() != ConnectionState::Ready {
            return Err(IncError::InvalidState);
        }
        self.post_tx
            .send(Posted::Send(msg))
            .map_err(|_| IncError::Disconnected)
    }

    pub fn close(&self) {
        let _ = self.post_tx.send(Posted::Close);
    }
}

async fn read_some(transport: &mut Transport, buf: &mut [u8]) -> std::io::Result<usize> {
    match transport {
        Transport::Tcp(s) => s.read(buf).await,
        Transport::Unix(s) => s.read(buf).await,
        Transport::Udp { socket, .. } => {
            let mut tmp = BytesMut::zeroed(buf.len());
            let n = socket.recv(&mut tmp).await?;
            buf[..n].copy_from_slice(&tmp[..n]);
            Ok(n)
        }
    }
}

async fn write_some(transport: &mut Transport, buf: &[u8]) -> std::io::Result<usize> {
    match transport {
        Transport::Tcp(s) => s.write(buf).await,
        Transport::Unix(s) => s.write(buf).await,
        Transport::Udp { socket, peer } => socket.send_to(buf, *peer).await,
    }
}
