// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Context: client-side session driver. Owns the Connection, drives
// auto-reconnect with interval/max-attempts masked as CONNECTING (spec.md
// §4.F), and re-attaches previously-attached Streams once the underlying
// Connection is READY again. Grounded on
// original_source/src/core/inc/iincstream.cpp's onContextStateChanged and
// original_source/test/UT/inc/test_inc_reconnection.cpp's three scenarios
// (ContextReconnection, StreamReconnection, StreamReconnectionFailure).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, UnixStream};

use crate::config::ContextConfig;
use crate::error::IncError;
use crate::import::MemImport;
use crate::pool::MemPool;
use crate::proto::connection::{Connection, ConnectionState, Role, Transport};
use crate::proto::message::{Message, MessageFlags, MessageType, DTS_FOREVER};
use crate::proto::stream::{Stream, StreamState};
use crate::tagstruct::TagStruct;
use crate::url::TransportUrl;

/// The local pool backing `makeLocal` copies on revoke (§4.C). Not
/// configurable via `ContextConfig` — it never receives exports itself,
/// only copies of revoked imports, so a small fixed pool is enough.
const LOCAL_POOL_SLOT_SIZE: usize = 64 * 1024;
const LOCAL_POOL_SLOT_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
}

/// Client-side session: one `Connection` to a server, redialed on
/// failure per `ContextConfig`, with registered `Stream`s re-attached in
/// the order they were created.
pub struct Context {
    config: ContextConfig,
    state: Mutex<ContextState>,
    conn: Mutex<Option<Arc<Connection>>>,
    streams: Mutex<Vec<Arc<Stream>>>,
    pending_attaches: Mutex<HashMap<u32, Arc<Stream>>>,
    pending_detaches: Mutex<HashMap<u32, Arc<Stream>>>,
    import: MemImport,
    attempt: AtomicU32,
}

impl Context {
    pub fn new(config: ContextConfig) -> Arc<Self> {
        let local_pool = Arc::new(
            MemPool::new_private(LOCAL_POOL_SLOT_SIZE, LOCAL_POOL_SLOT_COUNT)
                .expect("private pool allocation cannot fail"),
        );
        Arc::new(Self {
            config,
            state: Mutex::new(ContextState::Unconnected),
            conn: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            pending_attaches: Mutex::new(HashMap::new()),
            pending_detaches: Mutex::new(HashMap::new()),
            import: MemImport::new(local_pool),
            attempt: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ContextState) {
        let mut guard = self.state.lock().unwrap();
        tracing::debug!(from = ?*guard, to = ?s, "context state transition");
        *guard = s;
        let failed_or_lost = s == ContextState::Connecting || s == ContextState::Failed;
        drop(guard);
        if failed_or_lost {
            for stream in self.streams.lock().unwrap().iter() {
                stream.on_connection_lost();
            }
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.lock().unwrap().clone()
    }

    /// Dial `url`, spawning the connection's event loop and reconnect
    /// driver on a background task. Returns immediately; observe progress
    /// via `state()`.
    pub fn connect_to(self: &Arc<Self>, url: impl Into<String>) {
        let url = url.into();
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            ctx.run_loop(url).await;
        });
    }

    /// Register a stream so it is automatically re-attached after a
    /// reconnect if it was attached (or attaching) at the time the
    /// connection was lost. Call before or after `attach_stream`.
    pub fn register_stream(&self, stream: Arc<Stream>) {
        self.streams.lock().unwrap().push(stream);
    }

    /// Request the server open a channel for `stream`. The stream
    /// transitions DETACHED → ATTACHING immediately; ATTACHING → ATTACHED
    /// happens asynchronously once the server's HANDSHAKE_ACK arrives
    /// (routed through `dispatch`).
    pub fn attach_stream(&self, stream: &Arc<Stream>) -> Result<(), IncError> {
        stream.begin_attach()?;
        let conn = self.conn.lock().unwrap().clone().ok_or(IncError::InvalidState)?;
        let seq = conn.next_seq();
        self.pending_attaches.lock().unwrap().insert(seq, Arc::clone(stream));
        let msg = Message::new(MessageType::StreamOpen, 0, seq, MessageFlags::NONE, DTS_FOREVER, Bytes::new());
        conn.send(msg)
    }

    /// Request the server close `stream`'s channel. A no-op (returns
    /// immediately with the stream already DETACHED) if no server
    /// round-trip is needed — see `Stream::begin_detach`.
    pub fn detach_stream(&self, stream: &Arc<Stream>) -> Result<(), IncError> {
        if !stream.begin_detach() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap().clone().ok_or(IncError::InvalidState)?;
        let seq = conn.next_seq();
        self.pending_detaches.lock().unwrap().insert(seq, Arc::clone(stream));
        let msg = Message::new(
            MessageType::StreamClose,
            stream.channel_id(),
            seq,
            MessageFlags::NONE,
            DTS_FOREVER,
            Bytes::new(),
        );
        conn.send(msg)
    }

    /// Write `data` on `stream`'s channel. Fails if the stream is not
    /// writable (wrong mode, or not yet ATTACHED).
    pub fn write_stream(&self, stream: &Arc<Stream>, pos: u64, data: &[u8]) -> Result<(), IncError> {
        if !stream.can_write() {
            return Err(IncError::InvalidState);
        }
        let conn = self.conn.lock().unwrap().clone().ok_or(IncError::InvalidState)?;
        let mut ts = TagStruct::new();
        ts.put_u64(pos);
        ts.put_bytes(data);
        let msg = Message::new(
            MessageType::BinaryData,
            stream.channel_id(),
            conn.next_seq(),
            MessageFlags::NONE,
            DTS_FOREVER,
            ts.freeze(),
        );
        conn.send(msg)?;
        stream.note_sent();
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, url: String) {
        loop {
            self.set_state(ContextState::Connecting);
            match dial(&url).await {
                Ok(transport) => {
                    self.attempt.store(0, Ordering::Relaxed);
                    let conn = Connection::new(Role::Client);
                    *self.conn.lock().unwrap() = Some(Arc::clone(&conn));

                    let dispatch_ctx = Arc::clone(&self);
                    let run_conn = Arc::clone(&conn);
                    let handle = tokio::spawn(async move {
                        run_conn
                            .run(transport, move |msg| {
                                dispatch_ctx.dispatch(msg);
                            })
                            .await;
                    });

                    // `Connection::run` flips to READY as soon as it starts
                    // executing, but that only happens once the spawned task
                    // gets polled. Wait for it before re-attaching streams,
                    // since `attach_stream` sends over the connection and
                    // would be rejected with InvalidState beforehand.
                    loop {
                        match conn.state() {
                            ConnectionState::Ready => break,
                            ConnectionState::Failed | ConnectionState::Closing => break,
                            _ => tokio::task::yield_now().await,
                        }
                    }
                    if conn.state() == ConnectionState::Ready {
                        self.set_state(ContextState::Ready);
                        self.reattach_lost_streams();
                    }

                    let _ = handle.await;
                    *self.conn.lock().unwrap() = None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "context connect failed");
                }
            }

            if !self.config.auto_reconnect {
                self.set_state(ContextState::Failed);
                return;
            }
            let attempts = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
            if attempts > self.config.max_reconnect_attempts {
                self.set_state(ContextState::Failed);
                return;
            }
            self.set_state(ContextState::Connecting);
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_interval_ms)).await;
        }
    }

    /// Re-issue STREAM_OPEN for every registered stream left in ERROR by
    /// the connection drop (i.e. it was attached or attaching, not
    /// explicitly detached by the caller).
    fn reattach_lost_streams(self: &Arc<Self>) {
        let streams: Vec<Arc<Stream>> = self.streams.lock().unwrap().clone();
        for stream in streams {
            if stream.state() == StreamState::Error {
                stream.prepare_for_reattach();
                let _ = self.attach_stream(&stream);
            }
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.msg_type() {
            Some(MessageType::HandshakeAck) => {
                let seq = msg.header.seq_num;
                if let Some(stream) = self.pending_attaches.lock().unwrap().remove(&seq) {
                    let mut ts = TagStruct::from_bytes(msg.payload.clone());
                    match ts.get_u32() {
                        Some(channel_id) => stream.on_channel_allocated(channel_id),
                        None => stream.on_attach_failed(),
                    }
                }
            }
            Some(MessageType::StreamClose) => {
                let seq = msg.header.seq_num;
                if let Some(stream) = self.pending_detaches.lock().unwrap().remove(&seq) {
                    stream.on_detach_complete();
                }
            }
            Some(MessageType::BinaryData) => self.handle_binary_data(&msg),
            Some(MessageType::Event) => self.try_handle_ack(&msg),
            _ => {}
        }
    }

    /// Server-pushed data, SHM-backed (imports the exported block and acks
    /// so the server can release its export slot) or inline.
    fn handle_binary_data(&self, msg: &Message) {
        let Some(stream) = self.stream_for_channel(msg.header.channel_id) else { return };

        if msg.flags().contains(MessageFlags::SHM_DATA) {
            let mut ts = TagStruct::from_bytes(msg.payload.clone());
            let (Some(block_id), Some(shm_id), Some(segment_name), Some(offset), Some(size), Some(pos)) = (
                ts.get_u32(),
                ts.get_i64(),
                ts.get_str(),
                ts.get_u64(),
                ts.get_u64(),
                ts.get_u64(),
            ) else {
                return;
            };
            let _ = pos;
            let Some(block) = self
                .import
                .get(block_id, shm_id, &segment_name, offset as usize, size as usize)
            else {
                return;
            };
            let bytes = {
                let guard = block.data();
                Bytes::copy_from_slice(guard.as_slice())
            };
            stream.deliver(bytes);

            let mut ack = TagStruct::new();
            ack.put_str("ack");
            ack.put_u32(msg.header.channel_id);
            ack.put_u32(msg.header.seq_num);
            ack.put_u32(block_id);
            ack.put_u32(size as u32);
            if let Some(conn) = self.conn.lock().unwrap().clone() {
                let ack_msg = Message::new(
                    MessageType::Event,
                    msg.header.channel_id,
                    conn.next_seq(),
                    MessageFlags::NONE,
                    DTS_FOREVER,
                    ack.freeze(),
                );
                let _ = conn.send(ack_msg);
            }
        } else {
            let mut ts = TagStruct::from_bytes(msg.payload.clone());
            let _pos = ts.get_u64();
            if let Some(data) = ts.get_bytes() {
                stream.deliver(data);
            }
        }
    }

    /// A peer ack for a write this context sent (§4.G credit return).
    fn try_handle_ack(&self, msg: &Message) {
        let mut ts = TagStruct::from_bytes(msg.payload.clone());
        let Some(tag) = ts.get_str() else { return };
        if tag != "ack" {
            return;
        }
        let (Some(channel_id), Some(seq_num), Some(_block_id), Some(len)) =
            (ts.get_u32(), ts.get_u32(), ts.get_u32(), ts.get_u32())
        else {
            return;
        };
        if let Some(stream) = self.stream_for_channel(channel_id) {
            stream.ack_data_received(seq_num, len as usize);
        }
    }

    fn stream_for_channel(&self, channel_id: u32) -> Option<Arc<Stream>> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.channel_id() == channel_id)
            .cloned()
    }
}

async fn dial(url: &str) -> Result<Transport, IncError> {
    match TransportUrl::parse(url)? {
        TransportUrl::Tcp { host, port } => {
            let addr: SocketAddr =
                format!("{host}:{port}").parse().map_err(|e| IncError::InvalidArgs(format!("{e}")))?;
            let stream = TcpStream::connect(addr).await?;
            Ok(Transport::Tcp(stream))
        }
        TransportUrl::Unix { path } | TransportUrl::Pipe { path } => {
            let stream = UnixStream::connect(&path).await?;
            Ok(Transport::Unix(stream))
        }
        TransportUrl::Udp { .. } => {
            Err(IncError::InvalidArgs("udp contexts are connectionless; use bind_udp".into()))
        }
    }
}
