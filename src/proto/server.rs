// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server: accepts connections, owns a MemPool (or one pool per client, per
// config), allocates channel ids on STREAM_OPEN, and drives zero-copy
// binary broadcast. The per-client inflight window and ack-driven credit
// return are the Rust realization of spec.md §4.G; the broadcast
// refcount-collapses-on-last-ack behavior is grounded on the teacher's
// `circ.rs` `BroadcastConnHead` bitmask (N receivers sharing one buffer,
// freed once every bit is cleared), generalized here to `MemBlock`'s own
// `Arc` refcount plus a `MemExport` slot per client instead of a bitmask,
// since the transport is a socket, not a shared ring.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, UnixListener};

use crate::block::MemBlock;
use crate::config::ServerConfig;
use crate::error::IncError;
use crate::export::MemExport;
use crate::pool::MemPool;
use crate::proto::connection::{Connection, Role, Transport};
use crate::proto::message::{Message, MessageFlags, MessageType, DTS_FOREVER};
use crate::rw_lock::RwLock;
use crate::tagstruct::TagStruct;
use crate::url::TransportUrl;

/// Per-client bookkeeping: the session connection, its per-client export
/// table (for SHM_DATA descriptors this server hands the client), the
/// channels it has open, and the broadcast inflight counters.
struct ClientState {
    conn: Arc<Connection>,
    export: MemExport,
    next_channel: AtomicU32,
    channels: std::sync::Mutex<HashMap<u32, ChannelInfo>>,
}

struct ChannelInfo {
    inflight: AtomicUsize,
    /// Packets held back by backpressure, sent as credit frees up.
    pending: std::collections::VecDeque<(u64, Bytes)>,
}

/// Accepts connections, owns the shared-memory pool(s), and drives
/// per-channel binary broadcast with ack-based flow control.
pub struct Server {
    config: ServerConfig,
    pool: Arc<MemPool>,
    clients: RwLock,
    client_table: std::sync::Mutex<HashMap<u64, Arc<ClientState>>>,
    next_client_id: AtomicU64,
}

impl Server {
    pub fn new(pool: Arc<MemPool>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            clients: RwLock::new(),
            client_table: std::sync::Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn pool(&self) -> &Arc<MemPool> {
        &self.pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn insert_client(&self, state: Arc<ClientState>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock();
        self.client_table.lock().unwrap().insert(id, state);
        self.clients.unlock();
        id
    }

    fn remove_client(&self, id: u64) {
        self.clients.lock();
        self.client_table.lock().unwrap().remove(&id);
        self.clients.unlock();
    }

    fn client(&self, id: u64) -> Option<Arc<ClientState>> {
        self.clients.lock_shared();
        let found = self.client_table.lock().unwrap().get(&id).cloned();
        self.clients.unlock_shared();
        found
    }

    /// Accept loop over a tcp or unix listener built from `url`.
    /// `on_connected(client_id)` fires once the handshake completes;
    /// `on_message(client_id, Message)` dispatches every subsequent
    /// application message (everything but the transport-level framing
    /// this function already handles: handshake, channel alloc, acks).
    pub async fn serve(
        self: Arc<Self>,
        url: &str,
        on_connected: Arc<dyn Fn(u64) + Send + Sync>,
        on_message: Arc<dyn Fn(u64, Message) + Send + Sync>,
    ) -> Result<(), IncError> {
        let parsed = TransportUrl::parse(url)?;
        match parsed {
            TransportUrl::Tcp { host, port } => {
                let addr: SocketAddr = format!("{host}:{port}")
                    .parse()
                    .map_err(|e| IncError::InvalidArgs(format!("{e}")))?;
                let listener = TcpListener::bind(addr).await?;
                loop {
                    let (sock, _peer) = listener.accept().await?;
                    self.clone().spawn_client(Transport::Tcp(sock), on_connected.clone(), on_message.clone());
                }
            }
            TransportUrl::Unix { path } | TransportUrl::Pipe { path } => {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                loop {
                    let (sock, _peer) = listener.accept().await?;
                    self.clone().spawn_client(Transport::Unix(sock), on_connected.clone(), on_message.clone());
                }
            }
            TransportUrl::Udp { .. } => {
                Err(IncError::InvalidArgs("udp servers are connectionless; use bind_udp".into()))
            }
        }
    }

    fn spawn_client(
        self: Arc<Self>,
        transport: Transport,
        on_connected: Arc<dyn Fn(u64) + Send + Sync>,
        on_message: Arc<dyn Fn(u64, Message) + Send + Sync>,
    ) {
        let conn = Connection::new(Role::ServerSide);
        let pool = Arc::clone(&self.pool);
        let state = Arc::new(ClientState {
            conn: Arc::clone(&conn),
            export: MemExport::new(pool),
            next_channel: AtomicU32::new(1),
            channels: std::sync::Mutex::new(HashMap::new()),
        });
        let client_id = self.insert_client(state);
        tracing::info!(client_id, "client connected");
        on_connected(client_id);

        tokio::spawn(async move {
            let server = self;
            let dispatch_server = Arc::clone(&server);
            let this_client = client_id;
            conn.run(transport, move |msg| {
                dispatch_server.dispatch(this_client, msg, &on_message);
            })
            .await;
            server.remove_client(this_client);
            tracing::info!(client_id = this_client, "client disconnected");
        });
    }

    /// Handle the connection-level messages this layer owns (handshake,
    /// STREAM_OPEN/CLOSE, acks) and forward everything else to the
    /// application's `on_message` callback.
    fn dispatch(&self, client_id: u64, msg: Message, on_message: &Arc<dyn Fn(u64, Message) + Send + Sync>) {
        let Some(client) = self.client(client_id) else { return };
        match msg.msg_type() {
            Some(MessageType::Handshake) => {
                let reply = Message::new(
                    MessageType::HandshakeAck,
                    0,
                    msg.header.seq_num,
                    MessageFlags::NONE,
                    DTS_FOREVER,
                    Bytes::new(),
                );
                let _ = client.conn.send(reply);
            }
            Some(MessageType::StreamOpen) => self.handle_stream_open(&client, &msg),
            Some(MessageType::StreamClose) => self.handle_stream_close(&client, &msg),
            Some(MessageType::Ping) => {
                let reply = Message::new(
                    MessageType::Pong,
                    msg.header.channel_id,
                    msg.header.seq_num,
                    MessageFlags::NONE,
                    DTS_FOREVER,
                    Bytes::new(),
                );
                let _ = client.conn.send(reply);
            }
            Some(MessageType::Event) => {
                if self.try_handle_ack(&client, &msg) {
                    return;
                }
                on_message(client_id, msg);
            }
            _ => on_message(client_id, msg),
        }
    }

    fn handle_stream_open(&self, client: &Arc<ClientState>, msg: &Message) {
        let channel_id = client.next_channel.fetch_add(1, Ordering::Relaxed);
        client.channels.lock().unwrap().insert(
            channel_id,
            ChannelInfo { inflight: AtomicUsize::new(0), pending: std::collections::VecDeque::new() },
        );
        let mut ts = TagStruct::new();
        ts.put_u32(channel_id);
        let reply = Message::new(
            MessageType::HandshakeAck,
            channel_id,
            msg.header.seq_num,
            MessageFlags::NONE,
            DTS_FOREVER,
            ts.freeze(),
        );
        let _ = client.conn.send(reply);
    }

    fn handle_stream_close(&self, client: &Arc<ClientState>, msg: &Message) {
        client.channels.lock().unwrap().remove(&msg.header.channel_id);
        let reply = Message::new(
            MessageType::StreamClose,
            msg.header.channel_id,
            msg.header.seq_num,
            MessageFlags::NONE,
            DTS_FOREVER,
            Bytes::new(),
        );
        let _ = client.conn.send(reply);
    }

    /// ACKs ride as an EVENT carrying TagStruct{"ack", channel_id, seq_num,
    /// block_id, len} — the wire has no dedicated ACK message type (spec.md
    /// §3's Message type list), so this is the chosen encoding (see
    /// DESIGN.md). `block_id` lets the server release its export slot,
    /// dropping its share of the broadcast `MemBlock`'s refcount.
    fn try_handle_ack(&self, client: &Arc<ClientState>, msg: &Message) -> bool {
        let mut ts = TagStruct::from_bytes(msg.payload.clone());
        let Some(tag) = ts.get_str() else { return false };
        if tag != "ack" {
            return false;
        }
        let (Some(channel_id), Some(seq_num), Some(block_id), Some(len)) =
            (ts.get_u32(), ts.get_u32(), ts.get_u32(), ts.get_u32())
        else {
            return false;
        };
        self.ack_received(client, channel_id, seq_num, block_id, len as usize);
        true
    }

    fn ack_received(&self, client: &Arc<ClientState>, channel_id: u32, _seq_num: u32, block_id: u32, _len: usize) {
        client.export.process_release(block_id);
        let mut channels = client.channels.lock().unwrap();
        if let Some(info) = channels.get_mut(&channel_id) {
            info.inflight.fetch_sub(1, Ordering::AcqRel);
            if let Some((pos, data)) = info.pending.pop_front() {
                drop(channels);
                let _ = self.send_binary_data_raw(client, channel_id, pos, &data);
            }
        }
    }

    /// Broadcast `data` to every client in `client_ids` on `channel_id`,
    /// importing the same underlying shared-memory slot for each receiver
    /// (spec.md scenario 2: one pool acquire, N sends, a single fingerprint).
    /// Subject to each client's `inflight_per_client` window (scenario 3):
    /// sends beyond the window are queued and flushed as acks arrive.
    pub fn broadcast_binary(&self, client_ids: &[u64], channel_id: u32, pos: u64, data: &[u8]) -> Result<(), IncError> {
        let block = MemBlock::new_one(&self.pool, data.len(), 1, 0, crate::block::ArrayOptions::NONE)
            .ok_or(IncError::InvalidMessage("pool exhausted".into()))?;
        {
            let guard = block.data();
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), guard.as_mut_ptr(), data.len()) };
        }
        for &client_id in client_ids {
            let Some(client) = self.client(client_id) else { continue };
            self.send_or_queue(&client, channel_id, pos, &block);
        }
        Ok(())
    }

    fn send_or_queue(&self, client: &Arc<ClientState>, channel_id: u32, pos: u64, block: &MemBlock) {
        let mut channels = client.channels.lock().unwrap();
        let Some(info) = channels.get_mut(&channel_id) else { return };
        if info.inflight.load(Ordering::Acquire) >= self.config.inflight_per_client {
            let bytes = {
                let g = block.data();
                Bytes::copy_from_slice(g.as_slice())
            };
            info.pending.push_back((pos, bytes));
            return;
        }
        info.inflight.fetch_add(1, Ordering::AcqRel);
        drop(channels);
        let _ = self.send_binary_data(client, channel_id, pos, block);
    }

    fn send_binary_data(&self, client: &Arc<ClientState>, channel_id: u32, pos: u64, block: &MemBlock) -> Result<(), IncError> {
        let desc = client
            .export
            .put(block)
            .ok_or(IncError::InvalidMessage("export table full".into()))?;
        let mut ts = TagStruct::new();
        ts.put_u32(desc.block_id);
        ts.put_i64(desc.shm_id);
        ts.put_str(&desc.segment_name);
        ts.put_u64(desc.offset as u64);
        ts.put_u64(desc.size as u64);
        ts.put_u64(pos);
        let msg = Message::new(
            MessageType::BinaryData,
            channel_id,
            client.conn.next_seq(),
            MessageFlags::SHM_DATA,
            DTS_FOREVER,
            ts.freeze(),
        );
        client.conn.send(msg)
    }

    /// Fallback path used to flush a previously-queued (backpressured)
    /// packet: re-exports a fresh copy since the original block may already
    /// have cycled back to the pool's free-list.
    fn send_binary_data_raw(&self, client: &Arc<ClientState>, channel_id: u32, pos: u64, data: &Bytes) -> Result<(), IncError> {
        let block = MemBlock::new_one(&self.pool, data.len(), 1, 0, crate::block::ArrayOptions::NONE)
            .ok_or(IncError::InvalidMessage("pool exhausted".into()))?;
        {
            let guard = block.data();
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), guard.as_mut_ptr(), data.len()) };
        }
        let mut channels = client.channels.lock().unwrap();
        if let Some(info) = channels.get_mut(&channel_id) {
            info.inflight.fetch_add(1, Ordering::AcqRel);
        }
        drop(channels);
        self.send_binary_data(client, channel_id, pos, &block)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock_shared();
        let n = self.client_table.lock().unwrap().len();
        self.clients.unlock_shared();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_starts_with_no_clients() {
        let pool = Arc::new(MemPool::new_private(1024, 4).unwrap());
        let server = Server::new(pool, ServerConfig::default());
        assert_eq!(server.client_count(), 0);
    }
}
