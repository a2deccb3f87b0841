// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Minimal INC server: accepts clients on a tcp/unix URL, then broadcasts an
// incrementing counter payload to every client that has attached a channel,
// until interrupted. Demonstrates the zero-copy broadcast path of spec.md
// scenario 2 (§8): a single pool acquire feeds every receiver.
//
// Usage:
//   demo_server [url]        (default tcp://127.0.0.1:7878)
//
// Clients are assumed to attach exactly one READ stream, which the server
// (proto::server) allocates as channel 1 — the first STREAM_OPEN on a fresh
// connection always gets the first id off `next_channel`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inc_runtime::proto::Server;
use inc_runtime::{MemPool, ServerConfig};

const PAYLOAD_LEN: usize = 4096;
const BROADCAST_CHANNEL: u32 = 1;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let url = std::env::args().nth(1).unwrap_or_else(|| "tcp://127.0.0.1:7878".to_string());

    let config = ServerConfig::default();
    let pool = Arc::new(MemPool::new_private(config.slot_size, 16).expect("private pool allocation cannot fail"));
    let server = Server::new(pool, config);

    let clients: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let on_connected = {
        let clients = Arc::clone(&clients);
        Arc::new(move |client_id: u64| {
            tracing::info!(client_id, "client connected");
            clients.lock().unwrap().push(client_id);
        })
    };
    let on_message = Arc::new(|client_id: u64, msg: inc_runtime::proto::Message| {
        tracing::debug!(client_id, msg_type = msg.header.msg_type, "unhandled application message");
    });

    let quit = Arc::new(AtomicBool::new(false));
    install_shutdown_hook({
        let quit = Arc::clone(&quit);
        move || quit.store(true, Ordering::Release)
    });

    let accept_server = Arc::clone(&server);
    let accept_url = url.clone();
    tokio::spawn(async move {
        if let Err(e) = accept_server.serve(&accept_url, on_connected, on_message).await {
            tracing::error!(error = %e, "server accept loop exited");
        }
    });

    tracing::info!(%url, "listening");

    let mut counter: u64 = 0;
    loop {
        if quit.load(Ordering::Acquire) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        counter = counter.wrapping_add(1);
        let mut payload = vec![b'X'; PAYLOAD_LEN];
        payload[0..8].copy_from_slice(&counter.to_le_bytes());
        let fingerprint = fnv1a(&payload);

        let ids: Vec<u64> = clients.lock().unwrap().clone();
        if ids.is_empty() {
            continue;
        }
        match server.broadcast_binary(&ids, BROADCAST_CHANNEL, fingerprint, &payload) {
            Ok(()) => tracing::info!(counter, fingerprint, clients = ids.len(), "broadcast sent"),
            Err(e) => tracing::warn!(error = %e, "broadcast failed"),
        }
    }

    tracing::info!("shutting down");
}

fn install_shutdown_hook(f: impl Fn() + Send + 'static) {
    #[cfg(unix)]
    {
        static CB: std::sync::OnceLock<Mutex<Box<dyn Fn() + Send>>> = std::sync::OnceLock::new();
        CB.get_or_init(|| Mutex::new(Box::new(f)));
        extern "C" fn handler(_: libc::c_int) {
            if let Some(cb) = CB.get() {
                if let Ok(g) = cb.lock() {
                    g();
                }
            }
        }
        unsafe {
            libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = f;
    }
}

#[cfg(unix)]
extern crate libc;
