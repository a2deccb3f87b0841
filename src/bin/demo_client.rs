// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Minimal INC client: dials a server, attaches a single READ stream, and
// prints a fingerprint of every packet it receives. Pairs with
// src/bin/demo_server.rs (spec.md §8 scenario 2: client recomputes the
// server's fingerprint and they match).
//
// Usage:
//   demo_client [url]        (default tcp://127.0.0.1:7878)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inc_runtime::proto::connection::{Connection, Role};
use inc_runtime::proto::{Context, ContextState, Stream, StreamMode, StreamState};
use inc_runtime::ContextConfig;

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

    let quit = Arc::new(AtomicBool::new(false));
    install_shutdown_hook({
        let quit = Arc::clone(&quit);
        move || quit.store(true, Ordering::Release)
    });

    let ctx = Context::new(ContextConfig::default());
    // Stream::new wants a Connection handle up front; the real one is
    // substituted once the Context dials and re-dispatches through it.
    let stream = Stream::new("data", StreamMode::READ, Connection::new(Role::Client));
    ctx.register_stream(Arc::clone(&stream));
    ctx.connect_to(url.clone());

    tracing::info!(%url, "connecting");
    wait_for(&quit, || ctx.state() == ContextState::Ready || ctx.state() == ContextState::Failed).await;
    if ctx.state() != ContextState::Ready {
        tracing::error!("failed to reach the server");
        return;
    }

    if let Err(e) = ctx.attach_stream(&stream) {
        tracing::error!(error = %e, "attach failed");
        return;
    }
    wait_for(&quit, || stream.state() != StreamState::Attaching).await;
    if stream.state() != StreamState::Attached {
        tracing::error!(state = ?stream.state(), "stream did not attach");
        return;
    }
    tracing::info!(channel_id = stream.channel_id(), "attached");

    while !quit.load(Ordering::Acquire) {
        match stream.read() {
            Some(data) => {
                let fingerprint = fnv1a(&data);
                tracing::info!(len = data.len(), fingerprint, "received packet");
            }
            None => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }

    let _ = ctx.detach_stream(&stream);
}

async fn wait_for(quit: &Arc<AtomicBool>, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !done() && !quit.load(Ordering::Acquire) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
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
