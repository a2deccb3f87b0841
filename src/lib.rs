// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The INC runtime: shared-memory pools and reference-counted blocks
// (block, pool, import, export), a tag+length wire format (tagstruct), and
// a connection/server/context/stream protocol layer built on tokio (proto).

mod platform;
pub mod shm_name;

mod shm;
pub use shm::{BackingKind, ShmOpenMode, ShmSegment};

mod block;
pub use block::{ArrayOptions, BlockKind, MemBlock, ScopedData};

mod pool;
pub use pool::{MemPool, Slot, Stat};

mod import;
pub use import::MemImport;

mod export;
pub use export::{ExportDescriptor, MemExport};

mod tagstruct;
pub use tagstruct::TagStruct;

mod rw_lock;
pub use rw_lock::RwLock;

mod spin_lock;
pub use spin_lock::SpinLock;

mod error;
pub use error::{IncError, Result};

mod config;
pub use config::{ContextConfig, ServerConfig};

mod url;
pub use url::TransportUrl;

pub mod proto;
