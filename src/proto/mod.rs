// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The INC wire protocol: fixed-header messages, the parser/writer state
// machines that move them over a byte stream, and the Connection/Server/
// Context/Stream layers built on top.

pub mod connection;
pub mod context;
pub mod message;
pub mod operation;
pub mod protocol;
pub mod server;
pub mod stream;

pub use connection::{Connection, ConnectionState, Role, Transport};
pub use context::{Context, ContextState};
pub use message::{Message, MessageFlags, MessageHeader, MessageType, DTS_FOREVER, MAX_MESSAGE_SIZE};
pub use operation::{Operation, OperationTable, Outcome};
pub use protocol::{Parser, Writer};
pub use server::Server;
pub use stream::{Stream, StreamMode, StreamState};
