// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Parser state machine and writer queue, generalized from the teacher's
// channel.rs partial-IO/claim-slot patterns (ring-buffer slot claiming)
// onto a byte stream. Pure, runtime-agnostic state: the async Connection
// event loop (proto::connection) owns the actual socket and feeds/drains
// these through tokio's AsyncRead/AsyncWrite.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::IncError;
use crate::proto::message::{Message, MessageHeader, HEADER_LEN};

const WRITE_QUEUE_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ReadHeader,
    ReadPayload,
}

/// Accumulates bytes from the transport and yields complete `Message`s.
/// Survives reads that deliver arbitrary small chunks, including the
/// header split across 32 single-byte reads.
pub struct Parser {
    buf: BytesMut,
    state: ParseState,
    header: Option<MessageHeader>,
}

impl Parser {
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), state: ParseState::ReadHeader, header: None }
    }

    /// Append bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to produce the next fully-buffered message. Returns `Ok(None)`
    /// when more bytes are needed. `Err` is a framing error — the caller
    /// must close the connection (never retry parsing past an error).
    pub fn try_parse(&mut self) -> Result<Option<Message>, IncError> {
        loop {
            match self.state {
                ParseState::ReadHeader => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let header_bytes = self.buf.split_to(HEADER_LEN);
                    let header = MessageHeader::decode(&header_bytes)?;
                    self.header = Some(header);
                    self.state = ParseState::ReadPayload;
                }
                ParseState::ReadPayload => {
                    let header = self.header.expect("header set before ReadPayload");
                    let needed = header.length as usize;
                    if self.buf.len() < needed {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(needed).freeze();
                    self.state = ParseState::ReadHeader;
                    self.header = None;
                    return Ok(Some(Message::decode(header, payload)?));
                }
            }
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO outbound queue with a hard cap and partial-write resumption.
/// `enqueue` fails synchronously with `QueueFull` once `WRITE_QUEUE_CAP`
/// messages are outstanding; this mirrors spec.md §4.E.
pub struct Writer {
    queue: VecDeque<Bytes>,
    offset: usize,
    failed: bool,
}

impl Writer {
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), offset: 0, failed: false }
    }

    pub fn enqueue(&mut self, encoded: Bytes) -> Result<(), IncError> {
        if self.failed {
            return Err(IncError::InvalidState);
        }
        if self.queue.len() >= WRITE_QUEUE_CAP {
            return Err(IncError::QueueFull);
        }
        self.queue.push_back(encoded);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The bytes of the front message still unwritten, or `None` if the
    /// queue is empty.
    pub fn next_chunk(&self) -> Option<&[u8]> {
        self.queue.front().map(|msg| &msg[self.offset..])
    }

    /// Record that `n` bytes of the front message were written. Pops the
    /// message once fully drained.
    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        if let Some(front) = self.queue.front() {
            if self.offset >= front.len() {
                self.offset = 0;
                self.queue.pop_front();
            }
        }
    }

    /// A transport write returned an error: clear the queue and mark the
    /// writer permanently failed. The owning Connection must transition to
    /// FAILED and must not call `enqueue` again on this writer.
    pub fn mark_write_failed(&mut self) {
        self.queue.clear();
        self.offset = 0;
        self.failed = true;
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}
