// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MessageHeader (exactly 32 bytes, little-endian) and Message (header +
// TagStruct payload). Replaces the teacher's FlatBuffers-backed message.rs:
// the builder/typed-view shape is kept (a `Message` wraps a payload plus
// read/verify helpers), the serialization backend is hand-rolled per
// spec.md §4.E instead of schema-compiled.

use bytes::{Bytes, BytesMut};

use crate::error::IncError;

pub const MAGIC: u32 = 0x494E_4300;
pub const HEADER_LEN: usize = 32;
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Deadline timestamp, nanoseconds. `i64::MAX` means "no deadline".
pub const DTS_FOREVER: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Invalid = 0,
    Handshake = 1,
    HandshakeAck = 2,
    Auth = 3,
    AuthAck = 4,
    MethodCall = 5,
    MethodReply = 6,
    Event = 7,
    Subscribe = 8,
    Unsubscribe = 9,
    StreamOpen = 10,
    StreamClose = 11,
    BinaryData = 12,
    Ping = 13,
    Pong = 14,
}

impl MessageType {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Invalid,
            1 => Self::Handshake,
            2 => Self::HandshakeAck,
            3 => Self::Auth,
            4 => Self::AuthAck,
            5 => Self::MethodCall,
            6 => Self::MethodReply,
            7 => Self::Event,
            8 => Self::Subscribe,
            9 => Self::Unsubscribe,
            10 => Self::StreamOpen,
            11 => Self::StreamClose,
            12 => Self::BinaryData,
            13 => Self::Ping,
            14 => Self::Pong,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const SHM_DATA: MessageFlags = MessageFlags(0x1);
    pub const COMPRESSED: MessageFlags = MessageFlags(0x2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        MessageFlags(bits)
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// The fixed 32-byte wire header. Field layout exactly matches spec.md §4.E.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub protocol_version: u8,
    pub payload_version: u8,
    pub msg_type: u16,
    pub channel_id: u32,
    pub seq_num: u32,
    pub length: u32,
    pub flags: u32,
    pub dts: i64,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4] = self.protocol_version;
        out[5] = self.payload_version;
        out[6..8].copy_from_slice(&self.msg_type.to_le_bytes());
        out[8..12].copy_from_slice(&self.channel_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.seq_num.to_le_bytes());
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out[24..32].copy_from_slice(&self.dts.to_le_bytes());
        out
    }

    /// Decode a 32-byte header. Validates the magic and the length bound
    /// (spec §4.E); does not validate `msg_type`'s enum range (callers check
    /// `MessageType::from_u16` separately, since an unrecognized type byte
    /// is not itself a framing error).
    pub fn decode(buf: &[u8]) -> Result<Self, IncError> {
        if buf.len() != HEADER_LEN {
            return Err(IncError::ProtocolError(format!(
                "header must be {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(IncError::ProtocolError(format!("bad magic: {magic:#x}")));
        }
        let length = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if length as usize > MAX_MESSAGE_SIZE {
            let flags = u32::from_le_bytes(buf[20..24].try_into().unwrap());
            if flags & MessageFlags::SHM_DATA.bits() == 0 {
                return Err(IncError::MessageTooLarge { len: length as usize, max: MAX_MESSAGE_SIZE });
            }
        }
        Ok(Self {
            protocol_version: buf[4],
            payload_version: buf[5],
            msg_type: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            channel_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            seq_num: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            length,
            flags: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            dts: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

/// A complete message: header plus TagStruct-encoded payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        channel_id: u32,
        seq_num: u32,
        flags: MessageFlags,
        dts: i64,
        payload: Bytes,
    ) -> Self {
        Self {
            header: MessageHeader {
                protocol_version: 1,
                payload_version: 1,
                msg_type: msg_type as u16,
                channel_id,
                seq_num,
                length: payload.len() as u32,
                flags: flags.bits(),
                dts,
            },
            payload,
        }
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.header.msg_type)
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits(self.header.flags)
    }

    /// Serialize header + payload as a single contiguous byte buffer, ready
    /// to hand to a Protocol writer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a header plus exactly `header.length` trailing payload bytes.
    pub fn decode(header: MessageHeader, payload: Bytes) -> Result<Self, IncError> {
        if payload.len() != header.length as usize {
            return Err(IncError::ProtocolError(format!(
                "declared length {} does not match payload {}",
                header.length,
                payload.len()
            )));
        }
        Ok(Self { header, payload })
    }
}
