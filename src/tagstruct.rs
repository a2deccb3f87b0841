// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// TagStruct: an append-only tag+value buffer with a read cursor. Storage
// style follows the teacher's buffer.rs (an owning byte buffer with
// from_slice/data/data_mut); BYTES reads alias the buffer via bytes::Bytes
// instead of copying, per original_source/src/core/inc/iinctagstruct.cpp
// and spec.md §4.D.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Uint8 = 1,
    Uint16 = 2,
    Uint32 = 3,
    Uint64 = 4,
    Int32 = 5,
    Int64 = 6,
    Bool = 7,
    String = 8,
    Bytes = 9,
    Double = 10,
}

impl Tag {
    fn from_u8(v: u8) -> Option<Tag> {
        Some(match v {
            1 => Tag::Uint8,
            2 => Tag::Uint16,
            3 => Tag::Uint32,
            4 => Tag::Uint64,
            5 => Tag::Int32,
            6 => Tag::Int64,
            7 => Tag::Bool,
            8 => Tag::String,
            9 => Tag::Bytes,
            10 => Tag::Double,
            _ => return None,
        })
    }
}

/// An append-only tag+value byte buffer with a read cursor.
///
/// `put*` methods always succeed. `get*` methods validate the next tag
/// before consuming; on mismatch or truncation they leave the cursor
/// untouched and return `None` — callers read this as `ok=false`.
#[derive(Debug, Clone, Default)]
pub struct TagStruct {
    data: Bytes,
    buf: Vec<u8>,
    read_index: usize,
}

impl TagStruct {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a read-only view over already-serialized bytes (e.g. a
    /// received Message payload).
    pub fn from_bytes(data: Bytes) -> Self {
        Self { data, buf: Vec::new(), read_index: 0 }
    }

    fn bytes_view(&self) -> &[u8] {
        if self.buf.is_empty() {
            &self.data
        } else {
            &self.buf
        }
    }

    /// Freeze the buffer built via `put*` calls into a zero-copy `Bytes`,
    /// for embedding as a Message payload.
    pub fn freeze(self) -> Bytes {
        if self.buf.is_empty() {
            self.data
        } else {
            Bytes::from(self.buf)
        }
    }

    pub fn len(&self) -> usize {
        self.bytes_view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.data = Bytes::new();
        self.read_index = 0;
    }

    pub fn rewind(&mut self) {
        self.read_index = 0;
    }

    fn append_tag(&mut self, tag: Tag) {
        self.buf.push(tag as u8);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.append_tag(Tag::Uint8);
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.append_tag(Tag::Uint16);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.append_tag(Tag::Uint32);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.append_tag(Tag::Uint64);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.append_tag(Tag::Int32);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.append_tag(Tag::Int64);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.append_tag(Tag::Bool);
        self.buf.push(v as u8);
    }

    pub fn put_str(&mut self, v: &str) {
        self.append_tag(Tag::String);
        self.buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.append_tag(Tag::Bytes);
        self.buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.append_tag(Tag::Double);
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    /// Nondestructive peek at the next tag byte, if any.
    fn peek_tag(&self) -> Option<Tag> {
        self.bytes_view().get(self.read_index).copied().and_then(Tag::from_u8)
    }

    fn expect_tag(&mut self, want: Tag) -> bool {
        if self.peek_tag() != Some(want) {
            return false;
        }
        self.read_index += 1;
        true
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        let view = self.bytes_view();
        if self.read_index + n > view.len() {
            return None;
        }
        let start = self.read_index;
        self.read_index += n;
        Some(&self.bytes_view()[start..start + n])
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        let start = self.read_index;
        if !self.expect_tag(Tag::Uint8) {
            return None;
        }
        match self.take(1) {
            Some(b) => Some(b[0]),
            None => {
                self.read_index = start;
                None
            }
        }
    }

    pub fn get_u16(&mut self) -> Option<u16> {
        self.get_fixed(Tag::Uint16, |b| u16::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_fixed(Tag::Uint32, |b| u32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Option<u64> {
        self.get_fixed(Tag::Uint64, |b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Option<i32> {
        self.get_fixed(Tag::Int32, |b| i32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Option<i64> {
        self.get_fixed(Tag::Int64, |b| i64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Option<f64> {
        self.get_fixed(Tag::Double, |b| f64::from_bits(u64::from_be_bytes(b.try_into().unwrap())))
    }

    pub fn get_bool(&mut self) -> Option<bool> {
        let start = self.read_index;
        if !self.expect_tag(Tag::Bool) {
            return None;
        }
        match self.take(1) {
            Some(b) => Some(b[0] != 0),
            None => {
                self.read_index = start;
                None
            }
        }
    }

    fn get_fixed<T>(&mut self, tag: Tag, decode: impl FnOnce(&[u8]) -> T) -> Option<T> {
        let start = self.read_index;
        if !self.expect_tag(tag) {
            return None;
        }
        let width = match tag {
            Tag::Uint16 => 2,
            Tag::Uint32 | Tag::Int32 => 4,
            Tag::Uint64 | Tag::Int64 | Tag::Double => 8,
            _ => unreachable!(),
        };
        match self.take(width) {
            Some(b) => Some(decode(b)),
            None => {
                self.read_index = start;
                None
            }
        }
    }

    pub fn get_str(&mut self) -> Option<String> {
        let start = self.read_index;
        if !self.expect_tag(Tag::String) {
            return None;
        }
        let Some(len_bytes) = self.take(4) else {
            self.read_index = start;
            return None;
        };
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        match self.take(len) {
            Some(b) => String::from_utf8(b.to_vec()).ok().or_else(|| {
                self.read_index = start;
                None
            }),
            None => {
                self.read_index = start;
                None
            }
        }
    }

    /// Zero-copy view of a BYTES element, aliasing this TagStruct's storage.
    pub fn get_bytes(&mut self) -> Option<Bytes> {
        let start = self.read_index;
        if !self.expect_tag(Tag::Bytes) {
            return None;
        }
        let Some(len_bytes) = self.take(4) else {
            self.read_index = start;
            return None;
        };
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        let offset = self.read_index;
        if self.take(len).is_none() {
            self.read_index = start;
            return None;
        }
        // Build a Bytes that shares the underlying allocation rather than copying.
        let base = if self.data.is_empty() {
            Bytes::from(self.buf.clone())
        } else {
            self.data.clone()
        };
        Some(base.slice(offset..offset + len))
    }
}
