//! Offset-tracked byte buffer used at the engine's I/O boundary.
//!
//! `ProtonBuffer` keeps explicit read and write cursors over either writable
//! (`BytesMut`) or shared read-only (`Bytes`) storage. Cursors only move
//! forward; `reset` and `compact` are the only ways back.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BufferError;

/// Default ceiling for buffer growth.
pub const DEFAULT_MAX_CAPACITY: usize = i32::MAX as usize;

#[derive(Debug)]
enum Storage {
    Writable(BytesMut),
    ReadOnly(Bytes),
    Closed,
}

/// Growable byte container with read/write offsets.
#[derive(Debug)]
pub struct ProtonBuffer {
    storage: Storage,
    read_offset: usize,
    write_offset: usize,
    capacity: usize,
    max_capacity: usize,
}

impl ProtonBuffer {
    /// Allocate an empty writable buffer.
    #[must_use]
    pub fn allocate(capacity: usize) -> Self {
        Self::allocate_bounded(capacity, DEFAULT_MAX_CAPACITY.max(capacity))
    }

    /// Allocate a writable buffer that may never grow past `max_capacity`.
    #[must_use]
    pub fn allocate_bounded(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.min(max_capacity);
        Self {
            storage: Storage::Writable(BytesMut::with_capacity(capacity)),
            read_offset: 0,
            write_offset: 0,
            capacity,
            max_capacity,
        }
    }

    /// Wrap shared bytes as a read-only buffer without copying.
    #[must_use]
    pub fn wrap(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::ReadOnly(bytes),
            read_offset: 0,
            write_offset: len,
            capacity: len,
            max_capacity: len,
        }
    }

    /// Create a writable buffer holding a copy of `data`.
    #[must_use]
    pub fn copy_from(data: &[u8]) -> Self {
        let mut buffer = Self::allocate(data.len());
        if let Storage::Writable(bytes) = &mut buffer.storage {
            bytes.put_slice(data);
        }
        buffer.write_offset = data.len();
        buffer
    }

    /// Logical capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Growth ceiling.
    #[must_use]
    pub const fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Offset of the next byte to read.
    #[must_use]
    pub const fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// Offset of the next byte to write.
    #[must_use]
    pub const fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// Bytes between the read and write offsets.
    #[must_use]
    pub const fn readable_bytes(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Bytes that can be written without growing.
    #[must_use]
    pub const fn writable_bytes(&self) -> usize {
        self.capacity - self.write_offset
    }

    /// Whether any bytes remain to be read.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Whether the buffer rejects mutation.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self.storage, Storage::ReadOnly(_))
    }

    /// Whether the handle was transferred or closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.storage, Storage::Closed)
    }

    fn writable(&mut self) -> Result<&mut BytesMut, BufferError> {
        match &mut self.storage {
            Storage::Writable(bytes) => Ok(bytes),
            Storage::ReadOnly(_) => Err(BufferError::ReadOnly),
            Storage::Closed => Err(BufferError::Closed),
        }
    }

    fn data(&self) -> Result<&[u8], BufferError> {
        match &self.storage {
            Storage::Writable(bytes) => Ok(&bytes[..]),
            Storage::ReadOnly(bytes) => Ok(&bytes[..]),
            Storage::Closed => Err(BufferError::Closed),
        }
    }

    /// Grow, if needed, so that `len` more bytes can be written.
    pub fn ensure_writable(&mut self, len: usize) -> Result<(), BufferError> {
        let required = self.write_offset.saturating_add(len);
        let max = self.max_capacity;
        let capacity = self.capacity;
        let bytes = self.writable()?;
        if required <= capacity {
            return Ok(());
        }
        if required > max {
            return Err(BufferError::CapacityExceeded {
                requested: required,
                max,
            });
        }
        let grown = capacity.saturating_mul(2).max(required).min(max);
        bytes.reserve(grown - bytes.len());
        self.capacity = grown;
        Ok(())
    }

    /// Append raw bytes at the write offset.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.ensure_writable(data.len())?;
        self.writable()?.put_slice(data);
        self.write_offset += data.len();
        Ok(())
    }

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.write_bytes(&[value])
    }

    /// Append a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<(), BufferError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Append a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), BufferError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Append a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<(), BufferError> {
        self.write_bytes(&value.to_be_bytes())
    }

    fn take_readable(&mut self, len: usize) -> Result<&[u8], BufferError> {
        let available = self.readable_bytes();
        if len > available {
            return Err(BufferError::Underflow {
                needed: len,
                available,
            });
        }
        let start = self.read_offset;
        self.read_offset += len;
        Ok(&self.data()?[start..start + len])
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take_readable(1)?[0])
    }

    /// Read a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        let raw = self.take_readable(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        let raw = self.take_readable(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        let mut raw = self.take_readable(8)?;
        Ok(raw.get_u64())
    }

    /// Read `len` bytes into an owned `Bytes`.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, BufferError> {
        if let Storage::ReadOnly(bytes) = &self.storage {
            let available = self.write_offset - self.read_offset;
            if len > available {
                return Err(BufferError::Underflow {
                    needed: len,
                    available,
                });
            }
            let slice = bytes.slice(self.read_offset..self.read_offset + len);
            self.read_offset += len;
            return Ok(slice);
        }
        Ok(Bytes::copy_from_slice(self.take_readable(len)?))
    }

    /// Peek a byte at an absolute index below the write offset.
    pub fn get_u8(&self, index: usize) -> Result<u8, BufferError> {
        if index >= self.write_offset {
            return Err(BufferError::OffsetOutOfBounds {
                offset: index,
                limit: self.write_offset,
            });
        }
        Ok(self.data()?[index])
    }

    /// Readable region as a slice.
    pub fn readable(&self) -> Result<&[u8], BufferError> {
        Ok(&self.data()?[self.read_offset..self.write_offset])
    }

    /// Advance the read offset by `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        self.take_readable(len).map(|_| ())
    }

    /// Move the read offset forward to `offset`.
    pub fn set_read_offset(&mut self, offset: usize) -> Result<(), BufferError> {
        if offset < self.read_offset || offset > self.write_offset {
            return Err(BufferError::OffsetOutOfBounds {
                offset,
                limit: self.write_offset,
            });
        }
        self.read_offset = offset;
        Ok(())
    }

    /// Move the write offset forward to `offset`, zero filling the gap.
    pub fn set_write_offset(&mut self, offset: usize) -> Result<(), BufferError> {
        if offset < self.write_offset || offset > self.capacity {
            return Err(BufferError::OffsetOutOfBounds {
                offset,
                limit: self.capacity,
            });
        }
        self.writable()?.resize(offset, 0);
        self.write_offset = offset;
        Ok(())
    }

    /// Rewind both offsets to zero, discarding content.
    pub fn reset(&mut self) -> Result<(), BufferError> {
        self.writable()?.clear();
        self.read_offset = 0;
        self.write_offset = 0;
        Ok(())
    }

    /// Discard already-read bytes and shift the readable region to offset zero.
    pub fn compact(&mut self) -> Result<(), BufferError> {
        let consumed = self.read_offset;
        self.writable()?.advance(consumed);
        self.read_offset = 0;
        self.write_offset -= consumed;
        self.capacity -= consumed;
        Ok(())
    }

    /// Read-only view over `len` readable bytes starting at `offset` relative to the read offset.
    ///
    /// Shares storage when the buffer is already read-only; copies otherwise.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self, BufferError> {
        let available = self.readable_bytes();
        if offset.saturating_add(len) > available {
            return Err(BufferError::OffsetOutOfBounds {
                offset: offset + len,
                limit: available,
            });
        }
        let start = self.read_offset + offset;
        let bytes = match &self.storage {
            Storage::ReadOnly(bytes) => bytes.slice(start..start + len),
            Storage::Writable(bytes) => Bytes::copy_from_slice(&bytes[start..start + len]),
            Storage::Closed => return Err(BufferError::Closed),
        };
        Ok(Self::wrap(bytes))
    }

    /// Writable deep copy of the readable region.
    pub fn copy(&self) -> Result<Self, BufferError> {
        Ok(Self::copy_from(self.readable()?))
    }

    /// Split the readable region off into its own buffer.
    ///
    /// `self` keeps any spare capacity and starts empty.
    pub fn split(&mut self) -> Result<Self, BufferError> {
        let read = self.read_offset;
        let write = self.write_offset;
        let head = match &mut self.storage {
            Storage::Writable(bytes) => {
                let mut head = bytes.split_to(write);
                head.advance(read);
                Self::copy_buffer_mut(head)
            }
            Storage::ReadOnly(bytes) => {
                let mut head = bytes.split_to(write);
                head.advance(read);
                Self::wrap(head)
            }
            Storage::Closed => return Err(BufferError::Closed),
        };
        self.capacity -= write;
        self.max_capacity = self.max_capacity.saturating_sub(write);
        self.read_offset = 0;
        self.write_offset = 0;
        Ok(head)
    }

    fn copy_buffer_mut(bytes: BytesMut) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::Writable(bytes),
            read_offset: 0,
            write_offset: len,
            capacity: len,
            max_capacity: DEFAULT_MAX_CAPACITY.max(len),
        }
    }

    /// Freeze writable storage; later mutation fails with [`BufferError::ReadOnly`].
    pub fn convert_to_read_only(&mut self) -> Result<(), BufferError> {
        let storage = std::mem::replace(&mut self.storage, Storage::Closed);
        self.storage = match storage {
            Storage::Writable(bytes) => {
                self.capacity = self.write_offset;
                self.max_capacity = self.write_offset;
                Storage::ReadOnly(bytes.freeze())
            }
            Storage::ReadOnly(bytes) => Storage::ReadOnly(bytes),
            Storage::Closed => return Err(BufferError::Closed),
        };
        Ok(())
    }

    /// Consume the buffer and return its readable region without copying.
    pub fn into_bytes(self) -> Result<Bytes, BufferError> {
        let Self {
            storage,
            read_offset,
            write_offset,
            ..
        } = self;
        match storage {
            Storage::Writable(bytes) => Ok(bytes.freeze().slice(read_offset..write_offset)),
            Storage::ReadOnly(bytes) => Ok(bytes.slice(read_offset..write_offset)),
            Storage::Closed => Err(BufferError::Closed),
        }
    }

    /// Move the content into a new owner and close this handle.
    pub fn transfer(&mut self) -> Result<Self, BufferError> {
        if self.is_closed() {
            return Err(BufferError::Closed);
        }
        let storage = std::mem::replace(&mut self.storage, Storage::Closed);
        let moved = Self {
            storage,
            read_offset: self.read_offset,
            write_offset: self.write_offset,
            capacity: self.capacity,
            max_capacity: self.max_capacity,
        };
        self.read_offset = 0;
        self.write_offset = 0;
        self.capacity = 0;
        Ok(moved)
    }
}

impl Default for ProtonBuffer {
    fn default() -> Self {
        Self::allocate(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_track_reads_and_writes() {
        let mut buffer = ProtonBuffer::allocate(4);
        buffer.write_u32(0xDEAD_BEEF).unwrap();
        buffer.write_u16(7).unwrap();
        assert_eq!(buffer.write_offset(), 6);
        assert!(buffer.capacity() >= 6);
        assert_eq!(buffer.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buffer.readable_bytes(), 2);
        assert_eq!(buffer.read_u16().unwrap(), 7);
        assert!(matches!(
            buffer.read_u8(),
            Err(BufferError::Underflow { needed: 1, available: 0 })
        ));
    }

    #[test]
    fn growth_respects_max_capacity() {
        let mut buffer = ProtonBuffer::allocate_bounded(2, 4);
        buffer.write_bytes(&[1, 2, 3, 4]).unwrap();
        assert_eq!(
            buffer.write_u8(5),
            Err(BufferError::CapacityExceeded {
                requested: 5,
                max: 4
            })
        );
    }

    #[test]
    fn offsets_cannot_move_backwards() {
        let mut buffer = ProtonBuffer::copy_from(b"abcdef");
        buffer.set_read_offset(3).unwrap();
        assert!(buffer.set_read_offset(2).is_err());
        assert!(buffer.set_read_offset(7).is_err());
        buffer.reset().unwrap();
        assert_eq!(buffer.read_offset(), 0);
        assert_eq!(buffer.write_offset(), 0);
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut buffer = ProtonBuffer::copy_from(b"abc");
        buffer.convert_to_read_only().unwrap();
        assert!(buffer.is_read_only());
        assert_eq!(buffer.write_u8(1), Err(BufferError::ReadOnly));
        assert_eq!(buffer.read_u8().unwrap(), b'a');
    }

    #[test]
    fn slice_shares_read_only_storage() {
        let source = Bytes::from_static(b"hello world");
        let buffer = ProtonBuffer::wrap(source.clone());
        let slice = buffer.slice(6, 5).unwrap();
        let bytes = slice.into_bytes().unwrap();
        assert_eq!(&bytes[..], b"world");
        assert_eq!(bytes.as_ptr(), source[6..].as_ptr());
    }

    #[test]
    fn split_detaches_readable_region() {
        let mut buffer = ProtonBuffer::allocate(16);
        buffer.write_bytes(b"frame").unwrap();
        buffer.skip(1).unwrap();
        let head = buffer.split().unwrap();
        assert_eq!(head.readable().unwrap(), b"rame");
        assert_eq!(buffer.readable_bytes(), 0);
        buffer.write_bytes(b"next").unwrap();
        assert_eq!(buffer.readable().unwrap(), b"next");
    }

    #[test]
    fn compact_discards_consumed_bytes() {
        let mut buffer = ProtonBuffer::copy_from(b"xxdata");
        buffer.skip(2).unwrap();
        buffer.compact().unwrap();
        assert_eq!(buffer.read_offset(), 0);
        assert_eq!(buffer.readable().unwrap(), b"data");
    }

    #[test]
    fn transfer_closes_the_sender_handle() {
        let mut buffer = ProtonBuffer::copy_from(b"owned");
        let moved = buffer.transfer().unwrap();
        assert!(buffer.is_closed());
        assert_eq!(buffer.readable(), Err(BufferError::Closed));
        assert_eq!(buffer.write_u8(0), Err(BufferError::Closed));
        assert_eq!(moved.readable().unwrap(), b"owned");
    }
}
