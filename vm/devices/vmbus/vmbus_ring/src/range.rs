// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::RingMem;
use guestmem::AccessError;
use guestmem::MemoryRead;
use guestmem::MemoryWrite;

/// Either end of a ring.
pub trait Ring {
    type Memory: RingMem;

    fn mem(&self) -> &Self::Memory;
}

/// A span of ring data holding part of one packet. The offset may run past
/// the end of the ring; accesses wrap.
#[derive(Copy, Clone, Debug)]
pub struct RingRange {
    pub(crate) off: u32,
    pub(crate) size: u32,
}

impl RingRange {
    /// Returns a cursor for filling the range in an outgoing ring.
    pub fn writer<'a, T: Ring>(&self, ring: &'a T) -> RingCursor<'a, T::Memory> {
        RingCursor::new(ring.mem(), *self)
    }

    /// Returns a cursor for consuming the range from an incoming ring.
    pub fn reader<'a, T: Ring>(&self, ring: &'a T) -> RingCursor<'a, T::Memory> {
        RingCursor::new(ring.mem(), *self)
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Sequential access to a [`RingRange`].
pub struct RingCursor<'a, M> {
    mem: &'a M,
    pos: usize,
    end: usize,
}

impl<'a, M: RingMem> RingCursor<'a, M> {
    fn new(mem: &'a M, range: RingRange) -> Self {
        let pos = range.off as usize;
        Self {
            mem,
            pos,
            end: pos + range.size as usize,
        }
    }

    /// Claims the next `len` bytes, returning their ring offset.
    fn advance(&mut self, len: usize) -> Result<usize, AccessError> {
        let remaining = self.end - self.pos;
        if len > remaining {
            return Err(AccessError::OutOfRange(remaining, len));
        }
        let at = self.pos;
        self.pos += len;
        Ok(at)
    }
}

impl<M: RingMem> MemoryRead for RingCursor<'_, M> {
    fn read(&mut self, data: &mut [u8]) -> Result<&mut Self, AccessError> {
        let at = self.advance(data.len())?;
        self.mem.read_at(at, data);
        Ok(self)
    }

    fn skip(&mut self, len: usize) -> Result<&mut Self, AccessError> {
        self.advance(len)?;
        Ok(self)
    }

    fn len(&self) -> usize {
        self.end - self.pos
    }
}

impl<M: RingMem> MemoryWrite for RingCursor<'_, M> {
    fn write(&mut self, data: &[u8]) -> Result<(), AccessError> {
        let at = self.advance(data.len())?;
        self.mem.write_at(at, data);
        Ok(())
    }

    fn fill(&mut self, val: u8, len: usize) -> Result<(), AccessError> {
        let mut at = self.advance(len)?;
        let block = [val; 64];
        for chunk in (0..len).step_by(block.len()) {
            let n = block.len().min(len - chunk);
            self.mem.write_at(at, &block[..n]);
            at += n;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.end - self.pos
    }
}
