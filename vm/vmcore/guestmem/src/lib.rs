// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical memory as seen by the firmware.
//!
//! The memory is a flat array of 32-bit atomic words, so that ring buffer
//! control words and payload bytes can be shared between the guest code and
//! an in-process host without `unsafe`. A first-fit page allocator stands in
//! for the firmware's page allocation service.
//!
//! On hardware-isolated VMs a private page is also reachable through a
//! host-visible alias above the shared GPA boundary, and the firmware maps
//! that alias at a virtual address carrying a canonicalization mask. Both
//! forms translate back to the same backing page here.

#![forbid(unsafe_code)]

use bitvec::vec::BitVec;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The page size used for all page-granular operations.
pub const PAGE_SIZE: usize = 4096;
const PAGE_SIZE64: u64 = 4096;

/// Returns the number of pages spanned by `len` bytes.
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// A guest memory access or allocation error.
#[derive(Debug, Error)]
pub enum GuestMemoryError {
    /// The access falls outside guest memory.
    #[error("range {gpa:#x}+{len:#x} is outside guest memory")]
    OutOfRange {
        /// The address accessed.
        gpa: u64,
        /// The length of the access.
        len: usize,
    },
    /// The address is not suitably aligned for the access.
    #[error("address {0:#x} is not aligned")]
    Unaligned(u64),
    /// There are not enough free contiguous pages.
    #[error("no room for {0} contiguous pages")]
    OutOfMemory(usize),
    /// Page allocation requests must be for at least one page.
    #[error("zero-page allocation")]
    EmptyAllocation,
}

/// An error from a [`MemoryRead`] or [`MemoryWrite`] cursor.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The underlying memory access failed.
    #[error("memory access error")]
    Memory(#[from] GuestMemoryError),
    /// The access is longer than the remaining range.
    #[error("out of range: {0:#x} < {1:#x}")]
    OutOfRange(usize, usize),
}

/// The host-visible alias layout of an isolated VM.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SharedAlias {
    /// Offset added to a private GPA to form its host-visible GPA. Zero when
    /// the VM is not isolated.
    pub shared_gpa_boundary: u64,
    /// Bits set in the virtual address of a host-visible mapping.
    pub canonicalization_mask: u64,
}

/// Simulated guest memory. Cheap to clone; clones share the same backing.
#[derive(Clone)]
pub struct GuestMemory {
    inner: Arc<GuestMemoryInner>,
}

struct GuestMemoryInner {
    debug_name: Arc<str>,
    words: Box<[AtomicU32]>,
    allocated: Mutex<BitVec>,
    alias: SharedAlias,
}

impl Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("debug_name", &self.inner.debug_name)
            .field("len", &self.len())
            .field("alias", &self.inner.alias)
            .finish()
    }
}

impl GuestMemory {
    /// Allocates `page_count` pages of zeroed guest memory.
    pub fn new(debug_name: impl Into<Arc<str>>, page_count: usize) -> Self {
        Self::with_alias(debug_name, page_count, SharedAlias::default())
    }

    /// Allocates guest memory that is also addressable through the
    /// host-visible alias described by `alias`.
    ///
    /// Panics if the shared GPA boundary overlaps the memory itself.
    pub fn with_alias(
        debug_name: impl Into<Arc<str>>,
        page_count: usize,
        alias: SharedAlias,
    ) -> Self {
        let len = page_count * PAGE_SIZE;
        assert!(
            alias.shared_gpa_boundary == 0 || alias.shared_gpa_boundary >= len as u64,
            "shared gpa boundary inside guest memory"
        );
        let mut words = Vec::new();
        words.resize_with(len / 4, || AtomicU32::new(0));
        let mut allocated = BitVec::repeat(false, page_count);
        // Page zero is never handed out, so a zero address can mean "none".
        if page_count > 0 {
            allocated.set(0, true);
        }
        Self {
            inner: Arc::new(GuestMemoryInner {
                debug_name: debug_name.into(),
                words: words.into_boxed_slice(),
                allocated: Mutex::new(allocated),
                alias,
            }),
        }
    }

    /// Returns the size of guest memory in bytes.
    pub fn len(&self) -> usize {
        self.inner.words.len() * 4
    }

    /// Returns the host-visible alias layout.
    pub fn alias(&self) -> SharedAlias {
        self.inner.alias
    }

    fn translate(&self, gpa: u64, len: usize) -> Result<usize, GuestMemoryError> {
        let alias = &self.inner.alias;
        let mut addr = gpa & !alias.canonicalization_mask;
        if alias.shared_gpa_boundary != 0 && addr >= alias.shared_gpa_boundary {
            addr -= alias.shared_gpa_boundary;
        }
        let end = addr.checked_add(len as u64);
        match end {
            Some(end) if end <= self.len() as u64 => Ok(addr as usize),
            _ => Err(GuestMemoryError::OutOfRange { gpa, len }),
        }
    }

    fn load_byte(&self, off: usize) -> u8 {
        (self.inner.words[off / 4].load(Ordering::Relaxed) >> ((off % 4) * 8)) as u8
    }

    fn store_byte(&self, off: usize, val: u8) {
        let shift = (off % 4) * 8;
        let _ = self.inner.words[off / 4].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
            Some((w & !(0xff << shift)) | ((val as u32) << shift))
        });
    }

    /// Reads from guest memory address `gpa` into `dest`.
    pub fn read_at(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mut off = self.translate(gpa, dest.len())?;
        let mut i = 0;
        while i < dest.len() {
            if off % 4 == 0 && dest.len() - i >= 4 {
                let w = self.inner.words[off / 4].load(Ordering::Relaxed);
                dest[i..i + 4].copy_from_slice(&w.to_le_bytes());
                i += 4;
                off += 4;
            } else {
                dest[i] = self.load_byte(off);
                i += 1;
                off += 1;
            }
        }
        Ok(())
    }

    /// Writes `src` into guest memory at address `gpa`.
    pub fn write_at(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let mut off = self.translate(gpa, src.len())?;
        let mut i = 0;
        while i < src.len() {
            if off % 4 == 0 && src.len() - i >= 4 {
                let w = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
                self.inner.words[off / 4].store(w, Ordering::Relaxed);
                i += 4;
                off += 4;
            } else {
                self.store_byte(off, src[i]);
                i += 1;
                off += 1;
            }
        }
        Ok(())
    }

    /// Writes `len` bytes of `val` into guest memory at address `gpa`.
    pub fn fill_at(&self, gpa: u64, val: u8, len: usize) -> Result<(), GuestMemoryError> {
        let mut off = self.translate(gpa, len)?;
        let word = u32::from_ne_bytes([val; 4]);
        let end = off + len;
        while off < end {
            if off % 4 == 0 && end - off >= 4 {
                self.inner.words[off / 4].store(word, Ordering::Relaxed);
                off += 4;
            } else {
                self.store_byte(off, val);
                off += 1;
            }
        }
        Ok(())
    }

    /// Reads an object from guest memory at address `gpa`.
    pub fn read_plain<T: IntoBytes + FromBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
    ) -> Result<T, GuestMemoryError> {
        let mut value = T::new_zeroed();
        self.read_at(gpa, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Writes an object to guest memory at address `gpa`.
    pub fn write_plain<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
        b: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write_at(gpa, b.as_bytes())
    }

    /// Returns `N` consecutive 32-bit words at `gpa` for shared atomic
    /// access, as used by ring buffer control pages.
    pub fn atomic_words<const N: usize>(
        &self,
        gpa: u64,
    ) -> Result<&[AtomicU32; N], GuestMemoryError> {
        let off = self.translate(gpa, N * 4)?;
        if off % 4 != 0 {
            return Err(GuestMemoryError::Unaligned(gpa));
        }
        let words = &self.inner.words[off / 4..off / 4 + N];
        words
            .try_into()
            .map_err(|_| GuestMemoryError::OutOfRange { gpa, len: N * 4 })
    }

    /// Allocates `count` contiguous pages, returning the GPA of the first.
    ///
    /// The contents are whatever the pages last held.
    pub fn allocate_pages(&self, count: usize) -> Result<u64, GuestMemoryError> {
        if count == 0 {
            return Err(GuestMemoryError::EmptyAllocation);
        }
        let mut allocated = self.inner.allocated.lock();
        let mut start = 1;
        while start + count <= allocated.len() {
            match allocated[start..start + count].last_one() {
                Some(i) => start += i + 1,
                None => {
                    allocated[start..start + count].fill(true);
                    return Ok(start as u64 * PAGE_SIZE64);
                }
            }
        }
        Err(GuestMemoryError::OutOfMemory(count))
    }

    /// Frees pages allocated by [`Self::allocate_pages`].
    ///
    /// Panics if any of the pages is not allocated.
    pub fn free_pages(&self, gpa: u64, count: usize) {
        assert!(gpa % PAGE_SIZE64 == 0, "freeing unaligned page {gpa:#x}");
        let first = (gpa / PAGE_SIZE64) as usize;
        let mut allocated = self.inner.allocated.lock();
        assert!(
            first > 0 && first + count <= allocated.len(),
            "freeing pages outside guest memory"
        );
        let range = &mut allocated[first..first + count];
        assert!(range.all(), "freeing pages that are not allocated");
        range.fill(false);
    }

    /// Returns the number of pages currently allocated.
    pub fn allocated_pages(&self) -> usize {
        // Page zero is permanently reserved.
        self.inner.allocated.lock().count_ones().saturating_sub(1)
    }
}

/// A cursor for reading from a range of memory.
pub trait MemoryRead {
    /// Reads `data.len()` bytes and advances.
    fn read(&mut self, data: &mut [u8]) -> Result<&mut Self, AccessError>;
    /// Advances by `len` bytes.
    fn skip(&mut self, len: usize) -> Result<&mut Self, AccessError>;
    /// Returns the number of bytes remaining.
    fn len(&self) -> usize;

    /// Reads an object.
    fn read_plain<T: IntoBytes + FromBytes + Immutable + KnownLayout>(
        &mut self,
    ) -> Result<T, AccessError> {
        let mut value: T = FromZeros::new_zeroed();
        self.read(value.as_mut_bytes())?;
        Ok(value)
    }

    /// Reads `len` objects.
    fn read_n<T: IntoBytes + FromBytes + Immutable + KnownLayout + Copy>(
        &mut self,
        len: usize,
    ) -> Result<Vec<T>, AccessError> {
        let mut value = vec![FromZeros::new_zeroed(); len];
        self.read(value.as_mut_bytes())?;
        Ok(value)
    }

    /// Reads everything that remains.
    fn read_all(&mut self) -> Result<Vec<u8>, AccessError> {
        let mut value = vec![0; self.len()];
        self.read(&mut value)?;
        Ok(value)
    }
}

/// A cursor for writing to a range of memory.
pub trait MemoryWrite {
    /// Writes `data` and advances.
    fn write(&mut self, data: &[u8]) -> Result<(), AccessError>;
    /// Writes `len` zero bytes and advances.
    fn zero(&mut self, len: usize) -> Result<(), AccessError> {
        self.fill(0, len)
    }
    /// Writes `len` copies of `val` and advances.
    fn fill(&mut self, val: u8, len: usize) -> Result<(), AccessError>;
    /// Returns the number of bytes remaining.
    fn len(&self) -> usize;
}

impl MemoryRead for &'_ [u8] {
    fn read(&mut self, data: &mut [u8]) -> Result<&mut Self, AccessError> {
        if self.len() < data.len() {
            return Err(AccessError::OutOfRange(self.len(), data.len()));
        }
        let (source, rest) = self.split_at(data.len());
        data.copy_from_slice(source);
        *self = rest;
        Ok(self)
    }

    fn skip(&mut self, len: usize) -> Result<&mut Self, AccessError> {
        if self.len() < len {
            return Err(AccessError::OutOfRange(self.len(), len));
        }
        *self = &self[len..];
        Ok(self)
    }

    fn len(&self) -> usize {
        <[u8]>::len(self)
    }
}

impl MemoryWrite for &mut [u8] {
    fn write(&mut self, data: &[u8]) -> Result<(), AccessError> {
        if self.len() < data.len() {
            return Err(AccessError::OutOfRange(self.len(), data.len()));
        }
        let (dest, rest) = std::mem::take(self).split_at_mut(data.len());
        dest.copy_from_slice(data);
        *self = rest;
        Ok(())
    }

    fn fill(&mut self, val: u8, len: usize) -> Result<(), AccessError> {
        if self.len() < len {
            return Err(AccessError::OutOfRange(self.len(), len));
        }
        let (dest, rest) = std::mem::take(self).split_at_mut(len);
        dest.fill(val);
        *self = rest;
        Ok(())
    }

    fn len(&self) -> usize {
        <[u8]>::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_access() {
        let mem = GuestMemory::new("test", 4);
        mem.write_at(0x1003, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
        let mut buf = [0; 9];
        mem.read_at(0x1002, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7, 0]);
        mem.fill_at(0x1005, 0xaa, 3).unwrap();
        mem.read_at(0x1002, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 0xaa, 0xaa, 0xaa, 6, 7, 0]);
        assert_eq!(mem.read_plain::<u16>(0x1003).unwrap(), 0x0201);
    }

    #[test]
    fn out_of_range() {
        let mem = GuestMemory::new("test", 2);
        assert!(matches!(
            mem.write_at(0x1ffe, &[0; 4]),
            Err(GuestMemoryError::OutOfRange { gpa: 0x1ffe, len: 4 })
        ));
        assert!(mem.read_plain::<u64>(u64::MAX - 3).is_err());
    }

    #[test]
    fn alias_reaches_private_page() {
        let alias = SharedAlias {
            shared_gpa_boundary: 1 << 40,
            canonicalization_mask: 0xffff_8000_0000_0000,
        };
        let mem = GuestMemory::with_alias("test", 4, alias);
        mem.write_plain(0x2000, &0x1234_5678u32).unwrap();
        let visible = 0x2000 + alias.shared_gpa_boundary;
        assert_eq!(mem.read_plain::<u32>(visible).unwrap(), 0x1234_5678);
        let va = visible | alias.canonicalization_mask;
        assert_eq!(mem.read_plain::<u32>(va).unwrap(), 0x1234_5678);
    }

    #[test]
    fn atomic_words_share_bytes() {
        let mem = GuestMemory::new("test", 2);
        let words = mem.atomic_words::<4>(0x1000).unwrap();
        words[1].store(0xdead_beef, Ordering::SeqCst);
        assert_eq!(mem.read_plain::<u32>(0x1004).unwrap(), 0xdead_beef);
        assert!(matches!(
            mem.atomic_words::<1>(0x1002),
            Err(GuestMemoryError::Unaligned(0x1002))
        ));
    }

    #[test]
    fn page_allocator_first_fit() {
        let mem = GuestMemory::new("test", 8);
        let a = mem.allocate_pages(2).unwrap();
        let b = mem.allocate_pages(3).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x3000);
        assert_eq!(mem.allocated_pages(), 5);
        assert!(matches!(
            mem.allocate_pages(3),
            Err(GuestMemoryError::OutOfMemory(3))
        ));
        mem.free_pages(a, 2);
        assert_eq!(mem.allocate_pages(1).unwrap(), 0x1000);
        mem.free_pages(0x1000, 1);
        mem.free_pages(b, 3);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free() {
        let mem = GuestMemory::new("test", 4);
        let a = mem.allocate_pages(1).unwrap();
        mem.free_pages(a, 1);
        mem.free_pages(a, 1);
    }

    #[test]
    fn slice_cursors() {
        let mut src: &[u8] = &[1, 2, 3, 4, 5];
        let v: u16 = src.read_plain().unwrap();
        assert_eq!(v, 0x0201);
        src.skip(1).unwrap();
        assert_eq!(src.read_all().unwrap(), [4, 5]);

        let mut buf = [0xffu8; 6];
        let mut dest = &mut buf[..];
        dest.write(&[1, 2]).unwrap();
        MemoryWrite::zero(&mut dest, 2).unwrap();
        assert!(dest.write(&[0; 3]).is_err());
        assert_eq!(buf, [1, 2, 0, 0, 0xff, 0xff]);
    }
}
