// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backing memory for rings.

use crate::PAGE_SIZE;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// The number of 32-bit words of the control page a ring uses.
pub const CONTROL_WORD_COUNT: usize = 32;

/// Memory holding one ring: its control words and its data.
///
/// Data accesses take offsets below twice the ring length and wrap once past
/// the end, so a packet that straddles the end of the ring reads and writes
/// as one contiguous run.
pub trait RingMem: Send {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT];

    fn read_at(&self, addr: usize, data: &mut [u8]);

    fn write_at(&self, addr: usize, data: &[u8]);

    /// The length of the ring data in bytes.
    fn len(&self) -> usize;
}

/// Reduces `addr` into the ring and returns it with the number of bytes of a
/// `len` byte access that fit before the end of the ring. The rest wrap to
/// offset zero.
fn wrap(ring_len: usize, addr: usize, len: usize) -> (usize, usize) {
    debug_assert!(addr + len <= ring_len * 2);
    let addr = if addr >= ring_len {
        addr - ring_len
    } else {
        addr
    };
    (addr, len.min(ring_len - addr))
}

/// Ring memory in a private heap allocation. Clones share the same ring, so
/// one clone can act as the host while another acts as the guest.
#[derive(Clone)]
pub struct FlatRingMem(Arc<FlatRing>);

struct FlatRing {
    control: [AtomicU32; CONTROL_WORD_COUNT],
    data: Box<[AtomicU8]>,
}

impl FlatRingMem {
    /// Returns a zeroed ring of `len` data bytes.
    pub fn new(len: usize) -> Self {
        Self(Arc::new(FlatRing {
            control: Default::default(),
            data: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }))
    }
}

impl Debug for FlatRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatRingMem")
            .field("len", &self.0.data.len())
            .finish()
    }
}

impl RingMem for FlatRingMem {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        &self.0.control
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        let (addr, head) = wrap(self.len(), addr, data.len());
        let wrapped = self.0.data[addr..addr + head]
            .iter()
            .chain(&self.0.data[..data.len() - head]);
        for (dst, src) in data.iter_mut().zip(wrapped) {
            *dst = src.load(Ordering::Relaxed);
        }
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        let (addr, head) = wrap(self.len(), addr, data.len());
        let wrapped = self.0.data[addr..addr + head]
            .iter()
            .chain(&self.0.data[..data.len() - head]);
        for (dst, src) in wrapped.zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
    }

    fn len(&self) -> usize {
        self.0.data.len()
    }
}

/// Ring memory in guest pages: a control page followed by the ring data.
///
/// The guest reaches the pages through their private addresses and the host
/// through their shared alias; either base works here.
#[derive(Clone)]
pub struct GuestRingMem {
    mem: GuestMemory,
    control_gpa: u64,
    data_gpa: u64,
    len: usize,
}

impl Debug for GuestRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRingMem")
            .field("control_gpa", &format_args!("{:#x}", self.control_gpa))
            .field("data_pages", &(self.len / PAGE_SIZE))
            .finish()
    }
}

impl GuestRingMem {
    /// Returns the ring whose control page is at `control_gpa`, with
    /// `data_pages` pages of data after it. Fails if any of those pages are
    /// outside `mem`.
    pub fn new(
        mem: GuestMemory,
        control_gpa: u64,
        data_pages: usize,
    ) -> Result<Self, GuestMemoryError> {
        let len = data_pages * PAGE_SIZE;
        let data_gpa = control_gpa + PAGE_SIZE as u64;
        mem.atomic_words::<CONTROL_WORD_COUNT>(control_gpa)?;
        mem.read_plain::<u8>(data_gpa + len as u64 - 1)?;
        Ok(Self {
            mem,
            control_gpa,
            data_gpa,
            len,
        })
    }
}

impl RingMem for GuestRingMem {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        self.mem
            .atomic_words(self.control_gpa)
            .expect("control page checked in new")
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        let (addr, head) = wrap(self.len, addr, data.len());
        let (first, second) = data.split_at_mut(head);
        for (gpa, buf) in [(self.data_gpa + addr as u64, first), (self.data_gpa, second)] {
            self.mem
                .read_at(gpa, buf)
                .expect("ring pages checked in new");
        }
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        let (addr, head) = wrap(self.len, addr, data.len());
        let (first, second) = data.split_at(head);
        for (gpa, buf) in [(self.data_gpa + addr as u64, first), (self.data_gpa, second)] {
            self.mem
                .write_at(gpa, buf)
                .expect("ring pages checked in new");
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}
