// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire layouts shared with the host: the control page, packet descriptors
//! and the pipe header carried inside in-band payloads.

use crate::CONTROL_WORD_COUNT;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Ring data is sized in pages, and each ring is preceded by one control page.
pub const PAGE_SIZE: usize = 4096;

/// The first 16 bytes of every packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PacketDescriptor {
    pub packet_type: u16,
    /// Offset of the payload from the start of the packet, in 8-byte units.
    pub data_offset8: u16,
    /// Length of the packet without its footer, in 8-byte units.
    pub length8: u16,
    pub flags: u16,
    pub transaction_id: u64,
}

pub const PACKET_TYPE_IN_BAND: u16 = 6;
pub const PACKET_TYPE_TRANSFER_PAGES: u16 = 7;
pub const PACKET_TYPE_GPA_DIRECT: u16 = 9;
pub const PACKET_TYPE_COMPLETION: u16 = 11;

/// The sender wants a completion carrying the same transaction ID.
pub const PACKET_FLAG_COMPLETION_REQUESTED: u16 = 1;

/// Set in `feature_bits` by a writer that honors `pending_send_size`.
pub const FEATURE_SUPPORTS_PENDING_SEND_SIZE: u32 = 1;

/// Follows the descriptor of a transfer page packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TransferPageHeader {
    pub transfer_page_set_id: u16,
    /// Not validated; some hosts leave garbage here.
    pub reserved: u16,
    pub range_count: u32,
}

/// One region of a transfer page set.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TransferPageRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

/// Follows the descriptor of a GPA direct packet, ahead of the range list.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaDirectHeader {
    /// Not validated; some hosts leave garbage here.
    pub reserved: u32,
    pub range_count: u32,
}

const INP: usize = 0;
const OUTP: usize = 1;
const INTERRUPT_MASK: usize = 2;
const PENDING_SEND_SIZE: usize = 3;
const FEATURE_BITS: usize = 16;

/// Named access to the words of a control page.
///
/// `inp` is owned by the writer and `outp` by the reader. Both are byte
/// offsets into the ring data and equal when the ring is empty.
pub struct Control<'a>(pub &'a [AtomicU32; CONTROL_WORD_COUNT]);

impl<'a> Control<'a> {
    /// Where the writer will place its next packet.
    pub fn inp(&self) -> &'a AtomicU32 {
        &self.0[INP]
    }

    /// Where the reader will take its next packet.
    pub fn outp(&self) -> &'a AtomicU32 {
        &self.0[OUTP]
    }

    /// Nonzero while the reader does not want empty-to-non-empty signals.
    pub fn interrupt_mask(&self) -> &'a AtomicU32 {
        &self.0[INTERRUPT_MASK]
    }

    /// Free bytes the writer is waiting for, or zero.
    pub fn pending_send_size(&self) -> &'a AtomicU32 {
        &self.0[PENDING_SEND_SIZE]
    }

    pub fn feature_bits(&self) -> &'a AtomicU32 {
        &self.0[FEATURE_BITS]
    }
}

impl Debug for Control<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let load = |word: &AtomicU32| word.load(Ordering::Relaxed);
        f.debug_struct("Control")
            .field("inp", &load(self.inp()))
            .field("outp", &load(self.outp()))
            .field("interrupt_mask", &load(self.interrupt_mask()))
            .field("pending_send_size", &load(self.pending_send_size()))
            .field("feature_bits", &load(self.feature_bits()))
            .finish()
    }
}

/// Pipe mode channels prefix every in-band payload with this header so that
/// messages need not be a multiple of 8 bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PipeHeader {
    pub packet_type: u32,
    pub len: u32,
}

/// Plain message data.
pub const PIPE_PACKET_TYPE_DATA: u32 = 1;
/// Data the reader has already partly consumed; the high 16 bits of `len`
/// count the consumed bytes. Only a reader writes this back into its own ring,
/// so a peer sending it is misbehaving.
pub const PIPE_PACKET_TYPE_PARTIAL: u32 = 2;
pub const PIPE_PACKET_TYPE_SETUP_GPA_DIRECT: u32 = 3;
pub const PIPE_PACKET_TYPE_TEARDOWN_GPA_DIRECT: u32 = 4;
