// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outgoing packets, owned so that they can wait in the send queue.

use crate::ExternalBuffer;
use crate::bounce::StagedBuffer;
use guestmem::MemoryWrite;
use vmbus_ring::OutgoingOffset;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PacketSize;
use vmbus_ring::PipeHeader;
use vmbus_ring::RingMem;
use vmbus_ring::WriteError;
use vmbus_ring::gparange::GpnList;
use vmbus_ring::gparange::MultiPagedRangeBuf;
use vmbus_ring::gparange::PagedRange;
use vmbus_ring::gparange::gpns_for_buffer;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The body of a pipe message that shares external memory with the host,
/// followed by the encoded ranges.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetupGpaRange {
    /// The name the host knows the ranges by.
    pub handle: u32,
    /// Nonzero if the host may write the ranges.
    pub is_writable: u8,
    /// Zero.
    pub reserved: [u8; 3],
    /// The number of ranges that follow.
    pub range_count: u32,
    /// Zero.
    pub reserved2: u32,
}

/// The body of a pipe message that revokes a range set up with
/// [`SetupGpaRange`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TeardownGpaRange {
    /// The handle passed at setup.
    pub handle: u32,
}

#[derive(Debug)]
pub(crate) enum PacketKind {
    InBand { completion_requested: bool },
    Completion,
    GpaDirect(MultiPagedRangeBuf<GpnList>),
}

/// A packet ready to be written to the outgoing ring.
#[derive(Debug)]
pub(crate) struct BufferedPacket {
    pub transaction_id: u64,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl BufferedPacket {
    /// The number of ring bytes the packet occupies.
    pub fn len(&self) -> usize {
        match &self.kind {
            PacketKind::InBand { .. } => PacketSize::in_band(self.payload.len()),
            PacketKind::Completion => PacketSize::completion(self.payload.len()),
            PacketKind::GpaDirect(ranges) => {
                let ranges: Vec<_> = ranges.iter().collect();
                PacketSize::gpa_direct(&ranges, self.payload.len())
            }
        }
    }

    /// Writes the packet at `ptrs`. The write is not visible to the host
    /// until the caller commits it.
    pub fn write<M: RingMem>(
        &self,
        ring: &OutgoingRing<M>,
        ptrs: &mut OutgoingOffset,
    ) -> Result<(), WriteError> {
        let ranges: Vec<PagedRange<'_>> = match &self.kind {
            PacketKind::GpaDirect(ranges) => ranges.iter().collect(),
            _ => Vec::new(),
        };
        let typ = match &self.kind {
            PacketKind::InBand {
                completion_requested: false,
            } => OutgoingPacketType::InBandNoCompletion,
            PacketKind::InBand {
                completion_requested: true,
            } => OutgoingPacketType::InBandWithCompletion,
            PacketKind::Completion => OutgoingPacketType::Completion,
            PacketKind::GpaDirect(_) => OutgoingPacketType::GpaDirect(&ranges),
        };
        let range = ring.write(
            ptrs,
            &OutgoingPacket {
                transaction_id: self.transaction_id,
                size: self.payload.len(),
                typ,
            },
        )?;
        range
            .writer(ring)
            .write(&self.payload)
            .map_err(|_| WriteError::Corrupt(vmbus_ring::Error::InvalidMessageLength))
    }
}

/// Prefixes `data` with a pipe header.
pub(crate) fn pipe_payload(packet_type: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(size_of::<PipeHeader>() + data.len());
    payload.extend_from_slice(
        PipeHeader {
            packet_type,
            len: data.len() as u32,
        }
        .as_bytes(),
    );
    payload.extend_from_slice(data);
    payload
}

/// Encodes the ranges describing `buffers` by their own page frames.
pub fn gpa_ranges(buffers: &[ExternalBuffer]) -> MultiPagedRangeBuf<GpnList> {
    let gpns: Vec<GpnList> = buffers
        .iter()
        .map(|buffer| gpns_for_buffer(buffer.gpa, buffer.len as usize))
        .collect();
    buffers
        .iter()
        .zip(&gpns)
        .map(|(buffer, gpns)| {
            PagedRange::new(buffer.page_offset(), buffer.len as usize, gpns)
                .expect("page list spans the buffer")
        })
        .collect()
}

/// Encodes the ranges describing staged buffers by the host addresses of
/// their bounce pages.
pub fn bounced_gpa_ranges(staged: &[StagedBuffer]) -> MultiPagedRangeBuf<GpnList> {
    let gpns: Vec<GpnList> = staged
        .iter()
        .map(|staged| {
            staged
                .pages
                .iter()
                .map(|page| page.host_address() / guestmem::PAGE_SIZE as u64)
                .collect()
        })
        .collect();
    staged
        .iter()
        .map(|staged| &staged.buffer)
        .zip(&gpns)
        .map(|(buffer, gpns)| {
            PagedRange::new(buffer.page_offset(), buffer.len as usize, gpns)
                .expect("one bounce page per buffer page")
        })
        .collect()
}
