// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VMBus ring buffers.
//!
//! Each channel has two rings in shared memory, one per direction. A ring is
//! a control page holding the read and write offsets, followed by any whole
//! number of data pages. Variable-sized packets, each a multiple of 8 bytes,
//! are written at the write offset and consumed at the read offset.
//!
//! The guest and the test host both speak through these types. Neither side
//! trusts the other's offsets or descriptors, so everything read from the
//! ring is validated before use.

#![forbid(unsafe_code)]

pub mod gparange;
mod mem;
pub mod protocol;
mod range;
mod ring;

pub use mem::CONTROL_WORD_COUNT;
pub use mem::FlatRingMem;
pub use mem::GuestRingMem;
pub use mem::RingMem;
pub use protocol::PAGE_SIZE;
pub use protocol::PIPE_PACKET_TYPE_DATA;
pub use protocol::PIPE_PACKET_TYPE_PARTIAL;
pub use protocol::PIPE_PACKET_TYPE_SETUP_GPA_DIRECT;
pub use protocol::PIPE_PACKET_TYPE_TEARDOWN_GPA_DIRECT;
pub use protocol::PipeHeader;
pub use protocol::TransferPageRange;
pub use range::Ring;
pub use range::RingCursor;
pub use range::RingRange;
pub use ring::IncomingOffset;
pub use ring::IncomingPacket;
pub use ring::IncomingPacketType;
pub use ring::IncomingRing;
pub use ring::OutgoingOffset;
pub use ring::OutgoingPacket;
pub use ring::OutgoingPacketType;
pub use ring::OutgoingRing;
pub use ring::PacketSize;

use thiserror::Error;

/// The ring's shared state is inconsistent, or a packet is malformed.
#[derive(Copy, Clone, Debug, Error)]
pub enum Error {
    #[error("ring offset is out of range or unaligned")]
    InvalidRingPointer,
    #[error("packet does not fit in the ring")]
    InvalidMessageLength,
    #[error("less than one packet is available")]
    InvalidDataAvailable,
    #[error("ring memory is not a whole number of pages")]
    InvalidRingMemory,
    #[error("packet descriptor lengths are inconsistent")]
    InvalidDescriptorLengths,
    #[error("packet descriptor has unknown flags")]
    InvalidDescriptorFlags,
    #[error("gpa direct packet has no ranges")]
    InvalidDescriptorGpaDirectRangeCount,
}

#[derive(Copy, Clone, Debug, Error)]
pub enum ReadError {
    #[error("ring is empty")]
    Empty,
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error)]
pub enum WriteError {
    /// Holds the number of free bytes the packet needs.
    #[error("ring is full, {0} bytes needed")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}
