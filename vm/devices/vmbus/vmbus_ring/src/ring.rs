// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two ends of a ring and the packet framing between them.
//!
//! A packet is a [`PacketDescriptor`], an optional extended header, the
//! payload padded to 8 bytes, and an 8-byte footer whose high half is the
//! packet's ring offset. Readers and writers batch: offsets advance privately
//! with each packet and only become visible to the peer on commit.

use crate::Error;
use crate::ReadError;
use crate::Ring;
use crate::RingMem;
use crate::RingRange;
use crate::WriteError;
use crate::gparange::GpaRange;
use crate::gparange::PagedRange;
use crate::protocol::*;
use smallvec::SmallVec;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const DESCRIPTOR_LEN: u32 = size_of::<PacketDescriptor>() as u32;
/// Transfer page and GPA direct headers are the same size.
const EXTENDED_LEN: u32 = DESCRIPTOR_LEN + size_of::<GpaDirectHeader>() as u32;
const FOOTER_LEN: u32 = 8;

/// What a received packet carries besides its payload. Extended variants
/// include the range holding the rest of their header.
#[derive(Debug, Copy, Clone)]
pub enum IncomingPacketType {
    InBand,
    Completion,
    /// The range count and the encoded range list.
    GpaDirect(u32, RingRange),
    /// The transfer page set ID, the range count and the ranges.
    TransferPages(u16, u32, RingRange),
    /// Passed through for the caller to reject or ignore.
    Unknown(u16),
}

#[derive(Debug)]
pub struct IncomingPacket {
    /// Set for completions and for packets that request one.
    pub transaction_id: Option<u64>,
    pub typ: IncomingPacketType,
    pub payload: RingRange,
}

#[derive(Debug)]
pub struct OutgoingPacket<'a> {
    pub transaction_id: u64,
    /// The payload length. The caller writes the payload into the range that
    /// [`OutgoingRing::write`] returns.
    pub size: usize,
    pub typ: OutgoingPacketType<'a>,
}

#[derive(Debug, Copy, Clone)]
pub enum OutgoingPacketType<'a> {
    InBandNoCompletion,
    InBandWithCompletion,
    Completion,
    /// Describes guest buffers outside the ring by page list.
    GpaDirect(&'a [PagedRange<'a>]),
    /// Describes regions of a transfer page set established earlier.
    TransferPages(u16, &'a [TransferPageRange]),
}

/// Ring bytes taken by each kind of packet, for sizing writes and for
/// [`OutgoingRing::set_pending_send_size`].
pub struct PacketSize(());

impl PacketSize {
    pub const fn in_band(payload_len: usize) -> usize {
        DESCRIPTOR_LEN as usize + payload_len.next_multiple_of(8) + FOOTER_LEN as usize
    }

    pub const fn completion(payload_len: usize) -> usize {
        Self::in_band(payload_len)
    }

    pub fn gpa_direct(ranges: &[PagedRange<'_>], payload_len: usize) -> usize {
        Self::in_band(payload_len) + gpa_direct_extension(ranges).len()
    }
}

/// Encodes the part of a GPA direct header that follows the descriptor.
fn gpa_direct_extension(ranges: &[PagedRange<'_>]) -> SmallVec<[u8; 64]> {
    let mut ext = SmallVec::new();
    let header = GpaDirectHeader {
        reserved: 0,
        range_count: ranges.len() as u32,
    };
    ext.extend_from_slice(header.as_bytes());
    for range in ranges {
        let prefix = GpaRange {
            len: range.len() as u32,
            offset: range.offset() as u32,
        };
        ext.extend_from_slice(prefix.as_bytes());
        ext.extend_from_slice(range.gpns().as_bytes());
    }
    ext
}

/// Offset arithmetic shared by both ends.
struct Shared<M> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Shared<M> {
    fn new(mem: M) -> Result<Self, Error> {
        let size = u32::try_from(mem.len()).map_err(|_| Error::InvalidRingMemory)?;
        if size == 0 || size as usize % PAGE_SIZE != 0 {
            return Err(Error::InvalidRingMemory);
        }
        Ok(Self { mem, size })
    }

    fn control(&self) -> Control<'_> {
        Control(self.mem.control())
    }

    /// Loads an offset the peer controls, rejecting values that could not
    /// have come from a well-behaved peer.
    fn load(&self, word: &AtomicU32, order: Ordering) -> Result<u32, Error> {
        let off = word.load(order);
        if off >= self.size || off % 8 != 0 {
            return Err(Error::InvalidRingPointer);
        }
        Ok(off)
    }

    fn advance(&self, off: u32, len: u32) -> u32 {
        debug_assert!(len <= self.size);
        (off + len) % self.size
    }

    /// Bytes written but not yet read.
    fn used(&self, inp: u32, outp: u32) -> u32 {
        (inp + self.size - outp) % self.size
    }

    /// Bytes a writer may still use. A full ring would look empty, so the
    /// last 8 bytes are never handed out.
    fn free(&self, inp: u32, outp: u32) -> u32 {
        self.size - self.used(inp, outp) - 8
    }
}

impl<M: RingMem> Debug for Shared<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("size", &self.size)
            .field("control", &self.control())
            .finish()
    }
}

/// The reading end of a ring.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem>(Shared<M>);

/// A reader's position within a batch of reads.
#[derive(Debug, Clone)]
pub struct IncomingOffset {
    cached_in: u32,
    committed_out: u32,
    next_out: u32,
}

impl<M: RingMem> Ring for IncomingRing<M> {
    type Memory = M;

    fn mem(&self) -> &M {
        &self.0.mem
    }
}

impl<M: RingMem> IncomingRing<M> {
    /// Takes the reading end of `mem`, with interrupts masked.
    pub fn new(mem: M) -> Result<Self, Error> {
        let ring = Shared::new(mem)?;
        ring.control().interrupt_mask().store(1, Ordering::Relaxed);
        Ok(Self(ring))
    }

    /// Masks or unmasks the peer's signal for the ring becoming non-empty.
    pub fn set_interrupt_mask(&self, masked: bool) {
        self.0
            .control()
            .interrupt_mask()
            .store(masked.into(), Ordering::SeqCst);
    }

    /// Starts a batch of reads.
    pub fn incoming(&self) -> Result<IncomingOffset, Error> {
        let control = self.0.control();
        let outp = self.0.load(control.outp(), Ordering::Relaxed)?;
        Ok(IncomingOffset {
            cached_in: self.0.load(control.inp(), Ordering::Relaxed)?,
            committed_out: outp,
            next_out: outp,
        })
    }

    /// Parses the packet at the batch position and moves past it. The packet's
    /// ranges stay valid until the batch is committed.
    pub fn read(&self, ptrs: &mut IncomingOffset) -> Result<IncomingPacket, ReadError> {
        let outp = ptrs.next_out;
        if ptrs.cached_in == outp {
            ptrs.cached_in = self.0.load(self.0.control().inp(), Ordering::Acquire)?;
            if ptrs.cached_in == outp {
                return Err(ReadError::Empty);
            }
        }
        let avail = self.0.used(ptrs.cached_in, outp);
        if avail < DESCRIPTOR_LEN + FOOTER_LEN {
            return Err(Error::InvalidDataAvailable.into());
        }
        let (len, packet) = self.parse(outp, avail - FOOTER_LEN)?;
        ptrs.next_out = self.0.advance(outp, len + FOOTER_LEN);
        Ok(packet)
    }

    fn parse(&self, off: u32, avail: u32) -> Result<(u32, IncomingPacket), Error> {
        let mut desc = PacketDescriptor::new_zeroed();
        self.0.mem.read_at(off as usize, desc.as_mut_bytes());
        let header_len = u32::from(desc.data_offset8) * 8;
        let len = u32::from(desc.length8) * 8;
        if header_len < DESCRIPTOR_LEN || header_len > len || len > avail {
            return Err(Error::InvalidDescriptorLengths);
        }
        if desc.flags & !PACKET_FLAG_COMPLETION_REQUESTED != 0 {
            return Err(Error::InvalidDescriptorFlags);
        }

        // Reads the fixed extended header into `header` and returns the range
        // list after it.
        let extended = |header: &mut [u8]| {
            if header_len < EXTENDED_LEN {
                return Err(Error::InvalidDescriptorLengths);
            }
            self.0.mem.read_at((off + DESCRIPTOR_LEN) as usize, header);
            Ok(RingRange {
                off: off + EXTENDED_LEN,
                size: header_len - EXTENDED_LEN,
            })
        };
        let typ = match desc.packet_type {
            PACKET_TYPE_IN_BAND => IncomingPacketType::InBand,
            PACKET_TYPE_COMPLETION => IncomingPacketType::Completion,
            PACKET_TYPE_GPA_DIRECT => {
                let mut header = GpaDirectHeader::new_zeroed();
                let ranges = extended(header.as_mut_bytes())?;
                if header.range_count == 0 {
                    return Err(Error::InvalidDescriptorGpaDirectRangeCount);
                }
                IncomingPacketType::GpaDirect(header.range_count, ranges)
            }
            PACKET_TYPE_TRANSFER_PAGES => {
                let mut header = TransferPageHeader::new_zeroed();
                let ranges = extended(header.as_mut_bytes())?;
                IncomingPacketType::TransferPages(
                    header.transfer_page_set_id,
                    header.range_count,
                    ranges,
                )
            }
            other => IncomingPacketType::Unknown(other),
        };

        let wants_completion = desc.flags & PACKET_FLAG_COMPLETION_REQUESTED != 0;
        let packet = IncomingPacket {
            transaction_id: (wants_completion || desc.packet_type == PACKET_TYPE_COMPLETION)
                .then_some(desc.transaction_id),
            typ,
            payload: RingRange {
                off: off + header_len,
                size: len - header_len,
            },
        };
        Ok((len, packet))
    }

    /// Releases the packets read in this batch to the writer. Returns true if
    /// the writer asked to be signaled once this much space was free.
    pub fn commit_read(&self, ptrs: &mut IncomingOffset) -> bool {
        let (before, after) = (ptrs.committed_out, ptrs.next_out);
        if before == after {
            return false;
        }
        ptrs.committed_out = after;
        let control = self.0.control();
        control.outp().store(after, Ordering::SeqCst);
        // Some writers ask for the ring size minus one to mean "empty", which
        // can never be free. Round down to the packet granularity.
        let wanted = control.pending_send_size().load(Ordering::SeqCst) & !7;
        if wanted == 0 {
            return false;
        }
        let Ok(inp) = self.0.load(control.inp(), Ordering::SeqCst) else {
            return false;
        };
        self.0.free(inp, before) < wanted && self.0.free(inp, after) >= wanted
    }
}

/// The writing end of a ring.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem>(Shared<M>);

/// A writer's position within a batch of writes.
#[derive(Debug, Clone)]
pub struct OutgoingOffset {
    cached_out: u32,
    committed_in: u32,
    next_in: u32,
}

impl<M: RingMem> Ring for OutgoingRing<M> {
    type Memory = M;

    fn mem(&self) -> &M {
        &self.0.mem
    }
}

impl<M: RingMem> OutgoingRing<M> {
    /// Takes the writing end of `mem`, advertising pending send size support.
    pub fn new(mem: M) -> Result<Self, Error> {
        let ring = Shared::new(mem)?;
        let control = ring.control();
        control
            .feature_bits()
            .store(FEATURE_SUPPORTS_PENDING_SEND_SIZE, Ordering::Relaxed);
        control.pending_send_size().store(0, Ordering::Relaxed);
        Ok(Self(ring))
    }

    /// The largest packet the ring could ever hold.
    pub fn maximum_packet_size(&self) -> usize {
        self.0.size as usize - 8
    }

    /// Asks the reader to signal once `len` bytes are free, or stops asking
    /// if `len` is zero.
    pub fn set_pending_send_size(&self, len: usize) -> Result<(), Error> {
        if len > self.maximum_packet_size() {
            return Err(Error::InvalidMessageLength);
        }
        self.0
            .control()
            .pending_send_size()
            .store(len.next_multiple_of(8) as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Starts a batch of writes.
    pub fn outgoing(&self) -> Result<OutgoingOffset, Error> {
        let control = self.0.control();
        let inp = self.0.load(control.inp(), Ordering::Relaxed)?;
        Ok(OutgoingOffset {
            cached_out: self.0.load(control.outp(), Ordering::Relaxed)?,
            committed_in: inp,
            next_in: inp,
        })
    }

    /// Frames a packet at the batch position and returns the range its
    /// payload goes in. Fails with `Full` and the packet's ring size if the
    /// reader has not freed enough space.
    pub fn write(
        &self,
        ptrs: &mut OutgoingOffset,
        packet: &OutgoingPacket<'_>,
    ) -> Result<RingRange, WriteError> {
        let (packet_type, flags, ext) = match packet.typ {
            OutgoingPacketType::InBandNoCompletion => (PACKET_TYPE_IN_BAND, 0, SmallVec::new()),
            OutgoingPacketType::InBandWithCompletion => (
                PACKET_TYPE_IN_BAND,
                PACKET_FLAG_COMPLETION_REQUESTED,
                SmallVec::new(),
            ),
            OutgoingPacketType::Completion => (PACKET_TYPE_COMPLETION, 0, SmallVec::new()),
            OutgoingPacketType::GpaDirect(ranges) => (
                PACKET_TYPE_GPA_DIRECT,
                PACKET_FLAG_COMPLETION_REQUESTED,
                gpa_direct_extension(ranges),
            ),
            OutgoingPacketType::TransferPages(set_id, ranges) => {
                let mut ext: SmallVec<[u8; 64]> = SmallVec::new();
                let header = TransferPageHeader {
                    transfer_page_set_id: set_id,
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                ext.extend_from_slice(header.as_bytes());
                ext.extend_from_slice(ranges.as_bytes());
                (
                    PACKET_TYPE_TRANSFER_PAGES,
                    PACKET_FLAG_COMPLETION_REQUESTED,
                    ext,
                )
            }
        };

        let header_len = DESCRIPTOR_LEN as usize + ext.len();
        let len = (header_len + packet.size).next_multiple_of(8);
        let total = len + FOOTER_LEN as usize;
        if total >= self.maximum_packet_size() {
            return Err(Error::InvalidMessageLength.into());
        }
        let total = total as u32;
        let inp = ptrs.next_in;
        if self.0.free(inp, ptrs.cached_out) < total {
            ptrs.cached_out = self.0.load(self.0.control().outp(), Ordering::Relaxed)?;
            if self.0.free(inp, ptrs.cached_out) < total {
                return Err(WriteError::Full(total as usize));
            }
        }

        let desc = PacketDescriptor {
            packet_type,
            data_offset8: (header_len / 8) as u16,
            length8: (len / 8) as u16,
            flags,
            transaction_id: packet.transaction_id,
        };
        let mut header: SmallVec<[u8; 80]> = SmallVec::new();
        header.extend_from_slice(desc.as_bytes());
        header.extend_from_slice(&ext);
        self.0.mem.write_at(inp as usize, &header);

        // Zeroed padding, then the footer.
        let pad = len - header_len - packet.size;
        let mut tail = [0; 16];
        tail[pad..pad + 8].copy_from_slice(&(u64::from(inp) << 32).to_le_bytes());
        self.0
            .mem
            .write_at(inp as usize + header_len + packet.size, &tail[..pad + 8]);

        ptrs.next_in = self.0.advance(inp, total);
        Ok(RingRange {
            off: inp + header_len as u32,
            size: packet.size as u32,
        })
    }

    /// Publishes the packets written in this batch. Returns true if the reader
    /// should be signaled: it had drained the ring and has interrupts unmasked.
    pub fn commit_write(&self, ptrs: &mut OutgoingOffset) -> bool {
        let (before, after) = (ptrs.committed_in, ptrs.next_in);
        if before == after {
            return false;
        }
        ptrs.committed_in = after;
        let control = self.0.control();
        control.inp().store(after, Ordering::SeqCst);
        control.interrupt_mask().load(Ordering::SeqCst) == 0
            && control.outp().load(Ordering::SeqCst) == before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlatRingMem;
    use crate::gparange::MultiPagedRangeBuf;
    use crate::gparange::gpns_for_buffer;
    use guestmem::MemoryRead;
    use guestmem::MemoryWrite;

    fn rings(len: usize) -> (FlatRingMem, OutgoingRing<FlatRingMem>, IncomingRing<FlatRingMem>) {
        let mem = FlatRingMem::new(len);
        let host = IncomingRing::new(mem.clone()).unwrap();
        let guest = OutgoingRing::new(mem.clone()).unwrap();
        (mem, guest, host)
    }

    /// Sends one in-band packet. `None` if the ring is full, otherwise
    /// whether the reader must be signaled.
    fn send(ring: &OutgoingRing<FlatRingMem>, payload: &[u8]) -> Option<bool> {
        let mut ptrs = ring.outgoing().unwrap();
        let packet = OutgoingPacket {
            transaction_id: 0,
            size: payload.len(),
            typ: OutgoingPacketType::InBandNoCompletion,
        };
        match ring.write(&mut ptrs, &packet) {
            Ok(range) => {
                range.writer(ring).write(payload).unwrap();
                Some(ring.commit_write(&mut ptrs))
            }
            Err(WriteError::Full(_)) => None,
            Err(err) => panic!("{err}"),
        }
    }

    /// Receives one packet, returning its payload and whether the writer
    /// must be signaled.
    fn receive(ring: &IncomingRing<FlatRingMem>) -> (Vec<u8>, bool) {
        let mut ptrs = ring.incoming().unwrap();
        let packet = ring.read(&mut ptrs).unwrap();
        let payload = packet.payload.reader(ring).read_all().unwrap();
        (payload, ring.commit_read(&mut ptrs))
    }

    #[test]
    fn empty_to_non_empty_signals_when_unmasked() {
        let (_, guest, host) = rings(16384);
        assert_eq!(send(&guest, b"masked"), Some(false));
        assert_eq!(receive(&host), (b"masked\0\0".to_vec(), false));

        host.set_interrupt_mask(false);
        assert_eq!(send(&guest, &[1; 8]), Some(true));
        // Already non-empty.
        assert_eq!(send(&guest, &[2; 8]), Some(false));
        assert_eq!(receive(&host), (vec![1; 8], false));
        assert_eq!(receive(&host), (vec![2; 8], false));
    }

    #[test]
    fn batched_writes_signal_once() {
        let (_, guest, host) = rings(16384);
        host.set_interrupt_mask(false);
        let mut ptrs = guest.outgoing().unwrap();
        for i in 0..3u8 {
            let packet = OutgoingPacket {
                transaction_id: i.into(),
                size: 8,
                typ: OutgoingPacketType::InBandWithCompletion,
            };
            let range = guest.write(&mut ptrs, &packet).unwrap();
            range.writer(&guest).write(&[i; 8]).unwrap();
        }
        let mut peek = host.incoming().unwrap();
        assert!(matches!(host.read(&mut peek), Err(ReadError::Empty)));
        assert!(guest.commit_write(&mut ptrs));
        assert!(!guest.commit_write(&mut ptrs));

        let mut ptrs = host.incoming().unwrap();
        for i in 0..3u64 {
            assert_eq!(host.read(&mut ptrs).unwrap().transaction_id, Some(i));
        }
        assert!(matches!(host.read(&mut ptrs), Err(ReadError::Empty)));
    }

    #[test]
    fn reader_signals_when_pending_space_frees() {
        let (_, guest, host) = rings(16384);
        for i in 1..=4 {
            send(&guest, &[i; 4000]).unwrap();
        }
        assert_eq!(send(&guest, &[5; 4000]), None);
        assert!(!receive(&host).1);

        send(&guest, &[5; 4000]).unwrap();
        assert_eq!(send(&guest, &[6; 4000]), None);
        let two_packets = PacketSize::in_band(4000) * 2;
        guest.set_pending_send_size(two_packets).unwrap();
        assert!(!receive(&host).1);
        assert!(receive(&host).1);
        assert!(!receive(&host).1);
        assert!(guest.set_pending_send_size(16384).is_err());
    }

    #[test]
    fn packets_wrap_around_the_end() {
        let (mem, guest, host) = rings(4096);
        // 1032-byte packets, so the fourth straddles the end.
        for round in 0..8u8 {
            send(&guest, &[round; 1001]).unwrap();
            assert_eq!(receive(&host).0[..1001], [round; 1001]);
        }
        let inp = Control(mem.control()).inp().load(Ordering::SeqCst);
        assert_eq!(inp as usize, PacketSize::in_band(1001) * 8 % 4096);
    }

    #[test]
    fn padding_and_footer() {
        let (mem, guest, _) = rings(4096);
        mem.write_at(0, &[0xcc; 64]);
        send(&guest, &[1, 2, 3]).unwrap();
        send(&guest, &[4]).unwrap();
        let mut raw = [0; 64];
        mem.read_at(0, &mut raw);
        assert_eq!(raw[16..24], [1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(raw[24..32], [0; 8]);
        assert_eq!(raw[48..56], [4, 0, 0, 0, 0, 0, 0, 0]);
        let footer = u64::from_le_bytes(raw[56..].try_into().unwrap());
        assert_eq!(footer, 32 << 32);
    }

    #[test]
    fn gpa_direct_ranges_follow_the_descriptor() {
        let (_, guest, host) = rings(16384);
        let a = gpns_for_buffer(0x5010, 0x2000);
        let b = gpns_for_buffer(0x9000, 0x80);
        let ranges = [
            PagedRange::new(0x10, 0x2000, &a).unwrap(),
            PagedRange::new(0, 0x80, &b).unwrap(),
        ];
        let mut ptrs = guest.outgoing().unwrap();
        let packet = OutgoingPacket {
            transaction_id: 7,
            size: 4,
            typ: OutgoingPacketType::GpaDirect(&ranges),
        };
        let range = guest.write(&mut ptrs, &packet).unwrap();
        range.writer(&guest).write(&[9; 4]).unwrap();
        guest.commit_write(&mut ptrs);
        assert_eq!(ptrs.next_in as usize, PacketSize::gpa_direct(&ranges, 4));

        let mut ptrs = host.incoming().unwrap();
        let packet = host.read(&mut ptrs).unwrap();
        assert_eq!(packet.transaction_id, Some(7));
        let IncomingPacketType::GpaDirect(count, header) = packet.typ else {
            panic!("{:?}", packet.typ);
        };
        let words: Vec<u64> = header.reader(&host).read_n(header.len() / 8).unwrap();
        let parsed = MultiPagedRangeBuf::new(count as usize, &words[..]).unwrap();
        assert_eq!(parsed.iter().collect::<Vec<_>>(), ranges);
        assert_eq!(packet.payload.reader(&host).read_all().unwrap(), [9; 4]);
    }

    #[test]
    fn transfer_pages_carry_their_ranges() {
        let (_, guest, host) = rings(16384);
        let ranges = [
            TransferPageRange {
                byte_count: 100,
                byte_offset: 0,
            },
            TransferPageRange {
                byte_count: 20,
                byte_offset: 4096,
            },
        ];
        let mut ptrs = guest.outgoing().unwrap();
        let packet = OutgoingPacket {
            transaction_id: 3,
            size: 0,
            typ: OutgoingPacketType::TransferPages(0x51, &ranges),
        };
        guest.write(&mut ptrs, &packet).unwrap();
        guest.commit_write(&mut ptrs);

        let mut ptrs = host.incoming().unwrap();
        let packet = host.read(&mut ptrs).unwrap();
        let IncomingPacketType::TransferPages(set_id, count, header) = packet.typ else {
            panic!("{:?}", packet.typ);
        };
        assert_eq!((set_id, count), (0x51, 2));
        let read: Vec<TransferPageRange> = header.reader(&host).read_n(2).unwrap();
        assert_eq!(read, ranges);
        assert!(packet.payload.is_empty());
    }

    fn raw_descriptor(mem: &FlatRingMem, desc: PacketDescriptor, inp: u32) {
        mem.write_at(0, desc.as_bytes());
        Control(mem.control()).inp().store(inp, Ordering::SeqCst);
    }

    #[test]
    fn unknown_types_pass_through() {
        let (mem, _, host) = rings(4096);
        let desc = PacketDescriptor {
            packet_type: 0x55,
            data_offset8: 2,
            length8: 2,
            flags: 0,
            transaction_id: 0,
        };
        raw_descriptor(&mem, desc, 24);
        let mut ptrs = host.incoming().unwrap();
        let packet = host.read(&mut ptrs).unwrap();
        assert!(matches!(packet.typ, IncomingPacketType::Unknown(0x55)));
        assert!(packet.payload.is_empty());
        host.commit_read(&mut ptrs);
        assert_eq!(Control(mem.control()).outp().load(Ordering::SeqCst), 24);
    }

    #[test]
    fn malformed_descriptors_rejected() {
        let base = PacketDescriptor {
            packet_type: PACKET_TYPE_IN_BAND,
            data_offset8: 2,
            length8: 4,
            flags: 0,
            transaction_id: 0,
        };
        let cases = [
            (PacketDescriptor { data_offset8: 1, ..base }, 40),
            (PacketDescriptor { data_offset8: 5, ..base }, 40),
            (PacketDescriptor { length8: 5, ..base }, 40),
            (PacketDescriptor { flags: 2, ..base }, 40),
            (
                PacketDescriptor {
                    packet_type: PACKET_TYPE_GPA_DIRECT,
                    ..base
                },
                40,
            ),
        ];
        for (desc, inp) in cases {
            let (mem, _, host) = rings(4096);
            raw_descriptor(&mem, desc, inp);
            let mut ptrs = host.incoming().unwrap();
            assert!(
                matches!(host.read(&mut ptrs), Err(ReadError::Corrupt(_))),
                "{desc:?}"
            );
        }

        let (mem, _, host) = rings(4096);
        raw_descriptor(&mem, base, 12);
        assert!(matches!(host.incoming(), Err(Error::InvalidRingPointer)));
    }

    #[test]
    fn ring_size_must_be_whole_pages() {
        assert!(matches!(
            IncomingRing::new(FlatRingMem::new(4000)),
            Err(Error::InvalidRingMemory)
        ));
        assert!(matches!(
            OutgoingRing::new(FlatRingMem::new(0)),
            Err(Error::InvalidRingMemory)
        ));
    }
}
