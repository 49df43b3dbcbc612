// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host ends of an open channel's ring buffers.

use crate::HostGpadl;
use crate::TestHost;
use anyhow::Context;
use guestmem::GuestMemory;
use guestmem::MemoryRead;
use guestmem::MemoryWrite;
use guestmem::PAGE_SIZE;
use parking_lot::Mutex;
use std::sync::Weak;
use std::sync::atomic::Ordering;
use vmbus_ring::GuestRingMem;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PIPE_PACKET_TYPE_DATA;
use vmbus_ring::PipeHeader;
use vmbus_ring::ReadError;
use vmbus_ring::Ring;
use vmbus_ring::RingMem;
use vmbus_ring::TransferPageRange;
use vmbus_ring::gparange::GpnList;
use vmbus_ring::gparange::MultiPagedRangeBuf;
use vmbus_ring::gparange::PagedRange;
use vmbus_ring::protocol::Control;
use vmbus_ring::protocol::PacketDescriptor;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// The kind of a packet read from the guest.
#[derive(Debug)]
pub enum HostPacketKind {
    InBand,
    Completion,
    GpaDirect(MultiPagedRangeBuf<GpnList>),
    TransferPages(u16, Vec<TransferPageRange>),
    Unknown(u16),
}

/// A packet the guest sent.
#[derive(Debug)]
pub struct HostPacket {
    pub transaction_id: Option<u64>,
    pub kind: HostPacketKind,
    pub payload: Vec<u8>,
}

impl HostPacket {
    /// Splits a pipe packet into its pipe type and data.
    pub fn pipe_data(&self) -> anyhow::Result<(u32, &[u8])> {
        let (header, data) =
            PipeHeader::read_from_prefix(&self.payload)
                .map_err(|_| anyhow::anyhow!("short pipe packet"))?;
        let data = data
            .get(..header.len as usize)
            .context("pipe length exceeds packet")?;
        Ok((header.packet_type, data))
    }
}

struct Rings {
    /// Reads what the guest sends.
    incoming: IncomingRing<GuestRingMem>,
    /// Writes what the guest receives.
    outgoing: OutgoingRing<GuestRingMem>,
}

/// The host side of an open channel.
pub struct HostChannel {
    channel_id: u32,
    host: Weak<TestHost>,
    mem: GuestMemory,
    rings: Mutex<Rings>,
}

impl HostChannel {
    pub(crate) fn new(
        channel_id: u32,
        host: Weak<TestHost>,
        mem: GuestMemory,
        gpadl: &HostGpadl,
        downstream_offset: u32,
    ) -> anyhow::Result<Self> {
        let total = gpadl.pfns.len();
        let offset = downstream_offset as usize;
        anyhow::ensure!(gpadl.range.byte_offset == 0, "unaligned ring gpadl");
        anyhow::ensure!(
            gpadl.pfns.windows(2).all(|w| w[1] == w[0] + 1),
            "ring gpadl is not contiguous"
        );
        anyhow::ensure!(
            offset >= 2 && offset + 2 <= total,
            "invalid downstream offset {offset} for {total} pages"
        );
        let base = gpadl.base();
        let incoming = IncomingRing::new(GuestRingMem::new(mem.clone(), base, offset - 1)?)?;
        incoming.set_interrupt_mask(false);
        let outgoing = OutgoingRing::new(GuestRingMem::new(
            mem.clone(),
            base + (offset * PAGE_SIZE) as u64,
            total - offset - 1,
        )?)?;
        Ok(Self {
            channel_id,
            host,
            mem,
            rings: Mutex::new(Rings { incoming, outgoing }),
        })
    }

    /// The channel's ID.
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    fn signal_guest(&self) {
        if let Some(host) = self.host.upgrade() {
            host.signal_guest(self.channel_id);
        }
    }

    /// Reads the next packet the guest sent, signaling the guest if it was
    /// waiting for ring space.
    pub fn read_packet(&self) -> anyhow::Result<Option<HostPacket>> {
        let (packet, signal) = {
            let rings = self.rings.lock();
            let ring = &rings.incoming;
            let mut incoming = ring.incoming()?;
            let packet = match ring.read(&mut incoming) {
                Ok(packet) => packet,
                Err(ReadError::Empty) => return Ok(None),
                Err(ReadError::Corrupt(err)) => return Err(err.into()),
            };
            let kind = match packet.typ {
                IncomingPacketType::InBand => HostPacketKind::InBand,
                IncomingPacketType::Completion => HostPacketKind::Completion,
                IncomingPacketType::GpaDirect(count, header) => {
                    let buf: GpnList = header
                        .reader(ring)
                        .read_n::<u64>(header.len() / 8)?
                        .into_iter()
                        .collect();
                    HostPacketKind::GpaDirect(MultiPagedRangeBuf::new(count as usize, buf)?)
                }
                IncomingPacketType::TransferPages(id, count, header) => {
                    HostPacketKind::TransferPages(id, header.reader(ring).read_n(count as usize)?)
                }
                IncomingPacketType::Unknown(typ) => HostPacketKind::Unknown(typ),
            };
            let payload = packet.payload.reader(ring).read_all()?;
            let signal = ring.commit_read(&mut incoming);
            (
                HostPacket {
                    transaction_id: packet.transaction_id,
                    kind,
                    payload,
                },
                signal,
            )
        };
        if signal {
            self.signal_guest();
        }
        Ok(Some(packet))
    }

    /// Reads every packet the guest sent.
    pub fn read_all(&self) -> anyhow::Result<Vec<HostPacket>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.read_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Writes a packet for the guest, signaling it if its ring was empty.
    pub fn write_packet(&self, packet: &OutgoingPacket<'_>, payload: &[u8]) -> anyhow::Result<()> {
        let signal = {
            let rings = self.rings.lock();
            let ring = &rings.outgoing;
            let mut outgoing = ring.outgoing()?;
            let range = ring.write(&mut outgoing, packet)?;
            range.writer(ring).write(payload)?;
            ring.commit_write(&mut outgoing)
        };
        if signal {
            self.signal_guest();
        }
        Ok(())
    }

    /// Sends an in-band packet.
    pub fn send_in_band(&self, transaction_id: Option<u64>, payload: &[u8]) -> anyhow::Result<()> {
        self.write_packet(
            &OutgoingPacket {
                transaction_id: transaction_id.unwrap_or(0),
                size: payload.len(),
                typ: if transaction_id.is_some() {
                    OutgoingPacketType::InBandWithCompletion
                } else {
                    OutgoingPacketType::InBandNoCompletion
                },
            },
            payload,
        )
    }

    /// Sends a completion for `transaction_id`.
    pub fn send_completion(&self, transaction_id: u64, payload: &[u8]) -> anyhow::Result<()> {
        self.write_packet(
            &OutgoingPacket {
                transaction_id,
                size: payload.len(),
                typ: OutgoingPacketType::Completion,
            },
            payload,
        )
    }

    /// Sends a pipe data packet.
    pub fn send_pipe(&self, data: &[u8]) -> anyhow::Result<()> {
        self.send_pipe_raw(PIPE_PACKET_TYPE_DATA, data.len() as u32, data)
    }

    /// Sends a pipe packet with an arbitrary header.
    pub fn send_pipe_raw(&self, packet_type: u32, len: u32, data: &[u8]) -> anyhow::Result<()> {
        let mut payload = PipeHeader { packet_type, len }.as_bytes().to_vec();
        payload.extend_from_slice(data);
        self.send_in_band(None, &payload)
    }

    /// Sends a transfer page packet.
    pub fn send_transfer_pages(
        &self,
        transaction_id: u64,
        set_id: u16,
        ranges: &[TransferPageRange],
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.write_packet(
            &OutgoingPacket {
                transaction_id,
                size: payload.len(),
                typ: OutgoingPacketType::TransferPages(set_id, ranges),
            },
            payload,
        )
    }

    /// Writes a packet with an arbitrary descriptor, followed by `body`, and
    /// signals the guest. The packet must fit without wrapping.
    pub fn send_raw(&self, descriptor: PacketDescriptor, body: &[u8]) -> anyhow::Result<()> {
        {
            let rings = self.rings.lock();
            let mem = rings.outgoing.mem();
            let control = Control(mem.control());
            let inp = control.inp().load(Ordering::SeqCst) as usize;
            let mut packet = descriptor.as_bytes().to_vec();
            packet.extend_from_slice(body);
            packet.resize(packet.len().next_multiple_of(8), 0);
            packet.extend_from_slice(&((inp as u64) << 32).to_le_bytes());
            anyhow::ensure!(inp + packet.len() < mem.len(), "raw packet wraps");
            mem.write_at(inp, &packet);
            control
                .inp()
                .store((inp + packet.len()) as u32, Ordering::SeqCst);
        }
        self.signal_guest();
        Ok(())
    }

    /// Returns whether the guest has unread packets.
    pub fn guest_has_pending(&self) -> bool {
        let rings = self.rings.lock();
        let control = Control(rings.outgoing.mem().control());
        control.inp().load(Ordering::SeqCst) != control.outp().load(Ordering::SeqCst)
    }

    /// Reads `range` from guest memory through the host-visible addresses.
    pub fn read_range(&self, range: &PagedRange<'_>) -> anyhow::Result<Vec<u8>> {
        let mut data = vec![0; range.len()];
        let mut offset = range.offset();
        let mut done = 0;
        for &gpn in range.gpns() {
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            self.mem
                .read_at(gpn * PAGE_SIZE as u64 + offset as u64, &mut data[done..done + len])?;
            done += len;
            offset = 0;
        }
        Ok(data)
    }

    /// Writes `data` to the start of `range` through the host-visible
    /// addresses.
    pub fn write_range(&self, range: &PagedRange<'_>, data: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(data.len() <= range.len(), "data exceeds range");
        let mut offset = range.offset();
        let mut done = 0;
        for &gpn in range.gpns() {
            if done == data.len() {
                break;
            }
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            self.mem
                .write_at(gpn * PAGE_SIZE as u64 + offset as u64, &data[done..done + len])?;
            done += len;
            offset = 0;
        }
        Ok(())
    }
}
