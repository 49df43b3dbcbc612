// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! EMCL, the packet engine layered on one VMBus channel.
//!
//! An [`Emcl`] owns the ring buffers of an open channel. It writes the
//! packets of a device client to the outgoing ring, queueing those that do
//! not fit until the host makes room, tracks the transactions awaiting a
//! completion, and hands what the host sends to the client's receive
//! callback.
//!
//! On an isolated VM the host cannot reach private memory, so external
//! buffers are staged through a [`bounce::BouncePool`] unless the channel
//! uses confidential external memory.

#![forbid(unsafe_code)]

pub mod bounce;
mod packet;

pub use packet::SetupGpaRange;
pub use packet::TeardownGpaRange;
pub use packet::gpa_ranges;
pub use vmbus_root::Gpadl;

use bitfield_struct::bitfield;
use bounce::BouncePool;
use bounce::StagedBuffer;
use efi_hv::HostVisibility;
use guestmem::GuestMemoryError;
use guestmem::PAGE_SIZE;
use guestmem::MemoryRead;
use packet::BufferedPacket;
use packet::PacketKind;
use packet::pipe_payload;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tpl::Event;
use tpl::TPL_EMCL;
use tpl::Tpl;
use vmbus_ring::GuestRingMem;
use vmbus_ring::IncomingPacket;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PIPE_PACKET_TYPE_DATA;
use vmbus_ring::PIPE_PACKET_TYPE_SETUP_GPA_DIRECT;
use vmbus_ring::PIPE_PACKET_TYPE_TEARDOWN_GPA_DIRECT;
use vmbus_ring::PipeHeader;
use vmbus_ring::ReadError;
use vmbus_ring::RingMem;
use vmbus_ring::RingRange;
use vmbus_ring::TransferPageRange;
use vmbus_ring::WriteError;
use vmbus_root::Channel;
use vmbus_root::GpadlFlags;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// A recoverable EMCL error.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter was invalid, or the packet can never fit the ring.
    #[error("invalid parameter")]
    InvalidParameter,
    /// Memory for the ring or for bounce pages could not be allocated.
    #[error("out of resources")]
    OutOfResources,
    /// The channel is not running.
    #[error("channel is not running")]
    NotRunning,
    /// A reply did not fit the caller's buffer.
    #[error("reply of {0} bytes does not fit the buffer")]
    BufferTooSmall(usize),
    /// The vmbus root failed.
    #[error("vmbus error")]
    Vmbus(#[from] vmbus_root::Error),
    /// Guest memory could not be accessed.
    #[error("guest memory error")]
    Memory(#[from] GuestMemoryError),
}

/// Host behavior on the channel that violates the packet protocol.
///
/// Like [`vmbus_root::ProtocolViolation`], these are never returned to
/// callers.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    /// A completion names no outstanding transaction.
    #[error("completion for unknown transaction {0:#x}")]
    UnknownTransaction(u64),
    /// A pipe packet is shorter than the pipe header.
    #[error("pipe packet of {0} bytes is shorter than its header")]
    ShortPipePacket(usize),
    /// A pipe header claims more data than the packet holds.
    #[error("pipe data size {data_size} exceeds the {available} bytes available")]
    PipeLengthOverflow {
        /// The size in the pipe header.
        data_size: u32,
        /// The bytes following the pipe header.
        available: usize,
    },
    /// The range count of a transfer page packet disagrees with its header
    /// size.
    #[error("transfer page packet declares {declared} ranges but has room for {expected}")]
    TransferPageRangeCount {
        /// The count in the transfer page header.
        declared: u32,
        /// The count the header size allows.
        expected: usize,
    },
    /// The ring buffer control state or a packet descriptor is corrupt.
    #[error("corrupt ring buffer")]
    Ring(#[source] vmbus_ring::Error),
}

impl ProtocolViolation {
    /// Logs the violation and terminates.
    #[track_caller]
    pub fn fail(self) -> ! {
        tracing::error!(
            error = &self as &dyn std::error::Error,
            "host violated the vmbus packet protocol"
        );
        panic!("host violated the vmbus packet protocol: {self}");
    }
}

/// Issues transaction IDs for sends that request a completion.
///
/// One allocator is shared by every channel of a firmware instance, so IDs
/// increase across all of them. Running out of IDs is fatal.
#[derive(Debug, Clone, Default)]
pub struct TransactionIdAllocator(Arc<AtomicU64>);

impl TransactionIdAllocator {
    /// Returns an allocator whose first ID is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an allocator whose first ID follows `last`.
    pub fn starting_after(last: u64) -> Self {
        Self(Arc::new(AtomicU64::new(last)))
    }

    /// Issues the next ID.
    pub fn next(&self) -> u64 {
        match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
        {
            Ok(prev) => prev + 1,
            Err(_) => {
                tracing::error!("transaction ids exhausted");
                panic!("transaction ids exhausted");
            }
        }
    }
}

/// Flags describing how the host uses a send's external buffers.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SendFlags {
    /// The host only writes the buffers, so their contents are not sent.
    pub data_in_only: bool,
    /// The host only reads the buffers, so nothing is copied back.
    pub data_out_only: bool,
    #[bits(30)]
    _reserved: u32,
}

/// A buffer outside the ring, described to the host by its page list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExternalBuffer {
    /// The guest physical address of the first byte.
    pub gpa: u64,
    /// The length in bytes.
    pub len: u32,
}

impl ExternalBuffer {
    /// Describes `len` bytes at `gpa`.
    pub fn new(gpa: u64, len: u32) -> Self {
        Self { gpa, len }
    }

    /// The offset of the first byte in its page.
    pub fn page_offset(&self) -> usize {
        (self.gpa % PAGE_SIZE as u64) as usize
    }

    /// The number of pages the buffer spans.
    pub fn page_count(&self) -> usize {
        guestmem::pages_for(self.page_offset() + self.len as usize)
    }

    fn is_valid(&self) -> bool {
        self.gpa != 0 && self.len != 0
    }
}

/// Called with the payload of the completion that ends a transaction.
pub type CompletionRoutine = Box<dyn FnOnce(&[u8]) + Send>;

type ReceiveCallback = Arc<dyn Fn(&Emcl, ReceivedPacket) + Send + Sync>;
type AbortHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// A packet to send.
///
/// External buffers must stay valid until the host completes the packet, so
/// a request carrying them always carries a completion routine.
pub struct SendRequest<'a> {
    data: &'a [u8],
    external: &'a [ExternalBuffer],
    flags: SendFlags,
    completion: Option<CompletionRoutine>,
}

impl Debug for SendRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRequest")
            .field("len", &self.data.len())
            .field("external", &self.external)
            .field("flags", &self.flags)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl<'a> SendRequest<'a> {
    /// A request to send `data` without waiting for a completion.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            external: &[],
            flags: SendFlags::new(),
            completion: None,
        }
    }

    /// A request to send `data` and call `completion` with the host's reply.
    pub fn with_completion(
        data: &'a [u8],
        completion: impl FnOnce(&[u8]) + Send + 'static,
    ) -> Self {
        Self {
            completion: Some(Box::new(completion)),
            ..Self::new(data)
        }
    }

    /// A request to send `data` along with the page lists of `external`.
    pub fn with_external(
        data: &'a [u8],
        external: &'a [ExternalBuffer],
        flags: SendFlags,
        completion: impl FnOnce(&[u8]) + Send + 'static,
    ) -> Self {
        Self {
            data,
            external,
            flags,
            completion: Some(Box::new(completion)),
        }
    }
}

/// Transfer page ranges of a received packet, which refer to a buffer the
/// client shared with the host ahead of time.
#[derive(Debug, Clone)]
pub struct TransferPages {
    /// The ID of the shared buffer.
    pub set_id: u16,
    /// The ranges within that buffer.
    pub ranges: Vec<TransferPageRange>,
}

/// A packet the host sent. Pass it back to [`Emcl::complete_packet`] when
/// done with it.
#[derive(Debug)]
#[must_use]
pub struct ReceivedPacket {
    transaction_id: u64,
    completion_requested: bool,
    data: Vec<u8>,
    transfer_pages: Option<TransferPages>,
}

impl ReceivedPacket {
    /// The inline payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The transaction ID, or zero if the host did not request a completion.
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Returns whether the host awaits a completion.
    pub fn completion_requested(&self) -> bool {
        self.completion_requested
    }

    /// The transfer page ranges, if the packet carries any.
    pub fn transfer_pages(&self) -> Option<&TransferPages> {
        self.transfer_pages.as_ref()
    }
}

/// EMCL configuration.
#[derive(Debug, Clone)]
pub struct EmclConfig {
    /// The minimum number of pages in a bounce block.
    pub bounce_block_min_pages: usize,
}

impl Default for EmclConfig {
    fn default() -> Self {
        Self {
            bounce_block_min_pages: 32,
        }
    }
}

/// A send awaiting its completion.
struct PendingCompletion {
    routine: CompletionRoutine,
    flags: SendFlags,
    staged: Vec<StagedBuffer>,
}

/// A packet copied out of the incoming ring.
enum Incoming {
    Completion { transaction_id: u64, data: Vec<u8> },
    Data(ReceivedPacket),
    Unknown(u16),
}

struct Running {
    ring_base: u64,
    ring_pages: usize,
    gpadl: Gpadl,
    incoming: IncomingRing<GuestRingMem>,
    outgoing: OutgoingRing<GuestRingMem>,
    receive_event: Event,
}

struct Receiver {
    callback: ReceiveCallback,
    tpl: Tpl,
}

struct EmclState {
    running: Option<Running>,
    receiver: Option<Receiver>,
    abort_handler: Option<AbortHandler>,
    completions: BTreeMap<u64, PendingCompletion>,
    queue: VecDeque<BufferedPacket>,
    interrupt_deferred: bool,
    allocation_failure: bool,
    bounce: BouncePool,
}

struct EmclInner {
    channel: Channel,
    transaction_ids: TransactionIdAllocator,
    use_bounce: bool,
    state: Mutex<EmclState>,
}

/// The packet engine of one channel.
#[derive(Clone)]
pub struct Emcl {
    inner: Arc<EmclInner>,
}

impl Debug for Emcl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Emcl")
            .field("channel_id", &self.inner.channel.channel_id())
            .field("running", &state.running.is_some())
            .field("completions", &state.completions.len())
            .field("queued", &state.queue.len())
            .field("bounce", &state.bounce)
            .finish()
    }
}

/// Data that does not fit a single allocation attempt is left in the ring.
struct AllocationFailed;

/// The outcome of [`read_until_empty`].
#[derive(Debug, Default)]
struct Drained {
    /// The host is waiting for room in the ring.
    signal: bool,
    /// A packet could not be taken and was left in the ring.
    stalled: bool,
}

/// Hands every packet in `ring` to `take`, committing after each pass.
///
/// The host raises no interrupt for a packet it writes before the commit, so
/// passes repeat until one finds the ring empty.
fn read_until_empty<M: RingMem>(
    ring: &IncomingRing<M>,
    mut take: impl FnMut(IncomingPacket) -> Result<(), AllocationFailed>,
) -> Drained {
    let mut incoming = ring
        .incoming()
        .unwrap_or_else(|err| ProtocolViolation::Ring(err).fail());
    let mut drained = Drained::default();
    loop {
        let mut read = 0;
        loop {
            let before = incoming.clone();
            let packet = match ring.read(&mut incoming) {
                Ok(packet) => packet,
                Err(ReadError::Empty) => break,
                Err(ReadError::Corrupt(err)) => ProtocolViolation::Ring(err).fail(),
            };
            if take(packet).is_err() {
                incoming = before;
                drained.stalled = true;
                break;
            }
            read += 1;
        }
        drained.signal |= ring.commit_read(&mut incoming);
        if read == 0 || drained.stalled {
            return drained;
        }
    }
}

/// Copies `range` out of the ring.
fn copy_range(
    ring: &IncomingRing<GuestRingMem>,
    range: RingRange,
) -> Result<Vec<u8>, AllocationFailed> {
    let mut data = Vec::new();
    data.try_reserve_exact(range.len())
        .map_err(|_| AllocationFailed)?;
    data.resize(range.len(), 0);
    range
        .reader(ring)
        .read(&mut data)
        .expect("range lies within the packet");
    Ok(data)
}

fn copy_packet(
    ring: &IncomingRing<GuestRingMem>,
    packet: IncomingPacket,
) -> Result<Incoming, AllocationFailed> {
    let incoming = match packet.typ {
        IncomingPacketType::Completion => Incoming::Completion {
            transaction_id: packet.transaction_id.unwrap_or(0),
            data: copy_range(ring, packet.payload)?,
        },
        IncomingPacketType::InBand => Incoming::Data(ReceivedPacket {
            transaction_id: packet.transaction_id.unwrap_or(0),
            completion_requested: packet.transaction_id.is_some(),
            data: copy_range(ring, packet.payload)?,
            transfer_pages: None,
        }),
        IncomingPacketType::TransferPages(set_id, count, header) => {
            let expected = header.len() / size_of::<TransferPageRange>();
            if count as usize != expected {
                ProtocolViolation::TransferPageRangeCount {
                    declared: count,
                    expected,
                }
                .fail();
            }
            let ranges = copy_range(ring, header)?
                .chunks_exact(size_of::<TransferPageRange>())
                .filter_map(|chunk| TransferPageRange::read_from_bytes(chunk).ok())
                .collect();
            Incoming::Data(ReceivedPacket {
                transaction_id: packet.transaction_id.unwrap_or(0),
                completion_requested: packet.transaction_id.is_some(),
                data: copy_range(ring, packet.payload)?,
                transfer_pages: Some(TransferPages { set_id, ranges }),
            })
        }
        IncomingPacketType::GpaDirect(..) => {
            Incoming::Unknown(vmbus_ring::protocol::PACKET_TYPE_GPA_DIRECT)
        }
        IncomingPacketType::Unknown(typ) => Incoming::Unknown(typ),
    };
    Ok(incoming)
}

impl Emcl {
    /// Creates the engine for `channel`. Transaction IDs come from
    /// `transaction_ids`.
    pub fn new(
        channel: Channel,
        transaction_ids: TransactionIdAllocator,
        config: EmclConfig,
    ) -> Self {
        let isolation = *channel.isolation();
        let use_bounce = isolation.is_isolated() && !channel.uses_confidential_external_memory();
        let bounce = BouncePool::new(
            channel.memory().clone(),
            channel.host_visibility().clone(),
            isolation,
            config.bounce_block_min_pages,
        );
        Self {
            inner: Arc::new(EmclInner {
                channel,
                transaction_ids,
                use_bounce,
                state: Mutex::new(EmclState {
                    running: None,
                    receiver: None,
                    abort_handler: None,
                    completions: BTreeMap::new(),
                    queue: VecDeque::new(),
                    interrupt_deferred: false,
                    allocation_failure: false,
                    bounce,
                }),
            }),
        }
    }

    /// The channel.
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Returns whether external buffers are staged through bounce pages.
    pub fn uses_bounce_buffers(&self) -> bool {
        self.inner.use_bounce
    }

    /// Returns whether the channel is running.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// The number of sends awaiting a completion.
    pub fn pending_completions(&self) -> usize {
        self.inner.state.lock().completions.len()
    }

    /// The number of packets waiting for ring space.
    pub fn queued_packets(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// The number of bounce pages staging external buffers.
    pub fn bounce_pages_in_use(&self) -> usize {
        self.inner.state.lock().bounce.pages_in_use()
    }

    /// The number of bounce pages allocated.
    pub fn bounce_pages_total(&self) -> usize {
        self.inner.state.lock().bounce.total_pages()
    }

    /// Delivers received packets to `callback`, running at `tpl`. Must be
    /// called before the channel starts.
    pub fn set_receive_callback(
        &self,
        tpl: Tpl,
        callback: impl Fn(&Emcl, ReceivedPacket) + Send + Sync + 'static,
    ) {
        assert!(
            tpl > Tpl::APPLICATION && tpl <= TPL_EMCL,
            "invalid receive level {tpl:?}"
        );
        let mut state = self.inner.state.lock();
        assert!(state.running.is_none(), "setting the receive callback of a running channel");
        state.receiver = Some(Receiver {
            callback: Arc::new(callback),
            tpl,
        });
    }

    /// Removes the receive callback. Must be called before the channel
    /// starts.
    pub fn clear_receive_callback(&self) {
        let mut state = self.inner.state.lock();
        assert!(state.running.is_none(), "clearing the receive callback of a running channel");
        state.receiver = None;
    }

    /// Reports each transaction that [`Self::stop_channel`] discards to
    /// `handler`. Without a handler they are discarded silently.
    pub fn set_abort_handler(&self, handler: impl Fn(u64) + Send + Sync + 'static) {
        self.inner.state.lock().abort_handler = Some(Arc::new(handler));
    }

    /// Allocates ring buffers of `incoming_pages` and `outgoing_pages` data
    /// pages and opens the channel on them.
    ///
    /// Everything acquired is released if opening fails.
    pub fn start_channel(&self, incoming_pages: u32, outgoing_pages: u32) -> Result<(), Error> {
        let channel = &self.inner.channel;
        let channel_id = channel.channel_id();
        assert!(
            channel.dispatcher().current() < Tpl::NOTIFY,
            "channels start below the notify level"
        );
        assert!(!self.is_running(), "channel {channel_id} already started");
        if incoming_pages == 0 || outgoing_pages == 0 {
            tracing::error!(channel_id, incoming_pages, outgoing_pages, "empty ring");
            return Err(Error::InvalidParameter);
        }

        let ring_pages = incoming_pages as usize + outgoing_pages as usize + 2;
        let mem = channel.memory();
        let ring_base = mem.allocate_pages(ring_pages).map_err(|err| {
            tracing::error!(
                channel_id,
                ring_pages,
                error = &err as &dyn std::error::Error,
                "failed to allocate ring buffer"
            );
            Error::OutOfResources
        })?;
        let mut gpadl = match channel.prepare_gpadl(
            ring_base,
            ring_pages * PAGE_SIZE,
            GpadlFlags::new()
                .with_zero_pages(true)
                .with_allow_encrypted(true),
            HostVisibility::READ_WRITE,
        ) {
            Ok(gpadl) => gpadl,
            Err(err) => {
                mem.free_pages(ring_base, ring_pages);
                return Err(err.into());
            }
        };

        match self.open(&mut gpadl, incoming_pages, outgoing_pages) {
            Ok((incoming, outgoing, receive_event)) => {
                self.inner.state.lock().running = Some(Running {
                    ring_base,
                    ring_pages,
                    gpadl,
                    incoming,
                    outgoing,
                    receive_event,
                });
                Ok(())
            }
            Err(err) => {
                match channel.destroy_gpadl(gpadl) {
                    Ok(()) => mem.free_pages(ring_base, ring_pages),
                    Err(destroy_err) => tracing::error!(
                        channel_id,
                        error = &destroy_err as &dyn std::error::Error,
                        "failed to destroy ring gpadl, leaking ring pages"
                    ),
                }
                Err(err)
            }
        }
    }

    /// Creates the rings over the prepared `gpadl`, then registers the GPADL
    /// and opens the channel. Undoes everything but the preparation on
    /// failure.
    fn open(
        &self,
        gpadl: &mut Gpadl,
        incoming_pages: u32,
        outgoing_pages: u32,
    ) -> Result<(IncomingRing<GuestRingMem>, OutgoingRing<GuestRingMem>, Event), Error> {
        let channel = &self.inner.channel;
        let mem = channel.memory();
        let outgoing_pages = outgoing_pages as usize;
        let incoming_control = gpadl.buffer() + ((outgoing_pages + 1) * PAGE_SIZE) as u64;
        let outgoing = OutgoingRing::new(GuestRingMem::new(
            mem.clone(),
            gpadl.buffer(),
            outgoing_pages,
        )?)
        .map_err(|_| Error::InvalidParameter)?;
        let incoming = IncomingRing::new(GuestRingMem::new(
            mem.clone(),
            incoming_control,
            incoming_pages as usize,
        )?)
        .map_err(|_| Error::InvalidParameter)?;
        incoming.set_interrupt_mask(false);

        channel.create_gpadl(gpadl)?;

        let tpl = self
            .inner
            .state
            .lock()
            .receiver
            .as_ref()
            .map_or(TPL_EMCL, |receiver| receiver.tpl);
        let weak = Arc::downgrade(&self.inner);
        let receive_event = channel.dispatcher().create_event(
            tpl,
            Some(Box::new(move || {
                if let Some(emcl) = upgrade(&weak) {
                    emcl.process_queue();
                }
            })),
        );
        channel.register_isr(Some(receive_event.clone()));

        if let Err(err) = channel.open_channel(gpadl, outgoing_pages as u32 + 1) {
            channel.register_isr(None);
            receive_event.close();
            return Err(err.into());
        }
        tracing::info!(
            channel_id = channel.channel_id(),
            incoming_pages,
            outgoing_pages,
            bounce = self.inner.use_bounce,
            "channel started"
        );
        Ok((incoming, outgoing, receive_event))
    }

    /// Closes the channel and releases its rings.
    ///
    /// Queued packets are discarded, and so are the sends awaiting a
    /// completion: their completion routines never run.
    pub fn stop_channel(&self) {
        let channel = &self.inner.channel;
        let channel_id = channel.channel_id();
        let (running, completions, queued, abort_handler) = {
            let mut state = self.inner.state.lock();
            let Some(running) = state.running.take() else {
                panic!("channel {channel_id} is not running");
            };
            let current = channel.dispatcher().current();
            assert!(
                current <= running.receive_event.tpl(),
                "stopping channel {channel_id} at {current:?}, above its receive level"
            );
            let completions = std::mem::take(&mut state.completions);
            let queued = std::mem::take(&mut state.queue);
            state.interrupt_deferred = false;
            state.allocation_failure = false;
            (running, completions, queued, state.abort_handler.clone())
        };

        if let Err(err) = channel.close_channel() {
            tracing::error!(
                channel_id,
                error = &err as &dyn std::error::Error,
                "failed to close channel"
            );
        }
        channel.register_isr(None);
        let Running {
            ring_base,
            ring_pages,
            gpadl,
            incoming,
            outgoing,
            receive_event,
        } = running;
        let destroyed = channel.destroy_gpadl(gpadl);
        receive_event.close();
        drop(queued);

        {
            let mut state = self.inner.state.lock();
            for (transaction_id, completion) in &completions {
                state.bounce.release(
                    completion
                        .staged
                        .iter()
                        .flat_map(|staged| staged.pages.iter().copied()),
                );
                if abort_handler.is_none() {
                    tracing::warn!(channel_id, transaction_id, "discarding pending completion");
                }
            }
            state.bounce.free_all();
        }
        if let Some(handler) = abort_handler {
            for &transaction_id in completions.keys() {
                handler(transaction_id);
            }
        }
        drop(completions);

        drop((incoming, outgoing));
        match destroyed {
            Ok(()) => channel.memory().free_pages(ring_base, ring_pages),
            Err(err) => tracing::error!(
                channel_id,
                error = &err as &dyn std::error::Error,
                "failed to destroy ring gpadl, leaking ring pages"
            ),
        }
        tracing::info!(channel_id, "channel stopped");
    }

    /// Sends a packet.
    ///
    /// A packet that does not fit the ring right now is queued and written
    /// once the host makes room. Queued packets keep their order.
    pub fn send_packet(&self, request: SendRequest<'_>) -> Result<(), Error> {
        let SendRequest {
            data,
            external,
            flags,
            completion,
        } = request;
        assert!(
            !(flags.data_in_only() && flags.data_out_only()),
            "data cannot flow in only and out only"
        );
        if !external.iter().all(ExternalBuffer::is_valid) {
            tracing::error!(
                channel_id = self.inner.channel.channel_id(),
                ?external,
                "invalid external buffer"
            );
            return Err(Error::InvalidParameter);
        }
        let pipe = self.inner.channel.is_pipe_mode();
        assert!(
            !pipe || external.is_empty(),
            "pipe channels cannot send external buffers"
        );

        let transaction_id = if completion.is_some() {
            self.inner.transaction_ids.next()
        } else {
            0
        };
        let kind = if external.is_empty() {
            PacketKind::InBand {
                completion_requested: completion.is_some(),
            }
        } else {
            PacketKind::GpaDirect(gpa_ranges(external))
        };
        let payload = if pipe {
            pipe_payload(PIPE_PACKET_TYPE_DATA, data)
        } else {
            data.to_vec()
        };
        self.submit(
            BufferedPacket {
                transaction_id,
                kind,
                payload,
            },
            completion.map(|routine| (routine, flags, external)),
            false,
        )
    }

    /// Writes `packet` to the ring or queues it, after staging external
    /// buffers and recording the completion.
    fn submit(
        &self,
        mut packet: BufferedPacket,
        completion: Option<(CompletionRoutine, SendFlags, &[ExternalBuffer])>,
        defer_interrupt: bool,
    ) -> Result<(), Error> {
        let channel = &self.inner.channel;
        let channel_id = channel.channel_id();
        let _tpl = channel.dispatcher().raise(TPL_EMCL);
        let signal = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(running) = &state.running else {
                tracing::error!(channel_id, "send on a channel that is not running");
                return Err(Error::NotRunning);
            };
            let ring = &running.outgoing;
            let len = packet.len();
            if len >= ring.maximum_packet_size() {
                tracing::error!(channel_id, len, "packet does not fit the ring");
                return Err(Error::InvalidParameter);
            }

            if let Some((routine, flags, external)) = completion {
                let staged = if self.inner.use_bounce && !external.is_empty() {
                    let staged = state.bounce.stage(external, flags.data_in_only())?;
                    packet.kind = PacketKind::GpaDirect(packet::bounced_gpa_ranges(&staged));
                    staged
                } else {
                    Vec::new()
                };
                state.completions.insert(
                    packet.transaction_id,
                    PendingCompletion {
                        routine,
                        flags,
                        staged,
                    },
                );
            }

            let mut outgoing = ring
                .outgoing()
                .unwrap_or_else(|err| ProtocolViolation::Ring(err).fail());
            match packet.write(ring, &mut outgoing) {
                Ok(()) => {
                    let mut signal = false;
                    if ring.commit_write(&mut outgoing) || state.interrupt_deferred {
                        signal = !defer_interrupt;
                        state.interrupt_deferred = defer_interrupt;
                    }
                    tracing::trace!(
                        channel_id,
                        transaction_id = packet.transaction_id,
                        len,
                        "packet sent"
                    );
                    signal
                }
                Err(WriteError::Full(needed)) => {
                    ring.set_pending_send_size(needed)
                        .unwrap_or_else(|err| ProtocolViolation::Ring(err).fail());
                    tracing::trace!(
                        channel_id,
                        transaction_id = packet.transaction_id,
                        len,
                        "ring full, packet queued"
                    );
                    state.queue.push_back(packet);
                    std::mem::take(&mut state.interrupt_deferred)
                }
                Err(WriteError::Corrupt(err)) => ProtocolViolation::Ring(err).fail(),
            }
        };
        if signal {
            self.signal_host();
        }
        Ok(())
    }

    fn signal_host(&self) {
        if let Err(err) = self.inner.channel.send_interrupt() {
            tracing::warn!(
                channel_id = self.inner.channel.channel_id(),
                error = &err as &dyn std::error::Error,
                "failed to signal the host"
            );
        }
    }

    /// Completes a packet the host sent, replying with `reply` if the host
    /// requested a completion.
    pub fn complete_packet(&self, packet: ReceivedPacket, reply: &[u8]) -> Result<(), Error> {
        let result = if packet.completion_requested {
            let payload = if self.inner.channel.is_pipe_mode() {
                pipe_payload(PIPE_PACKET_TYPE_DATA, reply)
            } else {
                reply.to_vec()
            };
            self.submit(
                BufferedPacket {
                    transaction_id: packet.transaction_id,
                    kind: PacketKind::Completion,
                    payload,
                },
                None,
                false,
            )
        } else {
            Ok(())
        };
        drop(packet);

        // Memory was freed, so packets left in the ring may fit now.
        let rearm = {
            let mut state = self.inner.state.lock();
            if std::mem::take(&mut state.allocation_failure) {
                state.running.as_ref().map(|running| running.receive_event.clone())
            } else {
                None
            }
        };
        if let Some(event) = rearm {
            event.signal();
        }
        result
    }

    /// Reads every packet in the incoming ring and dispatches it, then writes
    /// queued packets while they fit.
    fn process_queue(&self) {
        let channel_id = self.inner.channel.channel_id();
        let (packets, callback, signal) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(running) = &state.running else {
                return;
            };
            let ring = &running.incoming;
            let mut packets = Vec::new();
            let drained = read_until_empty(ring, |packet| {
                packets.push(copy_packet(ring, packet)?);
                Ok(())
            });
            if drained.stalled {
                tracing::warn!(channel_id, "no memory for packet, waiting for a completion");
                state.allocation_failure = true;
            }
            let signal = drained.signal;
            let callback = state
                .receiver
                .as_ref()
                .map(|receiver| receiver.callback.clone());
            (packets, callback, signal)
        };
        if signal {
            self.signal_host();
        }

        for packet in packets {
            self.dispatch(packet, callback.as_ref());
        }
        self.drain_queue();
    }

    fn dispatch(&self, packet: Incoming, callback: Option<&ReceiveCallback>) {
        let channel_id = self.inner.channel.channel_id();
        match packet {
            Incoming::Completion {
                transaction_id,
                data,
            } => {
                let routine = {
                    let _tpl = self.inner.channel.dispatcher().raise(TPL_EMCL);
                    let mut state = self.inner.state.lock();
                    let Some(completion) = state.completions.remove(&transaction_id) else {
                        ProtocolViolation::UnknownTransaction(transaction_id).fail();
                    };
                    state
                        .bounce
                        .unstage(completion.staged, !completion.flags.data_out_only());
                    completion.routine
                };
                tracing::trace!(channel_id, transaction_id, len = data.len(), "completion");
                routine(&data);
            }
            Incoming::Data(mut packet) => {
                if self.inner.channel.is_pipe_mode() {
                    let len = packet.data.len();
                    let Ok((header, rest)) = PipeHeader::read_from_prefix(&packet.data) else {
                        ProtocolViolation::ShortPipePacket(len).fail();
                    };
                    if header.packet_type != PIPE_PACKET_TYPE_DATA {
                        tracing::error!(
                            channel_id,
                            packet_type = header.packet_type,
                            "dropping unsupported pipe packet"
                        );
                        return;
                    }
                    if header.len as usize > rest.len() {
                        ProtocolViolation::PipeLengthOverflow {
                            data_size: header.len,
                            available: rest.len(),
                        }
                        .fail();
                    }
                    let data_size = header.len as usize;
                    packet.data.drain(..size_of::<PipeHeader>());
                    packet.data.truncate(data_size);
                }
                let Some(callback) = callback else {
                    tracing::debug!(channel_id, "no receive callback, dropping packet");
                    return;
                };
                tracing::trace!(
                    channel_id,
                    transaction_id = packet.transaction_id,
                    len = packet.data.len(),
                    "packet received"
                );
                callback(self, packet);
            }
            Incoming::Unknown(packet_type) => {
                tracing::error!(channel_id, packet_type, "dropping packet of unexpected type");
            }
        }
    }

    /// Writes queued packets in order until one does not fit.
    fn drain_queue(&self) {
        let channel_id = self.inner.channel.channel_id();
        let _tpl = self.inner.channel.dispatcher().raise(TPL_EMCL);
        let signal = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(running) = &state.running else {
                return;
            };
            if state.queue.is_empty() {
                return;
            }
            let ring = &running.outgoing;
            let mut outgoing = ring
                .outgoing()
                .unwrap_or_else(|err| ProtocolViolation::Ring(err).fail());
            let mut written = 0;
            while let Some(packet) = state.queue.front() {
                match packet.write(ring, &mut outgoing) {
                    Ok(()) => {
                        state.queue.pop_front();
                        written += 1;
                    }
                    Err(WriteError::Full(needed)) => {
                        ring.set_pending_send_size(needed)
                            .unwrap_or_else(|err| ProtocolViolation::Ring(err).fail());
                        break;
                    }
                    Err(WriteError::Corrupt(err)) => ProtocolViolation::Ring(err).fail(),
                }
            }
            if state.queue.is_empty() {
                ring.set_pending_send_size(0)
                    .unwrap_or_else(|err| ProtocolViolation::Ring(err).fail());
            }
            tracing::trace!(
                channel_id,
                written,
                remaining = state.queue.len(),
                "drained send queue"
            );
            let commit = ring.commit_write(&mut outgoing);
            commit | std::mem::take(&mut state.interrupt_deferred)
        };
        if signal {
            self.signal_host();
        }
    }

    /// Prepares and creates a GPADL for `len` bytes at `buffer` on this
    /// channel.
    pub fn create_gpadl(
        &self,
        buffer: u64,
        len: usize,
        visibility: HostVisibility,
    ) -> Result<Gpadl, Error> {
        let channel = &self.inner.channel;
        let mut gpadl = channel.prepare_gpadl(buffer, len, GpadlFlags::new(), visibility)?;
        if let Err(err) = channel.create_gpadl(&mut gpadl) {
            if let Err(destroy_err) = channel.destroy_gpadl(gpadl) {
                tracing::error!(
                    error = &destroy_err as &dyn std::error::Error,
                    "failed to release prepared gpadl"
                );
            }
            return Err(err.into());
        }
        Ok(gpadl)
    }

    /// Destroys a GPADL made by [`Self::create_gpadl`].
    pub fn destroy_gpadl(&self, gpadl: Gpadl) -> Result<(), Error> {
        Ok(self.inner.channel.destroy_gpadl(gpadl)?)
    }

    /// Shares `buffers` with the host of a pipe channel under `handle`.
    pub fn create_gpa_range(
        &self,
        handle: u32,
        buffers: &[ExternalBuffer],
        writable: bool,
    ) -> Result<(), Error> {
        if !self.inner.channel.is_pipe_mode() {
            tracing::error!(
                channel_id = self.inner.channel.channel_id(),
                "gpa ranges need a pipe channel"
            );
            return Err(Error::InvalidParameter);
        }
        if buffers.is_empty() || !buffers.iter().all(ExternalBuffer::is_valid) {
            return Err(Error::InvalidParameter);
        }
        let ranges = gpa_ranges(buffers);
        let mut body = SetupGpaRange {
            handle,
            is_writable: writable.into(),
            reserved: [0; 3],
            range_count: ranges.range_count() as u32,
            reserved2: 0,
        }
        .as_bytes()
        .to_vec();
        body.extend_from_slice(ranges.range_buffer().as_bytes());
        self.submit(
            BufferedPacket {
                transaction_id: 0,
                kind: PacketKind::InBand {
                    completion_requested: false,
                },
                payload: pipe_payload(PIPE_PACKET_TYPE_SETUP_GPA_DIRECT, &body),
            },
            None,
            true,
        )
    }

    /// Revokes a range shared by [`Self::create_gpa_range`].
    pub fn destroy_gpa_range(&self, handle: u32) -> Result<(), Error> {
        if !self.inner.channel.is_pipe_mode() {
            tracing::error!(
                channel_id = self.inner.channel.channel_id(),
                "gpa ranges need a pipe channel"
            );
            return Err(Error::InvalidParameter);
        }
        self.submit(
            BufferedPacket {
                transaction_id: 0,
                kind: PacketKind::InBand {
                    completion_requested: false,
                },
                payload: pipe_payload(
                    PIPE_PACKET_TYPE_TEARDOWN_GPA_DIRECT,
                    TeardownGpaRange { handle }.as_bytes(),
                ),
            },
            None,
            true,
        )
    }

    /// Sends `data` and waits for the host's completion, copying its payload
    /// to `reply`. Returns the reply length.
    ///
    /// Must be called below the receive level, since completions are
    /// delivered there.
    pub fn send_packet_sync(
        &self,
        data: &[u8],
        external: &[ExternalBuffer],
        flags: SendFlags,
        reply: &mut [u8],
    ) -> Result<usize, Error> {
        let dispatcher = self.inner.channel.dispatcher();
        let receive_level = self
            .inner
            .state
            .lock()
            .running
            .as_ref()
            .map(|running| running.receive_event.tpl());
        if let Some(level) = receive_level {
            let current = dispatcher.current();
            assert!(
                current < level,
                "synchronous send at {current:?} blocks receive processing at {level:?}"
            );
        }
        let done = dispatcher.create_event(Tpl::APPLICATION, None);
        let response = Arc::new(Mutex::new(Vec::new()));
        let completion = {
            let done = done.clone();
            let response = response.clone();
            move |data: &[u8]| {
                *response.lock() = data.to_vec();
                done.signal();
            }
        };
        let request = if external.is_empty() {
            SendRequest::with_completion(data, completion)
        } else {
            SendRequest::with_external(data, external, flags, completion)
        };
        self.send_packet(request)?;
        dispatcher.wait_for_event(&done);

        let response = response.lock();
        let reply = reply
            .get_mut(..response.len())
            .ok_or(Error::BufferTooSmall(response.len()))?;
        reply.copy_from_slice(&response);
        Ok(response.len())
    }
}

fn upgrade(weak: &Weak<EmclInner>) -> Option<Emcl> {
    weak.upgrade().map(|inner| Emcl { inner })
}
