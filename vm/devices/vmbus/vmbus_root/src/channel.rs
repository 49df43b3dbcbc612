// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-channel operations: GPADLs, open and close, and interrupts.

use crate::Error;
use crate::ProtocolViolation;
use crate::RootInner;
use bitfield_struct::bitfield;
use efi_hv::EfiHvIvm;
use efi_hv::HostVisibility;
use efi_hv::IsolationConfig;
use efi_hv::ProtectionHandle;
use guestmem::GuestMemory;
use guestmem::PAGE_SIZE;
use guid::Guid;
use std::fmt::Debug;
use std::sync::Arc;
use tpl::Dispatcher;
use tpl::Event;
use tpl::Tpl;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::STATUS_SUCCESS;
use zerocopy::IntoBytes;

/// Flags for [`Channel::prepare_gpadl`].
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct GpadlFlags {
    /// Zero the buffer while preparing it.
    pub zero_pages: bool,
    /// Keep the buffer encrypted if the channel's ring buffer is
    /// confidential.
    pub allow_encrypted: bool,
    #[bits(30)]
    _reserved: u32,
}

const GPADL_FLAGS_VALID: u32 = GpadlFlags::new()
    .with_zero_pages(true)
    .with_allow_encrypted(true)
    .into_bits();

/// The immutable state of a channel, shared by every handle to it.
pub(crate) struct ChannelShared {
    pub(crate) offer: OfferChannel,
    pub(crate) confidential_ring_buffer: bool,
    pub(crate) confidential_external_memory: bool,
    /// Signaled when an open result arrives.
    pub(crate) response_event: Event,
}

impl ChannelShared {
    pub(crate) fn new(
        dispatcher: &Dispatcher,
        offer: OfferChannel,
        feature_flags: FeatureFlags,
    ) -> Self {
        // The offer flags only count if the host agreed to confidential
        // channels.
        let confidential = feature_flags.confidential_channels();
        Self {
            confidential_ring_buffer: confidential && offer.flags.confidential_ring_buffer(),
            confidential_external_memory: confidential
                && offer.flags.confidential_external_memory(),
            response_event: dispatcher.create_event(Tpl::APPLICATION, None),
            offer,
        }
    }
}

/// A buffer described to the host.
///
/// Created by [`Channel::prepare_gpadl`], registered with the host by
/// [`Channel::create_gpadl`] and released by [`Channel::destroy_gpadl`].
#[derive(Debug)]
#[must_use]
pub struct Gpadl {
    allocated: u64,
    len: usize,
    visible_address: u64,
    buffer: u64,
    handle: u32,
    protection: Option<ProtectionHandle>,
}

impl Gpadl {
    /// The GPADL handle, or zero if the GPADL has not been created.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The address the firmware accesses the buffer through. On an isolated
    /// VM this is the shared alias of a host-visible buffer.
    pub fn buffer(&self) -> u64 {
        self.buffer
    }

    /// The address the buffer was allocated at.
    pub fn allocated_buffer(&self) -> u64 {
        self.allocated
    }

    /// The address the host sees.
    pub fn visible_address(&self) -> u64 {
        self.visible_address
    }

    /// The buffer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is empty, which a prepared GPADL never is.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of pages in the buffer.
    pub fn page_count(&self) -> usize {
        self.len / PAGE_SIZE
    }
}

/// A handle to a channel the root created from a host offer.
#[derive(Clone)]
pub struct Channel {
    root: Arc<RootInner>,
    shared: Arc<ChannelShared>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id())
            .field("interface_id", &self.interface_id())
            .field("instance_id", &self.instance_id())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(root: Arc<RootInner>, shared: Arc<ChannelShared>) -> Self {
        Self { root, shared }
    }

    /// The channel ID assigned by the host.
    pub fn channel_id(&self) -> u32 {
        self.shared.offer.channel_id.0
    }

    /// The connection ID used to signal the host.
    pub fn connection_id(&self) -> u32 {
        self.shared.offer.connection_id
    }

    /// The device class.
    pub fn interface_id(&self) -> Guid {
        self.shared.offer.interface_id
    }

    /// The device instance.
    pub fn instance_id(&self) -> Guid {
        self.shared.offer.instance_id
    }

    /// The offer the channel was created from.
    pub fn offer(&self) -> &OfferChannel {
        &self.shared.offer
    }

    /// Whether the channel carries pipe framing.
    pub fn is_pipe_mode(&self) -> bool {
        self.shared.offer.flags.named_pipe_mode()
    }

    /// Whether the ring buffer may stay encrypted.
    pub fn is_confidential(&self) -> bool {
        self.shared.confidential_ring_buffer
    }

    /// Whether external buffers may stay encrypted.
    pub fn uses_confidential_external_memory(&self) -> bool {
        self.shared.confidential_external_memory
    }

    /// The dispatcher the root runs on.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.root.dispatcher
    }

    /// Guest memory.
    pub fn memory(&self) -> &GuestMemory {
        &self.root.mem
    }

    /// The isolation configuration of the VM.
    pub fn isolation(&self) -> &IsolationConfig {
        &self.root.isolation
    }

    /// The host visibility interface.
    pub fn host_visibility(&self) -> &Arc<dyn EfiHvIvm> {
        &self.root.ivm
    }

    /// Prepares the page-aligned buffer at `buffer` for a GPADL.
    ///
    /// On an isolated VM the buffer is made visible to the host with
    /// `visibility`, unless `flags` allows it to stay encrypted and the
    /// channel's ring buffer is confidential.
    pub fn prepare_gpadl(
        &self,
        buffer: u64,
        len: usize,
        flags: GpadlFlags,
        visibility: HostVisibility,
    ) -> Result<Gpadl, Error> {
        if len == 0 || u32::try_from(len).is_err() {
            tracing::error!(len, "invalid gpadl length");
            return Err(Error::InvalidParameter);
        }
        if buffer % PAGE_SIZE as u64 != 0 || len % PAGE_SIZE != 0 {
            tracing::error!(buffer, len, "gpadl buffer is not page aligned");
            return Err(Error::InvalidParameter);
        }
        if flags.into_bits() & !GPADL_FLAGS_VALID != 0 {
            tracing::error!(?flags, "invalid gpadl flags");
            return Err(Error::InvalidParameter);
        }

        let isolation = &self.root.isolation;
        let (visible_address, protection) =
            if isolation.is_isolated() && (!flags.allow_encrypted() || !self.is_confidential()) {
                let protection = self
                    .root
                    .ivm
                    .make_address_range_host_visible(
                        visibility,
                        buffer,
                        len as u64,
                        flags.zero_pages(),
                    )
                    .map_err(|err| {
                        tracing::error!(
                            buffer,
                            len,
                            error = &err as &dyn std::error::Error,
                            "failed to make gpadl buffer host visible"
                        );
                        Error::Hv(err)
                    })?;
                (isolation.host_visible_address(buffer), Some(protection))
            } else {
                if flags.zero_pages() {
                    self.root.mem.fill_at(buffer, 0, len)?;
                }
                (buffer, None)
            };

        let alias = isolation.shared_alias();
        let buffer_address =
            if alias.shared_gpa_boundary != 0 && visible_address >= alias.shared_gpa_boundary {
                visible_address | alias.canonicalization_mask
            } else {
                visible_address
            };

        Ok(Gpadl {
            allocated: buffer,
            len,
            visible_address,
            buffer: buffer_address,
            handle: 0,
            protection,
        })
    }

    /// Describes a prepared buffer to the host and waits for it to accept it.
    pub fn create_gpadl(&self, gpadl: &mut Gpadl) -> Result<(), Error> {
        if gpadl.handle != 0 {
            tracing::error!(gpadl_id = gpadl.handle, "gpadl already created");
            return Err(Error::InvalidParameter);
        }
        let handle = self.root.allocate_gpadl()?;
        match self.send_gpadl(gpadl, handle) {
            Ok(()) => {
                gpadl.handle = handle;
                Ok(())
            }
            Err(err) => {
                self.root.reclaim_gpadl(handle);
                Err(err)
            }
        }
    }

    fn send_gpadl(&self, gpadl: &Gpadl, handle: u32) -> Result<(), Error> {
        let channel_id = self.channel_id();
        let page_count = gpadl.page_count();
        let first_pfn = gpadl.visible_address / PAGE_SIZE as u64;
        let range = protocol::GpaRange {
            byte_count: gpadl.len as u32,
            byte_offset: (gpadl.visible_address % PAGE_SIZE as u64) as u32,
        };
        let range_len = u16::try_from(size_of::<protocol::GpaRange>() + page_count * 8)
            .map_err(|_| {
                tracing::error!(page_count, "gpadl too large to describe");
                Error::InvalidParameter
            })?;

        let pfns: Vec<u64> = (0..page_count as u64).map(|i| first_pfn + i).collect();
        // The range header occupies the first value of the header message.
        let (header_pfns, rest) = pfns.split_at(
            (protocol::GpadlHeader::MAX_DATA_VALUES - 1).min(pfns.len()),
        );

        tracing::debug!(
            channel_id,
            gpadl_id = handle,
            page_count,
            first_pfn,
            "creating gpadl"
        );

        let mut data = range.as_bytes().to_vec();
        data.extend_from_slice(header_pfns.as_bytes());
        self.root.send_message(&OutgoingMessage::with_data(
            &protocol::GpadlHeader {
                channel_id: ChannelId(channel_id),
                gpadl_id: GpadlId(handle),
                len: range_len,
                count: 1,
            },
            &data,
        ))?;
        for chunk in rest.chunks(protocol::GpadlBody::MAX_DATA_VALUES) {
            self.root.send_message(&OutgoingMessage::with_data(
                &protocol::GpadlBody {
                    rsvd: 0,
                    gpadl_id: GpadlId(handle),
                },
                chunk.as_bytes(),
            ))?;
        }

        let response = self.root.wait_for_gpadl_response(handle);
        let created = response.expect::<protocol::GpadlCreated>();
        if created.gpadl_id.0 != handle {
            ProtocolViolation::MismatchedResponse {
                message_type: MessageType::GPADL_CREATED,
                field: "gpadl",
                expected: handle,
                actual: created.gpadl_id.0,
            }
            .fail();
        }
        if created.channel_id.0 != channel_id {
            ProtocolViolation::MismatchedResponse {
                message_type: MessageType::GPADL_CREATED,
                field: "channel",
                expected: channel_id,
                actual: created.channel_id.0,
            }
            .fail();
        }
        if created.status != STATUS_SUCCESS {
            tracing::error!(
                channel_id,
                gpadl_id = handle,
                status = created.status,
                "host failed to create gpadl"
            );
            return Err(Error::OutOfResources);
        }
        Ok(())
    }

    /// Tears down the GPADL if it was created and returns the buffer to
    /// guest-private memory.
    pub fn destroy_gpadl(&self, mut gpadl: Gpadl) -> Result<(), Error> {
        let handle = gpadl.handle;
        if handle != 0 {
            if !self.root.is_gpadl_allocated(handle) {
                tracing::error!(gpadl_id = handle, "invalid gpadl handle");
                return Err(Error::InvalidParameter);
            }
            self.root
                .send_message(&OutgoingMessage::new(&protocol::GpadlTeardown {
                    channel_id: ChannelId(self.channel_id()),
                    gpadl_id: GpadlId(handle),
                }))?;
            let torndown = self
                .root
                .wait_for_gpadl_response(handle)
                .expect::<protocol::GpadlTorndown>();
            if torndown.gpadl_id.0 != handle {
                ProtocolViolation::MismatchedResponse {
                    message_type: MessageType::GPADL_TORNDOWN,
                    field: "gpadl",
                    expected: handle,
                    actual: torndown.gpadl_id.0,
                }
                .fail();
            }
            self.root.reclaim_gpadl(handle);
            tracing::debug!(channel_id = self.channel_id(), gpadl_id = handle, "gpadl torn down");
        }
        if let Some(protection) = gpadl.protection.take() {
            self.root.ivm.make_address_range_not_host_visible(protection);
        }
        Ok(())
    }

    /// Opens the channel on the ring buffer described by `ring_gpadl`. The
    /// host-to-guest ring starts `downstream_page_offset` pages in.
    pub fn open_channel(
        &self,
        ring_gpadl: &Gpadl,
        downstream_page_offset: u32,
    ) -> Result<(), Error> {
        let channel_id = self.channel_id();
        let open = protocol::OpenChannel {
            channel_id: ChannelId(channel_id),
            open_id: 0,
            ring_buffer_gpadl_id: GpadlId(ring_gpadl.handle),
            target_vp: self.root.hv.current_vp_index(),
            downstream_ring_buffer_page_offset: downstream_page_offset,
            user_data: Default::default(),
        };
        self.root
            .send_message(&OutgoingMessage::new(&protocol::OpenChannel2::from(open)))?;

        let result = self
            .root
            .wait_for_channel_response(&self.shared)
            .expect::<protocol::OpenResult>();
        if result.channel_id.0 != channel_id {
            ProtocolViolation::MismatchedResponse {
                message_type: MessageType::OPEN_CHANNEL_RESULT,
                field: "channel",
                expected: channel_id,
                actual: result.channel_id.0,
            }
            .fail();
        }
        if result.status != STATUS_SUCCESS as u32 {
            tracing::error!(channel_id, status = result.status, "host failed to open channel");
            return Err(Error::OutOfResources);
        }
        tracing::info!(channel_id, gpadl_id = ring_gpadl.handle, "channel opened");
        Ok(())
    }

    /// Asks the host to close the channel. The host does not reply.
    pub fn close_channel(&self) -> Result<(), Error> {
        tracing::info!(channel_id = self.channel_id(), "closing channel");
        self.root
            .send_message(&OutgoingMessage::new(&protocol::CloseChannel {
                channel_id: ChannelId(self.channel_id()),
            }))
    }

    /// Signals `event` whenever the host signals the channel, or stops
    /// signaling anything with `None`.
    pub fn register_isr(&self, event: Option<Event>) {
        self.root.set_interrupt(self.channel_id(), event);
    }

    /// Signals the host.
    pub fn send_interrupt(&self) -> Result<(), Error> {
        self.root
            .hv
            .signal_event(self.connection_id(), 0)
            .map_err(|err| {
                tracing::error!(
                    channel_id = self.channel_id(),
                    error = &err as &dyn std::error::Error,
                    "failed to signal host"
                );
                Error::Hv(err)
            })
    }
}
