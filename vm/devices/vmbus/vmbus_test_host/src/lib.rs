// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scripted VMBus host for testing the firmware vmbus stack.
//!
//! [`TestHost`] implements the SynIC and page visibility interfaces against
//! simulated guest memory. Control-plane messages posted by the guest are
//! answered synchronously into a per-SynIC mailbox; the replies are delivered
//! one at a time, through the SINT handler, when the dispatcher polls the
//! host as an interrupt source. Opened channels get a [`HostChannel`] with
//! the host ends of the channel's ring buffers.

#![forbid(unsafe_code)]

mod channel;

pub use channel::HostChannel;
pub use channel::HostPacket;
pub use channel::HostPacketKind;

use efi_hv::EfiHv;
use efi_hv::EfiHvIvm;
use efi_hv::HostVisibility;
use efi_hv::HvError;
use efi_hv::HvMessage;
use efi_hv::HvMessageType;
use efi_hv::ProtectionHandle;
use efi_hv::SintHandler;
use efi_hv::SynicEventFlags;
use guestmem::GuestMemory;
use guestmem::PAGE_SIZE;
use guid::Guid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tpl::InterruptSource;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpaRange;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::Version;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// The status a failed open or GPADL creation reports.
pub const STATUS_UNSUCCESSFUL: u32 = 0xc000_0001;

/// How the host answers the guest.
#[derive(Debug, Clone)]
pub struct TestHostConfig {
    /// The protocol versions the host accepts.
    pub versions: Vec<Version>,
    /// The features reported in a Copper version response.
    pub supported_features: FeatureFlags,
    /// The connection state reported for an accepted version.
    pub connection_state: ConnectionState,
    /// The offers sent in response to a request for offers.
    pub offers: Vec<OfferChannel>,
    /// Refuse messages posted to the paravisor's SynIC.
    pub fail_confidential_post: bool,
    /// Refuse every posted message.
    pub refuse_posts: bool,
    /// The status of every GPADL creation.
    pub gpadl_status: i32,
    /// The status of every channel open.
    pub open_status: u32,
    /// Refuse page visibility changes.
    pub fail_visibility: bool,
}

impl Default for TestHostConfig {
    fn default() -> Self {
        Self {
            versions: vec![Version::Copper, Version::Win8_1],
            supported_features: FeatureFlags::new()
                .with_client_id(true)
                .with_confidential_channels(true),
            connection_state: ConnectionState::SUCCESSFUL,
            offers: Vec::new(),
            fail_confidential_post: false,
            refuse_posts: false,
            gpadl_status: protocol::STATUS_SUCCESS,
            open_status: 0,
            fail_visibility: false,
        }
    }
}

/// An initiate contact request received from the guest.
#[derive(Debug, Clone)]
pub struct ContactRequest {
    pub version: u32,
    pub feature_flags: FeatureFlags,
    pub client_id: Option<Guid>,
    pub target_vp: u32,
    pub confidential: bool,
}

/// A GPADL as the host sees it.
#[derive(Debug, Clone)]
pub struct HostGpadl {
    pub channel_id: u32,
    pub range: GpaRange,
    pub pfns: Vec<u64>,
    expected_pfns: usize,
}

impl HostGpadl {
    /// Returns whether every page of the GPADL has arrived.
    pub fn is_complete(&self) -> bool {
        self.pfns.len() == self.expected_pfns
    }

    /// The host-visible address of the first byte.
    pub fn base(&self) -> u64 {
        self.pfns.first().map_or(0, |pfn| pfn * PAGE_SIZE as u64) + self.range.byte_offset as u64
    }
}

/// Builds an offer for `interface_id` on `channel_id`.
pub fn make_offer(interface_id: Guid, channel_id: u32, flags: OfferFlags) -> OfferChannel {
    OfferChannel {
        interface_id,
        instance_id: Guid::new_random(),
        rsvd: [0; 4],
        flags,
        mmio_megabytes: 0,
        user_defined: Default::default(),
        subchannel_index: 0,
        mmio_megabytes_optional: 0,
        channel_id: ChannelId(channel_id),
        monitor_id: 0xff,
        monitor_allocated: 0,
        is_dedicated: 1,
        connection_id: 0x2000 + channel_id,
    }
}

fn read_pfns(data: &[u8]) -> Vec<u64> {
    let mut pfns = vec![0u64; data.len() / 8];
    let len = pfns.len() * 8;
    pfns.as_mut_bytes().copy_from_slice(&data[..len]);
    pfns
}

struct Synic {
    flags: Arc<SynicEventFlags>,
    interrupt_pending: AtomicBool,
    mailbox: Mutex<Mailbox>,
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<HvMessage>,
    slot: Option<HvMessage>,
}

impl Synic {
    fn new() -> Self {
        Self {
            flags: Arc::new(SynicEventFlags::new()),
            interrupt_pending: AtomicBool::new(false),
            mailbox: Mutex::new(Mailbox::default()),
        }
    }

    fn enqueue(&self, message: &OutgoingMessage) {
        let mut mailbox = self.mailbox.lock();
        mailbox
            .queue
            .push_back(HvMessage::new(HvMessageType::VMBUS, 0, message.data()));
        if mailbox.slot.is_none() {
            mailbox.slot = mailbox.queue.pop_front();
            self.interrupt_pending.store(true, Ordering::SeqCst);
        }
    }
}

struct HostState {
    config: TestHostConfig,
    contacts: Vec<ContactRequest>,
    posted: Vec<Vec<u8>>,
    gpadls: HashMap<u32, HostGpadl>,
    channels: HashMap<u32, Arc<HostChannel>>,
    closed: Vec<u32>,
    signals: HashMap<u32, usize>,
    visible: HashMap<u64, (u64, u64)>,
    next_handle: u64,
    connected: Option<Connection>,
    confidential_connection: bool,
    unloaded: bool,
}

#[derive(Debug, Copy, Clone)]
struct Connection {
    confidential: bool,
}

/// A scripted VMBus host. See the crate documentation.
pub struct TestHost {
    this: Weak<TestHost>,
    mem: GuestMemory,
    synics: [Synic; 2],
    handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    state: Mutex<HostState>,
}

impl TestHost {
    /// Creates a host over `mem` that answers as `config` directs.
    pub fn new(mem: GuestMemory, config: TestHostConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            mem,
            synics: [Synic::new(), Synic::new()],
            handler: Mutex::new(None),
            state: Mutex::new(HostState {
                config,
                contacts: Vec::new(),
                posted: Vec::new(),
                gpadls: HashMap::new(),
                channels: HashMap::new(),
                closed: Vec::new(),
                signals: HashMap::new(),
                visible: HashMap::new(),
                next_handle: 1,
                connected: None,
                confidential_connection: false,
                unloaded: false,
            }),
        })
    }

    /// The guest memory the host reaches.
    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    /// Updates the host's configuration.
    pub fn update_config(&self, f: impl FnOnce(&mut TestHostConfig)) {
        f(&mut self.state.lock().config)
    }

    /// Every initiate contact request received, in order.
    pub fn contacts(&self) -> Vec<ContactRequest> {
        self.state.lock().contacts.clone()
    }

    /// The type of every message posted by the guest, in order.
    pub fn posted_types(&self) -> Vec<MessageType> {
        self.state
            .lock()
            .posted
            .iter()
            .filter_map(|data| {
                protocol::MessageHeader::read_from_prefix(data)
                    .ok()
                    .map(|(header, _)| header.message_type())
            })
            .collect()
    }

    /// Every message posted by the guest, in order.
    pub fn posted_messages(&self) -> Vec<Vec<u8>> {
        self.state.lock().posted.clone()
    }

    /// Returns GPADL `gpadl_id`, complete or not.
    pub fn gpadl(&self, gpadl_id: u32) -> Option<HostGpadl> {
        self.state.lock().gpadls.get(&gpadl_id).cloned()
    }

    /// The number of GPADLs the host holds.
    pub fn gpadl_count(&self) -> usize {
        self.state.lock().gpadls.len()
    }

    /// Returns the host side of open channel `channel_id`.
    pub fn channel(&self, channel_id: u32) -> Option<Arc<HostChannel>> {
        self.state.lock().channels.get(&channel_id).cloned()
    }

    /// The channels the guest closed, in order.
    pub fn closed_channels(&self) -> Vec<u32> {
        self.state.lock().closed.clone()
    }

    /// The number of times the guest signaled `connection_id`.
    pub fn signal_count(&self, connection_id: u32) -> usize {
        self.state
            .lock()
            .signals
            .get(&connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// The ranges currently shared with the host, as (base, len), sorted.
    pub fn visible_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<_> = self.state.lock().visible.values().copied().collect();
        ranges.sort();
        ranges
    }

    /// Returns whether the guest's SINT is connected, and whether it was
    /// connected through the paravisor.
    pub fn sint_connection(&self) -> Option<bool> {
        self.state.lock().connected.map(|c| c.confidential)
    }

    /// Returns whether the guest unloaded the connection.
    pub fn unloaded(&self) -> bool {
        self.state.lock().unloaded
    }

    /// Sends an offer outside enumeration, as a hot add.
    pub fn offer_channel(&self, offer: OfferChannel) {
        let confidential = self.state.lock().confidential_connection;
        self.synics[confidential as usize].enqueue(&OutgoingMessage::new(&offer));
    }

    /// Sends an arbitrary message to the guest.
    pub fn send_message(&self, message: OutgoingMessage, confidential: bool) {
        self.synics[confidential as usize].enqueue(&message);
    }

    /// Sets the event flag of `channel_id` and interrupts the guest.
    pub fn signal_guest(&self, channel_id: u32) {
        let synic = &self.synics[0];
        synic.flags.set(channel_id as u16);
        synic.interrupt_pending.store(true, Ordering::SeqCst);
    }

    fn handle_message(
        &self,
        state: &mut HostState,
        data: &[u8],
        confidential: bool,
    ) -> Vec<OutgoingMessage> {
        let message = match Message::parse(data) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "invalid message from guest"
                );
                return Vec::new();
            }
        };
        tracing::trace!(?message, confidential, "host received message");
        match message {
            Message::InitiateContact2(contact, ..) => {
                self.handle_contact(
                    state,
                    contact.initiate_contact,
                    Some(contact.client_id),
                    confidential,
                )
            }
            Message::InitiateContact(contact, ..) => {
                self.handle_contact(state, contact, None, confidential)
            }
            Message::RequestOffers(..) => {
                let mut replies: Vec<_> = state
                    .config
                    .offers
                    .iter()
                    .map(OutgoingMessage::new)
                    .collect();
                replies.push(OutgoingMessage::new(&protocol::AllOffersDelivered {}));
                replies
            }
            Message::GpadlHeader(header, data) => {
                let Ok((range, pfns)) = GpaRange::read_from_prefix(data) else {
                    tracing::warn!("gpadl header without a range");
                    return Vec::new();
                };
                let gpadl = HostGpadl {
                    channel_id: header.channel_id.0,
                    range,
                    pfns: read_pfns(pfns),
                    expected_pfns: (header.len as usize).saturating_sub(8) / 8,
                };
                state.gpadls.insert(header.gpadl_id.0, gpadl);
                Self::gpadl_progress(state, header.gpadl_id.0)
            }
            Message::GpadlBody(body, data) => {
                let Some(gpadl) = state.gpadls.get_mut(&body.gpadl_id.0) else {
                    tracing::warn!(gpadl_id = body.gpadl_id.0, "body for unknown gpadl");
                    return Vec::new();
                };
                gpadl.pfns.extend(read_pfns(data));
                Self::gpadl_progress(state, body.gpadl_id.0)
            }
            Message::GpadlTeardown(teardown, ..) => {
                state.gpadls.remove(&teardown.gpadl_id.0);
                vec![OutgoingMessage::new(&protocol::GpadlTorndown {
                    gpadl_id: teardown.gpadl_id,
                })]
            }
            Message::OpenChannel2(open, ..) => self.handle_open(state, open.open_channel),
            Message::OpenChannel(open, ..) => self.handle_open(state, open),
            Message::CloseChannel(close, ..) => {
                state.channels.remove(&close.channel_id.0);
                state.closed.push(close.channel_id.0);
                Vec::new()
            }
            Message::Unload(..) => {
                state.unloaded = true;
                vec![OutgoingMessage::new(&protocol::UnloadComplete {})]
            }
            message => {
                tracing::warn!(?message, "unexpected message from guest");
                Vec::new()
            }
        }
    }

    fn handle_contact(
        &self,
        state: &mut HostState,
        contact: protocol::InitiateContact,
        client_id: Option<Guid>,
        confidential: bool,
    ) -> Vec<OutgoingMessage> {
        let target_info = protocol::TargetInfo::from(contact.interrupt_page_or_target_info);
        state.contacts.push(ContactRequest {
            version: contact.version_requested,
            feature_flags: target_info.feature_flags().into(),
            client_id,
            target_vp: contact.target_message_vp,
            confidential,
        });
        state.confidential_connection = confidential;

        let accepted = state
            .config
            .versions
            .iter()
            .find(|&&v| v as u32 == contact.version_requested)
            .copied();

        let mut response = protocol::VersionResponse {
            version_supported: 0,
            connection_state: ConnectionState::SUCCESSFUL,
            padding: 0,
            selected_version_or_connection_id: 0,
        };
        match accepted {
            Some(version) => {
                response.version_supported = 1;
                response.connection_state = state.config.connection_state;
                if version.has_client_id() {
                    vec![OutgoingMessage::new(&protocol::VersionResponse2 {
                        version_response: response,
                        supported_features: state.config.supported_features.into(),
                    })]
                } else {
                    vec![OutgoingMessage::new(&response)]
                }
            }
            None => vec![OutgoingMessage::new(&response)],
        }
    }

    fn gpadl_progress(state: &mut HostState, gpadl_id: u32) -> Vec<OutgoingMessage> {
        let gpadl = &state.gpadls[&gpadl_id];
        if !gpadl.is_complete() {
            return Vec::new();
        }
        let channel_id = gpadl.channel_id;
        let status = state.config.gpadl_status;
        if status != protocol::STATUS_SUCCESS {
            state.gpadls.remove(&gpadl_id);
        }
        vec![OutgoingMessage::new(&protocol::GpadlCreated {
            channel_id: ChannelId(channel_id),
            gpadl_id: protocol::GpadlId(gpadl_id),
            status,
        })]
    }

    fn handle_open(
        &self,
        state: &mut HostState,
        open: protocol::OpenChannel,
    ) -> Vec<OutgoingMessage> {
        let mut status = state.config.open_status;
        if status == 0 {
            let channel = state
                .gpadls
                .get(&open.ring_buffer_gpadl_id.0)
                .filter(|gpadl| gpadl.is_complete() && gpadl.channel_id == open.channel_id.0)
                .ok_or_else(|| anyhow::anyhow!("invalid ring gpadl"))
                .and_then(|gpadl| {
                    HostChannel::new(
                        open.channel_id.0,
                        self.this.clone(),
                        self.mem.clone(),
                        gpadl,
                        open.downstream_ring_buffer_page_offset,
                    )
                });
            match channel {
                Ok(channel) => {
                    state.channels.insert(open.channel_id.0, Arc::new(channel));
                }
                Err(err) => {
                    tracing::warn!(
                        channel_id = open.channel_id.0,
                        error = err.as_ref() as &dyn std::error::Error,
                        "failed to open channel"
                    );
                    status = STATUS_UNSUCCESSFUL;
                }
            }
        }
        vec![OutgoingMessage::new(&protocol::OpenResult {
            channel_id: open.channel_id,
            open_id: open.open_id,
            status,
        })]
    }
}

impl EfiHv for TestHost {
    fn connect_sint(
        &self,
        sint: u8,
        vector: u8,
        confidential: bool,
        handler: SintHandler,
    ) -> Result<(), HvError> {
        tracing::debug!(sint, vector, confidential, "sint connected");
        self.state.lock().connected = Some(Connection { confidential });
        *self.handler.lock() = Some(Arc::from(handler));
        Ok(())
    }

    fn disconnect_sint(&self, sint: u8) {
        tracing::debug!(sint, "sint disconnected");
        self.state.lock().connected = None;
        *self.handler.lock() = None;
    }

    fn get_sint_message(&self, _sint: u8, confidential: bool) -> Option<HvMessage> {
        self.synics[confidential as usize].mailbox.lock().slot
    }

    fn complete_sint_message(&self, _sint: u8, confidential: bool) -> Result<(), HvError> {
        let synic = &self.synics[confidential as usize];
        let mut mailbox = synic.mailbox.lock();
        mailbox.slot = mailbox.queue.pop_front();
        if mailbox.slot.is_some() {
            synic.interrupt_pending.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn sint_event_flags(&self, _sint: u8, confidential: bool) -> Arc<SynicEventFlags> {
        self.synics[confidential as usize].flags.clone()
    }

    fn current_vp_index(&self) -> u32 {
        0
    }

    fn post_message(
        &self,
        connection_id: u32,
        message_type: HvMessageType,
        payload: &[u8],
        confidential: bool,
    ) -> Result<(), HvError> {
        if connection_id != protocol::VMBUS_MESSAGE_CONNECTION_ID
            || message_type != HvMessageType::VMBUS
            || payload.len() > protocol::MAX_MESSAGE_SIZE
        {
            return Err(HvError::InvalidParameter);
        }
        let replies = {
            let mut state = self.state.lock();
            if state.config.refuse_posts
                || (confidential && state.config.fail_confidential_post)
            {
                return Err(HvError::AccessDenied);
            }
            state.posted.push(payload.to_vec());
            self.handle_message(&mut state, payload, confidential)
        };
        for reply in &replies {
            self.synics[confidential as usize].enqueue(reply);
        }
        Ok(())
    }

    fn signal_event(&self, connection_id: u32, _flag_number: u16) -> Result<(), HvError> {
        *self.state.lock().signals.entry(connection_id).or_default() += 1;
        Ok(())
    }
}

impl EfiHvIvm for TestHost {
    fn make_address_range_host_visible(
        &self,
        visibility: HostVisibility,
        base: u64,
        len: u64,
        zero_pages: bool,
    ) -> Result<ProtectionHandle, HvError> {
        let mut state = self.state.lock();
        if state.config.fail_visibility {
            return Err(HvError::OutOfResources);
        }
        if visibility != HostVisibility::READ_WRITE
            || base % PAGE_SIZE as u64 != 0
            || len % PAGE_SIZE as u64 != 0
            || len == 0
        {
            return Err(HvError::InvalidParameter);
        }
        if zero_pages {
            self.mem
                .fill_at(base, 0, len as usize)
                .map_err(|_| HvError::InvalidParameter)?;
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.visible.insert(handle, (base, len));
        Ok(ProtectionHandle::new(handle))
    }

    fn make_address_range_not_host_visible(&self, handle: ProtectionHandle) {
        if self.state.lock().visible.remove(&handle.value()).is_none() {
            panic!("unknown protection handle {}", handle.value());
        }
    }
}

impl InterruptSource for TestHost {
    fn poll_interrupts(&self) -> bool {
        let Some(handler) = self.handler.lock().clone() else {
            return false;
        };
        let mut pending = false;
        for synic in &self.synics {
            pending |= synic.interrupt_pending.swap(false, Ordering::SeqCst);
        }
        if pending {
            handler();
        }
        pending
    }
}
