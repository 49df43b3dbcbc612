// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The firmware's VMBus root.
//!
//! [`VmbusRoot`] connects to the host over a SynIC SINT, negotiates the
//! protocol version, enumerates the host's channel offers and then routes
//! incoming SynIC messages and event flags to the channels and GPADLs waiting
//! for them. Each allowed offer becomes a [`Channel`], which carries the
//! per-channel half of the protocol: GPADL creation and teardown, channel
//! open and close, and interrupt registration.
//!
//! Host input that violates the protocol is not recoverable; see
//! [`ProtocolViolation`].

#![forbid(unsafe_code)]

mod channel;

pub use channel::Channel;
pub use channel::Gpadl;
pub use channel::GpadlFlags;

use channel::ChannelShared;
use efi_hv::EfiHv;
use efi_hv::EfiHvIvm;
use efi_hv::HvError;
use efi_hv::HvMessage;
use efi_hv::HvMessageType;
use efi_hv::IsolationConfig;
use efi_hv::SynicEventFlags;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use guid::Guid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;
use tpl::Dispatcher;
use tpl::Event;
use tpl::NotifyFn;
use tpl::TPL_VMBUS;
use tpl::Tpl;
use vmbus_core::OutgoingMessage;
use vmbus_core::VersionInfo;
use vmbus_core::protocol;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::HEADER_SIZE;
use vmbus_core::protocol::MAX_MESSAGE_SIZE;
use vmbus_core::protocol::MessageHeader;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::TargetInfo;
use vmbus_core::protocol::Version;
use vmbus_core::protocol::VmbusMessage;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The number of GPADL handles. Handle zero is never issued.
pub const MAX_GPADLS: usize = 256;

/// The number of channel IDs the root tracks.
pub const MAX_CHANNELS: usize = 2048;

/// The client ID the firmware identifies itself with by default.
pub const DEFAULT_CLIENT_ID: Guid = guid::guid!("3e2a5c0b-6d1f-4b7e-9c84-0f1d2e3a4b5c");

/// Interface IDs of the channels the firmware drives.
pub mod interface {
    use guid::Guid;

    /// Synthetic SCSI.
    pub const STORVSC: Guid = guid::guid!("ba6163d9-04a1-4d29-b605-72e2ffb1dc7f");
    /// Synthetic network.
    pub const NETVSC: Guid = guid::guid!("f8615163-df3e-46c5-913f-f2d2f965ed0e");
    /// Virtual PCI.
    pub const VPCI: Guid = guid::guid!("44c4f61d-4444-4400-9d52-802e27ede19f");
    /// Synthetic video.
    pub const VIDEO: Guid = guid::guid!("da0a7802-e377-4aac-8e77-0558eb1073f8");
    /// The VMBus file system used for IMC.
    pub const VMBFS: Guid = guid::guid!("c376c1c3-d276-48d2-90a9-c04748072c60");
    /// Synthetic keyboard.
    pub const SYNTHETIC_KEYBOARD: Guid = guid::guid!("f912ad6d-2b17-48ea-bd65-f927a61c7684");
}

struct AllowedChannel {
    interface_id: Guid,
    allowed_when_isolated: bool,
}

/// Channels surfaced during boot. Only channels that went through security
/// review are allowed on isolated VMs.
const ALLOWED_CHANNELS: &[AllowedChannel] = &[
    AllowedChannel {
        interface_id: interface::STORVSC,
        allowed_when_isolated: true,
    },
    AllowedChannel {
        interface_id: interface::NETVSC,
        allowed_when_isolated: true,
    },
    AllowedChannel {
        interface_id: interface::VPCI,
        allowed_when_isolated: true,
    },
    AllowedChannel {
        interface_id: interface::VIDEO,
        allowed_when_isolated: false,
    },
    AllowedChannel {
        interface_id: interface::VMBFS,
        allowed_when_isolated: false,
    },
    AllowedChannel {
        interface_id: interface::SYNTHETIC_KEYBOARD,
        allowed_when_isolated: false,
    },
];

/// Returns whether an offer for `interface_id` becomes a channel during boot.
///
/// `enable_imc_when_isolated` additionally allows the vmbfs channel on an
/// isolated VM.
pub fn is_channel_allowed(
    interface_id: &Guid,
    isolated: bool,
    enable_imc_when_isolated: bool,
) -> bool {
    ALLOWED_CHANNELS
        .iter()
        .filter(|entry| !isolated || entry.allowed_when_isolated)
        .any(|entry| entry.interface_id == *interface_id)
        || (isolated && enable_imc_when_isolated && *interface_id == interface::VMBFS)
}

/// Configuration for [`VmbusRoot`].
#[derive(Debug, Clone)]
pub struct VmbusRootConfig {
    /// The SINT used for VMBus messages and events.
    pub sint: u8,
    /// The interrupt vector of the SINT.
    pub vector: u8,
    /// The client ID sent when initiating contact.
    pub client_id: Guid,
    /// Allow the vmbfs (IMC) channel on isolated VMs.
    pub enable_imc_when_isolated: bool,
    /// The protocol versions to request, newest first.
    pub versions: Vec<Version>,
}

impl Default for VmbusRootConfig {
    fn default() -> Self {
        Self {
            sint: 2,
            vector: 0x8f,
            client_id: DEFAULT_CLIENT_ID,
            enable_imc_when_isolated: false,
            // The firmware uses nothing from the versions in between.
            versions: vec![Version::Copper, Version::Win8_1],
        }
    }
}

/// The connection state of the root.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RootState {
    /// Not connected.
    Disconnected,
    /// Connecting the SINT.
    SintConnecting,
    /// The SINT is connected.
    SintConnected,
    /// Negotiating the protocol version.
    ContactNegotiating,
    /// A version was accepted.
    Contacted,
    /// Receiving offers.
    EnumeratingOffers,
    /// Every initial offer was received.
    OffersDelivered,
    /// Starting failed.
    Failed,
}

/// A recoverable vmbus root error.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter was invalid.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The host or the firmware ran out of resources.
    #[error("out of resources")]
    OutOfResources,
    /// Every GPADL handle is in use.
    #[error("no free gpadl handle")]
    GpadlTableFull,
    /// The host accepted the version but refused the connection.
    #[error("connection failed: {0:?}")]
    ConnectionFailed(ConnectionState),
    /// The host supports none of the requested versions.
    #[error("no supported vmbus version")]
    UnsupportedVersion,
    /// The host sent an unexpected message during enumeration.
    #[error("unexpected message {message_type:?} of {size} bytes")]
    Protocol {
        /// The type of the message.
        message_type: MessageType,
        /// The size of the message.
        size: usize,
    },
    /// A hypervisor call failed.
    #[error("hypervisor error")]
    Hv(#[from] HvError),
    /// Guest memory could not be accessed.
    #[error("guest memory error")]
    Memory(#[from] GuestMemoryError),
}

/// Host behavior that violates the VMBus protocol.
///
/// A host that breaks the protocol cannot be trusted to cooperate with a
/// retry, so these are never returned to callers: [`ProtocolViolation::fail`]
/// logs the violation and terminates.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    /// A SynIC message on the VMBus SINT was not a VMBus message.
    #[error("synic message type {0:?} is not a vmbus message")]
    NotVmbusMessage(HvMessageType),
    /// The declared message size exceeds the SynIC payload.
    #[error("message size {0} exceeds the synic payload")]
    MessageTooLarge(usize),
    /// A channel ID is outside the channel table.
    #[error("channel id {0} is out of range")]
    ChannelOutOfRange(u32),
    /// A message targets a channel that does not exist.
    #[error("channel {0} does not exist")]
    UnknownChannel(u32),
    /// A channel ID was offered twice.
    #[error("channel {0} was already offered")]
    DuplicateOffer(u32),
    /// A GPADL handle is outside the GPADL table.
    #[error("gpadl {0} is out of range")]
    GpadlOutOfRange(u32),
    /// A message targets a GPADL handle that is not allocated.
    #[error("gpadl {0} is not allocated")]
    UnknownGpadl(u32),
    /// An offer arrived with the wrong size or type.
    #[error("invalid offer: {message_type:?} of {size} bytes")]
    InvalidOffer {
        /// The type of the message.
        message_type: MessageType,
        /// The size of the message.
        size: usize,
    },
    /// A version response is too short for the requested version.
    #[error("version response of {0} bytes is too short")]
    ShortVersionResponse(usize),
    /// A response has the wrong type or size.
    #[error("expected {expected:?}, received {message_type:?} of {size} bytes")]
    UnexpectedResponse {
        /// The response that was expected.
        expected: MessageType,
        /// The type of the message.
        message_type: MessageType,
        /// The size of the message.
        size: usize,
    },
    /// A response names a different channel or GPADL than the request.
    #[error("{message_type:?} for {field} {actual}, expected {expected}")]
    MismatchedResponse {
        /// The type of the message.
        message_type: MessageType,
        /// The mismatched field.
        field: &'static str,
        /// The value sent.
        expected: u32,
        /// The value received.
        actual: u32,
    },
}

impl ProtocolViolation {
    /// Logs the violation and terminates.
    #[track_caller]
    pub fn fail(self) -> ! {
        tracing::error!(
            error = &self as &dyn std::error::Error,
            "host violated the vmbus protocol"
        );
        panic!("host violated the vmbus protocol: {self}");
    }
}

/// A message copied out of the SINT message slot.
#[derive(Copy, Clone)]
pub(crate) struct ReceivedMessage {
    size: usize,
    data: [u8; MAX_MESSAGE_SIZE],
}

impl Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message_type", &self.message_type())
            .field("size", &self.size)
            .finish()
    }
}

impl ReceivedMessage {
    /// Copies `message` out of the slot, failing on an oversized or non-VMBus
    /// message. The size is read once.
    fn new(message: &HvMessage) -> Self {
        if message.header.typ != HvMessageType::VMBUS {
            ProtocolViolation::NotVmbusMessage(message.header.typ).fail();
        }
        let size = message.payload_size();
        if size > MAX_MESSAGE_SIZE {
            ProtocolViolation::MessageTooLarge(size).fail();
        }
        let mut data = [0; MAX_MESSAGE_SIZE];
        data[..size].copy_from_slice(&message.payload_buffer[..size]);
        Self { size, data }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn read_at<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut value = T::new_zeroed();
        let len = size_of::<T>();
        value
            .as_mut_bytes()
            .copy_from_slice(&self.data[offset..offset + len]);
        value
    }

    pub(crate) fn message_type(&self) -> MessageType {
        self.read_at::<MessageHeader>(0).message_type()
    }

    /// Reads the message body as `T`. Bytes past the message size read as
    /// zero.
    pub(crate) fn body<T: FromBytes + IntoBytes + VmbusMessage>(&self) -> T {
        self.read_at(HEADER_SIZE)
    }

    /// Fails unless the message is exactly a `T`.
    pub(crate) fn expect<T: FromBytes + IntoBytes + VmbusMessage>(&self) -> T {
        if self.message_type() != T::MESSAGE_TYPE || self.size != T::MESSAGE_SIZE {
            ProtocolViolation::UnexpectedResponse {
                expected: T::MESSAGE_TYPE,
                message_type: self.message_type(),
                size: self.size,
            }
            .fail();
        }
        self.body()
    }
}

struct GpadlSlot {
    /// Signaled when a response arrives. Its presence marks the handle taken.
    event: Event,
    response: Option<ReceivedMessage>,
}

struct ChannelSlot {
    channel: Arc<ChannelShared>,
    interrupt: Option<Event>,
    response: Option<ReceivedMessage>,
}

struct SharedState {
    state: RootState,
    confidential: bool,
    confidential_refused: bool,
    sint_connected: bool,
    contact_initiated: bool,
    offers_delivered: bool,
    version: Option<VersionInfo>,
    gpadls: Vec<Option<GpadlSlot>>,
    channels: Vec<Option<ChannelSlot>>,
    max_interrupt_used: usize,
    hot_messages: VecDeque<OfferChannel>,
}

type HotAddHandler = Arc<dyn Fn(Channel) + Send + Sync>;

pub(crate) struct RootInner {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) hv: Arc<dyn EfiHv>,
    pub(crate) ivm: Arc<dyn EfiHvIvm>,
    pub(crate) mem: GuestMemory,
    pub(crate) isolation: IsolationConfig,
    config: VmbusRootConfig,
    wait_for_message: Event,
    hot_event: Event,
    hot_allocation_event: Event,
    sint_event: Event,
    hot_add_handler: Mutex<Option<HotAddHandler>>,
    state: Mutex<SharedState>,
}

/// The VMBus root. See the crate documentation.
pub struct VmbusRoot {
    inner: Arc<RootInner>,
}

impl Debug for VmbusRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("VmbusRoot")
            .field("state", &state.state)
            .field("confidential", &state.confidential)
            .field("version", &state.version)
            .finish()
    }
}

impl VmbusRoot {
    /// Creates a disconnected root.
    pub fn new(
        dispatcher: Dispatcher,
        hv: Arc<dyn EfiHv>,
        ivm: Arc<dyn EfiHvIvm>,
        mem: GuestMemory,
        isolation: IsolationConfig,
        config: VmbusRootConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<RootInner>| {
            let notify = |f: fn(&Arc<RootInner>)| -> NotifyFn {
                let this = this.clone();
                Box::new(move || {
                    if let Some(root) = this.upgrade() {
                        f(&root)
                    }
                })
            };
            RootInner {
                wait_for_message: dispatcher.create_event(Tpl::APPLICATION, None),
                // The lowest notification level, so channels created by hot
                // add can be started from the handler.
                hot_event: dispatcher
                    .create_event(Tpl::APPLICATION.above(1), Some(notify(RootInner::hot_add))),
                // The highest level that may allocate.
                hot_allocation_event: dispatcher
                    .create_event(Tpl::NOTIFY, Some(notify(RootInner::hot_add_allocation))),
                sint_event: dispatcher
                    .create_event(TPL_VMBUS, Some(notify(RootInner::sint_notify))),
                dispatcher,
                hv,
                ivm,
                mem,
                isolation,
                config,
                hot_add_handler: Mutex::new(None),
                state: Mutex::new(SharedState {
                    state: RootState::Disconnected,
                    confidential: false,
                    confidential_refused: false,
                    sint_connected: false,
                    contact_initiated: false,
                    offers_delivered: false,
                    version: None,
                    gpadls: (0..MAX_GPADLS).map(|_| None).collect(),
                    channels: (0..MAX_CHANNELS).map(|_| None).collect(),
                    max_interrupt_used: 0,
                    hot_messages: VecDeque::new(),
                }),
            }
        });
        Self { inner }
    }

    /// Connects to the host and creates a channel for every allowed offer.
    ///
    /// On failure everything acquired is released and the root is left in
    /// [`RootState::Failed`].
    pub fn start(&self) -> Result<(), Error> {
        let result = self.inner.start();
        if let Err(err) = &result {
            tracing::error!(
                error = err as &dyn std::error::Error,
                "failed to start the vmbus root"
            );
            self.inner.destroy_context();
            self.inner.state.lock().state = RootState::Failed;
        }
        result
    }

    /// Unloads the connection, disconnects the SINT and destroys every
    /// channel. GPADLs that were never torn down are logged and reclaimed.
    pub fn stop(&self) {
        self.inner.destroy_context();
    }

    /// Destroys the given child channels, leaving the connection up.
    pub fn stop_children(&self, channel_ids: &[u32]) {
        for &channel_id in channel_ids {
            if !self.inner.destroy_channel(channel_id) {
                tracing::warn!(channel_id, "stop requested for an unknown channel");
            }
        }
    }

    /// Unloads the connection when the OS takes over. GPADLs still allocated
    /// at this point leak into the OS and are logged.
    pub fn exit_boot_services(&self) {
        let (orphaned, contact_initiated) = {
            let state = self.inner.state.lock();
            let orphaned: Vec<usize> = state
                .gpadls
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.is_some())
                .map(|(i, _)| i)
                .collect();
            (orphaned, state.contact_initiated)
        };
        for gpadl_id in &orphaned {
            tracing::warn!(gpadl_id, "gpadl not cleaned up");
        }
        tracing::warn!(
            orphaned = orphaned.len(),
            isolation = ?self.inner.isolation.isolation,
            "orphaned gpadls at exit boot services"
        );
        if contact_initiated {
            self.inner.send_unload();
            let mut state = self.inner.state.lock();
            state.contact_initiated = false;
            state.offers_delivered = false;
        }
    }

    /// Registers a function called with every channel created by a hot add.
    pub fn set_hot_add_handler(&self, handler: impl Fn(Channel) + Send + Sync + 'static) {
        *self.inner.hot_add_handler.lock() = Some(Arc::new(handler));
    }

    /// The connection state.
    pub fn state(&self) -> RootState {
        self.inner.state.lock().state
    }

    /// The negotiated version and features.
    pub fn version(&self) -> Option<VersionInfo> {
        self.inner.state.lock().version
    }

    /// Whether the control plane goes through the paravisor.
    pub fn is_confidential(&self) -> bool {
        self.inner.confidential()
    }

    /// Returns channel `channel_id`.
    pub fn channel(&self, channel_id: u32) -> Option<Channel> {
        let state = self.inner.state.lock();
        state
            .channels
            .get(channel_id as usize)?
            .as_ref()
            .map(|slot| Channel::new(self.inner.clone(), slot.channel.clone()))
    }

    /// Returns every channel, ordered by channel ID.
    pub fn channels(&self) -> Vec<Channel> {
        let state = self.inner.state.lock();
        state
            .channels
            .iter()
            .flatten()
            .map(|slot| Channel::new(self.inner.clone(), slot.channel.clone()))
            .collect()
    }

    /// The number of allocated GPADL handles.
    pub fn gpadl_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .gpadls
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

impl RootInner {
    fn confidential(&self) -> bool {
        self.state.lock().confidential
    }

    fn set_state(&self, state: RootState) {
        self.state.lock().state = state;
    }

    pub(crate) fn feature_flags(&self) -> FeatureFlags {
        self.state
            .lock()
            .version
            .map_or(FeatureFlags::new(), |v| v.feature_flags)
    }

    fn start(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            assert!(!state.sint_connected, "vmbus root started twice");
            state.confidential = self.isolation.is_hardware_isolated()
                && self.isolation.paravisor_present
                && !state.confidential_refused;
            state.state = RootState::SintConnecting;
        }
        self.connect_sint(false)?;
        {
            let mut state = self.state.lock();
            state.sint_connected = true;
            state.state = RootState::ContactNegotiating;
        }
        let version = self.negotiate_version()?;
        {
            let mut state = self.state.lock();
            state.version = Some(version);
            state.state = RootState::Contacted;
        }
        self.enumerate_children()?;
        self.set_state(RootState::OffersDelivered);
        Ok(())
    }

    fn connect_sint(&self, reconnect: bool) -> Result<(), Error> {
        let sint = self.config.sint;
        // On fallback from a confidential connection the SINT is still
        // connected.
        if reconnect {
            self.hv.disconnect_sint(sint);
        }
        let confidential = self.confidential();
        let event = self.sint_event.clone();
        self.hv
            .connect_sint(
                sint,
                self.config.vector,
                confidential,
                Box::new(move || event.signal()),
            )
            .map_err(|err| {
                tracing::error!(
                    sint,
                    confidential,
                    error = &err as &dyn std::error::Error,
                    "failed to connect sint"
                );
                Error::Hv(err)
            })?;
        tracing::debug!(sint, confidential, "sint connected");
        Ok(())
    }

    /// Posts `message` to the host, retrying while the host queue is full.
    pub(crate) fn send_message(&self, message: &OutgoingMessage) -> Result<(), Error> {
        let confidential = self.confidential();
        loop {
            match self.hv.post_message(
                protocol::VMBUS_MESSAGE_CONNECTION_ID,
                HvMessageType::VMBUS,
                message.data(),
                confidential,
            ) {
                Ok(()) => return Ok(()),
                Err(HvError::NotReady) => std::hint::spin_loop(),
                Err(err) => {
                    tracing::error!(
                        confidential,
                        error = &err as &dyn std::error::Error,
                        "failed to send vmbus message"
                    );
                    return Err(err.into());
                }
            }
        }
    }

    /// Waits for a message addressed to the root and takes it out of the
    /// slot. With `poll`, spins on the slot instead of waiting for the
    /// dispatcher.
    fn wait_for_message(&self, poll: bool) -> ReceivedMessage {
        // Hot add runs at NOTIFY and would block every message behind it.
        assert!(
            self.dispatcher.current() < Tpl::NOTIFY,
            "waiting for a vmbus message at {:?}",
            self.dispatcher.current()
        );
        let sint = self.config.sint;
        loop {
            if !poll {
                self.dispatcher.wait_for_event(&self.wait_for_message);
            }
            let confidential = self.confidential();
            if let Some(message) = self.hv.get_sint_message(sint, confidential) {
                let message = ReceivedMessage::new(&message);
                if let Err(err) = self.hv.complete_sint_message(sint, confidential) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to complete sint message"
                    );
                }
                return message;
            }
            std::hint::spin_loop();
        }
    }

    fn negotiate_version(&self) -> Result<VersionInfo, Error> {
        for &version in &self.config.versions {
            match self.initiate_contact(version)? {
                Some(info) => {
                    tracing::info!(
                        ?version,
                        feature_flags = ?info.feature_flags,
                        "negotiated vmbus version"
                    );
                    return Ok(info);
                }
                None => {
                    tracing::warn!(?version, "host did not support vmbus version");
                }
            }
        }
        Err(Error::UnsupportedVersion)
    }

    /// Requests `version`. Returns `None` if the host does not support it.
    fn initiate_contact(&self, version: Version) -> Result<Option<VersionInfo>, Error> {
        let mut feature_flags = FeatureFlags::new();
        if version.has_client_id() {
            feature_flags.set_client_id(true);
            if self.confidential() {
                feature_flags.set_confidential_channels(true);
            }
        }

        let target_message_vp = self.hv.current_vp_index();
        let build = |feature_flags: FeatureFlags| {
            let contact = protocol::InitiateContact {
                version_requested: version as u32,
                target_message_vp,
                interrupt_page_or_target_info: TargetInfo::new()
                    .with_feature_flags(feature_flags.into())
                    .into(),
                parent_to_child_monitor_page_gpa: 0,
                child_to_parent_monitor_page_gpa: 0,
            };
            if version.has_client_id() {
                OutgoingMessage::new(&protocol::InitiateContact2 {
                    initiate_contact: contact,
                    client_id: self.config.client_id,
                })
            } else {
                OutgoingMessage::new(&contact)
            }
        };

        if let Err(err) = self.send_message(&build(feature_flags)) {
            if !self.confidential() {
                return Err(err);
            }
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "retrying without the confidential control plane"
            );
            {
                let mut state = self.state.lock();
                state.confidential = false;
                state.confidential_refused = true;
            }
            self.connect_sint(true)?;
            feature_flags.set_confidential_channels(false);
            self.send_message(&build(feature_flags))?;
        }

        // Messages left over from an earlier connection may precede the
        // response.
        let response = loop {
            let message = self.wait_for_message(false);
            if message.message_type() == MessageType::VERSION_RESPONSE {
                break message;
            }
            tracing::debug!(?message, "discarding message before version response");
        };

        if response.size() < protocol::VersionResponse::MESSAGE_SIZE {
            ProtocolViolation::ShortVersionResponse(response.size()).fail();
        }
        let version_response = response.body::<protocol::VersionResponse>();
        if version_response.version_supported == 0 {
            return Ok(None);
        }
        if version_response.connection_state != ConnectionState::SUCCESSFUL {
            tracing::error!(
                ?version,
                connection_state = ?version_response.connection_state,
                "host refused the connection"
            );
            return Err(Error::ConnectionFailed(version_response.connection_state));
        }

        self.state.lock().contact_initiated = true;
        if version.has_client_id() {
            if response.size() < protocol::VersionResponse2::MESSAGE_SIZE {
                ProtocolViolation::ShortVersionResponse(response.size()).fail();
            }
            let response = response.body::<protocol::VersionResponse2>();
            feature_flags &= FeatureFlags::from(response.supported_features);
        }

        Ok(Some(VersionInfo {
            version,
            feature_flags,
        }))
    }

    fn send_unload(&self) {
        // A host that refused the unload never sends unload complete, so
        // waiting for it would spin forever.
        if self
            .send_message(&OutgoingMessage::new(&protocol::Unload {}))
            .is_err()
        {
            tracing::warn!("unload refused, not waiting for unload complete");
            return;
        }
        // Everything before the unload response is ignored.
        let response = loop {
            let message = self.wait_for_message(true);
            if message.message_type() == MessageType::UNLOAD_COMPLETE {
                break message;
            }
        };
        response.expect::<protocol::UnloadComplete>();
        tracing::info!("vmbus connection unloaded");
    }

    fn enumerate_children(self: &Arc<Self>) -> Result<(), Error> {
        self.set_state(RootState::EnumeratingOffers);
        self.send_message(&OutgoingMessage::new(&protocol::RequestOffers {}))?;
        loop {
            let message = self.wait_for_message(false);
            let message_type = message.message_type();
            if message.size() == protocol::AllOffersDelivered::MESSAGE_SIZE
                && message_type == MessageType::ALL_OFFERS_DELIVERED
            {
                break;
            }
            if message.size() != OfferChannel::MESSAGE_SIZE
                || message_type != MessageType::OFFER_CHANNEL
            {
                tracing::error!(?message, "unexpected message during offer enumeration");
                return Err(Error::Protocol {
                    message_type,
                    size: message.size(),
                });
            }
            let offer = message.body::<OfferChannel>();
            self.validate_offer(&offer);
            if self.is_offer_allowed(&offer) {
                self.create_channel(&offer);
            }
        }

        let channels = {
            let mut state = self.state.lock();
            state.offers_delivered = true;
            state.channels.iter().flatten().count()
        };
        tracing::info!(channels, "all offers delivered");
        Ok(())
    }

    /// Fails on an offer whose channel ID is out of range or in use.
    fn validate_offer(&self, offer: &OfferChannel) {
        let channel_id = offer.channel_id.0;
        if channel_id as usize >= MAX_CHANNELS {
            ProtocolViolation::ChannelOutOfRange(channel_id).fail();
        }
        if self.state.lock().channels[channel_id as usize].is_some() {
            ProtocolViolation::DuplicateOffer(channel_id).fail();
        }
    }

    fn is_offer_allowed(&self, offer: &OfferChannel) -> bool {
        let allowed = is_channel_allowed(
            &offer.interface_id,
            self.isolation.is_isolated(),
            self.config.enable_imc_when_isolated,
        );
        if allowed {
            tracing::debug!(
                channel_id = offer.channel_id.0,
                interface_id = %offer.interface_id,
                "channel allowed during boot"
            );
        } else {
            tracing::warn!(
                channel_id = offer.channel_id.0,
                interface_id = %offer.interface_id,
                "channel not allowed during boot"
            );
        }
        allowed
    }

    fn create_channel(self: &Arc<Self>, offer: &OfferChannel) -> Channel {
        let shared = Arc::new(ChannelShared::new(
            &self.dispatcher,
            *offer,
            self.feature_flags(),
        ));
        let channel_id = offer.channel_id.0;
        let duplicate = {
            let _tpl = self.dispatcher.raise(Tpl::HIGH_LEVEL);
            let mut state = self.state.lock();
            let slot = &mut state.channels[channel_id as usize];
            if slot.is_some() {
                true
            } else {
                *slot = Some(ChannelSlot {
                    channel: shared.clone(),
                    interrupt: None,
                    response: None,
                });
                false
            }
        };
        // Offers are validated on arrival, but the same ID can still arrive
        // twice before either becomes a channel.
        if duplicate {
            ProtocolViolation::DuplicateOffer(channel_id).fail();
        }
        tracing::info!(
            channel_id,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            confidential = shared.confidential_ring_buffer,
            "channel created"
        );
        Channel::new(self.clone(), shared)
    }

    /// Removes channel `channel_id`. Returns false if it does not exist.
    fn destroy_channel(&self, channel_id: u32) -> bool {
        let slot = {
            let _tpl = self.dispatcher.raise(Tpl::HIGH_LEVEL);
            let mut state = self.state.lock();
            state
                .channels
                .get_mut(channel_id as usize)
                .and_then(Option::take)
        };
        match slot {
            Some(slot) => {
                tracing::info!(channel_id, "channel destroyed");
                slot.channel.response_event.close();
                true
            }
            None => false,
        }
    }

    fn destroy_context(&self) {
        let (contact_initiated, sint_connected) = {
            let state = self.state.lock();
            (state.contact_initiated, state.sint_connected)
        };
        if contact_initiated {
            self.send_unload();
            let mut state = self.state.lock();
            state.contact_initiated = false;
            state.offers_delivered = false;
        }
        if sint_connected {
            self.hv.disconnect_sint(self.config.sint);
            self.state.lock().sint_connected = false;
        }

        for channel_id in 0..MAX_CHANNELS as u32 {
            self.destroy_channel(channel_id);
        }

        let gpadls: Vec<(usize, GpadlSlot)> = {
            let mut state = self.state.lock();
            state.hot_messages.clear();
            state.max_interrupt_used = 0;
            state.version = None;
            if state.state != RootState::Failed {
                state.state = RootState::Disconnected;
            }
            state
                .gpadls
                .iter_mut()
                .enumerate()
                .filter_map(|(i, slot)| slot.take().map(|slot| (i, slot)))
                .collect()
        };
        // Every owner should have torn its GPADLs down before now.
        for (gpadl_id, slot) in gpadls {
            tracing::warn!(gpadl_id, "reclaiming gpadl that was not torn down");
            slot.event.close();
        }
    }

    /// Runs at [`TPL_VMBUS`] whenever the SINT fires.
    fn sint_notify(self: &Arc<Self>) {
        let sint = self.config.sint;
        let confidential = self.confidential();
        self.scan_event_flags(&self.hv.sint_event_flags(sint, false));
        // The paravisor's event flags are separate from the host's.
        if confidential {
            self.scan_event_flags(&self.hv.sint_event_flags(sint, true));
        }

        if let Some(message) = self.hv.get_sint_message(sint, confidential) {
            if self.dispatch_message(&message) {
                if let Err(err) = self.hv.complete_sint_message(sint, confidential) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to complete sint message"
                    );
                }
            }
        }
    }

    /// Signals the interrupt event of every channel whose flag is set, up to
    /// the highest registered channel.
    fn scan_event_flags(&self, flags: &SynicEventFlags) {
        let events = {
            let state = self.state.lock();
            let word_count = state.max_interrupt_used / 64 + 1;
            let mut events = Vec::new();
            for index in 0..word_count {
                let mut word = flags.take_word(index);
                while word != 0 {
                    let bit = word.trailing_zeros() as usize;
                    word &= word - 1;
                    let channel_id = index * 64 + bit;
                    match state.channels[channel_id]
                        .as_ref()
                        .and_then(|slot| slot.interrupt.as_ref())
                    {
                        Some(event) => events.push(event.clone()),
                        None => tracing::trace!(channel_id, "interrupt for unregistered channel"),
                    }
                }
            }
            events
        };
        for event in events {
            event.signal();
        }
    }

    /// Routes a message from the slot. Returns whether the message should be
    /// completed now; messages for synchronous waiters stay in the slot.
    fn dispatch_message(&self, message: &HvMessage) -> bool {
        let message = ReceivedMessage::new(message);
        let message_type = message.message_type();
        tracing::trace!(?message, "dispatching vmbus message");

        let event = match message_type {
            MessageType::OFFER_CHANNEL if self.state.lock().offers_delivered => {
                // A hot add must allocate, which is not possible at this
                // level. It stays in the slot, holding back the messages
                // behind it, until the allocation event copies it out.
                self.hot_allocation_event.signal();
                return false;
            }
            MessageType::OFFER_CHANNEL
            | MessageType::VERSION_RESPONSE
            | MessageType::ALL_OFFERS_DELIVERED
            | MessageType::UNLOAD_COMPLETE => {
                self.wait_for_message.signal();
                return false;
            }
            MessageType::OPEN_CHANNEL_RESULT => {
                let channel_id = message.body::<protocol::OpenResult>().channel_id.0;
                self.store_channel_response(channel_id, message)
                    .unwrap_or_else(|violation| violation.fail())
            }
            MessageType::GPADL_CREATED => {
                let gpadl_id = message.body::<protocol::GpadlCreated>().gpadl_id.0;
                self.store_gpadl_response(gpadl_id, message)
                    .unwrap_or_else(|violation| violation.fail())
            }
            MessageType::GPADL_TORNDOWN => {
                let gpadl_id = message.body::<protocol::GpadlTorndown>().gpadl_id.0;
                self.store_gpadl_response(gpadl_id, message)
                    .unwrap_or_else(|violation| violation.fail())
            }
            MessageType::RESCIND_CHANNEL_OFFER => {
                // Hot remove is not supported: a channel in use cannot be
                // guaranteed closed. The rescind is accepted and no release
                // is ever sent.
                let channel_id = message.body::<protocol::RescindChannelOffer>().channel_id.0;
                tracing::debug!(channel_id, "ignoring rescind");
                return true;
            }
            _ => {
                tracing::error!(?message, "unexpected vmbus message");
                return true;
            }
        };
        event.signal();
        true
    }

    fn store_channel_response(
        &self,
        channel_id: u32,
        message: ReceivedMessage,
    ) -> Result<Event, ProtocolViolation> {
        let mut state = self.state.lock();
        let slot = state
            .channels
            .get_mut(channel_id as usize)
            .ok_or(ProtocolViolation::ChannelOutOfRange(channel_id))?
            .as_mut()
            .ok_or(ProtocolViolation::UnknownChannel(channel_id))?;
        slot.response = Some(message);
        Ok(slot.channel.response_event.clone())
    }

    fn store_gpadl_response(
        &self,
        gpadl_id: u32,
        message: ReceivedMessage,
    ) -> Result<Event, ProtocolViolation> {
        let mut state = self.state.lock();
        let slot = state
            .gpadls
            .get_mut(gpadl_id as usize)
            .ok_or(ProtocolViolation::GpadlOutOfRange(gpadl_id))?
            .as_mut()
            .ok_or(ProtocolViolation::UnknownGpadl(gpadl_id))?;
        slot.response = Some(message);
        Ok(slot.event.clone())
    }

    /// Runs at NOTIFY to copy a hot-add offer out of the slot.
    fn hot_add_allocation(self: &Arc<Self>) {
        let sint = self.config.sint;
        let confidential = self.confidential();
        if let Some(message) = self.hv.get_sint_message(sint, confidential) {
            let message = ReceivedMessage::new(&message);
            if message.size() != OfferChannel::MESSAGE_SIZE
                || message.message_type() != MessageType::OFFER_CHANNEL
            {
                ProtocolViolation::InvalidOffer {
                    message_type: message.message_type(),
                    size: message.size(),
                }
                .fail();
            }
            let offer = message.body::<OfferChannel>();
            self.validate_offer(&offer);
            if self.is_offer_allowed(&offer) {
                self.state.lock().hot_messages.push_back(offer);
                self.hot_event.signal();
            }
        }
        if let Err(err) = self.hv.complete_sint_message(sint, confidential) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to complete sint message"
            );
        }
    }

    /// Runs just above APPLICATION to create the channels queued by hot add.
    fn hot_add(self: &Arc<Self>) {
        let offers = {
            let _tpl = self.dispatcher.raise(Tpl::NOTIFY);
            std::mem::take(&mut self.state.lock().hot_messages)
        };
        let handler = self.hot_add_handler.lock().clone();
        for offer in offers {
            let channel = self.create_channel(&offer);
            tracing::info!(channel_id = channel.channel_id(), "hot added channel");
            if let Some(handler) = &handler {
                handler(channel);
            }
        }
    }

    /// Claims the first free GPADL handle.
    pub(crate) fn allocate_gpadl(&self) -> Result<u32, Error> {
        let event = self.dispatcher.create_event(Tpl::APPLICATION, None);
        let _tpl = self.dispatcher.raise(TPL_VMBUS);
        let mut state = self.state.lock();
        let Some(index) = (1..MAX_GPADLS).find(|&i| state.gpadls[i].is_none()) else {
            tracing::error!("no free gpadl handle");
            return Err(Error::GpadlTableFull);
        };
        state.gpadls[index] = Some(GpadlSlot {
            event,
            response: None,
        });
        Ok(index as u32)
    }

    /// Releases a GPADL handle for reuse.
    pub(crate) fn reclaim_gpadl(&self, gpadl_id: u32) {
        let slot = {
            let _tpl = self.dispatcher.raise(TPL_VMBUS);
            self.state
                .lock()
                .gpadls
                .get_mut(gpadl_id as usize)
                .and_then(Option::take)
        };
        if let Some(slot) = slot {
            slot.event.close();
        }
    }

    pub(crate) fn is_gpadl_allocated(&self, gpadl_id: u32) -> bool {
        self.state
            .lock()
            .gpadls
            .get(gpadl_id as usize)
            .is_some_and(Option::is_some)
    }

    pub(crate) fn wait_for_gpadl_response(&self, gpadl_id: u32) -> ReceivedMessage {
        assert!(self.dispatcher.current() < Tpl::NOTIFY);
        let event = self.state.lock().gpadls[gpadl_id as usize]
            .as_ref()
            .map(|slot| slot.event.clone())
            .expect("waiting on an allocated gpadl");
        loop {
            self.dispatcher.wait_for_event(&event);
            let response = self.state.lock().gpadls[gpadl_id as usize]
                .as_mut()
                .and_then(|slot| slot.response.take());
            if let Some(response) = response {
                return response;
            }
        }
    }

    pub(crate) fn wait_for_channel_response(&self, channel: &ChannelShared) -> ReceivedMessage {
        assert!(self.dispatcher.current() < Tpl::NOTIFY);
        let channel_id = channel.offer.channel_id.0 as usize;
        loop {
            self.dispatcher.wait_for_event(&channel.response_event);
            let response = self.state.lock().channels[channel_id]
                .as_mut()
                .and_then(|slot| slot.response.take());
            if let Some(response) = response {
                return response;
            }
        }
    }

    /// Routes the channel's event flag to `event`, or stops routing it.
    pub(crate) fn set_interrupt(&self, channel_id: u32, event: Option<Event>) {
        let _tpl = self.dispatcher.raise(Tpl::HIGH_LEVEL);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = channel_id as usize;
        let Some(slot) = state.channels.get_mut(id).and_then(Option::as_mut) else {
            tracing::warn!(channel_id, "interrupt registration for a destroyed channel");
            return;
        };
        let registered = event.is_some();
        slot.interrupt = event;
        if registered {
            state.max_interrupt_used = state.max_interrupt_used.max(id);
        } else if id == state.max_interrupt_used {
            state.max_interrupt_used = (1..=id)
                .rev()
                .find(|&i| {
                    state.channels[i]
                        .as_ref()
                        .is_some_and(|slot| slot.interrupt.is_some())
                })
                .unwrap_or(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list() {
        for id in [interface::STORVSC, interface::NETVSC, interface::VPCI] {
            assert!(is_channel_allowed(&id, false, false));
            assert!(is_channel_allowed(&id, true, false));
        }
        for id in [
            interface::VIDEO,
            interface::VMBFS,
            interface::SYNTHETIC_KEYBOARD,
        ] {
            assert!(is_channel_allowed(&id, false, false));
            assert!(!is_channel_allowed(&id, true, false));
        }
        assert!(is_channel_allowed(&interface::VMBFS, true, true));
        assert!(!is_channel_allowed(&interface::VIDEO, true, true));
        assert!(!is_channel_allowed(&Guid::new_random(), false, true));
    }

    #[test]
    fn received_message_reads_past_size_as_zero() {
        let message = OutgoingMessage::new(&protocol::GpadlTorndown {
            gpadl_id: protocol::GpadlId(7),
        });
        let hv = HvMessage::new(HvMessageType::VMBUS, 0, &message.data()[..8]);
        let received = ReceivedMessage::new(&hv);
        assert_eq!(received.size(), 8);
        assert_eq!(received.message_type(), MessageType::GPADL_TORNDOWN);
        assert_eq!(received.body::<protocol::GpadlTorndown>().gpadl_id.0, 0);

        let hv = HvMessage::new(HvMessageType::VMBUS, 0, message.data());
        let received = ReceivedMessage::new(&hv);
        assert_eq!(received.expect::<protocol::GpadlTorndown>().gpadl_id.0, 7);
    }

    #[test]
    #[should_panic(expected = "exceeds the synic payload")]
    fn oversized_message_fails() {
        let mut hv = HvMessage::new(HvMessageType::VMBUS, 0, &[]);
        hv.header.len = 241;
        ReceivedMessage::new(&hv);
    }

    #[test]
    #[should_panic(expected = "expected UNLOAD_COMPLETE")]
    fn unexpected_response_fails() {
        let message = OutgoingMessage::new(&protocol::AllOffersDelivered {});
        let hv = HvMessage::new(HvMessageType::VMBUS, 0, message.data());
        ReceivedMessage::new(&hv).expect::<protocol::UnloadComplete>();
    }
}
