// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-plane message layouts.
//!
//! Every message is a [`MessageHeader`] followed by a fixed struct and, for
//! the GPADL messages, a page list. A whole message must fit in one synic
//! message slot.

use bitfield_struct::bitfield;
use open_enum::open_enum;
use std::mem::size_of;
use std::ops::BitAndAssign;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

type Guid = guid::Guid;

/// Messages to the host are posted on this connection.
pub const VMBUS_MESSAGE_CONNECTION_ID: u32 = 1;

pub const STATUS_SUCCESS: i32 = 0;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();
pub const MAX_MESSAGE_SIZE: usize = efi_hv::HV_MESSAGE_PAYLOAD_SIZE;

messages! {
    1 => OFFER_CHANNEL(OfferChannel),
    2 => RESCIND_CHANNEL_OFFER(RescindChannelOffer),
    3 => REQUEST_OFFERS(RequestOffers),
    4 => ALL_OFFERS_DELIVERED(AllOffersDelivered),
    5 => OPEN_CHANNEL(OpenChannel2 | OpenChannel),
    6 => OPEN_CHANNEL_RESULT(OpenResult),
    7 => CLOSE_CHANNEL(CloseChannel),
    8 => GPADL_HEADER(GpadlHeader),
    9 => GPADL_BODY(GpadlBody),
    10 => GPADL_CREATED(GpadlCreated),
    11 => GPADL_TEARDOWN(GpadlTeardown),
    12 => GPADL_TORNDOWN(GpadlTorndown),
    13 => REL_ID_RELEASED(RelIdReleased),
    14 => INITIATE_CONTACT(InitiateContact2 | InitiateContact),
    15 => VERSION_RESPONSE(VersionResponse2 | VersionResponse),
    16 => UNLOAD(Unload),
    17 => UNLOAD_COMPLETE(UnloadComplete),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    #[error("unexpected message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// A struct that is the body of a control-plane message.
pub trait VmbusMessage: Sized {
    const MESSAGE_TYPE: MessageType;

    /// The size on the wire, header included.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

/// Features requested in [`TargetInfo`] and granted in
/// [`VersionResponse2::supported_features`].
#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Signal parameters, interrupt redirection and connection changes; never
    /// requested.
    #[bits(3)]
    _unused: u32,
    /// The initiate contact message carries a client GUID.
    pub client_id: bool,
    /// The host honors the confidential offer flags.
    pub confidential_channels: bool,
    #[bits(27)]
    _reserved: u32,
}

impl BitAndAssign for FeatureFlags {
    fn bitand_assign(&mut self, granted: Self) {
        *self = Self::from_bits(self.into_bits() & granted.into_bits());
    }
}

#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

/// Protocol versions this stack can speak, oldest first.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Win8_1 = 0x0003_0000,
    Win10 = 0x0004_0000,
    Copper = 0x0006_0000,
}

impl Version {
    /// Copper added the client ID to initiate contact and the feature word to
    /// the version response.
    pub fn has_client_id(self) -> bool {
        self >= Version::Copper
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    /// A [`TargetInfo`] for every version this stack speaks.
    pub interrupt_page_or_target_info: u64,
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact2 {
    pub initiate_contact: InitiateContact,
    pub client_id: Guid,
}

#[bitfield(u64)]
pub struct TargetInfo {
    /// The SINT the host should deliver messages to.
    pub sint: u8,
    pub vtl: u8,
    _padding: u16,
    pub feature_flags: u32,
}

open_enum! {
    /// The host's verdict on a supported version.
    #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
    pub enum ConnectionState: u8 {
        SUCCESSFUL = 0,
        FAILED_LOW_RESOURCES = 1,
        FAILED_UNKNOWN_FAILURE = 2,
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    /// Zero if the requested version is not supported.
    pub version_supported: u8,
    pub connection_state: ConnectionState,
    pub padding: u16,
    pub selected_version_or_connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse2 {
    pub version_response: VersionResponse,
    pub supported_features: u32,
}

/// Opaque device data carried in offers and open requests.
#[repr(C, align(4))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UserDefinedData([u8; 120]);

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    pub connection_id: u32,
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    #[bits(1)]
    _enumerate_device_interface: u16,
    /// On an isolated VM the ring buffer must stay in private memory.
    pub confidential_ring_buffer: bool,
    /// On an isolated VM external buffers and extra GPADLs must stay in
    /// private memory.
    pub confidential_external_memory: bool,
    #[bits(1)]
    _reserved1: u16,
    /// Packets carry a pipe header.
    pub named_pipe_mode: bool,
    #[bits(11)]
    _reserved2: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

/// Starts a GPADL. The page list follows: per range a [`GpaRange`] and its
/// page numbers, continued in [`GpadlBody`] messages.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    /// Bytes in the whole page list, across all messages.
    pub len: u16,
    pub count: u16,
}

/// Defines how many 64-bit page list entries fit after each message's fixed part.
macro_rules! page_list_capacity {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                pub const MAX_DATA_VALUES: usize =
                    (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
            }
        )*
    };
}

page_list_capacity!(GpadlHeader, GpadlBody);

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpaRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    /// Page offset of the guest-to-host ring within the GPADL.
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

/// The long open form. The guest always sends it, with the signal fields
/// left zero.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel2 {
    pub open_channel: OpenChannel,
    pub connection_id: u32,
    pub event_flag: u16,
    pub flags: u16,
}

impl From<OpenChannel> for OpenChannel2 {
    fn from(open_channel: OpenChannel) -> Self {
        Self {
            open_channel,
            ..FromZeros::new_zeroed()
        }
    }
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

/// Returns a rescinded channel's ID to the host for reuse.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

/// Messages that are only a header.
macro_rules! header_only {
    ($($name:ident),*) => {
        $(
            #[repr(C)]
            #[derive(Debug, Copy, Clone, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
            pub struct $name {}
        )*
    };
}

header_only!(RequestOffers, AllOffersDelivered, Unload, UnloadComplete);

static_assertions::const_assert_eq!(OfferChannel::MESSAGE_SIZE, 196);
static_assertions::const_assert_eq!(GpadlHeader::MAX_DATA_VALUES, 27);
static_assertions::const_assert_eq!(GpadlBody::MAX_DATA_VALUES, 28);
