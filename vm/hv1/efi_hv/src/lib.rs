// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The firmware's interface to the Hyper-V synthetic interrupt controller.
//!
//! [`EfiHv`] covers message passing and event flags on a SINT. [`EfiHvIvm`]
//! covers page visibility on isolated VMs. Both are implemented by the
//! platform; the vmbus crates only consume them.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use guestmem::SharedAlias;
use open_enum::open_enum;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The number of synthetic interrupt sources.
pub const NUM_SINTS: usize = 16;

/// The maximum payload of a SynIC message.
pub const HV_MESSAGE_PAYLOAD_SIZE: usize = 240;

/// The number of event flags in a SINT's event flag page slot.
pub const SYNIC_EVENT_FLAG_COUNT: usize = 2048;

const SYNIC_EVENT_FLAG_WORDS: usize = SYNIC_EVENT_FLAG_COUNT / 64;

/// An error from a hypervisor transport operation.
#[derive(Debug, Copy, Clone, Error, PartialEq, Eq)]
pub enum HvError {
    /// The message queue is full. The caller should retry.
    #[error("the hypervisor is not ready")]
    NotReady,
    /// A parameter was invalid.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The operation was refused.
    #[error("access denied")]
    AccessDenied,
    /// The hypervisor ran out of resources.
    #[error("out of resources")]
    OutOfResources,
    /// The operation failed.
    #[error("device error")]
    DeviceError,
}

open_enum! {
    /// The type of a SynIC message.
    #[derive(Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
    pub enum HvMessageType: u32 {
        NONE = 0,
        /// A VMBus control-plane message.
        VMBUS = 1,
    }
}

/// A SynIC message header.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageHeader {
    pub typ: HvMessageType,
    pub len: u8,
    pub flags: HvMessageFlags,
    pub rsvd: u16,
    pub id: u64,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageFlags {
    pub message_pending: bool,
    #[bits(7)]
    _reserved: u8,
}

/// A SynIC message.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessage {
    pub header: HvMessageHeader,
    pub payload_buffer: [u8; HV_MESSAGE_PAYLOAD_SIZE],
}

impl Default for HvMessage {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl HvMessage {
    /// Constructs a new message. `payload` must fit into the payload field (240
    /// bytes limit).
    pub fn new(typ: HvMessageType, id: u64, payload: &[u8]) -> Self {
        let mut msg = HvMessage {
            header: HvMessageHeader {
                typ,
                len: payload.len() as u8,
                flags: HvMessageFlags::new(),
                rsvd: 0,
                id,
            },
            payload_buffer: [0; HV_MESSAGE_PAYLOAD_SIZE],
        };
        msg.payload_buffer[..payload.len()].copy_from_slice(payload);
        msg
    }

    /// The declared payload size. This is host data and may exceed the
    /// payload buffer.
    pub fn payload_size(&self) -> usize {
        self.header.len as usize
    }

    /// The payload, truncated to the payload buffer.
    pub fn payload(&self) -> &[u8] {
        &self.payload_buffer[..self.payload_size().min(HV_MESSAGE_PAYLOAD_SIZE)]
    }
}

/// The event flags of one SINT: one bit per connection.
pub struct SynicEventFlags {
    words: [AtomicU64; SYNIC_EVENT_FLAG_WORDS],
}

impl Debug for SynicEventFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.words
                    .iter()
                    .map(|w| w.load(Ordering::Relaxed))
                    .enumerate()
                    .filter(|&(_, w)| w != 0),
            )
            .finish()
    }
}

impl Default for SynicEventFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl SynicEventFlags {
    /// Returns a cleared set of flags.
    pub fn new() -> Self {
        Self {
            words: [0; SYNIC_EVENT_FLAG_WORDS].map(AtomicU64::new),
        }
    }

    /// Sets flag `n`, returning true if it was previously clear.
    pub fn set(&self, n: u16) -> bool {
        let bit = 1 << (n % 64);
        self.words[n as usize / 64].fetch_or(bit, Ordering::SeqCst) & bit == 0
    }

    /// Returns whether flag `n` is set.
    pub fn is_set(&self, n: u16) -> bool {
        self.words[n as usize / 64].load(Ordering::SeqCst) & (1 << (n % 64)) != 0
    }

    /// Atomically clears word `index`, returning its previous value.
    pub fn take_word(&self, index: usize) -> u64 {
        self.words[index].swap(0, Ordering::SeqCst)
    }
}

/// A SINT interrupt handler. The platform runs it whenever a message or event
/// flag arrives on the SINT.
pub type SintHandler = Box<dyn Fn() + Send + Sync>;

/// Message passing over the synthetic interrupt controller.
///
/// `confidential` selects the paravisor's SynIC rather than the host's on a
/// hardware-isolated VM with a paravisor.
pub trait EfiHv: Send + Sync {
    /// Connects `handler` to `sint`.
    fn connect_sint(
        &self,
        sint: u8,
        vector: u8,
        confidential: bool,
        handler: SintHandler,
    ) -> Result<(), HvError>;

    /// Disconnects `sint`.
    fn disconnect_sint(&self, sint: u8);

    /// Returns the message in the SINT's message slot, if any. The slot stays
    /// occupied until [`EfiHv::complete_sint_message`].
    fn get_sint_message(&self, sint: u8, confidential: bool) -> Option<HvMessage>;

    /// Frees the SINT's message slot for the next message.
    fn complete_sint_message(&self, sint: u8, confidential: bool) -> Result<(), HvError>;

    /// Returns the SINT's event flags.
    fn sint_event_flags(&self, sint: u8, confidential: bool) -> Arc<SynicEventFlags>;

    /// Returns the index of the running virtual processor.
    fn current_vp_index(&self) -> u32;

    /// Posts a message to `connection_id`. Fails with
    /// [`HvError::NotReady`] while the destination queue is full.
    fn post_message(
        &self,
        connection_id: u32,
        message_type: HvMessageType,
        payload: &[u8],
        confidential: bool,
    ) -> Result<(), HvError>;

    /// Signals event flag `flag_number` of `connection_id`.
    fn signal_event(&self, connection_id: u32, flag_number: u16) -> Result<(), HvError>;
}

/// Access requested when making pages host visible.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct HostVisibility {
    pub readable: bool,
    pub writable: bool,
    #[bits(30)]
    _reserved: u32,
}

impl HostVisibility {
    /// Read and write access.
    pub const READ_WRITE: Self = Self::new().with_readable(true).with_writable(true);
}

/// Identifies a range made host visible, for revoking it later.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtectionHandle(u64);

impl ProtectionHandle {
    /// Wraps a platform-defined handle value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The platform-defined handle value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Page visibility control on isolated VMs.
pub trait EfiHvIvm: Send + Sync {
    /// Shares `len` bytes at `base` with the host. The host then reaches the
    /// pages at `base + shared_gpa_boundary`.
    fn make_address_range_host_visible(
        &self,
        visibility: HostVisibility,
        base: u64,
        len: u64,
        zero_pages: bool,
    ) -> Result<ProtectionHandle, HvError>;

    /// Revokes host access granted by
    /// [`EfiHvIvm::make_address_range_host_visible`].
    fn make_address_range_not_host_visible(&self, handle: ProtectionHandle);
}

/// The kind of isolation the VM runs under.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum IsolationType {
    /// No isolation.
    #[default]
    None,
    /// Software (VBS) isolation.
    Vbs,
    /// AMD SEV-SNP.
    Snp,
    /// Intel TDX.
    Tdx,
}

/// The isolation configuration of the VM.
#[derive(Debug, Copy, Clone, Default)]
pub struct IsolationConfig {
    /// The isolation type.
    pub isolation: IsolationType,
    /// Whether a paravisor runs alongside the firmware.
    pub paravisor_present: bool,
    /// Offset of the host-visible alias of guest memory.
    pub shared_gpa_boundary: u64,
    /// Bits set in virtual addresses of host-visible mappings.
    pub canonicalization_mask: u64,
}

impl IsolationConfig {
    /// Returns whether the VM runs under any kind of isolation.
    pub fn is_isolated(&self) -> bool {
        self.isolation != IsolationType::None
    }

    /// Returns whether the host cannot read private guest memory.
    pub fn is_hardware_isolated(&self) -> bool {
        matches!(self.isolation, IsolationType::Snp | IsolationType::Tdx)
    }

    /// Returns the memory alias layout for this configuration.
    pub fn shared_alias(&self) -> SharedAlias {
        if self.is_hardware_isolated() {
            SharedAlias {
                shared_gpa_boundary: self.shared_gpa_boundary,
                canonicalization_mask: self.canonicalization_mask,
            }
        } else {
            SharedAlias::default()
        }
    }

    /// Returns the host-visible address for private address `gpa`.
    pub fn host_visible_address(&self, gpa: u64) -> u64 {
        if self.is_hardware_isolated() {
            gpa + self.shared_gpa_boundary
        } else {
            gpa
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layout() {
        assert_eq!(size_of::<HvMessage>(), 256);
        let msg = HvMessage::new(HvMessageType::VMBUS, 0, &[1, 2, 3]);
        assert_eq!(msg.payload(), [1, 2, 3]);
        assert_eq!(&msg.as_bytes()[..4], [1, 0, 0, 0]);
        assert_eq!(msg.as_bytes()[4], 3);
    }

    #[test]
    fn oversized_payload_size_is_clamped() {
        let mut msg = HvMessage::default();
        msg.header.len = 255;
        assert_eq!(msg.payload_size(), 255);
        assert_eq!(msg.payload().len(), HV_MESSAGE_PAYLOAD_SIZE);
    }

    #[test]
    fn event_flags() {
        let flags = SynicEventFlags::new();
        assert!(flags.set(3));
        assert!(!flags.set(3));
        assert!(flags.set(130));
        assert!(flags.is_set(130));
        assert_eq!(flags.take_word(0), 1 << 3);
        assert_eq!(flags.take_word(0), 0);
        assert_eq!(flags.take_word(2), 1 << 2);
    }

    #[test]
    fn isolation() {
        let config = IsolationConfig {
            isolation: IsolationType::Snp,
            paravisor_present: false,
            shared_gpa_boundary: 1 << 46,
            canonicalization_mask: 0,
        };
        assert!(config.is_hardware_isolated());
        assert_eq!(config.host_visible_address(0x1000), (1 << 46) + 0x1000);
        let vbs = IsolationConfig {
            isolation: IsolationType::Vbs,
            ..config
        };
        assert!(!vbs.is_hardware_isolated());
        assert!(vbs.is_isolated());
        assert!(!IsolationConfig::default().is_isolated());
        assert_eq!(vbs.shared_alias(), SharedAlias::default());
    }
}
