// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VMBus control-plane wire protocol: the messages exchanged with the
//! host over the message connection, and helpers to build them.

#![forbid(unsafe_code)]

pub mod protocol;

use protocol::FeatureFlags;
use protocol::MAX_MESSAGE_SIZE;
use protocol::MessageHeader;
use protocol::Version;
use protocol::VmbusMessage;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The negotiated protocol version and features.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Version,
    pub feature_flags: FeatureFlags,
}

/// A control-plane message ready to post: the header, the fixed body and any
/// trailing page list.
#[derive(Clone)]
pub struct OutgoingMessage {
    buf: [u8; MAX_MESSAGE_SIZE],
    len: usize,
}

impl OutgoingMessage {
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        Self::with_data(message, &[])
    }

    /// Builds `message` followed by `data`.
    ///
    /// Panics if the result does not fit in one synic message.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Self {
        let mut this = Self {
            buf: [0; MAX_MESSAGE_SIZE],
            len: 0,
        };
        this.append(MessageHeader::new(T::MESSAGE_TYPE).as_bytes());
        this.append(message.as_bytes());
        this.append(data);
        this
    }

    fn append(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        assert!(end <= MAX_MESSAGE_SIZE, "message does not fit in a synic message");
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
    }

    /// The message bytes, header included.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl Eq for OutgoingMessage {}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OutgoingMessage").field(&self.data()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelId;
    use crate::protocol::ConnectionState;
    use crate::protocol::GpadlId;
    use crate::protocol::Message;
    use crate::protocol::ParseError;
    use guid::Guid;

    #[test]
    fn close_channel_bytes() {
        let message = OutgoingMessage::new(&protocol::CloseChannel {
            channel_id: ChannelId(5),
        });

        assert_eq!(&[0x7, 0, 0, 0, 0, 0, 0, 0, 0x5, 0, 0, 0], message.data())
    }

    #[test]
    fn header_only_message() {
        let message = OutgoingMessage::new(&protocol::Unload {});

        assert_eq!(&[0x10, 0, 0, 0, 0, 0, 0, 0], message.data())
    }

    #[test]
    fn page_list_follows_the_body() {
        let message = OutgoingMessage::with_data(
            &protocol::GpadlBody {
                rsvd: 0,
                gpadl_id: GpadlId(3),
            },
            &0x1234u64.to_le_bytes(),
        );

        assert_eq!(
            &[
                0x9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x3, 0, 0, 0, 0x34, 0x12, 0, 0, 0, 0, 0, 0
            ],
            message.data()
        )
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_page_list_panics() {
        let body = protocol::GpadlBody {
            rsvd: 0,
            gpadl_id: GpadlId(1),
        };
        let full = [0; protocol::GpadlBody::MAX_DATA_VALUES * 8];
        assert_eq!(
            OutgoingMessage::with_data(&body, &full).data().len(),
            MAX_MESSAGE_SIZE
        );
        OutgoingMessage::with_data(&body, &[0; protocol::GpadlBody::MAX_DATA_VALUES * 8 + 8]);
    }

    #[test]
    fn initiate_contact_sizes() {
        let contact = protocol::InitiateContact {
            version_requested: Version::Win8_1 as u32,
            target_message_vp: 0,
            interrupt_page_or_target_info: protocol::TargetInfo::new()
                .with_feature_flags(FeatureFlags::new().with_client_id(true).into())
                .into(),
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        };
        let message = OutgoingMessage::new(&contact);
        assert_eq!(message.data().len(), 40);
        assert_eq!(&message.data()[8..12], &[0, 0, 3, 0]);
        assert_eq!(&message.data()[16..24], &[0, 0, 0, 0, 8, 0, 0, 0]);

        let message = OutgoingMessage::new(&protocol::InitiateContact2 {
            initiate_contact: contact,
            client_id: Guid::ZERO,
        });
        assert_eq!(message.data().len(), 56);
    }

    #[test]
    fn parse_by_size() {
        let response = protocol::VersionResponse {
            version_supported: 1,
            connection_state: ConnectionState::SUCCESSFUL,
            padding: 0,
            selected_version_or_connection_id: 0,
        };

        let short = OutgoingMessage::new(&response);
        assert!(matches!(
            Message::parse(short.data()),
            Ok(Message::VersionResponse(r, _)) if r == response
        ));

        let long = OutgoingMessage::new(&protocol::VersionResponse2 {
            version_response: response,
            supported_features: 0x18,
        });
        assert!(matches!(
            Message::parse(long.data()),
            Ok(Message::VersionResponse2(r, _)) if r.supported_features == 0x18
        ));
    }

    #[test]
    fn open_forms_parse_by_size() {
        let open = protocol::OpenChannel {
            channel_id: ChannelId(2),
            open_id: 2,
            ring_buffer_gpadl_id: GpadlId(1),
            target_vp: 0,
            downstream_ring_buffer_page_offset: 5,
            user_data: Default::default(),
        };
        let short = OutgoingMessage::new(&open);
        assert!(matches!(
            Message::parse(short.data()),
            Ok(Message::OpenChannel(parsed, _)) if parsed == open
        ));
        let long = OutgoingMessage::new(&protocol::OpenChannel2::from(open));
        assert!(matches!(
            Message::parse(long.data()),
            Ok(Message::OpenChannel2(parsed, rest))
                if parsed.open_channel == open && parsed.connection_id == 0 && rest.is_empty()
        ));
    }

    #[test]
    fn granted_features_intersect() {
        let mut flags = FeatureFlags::new()
            .with_client_id(true)
            .with_confidential_channels(true);
        flags &= FeatureFlags::from(0x8);
        assert_eq!(flags, FeatureFlags::new().with_client_id(true));
        assert_eq!(u32::from(flags), 0x8);
    }

    #[test]
    fn parse_offer() {
        let offer = protocol::OfferChannel {
            interface_id: Guid::new_random(),
            instance_id: Guid::new_random(),
            rsvd: [0; 4],
            flags: protocol::OfferFlags::new().with_named_pipe_mode(true),
            mmio_megabytes: 0,
            user_defined: Default::default(),
            subchannel_index: 0,
            mmio_megabytes_optional: 0,
            channel_id: ChannelId(7),
            monitor_id: 0,
            monitor_allocated: 0,
            is_dedicated: 1,
            connection_id: 0x2007,
        };
        let message = OutgoingMessage::new(&offer);
        assert_eq!(message.data().len(), 196);
        assert_eq!(u16::from(offer.flags), 0x10);
        match Message::parse(message.data()).unwrap() {
            Message::OfferChannel(parsed, rest) => {
                assert_eq!(parsed, offer);
                assert!(rest.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Message::parse(&[0; 4]),
            Err(ParseError::MessageTooSmall(None))
        ));
        assert!(matches!(
            Message::parse(&[6, 0, 0, 0, 0, 0, 0, 0, 1, 0]),
            Err(ParseError::MessageTooSmall(Some(
                protocol::MessageType::OPEN_CHANNEL_RESULT
            )))
        ));
        assert!(matches!(
            Message::parse(&[99, 0, 0, 0, 0, 0, 0, 0]),
            Err(ParseError::InvalidMessageType(protocol::MessageType(99)))
        ));
    }
}
