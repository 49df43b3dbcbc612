// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Builds the message table: the `MessageType` constants, a `Message` enum
/// with one variant per message struct, its parser, and the [`VmbusMessage`]
/// impls.
///
/// Each entry is `number => NAME(Struct)`. A message with a longer form
/// lists its forms longest first, separated by `|`; the parser takes the
/// first form the received bytes are long enough for.
///
/// [`VmbusMessage`]: super::VmbusMessage
macro_rules! messages {
    ($( $num:literal => $name:ident($($ty:ident)|+), )*) => {
        open_enum! {
            /// The discriminant at the start of every control-plane message.
            #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
            pub enum MessageType: u32 {
                $($name = $num,)*
            }
        }

        /// A received control-plane message and the bytes after its fixed part.
        #[derive(Debug)]
        pub enum Message<'a> {
            $($($ty($ty, &'a [u8]),)+)*
        }

        impl<'a> Message<'a> {
            /// Parses a message, including its header.
            pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
                let (header, body) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;
                let too_small = || ParseError::MessageTooSmall(Some(header.message_type));
                Ok(match header.message_type {
                    $($(
                        MessageType::$name if body.len() >= size_of::<$ty>() => {
                            let (message, rest) =
                                $ty::read_from_prefix(body).map_err(|_| too_small())?;
                            Self::$ty(message, rest)
                        }
                    )+)*
                    $(MessageType::$name)|* => return Err(too_small()),
                    other => return Err(ParseError::InvalidMessageType(other)),
                })
            }
        }

        $($(
            impl VmbusMessage for $ty {
                const MESSAGE_TYPE: MessageType = MessageType::$name;
            }

            static_assertions::const_assert!($ty::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )+)*
    };
}
