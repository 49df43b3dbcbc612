// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro.

/// Defines a wire enum that tolerates values outside its known set.
///
/// The generated type is a `#[repr(transparent)]` tuple struct over the
/// storage integer, with one associated constant per variant. Matching on the
/// constants is allowed, and an unknown value received from the opposite
/// endpoint is still representable, so it can be validated instead of causing
/// undefined behavior.
///
/// # Examples
///
/// ```
/// use open_enum::open_enum;
/// open_enum! {
///     pub enum PacketKind: u16 {
///         IN_BAND = 6,
///         COMPLETION = 11,
///     }
/// }
///
/// assert_eq!(PacketKind::COMPLETION.0, 11);
/// assert_eq!(PacketKind(6), PacketKind::IN_BAND);
/// assert_eq!(PacketKind::IN_BAND.name(), Some("IN_BAND"));
/// assert_eq!(PacketKind(7).name(), None);
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl $name {
            /// Returns the name of the variant, or `None` for a value outside
            /// the known set.
            pub fn name(&self) -> Option<&'static str> {
                match *self {
                    $( Self::$variant => Some(stringify!($variant)), )*
                    _ => None,
                }
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match self.name() {
                    Some(name) => fmt.pad(name),
                    None => ::core::fmt::Debug::fmt(&self.0, fmt),
                }
            }
        }
    };
}
