// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`Guid`] type with the same layout as the Windows type `GUID`.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Windows format GUID, as carried in VMBus offers.
#[repr(C)]
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[expect(missing_docs)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Default for Guid {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Builds a [`Guid`] constant from a string literal at compile time.
#[macro_export]
macro_rules! guid {
    ($s:literal) => {
        const { $crate::Guid::from_static_str($s) }
    };
}

/// An error parsing a GUID string.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The string is not 36 or 38 characters long.
    #[error("invalid GUID length")]
    Length,
    /// The dashes or braces are misplaced.
    #[error("invalid GUID format")]
    Format,
    /// A character is not a hex digit.
    #[error("invalid GUID digit")]
    Digit,
}

const fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// `?` is not usable in const fn.
const fn hex_field(s: &[u8], start: usize, digits: usize) -> Result<u64, ParseError> {
    let mut value = 0u64;
    let mut i = 0;
    while i < digits {
        match hex_value(s[start + i]) {
            Some(v) => value = (value << 4) | v as u64,
            None => return Err(ParseError::Digit),
        }
        i += 1;
    }
    Ok(value)
}

macro_rules! field {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Err(e),
        }
    };
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Returns a new random version 4 GUID.
    pub fn new_random() -> Self {
        let mut guid = Self::new_zeroed();
        getrandom::fill(guid.as_mut_bytes()).expect("rng failure");
        guid.data3 = guid.data3 & 0xfff | 0x4000;
        guid.data4[0] = guid.data4[0] & 0x3f | 0x80;
        guid
    }

    /// Parses a GUID in the form `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`,
    /// optionally wrapped in braces, panicking on malformed input.
    ///
    /// Intended for constants; use [`FromStr`] for runtime input.
    pub const fn from_static_str(value: &'static str) -> Self {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("Invalid GUID length."),
            Err(ParseError::Format) => panic!("Invalid GUID format."),
            Err(ParseError::Digit) => panic!("Invalid GUID digit."),
        }
    }

    const fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let offset = match value.len() {
            38 => {
                if value[0] != b'{' || value[37] != b'}' {
                    return Err(ParseError::Format);
                }
                1
            }
            36 => 0,
            _ => return Err(ParseError::Length),
        };

        if value[offset + 8] != b'-'
            || value[offset + 13] != b'-'
            || value[offset + 18] != b'-'
            || value[offset + 23] != b'-'
        {
            return Err(ParseError::Format);
        }

        let data1 = field!(hex_field(value, offset, 8)) as u32;
        let data2 = field!(hex_field(value, offset + 9, 4)) as u16;
        let data3 = field!(hex_field(value, offset + 14, 4)) as u16;
        let clock = field!(hex_field(value, offset + 19, 4));
        let node = field!(hex_field(value, offset + 24, 12));

        let mut data4 = [0u8; 8];
        data4[0] = (clock >> 8) as u8;
        data4[1] = clock as u8;
        let mut i = 0;
        while i < 6 {
            data4[2 + i] = (node >> (8 * (5 - i))) as u8;
            i += 1;
        }

        Ok(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
