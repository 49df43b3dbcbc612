// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page-list encoding of external buffers.
//!
//! A range is a byte count and an offset into its first page followed by the
//! page frame numbers it spans. GPA direct packets carry a count-prefixed
//! sequence of these.

use smallvec::SmallVec;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: u64 = 12;

/// Page frame numbers, inline for buffers up to 256KB.
pub type GpnList = SmallVec<[u64; 64]>;

/// Returns the page frame numbers spanned by the buffer at `gpa`.
pub fn gpns_for_buffer(gpa: u64, len: usize) -> GpnList {
    match len {
        0 => GpnList::new(),
        len => ((gpa >> PAGE_SHIFT)..=((gpa + len as u64 - 1) >> PAGE_SHIFT)).collect(),
    }
}

/// The first word of an encoded range.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    pub len: u32,
    pub offset: u32,
}

/// A byte range described by an offset into its first page and a page list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PagedRange<'a> {
    offset: usize,
    len: usize,
    gpns: &'a [u64],
}

impl<'a> PagedRange<'a> {
    /// Returns a range of `len` bytes starting `offset` bytes into the first
    /// page of `gpns`. `gpns` must hold exactly the pages the range spans.
    pub fn new(offset: usize, len: usize, gpns: &'a [u64]) -> Option<Self> {
        let spans = (offset + len).div_ceil(PAGE_SIZE);
        (offset < PAGE_SIZE && spans == gpns.len()).then_some(Self { offset, len, gpns })
    }

    /// The byte offset into the first page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn gpns(&self) -> &'a [u64] {
        self.gpns
    }
}

/// A validated sequence of encoded ranges.
#[derive(Debug, Default, Clone)]
pub struct MultiPagedRangeBuf<T> {
    buf: T,
    count: usize,
}

impl<T: AsRef<[u64]>> MultiPagedRangeBuf<T> {
    /// Wraps `buf`, which must hold at least `count` well-formed ranges.
    pub fn new(count: usize, buf: T) -> Result<Self, Error> {
        let mut words = buf.as_ref();
        for _ in 0..count {
            words = split_range(words)?.1;
        }
        Ok(Self { buf, count })
    }

    pub fn iter(&self) -> impl Iterator<Item = PagedRange<'_>> {
        let mut words = self.buf.as_ref();
        (0..self.count).map_while(move |_| {
            let (range, rest) = split_range(words).ok()?;
            words = rest;
            Some(range)
        })
    }

    pub fn range_count(&self) -> usize {
        self.count
    }

    /// The encoded words, as they go on the wire.
    pub fn range_buffer(&self) -> &[u64] {
        self.buf.as_ref()
    }
}

impl<'a> FromIterator<PagedRange<'a>> for MultiPagedRangeBuf<GpnList> {
    fn from_iter<I: IntoIterator<Item = PagedRange<'a>>>(ranges: I) -> Self {
        let mut encoded = Self {
            buf: GpnList::new(),
            count: 0,
        };
        for range in ranges {
            let prefix = GpaRange {
                len: range.len() as u32,
                offset: range.offset() as u32,
            };
            encoded.buf.push(u64::read_from_bytes(prefix.as_bytes()).expect("8 bytes"));
            encoded.buf.extend_from_slice(range.gpns());
            encoded.count += 1;
        }
        encoded
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("range list ended early")]
    EmptyRange,
    #[error("range has no bytes")]
    EmptyByteCount,
    #[error("range lists fewer pages than it spans")]
    RangeTooSmall,
    #[error("range length overflows")]
    Overflow,
}

/// Splits the first range off `words`.
fn split_range(words: &[u64]) -> Result<(PagedRange<'_>, &[u64]), Error> {
    let (&prefix, rest) = words.split_first().ok_or(Error::EmptyRange)?;
    let len = prefix as u32;
    // Hosts may set bits above the page offset; only the low 12 count.
    let offset = (prefix >> 32) as u32 % PAGE_SIZE as u32;
    if len == 0 {
        return Err(Error::EmptyByteCount);
    }
    let end = len.checked_add(offset).ok_or(Error::Overflow)?;
    let pages = (end as usize).div_ceil(PAGE_SIZE);
    if rest.len() < pages {
        return Err(Error::RangeTooSmall);
    }
    let (gpns, rest) = rest.split_at(pages);
    let range =
        PagedRange::new(offset as usize, len as usize, gpns).ok_or(Error::RangeTooSmall)?;
    Ok((range, rest))
}
