// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-visible staging pages for external buffers on isolated VMs.
//!
//! The host cannot reach private guest memory on an isolated VM, so the data
//! of a GPA direct packet is staged in pages that were shared with the host
//! when their block was allocated. Blocks are allocated on demand, stay
//! shared until [`BouncePool::free_all`], and hand out pages from per-block
//! free lists.

use crate::Error;
use crate::ExternalBuffer;
use efi_hv::EfiHvIvm;
use efi_hv::HostVisibility;
use efi_hv::IsolationConfig;
use efi_hv::ProtectionHandle;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use guestmem::PAGE_SIZE;
use std::fmt::Debug;
use std::sync::Arc;

const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// A page acquired from a [`BouncePool`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BouncePage {
    generation: u64,
    block: usize,
    index: usize,
    host_address: u64,
    address: u64,
}

impl BouncePage {
    /// The address the host reaches the page at.
    pub fn host_address(&self) -> u64 {
        self.host_address
    }

    /// The address the firmware reaches the page at.
    pub fn address(&self) -> u64 {
        self.address
    }
}

/// An external buffer and the bounce pages staging it.
#[derive(Debug)]
pub struct StagedBuffer {
    /// The caller's buffer.
    pub buffer: ExternalBuffer,
    /// One page per page the buffer spans.
    pub pages: Vec<BouncePage>,
}

struct BounceBlock {
    base: u64,
    page_count: usize,
    host_base: u64,
    access_base: u64,
    free: Vec<usize>,
    protection: Option<ProtectionHandle>,
}

impl BounceBlock {
    fn page(&self, generation: u64, block: usize, index: usize) -> BouncePage {
        let offset = index as u64 * PAGE_SIZE64;
        BouncePage {
            generation,
            block,
            index,
            host_address: self.host_base + offset,
            address: self.access_base + offset,
        }
    }

    fn in_use(&self) -> usize {
        self.page_count - self.free.len()
    }
}

/// A per-channel pool of bounce pages.
pub struct BouncePool {
    mem: GuestMemory,
    ivm: Arc<dyn EfiHvIvm>,
    isolation: IsolationConfig,
    min_block_pages: usize,
    generation: u64,
    blocks: Vec<BounceBlock>,
}

impl Debug for BouncePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BouncePool")
            .field("blocks", &self.blocks.len())
            .field("total_pages", &self.total_pages())
            .field("free_pages", &self.free_pages())
            .finish()
    }
}

impl BouncePool {
    /// Creates an empty pool. Blocks hold at least `min_block_pages` pages.
    pub fn new(
        mem: GuestMemory,
        ivm: Arc<dyn EfiHvIvm>,
        isolation: IsolationConfig,
        min_block_pages: usize,
    ) -> Self {
        Self {
            mem,
            ivm,
            isolation,
            min_block_pages: min_block_pages.max(1),
            generation: 0,
            blocks: Vec::new(),
        }
    }

    /// Takes `count` free pages, or none at all if fewer are free.
    pub fn acquire(&mut self, count: usize) -> Option<Vec<BouncePage>> {
        if count == 0 || self.free_pages() < count {
            return None;
        }
        let mut pages = Vec::with_capacity(count);
        for (block_index, block) in self.blocks.iter_mut().enumerate() {
            while pages.len() < count {
                let Some(index) = block.free.pop() else {
                    break;
                };
                pages.push(block.page(self.generation, block_index, index));
            }
        }
        Some(pages)
    }

    /// Takes `count` pages, allocating a new block if too few are free.
    pub fn acquire_or_grow(&mut self, count: usize) -> Result<Vec<BouncePage>, Error> {
        loop {
            if let Some(pages) = self.acquire(count) {
                return Ok(pages);
            }
            self.allocate_block(count.max(self.min_block_pages))?;
        }
    }

    /// Stages each of `buffers` in its own bounce pages, zeroing the pages
    /// instead of copying the buffer in if `zero` is set.
    ///
    /// On failure every page taken is returned.
    pub fn stage(
        &mut self,
        buffers: &[ExternalBuffer],
        zero: bool,
    ) -> Result<Vec<StagedBuffer>, Error> {
        let mut staged = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let pages = match self.acquire_or_grow(buffer.page_count()) {
                Ok(pages) => pages,
                Err(err) => {
                    self.unstage(staged, false);
                    return Err(err);
                }
            };
            let result = if zero {
                zero_pages(&self.mem, &pages)
            } else {
                copy_to_bounce(&self.mem, buffer, &pages)
            };
            staged.push(StagedBuffer {
                buffer: *buffer,
                pages,
            });
            if let Err(err) = result {
                self.unstage(staged, false);
                return Err(err.into());
            }
        }
        Ok(staged)
    }

    /// Returns the pages of `staged`, first copying them back to their
    /// buffers if `copy_back` is set.
    pub fn unstage(&mut self, staged: Vec<StagedBuffer>, copy_back: bool) {
        for StagedBuffer { buffer, pages } in staged {
            if copy_back {
                if let Err(err) = copy_from_bounce(&self.mem, &buffer, &pages) {
                    tracing::error!(
                        gpa = buffer.gpa,
                        len = buffer.len,
                        error = &err as &dyn std::error::Error,
                        "failed to copy bounce pages back"
                    );
                }
            }
            self.release(pages);
        }
    }

    /// Returns pages to the blocks they came from.
    pub fn release(&mut self, pages: impl IntoIterator<Item = BouncePage>) {
        for page in pages {
            assert_eq!(
                page.generation, self.generation,
                "bounce page released after its block was freed"
            );
            let block = &mut self.blocks[page.block];
            debug_assert!(!block.free.contains(&page.index));
            block.free.push(page.index);
        }
    }

    /// Allocates a zeroed block of `page_count` pages and shares it with the
    /// host if the VM is isolated.
    pub fn allocate_block(&mut self, page_count: usize) -> Result<(), Error> {
        let len = page_count * PAGE_SIZE;
        let base = self.mem.allocate_pages(page_count).map_err(|err| {
            tracing::error!(
                page_count,
                error = &err as &dyn std::error::Error,
                "failed to allocate bounce block"
            );
            Error::OutOfResources
        })?;
        if let Err(err) = self.mem.fill_at(base, 0, len) {
            self.mem.free_pages(base, page_count);
            return Err(err.into());
        }

        let (host_base, protection) = if self.isolation.is_isolated() {
            let protection = match self.ivm.make_address_range_host_visible(
                HostVisibility::READ_WRITE,
                base,
                len as u64,
                false,
            ) {
                Ok(protection) => protection,
                Err(err) => {
                    tracing::error!(
                        base,
                        page_count,
                        error = &err as &dyn std::error::Error,
                        "failed to share bounce block"
                    );
                    self.mem.free_pages(base, page_count);
                    return Err(Error::OutOfResources);
                }
            };
            (self.isolation.host_visible_address(base), Some(protection))
        } else {
            (base, None)
        };

        let alias = self.isolation.shared_alias();
        let access_base = if alias.shared_gpa_boundary != 0
            && host_base >= alias.shared_gpa_boundary
        {
            host_base | alias.canonicalization_mask
        } else {
            host_base
        };

        tracing::debug!(base, host_base, page_count, "bounce block allocated");
        self.blocks.push(BounceBlock {
            base,
            page_count,
            host_base,
            access_base,
            // Popped from the end, so pages are handed out in address order.
            free: (0..page_count).rev().collect(),
            protection,
        });
        Ok(())
    }

    /// Unshares and frees every block. Pages still outstanding become
    /// invalid.
    pub fn free_all(&mut self) {
        for block in self.blocks.drain(..) {
            if block.in_use() != 0 {
                tracing::warn!(
                    base = block.base,
                    in_use = block.in_use(),
                    "freeing bounce block with pages in use"
                );
            }
            if let Some(protection) = block.protection {
                self.ivm.make_address_range_not_host_visible(protection);
            }
            self.mem.free_pages(block.base, block.page_count);
        }
        self.generation += 1;
    }

    /// The number of pages in every block.
    pub fn total_pages(&self) -> usize {
        self.blocks.iter().map(|block| block.page_count).sum()
    }

    /// The number of pages free for acquisition.
    pub fn free_pages(&self) -> usize {
        self.blocks.iter().map(|block| block.free.len()).sum()
    }

    /// The number of pages acquired and not yet released.
    pub fn pages_in_use(&self) -> usize {
        self.blocks.iter().map(BounceBlock::in_use).sum()
    }

    /// The number of allocated blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Drop for BouncePool {
    fn drop(&mut self) {
        if !self.blocks.is_empty() {
            self.free_all();
        }
    }
}

/// Walks `buffer` and the pages staging it in lockstep, calling `f` with the
/// page address, the buffer address and the length of each piece.
fn for_each_piece(
    buffer: &ExternalBuffer,
    pages: &[BouncePage],
    mut f: impl FnMut(u64, u64, usize) -> Result<(), GuestMemoryError>,
) -> Result<(), GuestMemoryError> {
    assert_eq!(pages.len(), buffer.page_count(), "bounce page count mismatch");
    let mut page_offset = buffer.page_offset();
    let mut gpa = buffer.gpa;
    let mut remaining = buffer.len as usize;
    for page in pages {
        let len = (PAGE_SIZE - page_offset).min(remaining);
        f(page.address + page_offset as u64, gpa, len)?;
        gpa += len as u64;
        remaining -= len;
        page_offset = 0;
    }
    Ok(())
}

/// Copies `buffer` into the pages staging it, zeroing the parts of the first
/// and last pages that the buffer does not cover.
pub fn copy_to_bounce(
    mem: &GuestMemory,
    buffer: &ExternalBuffer,
    pages: &[BouncePage],
) -> Result<(), GuestMemoryError> {
    let mut data = vec![0; PAGE_SIZE];
    for_each_piece(buffer, pages, |page, gpa, len| {
        mem.read_at(gpa, &mut data[..len])?;
        mem.write_at(page, &data[..len])
    })?;

    let (Some(first), Some(last)) = (pages.first(), pages.last()) else {
        return Ok(());
    };
    let head = buffer.page_offset();
    if head != 0 {
        mem.fill_at(first.address, 0, head)?;
    }
    let tail = (head + buffer.len as usize) % PAGE_SIZE;
    if tail != 0 {
        mem.fill_at(last.address + tail as u64, 0, PAGE_SIZE - tail)?;
    }
    Ok(())
}

/// Copies the pages staging `buffer` back into it.
pub fn copy_from_bounce(
    mem: &GuestMemory,
    buffer: &ExternalBuffer,
    pages: &[BouncePage],
) -> Result<(), GuestMemoryError> {
    let mut data = vec![0; PAGE_SIZE];
    for_each_piece(buffer, pages, |page, gpa, len| {
        mem.read_at(page, &mut data[..len])?;
        mem.write_at(gpa, &data[..len])
    })
}

/// Zeroes `pages`.
pub fn zero_pages(mem: &GuestMemory, pages: &[BouncePage]) -> Result<(), GuestMemoryError> {
    for page in pages {
        mem.fill_at(page.address, 0, PAGE_SIZE)?;
    }
    Ok(())
}
