//! Pages of executable memory, each carved into slots by a [`SlicePool`]
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};

use super::search::{Direction, FreePages};
use super::AllocError;

/// Pages mapped near hook targets
pub(super) struct TrampolinePool {
    /// Furthest distance a page may be from the origin it serves
    max_distance: usize,
    /// Every page mapped so far; never unmapped
    pages: Vec<SlicePool<u8>>,
}

impl TrampolinePool {
    /// Creates an empty pool
    pub(super) fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pages: Vec::new(),
        }
    }

    /// Hands out a slot near `origin`, mapping a new page when no existing one fits
    pub(super) fn allocate(
        &mut self,
        origin: usize,
        size: usize,
    ) -> Result<SliceBox<u8>, AllocError> {
        let window =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        let reusable = self
            .pages
            .iter()
            .filter(|page| {
                let start = page.as_ptr() as usize;
                window.contains(&start) && window.contains(&(start + page.len() - 1))
            })
            .find_map(|page| page.alloc(size));
        if let Some(slot) = reusable {
            return Ok(slot);
        }

        let page = self.map_near(&window, origin, size)?;
        let slot = page.alloc(size).ok_or(AllocError::OutOfMemory { origin })?;
        self.pages.push(page);
        Ok(slot)
    }

    /// Maps a fresh page inside `window`, trying addresses after `origin` first
    fn map_near(
        &self,
        window: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, AllocError> {
        let page_size = region::page::size();
        let len = size.div_ceil(page_size).max(1) * page_size;

        let candidates = FreePages::new(origin, window.clone(), Direction::Up)
            .chain(FreePages::new(origin, window.clone(), Direction::Down));
        let mut last_error = None;
        for candidate in candidates {
            let address = candidate?;
            if address.checked_add(len).map_or(true, |end| end > window.end) {
                continue;
            }
            // the page may have been claimed between the query and the map
            match map_fixed(address, len) {
                Ok(memory) => return Ok(SlicePool::new(memory)),
                Err(mmap::MapError::ErrNoMem) => {}
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => AllocError::Map(e),
            None => AllocError::OutOfMemory { origin },
        })
    }
}

/// Maps `len` read/write/execute bytes exactly at `address`
fn map_fixed(address: usize, len: usize) -> Result<MappedPage, mmap::MapError> {
    mmap::MemoryMap::new(
        len,
        &[
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
            mmap::MapOption::MapAddr(address as *const u8),
        ],
    )
    .map(MappedPage)
}

/// Backing storage of one pool page
struct MappedPage(mmap::MemoryMap);

impl AsRef<[u8]> for MappedPage {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the mapping is readable and lives as long as `self`
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for MappedPage {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is writable and uniquely borrowed through `self`
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// SAFETY: the mapping is plain memory; access is serialized by the slice pool
unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}
