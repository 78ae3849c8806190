//! Walks the address space page by page looking for unmapped pages
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

/// Which way the walk moves from its origin
#[derive(Debug, Clone, Copy)]
pub(super) enum Direction {
    /// Towards higher addresses
    Up,
    /// Towards lower addresses
    Down,
}

/// Yields page-aligned addresses of unmapped pages, nearest to the origin first
pub(super) struct FreePages {
    /// Addresses the walk may visit
    window: Range<usize>,
    /// Walk direction
    direction: Direction,
    /// Next address to query
    cursor: usize,
    /// Host page size
    page_size: usize,
}

impl FreePages {
    /// Starts a walk at the page containing `origin`
    pub(super) fn new(origin: usize, window: Range<usize>, direction: Direction) -> Self {
        let page_size = region::page::size();
        Self {
            window,
            direction,
            cursor: origin - origin % page_size,
            page_size,
        }
    }

    /// Moves the cursor past `[start, end)`
    fn skip(&mut self, start: usize, end: usize) {
        self.cursor = match self.direction {
            Direction::Up => end,
            Direction::Down => start.saturating_sub(self.page_size),
        };
    }
}

impl Iterator for FreePages {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor > 0 && self.window.contains(&self.cursor) {
            let address = self.cursor;
            match region::query(address as *const u8) {
                Ok(region) => {
                    let range = region.as_range();
                    self.skip(range.start, range.end);
                }
                Err(region::Error::UnmappedRegion) => {
                    self.skip(address, address + self.page_size);
                    return Some(Ok(address));
                }
                Err(e) => {
                    self.cursor = 0;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
