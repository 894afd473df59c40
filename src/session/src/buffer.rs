// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

pub use bytes::buf::UninitSlice;
pub use bytes::{Buf, BufMut};

use core::borrow::Borrow;

/// A simple growable byte buffer backed by a contiguous allocation. The buffer
/// grows in power-of-two steps up from `target_size` and shrinks back down to
/// `target_size` once its contents are fully consumed.
pub struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    target_size: usize,
}

impl Buffer {
    /// Create a new buffer that can hold up to `target_size` bytes without
    /// resizing.
    pub fn new(target_size: usize) -> Self {
        let target_size = std::cmp::max(target_size, 1).next_power_of_two();
        let data = vec![0; target_size];

        Self {
            data,
            read_offset: 0,
            write_offset: 0,
            target_size,
        }
    }

    /// Returns the current capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Reserve space for `amt` additional bytes, compacting and growing as
    /// needed.
    pub fn reserve(&mut self, amt: usize) {
        if self.remaining() == 0 {
            self.read_offset = 0;
            self.write_offset = 0;
        }

        if amt <= self.remaining_mut() {
            return;
        }

        // try to reclaim consumed space before growing
        if self.read_offset > 0 {
            self.data.copy_within(self.read_offset..self.write_offset, 0);
            self.write_offset -= self.read_offset;
            self.read_offset = 0;
            if amt <= self.remaining_mut() {
                return;
            }
        }

        let size = (self.write_offset + amt).next_power_of_two();
        self.data.resize(size, 0);
    }

    /// Clear the buffer, shrinking an oversized allocation back to the target
    /// size.
    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;

        if self.data.len() > self.target_size {
            trace!("shrinking buffer to {} bytes", self.target_size);
            self.data.truncate(self.target_size);
            self.data.shrink_to_fit();
        }
    }

    /// The writable tail of the buffer, used to read from a socket directly
    /// into this buffer. Pair with `advance_mut` for the bytes written.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.data[self.write_offset..]
    }
}

impl Borrow<[u8]> for Buffer {
    fn borrow(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.write_offset - self.read_offset
    }

    fn chunk(&self) -> &[u8] {
        self.borrow()
    }

    fn advance(&mut self, amt: usize) {
        self.read_offset = std::cmp::min(self.read_offset + amt, self.write_offset);
        if self.read_offset == self.write_offset {
            self.clear();
        }
    }
}

unsafe impl BufMut for Buffer {
    fn remaining_mut(&self) -> usize {
        self.data.len() - self.write_offset
    }

    unsafe fn advance_mut(&mut self, amt: usize) {
        self.write_offset = std::cmp::min(self.write_offset + amt, self.data.len());
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let unfilled = &mut self.data[self.write_offset..];
        unfilled.into()
    }

    fn put_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        self.data[self.write_offset..self.write_offset + src.len()].copy_from_slice(src);
        self.write_offset += src.len();
    }
}
