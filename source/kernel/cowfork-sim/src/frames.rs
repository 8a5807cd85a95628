// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted physical frames.

use cowfork_abi::layout::PGSIZE;

struct Frame {
    refs: u32,
    data: Vec<u8>,
}

/// Fixed pool of frames. A frame returns to the free list when its last
/// mapping goes away.
pub(crate) struct FrameTable {
    frames: Vec<Frame>,
    free: Vec<usize>,
    allocations: u64,
}

impl FrameTable {
    pub(crate) fn new(count: usize) -> Self {
        let frames = (0..count).map(|_| Frame { refs: 0, data: Vec::new() }).collect();
        // Hand out low frame numbers first.
        let free = (0..count).rev().collect();
        Self { frames, free, allocations: 0 }
    }

    /// Takes a zeroed frame off the free list. The caller must map it, which
    /// takes the first reference.
    pub(crate) fn alloc(&mut self) -> Option<usize> {
        let index = self.free.pop()?;
        let frame = &mut self.frames[index];
        frame.data.clear();
        frame.data.resize(PGSIZE, 0);
        self.allocations += 1;
        Some(index)
    }

    pub(crate) fn incref(&mut self, index: usize) {
        self.frames[index].refs += 1;
    }

    pub(crate) fn decref(&mut self, index: usize) {
        let frame = &mut self.frames[index];
        debug_assert!(frame.refs > 0, "frame {index} over-released");
        if frame.refs == 0 {
            return;
        }
        frame.refs -= 1;
        if frame.refs == 0 {
            self.free.push(index);
        }
    }

    pub(crate) fn refs(&self, index: usize) -> u32 {
        self.frames[index].refs
    }

    pub(crate) fn bytes(&self, index: usize) -> &[u8] {
        &self.frames[index].data
    }

    pub(crate) fn bytes_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.frames[index].data
    }

    pub(crate) fn in_use(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    pub(crate) fn allocations(&self) -> u64 {
        self.allocations
    }
}
