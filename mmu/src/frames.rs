// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

extern crate alloc;
use alloc::collections::BTreeMap;

use crate::locking::SpinLock;
use crate::types::{pages_per_level, Pfn};

/// Per-frame bookkeeping state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameState {
    pub accessed: bool,
    pub dirty: bool,
    pub pins: u32,
}

/// Tracks accessed/dirty state and pin counts of the host frames backing
/// leaf mappings. This is the hypervisor-side record of the physical-page
/// objects; private installs pin their frames so the backing memory
/// cannot be migrated while the trust module holds it.
#[derive(Debug, Default)]
pub struct FrameBook {
    frames: SpinLock<BTreeMap<Pfn, FrameState>>,
}

impl FrameBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_accessed(&self, pfn: Pfn) {
        let mut frames = self.frames.lock();
        frames.entry(pfn).or_default().accessed = true;
    }

    pub fn mark_dirty(&self, pfn: Pfn) {
        let mut frames = self.frames.lock();
        let state = frames.entry(pfn).or_default();
        state.accessed = true;
        state.dirty = true;
    }

    /// Pins every 4KB frame backing a leaf at `level` starting at `pfn`.
    pub fn pin(&self, pfn: Pfn, level: u8) {
        let mut frames = self.frames.lock();
        for i in 0..pages_per_level(level) {
            frames.entry(pfn + i).or_default().pins += 1;
        }
    }

    /// Releases the pins taken by [`Self::pin`].
    pub fn unpin(&self, pfn: Pfn, level: u8) {
        let mut frames = self.frames.lock();
        for i in 0..pages_per_level(level) {
            let state = frames.entry(pfn + i).or_default();
            assert!(state.pins != 0);
            state.pins -= 1;
        }
    }

    pub fn state(&self, pfn: Pfn) -> FrameState {
        self.frames.lock().get(&pfn).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PT_LEVEL_2M;

    #[test]
    fn test_dirty_implies_accessed() {
        let book = FrameBook::new();
        book.mark_dirty(5);
        let state = book.state(5);
        assert!(state.dirty);
        assert!(state.accessed);
    }

    #[test]
    fn test_pin_covers_huge_leaf() {
        let book = FrameBook::new();
        book.pin(0x200, PT_LEVEL_2M);
        assert_eq!(book.state(0x200).pins, 1);
        assert_eq!(book.state(0x3ff).pins, 1);
        assert_eq!(book.state(0x400).pins, 0);
        book.unpin(0x200, PT_LEVEL_2M);
        assert_eq!(book.state(0x200).pins, 0);
    }
}
