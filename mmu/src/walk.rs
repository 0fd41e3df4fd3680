// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Jon Lange <jlange@microsoft.com>

use core::sync::atomic::AtomicU64;

use crate::node::{NodeArena, NodeHandle, PtNode};
use crate::reclaim::GraceGuard;
use crate::spte::Spte;
use crate::types::{gfn_round_down, gfn_to_index, pages_per_level, Gfn, ENTRY_COUNT};

/// A restartable pre-order cursor over one page-table tree.
///
/// The iterator visits every entry covering the requested range between
/// the root level and `min_level`, descending into present non-leaf
/// entries. It never caches raw pointers across steps: nodes are
/// re-resolved through the arena on every access, and when a cached
/// ancestor turns out to have been removed, traversal restarts from the
/// root instead of trusting stale state.
///
/// All node dereferences happen under the grace-period guard the
/// iterator was created with, which keeps detached nodes alive until the
/// walk ends.
#[derive(Debug)]
pub struct TdpIter<'a> {
    arena: &'a NodeArena,
    guard: &'a GraceGuard<'a>,
    /// Node handle per level, valid for the current level and above.
    path: [Option<NodeHandle>; crate::types::PT_ROOT_LEVEL as usize],
    root: NodeHandle,
    root_level: u8,
    min_level: u8,
    end_gfn: Gfn,
    /// The lowest gfn the walk still has to visit; the resume point
    /// after a restart or yield.
    next_base_gfn: Gfn,
    /// Value of `next_base_gfn` at the last yield, used to require
    /// forward progress between yields.
    yielded_gfn: Gfn,
    level: u8,
    gfn: Gfn,
    old_spte: Spte,
    valid: bool,
}

impl<'a> TdpIter<'a> {
    /// Starts a walk of `[start, end)` on the tree rooted at `root`,
    /// visiting entries no deeper than `min_level`.
    pub fn new(
        arena: &'a NodeArena,
        guard: &'a GraceGuard<'a>,
        root: NodeHandle,
        start: Gfn,
        end: Gfn,
        min_level: u8,
    ) -> Self {
        let root_level = match arena.get(guard, root) {
            Some(node) => node.level(),
            None => 0,
        };
        let mut iter = Self {
            arena,
            guard,
            path: [None; crate::types::PT_ROOT_LEVEL as usize],
            root,
            root_level,
            min_level,
            end_gfn: end,
            next_base_gfn: start,
            yielded_gfn: start,
            level: root_level,
            gfn: 0,
            old_spte: Spte::none(),
            valid: root_level != 0,
        };
        if iter.valid {
            iter.restart();
        }
        iter
    }

    /// Whether the cursor points at an entry within the range.
    pub fn valid(&self) -> bool {
        self.valid && self.gfn < self.end_gfn
    }

    /// Level of the current entry.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Base guest frame covered by the current entry.
    pub fn gfn(&self) -> Gfn {
        self.gfn
    }

    /// Last value read from the current entry.
    pub fn old_spte(&self) -> Spte {
        self.old_spte
    }

    pub(crate) fn set_old_spte(&mut self, spte: Spte) {
        self.old_spte = spte;
    }

    /// Resume point for a caller that drops its locks and rebuilds the
    /// iterator.
    pub fn next_base_gfn(&self) -> Gfn {
        self.next_base_gfn
    }

    /// Whether the walk advanced since the last yield; yielding is only
    /// allowed once provable forward progress was made, which guarantees
    /// termination of yield-retry loops.
    pub fn can_yield(&self) -> bool {
        self.next_base_gfn != self.yielded_gfn
    }

    pub(crate) fn mark_yielded(&mut self) {
        self.yielded_gfn = self.next_base_gfn;
    }

    /// Handle of the node containing the current entry.
    pub fn node_handle(&self) -> Option<NodeHandle> {
        self.path[(self.level - 1) as usize]
    }

    /// The node containing the current entry.
    pub fn node(&self) -> Option<&'a PtNode> {
        let handle = self.node_handle()?;
        self.arena.get(self.guard, handle)
    }

    /// Slot index of the current entry within its node.
    pub fn index(&self) -> usize {
        gfn_to_index(self.gfn, self.level)
    }

    /// The raw atomic slot of the current entry.
    pub fn sptep(&self) -> Option<&'a AtomicU64> {
        self.node().map(|node| node.slot(self.index()))
    }

    /// Re-reads the current entry. Returns false if the containing node
    /// has been detached.
    fn read_current(&mut self) -> bool {
        match self.node() {
            Some(node) => {
                self.old_spte = node.entry(self.index());
                true
            }
            None => false,
        }
    }

    /// Repositions at the root entry covering the resume point.
    fn restart(&mut self) {
        self.level = self.root_level;
        self.path[(self.level - 1) as usize] = Some(self.root);
        self.gfn = gfn_round_down(self.next_base_gfn, self.level);
        if !self.read_current() {
            // The root itself is gone; the walk cannot continue.
            self.valid = false;
        }
    }

    /// Refreshes the cached value of the current entry, restarting from
    /// the root if the containing node has been removed.
    pub fn refresh(&mut self) {
        if !self.read_current() {
            self.restart();
        }
    }

    fn try_step_down(&mut self) -> bool {
        if self.level == self.min_level {
            return false;
        }

        // Reread the entry before stepping down, to avoid traversing
        // into a table that is no longer linked from it.
        if !self.read_current() {
            self.restart();
            return true;
        }
        if !self.old_spte.is_present() || self.old_spte.is_last(self.level) {
            return false;
        }

        let child = NodeHandle::from_pfn(self.old_spte.pfn());
        if self.arena.get(self.guard, child).is_none() {
            // The child was detached after the entry was read; the
            // entry is mid-mutation and will be revisited as whatever
            // value the mutator commits.
            return false;
        }

        self.level -= 1;
        self.path[(self.level - 1) as usize] = Some(child);
        self.gfn = gfn_round_down(self.next_base_gfn, self.level);
        if !self.read_current() {
            self.restart();
        }
        true
    }

    fn try_step_side(&mut self) -> bool {
        if self.index() == ENTRY_COUNT - 1 {
            return false;
        }

        self.gfn += pages_per_level(self.level);
        self.next_base_gfn = self.gfn;
        if !self.read_current() {
            self.restart();
        }
        true
    }

    fn try_step_up(&mut self) -> bool {
        if self.level == self.root_level {
            return false;
        }
        self.level += 1;
        self.gfn = gfn_round_down(self.gfn, self.level);
        if !self.read_current() {
            self.restart();
        }
        true
    }

    /// Advances to the next entry in pre-order: down into a present
    /// non-leaf, else sideways, else up until a sideways step is
    /// possible.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        if self.try_step_down() {
            return;
        }
        loop {
            if self.try_step_side() {
                return;
            }
            if !self.try_step_up() {
                self.valid = false;
                return;
            }
        }
    }
}
