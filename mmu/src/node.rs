// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::backend::MirrorHandle;
use crate::error::MmuError;
use crate::locking::SpinLock;
use crate::reclaim::GraceGuard;
use crate::spte::Spte;
use crate::types::{pages_per_level, Gfn, MemClass, ENTRY_COUNT, PT_ROOT_LEVEL};

/// Stable identifier of a node in the arena. Non-leaf entries store the
/// child's handle in their frame field, which also serves as the parent
/// back-link representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The handle as stored in a non-leaf entry's frame field.
    pub const fn as_pfn(self) -> u64 {
        self.0 as u64
    }

    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn as u32)
    }
}

/// Location of one entry slot: owning node plus slot index. Used for
/// parent back-links.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRef {
    pub node: NodeHandle,
    pub index: u16,
}

/// One node of the page-table tree: a fixed array of atomic entry slots
/// plus the descriptor recording where the node sits in the tree.
///
/// A node is exclusively owned by its parent slot, except roots, which
/// are reference counted: one reference per user plus one held by the
/// manager until explicit invalidation.
#[derive(Debug)]
pub struct PtNode {
    /// The entry slots. Always mutated through the atomic mutation
    /// protocol, never by direct store outside the exclusive lock.
    entries: [AtomicU64; ENTRY_COUNT],
    /// Level of the entries contained in this node.
    level: u8,
    /// First guest frame covered by slot 0.
    base_gfn: Gfn,
    /// Guest address space this node belongs to.
    as_id: u16,
    /// Memory class of the subtree.
    class: MemClass,
    /// Back-link to the parent slot; `None` for roots.
    parent: Option<SlotRef>,
    /// Mirror-table token held by the external trust module for private
    /// non-leaf nodes.
    mirror: Option<MirrorHandle>,
    /// Reference count, meaningful for roots only.
    refcount: AtomicU32,
    /// Set once the root has been handed to asynchronous reclamation.
    invalid: AtomicBool,
}

impl PtNode {
    pub fn new(
        level: u8,
        base_gfn: Gfn,
        as_id: u16,
        class: MemClass,
        parent: Option<SlotRef>,
        mirror: Option<MirrorHandle>,
    ) -> Self {
        Self {
            entries: core::array::from_fn(|_| AtomicU64::new(Spte::none().into_bits())),
            level,
            base_gfn,
            as_id,
            class,
            parent,
            mirror,
            refcount: AtomicU32::new(0),
            invalid: AtomicBool::new(false),
        }
    }

    /// Builds a root node with its reference count preset to two: one
    /// reference for the creator, one for the manager.
    pub fn new_root(as_id: u16, class: MemClass) -> Self {
        let node = Self::new(PT_ROOT_LEVEL, 0, as_id, class, None, None);
        node.refcount.store(2, Ordering::Relaxed);
        node
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn base_gfn(&self) -> Gfn {
        self.base_gfn
    }

    pub fn as_id(&self) -> u16 {
        self.as_id
    }

    pub fn class(&self) -> MemClass {
        self.class
    }

    pub fn is_private(&self) -> bool {
        self.class.is_private()
    }

    pub fn parent(&self) -> Option<SlotRef> {
        self.parent
    }

    pub fn mirror(&self) -> Option<MirrorHandle> {
        self.mirror
    }

    pub fn is_root(&self) -> bool {
        self.level == PT_ROOT_LEVEL && self.parent.is_none()
    }

    /// The raw slot at `index`.
    pub fn slot(&self, index: usize) -> &AtomicU64 {
        &self.entries[index]
    }

    /// Reads the entry at `index`.
    pub fn entry(&self, index: usize) -> Spte {
        Spte::from_bits(self.entries[index].load(Ordering::Acquire))
    }

    /// First guest frame covered by the entry at `index`.
    pub fn entry_gfn(&self, index: usize) -> Gfn {
        self.base_gfn + index as u64 * pages_per_level(self.level)
    }

    /// Initializes the root reference count: one for the creator, one for
    /// the manager.
    pub fn init_root_refcount(&self) {
        self.refcount.store(2, Ordering::Release);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Acquires a reference unless the count already dropped to zero.
    pub fn try_get(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |c| {
                (c != 0).then(|| c + 1)
            })
            .is_ok()
    }

    /// Drops one reference; returns true when this was the last one.
    pub fn put(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0);
        prev == 1
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Marks the root invalid. Returns false if it already was.
    pub fn invalidate(&self) -> bool {
        !self.invalid.swap(true, Ordering::AcqRel)
    }
}

/// A node removed from the arena, owned by the grace-period collector
/// until no walker can still reference it.
#[derive(Debug)]
pub struct DetachedNode {
    ptr: *mut PtNode,
    slot: u32,
}

// SAFETY: the detached node is exclusively owned by the collector; the
// raw pointer is only dereferenced to drop the allocation.
unsafe impl Send for DetachedNode {}

impl DetachedNode {
    /// Frees the node's storage and returns the arena slot for reuse.
    pub(crate) fn free(self, arena: &NodeArena) {
        let slot = self.slot;
        // SAFETY: the pointer originates from `Box::into_raw` in
        // `NodeArena::alloc` and ownership was transferred to this
        // object by `NodeArena::detach`.
        drop(unsafe { Box::from_raw(self.ptr) });
        arena.recycle(slot);
    }
}

/// Fixed-capacity arena of page-table nodes.
///
/// The slot array never moves, so a handle can be dereferenced without
/// holding any lock; the grace-period collector guarantees the backing
/// allocation outlives every reader that could have seen the handle.
#[derive(Debug)]
pub struct NodeArena {
    slots: Box<[AtomicPtr<PtNode>]>,
    free: SpinLock<Vec<u32>>,
}

impl NodeArena {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicPtr::new(core::ptr::null_mut()));
        // Hand out low indices first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots: slots.into_boxed_slice(),
            free: SpinLock::new(free),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live nodes, for statistics and tests.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.lock().len()
    }

    /// Allocates a slot for `node`.
    pub fn alloc(&self, node: PtNode) -> Result<NodeHandle, MmuError> {
        self.alloc_with(|_| node)
    }

    /// Allocates a slot and builds the node from its own handle, for
    /// descriptors that embed handle-derived state.
    pub fn alloc_with(
        &self,
        f: impl FnOnce(NodeHandle) -> PtNode,
    ) -> Result<NodeHandle, MmuError> {
        let slot = self.free.lock().pop().ok_or(MmuError::NoMemory)?;
        let handle = NodeHandle(slot);
        let ptr = Box::into_raw(Box::new(f(handle)));
        let prev = self.slots[slot as usize].swap(ptr, Ordering::AcqRel);
        assert!(prev.is_null());
        Ok(handle)
    }

    /// Dereferences `handle`. The guard witnesses the read-side critical
    /// section that keeps the node alive.
    pub fn get<'a>(&'a self, _guard: &'a GraceGuard<'_>, handle: NodeHandle) -> Option<&'a PtNode> {
        let ptr = self.slots[handle.index()].load(Ordering::Acquire);
        // SAFETY: a non-null slot pointer refers to a live allocation;
        // detached nodes are only freed after the grace period the guard
        // participates in.
        unsafe { ptr.as_ref() }
    }

    /// Unlinks `handle` from the arena. The caller must have made the
    /// node unreachable from every root beforehand; the returned object
    /// must be handed to the collector.
    pub fn detach(&self, handle: NodeHandle) -> Option<DetachedNode> {
        let ptr = self.slots[handle.index()].swap(core::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return None;
        }
        Some(DetachedNode {
            ptr,
            slot: handle.0,
        })
    }

    fn recycle(&self, slot: u32) {
        self.free.lock().push(slot);
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.swap(core::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: every non-null slot pointer came from
                // `Box::into_raw` in `alloc_with` and has not been
                // detached, so ownership is still with the arena.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::GraceCollector;
    use crate::types::{PT_LEVEL_4K, PT_ROOT_LEVEL};

    fn test_node(level: u8) -> PtNode {
        PtNode::new(level, 0, 0, MemClass::Shared, None, None)
    }

    #[test]
    fn test_alloc_and_get() {
        let arena = NodeArena::new(8);
        let collector = GraceCollector::new();
        let handle = arena.alloc(test_node(PT_LEVEL_4K)).unwrap();
        assert_eq!(arena.in_use(), 1);

        let guard = collector.pin();
        let node = arena.get(&guard, handle).unwrap();
        assert_eq!(node.level(), PT_LEVEL_4K);
        assert!(node.entry(0) == Spte::none());
    }

    #[test]
    fn test_exhaustion() {
        let arena = NodeArena::new(2);
        arena.alloc(test_node(1)).unwrap();
        arena.alloc(test_node(1)).unwrap();
        assert_eq!(arena.alloc(test_node(1)), Err(MmuError::NoMemory));
    }

    #[test]
    fn test_detach_hides_node() {
        let arena = NodeArena::new(4);
        let collector = GraceCollector::new();
        let handle = arena.alloc(test_node(1)).unwrap();

        let detached = arena.detach(handle).unwrap();
        let guard = collector.pin();
        assert!(arena.get(&guard, handle).is_none());
        drop(guard);

        detached.free(&arena);
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    fn test_root_refcount() {
        let node = test_node(PT_ROOT_LEVEL);
        node.init_root_refcount();
        assert_eq!(node.refcount(), 2);
        assert!(node.try_get());
        assert!(!node.put());
        assert!(!node.put());
        assert!(node.put());
        // Once the count hits zero no new reference can be taken.
        assert!(!node.try_get());
    }
}
