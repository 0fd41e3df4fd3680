// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::backend::{MirrorHandle, TrustModule};
use crate::config::MmuConfig;
use crate::error::MmuError;
use crate::frames::FrameBook;
use crate::locking::{RWLock, SpinLock};
use crate::node::{NodeArena, NodeHandle, PtNode, SlotRef};
use crate::reclaim::{GraceCollector, GraceGuard};
use crate::sept::SeptCoordinator;
use crate::spte::{PtePerms, Spte, ACCESSED_BIT, DIRTY_BIT, REMOVED_BITS};
use crate::stats::MmuStats;
use crate::tlb::TlbTracker;
use crate::types::{
    pages_per_level, Gfn, MemClass, Pfn, ENTRY_COUNT, MAX_GFN, PT_LEVEL_1G, PT_LEVEL_4K,
    PT_ROOT_LEVEL,
};
use crate::utils::GfnRange;
use crate::walk::TdpIter;

/// Policy for private mappings in a range zap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZapPrivate {
    /// Leave private mappings alone.
    Skip,
    /// Temporarily revoke them; the frames stay owned by the module.
    Block,
    /// Fully remove them and give up the frames.
    Remove,
}

/// One leaf mapping reported by a read-only walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    pub gfn: Gfn,
    pub level: u8,
    pub perms: PtePerms,
    pub pfn: Pfn,
    pub accessed: bool,
    pub dirty: bool,
    pub private_zapped: bool,
}

/// Attempts a single entry transition, returning the observed value on
/// interference.
pub(crate) fn try_cas_entry(sptep: &AtomicU64, old: Spte, new: Spte) -> Result<(), Spte> {
    sptep
        .compare_exchange(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(Spte::from_bits)
}

/// The page-table manager of one virtual machine.
///
/// Two lock disciplines coexist on the tree: page faults and the
/// asynchronous root reclamation hold the lock shared and coordinate
/// purely through per-entry compare-and-swap plus the freeze/commit
/// protocol; teardown and administrative operations hold it exclusively
/// and may store entries directly.
#[derive(Debug)]
pub struct TdpMmu {
    config: MmuConfig,
    arena: NodeArena,
    reclaim: GraceCollector,
    mmu_lock: RWLock<()>,
    roots: SpinLock<Vec<NodeHandle>>,
    pending_zap: SpinLock<Vec<NodeHandle>>,
    zap_in_flight: AtomicUsize,
    stats: MmuStats,
    frames: FrameBook,
    tlb: TlbTracker,
    module: Arc<dyn TrustModule>,
    finalized: AtomicBool,
    dead: AtomicBool,
    resched: AtomicBool,
}

impl TdpMmu {
    pub fn new(config: MmuConfig, module: Arc<dyn TrustModule>) -> Result<Self, MmuError> {
        config.validate()?;
        Ok(Self {
            config,
            arena: NodeArena::new(config.node_capacity),
            reclaim: GraceCollector::new(),
            mmu_lock: RWLock::new(()),
            roots: SpinLock::new(Vec::new()),
            pending_zap: SpinLock::new(Vec::new()),
            zap_in_flight: AtomicUsize::new(0),
            stats: MmuStats::new(),
            frames: FrameBook::new(),
            tlb: TlbTracker::new(),
            module,
            finalized: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            resched: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub fn stats(&self) -> &MmuStats {
        &self.stats
    }

    pub fn frames(&self) -> &FrameBook {
        &self.frames
    }

    pub fn tlb(&self) -> &TlbTracker {
        &self.tlb
    }

    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub(crate) fn reclaim(&self) -> &GraceCollector {
        &self.reclaim
    }

    pub(crate) fn mmu_lock(&self) -> &RWLock<()> {
        &self.mmu_lock
    }

    /// Marks the end of VM build; subsequent private installs use the
    /// runtime augment operation instead of the build-time add.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            log::error!("page-table state corrupted, VM must be terminated");
        }
    }

    /// Signals that walks should yield at the next safe point.
    pub fn request_resched(&self) {
        self.resched.store(true, Ordering::Release);
    }

    fn should_yield(&self, iter: &TdpIter<'_>) -> bool {
        self.resched.load(Ordering::Acquire) && iter.can_yield()
    }

    /// Advances the TLB epoch and waits for all vCPUs to observe it.
    pub fn flush_remote(&self) {
        self.tlb.track(self.module.as_ref());
    }

    pub(crate) fn sept(&self) -> SeptCoordinator<'_> {
        SeptCoordinator::new(self.module.as_ref(), &self.tlb, &self.frames, &self.dead)
    }

    // ---------------------------------------------------------------
    // Atomic mutation protocol
    // ---------------------------------------------------------------

    /// Shared-path transition of one entry: compare-and-swap against the
    /// last observed value, with the freeze/commit sequence inserted for
    /// private transitions that must be mirrored by the trust module.
    ///
    /// On interference, `old` is refreshed with the entry's current
    /// value and `MmuError::Busy` is returned.
    pub(crate) fn set_spte_atomic_raw(
        &self,
        guard: &GraceGuard<'_>,
        private: bool,
        sptep: &AtomicU64,
        gfn: Gfn,
        level: u8,
        old: &mut Spte,
        new: Spte,
    ) -> Result<(), MmuError> {
        if self.is_dead() {
            return Err(MmuError::VmDead);
        }
        // Frozen entries belong to another thread's critical window;
        // the caller must back off and retry instead.
        assert!(!old.is_removed());

        if private && !new.is_removed() {
            // Freeze the entry so the local value and the module's
            // mirror change as one observable step.
            if let Err(cur) = try_cas_entry(sptep, *old, Spte::removed()) {
                *old = cur;
                return Err(MmuError::Busy);
            }
            if new.is_present() {
                if let Err(err) = self.apply_private_present(gfn, level, *old, new) {
                    sptep.store(old.into_bits(), Ordering::Release);
                    return Err(err);
                }
                self.handle_changed_spte(guard, gfn, *old, new, level, private, true);
            } else {
                // Removal direction: the module calls run from the
                // changed-entry bookkeeping while the entry is frozen.
                self.handle_changed_spte(guard, gfn, *old, new, level, private, true);
            }
            sptep.store(new.into_bits(), Ordering::Release);
        } else {
            if let Err(cur) = try_cas_entry(sptep, *old, new) {
                *old = cur;
                return Err(MmuError::Busy);
            }
            self.handle_changed_spte(guard, gfn, *old, new, level, private, true);
        }
        Ok(())
    }

    /// [`Self::set_spte_atomic_raw`] positioned by an iterator.
    pub(crate) fn set_spte_atomic(
        &self,
        guard: &GraceGuard<'_>,
        iter: &mut TdpIter<'_>,
        new: Spte,
    ) -> Result<(), MmuError> {
        let node = iter.node().ok_or(MmuError::Busy)?;
        let sptep = node.slot(iter.index());
        let mut old = iter.old_spte();
        let res = self.set_spte_atomic_raw(
            guard,
            node.is_private(),
            sptep,
            iter.gfn(),
            iter.level(),
            &mut old,
            new,
        );
        iter.set_old_spte(old);
        res
    }

    /// Exclusive-path transition: the caller holds the tree lock for
    /// write, so the entry is stored directly. Module failures cannot be
    /// racing anybody here and are treated as protocol violations.
    pub(crate) fn set_spte_exclusive(&self, guard: &GraceGuard<'_>, iter: &mut TdpIter<'_>, new: Spte) {
        let Some(node) = iter.node() else {
            self.mark_dead();
            return;
        };
        let sptep = node.slot(iter.index());
        assert!(!new.is_removed());
        let old = Spte::from_bits(sptep.swap(new.into_bits(), Ordering::AcqRel));
        assert!(!old.is_removed());

        if node.is_private() && new.is_present() {
            if self
                .apply_private_present(iter.gfn(), iter.level(), old, new)
                .is_err()
            {
                self.mark_dead();
            }
        }
        self.handle_changed_spte(guard, iter.gfn(), old, new, iter.level(), node.is_private(), false);
        iter.set_old_spte(old);
    }

    /// Mirrors a transition to a present private entry into the trust
    /// module. Called inside the frozen window of the entry.
    fn apply_private_present(
        &self,
        gfn: Gfn,
        level: u8,
        old: Spte,
        new: Spte,
    ) -> Result<(), MmuError> {
        let sept = self.sept();

        if old.is_private_zapped() {
            // Restoring a temporarily revoked mapping. The module still
            // holds the original frame; a different frame here means
            // the records diverged.
            if old.pfn() != new.pfn() || !new.is_last(level) {
                log::error!(
                    "private-zapped entry restored with different mapping: \
                     gfn {:#x} level {} old {:#x} new {:#x}",
                    gfn,
                    level,
                    old.into_bits(),
                    new.into_bits()
                );
                self.mark_dead();
                return Err(MmuError::Corrupted);
            }
            return sept.unblock_leaf(gfn, level);
        }

        if new.is_last(level) {
            if old.is_present() {
                // Permission/software-bit change in place; the frame
                // must not move.
                if old.pfn() != new.pfn() {
                    self.mark_dead();
                    return Err(MmuError::Corrupted);
                }
                return Ok(());
            }
            return sept.map_leaf(gfn, level, new.pfn(), self.is_finalized());
        }

        // New non-leaf: demote a huge leaf into the child table, or link
        // a freshly allocated one.
        let table = MirrorHandle(new.pfn());
        if old.is_leaf(level) {
            return sept.split_leaf(gfn, level, table);
        }
        sept.link_child(gfn, level, table)
    }

    /// Changed-entry bookkeeping. Runs exactly once per successful
    /// transition, never retried: statistics, accessed/dirty
    /// propagation, recursive dismantling of removed subtrees and the
    /// private-leaf teardown actions.
    fn handle_changed_spte(
        &self,
        guard: &GraceGuard<'_>,
        gfn: Gfn,
        old: Spte,
        new: Spte,
        level: u8,
        private: bool,
        shared: bool,
    ) {
        let was_present = old.is_present();
        let is_present = new.is_present();
        let was_leaf = was_present && old.is_last(level);
        let is_leaf = is_present && new.is_last(level);
        let pfn_changed = old.pfn() != new.pfn();

        if was_leaf && is_leaf && pfn_changed {
            // A present leaf's frame never changes in place; the frame
            // must pass through a non-present state first. Anything else
            // means an invalidation was lost and the module's mirror can
            // no longer be trusted.
            log::error!(
                "present leaf replaced in place: gfn {:#x} level {} old {:#x} new {:#x}",
                gfn,
                level,
                old.into_bits(),
                new.into_bits()
            );
            self.mark_dead();
            return;
        }

        if old == new {
            return;
        }

        if old.is_private_zapped() && !is_present {
            if new.is_private_zapped() {
                // blocked -> blocked has no meaning.
                self.mark_dead();
                return;
            }
            // Full removal of a temporarily revoked leaf, using the
            // retained frame.
            let _ = self.sept().remove_blocked_leaf(gfn, level, old.pfn());
            return;
        }

        if !was_present && !is_present {
            // Non-present to non-present carries no side effects; the
            // removal sentinel and fresh private-zapped images pass
            // through here.
            if new.is_private_zapped() && !old.is_private_zapped() {
                self.mark_dead();
            }
            return;
        }

        if is_leaf != was_leaf {
            self.stats.adjust_leaf(level, if is_leaf { 1 } else { -1 });
        }

        if was_leaf && old.dirty() && (!is_present || !new.dirty() || pfn_changed) {
            self.frames.mark_dirty(old.pfn());
        }

        // Recursively dismantle the subtree if the change removed a
        // present non-leaf pointer.
        if was_present && !old.is_last(level) && (is_leaf || !is_present) {
            self.handle_removed_node(guard, NodeHandle::from_pfn(old.pfn()), shared);
        }

        // Mirror private leaf removals after the children above; the
        // module empties child tables bottom-up.
        if private && was_leaf && !is_present {
            // The entry is frozen here, so transient module reports are
            // retried in place; real failures mark the VM dead inside
            // the coordinator.
            let sept = self.sept();
            if new.is_private_zapped() {
                let _ = sept.block_leaf_frozen(gfn, level);
            } else {
                let _ = sept.zap_and_remove_leaf(gfn, level, old.pfn());
            }
        }

        if was_leaf && old.accessed() && (!is_present || !new.accessed() || pfn_changed) {
            self.frames.mark_accessed(old.pfn());
        }
    }

    /// Dismantles a page-table node that was removed from the tree:
    /// freezes every slot, recurses through the bookkeeping, then hands
    /// the empty node to the grace-period collector.
    fn handle_removed_node(&self, guard: &GraceGuard<'_>, handle: NodeHandle, shared: bool) {
        let Some(node) = self.arena.get(guard, handle) else {
            // The subtree was dismantled twice; the protocol makes this
            // unreachable.
            self.mark_dead();
            return;
        };
        let level = node.level();
        let private = node.is_private();
        self.stats.account_table(private, -1);

        for i in 0..ENTRY_COUNT {
            let sptep = node.slot(i);
            let gfn = node.entry_gfn(i);
            let old = if shared {
                // Set the entry to the sentinel so no fault thread can
                // install into the detached table. An already-frozen
                // entry belongs to such a thread; wait for it to commit
                // or restore.
                loop {
                    let old = Spte::from_bits(sptep.swap(REMOVED_BITS, Ordering::AcqRel));
                    if !old.is_removed() {
                        break old;
                    }
                    core::hint::spin_loop();
                }
            } else {
                let old = node.entry(i);
                if !old.is_present() && !old.is_private_zapped() {
                    continue;
                }
                sptep.store(REMOVED_BITS, Ordering::Release);
                old
            };
            self.handle_changed_spte(guard, gfn, old, Spte::removed(), level, private, shared);
        }

        if private {
            if let Some(mirror) = node.mirror() {
                // The entry that pointed at this table lives one level
                // up; the module unlinks its mirror now that the table
                // is empty.
                self.sept().unlink_child(node.base_gfn(), level + 1, mirror);
            }
        }

        if let Some(detached) = self.arena.detach(handle) {
            self.reclaim.defer(detached);
        }
    }

    // ---------------------------------------------------------------
    // Child table allocation (fault and split paths)
    // ---------------------------------------------------------------

    /// Allocates a child node for the iterator's current entry.
    pub(crate) fn alloc_child_node(
        &self,
        iter: &TdpIter<'_>,
    ) -> Result<NodeHandle, MmuError> {
        let node = iter.node().ok_or(MmuError::Busy)?;
        let parent = SlotRef {
            node: iter.node_handle().ok_or(MmuError::Busy)?,
            index: iter.index() as u16,
        };
        let level = iter.level() - 1;
        let base_gfn = iter.gfn();
        let as_id = node.as_id();
        let class = node.class();
        let private = node.is_private();
        self.arena.alloc_with(|handle| {
            PtNode::new(
                level,
                base_gfn,
                as_id,
                class,
                Some(parent),
                private.then(|| MirrorHandle(handle.as_pfn())),
            )
        })
    }

    /// Frees a node that was never linked into the tree. No grace period
    /// is needed because no walker could have seen it.
    pub(crate) fn free_unlinked_node(&self, handle: NodeHandle) {
        if let Some(detached) = self.arena.detach(handle) {
            detached.free(&self.arena);
        }
    }

    /// Replaces the iterator's current entry with a pointer to `child`.
    /// If the entry currently holds a huge leaf, the child is populated
    /// first by projecting the parent's mapping across its slots, so the
    /// split is invisible to the guest.
    pub(crate) fn install_child_table(
        &self,
        guard: &GraceGuard<'_>,
        iter: &mut TdpIter<'_>,
        child: NodeHandle,
        shared: bool,
    ) -> Result<(), MmuError> {
        let parent_node = iter.node().ok_or(MmuError::Busy)?;
        let private = parent_node.is_private();
        let old = iter.old_spte();
        let level = iter.level();
        let splitting = old.is_leaf(level);

        if splitting {
            let child_node = self.arena.get(guard, child).ok_or(MmuError::Busy)?;
            let child_level = level - 1;
            for i in 0..ENTRY_COUNT {
                let leaf = Spte::leaf(
                    old.pfn() + i as u64 * pages_per_level(child_level),
                    child_level,
                    old.perms(),
                )
                .with_accessed(old.accessed())
                .with_dirty(old.dirty());
                child_node.slot(i).store(leaf.into_bits(), Ordering::Release);
            }
        }

        let new = Spte::nonleaf(child.as_pfn());
        if shared {
            self.set_spte_atomic(guard, iter, new)?;
        } else {
            self.set_spte_exclusive(guard, iter, new);
        }

        self.stats.account_table(private, 1);
        if splitting {
            // The huge leaf was debited by the bookkeeping; credit the
            // small mappings that replaced it.
            self.stats.adjust_leaf(level - 1, ENTRY_COUNT as i64);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Root lifecycle
    // ---------------------------------------------------------------

    /// Returns an existing valid root for `(as_id, class)` or creates
    /// one. The caller owns one reference and must release it with
    /// [`Self::put_root`].
    pub fn get_or_create_root(&self, as_id: u16, class: MemClass) -> Result<NodeHandle, MmuError> {
        if self.is_dead() {
            return Err(MmuError::VmDead);
        }
        if as_id >= self.config.nr_address_spaces {
            return Err(MmuError::InvalidArgument);
        }
        if class.is_private() && !self.config.private_enabled {
            return Err(MmuError::InvalidArgument);
        }

        let _wl = self.mmu_lock.lock_write();
        let guard = self.reclaim.pin();

        {
            let roots = self.roots.lock();
            for &handle in roots.iter() {
                if let Some(node) = self.arena.get(&guard, handle) {
                    if node.as_id() == as_id
                        && node.class() == class
                        && !node.is_invalid()
                        && node.try_get()
                    {
                        return Ok(handle);
                    }
                }
            }
        }

        let handle = self.arena.alloc_with(|_| PtNode::new_root(as_id, class))?;
        self.stats.account_table(class.is_private(), 1);
        self.roots.lock().push(handle);
        log::info!(
            "created {:?} root {} for address space {}",
            class,
            handle.index(),
            as_id
        );
        Ok(handle)
    }

    /// Acquires an additional reference on a root. Fails once the root's
    /// count dropped to zero.
    pub fn get_root(&self, handle: NodeHandle) -> bool {
        let guard = self.reclaim.pin();
        match self.arena.get(&guard, handle) {
            Some(node) => node.try_get(),
            None => false,
        }
    }

    /// Releases a root reference; the last one frees the storage, which
    /// can only happen after invalidation handed the root off.
    pub fn put_root(&self, handle: NodeHandle) {
        let guard = self.reclaim.pin();
        let Some(node) = self.arena.get(&guard, handle) else {
            return;
        };
        if !node.put() {
            return;
        }
        // The manager's reference is only dropped by invalidation, so a
        // root can never die valid.
        assert!(node.is_invalid());
        self.stats.account_table(node.is_private(), -1);
        self.roots.lock().retain(|&h| h != handle);
        if let Some(detached) = self.arena.detach(handle) {
            self.reclaim.defer(detached);
        }
        log::info!("root {} destroyed", handle.index());
    }

    /// Snapshot of the current roots with a reference taken on each.
    fn snapshot_roots(&self, as_id: Option<u16>, only_valid: bool) -> Vec<NodeHandle> {
        let guard = self.reclaim.pin();
        let handles: Vec<NodeHandle> = self.roots.lock().clone();
        let mut out = Vec::new();
        for handle in handles {
            let Some(node) = self.arena.get(&guard, handle) else {
                continue;
            };
            if let Some(as_id) = as_id {
                if node.as_id() != as_id {
                    continue;
                }
            }
            if only_valid && node.is_invalid() {
                continue;
            }
            if node.try_get() {
                out.push(handle);
            }
        }
        out
    }

    /// Marks every root invalid and queues it for asynchronous removal.
    /// The manager's own reference is gifted to the queue; the worker
    /// contract is [`Self::zap_invalidated_roots`].
    pub fn invalidate_all_roots(&self, skip_private: bool) {
        let _wl = self.mmu_lock.lock_write();
        let guard = self.reclaim.pin();
        let handles: Vec<NodeHandle> = self.roots.lock().clone();
        for handle in handles {
            let Some(node) = self.arena.get(&guard, handle) else {
                continue;
            };
            if skip_private && node.is_private() {
                continue;
            }
            if node.invalidate() {
                log::info!("root {} invalidated, queued for reclamation", handle.index());
                self.pending_zap.lock().push(handle);
            }
        }
    }

    /// Drains the pending-reclamation queue, fully removing each
    /// invalidated root under the shared lock and dropping the manager's
    /// reference. Runs on whatever thread the embedder provides.
    pub fn zap_invalidated_roots(&self) {
        // Count the worker before popping, so a concurrent
        // wait_for_pending_reclamation never misses in-flight work.
        self.zap_in_flight.fetch_add(1, Ordering::SeqCst);
        loop {
            let handle = self.pending_zap.lock().pop();
            let Some(handle) = handle else {
                break;
            };
            self.zap_root_shared(handle);
            self.put_root(handle);
        }
        self.zap_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Flushes asynchronous reclamation: drains the queue, waits for
    /// concurrent workers and drives the grace period until every
    /// handed-off node is actually freed.
    pub fn wait_for_pending_reclamation(&self) {
        self.zap_invalidated_roots();
        while self.zap_in_flight.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
        self.reclaim.synchronize(&self.arena);
    }

    /// Synchronous whole-machine teardown: removes every mapping of
    /// every root, valid or not, under the exclusive lock.
    pub fn zap_all(&self) {
        let _wl = self.mmu_lock.lock_write();
        let guard = self.reclaim.pin();
        for handle in self.snapshot_roots(None, false) {
            self.zap_root_exclusive(&guard, handle);
            self.put_root(handle);
        }
    }

    fn zap_root_exclusive(&self, guard: &GraceGuard<'_>, root: NodeHandle) {
        // Zap in two passes to bound the recursion per removed entry:
        // first every 1G subtree, then the top level.
        for zap_level in [PT_LEVEL_1G, PT_ROOT_LEVEL] {
            let mut iter = TdpIter::new(&self.arena, guard, root, 0, MAX_GFN, zap_level);
            while iter.valid() {
                let old = iter.old_spte();
                if (!old.is_present() && !old.is_private_zapped()) || iter.level() > zap_level {
                    iter.next();
                    continue;
                }
                self.set_spte_exclusive(guard, &mut iter, Spte::none());
                iter.next();
            }
        }
    }

    fn zap_root_shared(&self, root: NodeHandle) {
        for zap_level in [PT_LEVEL_1G, PT_ROOT_LEVEL] {
            self.zap_root_level_shared(root, zap_level);
        }
    }

    fn zap_root_level_shared(&self, root: NodeHandle, zap_level: u8) {
        let mut resume: Gfn = 0;
        'relock: loop {
            let _rl = self.mmu_lock.lock_read();
            let guard = self.reclaim.pin();
            let mut iter = TdpIter::new(&self.arena, &guard, root, resume, MAX_GFN, zap_level);
            while iter.valid() {
                if self.should_yield(&iter) {
                    // Drop the shared lock at a point of provable
                    // forward progress and resume from there.
                    iter.mark_yielded();
                    resume = iter.next_base_gfn();
                    self.resched.store(false, Ordering::Release);
                    continue 'relock;
                }
                let old = iter.old_spte();
                if (!old.is_present() && !old.is_private_zapped()) || iter.level() > zap_level {
                    iter.next();
                    continue;
                }
                if self.set_spte_atomic(&guard, &mut iter, Spte::none()).is_err() {
                    if self.is_dead() {
                        return;
                    }
                    iter.refresh();
                    continue;
                }
                iter.next();
            }
            return;
        }
    }

    // ---------------------------------------------------------------
    // Range operations
    // ---------------------------------------------------------------

    /// Removes leaf mappings in `range` for one address space, with the
    /// given policy for private leaves. Returns whether any mapping was
    /// zapped (a flush was then performed before returning).
    pub fn zap_leafs(&self, as_id: u16, range: GfnRange, zap_private: ZapPrivate) -> bool {
        let _wl = self.mmu_lock.lock_write();
        let guard = self.reclaim.pin();
        let mut flush = false;

        for handle in self.snapshot_roots(Some(as_id), false) {
            let Some(node) = self.arena.get(&guard, handle) else {
                self.put_root(handle);
                continue;
            };
            let private = node.is_private();
            if private && zap_private == ZapPrivate::Skip {
                self.put_root(handle);
                continue;
            }

            let mut iter =
                TdpIter::new(&self.arena, &guard, handle, range.start(), range.end(), PT_LEVEL_4K);
            while iter.valid() {
                let old = iter.old_spte();
                let level = iter.level();
                if !old.is_last(level) || (!old.is_present() && !old.is_private_zapped()) {
                    iter.next();
                    continue;
                }
                let new = if private && zap_private == ZapPrivate::Block {
                    if old.is_private_zapped() {
                        iter.next();
                        continue;
                    }
                    Spte::private_zapped_of(old)
                } else {
                    Spte::none()
                };
                self.set_spte_exclusive(&guard, &mut iter, new);
                flush = true;
                iter.next();
            }
            self.put_root(handle);
        }

        if flush {
            self.flush_remote();
        }
        flush
    }

    /// Removes write access from leaf mappings in `range` at or above
    /// `min_level`, for change tracking. Shared leaves lose the write
    /// permission in place; private leaves are temporarily revoked via
    /// the module's block operation, which is the only write-protection
    /// primitive it offers.
    pub fn wrprot_range(&self, as_id: u16, range: GfnRange, min_level: u8) -> bool {
        let _rl = self.mmu_lock.lock_read();
        let guard = self.reclaim.pin();
        let mut changed = false;

        for handle in self.snapshot_roots(Some(as_id), true) {
            let Some(node) = self.arena.get(&guard, handle) else {
                self.put_root(handle);
                continue;
            };
            let private = node.is_private();

            let mut iter =
                TdpIter::new(&self.arena, &guard, handle, range.start(), range.end(), min_level);
            while iter.valid() {
                let old = iter.old_spte();
                if old.is_removed() || !old.is_leaf(iter.level()) || !old.writable() {
                    iter.next();
                    continue;
                }
                let new = if private {
                    Spte::private_zapped_of(old)
                } else {
                    old.with_writable(false)
                };
                match self.set_spte_atomic(&guard, &mut iter, new) {
                    Ok(()) => {
                        changed = true;
                        iter.next();
                    }
                    Err(MmuError::Busy) => iter.refresh(),
                    Err(_) => {
                        self.put_root(handle);
                        return changed;
                    }
                }
            }
            self.put_root(handle);
        }

        if changed {
            self.flush_remote();
        }
        changed
    }

    /// Collects and clears dirty state in `range`. Returns the gfns of
    /// dirty leaves. Private mappings are not dirty-tracked this way;
    /// their change tracking runs through block/unblock.
    pub fn clear_dirty_range(&self, as_id: u16, range: GfnRange) -> Vec<Gfn> {
        let _rl = self.mmu_lock.lock_read();
        let guard = self.reclaim.pin();
        let mut dirty = Vec::new();

        for handle in self.snapshot_roots(Some(as_id), true) {
            let Some(node) = self.arena.get(&guard, handle) else {
                self.put_root(handle);
                continue;
            };
            if node.is_private() {
                self.put_root(handle);
                continue;
            }

            let mut iter =
                TdpIter::new(&self.arena, &guard, handle, range.start(), range.end(), PT_LEVEL_4K);
            while iter.valid() {
                let old = iter.old_spte();
                if old.is_leaf(iter.level()) && old.dirty() {
                    if let Some(sptep) = iter.sptep() {
                        self.frames.mark_dirty(old.pfn());
                        sptep.fetch_and(!DIRTY_BIT, Ordering::AcqRel);
                        dirty.push(iter.gfn());
                    }
                }
                iter.next();
            }
            self.put_root(handle);
        }
        dirty
    }

    /// Clears accessed bits in `range`; returns whether any leaf had
    /// been accessed. Used for page aging.
    pub fn age_range(&self, as_id: u16, range: GfnRange) -> bool {
        let _rl = self.mmu_lock.lock_read();
        let guard = self.reclaim.pin();
        let mut young = false;

        for handle in self.snapshot_roots(Some(as_id), true) {
            let Some(node) = self.arena.get(&guard, handle) else {
                self.put_root(handle);
                continue;
            };
            if node.is_private() {
                self.put_root(handle);
                continue;
            }

            let mut iter =
                TdpIter::new(&self.arena, &guard, handle, range.start(), range.end(), PT_LEVEL_4K);
            while iter.valid() {
                let old = iter.old_spte();
                if old.is_leaf(iter.level()) && old.accessed() {
                    if let Some(sptep) = iter.sptep() {
                        sptep.fetch_and(!ACCESSED_BIT, Ordering::AcqRel);
                        young = true;
                    }
                }
                iter.next();
            }
            self.put_root(handle);
        }
        young
    }

    /// Reports whether any leaf in `range` has its accessed bit set,
    /// without clearing it.
    pub fn test_age_range(&self, as_id: u16, range: GfnRange) -> bool {
        let _rl = self.mmu_lock.lock_read();
        let guard = self.reclaim.pin();

        for handle in self.snapshot_roots(Some(as_id), true) {
            let Some(node) = self.arena.get(&guard, handle) else {
                self.put_root(handle);
                continue;
            };
            if node.is_private() {
                self.put_root(handle);
                continue;
            }

            let mut iter =
                TdpIter::new(&self.arena, &guard, handle, range.start(), range.end(), PT_LEVEL_4K);
            while iter.valid() {
                let old = iter.old_spte();
                if old.is_leaf(iter.level()) && old.accessed() {
                    self.put_root(handle);
                    return true;
                }
                iter.next();
            }
            self.put_root(handle);
        }
        false
    }

    /// Restores every temporarily revoked private leaf to a present,
    /// writable mapping. Used when change tracking ends.
    pub fn restore_private_pages(&self) -> Result<(), MmuError> {
        let _wl = self.mmu_lock.lock_write();
        let guard = self.reclaim.pin();

        for handle in self.snapshot_roots(None, false) {
            let Some(node) = self.arena.get(&guard, handle) else {
                self.put_root(handle);
                continue;
            };
            if !node.is_private() {
                self.put_root(handle);
                continue;
            }

            let mut iter = TdpIter::new(&self.arena, &guard, handle, 0, MAX_GFN, PT_LEVEL_4K);
            while iter.valid() {
                let old = iter.old_spte();
                if old.is_private_zapped() {
                    // Restored mappings are always writable again.
                    let new = Spte::leaf(old.pfn(), iter.level(), PtePerms::rwx());
                    self.set_spte_exclusive(&guard, &mut iter, new);
                    if self.is_dead() {
                        self.put_root(handle);
                        return Err(MmuError::Corrupted);
                    }
                }
                iter.next();
            }
            self.put_root(handle);
        }
        self.flush_remote();
        Ok(())
    }

    /// Eagerly splits huge leaves in `range` down to `target_level`,
    /// e.g. ahead of dirty tracking so that write protection operates on
    /// small mappings.
    pub fn split_huge_pages_range(
        &self,
        as_id: u16,
        range: GfnRange,
        target_level: u8,
    ) -> Result<(), MmuError> {
        if !(PT_LEVEL_4K..PT_ROOT_LEVEL).contains(&target_level) {
            return Err(MmuError::InvalidArgument);
        }
        let _wl = self.mmu_lock.lock_write();
        let guard = self.reclaim.pin();

        for handle in self.snapshot_roots(Some(as_id), true) {
            let res = self.split_root_range(&guard, handle, range, target_level);
            self.put_root(handle);
            res?;
        }
        Ok(())
    }

    fn split_root_range(
        &self,
        guard: &GraceGuard<'_>,
        root: NodeHandle,
        range: GfnRange,
        target_level: u8,
    ) -> Result<(), MmuError> {
        let mut iter =
            TdpIter::new(&self.arena, guard, root, range.start(), range.end(), target_level);
        while iter.valid() {
            let old = iter.old_spte();
            if !old.is_leaf(iter.level()) || iter.level() <= target_level {
                iter.next();
                continue;
            }
            let child = self.alloc_child_node(&iter)?;
            self.install_child_table(guard, &mut iter, child, false)?;
            // The next step descends into the new table, so deeper
            // levels get split as well.
            iter.next();
        }
        Ok(())
    }

    /// Walks the leaf mappings in `range` read-only, calling `f` for
    /// each. Temporarily revoked private leaves are reported with empty
    /// permissions; their frame is still held.
    pub fn for_each_mapping(
        &self,
        as_id: u16,
        range: GfnRange,
        mut f: impl FnMut(MappingInfo),
    ) {
        let _rl = self.mmu_lock.lock_read();
        let guard = self.reclaim.pin();

        for handle in self.snapshot_roots(Some(as_id), true) {
            let mut iter =
                TdpIter::new(&self.arena, &guard, handle, range.start(), range.end(), PT_LEVEL_4K);
            while iter.valid() {
                let old = iter.old_spte();
                let level = iter.level();
                if (old.is_present() || old.is_private_zapped()) && old.is_last(level) {
                    f(MappingInfo {
                        gfn: iter.gfn(),
                        level,
                        perms: old.perms(),
                        pfn: old.pfn(),
                        accessed: old.accessed(),
                        dirty: old.dirty(),
                        private_zapped: old.is_private_zapped(),
                    });
                }
                iter.next();
            }
            self.put_root(handle);
        }
    }

    /// Snapshot variant of [`Self::for_each_mapping`].
    pub fn walk_readonly(&self, as_id: u16, range: GfnRange) -> Vec<MappingInfo> {
        let mut out = Vec::new();
        self.for_each_mapping(as_id, range, |m| out.push(m));
        out
    }
}

impl Drop for TdpMmu {
    fn drop(&mut self) {
        self.invalidate_all_roots(false);
        self.zap_invalidated_roots();
        self.reclaim.synchronize(&self.arena);
        let remaining = self.roots.lock().len();
        if remaining != 0 {
            log::warn!("{} roots still referenced at teardown", remaining);
        }
    }
}
