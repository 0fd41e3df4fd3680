// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use core::sync::atomic::Ordering;

use crate::error::MmuError;
use crate::mmu::{try_cas_entry, TdpMmu};
use crate::node::{NodeHandle, PtNode};
use crate::reclaim::GraceGuard;
use crate::spte::{PtePerms, Spte};
use crate::types::{Gfn, Pfn, ENTRY_COUNT, MAX_GFN, PT_LEVEL_2M, PT_LEVEL_4K};
use crate::walk::TdpIter;

/// One guest page fault, as delivered by the vCPU execution loop. `pfn`
/// is the host frame backing `gfn`; for huge goals the frames of the
/// whole entry must be physically contiguous around it.
#[derive(Clone, Copy, Debug)]
pub struct PageFault {
    pub gfn: Gfn,
    pub pfn: Pfn,
    pub goal_level: u8,
    pub perms: PtePerms,
    pub private: bool,
    pub write: bool,
}

/// Resolution of a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was installed; the guest may re-execute.
    Installed,
    /// The mapping was already in place; nothing was changed.
    Spurious,
    /// A concurrent operation interfered; the guest must re-execute and
    /// fault again.
    Retry,
}

impl TdpMmu {
    /// Resolves a page fault by walking from `root` toward the goal
    /// level, allocating intermediate tables on demand, splitting huge
    /// mappings that stand in the way, and installing the final leaf
    /// through the atomic mutation protocol.
    ///
    /// Runs under the shared lock: any number of vCPU threads may fault
    /// concurrently, and exactly one wins each contended entry. Losers
    /// are told to retry.
    pub fn handle_fault(
        &self,
        root: NodeHandle,
        fault: &PageFault,
    ) -> Result<FaultOutcome, MmuError> {
        if self.is_dead() {
            return Err(MmuError::VmDead);
        }
        if fault.goal_level < PT_LEVEL_4K || fault.goal_level > self.config().max_huge_level {
            return Err(MmuError::InvalidArgument);
        }
        if fault.gfn >= MAX_GFN {
            return Err(MmuError::InvalidArgument);
        }
        if fault.private && !self.config().private_enabled {
            return Err(MmuError::InvalidArgument);
        }

        let _rl = self.mmu_lock().lock_read();
        let guard = self.reclaim().pin();

        let root_node = self
            .arena()
            .get(&guard, root)
            .ok_or(MmuError::InvalidArgument)?;
        if root_node.is_private() != fault.private {
            return Err(MmuError::InvalidArgument);
        }
        if root_node.is_invalid() {
            // The root is on its way out; the caller must pick up a
            // fresh one.
            return Ok(FaultOutcome::Retry);
        }

        let mut iter = TdpIter::new(
            self.arena(),
            &guard,
            root,
            fault.gfn,
            fault.gfn + 1,
            fault.goal_level,
        );
        while iter.valid() {
            let old = iter.old_spte();
            let level = iter.level();

            // A frozen entry belongs to another thread's mutation; give
            // up early instead of allocating tables that would be
            // thrown away.
            if old.is_removed() {
                return Ok(FaultOutcome::Retry);
            }

            if level == fault.goal_level {
                return self.map_target_level(&guard, &mut iter, fault);
            }

            // Step down into an existing table.
            if old.is_present() && !old.is_last(level) {
                iter.next();
                continue;
            }

            // A temporarily revoked huge mapping above the goal must be
            // restored before it can be split.
            if old.is_private_zapped() {
                let new = Spte::leaf(old.pfn(), level, PtePerms::rwx());
                match self.set_spte_atomic(&guard, &mut iter, new) {
                    Ok(()) => {
                        iter.refresh();
                        continue;
                    }
                    Err(MmuError::Busy) => return Ok(FaultOutcome::Retry),
                    Err(err) => return Err(err),
                }
            }

            // The entry is non-present or a huge leaf that needs to be
            // split for the requested granularity.
            let child = self.alloc_child_node(&iter)?;
            match self.install_child_table(&guard, &mut iter, child, true) {
                Ok(()) => {}
                Err(MmuError::Busy) => {
                    self.free_unlinked_node(child);
                    return Ok(FaultOutcome::Retry);
                }
                Err(err) => {
                    self.free_unlinked_node(child);
                    return Err(err);
                }
            }
            iter.next();
        }

        // The walk aborted before reaching the goal level: an ancestor
        // was removed during traversal.
        Ok(FaultOutcome::Retry)
    }

    fn map_target_level(
        &self,
        guard: &GraceGuard<'_>,
        iter: &mut TdpIter<'_>,
        fault: &PageFault,
    ) -> Result<FaultOutcome, MmuError> {
        let old = iter.old_spte();
        let level = iter.level();

        // Frame of the entry base; the faulting frame sits at the
        // matching offset inside it.
        let base_pfn = fault.pfn.wrapping_sub(fault.gfn - iter.gfn());
        let mut new = Spte::leaf(base_pfn, level, fault.perms);
        if fault.write {
            new = new.with_dirty(true);
        }

        if old == new {
            return Ok(FaultOutcome::Spurious);
        }

        // A small-mapping table already covers a huge private goal; try
        // to promote it back into one huge leaf.
        if fault.private && old.is_present() && !old.is_last(level) {
            return self.merge_private_huge_page(guard, iter, fault, new);
        }

        let was_table = old.is_present() && !old.is_last(level);
        match self.set_spte_atomic(guard, iter, new) {
            Ok(()) => {
                if was_table {
                    // A table was replaced by this leaf; its
                    // translations must die before the freed node pages
                    // are reused.
                    self.flush_remote();
                }
                Ok(FaultOutcome::Installed)
            }
            Err(MmuError::Busy) => Ok(FaultOutcome::Retry),
            Err(err) => Err(err),
        }
    }

    /// Promotes a fully populated small-mapping table back into one huge
    /// private leaf: freeze the parent entry, fill any missing small
    /// mappings, block and track the range, then ask the module to
    /// merge. Any failure reverts to the small mappings and signals
    /// retry.
    fn merge_private_huge_page(
        &self,
        guard: &GraceGuard<'_>,
        iter: &mut TdpIter<'_>,
        fault: &PageFault,
        new: Spte,
    ) -> Result<FaultOutcome, MmuError> {
        let level = iter.level();
        let gfn = iter.gfn();

        // Only the first huge level can be merged.
        if level != PT_LEVEL_2M {
            return Ok(FaultOutcome::Retry);
        }

        let Some(node) = iter.node() else {
            return Ok(FaultOutcome::Retry);
        };
        let sptep = node.slot(iter.index());
        let old = iter.old_spte();

        // Freeze the parent entry so no walker can use or modify the
        // table while it is being promoted.
        if let Err(cur) = try_cas_entry(sptep, old, Spte::removed()) {
            iter.set_old_spte(cur);
            return Ok(FaultOutcome::Retry);
        }

        let child_handle = NodeHandle::from_pfn(old.pfn());
        let Some(child_node) = self.arena().get(guard, child_handle) else {
            sptep.store(old.into_bits(), Ordering::Release);
            return Ok(FaultOutcome::Retry);
        };

        // Every small mapping must be present and physically contiguous
        // before the module will accept a merge. Fill holes on the way;
        // an already-present mapping at the faulting frame means the
        // page is still pending guest acceptance, so resume the guest
        // instead of merging.
        let mut incomplete = false;
        for i in 0..ENTRY_COUNT {
            let entry = child_node.entry(i);
            let entry_gfn = child_node.entry_gfn(i);
            let want_pfn = new.pfn() + i as u64;

            if entry.is_present() {
                if entry.pfn() != want_pfn || entry_gfn == fault.gfn {
                    incomplete = true;
                }
                continue;
            }
            if entry.is_private_zapped() || entry.is_removed() {
                incomplete = true;
                continue;
            }

            let leaf = Spte::leaf(want_pfn, PT_LEVEL_4K, fault.perms);
            let mut cur = entry;
            match self.set_spte_atomic_raw(
                guard,
                true,
                child_node.slot(i),
                entry_gfn,
                PT_LEVEL_4K,
                &mut cur,
                leaf,
            ) {
                Ok(()) => (),
                Err(MmuError::Busy) => incomplete = true,
                Err(err) => {
                    sptep.store(old.into_bits(), Ordering::Release);
                    return Err(err);
                }
            }
        }
        if incomplete {
            sptep.store(old.into_bits(), Ordering::Release);
            return Ok(FaultOutcome::Retry);
        }

        let Some(mirror) = child_node.mirror() else {
            // A private table without a mirror cannot exist.
            self.mark_dead();
            sptep.store(old.into_bits(), Ordering::Release);
            return Err(MmuError::Corrupted);
        };

        // Freeze every small mapping so no writer can race the module's
        // view of the range while it is promoted; the frozen values are
        // kept for the revert paths. A losing slot means a concurrent
        // operation slipped in between verification and freeze.
        let mut small = [Spte::none(); ENTRY_COUNT];
        for i in 0..ENTRY_COUNT {
            let entry = child_node.entry(i);
            if !entry.is_leaf(PT_LEVEL_4K)
                || try_cas_entry(child_node.slot(i), entry, Spte::removed()).is_err()
            {
                unfreeze_children(child_node, &small, i);
                sptep.store(old.into_bits(), Ordering::Release);
                return Ok(FaultOutcome::Retry);
            }
            small[i] = entry;
        }

        let sept = self.sept();
        match sept.block_leaf(gfn, level) {
            Ok(()) => (),
            Err(MmuError::Busy) => {
                unfreeze_children(child_node, &small, ENTRY_COUNT);
                sptep.store(old.into_bits(), Ordering::Release);
                return Ok(FaultOutcome::Retry);
            }
            Err(err) => {
                unfreeze_children(child_node, &small, ENTRY_COUNT);
                sptep.store(old.into_bits(), Ordering::Release);
                return Err(err);
            }
        }
        self.flush_remote();

        match sept.merge_table(gfn, level, mirror) {
            Ok(()) => {
                // Commit the huge leaf and retire the small-mapping
                // table; the module already retired its mirror as part
                // of the merge. The child slots keep the sentinel, so a
                // walker still inside the detached table backs off.
                sptep.store(new.into_bits(), Ordering::Release);
                iter.set_old_spte(new);
                self.stats().adjust_leaf(PT_LEVEL_4K, -(ENTRY_COUNT as i64));
                self.stats().adjust_leaf(level, 1);
                self.stats().account_table(true, -1);
                if let Some(detached) = self.arena().detach(child_handle) {
                    self.reclaim().defer(detached);
                }
                Ok(FaultOutcome::Installed)
            }
            Err(MmuError::Busy) => {
                // Partial acceptance: revert to the small mappings and
                // let the vCPU retry.
                let res = sept.unblock_for_revert(gfn, level);
                unfreeze_children(child_node, &small, ENTRY_COUNT);
                sptep.store(old.into_bits(), Ordering::Release);
                iter.set_old_spte(old);
                res.map(|_| FaultOutcome::Retry)
            }
            Err(err) => {
                unfreeze_children(child_node, &small, ENTRY_COUNT);
                sptep.store(old.into_bits(), Ordering::Release);
                Err(err)
            }
        }
    }
}

/// Restores the first `count` frozen child slots to their pre-freeze
/// values when a huge-page merge is abandoned.
fn unfreeze_children(child: &PtNode, small: &[Spte; ENTRY_COUNT], count: usize) {
    for (i, spte) in small.iter().enumerate().take(count) {
        child.slot(i).store(spte.into_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NullModule, SeptError};
    use crate::config::MmuConfig;
    use crate::sept::mock::{MockModule, SeptCall};
    use crate::types::{MemClass, PT_LEVEL_1G};
    use crate::utils::GfnRange;
    use std::sync::Arc;

    fn shared_mmu() -> TdpMmu {
        TdpMmu::new(MmuConfig::default(), Arc::new(NullModule)).unwrap()
    }

    fn private_mmu() -> (TdpMmu, Arc<MockModule>) {
        let module = Arc::new(MockModule::new());
        let config = MmuConfig {
            private_enabled: true,
            ..Default::default()
        };
        let mmu = TdpMmu::new(config, module.clone()).unwrap();
        mmu.finalize();
        (mmu, module)
    }

    fn fault(gfn: Gfn, pfn: Pfn, level: u8, private: bool, write: bool) -> PageFault {
        PageFault {
            gfn,
            pfn,
            goal_level: level,
            perms: PtePerms::rwx(),
            private,
            write,
        }
    }

    #[test]
    fn test_shared_install_and_spurious() {
        let mmu = shared_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        let f = fault(0x1234, 0x5678, PT_LEVEL_4K, false, true);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Spurious);

        let mappings = mmu.walk_readonly(0, GfnRange::new(0x1234, 1));
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].pfn, 0x5678);
        assert_eq!(mappings[0].level, PT_LEVEL_4K);
        assert!(mappings[0].dirty);
        assert_eq!(mmu.stats().leaf_pages(PT_LEVEL_4K), 1);

        mmu.put_root(root);
    }

    #[test]
    fn test_huge_install_uses_entry_base() {
        let mmu = shared_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        // Fault in the middle of a 2M entry; the leaf must map the
        // entry base frame.
        let f = fault(0x2345, 0x10345, PT_LEVEL_2M, false, false);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);

        let mappings = mmu.walk_readonly(0, GfnRange::new(0x2200, 0x200));
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].gfn, 0x2200);
        assert_eq!(mappings[0].pfn, 0x10200);
        assert_eq!(mappings[0].level, PT_LEVEL_2M);

        mmu.put_root(root);
    }

    /// Installing a 4K private leaf issues exactly one augment call and
    /// the local entry reads present.
    #[test]
    fn test_private_install_augments_once() {
        let (mmu, module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        let f = fault(0x100, 0x55, PT_LEVEL_4K, true, false);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);

        assert_eq!(
            module.count(|c| matches!(c, SeptCall::AugmentLeaf(0x100, PT_LEVEL_4K, 0x55))),
            1
        );
        // One link per intermediate table between the root and the leaf.
        assert_eq!(module.count(|c| matches!(c, SeptCall::LinkTable(..))), 3);

        let mappings = mmu.walk_readonly(0, GfnRange::new(0x100, 1));
        assert_eq!(mappings.len(), 1);
        assert!(!mappings[0].private_zapped);
        assert_eq!(mmu.frames().state(0x55).pins, 1);

        mmu.put_root(root);
    }

    /// Before finalization, installs go through the build-time add.
    #[test]
    fn test_private_install_build_time_add() {
        let module = Arc::new(MockModule::new());
        let config = MmuConfig {
            private_enabled: true,
            ..Default::default()
        };
        let mmu = TdpMmu::new(config, module.clone()).unwrap();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        let f = fault(0x100, 0x55, PT_LEVEL_4K, true, false);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        assert_eq!(module.count(|c| matches!(c, SeptCall::AddLeaf(..))), 1);
        assert_eq!(module.count(|c| matches!(c, SeptCall::AugmentLeaf(..))), 0);

        mmu.put_root(root);
    }

    /// Splitting a present 2M huge leaf yields 512 4K leaves mapping
    /// frame F + i, with exactly one module split call.
    #[test]
    fn test_private_huge_split() {
        let (mmu, module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        let huge = fault(0x200000 >> 12, 0x4000, PT_LEVEL_2M, true, false);
        assert_eq!(
            mmu.handle_fault(root, &huge).unwrap(),
            FaultOutcome::Installed
        );

        // A 4K fault inside the huge mapping forces a split; the
        // projected child already maps the frame, so the fault itself
        // resolves as spurious.
        let small = fault((0x200000 >> 12) + 7, 0x4007, PT_LEVEL_4K, true, false);
        assert_eq!(
            mmu.handle_fault(root, &small).unwrap(),
            FaultOutcome::Spurious
        );

        assert_eq!(module.count(|c| matches!(c, SeptCall::Split(..))), 1);

        let mappings = mmu.walk_readonly(0, GfnRange::new(0x200000 >> 12, 512));
        assert_eq!(mappings.len(), 512);
        for (i, m) in mappings.iter().enumerate() {
            assert_eq!(m.level, PT_LEVEL_4K);
            assert_eq!(m.pfn, 0x4000 + i as u64);
        }
        assert_eq!(mmu.stats().leaf_pages(PT_LEVEL_4K), 512);
        assert_eq!(mmu.stats().leaf_pages(PT_LEVEL_2M), 0);

        mmu.put_root(root);
    }

    /// Block then unblock a private leaf: the entry reads
    /// private-zapped with the frame retained, then present again.
    #[test]
    fn test_private_block_unblock() {
        let (mmu, module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        let f = fault(0x300, 0x77, PT_LEVEL_4K, true, true);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);

        assert!(mmu.wrprot_range(0, GfnRange::new(0x300, 1), PT_LEVEL_4K));
        let mappings = mmu.walk_readonly(0, GfnRange::new(0x300, 1));
        assert!(mappings[0].private_zapped);
        assert_eq!(mappings[0].pfn, 0x77);
        assert_eq!(module.count(|c| matches!(c, SeptCall::Block(0x300, PT_LEVEL_4K))), 1);

        // The write fault restores the mapping via unblock.
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        let mappings = mmu.walk_readonly(0, GfnRange::new(0x300, 1));
        assert!(!mappings[0].private_zapped);
        assert_eq!(mappings[0].pfn, 0x77);
        assert_eq!(
            module.count(|c| matches!(c, SeptCall::Unblock(0x300, PT_LEVEL_4K))),
            1
        );
        // The frame stayed pinned across block/unblock.
        assert_eq!(mmu.frames().state(0x77).pins, 1);

        mmu.put_root(root);
    }

    /// Restoring a blocked leaf with a different frame is a fatal
    /// consistency violation.
    #[test]
    fn test_unblock_with_wrong_frame_is_fatal() {
        let (mmu, _module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        let f = fault(0x300, 0x77, PT_LEVEL_4K, true, true);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        assert!(mmu.wrprot_range(0, GfnRange::new(0x300, 1), PT_LEVEL_4K));

        let wrong = fault(0x300, 0x88, PT_LEVEL_4K, true, true);
        assert_eq!(mmu.handle_fault(root, &wrong), Err(MmuError::Corrupted));
        assert!(mmu.is_dead());

        mmu.put_root(root);
    }

    /// A busy report from the module surfaces as a retryable fault and
    /// leaves the entry untouched.
    #[test]
    fn test_module_busy_reverts_entry() {
        let (mmu, module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        module.fail_once("augment_leaf", SeptError::Busy);
        let f = fault(0x400, 0x99, PT_LEVEL_4K, true, false);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Retry);

        // The entry was restored to non-present and the retry succeeds.
        assert!(mmu.walk_readonly(0, GfnRange::new(0x400, 1)).is_empty());
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);

        mmu.put_root(root);
    }

    /// Merging small private mappings back into one huge leaf issues
    /// block, track and merge, and retires the small-mapping table.
    #[test]
    fn test_private_huge_merge() {
        let (mmu, module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();
        let base_gfn: Gfn = 0x600000 >> 12;
        let base_pfn: Pfn = 0x8000;

        // Populate the 2M range with 4K mappings, except the frame the
        // huge fault will target; the merge path fills that hole
        // itself.
        for i in 1..ENTRY_COUNT as u64 {
            let f = fault(base_gfn + i, base_pfn + i, PT_LEVEL_4K, true, false);
            assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        }
        assert_eq!(mmu.stats().leaf_pages(PT_LEVEL_4K), 511);

        // A huge fault over the range merges them.
        let huge = fault(base_gfn, base_pfn, PT_LEVEL_2M, true, false);
        assert_eq!(mmu.handle_fault(root, &huge).unwrap(), FaultOutcome::Installed);

        assert_eq!(module.count(|c| matches!(c, SeptCall::Merge(..))), 1);
        let mappings = mmu.walk_readonly(0, GfnRange::new(base_gfn, 512));
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].level, PT_LEVEL_2M);
        assert_eq!(mappings[0].pfn, base_pfn);
        assert_eq!(mmu.stats().leaf_pages(PT_LEVEL_4K), 0);
        assert_eq!(mmu.stats().leaf_pages(PT_LEVEL_2M), 1);

        mmu.put_root(root);
    }

    /// A merge the module rejects with a pending status reverts to the
    /// small mappings and reports retry.
    #[test]
    fn test_private_huge_merge_partial_acceptance() {
        let (mmu, module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();
        let base_gfn: Gfn = 0x600000 >> 12;
        let base_pfn: Pfn = 0x8000;

        for i in 1..ENTRY_COUNT as u64 {
            let f = fault(base_gfn + i, base_pfn + i, PT_LEVEL_4K, true, false);
            assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        }

        module.fail_once("merge", SeptError::Pending);
        let huge = fault(base_gfn, base_pfn, PT_LEVEL_2M, true, false);
        assert_eq!(mmu.handle_fault(root, &huge).unwrap(), FaultOutcome::Retry);

        // Small mappings are intact and usable again.
        let mappings = mmu.walk_readonly(0, GfnRange::new(base_gfn, 512));
        assert_eq!(mappings.len(), 512);
        assert!(mappings.iter().all(|m| m.level == PT_LEVEL_4K));
        assert_eq!(
            module.count(|c| matches!(c, SeptCall::Unblock(..))),
            1
        );

        mmu.put_root(root);
    }

    /// Two threads race to install the same non-present entry; exactly
    /// one install wins.
    #[test]
    fn test_install_race_single_winner() {
        let mmu = Arc::new(shared_mmu());
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();
        let f = fault(0x1000, 0x2000, PT_LEVEL_4K, false, false);

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let mmu = mmu.clone();
                std::thread::spawn(move || mmu.handle_fault(root, &f).unwrap())
            })
            .collect();
        let outcomes: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let installed = outcomes
            .iter()
            .filter(|o| **o == FaultOutcome::Installed)
            .count();
        assert_eq!(installed, 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, FaultOutcome::Installed | FaultOutcome::Retry | FaultOutcome::Spurious)));

        let mappings = mmu.walk_readonly(0, GfnRange::new(0x1000, 1));
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].pfn, 0x2000);

        mmu.put_root(root);
    }

    /// Concurrent faults on disjoint frames all land; per-entry
    /// linearizability means no install is lost.
    #[test]
    fn test_concurrent_disjoint_installs() {
        let mmu = Arc::new(shared_mmu());
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        let threads: Vec<_> = (0..4u64)
            .map(|t| {
                let mmu = mmu.clone();
                std::thread::spawn(move || {
                    for i in 0..64u64 {
                        let gfn = 0x10000 + t * 64 + i;
                        let f = fault(gfn, 0x900000 + gfn, PT_LEVEL_4K, false, false);
                        loop {
                            match mmu.handle_fault(root, &f).unwrap() {
                                FaultOutcome::Installed | FaultOutcome::Spurious => break,
                                FaultOutcome::Retry => core::hint::spin_loop(),
                            }
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mappings = mmu.walk_readonly(0, GfnRange::new(0x10000, 4 * 64));
        assert_eq!(mappings.len(), 4 * 64);
        for m in mappings {
            assert_eq!(m.pfn, 0x900000 + m.gfn);
        }

        mmu.put_root(root);
    }

    /// Installing over a present leaf with a different frame without an
    /// intervening zap is a lost invalidation and kills the VM.
    #[test]
    fn test_frame_change_in_place_is_fatal() {
        let mmu = shared_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        let f = fault(0x1234, 0x5678, PT_LEVEL_4K, false, false);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);

        let clobber = fault(0x1234, 0x9999, PT_LEVEL_4K, false, false);
        let _ = mmu.handle_fault(root, &clobber);
        assert!(mmu.is_dead());

        mmu.put_root(root);
    }

    /// After a zap, reinstalling a different frame is legitimate.
    #[test]
    fn test_reinstall_after_zap() {
        let mmu = shared_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        let f = fault(0x1234, 0x5678, PT_LEVEL_4K, false, false);
        assert_eq!(mmu.handle_fault(root, &f).unwrap(), FaultOutcome::Installed);
        assert!(mmu.zap_leafs(0, GfnRange::new(0x1234, 1), crate::mmu::ZapPrivate::Skip));

        let f2 = fault(0x1234, 0x9999, PT_LEVEL_4K, false, false);
        assert_eq!(mmu.handle_fault(root, &f2).unwrap(), FaultOutcome::Installed);
        assert!(!mmu.is_dead());

        mmu.put_root(root);
    }

    #[test]
    fn test_fault_on_wrong_class_root() {
        let (mmu, _module) = private_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Private).unwrap();

        let f = fault(0x100, 0x55, PT_LEVEL_4K, false, false);
        assert_eq!(mmu.handle_fault(root, &f), Err(MmuError::InvalidArgument));

        mmu.put_root(root);
    }

    #[test]
    fn test_goal_level_above_config_rejected() {
        let mmu = shared_mmu();
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        let f = fault(0, 0, PT_LEVEL_1G, false, false);
        assert_eq!(mmu.handle_fault(root, &f), Err(MmuError::InvalidArgument));

        mmu.put_root(root);
    }

    /// Arena exhaustion surfaces as an out-of-memory fault result.
    #[test]
    fn test_out_of_memory() {
        let config = MmuConfig {
            node_capacity: 2,
            ..Default::default()
        };
        let mmu = TdpMmu::new(config, Arc::new(NullModule)).unwrap();
        let root = mmu.get_or_create_root(0, MemClass::Shared).unwrap();

        // Root takes one node; the walk needs three more.
        let f = fault(0x1234, 0x5678, PT_LEVEL_4K, false, false);
        assert_eq!(mmu.handle_fault(root, &f), Err(MmuError::NoMemory));

        mmu.put_root(root);
    }
}
