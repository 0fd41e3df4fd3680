// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Jon Lange <jlange@microsoft.com>

use core::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{MirrorHandle, SeptError, TrustModule};
use crate::error::MmuError;
use crate::frames::FrameBook;
use crate::tlb::TlbTracker;
use crate::types::{Gfn, Pfn};

/// Coordinator for the external trust module's view of private mappings.
///
/// Every method mirrors exactly one local entry transition. The module
/// is the authority over private frame ownership: when it reports that
/// another thread already performed the requested operation, the
/// disagreement is classified as a benign race and surfaced as a
/// retryable error. A frame disagreement is never benign; it means the
/// two copies of the mapping have diverged and the VM cannot continue.
#[derive(Debug)]
pub struct SeptCoordinator<'a> {
    module: &'a dyn TrustModule,
    tlb: &'a TlbTracker,
    frames: &'a FrameBook,
    dead: &'a AtomicBool,
}

impl<'a> SeptCoordinator<'a> {
    pub(crate) fn new(
        module: &'a dyn TrustModule,
        tlb: &'a TlbTracker,
        frames: &'a FrameBook,
        dead: &'a AtomicBool,
    ) -> Self {
        Self {
            module,
            tlb,
            frames,
            dead,
        }
    }

    /// Records an unrecoverable disagreement between the local tree and
    /// the module's mirror.
    fn fatal(&self, what: &str, gfn: Gfn, level: u8, err: SeptError) -> MmuError {
        log::error!(
            "trust module {} failed fatally at gfn {:#x} level {}: {:?}",
            what,
            gfn,
            level,
            err
        );
        self.dead.store(true, Ordering::Release);
        MmuError::Corrupted
    }

    fn classify(&self, what: &str, gfn: Gfn, level: u8, err: SeptError) -> MmuError {
        match err {
            SeptError::Busy | SeptError::Pending | SeptError::AlreadyBlocked => MmuError::Busy,
            _ => self.fatal(what, gfn, level, err),
        }
    }

    /// Installs a leaf mapping in the module's tree and pins the backing
    /// frames. `finalized` selects the runtime augment operation over the
    /// build-time add.
    pub fn map_leaf(
        &self,
        gfn: Gfn,
        level: u8,
        pfn: Pfn,
        finalized: bool,
    ) -> Result<(), MmuError> {
        let res = if finalized {
            self.module.augment_leaf(gfn, level, pfn)
        } else {
            self.module.add_leaf(gfn, level, pfn)
        };
        res.map_err(|e| self.classify("map_leaf", gfn, level, e))?;
        self.frames.pin(pfn, level);
        Ok(())
    }

    /// Restores a temporarily revoked leaf. The module still holds the
    /// original frame; the caller must have verified the local record
    /// matches it.
    pub fn unblock_leaf(&self, gfn: Gfn, level: u8) -> Result<(), MmuError> {
        self.module
            .unblock(gfn, level)
            .map_err(|e| self.classify("unblock", gfn, level, e))
    }

    /// Temporarily revokes a leaf, keeping the backing frame. An
    /// already-blocked report means another thread won the race and is
    /// treated as success.
    pub fn block_leaf(&self, gfn: Gfn, level: u8) -> Result<(), MmuError> {
        match self.module.block(gfn, level) {
            Ok(()) => {
                self.tlb.note_blocked();
                Ok(())
            }
            Err(SeptError::AlreadyBlocked) => Ok(()),
            Err(e) => Err(self.classify("block", gfn, level, e)),
        }
    }

    /// Fully removes a leaf whose range is already blocked. Makes sure
    /// the removal epoch has been observed before the module gives up
    /// the frame, then unpins the backing frames.
    pub fn remove_blocked_leaf(&self, gfn: Gfn, level: u8, pfn: Pfn) -> Result<(), MmuError> {
        if self.tlb.track_needed() {
            self.tlb.track(self.module);
        }
        self.module
            .remove_leaf(gfn, level, pfn)
            .map_err(|e| self.fatal("remove_leaf", gfn, level, e))?;
        self.frames.unpin(pfn, level);
        Ok(())
    }

    /// [`Self::block_leaf`] for an entry no other local writer can
    /// reach anymore (frozen, or held under the exclusive lock): a busy
    /// report from the module is transient and the call is repeated
    /// until it sticks.
    pub fn block_leaf_frozen(&self, gfn: Gfn, level: u8) -> Result<(), MmuError> {
        loop {
            match self.block_leaf(gfn, level) {
                Err(MmuError::Busy) => core::hint::spin_loop(),
                res => return res,
            }
        }
    }

    /// Blocks and fully removes a present leaf that is frozen locally.
    pub fn zap_and_remove_leaf(&self, gfn: Gfn, level: u8, pfn: Pfn) -> Result<(), MmuError> {
        self.block_leaf_frozen(gfn, level)?;
        self.remove_blocked_leaf(gfn, level, pfn)
    }

    /// Links the mirror of a freshly allocated child table.
    pub fn link_child(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), MmuError> {
        self.module
            .link_table(gfn, level, table)
            .map_err(|e| self.classify("link_table", gfn, level, e))
    }

    /// Unlinks the mirror of a child table once the local copy holds no
    /// mappings. Failure leaves the mirror page to the module; there is
    /// nothing further the hypervisor can do with it.
    pub fn unlink_child(&self, gfn: Gfn, level: u8, table: MirrorHandle) {
        if let Err(err) = self.module.unlink_table(gfn, level, table) {
            let _ = self.fatal("unlink_table", gfn, level, err);
        }
    }

    /// Demotes a huge leaf into the child table `table`. The huge range
    /// is blocked and tracked first so no stale translation survives the
    /// demotion.
    pub fn split_leaf(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), MmuError> {
        self.block_leaf(gfn, level)?;
        self.tlb.track(self.module);
        self.module
            .split(gfn, level, table)
            .map_err(|e| self.classify("split", gfn, level, e))
    }

    /// Promotes the fully populated child table `table` into one huge
    /// leaf. The caller must have blocked and tracked the range first;
    /// on failure it reverts to the small mappings.
    pub fn merge_table(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), MmuError> {
        self.module
            .merge(gfn, level, table)
            .map_err(|e| self.classify("merge", gfn, level, e))
    }

    /// Undoes a block after a failed merge so the small mappings become
    /// usable again. A pending report is transient once the epoch was
    /// tracked, so the call is simply repeated until the module accepts
    /// it.
    pub fn unblock_for_revert(&self, gfn: Gfn, level: u8) -> Result<(), MmuError> {
        loop {
            match self.module.unblock(gfn, level) {
                Ok(()) => return Ok(()),
                Err(SeptError::Pending) | Err(SeptError::Busy) => core::hint::spin_loop(),
                Err(e) => return Err(self.fatal("unblock", gfn, level, e)),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockModule, SeptCall};
    use super::*;
    use crate::types::{PT_LEVEL_2M, PT_LEVEL_4K};

    fn harness() -> (MockModule, TlbTracker, FrameBook, AtomicBool) {
        (
            MockModule::new(),
            TlbTracker::new(),
            FrameBook::new(),
            AtomicBool::new(false),
        )
    }

    #[test]
    fn test_map_leaf_pins_frames() {
        let (module, tlb, frames, dead) = harness();
        let sept = SeptCoordinator::new(&module, &tlb, &frames, &dead);

        sept.map_leaf(0x100, PT_LEVEL_4K, 0x55, true).unwrap();
        assert_eq!(
            module.recorded(),
            vec![SeptCall::AugmentLeaf(0x100, PT_LEVEL_4K, 0x55)]
        );
        assert_eq!(frames.state(0x55).pins, 1);

        // Before finalization the build-time add is used instead.
        sept.map_leaf(0x200, PT_LEVEL_4K, 0x56, false).unwrap();
        assert!(matches!(
            module.recorded()[1],
            SeptCall::AddLeaf(0x200, PT_LEVEL_4K, 0x56)
        ));
    }

    #[test]
    fn test_busy_is_retryable() {
        let (module, tlb, frames, dead) = harness();
        let sept = SeptCoordinator::new(&module, &tlb, &frames, &dead);

        module.fail_once("augment_leaf", SeptError::Busy);
        assert_eq!(
            sept.map_leaf(0x100, PT_LEVEL_4K, 0x55, true),
            Err(MmuError::Busy)
        );
        assert!(!dead.load(Ordering::Acquire));
        // No pin was taken for the failed install.
        assert_eq!(frames.state(0x55).pins, 0);
    }

    #[test]
    fn test_invalid_is_fatal() {
        let (module, tlb, frames, dead) = harness();
        let sept = SeptCoordinator::new(&module, &tlb, &frames, &dead);

        module.fail_once("augment_leaf", SeptError::Invalid);
        assert_eq!(
            sept.map_leaf(0x100, PT_LEVEL_4K, 0x55, true),
            Err(MmuError::Corrupted)
        );
        assert!(dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_frozen_block_retries_transient_busy() {
        let (module, tlb, frames, dead) = harness();
        let sept = SeptCoordinator::new(&module, &tlb, &frames, &dead);

        module.fail_once("block", SeptError::Busy);
        sept.block_leaf_frozen(0x100, PT_LEVEL_4K).unwrap();
        assert_eq!(module.count(|c| matches!(c, SeptCall::Block(..))), 1);
        assert!(!dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_already_blocked_is_benign() {
        let (module, tlb, frames, dead) = harness();
        let sept = SeptCoordinator::new(&module, &tlb, &frames, &dead);

        module.fail_once("block", SeptError::AlreadyBlocked);
        assert!(sept.block_leaf(0x100, PT_LEVEL_2M).is_ok());
        assert!(!dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_remove_tracks_blocked_epoch() {
        let (module, tlb, frames, dead) = harness();
        let sept = SeptCoordinator::new(&module, &tlb, &frames, &dead);

        frames.pin(0x55, PT_LEVEL_4K);
        sept.block_leaf(0x100, PT_LEVEL_4K).unwrap();
        assert!(tlb.track_needed());
        sept.remove_blocked_leaf(0x100, PT_LEVEL_4K, 0x55).unwrap();

        // The epoch advance must have happened between block and remove.
        let calls = module.recorded();
        let block = calls
            .iter()
            .position(|c| matches!(c, SeptCall::Block(..)))
            .unwrap();
        let epoch = calls
            .iter()
            .position(|c| matches!(c, SeptCall::AdvanceEpoch))
            .unwrap();
        let remove = calls
            .iter()
            .position(|c| matches!(c, SeptCall::RemoveLeaf(..)))
            .unwrap();
        assert!(block < epoch && epoch < remove);
        assert_eq!(frames.state(0x55).pins, 0);
        assert!(!tlb.track_needed());
    }
}
