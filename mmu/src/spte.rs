// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Jon Lange <jlange@microsoft.com>

use crate::types::{Pfn, PT_LEVEL_4K};
use bitfield_struct::bitfield;
use bitflags::bitflags;

/// Write-back memory type, used for all regular mappings.
const MEM_TYPE_WB: u8 = 6;

/// Raw value of the removed-entry sentinel. Only the frozen bit is set,
/// which no legal encoding ever carries, so concurrent readers can always
/// distinguish "mutation in flight" from any present or non-present value.
pub const REMOVED_BITS: u64 = 1 << 63;

/// Raw mask of the accessed bit, for lock-free harvesting.
pub const ACCESSED_BIT: u64 = 1 << 8;

/// Raw mask of the dirty bit, for lock-free harvesting.
pub const DIRTY_BIT: u64 = 1 << 9;

bitflags! {
    /// Access permissions of a leaf mapping.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PtePerms: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl PtePerms {
    pub fn rwx() -> Self {
        Self::READ | Self::WRITE | Self::EXEC
    }

    pub fn ro() -> Self {
        Self::READ | Self::EXEC
    }
}

/// One page-table entry. A single 64-bit word encoding permissions, the
/// mapped frame and the software state of the private-memory protocol.
///
/// Exactly one of {non-present, present leaf, present non-leaf} holds for
/// any observable value; the frozen sentinel only ever exists inside the
/// atomic-mutation critical window.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Spte {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    #[bits(3)]
    pub mem_type: u8,
    _rsvd_6: bool,
    /// Leaf bit for levels above 4K. At level 1 every present entry is a
    /// leaf regardless of this bit.
    pub huge: bool,
    pub accessed: bool,
    pub dirty: bool,
    #[bits(2)]
    _sw_10_11: u8,
    /// Physical frame number of the mapped page, or the child node handle
    /// for a present non-leaf entry.
    #[bits(40)]
    pub pfn: u64,
    #[bits(10)]
    _sw_52_61: u16,
    /// Set on non-present private entries whose mapping was temporarily
    /// revoked; the frame field still holds the original frame.
    pub blocked: bool,
    /// Set only in the removed-entry sentinel.
    pub frozen: bool,
}

impl Spte {
    /// The non-present, zero entry.
    pub const fn none() -> Self {
        Self::new()
    }

    /// The removed-entry sentinel used to freeze an entry against
    /// concurrent writers.
    pub const fn removed() -> Self {
        Self::from_bits(REMOVED_BITS)
    }

    /// An entry is present when it grants any kind of access.
    pub fn is_present(&self) -> bool {
        self.readable() || self.writable() || self.executable()
    }

    /// Whether this value terminates the walk at `level`: level 1 entries
    /// always do, higher levels only with the huge bit. Non-present
    /// private-zapped values keep their leaf-ness so the original mapping
    /// stays recoverable.
    pub fn is_last(&self, level: u8) -> bool {
        level == PT_LEVEL_4K || self.huge()
    }

    /// A present leaf mapping.
    pub fn is_leaf(&self, level: u8) -> bool {
        self.is_present() && self.is_last(level)
    }

    /// Sentinel equality. The frozen bit is never set outside the
    /// sentinel, so a plain comparison suffices.
    pub fn is_removed(&self) -> bool {
        self.into_bits() == REMOVED_BITS
    }

    /// A temporarily revoked private mapping: non-present, but the frame
    /// is retained and the external module still holds it.
    pub fn is_private_zapped(&self) -> bool {
        !self.is_present() && self.blocked()
    }

    pub fn perms(&self) -> PtePerms {
        let mut perms = PtePerms::empty();
        if self.readable() {
            perms |= PtePerms::READ;
        }
        if self.writable() {
            perms |= PtePerms::WRITE;
        }
        if self.executable() {
            perms |= PtePerms::EXEC;
        }
        perms
    }

    /// Builds a present leaf entry mapping `pfn` at `level`.
    pub fn leaf(pfn: Pfn, level: u8, perms: PtePerms) -> Self {
        Self::new()
            .with_readable(perms.contains(PtePerms::READ))
            .with_writable(perms.contains(PtePerms::WRITE))
            .with_executable(perms.contains(PtePerms::EXEC))
            .with_mem_type(MEM_TYPE_WB)
            .with_huge(level > PT_LEVEL_4K)
            .with_accessed(true)
            .with_pfn(pfn)
    }

    /// Builds a present non-leaf entry pointing at the child table
    /// identified by `child`.
    pub fn nonleaf(child: u64) -> Self {
        Self::new()
            .with_readable(true)
            .with_writable(true)
            .with_executable(true)
            .with_accessed(true)
            .with_pfn(child)
    }

    /// Builds the private-zapped image of a present leaf: non-present,
    /// blocked, frame and leaf-ness retained.
    pub fn private_zapped_of(old: Spte) -> Self {
        Self::new()
            .with_blocked(true)
            .with_huge(old.huge())
            .with_pfn(old.pfn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PT_LEVEL_2M;

    #[test]
    fn test_none_and_removed_are_distinct() {
        assert!(!Spte::none().is_present());
        assert!(!Spte::none().is_removed());
        assert!(Spte::removed().is_removed());
        assert!(!Spte::removed().is_present());
        assert!(!Spte::removed().is_private_zapped());
    }

    #[test]
    fn test_leaf_encoding() {
        let spte = Spte::leaf(0x1234, PT_LEVEL_2M, PtePerms::rwx());
        assert!(spte.is_present());
        assert!(spte.is_leaf(PT_LEVEL_2M));
        assert!(!spte.is_removed());
        assert_eq!(spte.pfn(), 0x1234);
        assert_eq!(spte.perms(), PtePerms::rwx());

        let spte = Spte::leaf(0x42, PT_LEVEL_4K, PtePerms::ro());
        assert!(spte.is_leaf(PT_LEVEL_4K));
        assert!(!spte.huge());
        assert!(!spte.writable());
    }

    #[test]
    fn test_nonleaf_encoding() {
        let spte = Spte::nonleaf(7);
        assert!(spte.is_present());
        assert!(!spte.is_leaf(PT_LEVEL_2M));
        assert!(!spte.is_last(PT_LEVEL_2M));
        assert_eq!(spte.pfn(), 7);
    }

    #[test]
    fn test_private_zapped_retains_frame() {
        let leaf = Spte::leaf(0xabcd, PT_LEVEL_2M, PtePerms::rwx());
        let zapped = Spte::private_zapped_of(leaf);
        assert!(!zapped.is_present());
        assert!(zapped.is_private_zapped());
        assert!(zapped.is_last(PT_LEVEL_2M));
        assert_eq!(zapped.pfn(), 0xabcd);
        assert!(!zapped.is_removed());
    }

    #[test]
    fn test_sentinel_distinguishable_from_zapped() {
        let leaf = Spte::leaf(0x1, PT_LEVEL_4K, PtePerms::rwx());
        let zapped = Spte::private_zapped_of(leaf);
        assert_ne!(zapped.into_bits(), REMOVED_BITS);
        assert_ne!(Spte::none().into_bits(), REMOVED_BITS);
        assert_ne!(leaf.into_bits(), REMOVED_BITS);
    }
}
