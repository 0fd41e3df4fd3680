// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Jon Lange <jlange@microsoft.com>

use crate::types::{Gfn, Pfn};

/// Opaque token identifying the trust module's mirror of one page-table
/// page. Created and destroyed strictly in step with the local node it
/// mirrors, never independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorHandle(pub u64);

/// Status codes reported by the external trust module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeptError {
    /// The module's entry is owned by a concurrent operation. Retryable.
    Busy,
    /// The requested range is already in the blocked state. Retryable,
    /// another thread won the race.
    AlreadyBlocked,
    /// The operation cannot complete yet (e.g. TLB tracking or partial
    /// acceptance still outstanding). Retryable.
    Pending,
    /// The module rejected the operands; local and remote state disagree
    /// about something other than a benign race. Fatal.
    Invalid,
    /// The module holds a different frame than the hypervisor's record.
    /// Always a consistency violation. Fatal.
    FrameMismatch,
    /// The operation is not supported by this backend.
    Unsupported,
}

/// The mapping interface of the external trust module.
///
/// The module independently owns the real mapping state of every private
/// page; each method mirrors exactly one local entry transition and is
/// called inside the freeze/commit window of that transition so that the
/// two copies never observably diverge. Implementations may block and may
/// fail transiently; they must never be called twice for the same
/// transition.
///
/// One implementation exists per hardware backend and is selected when
/// the VM is created.
pub trait TrustModule: core::fmt::Debug + Send + Sync {
    /// Installs a leaf mapping during VM build, before the first run.
    fn add_leaf(&self, gfn: Gfn, level: u8, pfn: Pfn) -> Result<(), SeptError>;

    /// Installs a leaf mapping at runtime.
    fn augment_leaf(&self, gfn: Gfn, level: u8, pfn: Pfn) -> Result<(), SeptError>;

    /// Removes a leaf mapping. The range must have been blocked and the
    /// removal epoch tracked beforehand.
    fn remove_leaf(&self, gfn: Gfn, level: u8, pfn: Pfn) -> Result<(), SeptError>;

    /// Links the mirror of a new child table below `gfn` at `level`.
    fn link_table(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), SeptError>;

    /// Unlinks the mirror of a child table. Valid only once the child
    /// holds no mappings.
    fn unlink_table(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), SeptError>;

    /// Demotes a huge leaf at `level` into the child table `table`.
    fn split(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), SeptError>;

    /// Promotes the fully-populated child table `table` into one huge
    /// leaf at `level`.
    fn merge(&self, gfn: Gfn, level: u8, table: MirrorHandle) -> Result<(), SeptError>;

    /// Temporarily revokes the range covered by the entry at `gfn`,
    /// keeping the backing frame.
    fn block(&self, gfn: Gfn, level: u8) -> Result<(), SeptError>;

    /// Restores a previously blocked range.
    fn unblock(&self, gfn: Gfn, level: u8) -> Result<(), SeptError>;

    /// Advances the module's TLB-consistency epoch. vCPUs entering the
    /// guest afterwards are forced to resynchronize.
    fn advance_epoch(&self) -> Result<(), SeptError>;
}

/// Backend for VMs without a private memory class. The epoch advance is a
/// no-op (shared mappings are invalidated by the remote-kick mechanism
/// alone); every mapping operation is a caller bug.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullModule;

impl TrustModule for NullModule {
    fn add_leaf(&self, _gfn: Gfn, _level: u8, _pfn: Pfn) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn augment_leaf(&self, _gfn: Gfn, _level: u8, _pfn: Pfn) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn remove_leaf(&self, _gfn: Gfn, _level: u8, _pfn: Pfn) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn link_table(&self, _gfn: Gfn, _level: u8, _table: MirrorHandle) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn unlink_table(&self, _gfn: Gfn, _level: u8, _table: MirrorHandle) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn split(&self, _gfn: Gfn, _level: u8, _table: MirrorHandle) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn merge(&self, _gfn: Gfn, _level: u8, _table: MirrorHandle) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn block(&self, _gfn: Gfn, _level: u8) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn unblock(&self, _gfn: Gfn, _level: u8) -> Result<(), SeptError> {
        Err(SeptError::Unsupported)
    }

    fn advance_epoch(&self) -> Result<(), SeptError> {
        Ok(())
    }
}
