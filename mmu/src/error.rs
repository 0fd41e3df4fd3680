// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

use crate::backend::SeptError;

// As a general rule, functions private to a given module may use the
// leaf error types. Public functions return an MmuError containing a
// leaf error type, converted via the From trait at the module level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmuError {
    // A concurrent writer won the race for an entry, or the external
    // trust module reported a transient condition. Retryable.
    Busy,
    // The node arena is exhausted
    NoMemory,
    // Errors reported by the external trust module
    Sept(SeptError),
    // The local tree and the trust module's mirror disagree in a way
    // that cannot be recovered; the VM must be terminated
    Corrupted,
    // Operation attempted after a fatal error marked the VM dead
    VmDead,
    // Invalid argument from the caller, e.g. an out-of-range level
    InvalidArgument,
}

impl From<SeptError> for MmuError {
    fn from(err: SeptError) -> Self {
        match err {
            SeptError::Busy | SeptError::Pending | SeptError::AlreadyBlocked => MmuError::Busy,
            _ => MmuError::Sept(err),
        }
    }
}
