// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::error::MmuError;
use crate::types::{PT_LEVEL_2M, PT_LEVEL_4K, PT_ROOT_LEVEL};

/// Static configuration of one VM's page-table manager, consulted once at
/// creation time.
#[derive(Clone, Copy, Debug)]
pub struct MmuConfig {
    /// Capacity of the node arena. Fixed for the lifetime of the VM so
    /// that lock-free walkers can dereference handles without
    /// revalidating the backing storage.
    pub node_capacity: usize,
    /// Number of guest address spaces (e.g. normal and system-management).
    pub nr_address_spaces: u16,
    /// Whether the private memory class is available. Requires a trust
    /// module backend that implements the mapping operations.
    pub private_enabled: bool,
    /// Largest level at which leaf mappings may be installed.
    pub max_huge_level: u8,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            node_capacity: 4096,
            nr_address_spaces: 1,
            private_enabled: false,
            max_huge_level: PT_LEVEL_2M,
        }
    }
}

impl MmuConfig {
    pub fn validate(&self) -> Result<(), MmuError> {
        if self.node_capacity == 0 || self.nr_address_spaces == 0 {
            return Err(MmuError::InvalidArgument);
        }
        if self.max_huge_level < PT_LEVEL_4K || self.max_huge_level >= PT_ROOT_LEVEL {
            return Err(MmuError::InvalidArgument);
        }
        Ok(())
    }
}
