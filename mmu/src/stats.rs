// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use core::sync::atomic::{AtomicI64, Ordering};

use crate::types::{PT_LEVEL_4K, PT_ROOT_LEVEL};

/// Per-VM mapping statistics. Adjusted only from the changed-entry
/// bookkeeping, readable at any time without locking.
#[derive(Debug, Default)]
pub struct MmuStats {
    /// Present leaf mappings, indexed by level - 1.
    leaf_pages: [AtomicI64; (PT_ROOT_LEVEL - PT_LEVEL_4K) as usize],
    /// Live table nodes of the shared class, roots included.
    table_pages: AtomicI64,
    /// Live table nodes of the private class.
    private_table_pages: AtomicI64,
}

impl MmuStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adjust_leaf(&self, level: u8, delta: i64) {
        self.leaf_pages[(level - PT_LEVEL_4K) as usize].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn leaf_pages(&self, level: u8) -> i64 {
        self.leaf_pages[(level - PT_LEVEL_4K) as usize].load(Ordering::Relaxed)
    }

    pub fn account_table(&self, private: bool, delta: i64) {
        if private {
            self.private_table_pages.fetch_add(delta, Ordering::Relaxed);
        } else {
            self.table_pages.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn table_pages(&self, private: bool) -> i64 {
        if private {
            self.private_table_pages.load(Ordering::Relaxed)
        } else {
            self.table_pages.load(Ordering::Relaxed)
        }
    }
}
