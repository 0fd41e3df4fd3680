// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::backend::TrustModule;
use crate::locking::SpinLock;

/// TLB synchronization state of one attached vCPU.
///
/// The vCPU loop calls [`VcpuTlb::enter_guest`] before dropping into the
/// guest and [`VcpuTlb::exit_guest`] after every exit; both acknowledge
/// the current epoch, so a removal that bumped the epoch can prove the
/// vCPU re-synchronized by comparing counters.
#[derive(Debug)]
pub struct VcpuTlb {
    epoch: Arc<AtomicU64>,
    in_guest: AtomicBool,
    seen_epoch: AtomicU64,
    flush_requested: AtomicBool,
}

impl VcpuTlb {
    fn ack(&self) {
        self.seen_epoch
            .store(self.epoch.load(Ordering::Acquire), Ordering::Release);
        self.flush_requested.store(false, Ordering::Release);
    }

    pub fn enter_guest(&self) {
        self.ack();
        self.in_guest.store(true, Ordering::SeqCst);
        // Re-check after publishing the in-guest state; a concurrent
        // epoch bump between the first ack and the store would
        // otherwise go unnoticed until the next exit.
        self.ack();
    }

    pub fn exit_guest(&self) {
        self.in_guest.store(false, Ordering::SeqCst);
        self.ack();
    }

    pub fn in_guest(&self) -> bool {
        self.in_guest.load(Ordering::SeqCst)
    }

    /// Whether a remote invalidation is outstanding for this vCPU.
    pub fn flush_requested(&self) -> bool {
        self.flush_requested.load(Ordering::Acquire)
    }

    fn behind(&self, epoch: u64) -> bool {
        self.seen_epoch.load(Ordering::Acquire) < epoch
    }
}

/// The per-VM TLB consistency epoch.
///
/// Any removal of a present mapping must call [`TlbTracker::track`]
/// before the freed backing frame may be reused: the epoch is advanced,
/// every attached vCPU is kicked, the trust module is told to
/// revalidate on next entry, and the call returns only when no vCPU is
/// still inside the guest with a stale epoch. The wait makes forward
/// progress as vCPUs exit on their own schedule; the expected bound is
/// one guest-exit period of the slowest vCPU.
#[derive(Debug)]
pub struct TlbTracker {
    epoch: Arc<AtomicU64>,
    /// Set by a private block operation; cleared by the next track.
    /// Allows removal paths to skip redundant epoch advances.
    blocked_since_track: AtomicBool,
    vcpus: SpinLock<Vec<Arc<VcpuTlb>>>,
}

impl TlbTracker {
    pub fn new() -> Self {
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
            blocked_since_track: AtomicBool::new(false),
            vcpus: SpinLock::new(Vec::new()),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Registers a vCPU with the tracker.
    pub fn attach_vcpu(&self) -> Arc<VcpuTlb> {
        let vcpu = Arc::new(VcpuTlb {
            epoch: self.epoch.clone(),
            in_guest: AtomicBool::new(false),
            seen_epoch: AtomicU64::new(self.epoch.load(Ordering::Acquire)),
            flush_requested: AtomicBool::new(false),
        });
        self.vcpus.lock().push(vcpu.clone());
        vcpu
    }

    pub fn detach_vcpu(&self, vcpu: &Arc<VcpuTlb>) {
        self.vcpus.lock().retain(|v| !Arc::ptr_eq(v, vcpu));
    }

    /// Notes that a range was blocked and a track is now required before
    /// any backing frame of the range is reused.
    pub fn note_blocked(&self) {
        self.blocked_since_track.store(true, Ordering::Release);
    }

    /// Whether any block happened since the last track.
    pub fn track_needed(&self) -> bool {
        self.blocked_since_track.load(Ordering::Acquire)
    }

    /// Advances the epoch and waits until every vCPU currently inside
    /// the guest has observed it.
    pub fn track(&self, module: &dyn TrustModule) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.blocked_since_track.store(false, Ordering::Release);

        let vcpus: Vec<_> = self.vcpus.lock().clone();
        for vcpu in &vcpus {
            vcpu.flush_requested.store(true, Ordering::Release);
        }

        if let Err(err) = module.advance_epoch() {
            // The module cannot refuse an epoch advance; treat anything
            // else as a protocol violation worth shouting about.
            log::error!("trust module rejected epoch advance: {:?}", err);
        }

        for vcpu in &vcpus {
            while vcpu.in_guest() && vcpu.behind(epoch) {
                core::hint::spin_loop();
            }
        }
    }
}

impl Default for TlbTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullModule;

    #[test]
    fn test_track_without_vcpus() {
        let tracker = TlbTracker::new();
        tracker.track(&NullModule);
        assert_eq!(tracker.current_epoch(), 1);
    }

    #[test]
    fn test_idle_vcpu_does_not_block_track() {
        let tracker = TlbTracker::new();
        let vcpu = tracker.attach_vcpu();
        // The vCPU is outside the guest; track must complete without an
        // acknowledgment.
        tracker.track(&NullModule);
        assert!(vcpu.flush_requested());
        vcpu.enter_guest();
        assert!(!vcpu.flush_requested());
    }

    #[test]
    fn test_track_waits_for_running_vcpu() {
        use std::sync::Arc as StdArc;

        let tracker = StdArc::new(TlbTracker::new());
        let vcpu = tracker.attach_vcpu();
        vcpu.enter_guest();

        let t = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                tracker.track(&NullModule);
            })
        };

        // Give the tracker a moment to start waiting, then exit the
        // guest to acknowledge.
        std::thread::sleep(std::time::Duration::from_millis(20));
        vcpu.exit_guest();
        t.join().unwrap();
        assert_eq!(tracker.current_epoch(), 1);
    }

    #[test]
    fn test_blocked_flag_cleared_by_track() {
        let tracker = TlbTracker::new();
        tracker.note_blocked();
        assert!(tracker.track_needed());
        tracker.track(&NullModule);
        assert!(!tracker.track_needed());
    }
}
