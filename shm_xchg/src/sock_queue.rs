// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wait-free multi-producer single-consumer ring carrying shared-memory
//! descriptors from the receive poll threads to a socket's owner.
//!
//! Producers never block: a full queue is reported to the caller, which
//! drops the packet and counts it. The consumer blocks on empty through a
//! precise wait/wake handshake: a slot state of `-1` marks the slot the
//! consumer is waiting on, and a producer publishing that slot offers a
//! wake-cancellation proposal through `cancel_wait`. Whoever wins the
//! compare-exchange on the proposal owes (or skips) the wake, so no wake is
//! ever lost.

use crate::packet::ShmDescriptor;
use crossbeam_epoch as epoch;
use crossbeam_epoch::Atomic;
use crossbeam_epoch::Owned;
use crossbeam_epoch::Shared;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::Thread;
use thiserror::Error;

const SIZE: usize = 256;
const MASK: u64 = SIZE as u64 - 1;

const _: () = assert!(SIZE.is_power_of_two());

/// The queue already holds [`SIZE`] published descriptors.
#[derive(Debug, Error)]
#[error("socket receive queue is full")]
pub(crate) struct QueueFull;

struct Slot(UnsafeCell<ShmDescriptor>);

// SAFETY: slot access is handed off through `desc_available`: a producer
// writes only between its slot claim and its publication, and the consumer
// reads only after observing the publication.
unsafe impl Sync for Slot {}

/// Bounded MPSC queue with a blocking consumer.
///
/// `consume` must only ever be called by one thread at a time; the socket
/// layer guarantees this by funneling it through `&mut Socket`.
pub(crate) struct SockQueue {
    descs: [Slot; SIZE],
    // 1: published, 0: empty, -1: empty and the consumer waits on it.
    desc_available: [AtomicI8; SIZE],
    cons_next: CachePadded<AtomicU64>,
    prod_next: CachePadded<AtomicU64>,
    // Conservative occupancy bound, used only for early full rejection.
    count: CachePadded<AtomicI32>,
    // The consumer's parked thread handle, epoch-managed so producers can
    // wake through it without racing its reclamation.
    waitobj: Atomic<Thread>,
    cancel_wait: AtomicBool,
}

impl SockQueue {
    pub fn new() -> Self {
        Self {
            descs: std::array::from_fn(|_| Slot(UnsafeCell::new(ShmDescriptor::default()))),
            desc_available: std::array::from_fn(|_| AtomicI8::new(0)),
            cons_next: CachePadded::new(AtomicU64::new(0)),
            prod_next: CachePadded::new(AtomicU64::new(0)),
            count: CachePadded::new(AtomicI32::new(0)),
            waitobj: Atomic::null(),
            cancel_wait: AtomicBool::new(false),
        }
    }

    /// Publishes `desc` into the next free slot, waking the consumer if it
    /// is waiting on that slot. Never blocks.
    pub fn produce(&self, desc: ShmDescriptor) -> Result<(), QueueFull> {
        if self.count.fetch_add(1, Ordering::SeqCst) >= SIZE as i32 {
            self.count.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueFull);
        }

        let slot = (self.prod_next.fetch_add(1, Ordering::SeqCst) & MASK) as usize;
        // SAFETY: the count reservation plus the prod_next claim make this
        // producer the sole writer of the slot until it publishes below.
        unsafe { *self.descs[slot].0.get() = desc };

        if self.desc_available[slot].fetch_add(1, Ordering::SeqCst) == -1 {
            // The consumer is waiting, or preparing to wait, on the slot we
            // just published. Propose that it cancel the wait.
            self.cancel_wait.store(true, Ordering::SeqCst);
            let guard = epoch::pin();
            let rec = self.waitobj.load(Ordering::SeqCst, &guard);
            if !rec.is_null()
                && self
                    .cancel_wait
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                // Proposal withdrawn; the wake is on us. The token is
                // cached, so it lands even if the consumer has not parked
                // yet.
                // SAFETY: the record is reclaimed through the epoch domain,
                // so it outlives this pinned section.
                unsafe { rec.deref() }.unpark();
            }
            // Otherwise the consumer accepted the proposal (or has not
            // registered its waiter yet and will see it).
        }

        Ok(())
    }

    /// Takes the next descriptor, blocking while the queue is empty.
    pub fn consume(&self) -> ShmDescriptor {
        let cons = self.cons_next.load(Ordering::Relaxed);
        let idx = (cons & MASK) as usize;
        if self.desc_available[idx].fetch_sub(1, Ordering::SeqCst) != 1 {
            self.wait_for_slot(idx);
        }

        // SAFETY: the slot was observed published, and no producer can
        // reclaim it before `count` is decremented below.
        let desc = unsafe { *self.descs[idx].0.get() };
        self.cons_next.store(cons.wrapping_add(1), Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::SeqCst);
        desc
    }

    /// Blocks until the slot at `idx` is published.
    ///
    /// Entered with `desc_available[idx] == -1`. The waiter record must be
    /// registered before checking the cancellation proposal so a producer
    /// that published concurrently either finds the record or leaves the
    /// proposal for us.
    fn wait_for_slot(&self, idx: usize) {
        self.waitobj.store(Owned::new(thread::current()), Ordering::SeqCst);

        // Accept a pending proposal so it cannot fire a stray wake later.
        let _ = self
            .cancel_wait
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst);

        // Wait for the publication itself rather than trusting the token:
        // park may return spuriously, and a proposal left over from an
        // earlier episode does not mean this slot is ready.
        while self.desc_available[idx].load(Ordering::SeqCst) < 0 {
            thread::park();
        }

        // Pinned only here, not across the park: a parked consumer must
        // not hold up epoch reclamation elsewhere in the process.
        let guard = epoch::pin();
        let rec = self.waitobj.swap(Shared::null(), Ordering::SeqCst, &guard);
        if !rec.is_null() {
            // SAFETY: detached from waitobj; a producer may still be
            // unparking through it inside its own pinned section, so
            // reclamation is deferred past that.
            unsafe { guard.defer_destroy(rec) };
        }
    }
}

impl Drop for SockQueue {
    fn drop(&mut self) {
        // SAFETY: exclusive access; no consumer is waiting and no producer
        // can observe the queue anymore.
        unsafe {
            let rec = self
                .waitobj
                .swap(Shared::null(), Ordering::SeqCst, epoch::unprotected());
            if !rec.is_null() {
                drop(rec.into_owned());
            }
        }
    }
}
