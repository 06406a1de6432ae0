// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interface contract between a paravirtualized device and its in-guest
//! driver: the virtqueue operation set, device-level probe operations, and
//! the network device constants and layouts in [`spec`].
//!
//! The traits here describe what a transport implementation provides; the
//! drivers built on top of them do not care whether the rings are backed by
//! real device memory or by an in-process fake.

pub mod spec;

use std::sync::Arc;
use thiserror::Error;

/// The ring has no free descriptors for another buffer.
#[derive(Debug, Error)]
#[error("no free descriptors in the ring")]
pub struct RingFull;

/// A completed buffer reported by the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsedElem {
    /// The cookie passed to [`VirtioRing::add_buf`] when the buffer was
    /// submitted. Drivers choose the encoding; by convention transmit
    /// cookies are `index + 1` so an absent element is never confused with
    /// buffer zero.
    pub cookie: u64,
    /// Bytes written by the device into the buffer's writable portion.
    pub len: u32,
}

/// One virtqueue of a paravirtualized device.
///
/// Implementations are internally synchronized the way hardware rings are;
/// callers still serialize submissions per ring (a unique poll thread on
/// the receive side, a preempt-guarded lock on the transmit side).
///
/// Buffers are staged with [`init_sg`](Self::init_sg) followed by
/// `add_*_sg` calls and submitted with [`add_buf`](Self::add_buf).
/// Completions are consumed with [`get_buf_elem`](Self::get_buf_elem),
/// which peeks the used ring, and [`get_buf_finalize`](Self::get_buf_finalize),
/// which advances past the peeked element.
pub trait VirtioRing: Send + Sync {
    /// Begins staging a new scatter-gather list.
    fn init_sg(&self);

    /// Appends a device-writable buffer to the staged list.
    fn add_in_sg(&self, addr: u64, len: u32);

    /// Appends a device-readable buffer to the staged list.
    fn add_out_sg(&self, addr: u64, len: u32);

    /// Submits the staged list to the available ring under `cookie`.
    fn add_buf(&self, cookie: u64) -> Result<(), RingFull>;

    /// Notifies the device that new buffers are available.
    fn kick(&self);

    /// Peeks the next completed buffer, if any.
    fn get_buf_elem(&self) -> Option<UsedElem>;

    /// Advances past the element returned by the last
    /// [`get_buf_elem`](Self::get_buf_elem).
    fn get_buf_finalize(&self);

    /// Returns whether the used ring holds unconsumed elements.
    fn used_ring_not_empty(&self) -> bool;

    /// Suppresses used-buffer interrupts for this ring.
    fn disable_interrupts(&self);

    /// Re-enables used-buffer interrupts for this ring.
    fn enable_interrupts(&self);
}

/// Callback invoked when a ring's used-buffer interrupt fires.
pub type InterruptHandler = Box<dyn Fn() + Send + Sync>;

/// Probe-time and lifecycle operations of a paravirtualized device.
pub trait VirtioDevice: Send + Sync {
    /// Feature bits offered by the device.
    fn device_features(&self) -> u64;

    /// Commits the driver's accepted feature set.
    fn ack_features(&self, features: u64);

    /// Returns whether the device uses the modern (1.0+) interface.
    fn is_modern(&self) -> bool;

    /// Reads `buf.len()` bytes of device-specific config at `offset`.
    fn read_config(&self, offset: u16, buf: &mut [u8]);

    /// Returns the virtqueue at `index`, if the device exposes it.
    fn ring(&self, index: u16) -> Option<Arc<dyn VirtioRing>>;

    /// Registers the interrupt handler for the ring at `ring_index`.
    fn register_interrupt(&self, ring_index: u16, handler: InterruptHandler);

    /// Steers the interrupt vector of the ring at `ring_index` to `vcpu`.
    fn set_interrupt_affinity(&self, ring_index: u16, vcpu: u32);

    /// ORs `status` into the device status register.
    fn add_status(&self, status: u8);
}
