// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process fake of the paravirtualized device, with enough behavior to
//! drive the driver end to end: posted/used rings with peek-then-finalize
//! semantics, a control ring with a programmable ack, interrupt callbacks
//! honoring the enable state, and an optional peer link that copies
//! transmitted frames into the peer's posted receive buffers.
//!
//! The fake dereferences the guest addresses handed to it, so tests must
//! keep the owning driver state alive across any frame delivery.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use virtio::spec;
use virtio::InterruptHandler;
use virtio::RingFull;
use virtio::UsedElem;
use virtio::VirtioDevice;
use virtio::VirtioRing;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const RING_CAP: usize = 256;

#[derive(Debug, Copy, Clone)]
struct Sg {
    addr: u64,
    len: u32,
    device_writable: bool,
}

#[derive(Debug, Clone)]
struct Posted {
    cookie: u64,
    sg: Vec<Sg>,
}

#[derive(Default)]
struct RingInner {
    staged: Vec<Sg>,
    posted: VecDeque<Posted>,
    device_held: Vec<Posted>,
    used: VecDeque<UsedElem>,
}

impl RingInner {
    fn outstanding(&self) -> usize {
        self.posted.len() + self.device_held.len() + self.used.len()
    }
}

pub(crate) struct FakeRing {
    dev: Weak<FakeDevice>,
    index: u16,
    inner: Mutex<RingInner>,
    interrupts_enabled: AtomicBool,
    handler: Mutex<Option<InterruptHandler>>,
}

impl FakeRing {
    fn new(dev: Weak<FakeDevice>, index: u16) -> Self {
        Self {
            dev,
            index,
            inner: Mutex::new(RingInner::default()),
            interrupts_enabled: AtomicBool::new(true),
            handler: Mutex::new(None),
        }
    }

    fn fire_interrupt(&self) {
        if self.interrupts_enabled.load(Ordering::SeqCst) {
            if let Some(handler) = &*self.handler.lock() {
                handler();
            }
        }
    }
}

impl VirtioRing for FakeRing {
    fn init_sg(&self) {
        self.inner.lock().staged.clear();
    }

    fn add_in_sg(&self, addr: u64, len: u32) {
        self.inner.lock().staged.push(Sg {
            addr,
            len,
            device_writable: true,
        });
    }

    fn add_out_sg(&self, addr: u64, len: u32) {
        self.inner.lock().staged.push(Sg {
            addr,
            len,
            device_writable: false,
        });
    }

    fn add_buf(&self, cookie: u64) -> Result<(), RingFull> {
        let mut inner = self.inner.lock();
        if inner.outstanding() >= RING_CAP {
            return Err(RingFull);
        }
        let sg = std::mem::take(&mut inner.staged);
        inner.posted.push_back(Posted { cookie, sg });
        Ok(())
    }

    fn kick(&self) {
        if let Some(dev) = self.dev.upgrade() {
            dev.on_kick(self.index);
        }
    }

    fn get_buf_elem(&self) -> Option<UsedElem> {
        self.inner.lock().used.front().copied()
    }

    fn get_buf_finalize(&self) {
        self.inner.lock().used.pop_front();
    }

    fn used_ring_not_empty(&self) -> bool {
        !self.inner.lock().used.is_empty()
    }

    fn disable_interrupts(&self) {
        self.interrupts_enabled.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts_enabled.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FakeDevice {
    rings: Vec<Arc<FakeRing>>,
    pairs: u16,
    max_pairs: AtomicU16,
    features: Mutex<u64>,
    acked: Mutex<u64>,
    modern: AtomicBool,
    status: AtomicU8,
    ctrl_ack: AtomicU8,
    tx_auto_complete: AtomicBool,
    peer: Mutex<Weak<FakeDevice>>,
    affinity: Mutex<HashMap<u16, u32>>,
    tx_log: Mutex<Vec<Vec<u8>>>,
    ctrl_log: Mutex<Vec<[u8; 4]>>,
}

impl FakeDevice {
    /// A modern device offering CTRL_VQ + MQ, with one ring pair per
    /// queue plus the trailing control ring.
    pub fn new(pairs: u16) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<FakeDevice>| Self {
            rings: (0..=2 * pairs)
                .map(|i| Arc::new(FakeRing::new(weak.clone(), i)))
                .collect(),
            pairs,
            max_pairs: AtomicU16::new(pairs),
            features: Mutex::new(spec::VIRTIO_NET_F_CTRL_VQ | spec::VIRTIO_NET_F_MQ),
            acked: Mutex::new(0),
            modern: AtomicBool::new(true),
            status: AtomicU8::new(0),
            ctrl_ack: AtomicU8::new(spec::VIRTIO_NET_OK),
            tx_auto_complete: AtomicBool::new(true),
            peer: Mutex::new(Weak::new()),
            affinity: Mutex::new(HashMap::new()),
            tx_log: Mutex::new(Vec::new()),
            ctrl_log: Mutex::new(Vec::new()),
        })
    }

    /// Connects two devices back to back; each delivers its transmitted
    /// frames into the other's receive ring 0.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    pub fn set_device_features(&self, features: u64) {
        *self.features.lock() = features;
    }

    pub fn set_legacy(&self) {
        self.modern.store(false, Ordering::SeqCst);
    }

    pub fn set_max_pairs(&self, pairs: u16) {
        self.max_pairs.store(pairs, Ordering::SeqCst);
    }

    pub fn set_ctrl_ack(&self, ack: u8) {
        self.ctrl_ack.store(ack, Ordering::SeqCst);
    }

    pub fn set_tx_auto_complete(&self, auto_complete: bool) {
        self.tx_auto_complete.store(auto_complete, Ordering::SeqCst);
    }

    pub fn acked_features(&self) -> u64 {
        *self.acked.lock()
    }

    pub fn status(&self) -> u8 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn ctrl_commands(&self) -> Vec<[u8; 4]> {
        self.ctrl_log.lock().clone()
    }

    pub fn interrupt_affinity(&self, ring_index: u16) -> Option<u32> {
        self.affinity.lock().get(&ring_index).copied()
    }

    pub fn tx_frames(&self) -> Vec<Vec<u8>> {
        self.tx_log.lock().clone()
    }

    /// Cookies of transmit buffers the device currently holds (posted or
    /// withheld from completion) on `queue`.
    pub fn tx_outstanding_cookies(&self, queue: usize) -> Vec<u64> {
        let inner = self.rings[2 * queue + 1].inner.lock();
        inner
            .posted
            .iter()
            .chain(inner.device_held.iter())
            .map(|p| p.cookie)
            .chain(inner.used.iter().map(|u| u.cookie))
            .collect()
    }

    /// Completes up to `n` withheld transmit buffers on `queue`.
    pub fn complete_tx(&self, queue: usize, n: usize) -> usize {
        let ring = &self.rings[2 * queue + 1];
        let mut inner = ring.inner.lock();
        let n = n.min(inner.device_held.len());
        for posted in inner.device_held.drain(..n).collect::<Vec<_>>() {
            inner.used.push_back(UsedElem {
                cookie: posted.cookie,
                len: 0,
            });
        }
        drop(inner);
        ring.fire_interrupt();
        n
    }

    /// Device-side injection of a frame into `queue`'s receive ring.
    /// Returns false if no receive buffer was available (the frame is
    /// dropped, as the device would).
    pub fn deliver_rx(&self, queue: usize, frame: &[u8]) -> bool {
        let ring = &self.rings[2 * queue];
        let mut inner = ring.inner.lock();
        let Some(posted) = inner.posted.pop_front() else {
            return false;
        };
        let Some(sg) = posted.sg.iter().find(|sg| sg.device_writable) else {
            return false;
        };
        let len = frame.len().min(sg.len as usize);
        // SAFETY: the address points into a live DMA frame posted by the
        // driver; the driver does not touch it until the used element below
        // hands it back.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), sg.addr as *mut u8, len);
        }
        inner.used.push_back(UsedElem {
            cookie: posted.cookie,
            len: len as u32,
        });
        drop(inner);
        ring.fire_interrupt();
        true
    }

    fn on_kick(&self, index: u16) {
        if index == 2 * self.pairs {
            self.service_ctrl();
        } else if index % 2 == 1 {
            self.service_tx(index);
        }
        // A receive-ring kick just reports replenished buffers.
    }

    fn service_tx(&self, index: u16) {
        let ring = &self.rings[index as usize];
        loop {
            let posted = {
                let mut inner = ring.inner.lock();
                let Some(posted) = inner.posted.pop_front() else {
                    break;
                };
                posted
            };

            let mut frame = Vec::new();
            for sg in posted.sg.iter().filter(|sg| !sg.device_writable) {
                // SAFETY: the address points into a live DMA frame owned by
                // the submitting queue until this buffer completes.
                let bytes =
                    unsafe { std::slice::from_raw_parts(sg.addr as *const u8, sg.len as usize) };
                frame.extend_from_slice(bytes);
            }
            self.tx_log.lock().push(frame.clone());

            if let Some(peer) = self.peer.lock().upgrade() {
                peer.deliver_rx(0, &frame);
            }

            let mut inner = ring.inner.lock();
            if self.tx_auto_complete.load(Ordering::SeqCst) {
                inner.used.push_back(UsedElem {
                    cookie: posted.cookie,
                    len: 0,
                });
                drop(inner);
                ring.fire_interrupt();
            } else {
                inner.device_held.push(posted);
            }
        }
    }

    fn service_ctrl(&self) {
        let ring = &self.rings[2 * self.pairs as usize];
        let mut inner = ring.inner.lock();
        while let Some(posted) = inner.posted.pop_front() {
            let mut cmd = [0u8; 4];
            if let Some(out) = posted.sg.iter().find(|sg| !sg.device_writable) {
                let len = cmd.len().min(out.len as usize);
                // SAFETY: the command buffer stays allocated while the
                // driver busy-waits for the ack.
                unsafe {
                    std::ptr::copy_nonoverlapping(out.addr as *const u8, cmd.as_mut_ptr(), len);
                }
            }
            self.ctrl_log.lock().push(cmd);
            if let Some(ack) = posted.sg.iter().find(|sg| sg.device_writable) {
                // SAFETY: as above; the ack byte is part of the same
                // command buffer.
                unsafe {
                    *(ack.addr as *mut u8) = self.ctrl_ack.load(Ordering::SeqCst);
                }
            }
            inner.used.push_back(UsedElem {
                cookie: posted.cookie,
                len: 1,
            });
        }
    }
}

impl VirtioDevice for FakeDevice {
    fn device_features(&self) -> u64 {
        *self.features.lock()
    }

    fn ack_features(&self, features: u64) {
        *self.acked.lock() = features;
    }

    fn is_modern(&self) -> bool {
        self.modern.load(Ordering::SeqCst)
    }

    fn read_config(&self, offset: u16, buf: &mut [u8]) {
        let mut cfg = spec::NetConfig::new_zeroed();
        cfg.max_virtqueue_pairs = self.max_pairs.load(Ordering::SeqCst).into();
        let bytes = cfg.as_bytes();
        let start = (offset as usize).min(bytes.len());
        let end = (start + buf.len()).min(bytes.len());
        buf[..end - start].copy_from_slice(&bytes[start..end]);
    }

    fn ring(&self, index: u16) -> Option<Arc<dyn VirtioRing>> {
        self.rings
            .get(index as usize)
            .map(|ring| ring.clone() as Arc<dyn VirtioRing>)
    }

    fn register_interrupt(&self, ring_index: u16, handler: InterruptHandler) {
        if let Some(ring) = self.rings.get(ring_index as usize) {
            *ring.handler.lock() = Some(handler);
        }
    }

    fn set_interrupt_affinity(&self, ring_index: u16, vcpu: u32) {
        self.affinity.lock().insert(ring_index, vcpu);
    }

    fn add_status(&self, status: u8) {
        self.status.fetch_or(status, Ordering::SeqCst);
    }
}
