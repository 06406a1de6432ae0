// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-vCPU transport queue: one receive/transmit virtqueue pair, the
//! pinned receive poll thread, and the transmit buffer freelist.

use crate::packet::Packet;
use crate::sched;
use crate::socket::DispatchError;
use crate::socket::SocketTable;
use crate::Error;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::thread::Thread;
use thiserror::Error as ThisError;
use virtio::spec;
use virtio::VirtioDevice;
use virtio::VirtioRing;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Receive and transmit ring depth, fixed by the device contract.
pub(crate) const RING_SIZE: usize = 256;

/// Largest frame exchanged with the device (modern net header + packet).
const MAX_FRAME: usize = spec::net_hdr_size(true) + Packet::SIZE;

/// Transport statistics, per queue or summed across the device.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DevStats {
    pub rx_pkts: u64,
    pub rx_sockq_full: u64,
    pub rx_wakeups: u64,
    pub tx_pkts: u64,
    pub tx_errors: u64,
}

impl DevStats {
    pub(crate) fn accumulate(&mut self, other: &DevStats) {
        self.rx_pkts += other.rx_pkts;
        self.rx_sockq_full += other.rx_sockq_full;
        self.rx_wakeups += other.rx_wakeups;
        self.tx_pkts += other.tx_pkts;
        self.tx_errors += other.tx_errors;
    }
}

/// Live counters. Each field is written only by the thread owning that
/// side of the queue; snapshots copy field by field so no read is torn.
#[derive(Default)]
pub(crate) struct QueueStats {
    rx_pkts: AtomicU64,
    rx_sockq_full: AtomicU64,
    rx_wakeups: AtomicU64,
    tx_pkts: AtomicU64,
    tx_errors: AtomicU64,
}

impl QueueStats {
    fn snapshot(&self) -> DevStats {
        DevStats {
            rx_pkts: self.rx_pkts.load(Ordering::Relaxed),
            rx_sockq_full: self.rx_sockq_full.load(Ordering::Relaxed),
            rx_wakeups: self.rx_wakeups.load(Ordering::Relaxed),
            tx_pkts: self.tx_pkts.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }
}

/// A frame buffer the device reads or writes while the driver is not
/// looking; the ring's used-element handoff orders the accesses.
struct DmaFrame(UnsafeCell<[u8; MAX_FRAME]>);

// SAFETY: the driver touches a frame only while it owns it (before
// submission, after completion); in between only the device does.
unsafe impl Sync for DmaFrame {}

impl DmaFrame {
    fn new() -> Self {
        Self(UnsafeCell::new([0; MAX_FRAME]))
    }

    fn addr(&self) -> u64 {
        self.0.get() as u64
    }
}

#[derive(Debug, ThisError)]
enum RxError {
    #[error("unexpected frame length {len}, expected {expected}")]
    FrameLen { len: u32, expected: u32 },
    #[error("used element carries out-of-range cookie {cookie}")]
    Cookie { cookie: u64 },
    #[error("error refilling the receive ring")]
    Repost(#[source] virtio::RingFull),
}

struct TxState {
    ring: Arc<dyn VirtioRing>,
    bufs: Box<[DmaFrame; RING_SIZE]>,
    freelist: [u16; RING_SIZE],
    freelist_head: i32,
    net_hdr_size: usize,
}

impl TxState {
    fn submit(&mut self, pkt: &Packet) -> Result<(), Error> {
        if self.freelist_head < 0 {
            // Recycle whatever the device has finished with.
            while let Some(elem) = self.ring.get_buf_elem() {
                // Cookies are offset by one so a used element can never
                // read as null.
                debug_assert!(elem.cookie >= 1 && elem.cookie <= RING_SIZE as u64);
                self.freelist_head += 1;
                self.freelist[self.freelist_head as usize] = (elem.cookie - 1) as u16;
                self.ring.get_buf_finalize();
            }
            if self.freelist_head < 0 {
                return Err(Error::QueueFull);
            }
        }

        let buf = self.freelist[self.freelist_head as usize] as usize;
        self.freelist_head -= 1;

        // The net header bytes stay untouched: no net feature is
        // negotiated, so the device ignores them.
        // SAFETY: `buf` came off the freelist, so the driver owns the
        // frame until the device completes it.
        unsafe {
            let dst = (self.bufs[buf].0.get() as *mut u8).add(self.net_hdr_size);
            std::ptr::copy_nonoverlapping(pkt.as_bytes().as_ptr(), dst, Packet::SIZE);
        }

        self.ring.init_sg();
        self.ring
            .add_out_sg(self.bufs[buf].addr(), (self.net_hdr_size + Packet::SIZE) as u32);
        if let Err(err) = self.ring.add_buf((buf + 1) as u64) {
            tracing::error!("error adding buffer to the transmit ring");
            self.freelist_head += 1;
            return Err(err.into());
        }
        self.ring.kick();
        Ok(())
    }
}

/// One receive/transmit virtqueue pair, pinned to a vCPU.
pub(crate) struct TransportQueue {
    id: u32,
    tx: Mutex<TxState>,
    stats: Arc<QueueStats>,
    shutdown: Arc<AtomicBool>,
    poll_thread: Thread,
    poll_join: Mutex<Option<JoinHandle<()>>>,
}

impl TransportQueue {
    pub fn new(
        id: u32,
        dev: Arc<dyn VirtioDevice>,
        rx_ring_index: u16,
        rx_ring: Arc<dyn VirtioRing>,
        tx_ring: Arc<dyn VirtioRing>,
        net_hdr_size: usize,
        rx_frame_size: u32,
        sockets: Arc<SocketTable>,
    ) -> Result<TransportQueue, crate::driver::ProbeError> {
        let rx_bufs: Box<[DmaFrame; RING_SIZE]> = Box::new(std::array::from_fn(|_| DmaFrame::new()));
        for (i, buf) in rx_bufs.iter().enumerate() {
            rx_ring.init_sg();
            rx_ring.add_in_sg(buf.addr(), rx_frame_size);
            rx_ring
                .add_buf(i as u64)
                .map_err(|err| crate::driver::ProbeError::RxFill {
                    queue: id,
                    source: err,
                })?;
        }

        let stats = Arc::new(QueueStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut worker = RxWorker {
            id,
            dev: dev.clone(),
            rx_ring_index,
            ring: rx_ring.clone(),
            bufs: rx_bufs,
            net_hdr_size,
            rx_frame_size,
            sockets,
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        };
        let join = thread::Builder::new()
            .name(format!("shm-xchg-rx/{id}"))
            .spawn(move || worker.run())
            .expect("spawning the receive poll thread");
        let poll_thread = join.thread().clone();

        // The receive interrupt quiesces the ring and hands off to the
        // poll thread; the transmit side never waits, so its interrupt
        // only quiesces.
        let rx_wake = {
            let ring = rx_ring.clone();
            let thread = poll_thread.clone();
            move || {
                ring.disable_interrupts();
                thread.unpark();
            }
        };
        dev.register_interrupt(rx_ring_index, Box::new(rx_wake));
        let tx_quiesce = {
            let ring = tx_ring.clone();
            move || ring.disable_interrupts()
        };
        dev.register_interrupt(rx_ring_index + 1, Box::new(tx_quiesce));
        // Anything delivered before the handler registration would have
        // been silent; nudge the poll thread to recheck once.
        poll_thread.unpark();

        let mut freelist = [0u16; RING_SIZE];
        for (i, slot) in freelist.iter_mut().enumerate() {
            *slot = i as u16;
        }

        Ok(TransportQueue {
            id,
            tx: Mutex::new(TxState {
                ring: tx_ring,
                bufs: Box::new(std::array::from_fn(|_| DmaFrame::new())),
                freelist,
                freelist_head: RING_SIZE as i32 - 1,
                net_hdr_size,
            }),
            stats,
            shutdown,
            poll_thread,
            poll_join: Mutex::new(Some(join)),
        })
    }

    /// Submits one packet on this queue's transmit ring.
    pub fn xmit_pkt(&self, pkt: &Packet) -> Result<(), Error> {
        let mut tx = self.tx.lock();
        match tx.submit(pkt) {
            Ok(()) => {
                self.stats.tx_pkts.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> DevStats {
        self.stats.snapshot()
    }

    /// Stops and joins the poll thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.poll_thread.unpark();
        if let Some(join) = self.poll_join.lock().take() {
            let _ = join.join();
        }
    }

    #[cfg(test)]
    pub fn poll_thread_finished(&self) -> bool {
        self.poll_join
            .lock()
            .as_ref()
            .is_none_or(|join| join.is_finished())
    }
}

struct RxWorker {
    id: u32,
    dev: Arc<dyn VirtioDevice>,
    rx_ring_index: u16,
    ring: Arc<dyn VirtioRing>,
    bufs: Box<[DmaFrame; RING_SIZE]>,
    net_hdr_size: usize,
    rx_frame_size: u32,
    sockets: Arc<SocketTable>,
    stats: Arc<QueueStats>,
    shutdown: Arc<AtomicBool>,
}

impl RxWorker {
    fn run(&mut self) {
        if let Err(err) = sched::pin_current_thread(self.id as usize) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                queue = self.id,
                "could not pin the receive poll thread"
            );
        }
        if let Err(err) = self.poll_rx() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                queue = self.id,
                "receive poll thread failed"
            );
        }
    }

    fn poll_rx(&mut self) -> Result<(), RxError> {
        let mut first_wake = true;
        loop {
            self.wait_for_used();
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.stats.rx_wakeups.fetch_add(1, Ordering::Relaxed);
            if first_wake {
                // The first delivery lands on vCPU 0 (device default);
                // steer the vector to this queue's vCPU from now on.
                self.dev.set_interrupt_affinity(self.rx_ring_index, self.id);
                first_wake = false;
            }

            while let Some(elem) = self.ring.get_buf_elem() {
                self.ring.get_buf_finalize();
                self.stats.rx_pkts.fetch_add(1, Ordering::Relaxed);
                self.handle_frame(elem.cookie, elem.len)?;

                // Recycle immediately; batching the repost is a tunable
                // that trades device stalls for fewer kicks.
                let buf = &self.bufs[elem.cookie as usize];
                self.ring.init_sg();
                self.ring.add_in_sg(buf.addr(), self.rx_frame_size);
                self.ring.add_buf(elem.cookie).map_err(RxError::Repost)?;
            }
            self.ring.kick();
        }
    }

    fn handle_frame(&self, cookie: u64, len: u32) -> Result<(), RxError> {
        if cookie >= RING_SIZE as u64 {
            return Err(RxError::Cookie { cookie });
        }
        if len != self.rx_frame_size {
            // The wire format is trusted; anything else means the peer and
            // this driver disagree and nothing received can be believed.
            return Err(RxError::FrameLen {
                len,
                expected: self.rx_frame_size,
            });
        }

        // SAFETY: the used element returned this buffer to the driver; the
        // device is done writing it.
        let frame = unsafe {
            std::slice::from_raw_parts(
                self.bufs[cookie as usize].0.get() as *const u8,
                self.rx_frame_size as usize,
            )
        };
        let Ok(pkt) = Packet::read_from_bytes(&frame[self.net_hdr_size..]) else {
            return Err(RxError::FrameLen {
                len,
                expected: self.rx_frame_size,
            });
        };

        match self.sockets.dispatch(&pkt) {
            Ok(()) => {}
            Err(DispatchError::QueueFull) => {
                self.stats.rx_sockq_full.fetch_add(1, Ordering::Relaxed);
            }
            Err(DispatchError::NoSocket) => {
                tracing::debug!(dport = pkt.hdr.dport.get(), "no matching socket for packet");
            }
        }
        Ok(())
    }

    /// Blocks until the used ring is non-empty (or shutdown), leaving
    /// interrupts disabled.
    fn wait_for_used(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if self.ring.used_ring_not_empty() {
                self.ring.disable_interrupts();
                return;
            }
            self.ring.enable_interrupts();
            if self.ring.used_ring_not_empty() {
                self.ring.disable_interrupts();
                return;
            }
            thread::park();
        }
    }
}
