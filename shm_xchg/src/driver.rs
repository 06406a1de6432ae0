// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device probe, feature negotiation, multi-queue enablement, and the
//! per-vCPU queue set behind the transmit path.

use crate::packet::Packet;
use crate::queue::DevStats;
use crate::queue::TransportQueue;
use crate::sched;
use crate::socket::SocketTable;
use crate::Error;
use std::cell::UnsafeCell;
use std::sync::Arc;
use thiserror::Error as ThisError;
use virtio::spec;
use virtio::VirtioDevice;

/// Fatal errors surfaced while attaching to the device.
#[derive(Debug, ThisError)]
pub enum ProbeError {
    #[error("at least one vcpu queue is required")]
    NoVcpus,
    #[error("multiple vcpus but the device did not offer multiqueue (features {offered:#x})")]
    Multiqueue { offered: u64 },
    #[error("device exposes {pairs} virtqueue pairs, need {vcpus}")]
    QueuePairs { pairs: u16, vcpus: usize },
    #[error("device does not expose virtqueue {index}")]
    MissingRing { index: u16 },
    #[error("error filling the receive ring of queue {queue}")]
    RxFill {
        queue: u32,
        #[source]
        source: virtio::RingFull,
    },
    #[error("error submitting the multiqueue command")]
    CtrlSubmit(#[source] virtio::RingFull),
    #[error("device rejected the multiqueue configuration (ack {ack})")]
    CtrlNack { ack: u8 },
}

/// The transport driver: one queue pair per vCPU. The framing parameters
/// computed at probe time are captured by each queue.
pub(crate) struct Driver {
    queues: Vec<TransportQueue>,
}

impl Driver {
    pub fn probe(
        dev: Arc<dyn VirtioDevice>,
        vcpus: usize,
        sockets: Arc<SocketTable>,
    ) -> Result<Self, ProbeError> {
        if vcpus == 0 {
            return Err(ProbeError::NoVcpus);
        }

        let offered = dev.device_features();
        let wanted = spec::VIRTIO_NET_F_CTRL_VQ | spec::VIRTIO_NET_F_MQ;
        let negotiated = offered & wanted;
        if vcpus > 1 && negotiated != wanted {
            return Err(ProbeError::Multiqueue { offered });
        }
        dev.ack_features(negotiated);

        let mut raw = [0u8; 2];
        dev.read_config(spec::MAX_VIRTQUEUE_PAIRS_OFFSET, &mut raw);
        let pairs = u16::from_le_bytes(raw);
        if (pairs as usize) < vcpus {
            // One virtqueue pair per vcpu, no sharing.
            return Err(ProbeError::QueuePairs { pairs, vcpus });
        }

        let net_hdr_size = spec::net_hdr_size(dev.is_modern());
        let rx_frame_size = (net_hdr_size + Packet::SIZE) as u32;

        let mut queues = Vec::with_capacity(vcpus);
        for i in 0..vcpus as u16 {
            let rx_index = 2 * i;
            let rx_ring = dev
                .ring(rx_index)
                .ok_or(ProbeError::MissingRing { index: rx_index })?;
            let tx_ring = dev.ring(rx_index + 1).ok_or(ProbeError::MissingRing {
                index: rx_index + 1,
            })?;
            queues.push(TransportQueue::new(
                i as u32,
                dev.clone(),
                rx_index,
                rx_ring,
                tx_ring,
                net_hdr_size,
                rx_frame_size,
                sockets.clone(),
            )?);
        }

        if vcpus > 1 {
            if let Err(err) = Self::enable_multiqueue(dev.as_ref(), vcpus as u16) {
                for queue in &queues {
                    queue.shutdown();
                }
                return Err(err);
            }
        }

        dev.add_status(spec::VIRTIO_CONFIG_S_DRIVER_OK);
        tracing::info!(queues = vcpus, "shm-xchg transport ready");

        Ok(Self { queues })
    }

    /// Tells the device to use one virtqueue pair per vCPU, over the
    /// control ring that sits after all the data rings.
    fn enable_multiqueue(dev: &dyn VirtioDevice, pairs: u16) -> Result<(), ProbeError> {
        let index = 2 * pairs;
        let ctrl = dev.ring(index).ok_or(ProbeError::MissingRing { index })?;

        // Boxed so the command keeps a stable address for the DMA window;
        // the device writes the trailing ack byte in place.
        let cmd = Box::new(UnsafeCell::new(spec::NetCtrlMq {
            cmd_class: spec::VIRTIO_NET_CTRL_MQ,
            command: spec::VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET,
            virtqueue_pairs: pairs.into(),
            ack: 0,
        }));
        let base = cmd.get() as u64;
        ctrl.init_sg();
        ctrl.add_out_sg(base, spec::NetCtrlMq::OUT_LEN);
        ctrl.add_in_sg(base + spec::NetCtrlMq::ACK_OFFSET, 1);
        ctrl.add_buf(1).map_err(ProbeError::CtrlSubmit)?;
        ctrl.kick();

        while ctrl.get_buf_elem().is_none() {
            std::hint::spin_loop();
        }
        ctrl.get_buf_finalize();

        // SAFETY: the used element returned the command buffer; the device
        // is done with it.
        let ack = unsafe { (*cmd.get()).ack };
        if ack != spec::VIRTIO_NET_OK {
            return Err(ProbeError::CtrlNack { ack });
        }
        Ok(())
    }

    /// Submits a packet on the current vCPU's queue.
    ///
    /// The preempt guard keeps the queue choice stable across the
    /// submission; user threads beyond the configured vCPU count fold onto
    /// the queue set.
    pub fn xmit_pkt(&self, pkt: &Packet) -> Result<(), Error> {
        let guard = sched::preempt_disable();
        self.queues[guard.cpu() % self.queues.len()].xmit_pkt(pkt)
    }

    pub fn stats(&self) -> DevStats {
        let mut total = DevStats::default();
        for queue in &self.queues {
            total.accumulate(&queue.stats());
        }
        total
    }

    pub fn queue_stats(&self, queue: usize) -> Result<DevStats, Error> {
        self.queues
            .get(queue)
            .map(TransportQueue::stats)
            .ok_or(Error::InvalidArgument)
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}
