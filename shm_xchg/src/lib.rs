// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared-memory descriptor exchange between co-resident VMs over a
//! paravirtualized NIC.
//!
//! Payloads live in a host-shared memory region; what travels through the
//! device are fixed-size [`ShmDescriptor`]s referencing it. The transport
//! runs one receive/transmit virtqueue pair per vCPU, each drained by a
//! poll thread pinned to that vCPU, and steers received descriptors to
//! bound [`Socket`]s through an RCU-indexed registry.
//!
//! Everything process-wide lives in an explicit [`TransportContext`]
//! constructed from the probed device:
//!
//! ```ignore
//! let ctx = TransportContext::new(dev, TransportConfig { local_addr, vcpus })?;
//! let mut sock = ctx.open_socket(SocketType::Connless);
//! sock.bind(5000)?;
//! let (desc, _src) = sock.recv_desc()?;
//! ```

mod driver;
mod packet;
mod queue;
mod sched;
mod sock_queue;
mod socket;
#[cfg(test)]
mod testing;

pub use driver::ProbeError;
pub use packet::Endpoint;
pub use packet::Header;
pub use packet::Packet;
pub use packet::ShmDescriptor;
pub use packet::SocketType;
pub use queue::DevStats;
pub use socket::Socket;
pub use socket::SocketId;
pub use socket::EPHEMERAL_PORT_FIRST;

use socket::SocketTable;
use std::sync::Arc;
use thiserror::Error;
use virtio::VirtioDevice;

/// Errors returned by the socket operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("local port is already in use")]
    AddrInUse,
    #[error("no ephemeral port available")]
    PortsExhausted,
    #[error("socket is not bound to a local port")]
    NotBound,
    #[error("transmit resources exhausted")]
    QueueFull,
    #[error("device rejected the buffer")]
    Device(#[from] virtio::RingFull),
    #[error("operation not implemented")]
    Unsupported,
}

/// Static parameters of the transport.
#[derive(Debug, Copy, Clone)]
pub struct TransportConfig {
    /// This VM's address within the shared-memory fabric, as assigned by
    /// the host.
    pub local_addr: u32,
    /// Number of vCPUs, one virtqueue pair each.
    pub vcpus: usize,
}

/// Process-wide transport state: the driver, the socket registry, and the
/// local address. Constructed once when the device is probed; sockets keep
/// it alive.
pub struct TransportContext {
    pub(crate) driver: driver::Driver,
    pub(crate) sockets: Arc<SocketTable>,
    pub(crate) local_addr: u32,
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext").finish_non_exhaustive()
    }
}

impl TransportContext {
    /// Probes `dev` and brings up the transport.
    pub fn new(
        dev: Arc<dyn VirtioDevice>,
        config: TransportConfig,
    ) -> Result<Arc<Self>, ProbeError> {
        let sockets = Arc::new(SocketTable::new());
        let driver = driver::Driver::probe(dev, config.vcpus, sockets.clone())?;
        Ok(Arc::new(Self {
            driver,
            sockets,
            local_addr: config.local_addr,
        }))
    }

    /// Opens an unbound socket of the given type.
    pub fn open_socket(self: &Arc<Self>, sock_type: SocketType) -> Socket {
        Socket::open(self.clone(), sock_type)
    }

    /// Statistics summed over all queues.
    pub fn dev_stats(&self) -> DevStats {
        self.driver.stats()
    }

    /// Statistics of one queue.
    pub fn queue_stats(&self, queue: usize) -> Result<DevStats, Error> {
        self.driver.queue_stats(queue)
    }

    /// Number of per-vCPU transport queues.
    pub fn num_queues(&self) -> usize {
        self.driver.num_queues()
    }
}
