// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Socket identity, binding, ephemeral port assignment, and the registry
//! that steers received descriptors to their owning socket.
//!
//! The registry is read on every received packet by the poll threads, so
//! lookups run lock-free under an epoch guard against a copy-on-write map;
//! all mutation serializes on a single owner mutex and retires displaced
//! maps through the epoch domain, so a socket removed from the registry is
//! never reclaimed under a concurrent reader.

use crate::packet::Endpoint;
use crate::packet::Header;
use crate::packet::Packet;
use crate::packet::ShmDescriptor;
use crate::packet::SocketType;
use crate::sock_queue::SockQueue;
use crate::Error;
use crate::TransportContext;
use crossbeam_epoch as epoch;
use crossbeam_epoch::Atomic;
use crossbeam_epoch::Owned;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// First port of the ephemeral range; assignment starts here after boot.
pub const EPHEMERAL_PORT_FIRST: u16 = 1024;
const EPHEMERAL_PORT_COUNT: u32 = (u16::MAX - EPHEMERAL_PORT_FIRST) as u32 + 1;

/// Identity of a socket: remote address/port (zero while unconnected),
/// local port (zero while unbound), and the socket flavor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SocketId {
    pub raddr: u32,
    pub rport: u16,
    pub lport: u16,
    pub sock_type: SocketType,
}

impl SocketId {
    fn unbound(sock_type: SocketType) -> Self {
        Self {
            raddr: 0,
            rport: 0,
            lport: 0,
            sock_type,
        }
    }

    fn hash_value(&self) -> u64 {
        fn field<T: Hash>(value: T) -> u64 {
            let mut hasher = DefaultHasher::new();
            value.hash(&mut hasher);
            hasher.finish()
        }
        field(self.raddr)
            ^ (field(self.rport) << 1)
            ^ (field(self.lport) << 2)
            ^ (field(self.sock_type as u32) << 3)
    }
}

impl Hash for SocketId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

/// The part of a socket shared with the poll threads through the registry.
pub(crate) struct SocketShared {
    pub rx: SockQueue,
}

type SocketMap = HashMap<SocketId, Arc<SocketShared>>;

/// Why a received packet could not be delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DispatchError {
    /// No registered socket matches the packet's addressing.
    NoSocket,
    /// The owning socket's receive queue is saturated.
    QueueFull,
}

struct OwnerState {
    last_assigned_port: u16,
}

/// Process-wide socket registry.
pub(crate) struct SocketTable {
    map: Atomic<SocketMap>,
    owner: Mutex<OwnerState>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self {
            map: Atomic::new(SocketMap::new()),
            owner: Mutex::new(OwnerState {
                last_assigned_port: EPHEMERAL_PORT_FIRST - 1,
            }),
        }
    }

    /// Reader-side lookup, used by the poll threads.
    fn lookup(&self, id: &SocketId) -> Option<Arc<SocketShared>> {
        let guard = epoch::pin();
        // SAFETY: the map pointer is never null and stays alive for the
        // duration of the pinned section.
        let map = unsafe { self.map.load(Ordering::Acquire, &guard).deref() };
        map.get(id).cloned()
    }

    /// Owner-side probe. Callers hold the owner mutex, so the result is
    /// exact, not advisory.
    fn owner_contains(&self, id: &SocketId) -> bool {
        let guard = epoch::pin();
        // SAFETY: as in `lookup`.
        unsafe { self.map.load(Ordering::Acquire, &guard).deref() }.contains_key(id)
    }

    /// Publishes a mutated copy of the map. Callers hold the owner mutex.
    fn commit(&self, mutate: impl FnOnce(&mut SocketMap)) {
        let guard = epoch::pin();
        let current = self.map.load(Ordering::Acquire, &guard);
        // SAFETY: as in `lookup`.
        let mut next = unsafe { current.deref() }.clone();
        mutate(&mut next);
        let old = self.map.swap(Owned::new(next), Ordering::AcqRel, &guard);
        // SAFETY: `old` is unlinked; readers that pinned earlier keep it
        // alive until their sections end.
        unsafe { guard.defer_destroy(old) };
    }

    pub fn bind(&self, id: SocketId, shared: &Arc<SocketShared>) -> Result<(), Error> {
        let _owner = self.owner.lock();
        if self.owner_contains(&id) {
            return Err(Error::AddrInUse);
        }
        self.commit(|map| {
            map.insert(id, shared.clone());
        });
        Ok(())
    }

    /// Assigns and registers an ephemeral local port for `base`.
    ///
    /// Walks the ephemeral range once starting after the last assignment,
    /// wrapping from 65535 back to the start of the range.
    pub fn assign_local_port(
        &self,
        base: SocketId,
        shared: &Arc<SocketShared>,
    ) -> Result<u16, Error> {
        let mut owner = self.owner.lock();
        for _ in 0..EPHEMERAL_PORT_COUNT {
            let port = if owner.last_assigned_port == u16::MAX {
                EPHEMERAL_PORT_FIRST
            } else {
                owner.last_assigned_port + 1
            };
            owner.last_assigned_port = port;
            let id = SocketId { lport: port, ..base };
            if !self.owner_contains(&id) {
                self.commit(|map| {
                    map.insert(id, shared.clone());
                });
                return Ok(port);
            }
        }
        Err(Error::PortsExhausted)
    }

    pub fn remove(&self, id: &SocketId) {
        let _owner = self.owner.lock();
        self.commit(|map| {
            map.remove(id);
        });
    }

    /// Steers a received packet to its socket. Runs on the poll threads.
    pub fn dispatch(&self, pkt: &Packet) -> Result<(), DispatchError> {
        let hdr = &pkt.hdr;
        let Some(sock_type) = hdr.sock_type() else {
            return Err(DispatchError::NoSocket);
        };
        let connected = SocketId {
            raddr: hdr.saddr.get(),
            rport: hdr.sport.get(),
            lport: hdr.dport.get(),
            sock_type,
        };
        let local = SocketId {
            lport: hdr.dport.get(),
            ..SocketId::unbound(sock_type)
        };
        let shared = self
            .lookup(&connected)
            .or_else(|| self.lookup(&local))
            .ok_or(DispatchError::NoSocket)?;
        shared
            .rx
            .produce(pkt.desc)
            .map_err(|_| DispatchError::QueueFull)
    }

    #[cfg(test)]
    pub fn set_last_assigned_port(&self, port: u16) {
        self.owner.lock().last_assigned_port = port;
    }

    #[cfg(test)]
    pub fn fill_ports(&self, ports: impl Iterator<Item = u16>, sock_type: SocketType) {
        let shared = Arc::new(SocketShared {
            rx: SockQueue::new(),
        });
        let _owner = self.owner.lock();
        self.commit(|map| {
            for port in ports {
                let id = SocketId {
                    lport: port,
                    ..SocketId::unbound(sock_type)
                };
                map.insert(id, shared.clone());
            }
        });
    }
}

impl Drop for SocketTable {
    fn drop(&mut self) {
        // SAFETY: exclusive access; there are no readers left.
        unsafe {
            let map = self.map.swap(
                crossbeam_epoch::Shared::null(),
                Ordering::AcqRel,
                epoch::unprotected(),
            );
            drop(map.into_owned());
        }
    }
}

/// A datagram endpoint exchanging shared-memory descriptors with
/// co-resident VMs.
///
/// Not cloneable: the handle is the single consumer of the socket's
/// receive queue. Closing (or dropping) a bound socket removes it from the
/// registry.
pub struct Socket {
    ctx: Arc<TransportContext>,
    shared: Arc<SocketShared>,
    id: SocketId,
}

impl Socket {
    pub(crate) fn open(ctx: Arc<TransportContext>, sock_type: SocketType) -> Self {
        Self {
            ctx,
            shared: Arc::new(SocketShared {
                rx: SockQueue::new(),
            }),
            id: SocketId::unbound(sock_type),
        }
    }

    /// The local port, if the socket is bound.
    pub fn local_port(&self) -> Option<u16> {
        (self.id.lport != 0).then_some(self.id.lport)
    }

    /// Binds the socket to `port` and registers it.
    pub fn bind(&mut self, port: u16) -> Result<(), Error> {
        if port == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.id.lport != 0 {
            return Err(Error::AlreadyBound);
        }
        let id = SocketId {
            lport: port,
            ..self.id
        };
        self.ctx.sockets.bind(id, &self.shared)?;
        self.id = id;
        Ok(())
    }

    pub fn listen(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    pub fn accept(&mut self) -> Result<Socket, Error> {
        Err(Error::Unsupported)
    }

    pub fn connect(&mut self, _dst: Endpoint) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Sends `desc` to `dst`, assigning an ephemeral local port on first
    /// use if the socket is unbound.
    pub fn xmit_desc(&mut self, desc: ShmDescriptor, dst: Endpoint) -> Result<(), Error> {
        if self.id.lport == 0 {
            match self.ctx.sockets.assign_local_port(self.id, &self.shared) {
                Ok(port) => self.id.lport = port,
                Err(err) => {
                    tracing::warn!("could not find an available local port");
                    return Err(err);
                }
            }
        }
        let pkt = Packet {
            desc,
            hdr: Header::new(
                self.ctx.local_addr,
                dst.addr,
                self.id.lport,
                dst.port,
                self.id.sock_type,
            ),
        };
        self.ctx.driver.xmit_pkt(&pkt)
    }

    /// Receives the next descriptor, blocking while the queue is empty.
    ///
    /// The source endpoint is not yet carried on the receive ring and is
    /// reported as unspecified.
    pub fn recv_desc(&mut self) -> Result<(ShmDescriptor, Endpoint), Error> {
        if self.id.lport == 0 {
            return Err(Error::NotBound);
        }
        Ok((self.shared.rx.consume(), Endpoint::default()))
    }

    /// Closes the socket, deregistering it if bound.
    pub fn close(self) {}
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.id.lport != 0 {
            self.ctx.sockets.remove(&self.id);
        }
    }
}
