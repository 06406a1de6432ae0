// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-fixed descriptor and packet layouts shared with the co-resident
//! peer VMs. The byte layout here is the protocol; both sides map these
//! structs straight onto the frames exchanged through the device.

use virtio::spec::u16_le;
use virtio::spec::u32_le;
use virtio::spec::u64_le;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Socket flavor, serialized as a 32-bit tag in the packet header.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SocketType {
    Connected = 0,
    Connless = 1,
}

impl SocketType {
    pub(crate) fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Connected),
            1 => Some(Self::Connless),
            _ => None,
        }
    }
}

/// A reference into the shared memory region mapped by every co-resident
/// VM. Opaque to the transport; copied verbatim end to end.
#[repr(C)]
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes,
)]
pub struct ShmDescriptor {
    pub addr: u64_le,
    pub len: u64_le,
}

impl ShmDescriptor {
    pub fn new(addr: u64, len: u64) -> Self {
        Self {
            addr: addr.into(),
            len: len.into(),
        }
    }
}

/// Addressing header carried with every descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Header {
    pub saddr: u32_le,
    pub daddr: u32_le,
    pub sport: u16_le,
    pub dport: u16_le,
    sock_type_raw: u32_le,
}

impl Header {
    pub fn new(saddr: u32, daddr: u32, sport: u16, dport: u16, sock_type: SocketType) -> Self {
        Self {
            saddr: saddr.into(),
            daddr: daddr.into(),
            sport: sport.into(),
            dport: dport.into(),
            sock_type_raw: (sock_type as u32).into(),
        }
    }

    pub fn sock_type(&self) -> Option<SocketType> {
        SocketType::from_wire(self.sock_type_raw.get())
    }
}

/// The unit carried by the transport: a shared-memory descriptor plus its
/// addressing header. The header sits after the descriptor so the 64-bit
/// descriptor fields stay naturally aligned.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Packet {
    pub desc: ShmDescriptor,
    pub hdr: Header,
}

impl Packet {
    /// On-wire size, used to validate received frame lengths.
    pub const SIZE: usize = size_of::<Packet>();
}

const _: () = assert!(Packet::SIZE == 32);

/// A remote (or local) address/port pair.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: u32,
    pub port: u16,
}
