// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants and layouts defined by the virtio network device spec.

pub use packed_nums::*;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// Network device feature bits consumed by the shm exchange driver.
pub const VIRTIO_NET_F_CTRL_VQ: u64 = 1 << 17;
pub const VIRTIO_NET_F_MQ: u64 = 1 << 22;

// Device status bits.
pub const VIRTIO_CONFIG_S_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_CONFIG_S_DRIVER: u8 = 2;
pub const VIRTIO_CONFIG_S_DRIVER_OK: u8 = 4;
pub const VIRTIO_CONFIG_S_FEATURES_OK: u8 = 8;
pub const VIRTIO_CONFIG_S_FAILED: u8 = 0x80;

// Control virtqueue ack values.
pub const VIRTIO_NET_OK: u8 = 0;
pub const VIRTIO_NET_ERR: u8 = 1;

// Control command classes and commands.
pub const VIRTIO_NET_CTRL_MQ: u8 = 4;
pub const VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET: u8 = 0;

/// Multi-queue enable command sent on the control ring.
///
/// The first [`NetCtrlMq::OUT_LEN`] bytes are device-readable; `ack` is
/// device-writable.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NetCtrlMq {
    pub cmd_class: u8,
    pub command: u8,
    pub virtqueue_pairs: u16_le,
    pub ack: u8,
}

impl NetCtrlMq {
    /// Length of the device-readable prefix.
    pub const OUT_LEN: u32 = 4;
    /// Offset of the device-writable `ack` byte.
    pub const ACK_OFFSET: u64 = 4;
}

/// Per-buffer header prepended to every frame exchanged with the device.
///
/// With no offload features negotiated the contents are ignored by both
/// sides; only its size matters for framing.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16_le,
    pub gso_size: u16_le,
    pub csum_start: u16_le,
    pub csum_offset: u16_le,
    pub num_buffers: u16_le,
}

/// Size of the net header on the wire.
///
/// Legacy devices that have not negotiated mergeable rx buffers (this
/// driver never does) omit the trailing `num_buffers` field.
pub const fn net_hdr_size(modern: bool) -> usize {
    if modern {
        size_of::<VirtioNetHdr>()
    } else {
        size_of::<VirtioNetHdr>() - size_of::<u16>()
    }
}

/// Network device configuration space.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: u16_le,
    pub max_virtqueue_pairs: u16_le,
    pub mtu: u16_le,
    pub speed: u32_le,
    pub duplex: u8,
    pub rss_max_key_size: u8,
    pub rss_max_indirection_table_length: u16_le,
    pub supported_hash_types: u32_le,
}

/// Config-space offset of [`NetConfig::max_virtqueue_pairs`].
pub const MAX_VIRTQUEUE_PAIRS_OFFSET: u16 = 8;

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn ctrl_mq_layout() {
        assert_eq!(size_of::<NetCtrlMq>(), 5);
        let cmd = NetCtrlMq {
            cmd_class: VIRTIO_NET_CTRL_MQ,
            command: VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET,
            virtqueue_pairs: 2.into(),
            ack: 0,
        };
        assert_eq!(&cmd.as_bytes()[..NetCtrlMq::OUT_LEN as usize], &[4, 0, 2, 0]);
    }

    #[test]
    fn net_hdr_sizes() {
        assert_eq!(net_hdr_size(true), 12);
        assert_eq!(net_hdr_size(false), 10);
    }

    #[test]
    fn net_config_layout() {
        assert_eq!(size_of::<NetConfig>(), 24);
        let mut cfg = NetConfig::new_zeroed();
        cfg.max_virtqueue_pairs = 4.into();
        let off = MAX_VIRTQUEUE_PAIRS_OFFSET as usize;
        assert_eq!(&cfg.as_bytes()[off..off + 2], &[4, 0]);
    }
}
