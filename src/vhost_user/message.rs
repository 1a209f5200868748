// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Define communication messages for the vhost-user protocol.
//!
//! Every message is a fixed 12-byte header followed by an optional payload whose shape is
//! selected by the request code. All integers are in the machine native byte order. Payloads
//! are encoded field by field instead of relying on the in-memory layout of the Rust types.

#![allow(non_camel_case_types)]

use std::convert::TryFrom;

use super::{Error, Result};

/// The version of the vhost-user protocol spoken by the front-end.
pub const VHOST_USER_VERSION: u32 = 0x1;

/// Maximum number of memory regions, and of file descriptors attached to a single message.
pub const MAX_ATTACHED_FD_ENTRIES: usize = 8;

/// Ring index bits of the u64 payload for SET_VRING_KICK/CALL/ERR.
pub const VHOST_USER_VRING_IDX_MASK: u64 = 0xff;

/// Set in the u64 payload for SET_VRING_KICK/CALL/ERR when no file descriptor is attached.
pub const VHOST_USER_VRING_NOFD_MASK: u64 = 0x1 << 8;

macro_rules! enum_value {
    (
        $(#[$meta:meta])*
        $vis:vis enum $enum:ident: $T:tt {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $val:expr,
            )*
        }
    ) => {
        #[repr($T)]
        $(#[$meta])*
        $vis enum $enum {
            $($(#[$variant_meta])* $variant = $val,)*
        }

        impl TryFrom<$T> for $enum {
            type Error = ();

            fn try_from(v: $T) -> std::result::Result<Self, Self::Error> {
                match v {
                    $(v if v == $enum::$variant as $T => Ok($enum::$variant),)*
                    _ => Err(()),
                }
            }
        }

        impl From<$enum> for $T {
            fn from(v: $enum) -> $T {
                v as $T
            }
        }
    }
}

enum_value! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    /// Type of requests sending from masters to slaves.
    pub enum MasterReq: u32 {
        /// Get from the underlying vhost implementation the features bit mask.
        GET_FEATURES = 1,
        /// Enable features in the underlying vhost implementation using a bit mask.
        SET_FEATURES = 2,
        /// Set the current Master as an owner of the session.
        SET_OWNER = 3,
        /// No longer used.
        RESET_OWNER = 4,
        /// Set the memory map regions on the slave so it can translate the vring addresses.
        SET_MEM_TABLE = 5,
        /// Set logging shared memory space.
        SET_LOG_BASE = 6,
        /// Set the logging file descriptor, which is passed as ancillary data.
        SET_LOG_FD = 7,
        /// Set the size of the queue.
        SET_VRING_NUM = 8,
        /// Set the addresses of the different aspects of the vring.
        SET_VRING_ADDR = 9,
        /// Set the base offset in the available vring.
        SET_VRING_BASE = 10,
        /// Get the available vring base offset.
        GET_VRING_BASE = 11,
        /// Set the event file descriptor for adding buffers to the vring.
        SET_VRING_KICK = 12,
        /// Set the event file descriptor to signal when buffers are used.
        SET_VRING_CALL = 13,
        /// Set the event file descriptor to signal when error occurs.
        SET_VRING_ERR = 14,
        /// Get the protocol feature bit mask from the underlying vhost implementation.
        GET_PROTOCOL_FEATURES = 15,
        /// Enable protocol features in the underlying vhost implementation.
        SET_PROTOCOL_FEATURES = 16,
        /// Query how many queues the backend supports.
        GET_QUEUE_NUM = 17,
        /// Signal slave to enable or disable corresponding vring.
        SET_VRING_ENABLE = 18,
        /// Ask vhost user backend to broadcast a fake RARP.
        SEND_RARP = 19,
        /// Set host MTU value exposed to the guest.
        NET_SET_MTU = 20,
        /// Set the socket file descriptor for slave initiated requests.
        SET_SLAVE_REQ_FD = 21,
        /// Send IOTLB messages with struct vhost_iotlb_msg as payload.
        IOTLB_MSG = 22,
        /// Set the endianness of a VQ for legacy devices.
        SET_VRING_ENDIAN = 23,
        /// Fetch the contents of the virtio device configuration space.
        GET_CONFIG = 24,
        /// Change the contents of the virtio device configuration space.
        SET_CONFIG = 25,
    }
}

impl MasterReq {
    /// Whether the slave answers this request with a reply message.
    pub fn needs_reply(self) -> bool {
        matches!(self, MasterReq::GET_FEATURES | MasterReq::GET_VRING_BASE)
    }
}

bitflags! {
    /// Common message flags for vhost-user requests and replies.
    pub struct VhostUserHeaderFlag: u32 {
        /// Bits[0..2] is message version number.
        const VERSION = 0x3;
        /// Mark message as reply.
        const REPLY = 0x4;
    }
}

/// Fixed-size payload layouts with an explicit wire encoding.
pub trait WireFormat: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the encoded bytes to `buf`.
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Decode from a buffer of exactly `SIZE` bytes.
    fn read_from(buf: &[u8]) -> Option<Self>;
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

/// Common message header for vhost-user requests and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserMsgHeader {
    request: u32,
    flags: u32,
    size: u32,
}

impl VhostUserMsgHeader {
    /// Create a request header carrying the supported protocol version.
    pub fn new(request: MasterReq, size: u32) -> Self {
        VhostUserMsgHeader {
            request: request.into(),
            flags: VHOST_USER_VERSION,
            size,
        }
    }

    /// Create a reply header for `request`, as a slave would send it.
    pub fn new_reply(request: MasterReq, size: u32) -> Self {
        VhostUserMsgHeader {
            request: request.into(),
            flags: VhostUserHeaderFlag::REPLY.bits() | VHOST_USER_VERSION,
            size,
        }
    }

    /// Build a header from raw field values.
    pub fn from_raw(request: u32, flags: u32, size: u32) -> Self {
        VhostUserMsgHeader {
            request,
            flags,
            size,
        }
    }

    /// Raw request code.
    pub fn request(&self) -> u32 {
        self.request
    }

    /// Request code, if it is one known to this implementation.
    pub fn get_code(&self) -> Option<MasterReq> {
        MasterReq::try_from(self.request).ok()
    }

    /// Raw flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Get message version number.
    pub fn get_version(&self) -> u32 {
        self.flags & VhostUserHeaderFlag::VERSION.bits()
    }

    /// Check whether it's a reply message.
    pub fn is_reply(&self) -> bool {
        (self.flags & VhostUserHeaderFlag::REPLY.bits()) != 0
    }

    /// A reply is accepted only when its flags are exactly REPLY plus the supported version.
    pub fn is_valid_reply(&self) -> bool {
        self.flags == VhostUserHeaderFlag::REPLY.bits() | VHOST_USER_VERSION
    }

    /// Declared payload size.
    pub fn get_size(&self) -> u32 {
        self.size
    }
}

impl WireFormat for VhostUserMsgHeader {
    const SIZE: usize = 12;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.request.to_ne_bytes());
        buf.extend_from_slice(&self.flags.to_ne_bytes());
        buf.extend_from_slice(&self.size.to_ne_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(VhostUserMsgHeader {
            request: u32_at(buf, 0),
            flags: u32_at(buf, 4),
            size: u32_at(buf, 8),
        })
    }
}

/// A generic message to encapsulate a 64-bit value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserU64 {
    /// The encapsulated 64-bit common value.
    pub value: u64,
}

impl VhostUserU64 {
    /// Create a new instance.
    pub fn new(value: u64) -> Self {
        VhostUserU64 { value }
    }
}

impl WireFormat for VhostUserU64 {
    const SIZE: usize = 8;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_ne_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(VhostUserU64::new(u64_at(buf, 0)))
    }
}

/// Vring state descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserVringState {
    /// Vring index.
    pub index: u32,
    /// A common 32bit value to encapsulate vring state etc.
    pub num: u32,
}

impl VhostUserVringState {
    /// Create a new instance.
    pub fn new(index: u32, num: u32) -> Self {
        VhostUserVringState { index, num }
    }
}

impl WireFormat for VhostUserVringState {
    const SIZE: usize = 8;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.index.to_ne_bytes());
        buf.extend_from_slice(&self.num.to_ne_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(VhostUserVringState::new(u32_at(buf, 0), u32_at(buf, 4)))
    }
}

bitflags! {
    /// Flags for vring address.
    pub struct VhostUserVringAddrFlags: u32 {
        /// Modifications to "used" vring should be logged.
        const VHOST_VRING_F_LOG = 0x1;
    }
}

/// Vring address descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserVringAddr {
    /// Vring index.
    pub index: u32,
    /// Vring flags defined by VhostUserVringAddrFlags.
    pub flags: u32,
    /// Ring address of the vring descriptor table.
    pub descriptor: u64,
    /// Ring address of the vring used ring.
    pub used: u64,
    /// Ring address of the vring available ring.
    pub available: u64,
    /// Guest address for logging.
    pub log: u64,
}

impl VhostUserVringAddr {
    /// Create a new instance.
    pub fn new(
        index: u32,
        flags: VhostUserVringAddrFlags,
        descriptor: u64,
        used: u64,
        available: u64,
        log: u64,
    ) -> Self {
        VhostUserVringAddr {
            index,
            flags: flags.bits(),
            descriptor,
            used,
            available,
            log,
        }
    }

    /// Create a new instance from `VringConfigData`.
    pub fn from_config_data(index: u32, config_data: &crate::backend::VringConfigData) -> Self {
        VhostUserVringAddr {
            index,
            flags: config_data.flags,
            descriptor: config_data.desc_table_addr,
            used: config_data.used_ring_addr,
            available: config_data.avail_ring_addr,
            log: config_data.log_addr.unwrap_or(0),
        }
    }
}

impl WireFormat for VhostUserVringAddr {
    const SIZE: usize = 40;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.index.to_ne_bytes());
        buf.extend_from_slice(&self.flags.to_ne_bytes());
        buf.extend_from_slice(&self.descriptor.to_ne_bytes());
        buf.extend_from_slice(&self.used.to_ne_bytes());
        buf.extend_from_slice(&self.available.to_ne_bytes());
        buf.extend_from_slice(&self.log.to_ne_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(VhostUserVringAddr {
            index: u32_at(buf, 0),
            flags: u32_at(buf, 4),
            descriptor: u64_at(buf, 8),
            used: u64_at(buf, 16),
            available: u64_at(buf, 24),
            log: u64_at(buf, 32),
        })
    }
}

/// Memory region descriptors as payload for the SET_MEM_TABLE request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserMemoryRegion {
    /// Guest physical address of the memory region.
    pub guest_phys_addr: u64,
    /// Size of the memory region.
    pub memory_size: u64,
    /// Virtual address in the current process.
    pub user_addr: u64,
    /// Offset where region starts in the mapped memory.
    pub mmap_offset: u64,
}

impl VhostUserMemoryRegion {
    /// Create a new instance.
    pub fn new(guest_phys_addr: u64, memory_size: u64, user_addr: u64, mmap_offset: u64) -> Self {
        VhostUserMemoryRegion {
            guest_phys_addr,
            memory_size,
            user_addr,
            mmap_offset,
        }
    }
}

impl WireFormat for VhostUserMemoryRegion {
    const SIZE: usize = 32;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.guest_phys_addr.to_ne_bytes());
        buf.extend_from_slice(&self.memory_size.to_ne_bytes());
        buf.extend_from_slice(&self.user_addr.to_ne_bytes());
        buf.extend_from_slice(&self.mmap_offset.to_ne_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(VhostUserMemoryRegion {
            guest_phys_addr: u64_at(buf, 0),
            memory_size: u64_at(buf, 8),
            user_addr: u64_at(buf, 16),
            mmap_offset: u64_at(buf, 24),
        })
    }
}

/// Region count plus padding preceding the region array of a memory table.
pub const VHOST_USER_MEMORY_HDR_SIZE: usize = 8;

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Size of the largest payload variant, a memory table with every region slot in use.
pub const MAX_PAYLOAD_SIZE: usize = max(
    max(VhostUserU64::SIZE, VhostUserVringState::SIZE),
    max(
        VhostUserVringAddr::SIZE,
        VHOST_USER_MEMORY_HDR_SIZE + MAX_ATTACHED_FD_ENTRIES * VhostUserMemoryRegion::SIZE,
    ),
);

/// Message payload, one variant per layout used by the supported requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VhostUserPayload {
    /// No payload.
    Empty,
    /// A 64-bit scalar.
    U64(VhostUserU64),
    /// Vring index and value.
    VringState(VhostUserVringState),
    /// Vring address descriptor.
    VringAddr(VhostUserVringAddr),
    /// Memory table with at most `MAX_ATTACHED_FD_ENTRIES` regions.
    Memory(Vec<VhostUserMemoryRegion>),
}

impl VhostUserPayload {
    /// Encoded size of the payload in bytes.
    pub fn size(&self) -> usize {
        match self {
            VhostUserPayload::Empty => 0,
            VhostUserPayload::U64(_) => VhostUserU64::SIZE,
            VhostUserPayload::VringState(_) => VhostUserVringState::SIZE,
            VhostUserPayload::VringAddr(_) => VhostUserVringAddr::SIZE,
            VhostUserPayload::Memory(regions) => {
                VHOST_USER_MEMORY_HDR_SIZE + regions.len() * VhostUserMemoryRegion::SIZE
            }
        }
    }

    /// Append the encoded payload to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            VhostUserPayload::Empty => {}
            VhostUserPayload::U64(v) => v.write_to(buf),
            VhostUserPayload::VringState(s) => s.write_to(buf),
            VhostUserPayload::VringAddr(a) => a.write_to(buf),
            VhostUserPayload::Memory(regions) => {
                buf.extend_from_slice(&(regions.len() as u32).to_ne_bytes());
                buf.extend_from_slice(&0u32.to_ne_bytes());
                for region in regions {
                    region.write_to(buf);
                }
            }
        }
    }

    /// Decode the payload of a `request` message.
    ///
    /// # Return:
    /// * - the decoded payload on success.
    /// * - UnsupportedRequest: no payload layout is known for the request.
    /// * - InvalidMessage: the buffer length does not fit the request's layout.
    pub fn decode(request: MasterReq, buf: &[u8]) -> Result<Self> {
        let payload = match request {
            MasterReq::SET_OWNER | MasterReq::RESET_OWNER | MasterReq::SET_LOG_FD => {
                if buf.is_empty() {
                    Some(VhostUserPayload::Empty)
                } else {
                    None
                }
            }
            MasterReq::GET_FEATURES if buf.is_empty() => Some(VhostUserPayload::Empty),
            MasterReq::GET_FEATURES
            | MasterReq::SET_FEATURES
            | MasterReq::SET_LOG_BASE
            | MasterReq::SET_VRING_KICK
            | MasterReq::SET_VRING_CALL
            | MasterReq::SET_VRING_ERR => VhostUserU64::read_from(buf).map(VhostUserPayload::U64),
            MasterReq::SET_VRING_NUM
            | MasterReq::SET_VRING_BASE
            | MasterReq::GET_VRING_BASE
            | MasterReq::SET_VRING_ENABLE => {
                VhostUserVringState::read_from(buf).map(VhostUserPayload::VringState)
            }
            MasterReq::SET_VRING_ADDR => {
                VhostUserVringAddr::read_from(buf).map(VhostUserPayload::VringAddr)
            }
            MasterReq::SET_MEM_TABLE => Self::decode_memory(buf),
            _ => return Err(Error::UnsupportedRequest(request.into())),
        };
        payload.ok_or(Error::InvalidMessage)
    }

    fn decode_memory(buf: &[u8]) -> Option<Self> {
        if buf.len() < VHOST_USER_MEMORY_HDR_SIZE {
            return None;
        }
        let count = u32_at(buf, 0) as usize;
        if count > MAX_ATTACHED_FD_ENTRIES
            || u32_at(buf, 4) != 0
            || buf.len() != VHOST_USER_MEMORY_HDR_SIZE + count * VhostUserMemoryRegion::SIZE
        {
            return None;
        }
        buf[VHOST_USER_MEMORY_HDR_SIZE..]
            .chunks(VhostUserMemoryRegion::SIZE)
            .map(VhostUserMemoryRegion::read_from)
            .collect::<Option<Vec<_>>>()
            .map(VhostUserPayload::Memory)
    }
}

/// A complete vhost-user message, header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostUserMsg {
    hdr: VhostUserMsgHeader,
    payload: VhostUserPayload,
}

impl VhostUserMsg {
    /// Create a request whose header size matches the payload's encoded size.
    pub fn new(request: MasterReq, payload: VhostUserPayload) -> Self {
        let hdr = VhostUserMsgHeader::new(request, payload.size() as u32);
        VhostUserMsg { hdr, payload }
    }

    /// Create a reply message, as a slave would send it.
    pub fn new_reply(request: MasterReq, payload: VhostUserPayload) -> Self {
        let hdr = VhostUserMsgHeader::new_reply(request, payload.size() as u32);
        VhostUserMsg { hdr, payload }
    }

    /// Message header.
    pub fn header(&self) -> &VhostUserMsgHeader {
        &self.hdr
    }

    /// Message payload.
    pub fn payload(&self) -> &VhostUserPayload {
        &self.payload
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VhostUserMsgHeader::SIZE + self.payload.size());
        self.hdr.write_to(&mut buf);
        self.payload.write_to(&mut buf);
        buf
    }
}
