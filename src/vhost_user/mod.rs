// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The protocol for vhost-user is based on the existing implementation of
//! vhost for the Linux Kernel. The protocol defines two sides of the
//! communication, master and slave. Master is the application that shares
//! its virtqueues, here a virtio-user network front-end. Slave is the
//! consumer of the virtqueues, typically a software switch.
//!
//! The master either connects to the slave's socket (client mode) or listens
//! on a socket and waits for the slave to connect (server mode). Requests flow
//! from the master to the slave; only GET_FEATURES and GET_VRING_BASE are
//! answered with a reply.
//!
//! Unix domain socket is used as the underlying communication channel because
//! the master needs to send file descriptors to the slave: one per shared
//! hugepage file for SET_MEM_TABLE, and eventfds for the vring kick, call and
//! error notifications.

pub mod message;

mod connection;
mod hugepage;

pub use self::connection::{Channel, ChannelConfig, Endpoint, VhostUserReply};
pub use self::hugepage::{scan_hugepage_files, HugepageFile, HugepageSource, ProcSelfMaps};

use crate::backend::Error as BackendError;

#[cfg(feature = "vhost-user-master")]
mod master;
#[cfg(feature = "vhost-user-master")]
pub use self::master::{Frontend, Master, RequestArg, VhostUserMaster};

/// Error codes for vhost-user protocol
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure in socket read/write operations
    #[error("socket error: {0}")]
    SocketError(#[source] std::io::Error),
    /// Failure when creating the socket
    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),
    /// Failure when connecting to the slave
    #[error("failed to connect socket: {0}")]
    SocketConnect(#[source] std::io::Error),
    /// Failure when binding the listening socket
    #[error("failed to bind socket, remove it and try again: {0}")]
    SocketBind(#[source] std::io::Error),
    /// Failure when listening or switching the listener to non-blocking mode
    #[error("failed to listen on socket: {0}")]
    SocketListen(#[source] std::io::Error),
    /// Server mode channel without a connected slave
    #[error("no slave connected to the channel")]
    NotConnected,
    /// Fd array in question is too big
    #[error("too many file descriptors attached to a message")]
    FdArrayCapacity,
    /// Message is too large
    #[error("declared payload size {0} exceeds the maximum payload size")]
    OversizedMsg(u32),
    /// Only part of a message have been sent or received successfully
    #[error("partial message")]
    PartialMessage,
    /// Invalid message format or flags
    #[error("invalid message format or flags")]
    InvalidMessage,
    /// Reply does not answer the request that was sent
    #[error("unexpected reply code {0}")]
    UnexpectedReply(u32),
    /// Reply payload size does not match the expected layout
    #[error("reply payload size {0} does not match the expected size")]
    InvalidReplySize(u32),
    /// Request code the front-end does not know how to build
    #[error("unsupported request code {0}")]
    UnsupportedRequest(u32),
    /// Some parameters is invalid
    #[error("invalid parameter")]
    InvalidParam,
    /// The memory mapping table could not be opened
    #[error("cannot open the memory mapping table: {0}")]
    HugepageMapsOpen(#[source] std::io::Error),
    /// The memory mapping table could not be read
    #[error("cannot read the memory mapping table: {0}")]
    HugepageMapsRead(#[source] std::io::Error),
    /// A memory mapping line without an address range
    #[error("failed to parse address in mapping line: {0}")]
    HugepageMapsParse(String),
    /// More hugepage files than memory regions
    #[error("exceed maximum of {0} hugepage files")]
    TooManyHugepageFiles(usize),
    /// A hugepage file could not be opened for sharing
    #[error("cannot open hugepage file {0}: {1}")]
    HugepageOpen(String, #[source] std::io::Error),
}

impl std::convert::From<vmm_sys_util::errno::Error> for Error {
    fn from(err: vmm_sys_util::errno::Error) -> Self {
        Error::SocketError(std::io::Error::from_raw_os_error(err.errno()))
    }
}

impl std::convert::From<Error> for BackendError {
    fn from(err: Error) -> BackendError {
        BackendError::VhostUserProtocol(err)
    }
}

/// Result of vhost-user operations
pub type Result<T> = std::result::Result<T, Error>;
