// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Structs for the Unix domain socket channel and the message endpoint on top of it.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use libc::{c_void, iovec};
use log::{debug, error, warn};
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

use super::message::*;
use super::{Error, Result};

/// Pending connections allowed on the listening socket in server mode.
const MAX_VIRTIO_USER_BACKLOG: libc::c_int = 1;

/// Where the channel lives and which side of the socket the front-end takes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Filesystem path of the Unix domain socket.
    pub path: PathBuf,
    /// Listen on `path` and wait for the slave instead of connecting to it.
    pub server: bool,
}

impl ChannelConfig {
    /// Configuration for a front-end connecting to the slave at `path`.
    pub fn client<P: AsRef<Path>>(path: P) -> Self {
        ChannelConfig {
            path: path.as_ref().to_path_buf(),
            server: false,
        }
    }

    /// Configuration for a front-end listening on `path`.
    pub fn server<P: AsRef<Path>>(path: P) -> Self {
        ChannelConfig {
            path: path.as_ref().to_path_buf(),
            server: true,
        }
    }
}

/// A reply received from the slave, with any descriptors the slave attached.
#[derive(Debug)]
pub struct VhostUserReply {
    /// Reply header, already checked for the reply flag and protocol version.
    pub hdr: VhostUserMsgHeader,
    /// Raw payload bytes, exactly `hdr.get_size()` long.
    pub payload: Vec<u8>,
    /// Descriptors received with the reply. They are closed when dropped.
    pub files: Vec<File>,
}

/// Unix domain socket endpoint for vhost-user connection.
pub struct Endpoint {
    sock: UnixStream,
}

impl Endpoint {
    /// Create an endpoint from a stream object.
    pub fn from_stream(sock: UnixStream) -> Self {
        Endpoint { sock }
    }

    /// Send a message as a single unit with optional attached file descriptors.
    ///
    /// Interrupted sends are retried. A short write is completed with further sends that
    /// carry no descriptors, so the peer sees them with the start of the message.
    ///
    /// # Return:
    /// * - () on success.
    /// * - FdArrayCapacity: more than MAX_ATTACHED_FD_ENTRIES descriptors.
    /// * - PartialMessage: the socket stopped accepting data mid-message.
    /// * - SocketError: other socket related errors.
    pub fn send_message(&mut self, msg: &VhostUserMsg, fds: &[RawFd]) -> Result<()> {
        if fds.len() > MAX_ATTACHED_FD_ENTRIES {
            return Err(Error::FdArrayCapacity);
        }
        let buf = msg.to_bytes();
        self.send_all(&buf, fds)
    }

    fn send_all(&mut self, buf: &[u8], fds: &[RawFd]) -> Result<()> {
        let mut sent = 0;
        let mut fds = fds;
        while sent < buf.len() {
            match self.sock.send_with_fds(&[&buf[sent..]], fds) {
                Ok(0) => return Err(Error::PartialMessage),
                Ok(bytes) => {
                    sent += bytes;
                    fds = &[];
                }
                Err(e) if e.errno() == libc::EINTR => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fill `buf` completely, keeping any descriptors that arrive on the way.
    fn recv_exact(&mut self, buf: &mut [u8], files: &mut Vec<File>) -> Result<()> {
        let mut received = 0;
        while received < buf.len() {
            let rest = &mut buf[received..];
            let mut iovs = [iovec {
                iov_base: rest.as_mut_ptr() as *mut c_void,
                iov_len: rest.len(),
            }];
            let mut fds = [-1 as RawFd; MAX_ATTACHED_FD_ENTRIES];
            // Safe because the iovec covers `rest`, which outlives the call, and the
            // descriptor array is large enough for MAX_ATTACHED_FD_ENTRIES entries.
            let res = unsafe { self.sock.recv_with_fds(&mut iovs, &mut fds) };
            match res {
                Ok((bytes, nfds)) => {
                    for fd in fds.iter().take(nfds) {
                        // Safe because the kernel just installed these descriptors for us.
                        files.push(unsafe { File::from_raw_fd(*fd) });
                    }
                    if bytes == 0 {
                        return Err(Error::PartialMessage);
                    }
                    received += bytes;
                }
                Err(e) if e.errno() == libc::EINTR => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Receive a reply message.
    ///
    /// The header is read first and validated before any payload bytes are consumed.
    /// After a failure the stream position is unknown and the channel should be closed.
    ///
    /// # Return:
    /// * - the reply on success.
    /// * - PartialMessage: the peer closed the socket mid-message.
    /// * - InvalidMessage: the flags are not exactly REPLY plus the supported version.
    /// * - OversizedMsg: the declared size exceeds MAX_PAYLOAD_SIZE.
    /// * - SocketError: other socket related errors.
    pub fn recv_reply(&mut self) -> Result<VhostUserReply> {
        let mut files = Vec::new();
        let mut hdr_buf = [0u8; VhostUserMsgHeader::SIZE];
        self.recv_exact(&mut hdr_buf, &mut files).map_err(|e| {
            error!("Failed to recv msg hdr: {}", e);
            e
        })?;
        let hdr = VhostUserMsgHeader::read_from(&hdr_buf).ok_or(Error::InvalidMessage)?;

        if !hdr.is_valid_reply() {
            error!(
                "Failed to recv msg: flags {:x} instead of {:x}",
                hdr.flags(),
                VhostUserHeaderFlag::REPLY.bits() | VHOST_USER_VERSION
            );
            return Err(Error::InvalidMessage);
        }

        let size = hdr.get_size();
        if size as usize > MAX_PAYLOAD_SIZE {
            error!("Failed to recv msg: payload size {} is too large", size);
            return Err(Error::OversizedMsg(size));
        }

        let mut payload = vec![0u8; size as usize];
        if size != 0 {
            self.recv_exact(&mut payload, &mut files).map_err(|e| {
                error!("Failed to recv msg payload of {} bytes: {}", size, e);
                e
            })?;
        }
        if !files.is_empty() {
            warn!("Closing {} unexpected fds attached to reply", files.len());
        }

        Ok(VhostUserReply {
            hdr,
            payload,
            files,
        })
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

fn new_socket() -> Result<OwnedFd> {
    // Safe because no pointers are involved and the return value is checked.
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::SocketCreate(io::Error::last_os_error()));
    }
    // Safe because `fd` is a freshly created descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_un(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    // Safe because sockaddr_un is plain old data and all-zeroes is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = OsStr::as_bytes(path.as_os_str());
    // Keep room for the terminating nul.
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(Error::InvalidParam);
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    Ok((addr, mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
}

/// The vhost-user channel of one front-end device.
///
/// In client mode the channel is connected as soon as it is set up. In server mode it only
/// holds a non-blocking listener until `accept` adopts the slave's connection.
pub struct Channel {
    path: PathBuf,
    listener: Option<UnixListener>,
    endpoint: Option<Endpoint>,
}

impl Channel {
    /// Set up the channel described by `config`.
    ///
    /// # Return:
    /// * - the new Channel on success.
    /// * - InvalidParam: the path does not fit in a socket address.
    /// * - SocketCreate: failed to create the socket.
    /// * - SocketConnect: failed to connect to the slave (client mode).
    /// * - SocketBind/SocketListen: failed to start listening (server mode).
    pub fn setup(config: &ChannelConfig) -> Result<Self> {
        let (addr, addr_len) = sockaddr_un(&config.path)?;
        let fd = new_socket().map_err(|e| {
            error!("socket() error, {}", e);
            e
        })?;
        let addr_ptr = &addr as *const libc::sockaddr_un as *const libc::sockaddr;

        if config.server {
            // Safe because `addr` is a valid sockaddr_un of `addr_len` bytes.
            if unsafe { libc::bind(fd.as_raw_fd(), addr_ptr, addr_len) } < 0 {
                let err = io::Error::last_os_error();
                error!(
                    "failed to bind to {}: {}; remove it and try again",
                    config.path.display(),
                    err
                );
                return Err(Error::SocketBind(err));
            }
            // Safe because the descriptor is a valid bound socket.
            if unsafe { libc::listen(fd.as_raw_fd(), MAX_VIRTIO_USER_BACKLOG) } < 0 {
                let err = io::Error::last_os_error();
                error!("virtio-user startup fails in server mode: {}", err);
                return Err(Error::SocketListen(err));
            }
            let listener = UnixListener::from(fd);
            listener.set_nonblocking(true).map_err(|e| {
                error!("failed to set listener non-blocking: {}", e);
                Error::SocketListen(e)
            })?;
            debug!("listening on {}", config.path.display());

            Ok(Channel {
                path: config.path.clone(),
                listener: Some(listener),
                endpoint: None,
            })
        } else {
            // Safe because `addr` is a valid sockaddr_un of `addr_len` bytes.
            if unsafe { libc::connect(fd.as_raw_fd(), addr_ptr, addr_len) } < 0 {
                let err = io::Error::last_os_error();
                error!("connect error, {}", err);
                return Err(Error::SocketConnect(err));
            }
            debug!("connected to {}", config.path.display());

            Ok(Channel {
                path: config.path.clone(),
                listener: None,
                endpoint: Some(Endpoint::from_stream(UnixStream::from(fd))),
            })
        }
    }

    /// Wrap an already connected stream, as if set up in client mode.
    pub fn from_stream(sock: UnixStream) -> Self {
        Channel {
            path: PathBuf::new(),
            listener: None,
            endpoint: Some(Endpoint::from_stream(sock)),
        }
    }

    /// Whether the front-end listens for the slave.
    pub fn is_server(&self) -> bool {
        self.listener.is_some()
    }

    /// Whether a slave is connected.
    pub fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Socket path the channel was set up with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor of the listening socket, to poll for incoming connections.
    pub fn listen_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Descriptor of the connection to the slave, once connected.
    pub fn vhost_fd(&self) -> Option<RawFd> {
        self.endpoint.as_ref().map(|e| e.as_raw_fd())
    }

    /// Accept a pending connection from the slave in server mode.
    ///
    /// A later connection replaces an earlier one.
    ///
    /// # Return:
    /// * - true: a connection was accepted.
    /// * - false: no incoming connection available, or the channel is in client mode.
    /// * - SocketError: errors from accept().
    pub fn accept(&mut self) -> Result<bool> {
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return Ok(false),
        };
        loop {
            match listener.accept() {
                Ok((sock, _addr)) => {
                    // The listener is non-blocking; requests on the connection must block.
                    sock.set_nonblocking(false).map_err(Error::SocketError)?;
                    self.endpoint = Some(Endpoint::from_stream(sock));
                    return Ok(true);
                }
                Err(e) => match e.kind() {
                    // No incoming connection available.
                    ErrorKind::WouldBlock => return Ok(false),
                    // New connection closed by peer.
                    ErrorKind::ConnectionAborted => return Ok(false),
                    // Interrupted by signals, retry
                    ErrorKind::Interrupted => continue,
                    _ => return Err(Error::SocketError(e)),
                },
            }
        }
    }

    /// The endpoint to exchange messages on.
    ///
    /// # Return:
    /// * - NotConnected: server mode channel without a connected slave.
    pub fn endpoint_mut(&mut self) -> Result<&mut Endpoint> {
        self.endpoint.as_mut().ok_or(Error::NotConnected)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.listener.is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
