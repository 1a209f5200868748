// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Traits and Struct for vhost-user master.

use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, error};
use vmm_sys_util::eventfd::EventFd;

use super::connection::{Channel, ChannelConfig};
use super::hugepage::{HugepageSource, ProcSelfMaps};
use super::message::*;
use super::{Error as VhostUserError, Result as VhostUserResult};
use crate::backend::{VhostBackend, VringConfigData, VHOST_MAX_MEMORY_REGIONS};
use crate::{Error, Result};

/// Per-request argument of `VhostUserMaster::send_request`.
///
/// Replies are written back through the `&mut` variants once they have been validated.
#[derive(Debug)]
pub enum RequestArg<'a> {
    /// SET_OWNER, RESET_OWNER, SET_MEM_TABLE.
    None,
    /// SET_FEATURES and SET_LOG_BASE read the value, GET_FEATURES stores the reply in it.
    /// GET_FEATURES takes no other argument.
    U64(&'a mut u64),
    /// SET_LOG_FD.
    Fd(RawFd),
    /// SET_VRING_NUM, SET_VRING_BASE and SET_VRING_ENABLE read the state, GET_VRING_BASE
    /// stores the reply in it.
    VringState(&'a mut VhostUserVringState),
    /// SET_VRING_ADDR.
    VringAddr(&'a VhostUserVringAddr),
    /// SET_VRING_KICK, SET_VRING_CALL and SET_VRING_ERR. Only a positive `fd` is attached.
    VringFile {
        /// Vring index.
        index: u32,
        /// Eventfd to pass to the slave.
        fd: RawFd,
    },
}

/// The vhost-user operations of a virtio-user device.
pub trait VhostUserMaster {
    /// Create the channel to the slave.
    fn setup(&self, config: &ChannelConfig) -> VhostUserResult<Channel>;

    /// Send one request and, for GET_FEATURES and GET_VRING_BASE, wait for its reply.
    fn send_request(
        &self,
        channel: &mut Channel,
        req: MasterReq,
        arg: RequestArg<'_>,
    ) -> VhostUserResult<()>;

    /// Enable or disable both vrings of queue pair `pair_index`.
    ///
    /// Stops at the first failure; an already enabled first vring is left as is.
    fn enable_queue_pair(
        &self,
        channel: &mut Channel,
        pair_index: u16,
        enable: bool,
    ) -> VhostUserResult<()> {
        for i in 0..2 {
            let index = u32::from(pair_index) * 2 + i;
            let mut state = VhostUserVringState::new(index, enable as u32);
            self.send_request(
                channel,
                MasterReq::SET_VRING_ENABLE,
                RequestArg::VringState(&mut state),
            )?;
        }
        Ok(())
    }
}

/// Builds and exchanges vhost-user messages for a virtio-user device.
///
/// The memory table describes the hugepage files reported by `S`.
#[derive(Debug, Default, Clone)]
pub struct Master<S: HugepageSource = ProcSelfMaps> {
    hugepages: S,
}

impl Master<ProcSelfMaps> {
    /// Create a master describing the hugepages mapped into the current process.
    pub fn new() -> Self {
        Master {
            hugepages: ProcSelfMaps,
        }
    }
}

impl<S: HugepageSource> Master<S> {
    /// Create a master describing the hugepage files reported by `hugepages`.
    pub fn with_source(hugepages: S) -> Self {
        Master { hugepages }
    }

    fn prepare_memory(&self) -> VhostUserResult<(VhostUserPayload, Vec<File>)> {
        let huges = self
            .hugepages
            .hugepage_files(VHOST_MAX_MEMORY_REGIONS)
            .map_err(|e| {
                error!("Failed to prepare memory for vhost-user: {}", e);
                e
            })?;
        if huges.len() > VHOST_MAX_MEMORY_REGIONS {
            return Err(VhostUserError::TooManyHugepageFiles(VHOST_MAX_MEMORY_REGIONS));
        }

        let mut regions = Vec::with_capacity(huges.len());
        let mut files = Vec::with_capacity(huges.len());
        for huge in huges {
            // Identity mapping: the slave sees the front-end's virtual addresses as guest
            // physical addresses.
            regions.push(VhostUserMemoryRegion::new(huge.addr, huge.size, huge.addr, 0));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&huge.path)
                .map_err(|e| {
                    error!("cannot open {}: {}", huge.path.display(), e);
                    VhostUserError::HugepageOpen(huge.path.display().to_string(), e)
                })?;
            files.push(file);
        }

        Ok((VhostUserPayload::Memory(regions), files))
    }

    /// Build the payload and descriptor list for `req`.
    ///
    /// Descriptors opened here come back as `File`s so they are closed whatever happens next.
    fn build_request(
        &self,
        req: MasterReq,
        arg: &RequestArg<'_>,
    ) -> VhostUserResult<(VhostUserPayload, Vec<RawFd>, Vec<File>)> {
        let mut fds = Vec::new();
        let mut files = Vec::new();

        let payload = match (req, arg) {
            (MasterReq::GET_FEATURES, RequestArg::U64(_)) => VhostUserPayload::Empty,
            (MasterReq::SET_FEATURES, RequestArg::U64(value))
            | (MasterReq::SET_LOG_BASE, RequestArg::U64(value)) => {
                VhostUserPayload::U64(VhostUserU64::new(**value))
            }
            (MasterReq::SET_OWNER, _) | (MasterReq::RESET_OWNER, _) => VhostUserPayload::Empty,
            (MasterReq::SET_MEM_TABLE, _) => {
                let (payload, opened) = self.prepare_memory()?;
                fds.extend(opened.iter().map(|f| f.as_raw_fd()));
                files = opened;
                payload
            }
            (MasterReq::SET_LOG_FD, RequestArg::Fd(fd)) => {
                fds.push(*fd);
                VhostUserPayload::Empty
            }
            (MasterReq::SET_VRING_NUM, RequestArg::VringState(state))
            | (MasterReq::SET_VRING_BASE, RequestArg::VringState(state))
            | (MasterReq::SET_VRING_ENABLE, RequestArg::VringState(state))
            | (MasterReq::GET_VRING_BASE, RequestArg::VringState(state)) => {
                VhostUserPayload::VringState(**state)
            }
            (MasterReq::SET_VRING_ADDR, RequestArg::VringAddr(addr)) => {
                VhostUserPayload::VringAddr(**addr)
            }
            (MasterReq::SET_VRING_KICK, RequestArg::VringFile { index, fd })
            | (MasterReq::SET_VRING_CALL, RequestArg::VringFile { index, fd })
            | (MasterReq::SET_VRING_ERR, RequestArg::VringFile { index, fd }) => {
                let mut value = u64::from(*index) & VHOST_USER_VRING_IDX_MASK;
                if *fd > 0 {
                    fds.push(*fd);
                } else {
                    value |= VHOST_USER_VRING_NOFD_MASK;
                }
                VhostUserPayload::U64(VhostUserU64::new(value))
            }
            (MasterReq::GET_FEATURES, _)
            | (MasterReq::SET_FEATURES, _)
            | (MasterReq::SET_LOG_BASE, _)
            | (MasterReq::SET_LOG_FD, _)
            | (MasterReq::SET_VRING_NUM, _)
            | (MasterReq::SET_VRING_BASE, _)
            | (MasterReq::SET_VRING_ENABLE, _)
            | (MasterReq::GET_VRING_BASE, _)
            | (MasterReq::SET_VRING_ADDR, _)
            | (MasterReq::SET_VRING_KICK, _)
            | (MasterReq::SET_VRING_CALL, _)
            | (MasterReq::SET_VRING_ERR, _) => {
                error!("{:?}: argument does not match the request", req);
                return Err(VhostUserError::InvalidParam);
            }
            _ => {
                error!("trying to send unhandled msg type {:?}", req);
                return Err(VhostUserError::UnsupportedRequest(req.into()));
            }
        };

        Ok((payload, fds, files))
    }

    fn send_request_inner(
        &self,
        channel: &mut Channel,
        req: MasterReq,
        mut arg: RequestArg<'_>,
    ) -> VhostUserResult<()> {
        if !channel.is_connected() {
            return Err(VhostUserError::NotConnected);
        }

        let (payload, fds, files) = self.build_request(req, &arg)?;
        let msg = VhostUserMsg::new(req, payload);
        let endpoint = channel.endpoint_mut()?;
        let sent = endpoint.send_message(&msg, &fds);
        // The slave holds its own copies of the hugepage descriptors once the message is out.
        drop(files);
        sent?;

        if !req.needs_reply() {
            return Ok(());
        }

        let reply = endpoint.recv_reply()?;
        if reply.hdr.request() != u32::from(req) {
            error!("Received unexpected msg type {}", reply.hdr.request());
            return Err(VhostUserError::UnexpectedReply(reply.hdr.request()));
        }

        match (req, &mut arg) {
            (MasterReq::GET_FEATURES, RequestArg::U64(value)) => {
                let features = VhostUserU64::read_from(&reply.payload)
                    .ok_or(VhostUserError::InvalidReplySize(reply.hdr.get_size()))?;
                **value = features.value;
            }
            (MasterReq::GET_VRING_BASE, RequestArg::VringState(state)) => {
                **state = VhostUserVringState::read_from(&reply.payload)
                    .ok_or(VhostUserError::InvalidReplySize(reply.hdr.get_size()))?;
            }
            _ => return Err(VhostUserError::UnexpectedReply(reply.hdr.request())),
        }

        Ok(())
    }
}

impl<S: HugepageSource> VhostUserMaster for Master<S> {
    fn setup(&self, config: &ChannelConfig) -> VhostUserResult<Channel> {
        Channel::setup(config).map_err(|e| {
            if config.server {
                error!("virtio-user startup fails in server mode");
            }
            e
        })
    }

    fn send_request(
        &self,
        channel: &mut Channel,
        req: MasterReq,
        arg: RequestArg<'_>,
    ) -> VhostUserResult<()> {
        debug!("{:?}", req);
        self.send_request_inner(channel, req, arg).map_err(|e| {
            error!("{:?} failed: {}", req, e);
            e
        })
    }
}

/// Vring index on the wire for `queue_index`.
fn vring_index(queue_index: usize) -> Result<u32> {
    u32::try_from(queue_index).map_err(|_| {
        error!("vring index {} out of range", queue_index);
        Error::InvalidQueue
    })
}

/// A virtio-user device's view of its vhost-user slave: a master plus its channel.
pub struct Frontend<S: HugepageSource = ProcSelfMaps> {
    master: Master<S>,
    channel: Channel,
}

impl Frontend<ProcSelfMaps> {
    /// Set up the channel described by `config` for the current process's hugepages.
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let master = Master::new();
        let channel = master.setup(config)?;
        Ok(Frontend { master, channel })
    }
}

impl<S: HugepageSource> Frontend<S> {
    /// Combine an existing master and channel.
    pub fn from_parts(master: Master<S>, channel: Channel) -> Self {
        Frontend { master, channel }
    }

    /// Split into master and channel.
    pub fn into_parts(self) -> (Master<S>, Channel) {
        (self.master, self.channel)
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Poll for the slave's connection in server mode.
    pub fn accept(&mut self) -> Result<bool> {
        Ok(self.channel.accept()?)
    }

    /// Enable or disable both vrings of queue pair `pair_index`.
    pub fn enable_queue_pair(&mut self, pair_index: u16, enable: bool) -> Result<()> {
        Ok(self
            .master
            .enable_queue_pair(&mut self.channel, pair_index, enable)?)
    }

    fn request(&mut self, req: MasterReq, arg: RequestArg<'_>) -> Result<()> {
        Ok(self.master.send_request(&mut self.channel, req, arg)?)
    }

    fn vring_file(
        &mut self,
        req: MasterReq,
        queue_index: usize,
        fd: Option<&EventFd>,
    ) -> Result<()> {
        let arg = RequestArg::VringFile {
            index: vring_index(queue_index)?,
            fd: fd.map_or(-1, |evt| evt.as_raw_fd()),
        };
        self.request(req, arg)
    }
}

impl<S: HugepageSource> VhostBackend for Frontend<S> {
    fn get_features(&mut self) -> Result<u64> {
        let mut features = 0u64;
        self.request(MasterReq::GET_FEATURES, RequestArg::U64(&mut features))?;
        Ok(features)
    }

    fn set_features(&mut self, features: u64) -> Result<()> {
        let mut val = features;
        self.request(MasterReq::SET_FEATURES, RequestArg::U64(&mut val))
    }

    fn set_owner(&mut self) -> Result<()> {
        self.request(MasterReq::SET_OWNER, RequestArg::None)
    }

    fn reset_owner(&mut self) -> Result<()> {
        self.request(MasterReq::RESET_OWNER, RequestArg::None)
    }

    fn set_mem_table(&mut self) -> Result<()> {
        self.request(MasterReq::SET_MEM_TABLE, RequestArg::None)
    }

    fn set_log_base(&mut self, base: u64) -> Result<()> {
        let mut val = base;
        self.request(MasterReq::SET_LOG_BASE, RequestArg::U64(&mut val))
    }

    fn set_log_fd(&mut self, fd: RawFd) -> Result<()> {
        self.request(MasterReq::SET_LOG_FD, RequestArg::Fd(fd))
    }

    fn set_vring_num(&mut self, queue_index: usize, num: u16) -> Result<()> {
        let mut state = VhostUserVringState::new(vring_index(queue_index)?, u32::from(num));
        self.request(MasterReq::SET_VRING_NUM, RequestArg::VringState(&mut state))
    }

    fn set_vring_addr(&mut self, queue_index: usize, config_data: &VringConfigData) -> Result<()> {
        if !config_data.is_valid() {
            return Err(Error::InvalidQueue);
        }
        let addr = VhostUserVringAddr::from_config_data(vring_index(queue_index)?, config_data);
        self.request(MasterReq::SET_VRING_ADDR, RequestArg::VringAddr(&addr))
    }

    fn set_vring_base(&mut self, queue_index: usize, base: u16) -> Result<()> {
        let mut state = VhostUserVringState::new(vring_index(queue_index)?, u32::from(base));
        self.request(MasterReq::SET_VRING_BASE, RequestArg::VringState(&mut state))
    }

    fn get_vring_base(&mut self, queue_index: usize) -> Result<u32> {
        let mut state = VhostUserVringState::new(vring_index(queue_index)?, 0);
        self.request(MasterReq::GET_VRING_BASE, RequestArg::VringState(&mut state))?;
        Ok(state.num)
    }

    fn set_vring_call(&mut self, queue_index: usize, fd: Option<&EventFd>) -> Result<()> {
        self.vring_file(MasterReq::SET_VRING_CALL, queue_index, fd)
    }

    fn set_vring_kick(&mut self, queue_index: usize, fd: Option<&EventFd>) -> Result<()> {
        self.vring_file(MasterReq::SET_VRING_KICK, queue_index, fd)
    }

    fn set_vring_err(&mut self, queue_index: usize, fd: Option<&EventFd>) -> Result<()> {
        self.vring_file(MasterReq::SET_VRING_ERR, queue_index, fd)
    }

    fn set_vring_enable(&mut self, queue_index: usize, enable: bool) -> Result<()> {
        let mut state = VhostUserVringState::new(vring_index(queue_index)?, enable as u32);
        self.request(MasterReq::SET_VRING_ENABLE, RequestArg::VringState(&mut state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};

    use libc::{c_void, iovec};
    use tempfile::{tempdir, TempDir};
    use vmm_sys_util::sock_ctrl_msg::ScmSocket;

    use crate::vhost_user::HugepageFile;

    struct FakeHugepages(Vec<HugepageFile>);

    impl HugepageSource for FakeHugepages {
        fn hugepage_files(&self, max: usize) -> VhostUserResult<Vec<HugepageFile>> {
            if self.0.len() > max {
                return Err(VhostUserError::TooManyHugepageFiles(max));
            }
            Ok(self.0.clone())
        }
    }

    fn no_hugepages() -> Master<FakeHugepages> {
        Master::with_source(FakeHugepages(Vec::new()))
    }

    fn channel_pair() -> (Channel, UnixStream) {
        let (master, slave) = UnixStream::pair().unwrap();
        (Channel::from_stream(master), slave)
    }

    /// Read one request from the slave side of the socket.
    fn recv_request(sock: &UnixStream) -> (VhostUserMsgHeader, Vec<u8>, Vec<File>) {
        let mut hdr_buf = [0u8; VhostUserMsgHeader::SIZE];
        let mut iovs = [iovec {
            iov_base: hdr_buf.as_mut_ptr() as *mut c_void,
            iov_len: hdr_buf.len(),
        }];
        let mut fds = [-1; MAX_ATTACHED_FD_ENTRIES];
        let (bytes, nfds) = unsafe { sock.recv_with_fds(&mut iovs, &mut fds).unwrap() };
        assert_eq!(bytes, VhostUserMsgHeader::SIZE);
        let files = fds[..nfds]
            .iter()
            .map(|fd| unsafe { File::from_raw_fd(*fd) })
            .collect();

        let hdr = VhostUserMsgHeader::read_from(&hdr_buf).unwrap();
        let mut payload = vec![0u8; hdr.get_size() as usize];
        if !payload.is_empty() {
            let mut iovs = [iovec {
                iov_base: payload.as_mut_ptr() as *mut c_void,
                iov_len: payload.len(),
            }];
            let (bytes, _) = unsafe { sock.recv_with_fds(&mut iovs, &mut []).unwrap() };
            assert_eq!(bytes, payload.len());
        }
        (hdr, payload, files)
    }

    fn hugepage_dir(count: usize) -> (TempDir, Vec<HugepageFile>) {
        let dir = tempdir().unwrap();
        let huges = (0..count)
            .map(|i| {
                let path: PathBuf = dir.path().join(format!("rtemap_{}", i));
                let file = File::create(&path).unwrap();
                file.set_len(0x1000 * (i as u64 + 1)).unwrap();
                HugepageFile {
                    addr: 0x7f00_0000_0000 + 0x10_0000 * i as u64,
                    size: 0x1000 * (i as u64 + 1),
                    path,
                }
            })
            .collect();
        (dir, huges)
    }

    /// Descriptors of this process pointing into `dir`.
    fn open_fds_under(dir: &Path) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .filter(|target| target.starts_with(dir))
            .count()
    }

    #[test]
    fn header_size_matches_payload() {
        let master = no_hugepages();
        let (mut channel, slave) = channel_pair();
        let mut value = 0x1234u64;
        let mut state = VhostUserVringState::new(1, 256);
        let addr = VhostUserVringAddr::default();

        let cases: Vec<(MasterReq, RequestArg, u32)> = vec![
            (MasterReq::SET_OWNER, RequestArg::None, 0),
            (MasterReq::RESET_OWNER, RequestArg::None, 0),
            (MasterReq::SET_FEATURES, RequestArg::U64(&mut value), 8),
        ];
        for (req, arg, size) in cases {
            master.send_request(&mut channel, req, arg).unwrap();
            let (hdr, payload, _) = recv_request(&slave);
            assert_eq!(hdr.get_code(), Some(req));
            assert_eq!(hdr.flags(), VHOST_USER_VERSION);
            assert_eq!(hdr.get_size(), size);
            assert_eq!(payload.len(), size as usize);
        }

        let mut base = 0x8000u64;
        master
            .send_request(&mut channel, MasterReq::SET_LOG_BASE, RequestArg::U64(&mut base))
            .unwrap();
        let (hdr, payload, _) = recv_request(&slave);
        assert_eq!(hdr.get_size(), 8);
        assert_eq!(&payload[..], &0x8000u64.to_ne_bytes());

        for req in &[
            MasterReq::SET_VRING_NUM,
            MasterReq::SET_VRING_BASE,
            MasterReq::SET_VRING_ENABLE,
        ] {
            master
                .send_request(&mut channel, *req, RequestArg::VringState(&mut state))
                .unwrap();
            let (hdr, payload, _) = recv_request(&slave);
            assert_eq!(hdr.get_size(), 8);
            assert_eq!(
                VhostUserPayload::decode(*req, &payload).unwrap(),
                VhostUserPayload::VringState(VhostUserVringState::new(1, 256))
            );
        }

        master
            .send_request(&mut channel, MasterReq::SET_VRING_ADDR, RequestArg::VringAddr(&addr))
            .unwrap();
        let (hdr, _, _) = recv_request(&slave);
        assert_eq!(hdr.get_size(), 40);

        let evt = EventFd::new(0).unwrap();
        master
            .send_request(&mut channel, MasterReq::SET_LOG_FD, RequestArg::Fd(evt.as_raw_fd()))
            .unwrap();
        let (hdr, _, files) = recv_request(&slave);
        assert_eq!(hdr.get_size(), 0);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn vring_kick_without_fd() {
        let master = no_hugepages();
        let (mut channel, slave) = channel_pair();
        master
            .send_request(
                &mut channel,
                MasterReq::SET_VRING_KICK,
                RequestArg::VringFile { index: 3, fd: -1 },
            )
            .unwrap();
        let (hdr, payload, files) = recv_request(&slave);
        assert_eq!(hdr.get_size(), 8);
        assert_eq!(
            VhostUserPayload::decode(MasterReq::SET_VRING_KICK, &payload).unwrap(),
            VhostUserPayload::U64(VhostUserU64::new(3 | VHOST_USER_VRING_NOFD_MASK))
        );
        assert!(files.is_empty());
    }

    #[test]
    fn vring_kick_with_fd() {
        let master = no_hugepages();
        let (mut channel, slave) = channel_pair();
        let evt = EventFd::new(0).unwrap();
        master
            .send_request(
                &mut channel,
                MasterReq::SET_VRING_KICK,
                RequestArg::VringFile {
                    index: 3,
                    fd: evt.as_raw_fd(),
                },
            )
            .unwrap();
        let (_, payload, files) = recv_request(&slave);
        assert_eq!(&payload[..], &3u64.to_ne_bytes());
        assert_eq!(files.len(), 1);

        // The received descriptor is the same eventfd.
        evt.write(1).unwrap();
        let mut counter = [0u8; 8];
        (&files[0]).read_exact(&mut counter).unwrap();
        assert_eq!(u64::from_ne_bytes(counter), 1);
    }

    #[test]
    fn vring_index_is_masked() {
        let master = no_hugepages();
        let (mut channel, slave) = channel_pair();
        master
            .send_request(
                &mut channel,
                MasterReq::SET_VRING_CALL,
                RequestArg::VringFile { index: 0x1ff, fd: 0 },
            )
            .unwrap();
        let (_, payload, files) = recv_request(&slave);
        assert_eq!(
            &payload[..],
            &(0xff | VHOST_USER_VRING_NOFD_MASK).to_ne_bytes()
        );
        assert!(files.is_empty());
    }

    #[test]
    fn get_features_reply() {
        let master = no_hugepages();
        let (mut channel, mut slave) = channel_pair();
        let slave_thread = std::thread::spawn(move || {
            let (hdr, payload, _) = recv_request(&slave);
            assert_eq!(hdr.get_code(), Some(MasterReq::GET_FEATURES));
            assert!(payload.is_empty());
            let reply = VhostUserMsg::new_reply(
                MasterReq::GET_FEATURES,
                VhostUserPayload::U64(VhostUserU64::new(0x1_4000_0000)),
            );
            slave.write_all(&reply.to_bytes()).unwrap();
            slave
        });

        let mut features = 0u64;
        master
            .send_request(&mut channel, MasterReq::GET_FEATURES, RequestArg::U64(&mut features))
            .unwrap();
        slave_thread.join().unwrap();
        assert_eq!(features, 0x1_4000_0000);
    }

    #[test]
    fn get_features_bad_reply_size() {
        let master = no_hugepages();
        let (mut channel, mut slave) = channel_pair();
        let slave_thread = std::thread::spawn(move || {
            recv_request(&slave);
            let reply = VhostUserMsg::new_reply(
                MasterReq::GET_FEATURES,
                VhostUserPayload::VringAddr(VhostUserVringAddr::default()),
            );
            slave.write_all(&reply.to_bytes()).unwrap();
            slave
        });

        let mut features = 0xdead_beefu64;
        match master.send_request(
            &mut channel,
            MasterReq::GET_FEATURES,
            RequestArg::U64(&mut features),
        ) {
            Err(VhostUserError::InvalidReplySize(40)) => {}
            r => panic!("accepted a reply of the wrong size: {:?}", r),
        }
        slave_thread.join().unwrap();
        assert_eq!(features, 0xdead_beef);
    }

    #[test]
    fn get_vring_base_reply() {
        let master = no_hugepages();
        let (mut channel, mut slave) = channel_pair();
        let slave_thread = std::thread::spawn(move || {
            let (hdr, payload, _) = recv_request(&slave);
            assert_eq!(hdr.get_code(), Some(MasterReq::GET_VRING_BASE));
            assert_eq!(
                VhostUserPayload::decode(MasterReq::GET_VRING_BASE, &payload).unwrap(),
                VhostUserPayload::VringState(VhostUserVringState::new(2, 0))
            );
            let reply = VhostUserMsg::new_reply(
                MasterReq::GET_VRING_BASE,
                VhostUserPayload::VringState(VhostUserVringState::new(2, 0x42)),
            );
            slave.write_all(&reply.to_bytes()).unwrap();
            slave
        });

        let mut state = VhostUserVringState::new(2, 0);
        master
            .send_request(
                &mut channel,
                MasterReq::GET_VRING_BASE,
                RequestArg::VringState(&mut state),
            )
            .unwrap();
        slave_thread.join().unwrap();
        assert_eq!(state, VhostUserVringState::new(2, 0x42));
    }

    #[test]
    fn reply_for_another_request() {
        let master = no_hugepages();
        let (mut channel, mut slave) = channel_pair();
        let slave_thread = std::thread::spawn(move || {
            recv_request(&slave);
            let reply = VhostUserMsg::new_reply(
                MasterReq::GET_VRING_BASE,
                VhostUserPayload::VringState(VhostUserVringState::new(0, 1)),
            );
            slave.write_all(&reply.to_bytes()).unwrap();
            slave
        });

        let mut features = 0u64;
        match master.send_request(
            &mut channel,
            MasterReq::GET_FEATURES,
            RequestArg::U64(&mut features),
        ) {
            Err(VhostUserError::UnexpectedReply(11)) => {}
            r => panic!("accepted a reply for another request: {:?}", r),
        }
        slave_thread.join().unwrap();
        assert_eq!(features, 0);
    }

    #[test]
    fn unsupported_request() {
        let master = no_hugepages();
        let (mut channel, _slave) = channel_pair();
        for req in &[MasterReq::GET_PROTOCOL_FEATURES, MasterReq::SET_CONFIG] {
            match master.send_request(&mut channel, *req, RequestArg::None) {
                Err(VhostUserError::UnsupportedRequest(code)) => {
                    assert_eq!(MasterReq::try_from(code), Ok(*req))
                }
                r => panic!("sent an unsupported request: {:?}", r),
            }
        }
    }

    #[test]
    fn mismatched_argument() {
        let master = no_hugepages();
        let (mut channel, _slave) = channel_pair();
        match master.send_request(&mut channel, MasterReq::SET_FEATURES, RequestArg::None) {
            Err(VhostUserError::InvalidParam) => {}
            r => panic!("sent a request without its argument: {:?}", r),
        }
    }

    #[test]
    fn server_without_slave() {
        let dir = tempdir().unwrap();
        let master = no_hugepages();
        let mut channel = master
            .setup(&ChannelConfig::server(dir.path().join("sock")))
            .unwrap();
        match master.send_request(&mut channel, MasterReq::SET_OWNER, RequestArg::None) {
            Err(VhostUserError::NotConnected) => {}
            r => panic!("sent a request without a slave: {:?}", r),
        }
    }

    #[test]
    fn set_mem_table() {
        let (dir, huges) = hugepage_dir(3);
        let master = Master::with_source(FakeHugepages(huges.clone()));
        let (mut channel, slave) = channel_pair();

        master
            .send_request(&mut channel, MasterReq::SET_MEM_TABLE, RequestArg::None)
            .unwrap();
        // Every hugepage descriptor opened for the message is closed again.
        assert_eq!(open_fds_under(dir.path()), 0);

        let (hdr, payload, files) = recv_request(&slave);
        assert_eq!(hdr.get_size() as usize, 8 + 3 * 32);
        assert_eq!(files.len(), 3);
        let regions = match VhostUserPayload::decode(MasterReq::SET_MEM_TABLE, &payload).unwrap() {
            VhostUserPayload::Memory(regions) => regions,
            p => panic!("unexpected payload {:?}", p),
        };
        for (region, huge) in regions.iter().zip(huges.iter()) {
            assert_eq!(region.guest_phys_addr, huge.addr);
            assert_eq!(region.user_addr, huge.addr);
            assert_eq!(region.memory_size, huge.size);
            assert_eq!(region.mmap_offset, 0);
        }
        for (file, huge) in files.iter().zip(huges.iter()) {
            assert_eq!(file.metadata().unwrap().len(), huge.size);
        }
    }

    #[test]
    fn set_mem_table_too_many_files() {
        let (_dir, huges) = hugepage_dir(VHOST_MAX_MEMORY_REGIONS + 1);
        let master = Master::with_source(FakeHugepages(huges));
        let (mut channel, _slave) = channel_pair();
        match master.send_request(&mut channel, MasterReq::SET_MEM_TABLE, RequestArg::None) {
            Err(VhostUserError::TooManyHugepageFiles(8)) => {}
            r => panic!("truncated the memory table: {:?}", r),
        }
    }

    #[test]
    fn set_mem_table_unopenable_file() {
        let (dir, mut huges) = hugepage_dir(2);
        huges[1].path = dir.path().join("rtemap_9");
        let master = Master::with_source(FakeHugepages(huges));
        let (mut channel, _slave) = channel_pair();

        match master.send_request(&mut channel, MasterReq::SET_MEM_TABLE, RequestArg::None) {
            Err(VhostUserError::HugepageOpen(_, _)) => {}
            r => panic!("sent a memory table with a missing file: {:?}", r),
        }
        assert_eq!(open_fds_under(dir.path()), 0);
    }

    #[test]
    fn enable_queue_pair() {
        let master = no_hugepages();
        let (mut channel, slave) = channel_pair();
        master.enable_queue_pair(&mut channel, 2, true).unwrap();

        for index in 4..6 {
            let (hdr, payload, _) = recv_request(&slave);
            assert_eq!(hdr.get_code(), Some(MasterReq::SET_VRING_ENABLE));
            assert_eq!(
                VhostUserPayload::decode(MasterReq::SET_VRING_ENABLE, &payload).unwrap(),
                VhostUserPayload::VringState(VhostUserVringState::new(index, 1))
            );
        }
    }

    /// Records SET_VRING_ENABLE indices and fails on `fail_index`.
    struct FlakyMaster {
        fail_index: u32,
        sent: std::cell::RefCell<Vec<u32>>,
    }

    impl VhostUserMaster for FlakyMaster {
        fn setup(&self, config: &ChannelConfig) -> VhostUserResult<Channel> {
            Channel::setup(config)
        }

        fn send_request(
            &self,
            _channel: &mut Channel,
            req: MasterReq,
            arg: RequestArg<'_>,
        ) -> VhostUserResult<()> {
            assert_eq!(req, MasterReq::SET_VRING_ENABLE);
            let index = match arg {
                RequestArg::VringState(state) => state.index,
                a => panic!("unexpected argument {:?}", a),
            };
            self.sent.borrow_mut().push(index);
            if index == self.fail_index {
                return Err(VhostUserError::PartialMessage);
            }
            Ok(())
        }
    }

    #[test]
    fn enable_queue_pair_stops_on_error() {
        let (mut channel, _slave) = channel_pair();

        let master = FlakyMaster {
            fail_index: 2,
            sent: Default::default(),
        };
        assert!(master.enable_queue_pair(&mut channel, 1, true).is_err());
        // The second vring of the pair is never touched.
        assert_eq!(*master.sent.borrow(), vec![2]);

        let master = FlakyMaster {
            fail_index: 3,
            sent: Default::default(),
        };
        assert!(master.enable_queue_pair(&mut channel, 1, true).is_err());
        assert_eq!(*master.sent.borrow(), vec![2, 3]);
    }

    #[test]
    fn get_features_needs_u64() {
        let master = no_hugepages();
        let (mut channel, slave) = channel_pair();
        let mut state = VhostUserVringState::new(0, 0);
        for arg in vec![
            RequestArg::None,
            RequestArg::Fd(1),
            RequestArg::VringState(&mut state),
        ] {
            match master.send_request(&mut channel, MasterReq::GET_FEATURES, arg) {
                Err(VhostUserError::InvalidParam) => {}
                r => panic!("sent GET_FEATURES without a place for the reply: {:?}", r),
            }
        }
        // Nothing reached the slave.
        slave.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            (&slave).read(&mut buf).unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn queue_index_out_of_range() {
        let (master_sock, slave) = UnixStream::pair().unwrap();
        let mut frontend =
            Frontend::from_parts(no_hugepages(), Channel::from_stream(master_sock));
        let index = u32::MAX as usize + 3;

        assert!(matches!(
            frontend.set_vring_num(index, 256),
            Err(Error::InvalidQueue)
        ));
        assert!(matches!(
            frontend.get_vring_base(index),
            Err(Error::InvalidQueue)
        ));
        assert!(matches!(
            frontend.set_vring_kick(index, None),
            Err(Error::InvalidQueue)
        ));
        assert!(matches!(
            frontend.set_vring_enable(index, true),
            Err(Error::InvalidQueue)
        ));

        slave.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            (&slave).read(&mut buf).unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }
}
