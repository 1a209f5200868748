// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0 or MIT
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Common traits and structs for vhost backend drivers.

use std::os::unix::io::RawFd;

use vmm_sys_util::eventfd::EventFd;

use crate::vhost_user;

/// Maximum number of memory regions supported.
pub const VHOST_MAX_MEMORY_REGIONS: usize = 8;

/// Error codes for vhost backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid queue configuration.
    #[error("invalid queue")]
    InvalidQueue,
    /// Error from the vhost-user protocol.
    #[error("vhost-user protocol error: {0}")]
    VhostUserProtocol(#[source] vhost_user::Error),
}

/// Result of vhost backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Vring/virtque configuration data.
#[derive(Debug, Default, Clone)]
pub struct VringConfigData {
    /// Maximum queue size supported by the driver.
    pub queue_max_size: u16,
    /// Actual queue size negotiated by the driver.
    pub queue_size: u16,
    /// Bitmask of vring flags.
    pub flags: u32,
    /// Descriptor table address.
    pub desc_table_addr: u64,
    /// Used ring buffer address.
    pub used_ring_addr: u64,
    /// Available ring buffer address.
    pub avail_ring_addr: u64,
    /// Optional address for logging.
    pub log_addr: Option<u64>,
}

impl VringConfigData {
    /// Check whether the ring configuration is valid.
    #[allow(clippy::if_same_then_else)]
    #[allow(clippy::needless_bool)]
    pub fn is_valid(&self) -> bool {
        let queue_size = self.queue_size;
        if queue_size > self.queue_max_size
            || queue_size == 0
            || (queue_size & (queue_size - 1)) != 0
        {
            false
        } else if self.desc_table_addr & 0xf != 0 {
            false
        } else if self.avail_ring_addr & 0x1 != 0 {
            false
        } else if self.used_ring_addr & 0x3 != 0 {
            false
        } else {
            true
        }
    }
}

/// An interface for setting up vhost-based backend drivers.
///
/// Vhost-based virtio devices are different from regular virtio devices because the vhost
/// backend takes care of handling all the data transfer. The device itself only needs to deal
/// with setting up the backend driver and managing the control channel.
pub trait VhostBackend: std::marker::Sized {
    /// Get a bitmask of supported virtio/vhost features.
    fn get_features(&mut self) -> Result<u64>;

    /// Inform the vhost subsystem which features to enable.
    /// This should be a subset of supported features from get_features().
    ///
    /// # Arguments
    /// * `features` - Bitmask of features to set.
    fn set_features(&mut self, features: u64) -> Result<()>;

    /// Set the current process as the owner of the vhost backend.
    /// This must be run before any other vhost commands.
    fn set_owner(&mut self) -> Result<()>;

    /// Used to be sent to request disabling all rings
    /// This is no longer used.
    fn reset_owner(&mut self) -> Result<()>;

    /// Share the process's hugepage memory with the backend.
    fn set_mem_table(&mut self) -> Result<()>;

    /// Set base address for page modification logging.
    fn set_log_base(&mut self, base: u64) -> Result<()>;

    /// Specify an eventfd file descriptor to signal on log write.
    fn set_log_fd(&mut self, fd: RawFd) -> Result<()>;

    /// Set the number of descriptors in the vring.
    ///
    /// # Arguments
    /// * `queue_index` - Index of the queue to set descriptor count for.
    /// * `num` - Number of descriptors in the queue.
    fn set_vring_num(&mut self, queue_index: usize, num: u16) -> Result<()>;

    /// Set the addresses for a given vring.
    ///
    /// # Arguments
    /// * `queue_index` - Index of the queue to set addresses for.
    /// * `config_data` - Configuration data for a vring.
    fn set_vring_addr(&mut self, queue_index: usize, config_data: &VringConfigData) -> Result<()>;

    /// Set the first index to look for available descriptors.
    ///
    /// # Arguments
    /// * `queue_index` - Index of the queue to modify.
    /// * `num` - Index where available descriptors start.
    fn set_vring_base(&mut self, queue_index: usize, base: u16) -> Result<()>;

    /// Get the available vring base offset.
    fn get_vring_base(&mut self, queue_index: usize) -> Result<u32>;

    /// Set the eventfd to trigger when buffers have been used by the host.
    ///
    /// # Arguments
    /// * `queue_index` - Index of the queue to modify.
    /// * `fd` - EventFd to trigger, or None to poll the ring instead.
    fn set_vring_call(&mut self, queue_index: usize, fd: Option<&EventFd>) -> Result<()>;

    /// Set the eventfd that will be signaled by the guest when buffers are
    /// available for the host to process.
    ///
    /// # Arguments
    /// * `queue_index` - Index of the queue to modify.
    /// * `fd` - EventFd that will be signaled from guest, or None to poll the ring instead.
    fn set_vring_kick(&mut self, queue_index: usize, fd: Option<&EventFd>) -> Result<()>;

    /// Set the eventfd to signal an error from the vhost backend.
    ///
    /// # Arguments
    /// * `queue_index` - Index of the queue to modify.
    /// * `fd` - EventFd that will be signaled from the backend.
    fn set_vring_err(&mut self, queue_index: usize, fd: Option<&EventFd>) -> Result<()>;

    /// Enable or disable a vring.
    fn set_vring_enable(&mut self, queue_index: usize, enable: bool) -> Result<()>;
}
