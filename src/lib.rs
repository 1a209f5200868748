// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0 or MIT
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Vhost-user control plane for virtio-user network devices
//!
//! Virtio devices use virtqueues to transport data efficiently. Virtqueue is a set of three
//! different single-producer, single-consumer ring structures designed to store generic
//! scatter-gather I/O.
//!
//! A virtio-user device runs the virtio driver and its virtqueues inside a user space process
//! instead of a guest, and hands the data path to a vhost-user backend such as a software
//! switch. The vhost-user protocol implements the control plane needed to establish virtqueue
//! sharing with that backend. It uses communication over a Unix domain socket to share file
//! descriptors in the ancillary data of the message: the hugepage files holding the rings and
//! packet buffers, and the eventfds used for kick and call notifications.
//!
//! The device is the master of the protocol, the backend is the slave. The master can be
//! either a client (i.e. connecting) or server (listening) in the socket communication. Since
//! the device's memory is the process's own memory, the memory table identity-maps the
//! process's virtual addresses.

#![deny(missing_docs)]

#[macro_use]
extern crate bitflags;

pub mod backend;
pub mod vhost_user;

pub use backend::{Error, Result, VhostBackend, VringConfigData, VHOST_MAX_MEMORY_REGIONS};
