/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster events published on the owning system's event stream.

use hive::Pid;

use crate::identity::ClusterIdentity;
use crate::member::Member;
use crate::topology::ClusterTopology;

/// A new topology snapshot was computed from provider input.
#[derive(Debug, Clone)]
pub struct ClusterTopologyEvent(pub ClusterTopology);

/// The cluster finished applying a topology: directories were pruned and
/// caches may be drained.
#[derive(Debug, Clone)]
pub struct TopologyApplied {
    /// The applied snapshot version.
    pub version: u64,
}

/// A member joined the live set.
#[derive(Debug, Clone)]
pub struct MemberJoinedEvent(pub Member);

/// A member left the live set, by expiry or deregistration.
#[derive(Debug, Clone)]
pub struct MemberLeftEvent(pub Member);

/// A member was placed on the block list.
#[derive(Debug, Clone)]
pub struct MemberBlockedEvent {
    /// The blocked member's id.
    pub member_id: String,
}

/// A grain activation terminated.
#[derive(Debug, Clone)]
pub struct ActivationTerminatedEvent {
    /// The identity whose activation terminated.
    pub identity: ClusterIdentity,
    /// The terminated activation's pid.
    pub pid: Pid,
}
