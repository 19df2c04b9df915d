/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Messages exchanged by the cluster's internal actors, plus the grain
//! error surface.

use hive::Pid;

use crate::identity::ClusterIdentity;

/// Directory request: resolve (and if necessary activate) an identity.
/// Sent to the partition actor of the identity's owner member; answered
/// with [`ActivationResponse`].
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    /// The identity to resolve.
    pub identity: ClusterIdentity,
    /// The requester's view of the topology. Requests from another
    /// generation are refused so the caller re-resolves.
    pub topology_hash: u64,
}

/// Spawn request: create (or return) the local activation for an
/// identity. Sent to a member's activator; answered with
/// [`ActivationResponse`].
#[derive(Debug, Clone)]
pub struct Activate {
    /// The identity to activate.
    pub identity: ClusterIdentity,
}

/// The answer to [`ActivationRequest`] and [`Activate`]. `None` means the
/// request could not be satisfied in this topology generation; callers
/// re-resolve and retry.
#[derive(Debug, Clone)]
pub struct ActivationResponse {
    /// The live activation, if one exists or could be created.
    pub pid: Option<Pid>,
}

/// Ask a member's activator to gracefully stop its activation of an
/// identity after the quiescence delay.
#[derive(Debug, Clone)]
pub struct DeactivateActivation {
    /// The identity whose local activation should stop.
    pub identity: ClusterIdentity,
}

/// Delivered to every grain as its first message, carrying the identity it
/// was activated for.
#[derive(Debug, Clone)]
pub struct ClusterInit {
    /// The grain's cluster identity.
    pub identity: ClusterIdentity,
}

/// An application-level error raised by a grain and propagated verbatim to
/// the caller; never retried by the cluster request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainErrorResponse {
    /// A stable, machine-readable error code.
    pub code: String,
    /// A human-readable description.
    pub message: String,
}

impl GrainErrorResponse {
    /// Create a grain error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
