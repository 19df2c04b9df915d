/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster identities: the canonical names of virtual actors.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The canonical key of a virtual actor: a kind plus an identity within
/// that kind.
///
/// A cluster identity names a logical actor, not a live one: the cluster
/// layer activates a backing actor on demand and may move it between
/// members across topology changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterIdentity {
    /// The registered kind that knows how to activate this identity.
    pub kind: String,
    /// The identity within the kind.
    pub identity: String,
}

impl ClusterIdentity {
    /// Create an identity from a kind and an identity string.
    pub fn new(kind: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.identity)
    }
}
