/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster members.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A member of the cluster as reported by the membership provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The provider-assigned member id, stable for the member's lifetime.
    pub id: String,
    /// The host this member is reachable at.
    pub host: String,
    /// The port this member is reachable at.
    pub port: u16,
    /// The cluster kinds this member can activate.
    pub kinds: Vec<String>,
}

impl Member {
    /// Create a member record.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        kinds: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            kinds,
        }
    }

    /// The member's actor-system address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tells whether this member can activate the given kind.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address())
    }
}
