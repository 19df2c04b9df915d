/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process identifiers.
//!
//! A [`Pid`] is the address of a process: the pair of the owning system's
//! address and a system-local id. Pids are plain values; equality and
//! hashing are structural on `(address, id)`, and holding a pid does not
//! keep the addressed actor alive.
//!
//! A pid caches the local process handle after first resolution so that the
//! registry is consulted once per pid value on the hot path. The cache is
//! invisible: it does not participate in equality, ordering, or
//! serialization.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::OnceLock;

use serde::Deserialize;
use serde::Serialize;

use crate::actor_system::ActorSystem;
use crate::message::MessageEnvelope;
use crate::process::ProcessHandle;
use crate::system_messages::SystemMessage;

/// A process identifier: `(address, id)` plus an opaque cached handle to the
/// local process, populated on first resolution.
#[derive(Clone, Serialize, Deserialize)]
pub struct Pid {
    address: String,
    id: String,
    #[serde(skip, default)]
    handle: Arc<OnceLock<ProcessHandle>>,
}

impl Pid {
    /// Create a new pid from an address and a system-local id.
    pub fn new(address: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            id: id.into(),
            handle: Arc::new(OnceLock::new()),
        }
    }

    /// The address of the system hosting this process.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The system-local id of this process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver a user message envelope to the addressed process. Messages to
    /// unknown or stopped pids are routed to the dead-letter process.
    pub fn send_user_message(&self, system: &ActorSystem, envelope: MessageEnvelope) {
        let process = self.resolve(system);
        process.send_user_message(self, envelope);
    }

    /// Deliver a system message to the addressed process.
    pub fn send_system_message(&self, system: &ActorSystem, message: SystemMessage) {
        let process = self.resolve(system);
        process.send_system_message(self, message);
    }

    /// Send an immediate stop request to the addressed process.
    pub fn stop(&self, system: &ActorSystem) {
        self.send_system_message(system, SystemMessage::Stop);
    }

    /// Resolve this pid to a process handle, consulting the cache first.
    /// Once the addressed process has terminated its id is never reused, so
    /// a dead cached handle falls through to the registry, which routes to
    /// dead-letter.
    pub(crate) fn resolve(&self, system: &ActorSystem) -> ProcessHandle {
        if let Some(handle) = self.handle.get() {
            if !handle.is_dead() {
                return handle.clone();
            }
        }
        let handle = system
            .registry()
            .get(self)
            .unwrap_or_else(|| system.dead_letter());
        if !handle.is_dead() {
            let _ = self.handle.set(handle.clone());
        }
        handle
    }
}

impl PartialEq for Pid {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.id == other.id
    }
}

impl Eq for Pid {}

impl Hash for Pid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.id)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({}/{})", self.address, self.id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = Pid::new("nonhost", "$1");
        let b = Pid::new("nonhost", "$1");
        let c = Pid::new("nonhost", "$2");
        let d = Pid::new("other", "$1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn test_display() {
        let pid = Pid::new("127.0.0.1:8090", "workers/$7");
        assert_eq!(pid.to_string(), "127.0.0.1:8090/workers/$7");
    }
}
