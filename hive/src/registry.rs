/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process registry: a flat map from system-local ids to processes.
//!
//! The registry is the single source of truth for pid resolution. Lookups
//! for pids whose address matches the owning system go straight to the local
//! map; other addresses are offered to a chain of registered resolvers (the
//! seam through which a remote transport injects itself). Unresolvable pids
//! fall back to the dead-letter process at the call site.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dashmap::DashSet;

use crate::pid::Pid;
use crate::process::ProcessHandle;

/// Errors produced while registering a new process.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// An explicit name collided with an already registered process.
    #[error("an actor named '{0}' already exists")]
    NameExists(String),
}

/// Resolves pids with a foreign address to a process handle. Registered by
/// transports; consulted in registration order.
pub type AddressResolver = Arc<dyn Fn(&Pid) -> Option<ProcessHandle> + Send + Sync>;

/// A concurrent map from system-local ids to live processes, plus the
/// resolver chain for foreign addresses.
pub struct ProcessRegistry {
    address: RwLock<String>,
    sequence: AtomicU64,
    local: DashMap<String, ProcessHandle>,
    /// Ids that were registered and have since terminated. Ids are never
    /// reused, so membership here is permanent.
    stopped: DashSet<String>,
    resolvers: RwLock<Vec<AddressResolver>>,
}

impl ProcessRegistry {
    pub(crate) fn new(address: impl Into<String>) -> Self {
        Self {
            address: RwLock::new(address.into()),
            sequence: AtomicU64::new(0),
            local: DashMap::new(),
            stopped: DashSet::new(),
            resolvers: RwLock::new(Vec::new()),
        }
    }

    /// The address under which local processes are reachable.
    pub fn address(&self) -> String {
        self.address.read().expect("registry address lock poisoned").clone()
    }

    pub(crate) fn set_address(&self, address: impl Into<String>) {
        *self.address.write().expect("registry address lock poisoned") = address.into();
    }

    /// Produce the next auto-generated process id. Ids are monotonic and
    /// never reused within a system.
    pub fn next_id(&self) -> String {
        format!("${}", self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a process under `id`, returning its pid. Fails if the id is
    /// taken.
    pub fn add(&self, id: &str, process: ProcessHandle) -> Result<Pid, SpawnError> {
        match self.local.entry(id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(process);
                Ok(Pid::new(self.address(), id))
            }
            Entry::Occupied(_) => Err(SpawnError::NameExists(id.to_string())),
        }
    }

    /// Remove the process registered under `pid` and mark it dead. Removal
    /// is idempotent; the pid resolves to dead-letter afterwards, and the
    /// id is recorded as stopped.
    pub fn remove(&self, pid: &Pid) {
        if let Some((id, process)) = self.local.remove(pid.id()) {
            process.mark_dead();
            self.stopped.insert(id);
        }
    }

    /// Tells whether `pid` names a local process that was registered and
    /// has since terminated.
    pub fn has_stopped(&self, pid: &Pid) -> bool {
        pid.address() == self.address() && self.stopped.contains(pid.id())
    }

    /// Look up a local process by id.
    pub fn get_local(&self, id: &str) -> Option<ProcessHandle> {
        self.local.get(id).map(|entry| entry.value().clone())
    }

    /// Resolve a pid to a process handle. Local addresses consult the local
    /// map; foreign addresses are offered to the resolver chain.
    pub fn get(&self, pid: &Pid) -> Option<ProcessHandle> {
        if pid.address() == self.address() {
            return self.get_local(pid.id());
        }
        let resolvers = self.resolvers.read().expect("registry resolver lock poisoned");
        resolvers.iter().find_map(|resolver| resolver(pid))
    }

    /// Append a resolver for foreign addresses.
    pub fn register_resolver(&self, resolver: AddressResolver) {
        self.resolvers
            .write()
            .expect("registry resolver lock poisoned")
            .push(resolver);
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("address", &self.address())
            .field("processes", &self.local.len())
            .finish()
    }
}
