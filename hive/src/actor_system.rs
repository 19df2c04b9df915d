/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The actor system: the per-process runtime container.
//!
//! An [`ActorSystem`] owns the process registry, the event stream, the
//! dead-letter sink, and the ledger of root actors. Multiple systems may
//! coexist in one OS process; nothing here is global. Shutting a system
//! down stops every root actor, which cascade-stops the trees beneath them,
//! and then fires the system's cancellation token.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::event_stream::EventStream;
use crate::future::spawn_future;
use crate::pid::Pid;
use crate::process::DeadLetterProcess;
use crate::process::ProcessHandle;
use crate::registry::ProcessRegistry;
use crate::root_context::RootContext;
use crate::system_messages::SystemMessage;
use crate::throttle::Throttle;

/// The address systems carry before a transport or cluster layer assigns
/// them a routable one.
pub const LOCAL_ADDRESS: &str = "nonhost";

struct SystemState {
    config: Config,
    registry: ProcessRegistry,
    event_stream: EventStream,
    dead_letter: ProcessHandle,
    roots: DashMap<String, Pid>,
    start_deadline_throttle: Throttle,
    dead_letter_throttle: Throttle,
    shutdown: CancellationToken,
}

/// A handle to a running actor system. Cheap to clone; all clones share the
/// same state.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemState>,
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("address", &self.address())
            .field("roots", &self.inner.roots.len())
            .finish()
    }
}

impl ActorSystem {
    /// Create a system with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a system with the provided configuration.
    pub fn with_config(config: Config) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SystemState>| SystemState {
            config,
            registry: ProcessRegistry::new(LOCAL_ADDRESS),
            event_stream: EventStream::new(),
            dead_letter: Arc::new(DeadLetterProcess::new(WeakActorSystem(weak.clone()))),
            roots: DashMap::new(),
            start_deadline_throttle: Throttle::new(1, Duration::from_secs(1)),
            dead_letter_throttle: Throttle::new(10, Duration::from_secs(1)),
            shutdown: CancellationToken::new(),
        });
        Self { inner }
    }

    /// The root context, for interacting with the system from outside any
    /// actor.
    pub fn root(&self) -> RootContext {
        RootContext::new(self.clone())
    }

    /// The system's address: `nonhost` until a transport or cluster layer
    /// assigns one.
    pub fn address(&self) -> String {
        self.inner.registry.address()
    }

    /// Assign the system's routable address. Must happen before actors that
    /// will be referenced remotely are spawned: pids capture the address at
    /// spawn time.
    pub fn set_address(&self, address: impl Into<String>) {
        self.inner.registry.set_address(address);
    }

    /// The system configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The process registry.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    /// The system's event stream.
    pub fn event_stream(&self) -> &EventStream {
        &self.inner.event_stream
    }

    /// The dead-letter process.
    pub fn dead_letter(&self) -> ProcessHandle {
        self.inner.dead_letter.clone()
    }

    /// A token cancelled when the system has shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stop every root actor, wait (bounded) for their trees to terminate,
    /// then fire the shutdown token.
    pub async fn shutdown(&self) {
        let roots: Vec<Pid> = self
            .inner
            .roots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!(roots = roots.len(), "actor system shutting down");

        let waits: Vec<_> = roots
            .into_iter()
            .map(|pid| {
                let (future_pid, future) = spawn_future(self, Duration::from_secs(10));
                pid.send_system_message(self, SystemMessage::Watch(future_pid));
                pid.stop(self);
                future
            })
            .collect();
        for wait in waits {
            if wait.result().await.is_err() {
                tracing::warn!("actor did not stop within the shutdown deadline");
            }
        }
        self.inner.shutdown.cancel();
    }

    pub(crate) fn start_deadline_throttle(&self) -> &Throttle {
        &self.inner.start_deadline_throttle
    }

    pub(crate) fn dead_letter_throttle(&self) -> &Throttle {
        &self.inner.dead_letter_throttle
    }

    pub(crate) fn register_root(&self, pid: &Pid) {
        self.inner.roots.insert(pid.id().to_string(), pid.clone());
    }

    pub(crate) fn deregister_root(&self, pid: &Pid) {
        self.inner.roots.remove(pid.id());
    }

    pub(crate) fn downgrade(&self) -> WeakActorSystem {
        WeakActorSystem(Arc::downgrade(&self.inner))
    }
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak handle to an actor system, for runtime internals that must not
/// keep the system alive.
pub(crate) struct WeakActorSystem(Weak<SystemState>);

impl WeakActorSystem {
    pub(crate) fn upgrade(&self) -> Option<ActorSystem> {
        self.0.upgrade().map(|inner| ActorSystem { inner })
    }
}

impl std::fmt::Debug for WeakActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakActorSystem")
    }
}
