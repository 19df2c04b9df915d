/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The root context: the system's entry point for user code that is not
//! itself an actor.
//!
//! Spawns issued here create root actors (no parent; supervised by the
//! default root strategy), and sends honor the root's own sender middleware
//! chain.

use std::sync::Arc;
use std::time::Duration;

use crate::actor_system::ActorSystem;
use crate::future::spawn_future;
use crate::future::ActorFuture;
use crate::message::Message;
use crate::message::MessageEnvelope;
use crate::message::PoisonPill;
use crate::pid::Pid;
use crate::props::compose_sender_chain;
use crate::props::Props;
use crate::props::SenderFn;
use crate::props::SenderMiddleware;
use crate::registry::SpawnError;
use crate::system_messages::SystemMessage;

/// A context for spawning and messaging actors from outside the actor
/// fabric.
#[derive(Clone)]
pub struct RootContext {
    system: ActorSystem,
    middleware: Vec<SenderMiddleware>,
    sender_chain: Option<SenderFn>,
}

impl RootContext {
    pub(crate) fn new(system: ActorSystem) -> Self {
        Self {
            system,
            middleware: Vec::new(),
            sender_chain: None,
        }
    }

    /// Append a sender middleware to this root context; earlier additions
    /// wrap later ones.
    pub fn with_sender_middleware(mut self, middleware: SenderMiddleware) -> Self {
        self.middleware.push(middleware);
        self.sender_chain = compose_sender_chain(&self.middleware);
        self
    }

    /// The owning system.
    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Spawn a root actor with an auto-generated unique name.
    pub fn spawn(&self, props: Props) -> Result<Pid, SpawnError> {
        let name = self.system.registry().next_id();
        self.spawn_named(props, &name)
    }

    /// Spawn a root actor under an explicit name; an empty name
    /// auto-generates. Duplicate names fail with
    /// [`SpawnError::NameExists`].
    pub fn spawn_named(&self, props: Props, name: &str) -> Result<Pid, SpawnError> {
        let name = if name.is_empty() {
            self.system.registry().next_id()
        } else {
            name.to_string()
        };
        props.spawn(&self.system, &name, None)
    }

    /// Fire-and-forget send.
    pub fn send(&self, target: &Pid, message: Arc<dyn Message>) {
        self.send_user(target, MessageEnvelope::from_message(message));
    }

    /// Send an already built envelope.
    pub fn send_envelope(&self, target: &Pid, envelope: MessageEnvelope) {
        self.send_user(target, envelope);
    }

    /// Send with an explicit reply-to pid as the envelope's sender.
    pub fn request(&self, target: &Pid, message: Arc<dyn Message>, reply_to: &Pid) {
        let envelope = MessageEnvelope::from_message(message).with_sender(reply_to.clone());
        self.send_user(target, envelope);
    }

    /// Send with a one-shot future pid as the sender; the returned handle
    /// completes with the first reply, and faults on deadline or dead
    /// letter.
    pub fn request_future(
        &self,
        target: &Pid,
        message: Arc<dyn Message>,
        timeout: Duration,
    ) -> ActorFuture {
        let (future_pid, future) = spawn_future(&self.system, timeout);
        let envelope = MessageEnvelope::from_message(message).with_sender(future_pid);
        self.send_user(target, envelope);
        future
    }

    /// Stop `target` immediately, ahead of its pending user messages.
    pub fn stop(&self, target: &Pid) {
        target.stop(&self.system);
    }

    /// Stop `target`, returning a future resolving on its termination.
    pub fn stop_future(&self, target: &Pid, timeout: Duration) -> ActorFuture {
        let (future_pid, future) = spawn_future(&self.system, timeout);
        target.send_system_message(&self.system, SystemMessage::Watch(future_pid));
        target.stop(&self.system);
        future
    }

    /// Stop `target` after it drains user messages enqueued before the
    /// pill.
    pub fn poison(&self, target: &Pid) {
        target.send_user_message(&self.system, MessageEnvelope::new(PoisonPill));
    }

    /// Poison `target`, returning a future resolving on its termination.
    pub fn poison_future(&self, target: &Pid, timeout: Duration) -> ActorFuture {
        let (future_pid, future) = spawn_future(&self.system, timeout);
        target.send_system_message(&self.system, SystemMessage::Watch(future_pid));
        self.poison(target);
        future
    }

    fn send_user(&self, target: &Pid, envelope: MessageEnvelope) {
        match &self.sender_chain {
            Some(chain) => chain(&self.system, target, envelope),
            None => target.send_user_message(&self.system, envelope),
        }
    }
}

impl std::fmt::Debug for RootContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootContext")
            .field("system", &self.system)
            .field("sender_middleware", &self.middleware.len())
            .finish()
    }
}
