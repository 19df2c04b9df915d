/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Processes: the mailbox endpoints addressed by pids.
//!
//! A process exposes exactly two delivery operations, one per mailbox queue.
//! The runtime provides two implementations here: [`ActorProcess`], backed by
//! an actor's mailbox, and [`DeadLetterProcess`], the sink for messages whose
//! destination is unknown or stopped. Futures and routers provide their own
//! process implementations in their modules.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::actor_system::WeakActorSystem;
use crate::mailbox::Mailbox;
use crate::message::DeadLetterResponse;
use crate::message::Message;
use crate::message::MessageEnvelope;
use crate::message::Terminated;
use crate::message::TerminateReason;
use crate::pid::Pid;
use crate::system_messages::SystemMessage;

/// The mailbox endpoint addressed by a [`Pid`]. Delivery never blocks; both
/// operations enqueue and return.
pub trait Process: Send + Sync {
    /// Deliver a user message envelope to this process.
    fn send_user_message(&self, target: &Pid, envelope: MessageEnvelope);

    /// Deliver a system message to this process.
    fn send_system_message(&self, target: &Pid, message: SystemMessage);

    /// Request that this process stop immediately.
    fn stop(&self, target: &Pid) {
        self.send_system_message(target, SystemMessage::Stop);
    }

    /// Tells whether this process has terminated. Dead handles are never
    /// cached by pids.
    fn is_dead(&self) -> bool {
        false
    }

    /// Mark this process as terminated. Called by the registry on removal.
    fn mark_dead(&self) {}
}

/// A shared handle to a process.
pub type ProcessHandle = Arc<dyn Process>;

/// The process backing a spawned actor: posts into the actor's mailbox.
#[derive(Debug)]
pub(crate) struct ActorProcess {
    mailbox: Mailbox,
    dead: AtomicBool,
}

impl ActorProcess {
    pub(crate) fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox,
            dead: AtomicBool::new(false),
        }
    }
}

impl Process for ActorProcess {
    fn send_user_message(&self, target: &Pid, envelope: MessageEnvelope) {
        if let Err(err) = self.mailbox.post_user(envelope) {
            tracing::warn!("{}: dropping user message: {}", target, err);
        }
    }

    fn send_system_message(&self, target: &Pid, message: SystemMessage) {
        if let Err(err) = self.mailbox.post_system(message) {
            tracing::warn!("{}: dropping system message: {}", target, err);
        }
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

/// Published on the event stream for every message that reached the
/// dead-letter process.
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    /// The unresolvable destination pid.
    pub pid: Pid,
    /// The undeliverable message.
    pub message: Arc<dyn Message>,
    /// The sender of the message, if the envelope carried one.
    pub sender: Option<Pid>,
}

/// The sink for messages to unregistered or stopped pids.
///
/// Every delivery is published as a [`DeadLetterEvent`]. Envelopes that
/// carry a sender are answered with [`DeadLetterResponse`] so that pending
/// request futures fault instead of running out their deadline, and watch
/// requests are answered with an immediate [`Terminated`] notice.
#[derive(Debug)]
pub(crate) struct DeadLetterProcess {
    system: WeakActorSystem,
}

impl DeadLetterProcess {
    pub(crate) fn new(system: WeakActorSystem) -> Self {
        Self { system }
    }
}

impl Process for DeadLetterProcess {
    fn send_user_message(&self, target: &Pid, envelope: MessageEnvelope) {
        let Some(system) = self.system.upgrade() else {
            return;
        };
        system.event_stream().publish(&DeadLetterEvent {
            pid: target.clone(),
            message: envelope.message().clone(),
            sender: envelope.sender().cloned(),
        });

        let loggable =
            envelope.sender().is_none() || system.config().dead_letter_request_logging;
        if loggable {
            if let Some(dropped) = system.dead_letter_throttle().admit() {
                tracing::info!(
                    dest = %target,
                    message = ?envelope.message(),
                    dropped_log_lines = dropped,
                    "message routed to dead letter"
                );
            }
        }

        // Answer requests so the sender's future faults promptly. A
        // dead-letter response itself is never answered, which bounds the
        // exchange to a single hop.
        if !envelope.is::<DeadLetterResponse>() {
            if let Some(sender) = envelope.sender() {
                sender.send_user_message(
                    &system,
                    MessageEnvelope::new(DeadLetterResponse {
                        target: target.clone(),
                    }),
                );
            }
        }
    }

    fn send_system_message(&self, target: &Pid, message: SystemMessage) {
        let Some(system) = self.system.upgrade() else {
            return;
        };
        match message {
            // Watching a pid that is already gone yields an immediate
            // termination notice. The registry remembers which ids were
            // registered and have stopped, so the notice carries the same
            // reason an earlier watcher would have seen.
            SystemMessage::Watch(watcher) => {
                let reason = if system.registry().has_stopped(target) {
                    TerminateReason::Stopped
                } else {
                    TerminateReason::NotFound
                };
                watcher.send_system_message(
                    &system,
                    SystemMessage::Terminated(Terminated {
                        who: target.clone(),
                        reason,
                    }),
                );
            }
            other => {
                tracing::debug!("{}: dead letter ignoring system message {:?}", target, other);
            }
        }
    }

    fn is_dead(&self) -> bool {
        // Never cached in pids: resolution must re-check the registry, which
        // is what makes late registration and resolver chains observable.
        true
    }
}
