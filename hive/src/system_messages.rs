/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The system message protocol.
//!
//! System messages are the runtime's control plane: they travel on the
//! high-priority mailbox queue and are processed strictly before user
//! messages. They are produced and consumed by the runtime; user code
//! observes their effects through lifecycle messages delivered to
//! `receive`, never the signals themselves.

use std::fmt;
use std::fmt::Debug;

use crate::context::Context;
use crate::message::MessageEnvelope;
use crate::message::Terminated;
use crate::pid::Pid;
use crate::supervision::FailureReason;
use crate::supervision::RestartStatistics;

/// A control signal delivered on an actor's system queue.
pub enum SystemMessage {
    /// Start the actor: deliver `Started` to the fresh incarnation.
    Start,
    /// Stop the actor immediately, ahead of pending user messages.
    Stop,
    /// Dispose the current incarnation and re-create it.
    Restart,
    /// Register the carried pid as a watcher of this actor.
    Watch(Pid),
    /// Remove the carried pid from this actor's watchers.
    Unwatch(Pid),
    /// A watched actor (or child) terminated.
    Terminated(Terminated),
    /// A child actor failed; the receiving actor supervises it.
    Failure(Failure),
    /// Pause user-message delivery; system messages continue to flow.
    SuspendMailbox,
    /// Resume user-message delivery.
    ResumeMailbox,
    /// The idle timer elapsed.
    ReceiveTimeout,
    /// A captured continuation scheduled back onto its actor.
    Continuation(Continuation),
}

impl Debug for SystemMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Stop => write!(f, "Stop"),
            Self::Restart => write!(f, "Restart"),
            Self::Watch(pid) => write!(f, "Watch({})", pid),
            Self::Unwatch(pid) => write!(f, "Unwatch({})", pid),
            Self::Terminated(t) => write!(f, "Terminated({}, {})", t.who, t.reason),
            Self::Failure(failure) => write!(f, "Failure({}: {})", failure.who, failure.reason),
            Self::SuspendMailbox => write!(f, "SuspendMailbox"),
            Self::ResumeMailbox => write!(f, "ResumeMailbox"),
            Self::ReceiveTimeout => write!(f, "ReceiveTimeout"),
            Self::Continuation(c) => write!(f, "Continuation(generation={})", c.generation),
        }
    }
}

/// A child failure escalated to its supervisor. Carries everything a
/// supervision strategy needs to decide a directive.
#[derive(Debug, Clone)]
pub struct Failure {
    /// The failing actor.
    pub who: Pid,
    /// The failure cause.
    pub reason: FailureReason,
    /// The failing actor's restart window, shared with its context.
    pub restart_stats: RestartStatistics,
    /// The message being processed when the failure occurred, if any.
    pub message: Option<MessageEnvelope>,
}

/// The body of a scheduled continuation: runs on the owning actor with the
/// captured envelope restored for its duration.
pub type ContinuationAction = Box<dyn FnOnce(&mut dyn Context) + Send>;

/// A continuation captured by `reenter_after`, delivered back to its actor
/// as a system message once the awaited task completes.
pub struct Continuation {
    pub(crate) envelope: Option<MessageEnvelope>,
    pub(crate) generation: u64,
    pub(crate) action: ContinuationAction,
}

impl Continuation {
    pub(crate) fn new(
        envelope: Option<MessageEnvelope>,
        generation: u64,
        action: ContinuationAction,
    ) -> Self {
        Self {
            envelope,
            generation,
            action,
        }
    }
}
