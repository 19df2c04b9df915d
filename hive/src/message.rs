/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Messages and message envelopes.
//!
//! Messages in Hive are dynamically typed: anything that is `Any + Debug +
//! Send + Sync` is a [`Message`], shared between actors as an
//! `Arc<dyn Message>` and downcast at the point of use. Envelopes pair a
//! message with its (optional) sender and headers; the runtime passes
//! envelopes, never bare messages, so that reply routing and middleware
//! observe a uniform shape.
//!
//! ```
//! # use std::sync::Arc;
//! # use hive::message::{Message, MessageEnvelope};
//! let envelope = MessageEnvelope::new("hello".to_string());
//! assert_eq!(envelope.downcast_ref::<String>().unwrap(), "hello");
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use crate::pid::Pid;

/// Message collects the requirements for values that can be deposited into
/// mailboxes. It is implemented for every eligible type.
pub trait Message: Any + Debug + Send + Sync {
    /// Upcast to [`Any`] for downcasting at use sites.
    fn as_any(&self) -> &dyn Any;
}

impl<M: Any + Debug + Send + Sync> Message for M {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An envelope carries a user message together with its sender and headers.
///
/// Envelopes are cheap to clone: the payload and header table are shared.
#[derive(Clone)]
pub struct MessageEnvelope {
    message: Arc<dyn Message>,
    sender: Option<Pid>,
    headers: Option<Arc<HashMap<String, String>>>,
    influences_receive_timeout: bool,
}

impl MessageEnvelope {
    /// Create a new envelope wrapping the provided message.
    pub fn new(message: impl Message) -> Self {
        Self::from_message(Arc::new(message))
    }

    /// Create a new envelope from an already shared message.
    pub fn from_message(message: Arc<dyn Message>) -> Self {
        Self {
            message,
            sender: None,
            headers: None,
            influences_receive_timeout: true,
        }
    }

    /// Attach a sender to this envelope. Replies issued by the receiving
    /// actor are routed to the sender.
    pub fn with_sender(mut self, sender: Pid) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Attach a header to this envelope.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let headers = Arc::make_mut(self.headers.get_or_insert_with(Default::default));
        headers.insert(key.into(), value.into());
        self
    }

    /// Mark this envelope as exempt from receive-timeout bookkeeping:
    /// delivering it neither stops nor resets the receiving actor's idle
    /// timer.
    pub fn without_timeout_influence(mut self) -> Self {
        self.influences_receive_timeout = false;
        self
    }

    /// The message carried by this envelope.
    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    /// The sender of this envelope, if one was attached.
    pub fn sender(&self) -> Option<&Pid> {
        self.sender.as_ref()
    }

    /// Look up a header by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref()?.get(key).map(String::as_str)
    }

    /// Tells whether the carried message is of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.message.as_any().is::<M>()
    }

    /// Downcast the carried message to a reference of type `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.message.as_any().downcast_ref::<M>()
    }

    pub(crate) fn influences_receive_timeout(&self) -> bool {
        self.influences_receive_timeout
    }
}

impl PartialEq for MessageEnvelope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.message, &other.message)
            && self.sender == other.sender
            && match (&self.headers, &other.headers) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b) || **a == **b,
                (None, None) => true,
                _ => false,
            }
            && self.influences_receive_timeout == other.influences_receive_timeout
    }
}

impl Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sender {
            Some(sender) => write!(f, "{} > {:?}", sender, self.message),
            None => write!(f, "_ > {:?}", self.message),
        }
    }
}

/// Delivered to an actor once, before any user message, after it has been
/// incarnated for the first time and after every re-incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started;

/// Delivered to an actor that is about to be disposed and re-created by its
/// supervisor. The old incarnation sees this message last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restarting;

/// Delivered to an actor that has begun stopping, before its children are
/// stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stopping;

/// Delivered to an actor after all of its children have terminated, as the
/// final message of its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stopped;

/// Injected by the idle timer when no influencing user message has been
/// processed for the configured duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveTimeout;

/// A user-queue stop request: the actor processes all user messages enqueued
/// ahead of the pill, then stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonPill;

/// The reason an actor terminated, carried by [`Terminated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The actor ran its lifecycle to completion. Also reported for
    /// watches that arrive after the termination: the registry remembers
    /// which ids have stopped.
    Stopped,
    /// The watched pid was never registered with this system.
    NotFound,
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

/// Delivered exactly once to each watcher of a terminated actor, and to its
/// parent.
#[derive(Debug, Clone)]
pub struct Terminated {
    /// The terminated actor.
    pub who: Pid,
    /// Why the termination notice was produced.
    pub reason: TerminateReason,
}

/// A liveness probe. The runtime answers it with [`Touched`] on behalf of
/// the receiving actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch;

/// The automatic reply to [`Touch`].
#[derive(Debug, Clone)]
pub struct Touched {
    /// The actor that was probed.
    pub who: Pid,
}

/// A message that carries its own reply. The receiving actor's `receive`
/// sees the envelope as usual; after it completes, the runtime responds with
/// the auto-generated reply.
#[derive(Clone)]
pub struct AutoRespond {
    message: Arc<dyn Message>,
    respond: Arc<dyn Fn(&Pid) -> Arc<dyn Message> + Send + Sync>,
}

impl AutoRespond {
    /// Wrap `message` with a reply factory invoked with the receiver's pid.
    pub fn new(
        message: impl Message,
        respond: impl Fn(&Pid) -> Arc<dyn Message> + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: Arc::new(message),
            respond: Arc::new(respond),
        }
    }

    /// The wrapped message.
    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    pub(crate) fn response_for(&self, who: &Pid) -> Arc<dyn Message> {
        (self.respond)(who)
    }
}

impl Debug for AutoRespond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AutoRespond({:?})", self.message)
    }
}

/// Returned to the sender of an envelope that was routed to the dead-letter
/// process, so that request futures fault promptly instead of timing out.
#[derive(Debug, Clone)]
pub struct DeadLetterResponse {
    /// The unresolvable destination.
    pub target: Pid,
}
