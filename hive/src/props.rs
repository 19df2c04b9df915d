/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Props: the immutable recipe from which actors are spawned.
//!
//! A props bundles the actor producer with everything the runtime needs to
//! host it: the mailbox factory, the supervisor strategy its children will
//! see, middleware chains for the receive and send paths, context
//! decorators, and the spawner itself. Props are cheap to clone and safe to
//! reuse across spawns.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::actor::Actor;
use crate::actor_system::ActorSystem;
use crate::context::ActorContext;
use crate::context::Context;
use crate::mailbox::tokio_dispatcher;
use crate::mailbox::InvokerHandle;
use crate::mailbox::Mailbox;
use crate::message::MessageEnvelope;
use crate::pid::Pid;
use crate::process::ActorProcess;
use crate::registry::SpawnError;
use crate::supervision::SupervisorStrategy;
use crate::system_messages::SystemMessage;

/// Produces a fresh actor instance for each incarnation.
pub type Producer = Arc<dyn Fn(&ActorSystem) -> Box<dyn Actor> + Send + Sync>;

/// Produces the mailbox an actor is served from, given the configured
/// throughput.
pub type MailboxProducer = Arc<dyn Fn(usize) -> Mailbox + Send + Sync>;

/// The receive path: processes one envelope against the actor context.
pub type ReceiverFn = Arc<
    dyn for<'a> Fn(
            &'a mut ActorContext,
            MessageEnvelope,
        ) -> BoxFuture<'a, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// Wraps the receive path; the chain composes outermost-first.
pub type ReceiverMiddleware = Arc<dyn Fn(ReceiverFn) -> ReceiverFn + Send + Sync>;

/// The send path: posts one envelope towards a target pid.
pub type SenderFn = Arc<dyn Fn(&ActorSystem, &Pid, MessageEnvelope) + Send + Sync>;

/// Wraps the send path; the chain composes outermost-first.
pub type SenderMiddleware = Arc<dyn Fn(SenderFn) -> SenderFn + Send + Sync>;

/// Wraps the context seen by the actor's `receive`. The actor observes the
/// outermost wrapper.
pub type ContextDecorator =
    Arc<dyn for<'a> Fn(Box<dyn Context + 'a>) -> Box<dyn Context + 'a> + Send + Sync>;

/// Creates the process, context, and mailbox for a spawn and registers them.
pub type Spawner = Arc<
    dyn Fn(&ActorSystem, &str, &Props, Option<Pid>) -> Result<Pid, SpawnError> + Send + Sync,
>;

/// An immutable actor construction recipe.
#[derive(Clone)]
pub struct Props {
    producer: Producer,
    mailbox_producer: Option<MailboxProducer>,
    supervisor_strategy: Option<Arc<dyn SupervisorStrategy>>,
    spawner: Option<Spawner>,
    receiver_middleware: Vec<ReceiverMiddleware>,
    sender_middleware: Vec<SenderMiddleware>,
    context_decorators: Vec<ContextDecorator>,
    start_deadline: Option<Duration>,
    throughput: Option<usize>,
}

impl Props {
    /// Create props from an actor producer.
    pub fn from_producer(
        producer: impl Fn(&ActorSystem) -> Box<dyn Actor> + Send + Sync + 'static,
    ) -> Self {
        Self {
            producer: Arc::new(producer),
            mailbox_producer: None,
            supervisor_strategy: None,
            spawner: None,
            receiver_middleware: Vec::new(),
            sender_middleware: Vec::new(),
            context_decorators: Vec::new(),
            start_deadline: None,
            throughput: None,
        }
    }

    /// Use a custom mailbox factory.
    pub fn with_mailbox(
        mut self,
        producer: impl Fn(usize) -> Mailbox + Send + Sync + 'static,
    ) -> Self {
        self.mailbox_producer = Some(Arc::new(producer));
        self
    }

    /// Set the strategy this actor applies to failures of its children.
    pub fn with_supervisor_strategy(mut self, strategy: Arc<dyn SupervisorStrategy>) -> Self {
        self.supervisor_strategy = Some(strategy);
        self
    }

    /// Use a custom spawner.
    pub fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Append a receiver middleware; earlier additions wrap later ones.
    pub fn with_receiver_middleware(mut self, middleware: ReceiverMiddleware) -> Self {
        self.receiver_middleware.push(middleware);
        self
    }

    /// Append a sender middleware; earlier additions wrap later ones.
    pub fn with_sender_middleware(mut self, middleware: SenderMiddleware) -> Self {
        self.sender_middleware.push(middleware);
        self
    }

    /// Append a context decorator; the actor sees the outermost wrapper.
    pub fn with_context_decorator(mut self, decorator: ContextDecorator) -> Self {
        self.context_decorators.push(decorator);
        self
    }

    /// Warn when `Started` handling exceeds this deadline, overriding the
    /// system default.
    pub fn with_start_deadline(mut self, deadline: Duration) -> Self {
        self.start_deadline = Some(deadline);
        self
    }

    /// Override the mailbox's user messages per run.
    pub fn with_throughput(mut self, throughput: usize) -> Self {
        self.throughput = Some(throughput);
        self
    }

    pub(crate) fn produce(&self, system: &ActorSystem) -> Box<dyn Actor> {
        (self.producer)(system)
    }

    pub(crate) fn supervisor_strategy(&self) -> Option<Arc<dyn SupervisorStrategy>> {
        self.supervisor_strategy.clone()
    }

    pub(crate) fn start_deadline(&self) -> Option<Duration> {
        self.start_deadline
    }

    pub(crate) fn context_decorators(&self) -> &[ContextDecorator] {
        &self.context_decorators
    }

    /// The composed receive chain, if any middleware is configured. The
    /// undecorated path invokes the actor directly with no allocation.
    pub(crate) fn receiver_chain(&self) -> Option<ReceiverFn> {
        if self.receiver_middleware.is_empty() {
            return None;
        }
        let tail: ReceiverFn = Arc::new(receive_tail);
        Some(
            self.receiver_middleware
                .iter()
                .rev()
                .fold(tail, |next, middleware| middleware(next)),
        )
    }

    /// The composed send chain, if any middleware is configured.
    pub(crate) fn sender_chain(&self) -> Option<SenderFn> {
        compose_sender_chain(&self.sender_middleware)
    }

    /// Spawn an actor from this recipe under `name`.
    pub(crate) fn spawn(
        &self,
        system: &ActorSystem,
        name: &str,
        parent: Option<Pid>,
    ) -> Result<Pid, SpawnError> {
        match &self.spawner {
            Some(spawner) => spawner(system, name, self, parent),
            None => default_spawn(system, name, self, parent),
        }
    }
}

impl std::fmt::Debug for Props {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Props")
            .field("receiver_middleware", &self.receiver_middleware.len())
            .field("sender_middleware", &self.sender_middleware.len())
            .field("context_decorators", &self.context_decorators.len())
            .field("start_deadline", &self.start_deadline)
            .field("throughput", &self.throughput)
            .finish_non_exhaustive()
    }
}

fn receive_tail(
    context: &mut ActorContext,
    envelope: MessageEnvelope,
) -> BoxFuture<'_, Result<(), anyhow::Error>> {
    Box::pin(context.default_receive(envelope))
}

fn send_tail(system: &ActorSystem, target: &Pid, envelope: MessageEnvelope) {
    target.send_user_message(system, envelope);
}

/// Compose a sender middleware list around the direct send path. Returns
/// `None` for an empty list so callers can keep the zero-allocation path.
pub(crate) fn compose_sender_chain(middleware: &[SenderMiddleware]) -> Option<SenderFn> {
    if middleware.is_empty() {
        return None;
    }
    let tail: SenderFn = Arc::new(send_tail);
    Some(middleware.iter().rev().fold(tail, |next, mw| mw(next)))
}

/// The default spawner: registers an [`ActorProcess`], builds the context,
/// wires the mailbox, and kicks off the start sequence.
pub(crate) fn default_spawn(
    system: &ActorSystem,
    name: &str,
    props: &Props,
    parent: Option<Pid>,
) -> Result<Pid, SpawnError> {
    let throughput = props
        .throughput
        .unwrap_or_else(|| system.config().throughput);
    let mailbox = match &props.mailbox_producer {
        Some(producer) => producer(throughput),
        None => Mailbox::unbounded(throughput),
    };

    let process = Arc::new(ActorProcess::new(mailbox.clone()));
    let pid = system.registry().add(name, process)?;
    if parent.is_none() {
        system.register_root(&pid);
    }

    let context = ActorContext::new(system.clone(), props.clone(), pid.clone(), parent);
    let invoker: InvokerHandle = Arc::new(tokio::sync::Mutex::new(context));
    mailbox.register_handlers(invoker, tokio_dispatcher());

    if let Err(err) = mailbox.post_system(SystemMessage::Start) {
        tracing::error!("{}: could not post start signal: {}", pid, err);
    }
    mailbox.start();
    Ok(pid)
}
