/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The actor context: the per-actor state machine and operation table.
//!
//! An [`ActorContext`] owns a running actor: its instance, lifecycle state,
//! children and watchers, receive-timeout timer, and the current envelope.
//! It is registered as its mailbox's invoker, so every message the actor
//! observes flows through [`ActorContext::invoke_user_message`] or the
//! system-message handler here, strictly one at a time.
//!
//! The [`Context`] trait is the surface actors program against. It is
//! object safe so that context decorators can wrap it; an actor's `receive`
//! sees the outermost wrapper.
//!
//! Lifecycle transitions:
//!
//! | From      | Signal     | To         |
//! |-----------|------------|------------|
//! | (spawn)   | `Start`    | Alive      |
//! | Alive     | `Restart`  | Restarting |
//! | Alive     | `Stop`     | Stopping   |
//! | Restarting| last child terminates | Alive (new incarnation) |
//! | Stopping  | last child terminates | Stopped |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::Actor;
use crate::actor_system::ActorSystem;
use crate::future::spawn_future;
use crate::future::ActorFuture;
use crate::future::AskError;
use crate::mailbox::MessageInvoker;
use crate::message::AutoRespond;
use crate::message::Message;
use crate::message::MessageEnvelope;
use crate::message::PoisonPill;
use crate::message::ReceiveTimeout;
use crate::message::Restarting;
use crate::message::Started;
use crate::message::Stopped;
use crate::message::Stopping;
use crate::message::Terminated;
use crate::message::TerminateReason;
use crate::message::Touch;
use crate::message::Touched;
use crate::pid::Pid;
use crate::props::Props;
use crate::props::ReceiverFn;
use crate::props::SenderFn;
use crate::registry::SpawnError;
use crate::supervision::default_strategy;
use crate::supervision::FailureReason;
use crate::supervision::RestartStatistics;
use crate::supervision::Supervisor;
use crate::system_messages::Continuation;
use crate::system_messages::Failure;
use crate::system_messages::SystemMessage;

/// A continuation passed to [`Context::reenter_after`]: invoked on the
/// owning actor once the awaited future settles, with the captured envelope
/// restored for its duration.
pub type ReenterContinuation =
    Box<dyn FnOnce(&mut dyn Context, Result<MessageEnvelope, AskError>) + Send>;

/// The operation table available to an actor while it processes a message.
///
/// All sends are fire-and-forget and never block; request/response is
/// expressed through [`ActorFuture`]s.
pub trait Context: Send {
    /// The owning actor system.
    fn system(&self) -> &ActorSystem;

    /// This actor's pid.
    fn self_pid(&self) -> &Pid;

    /// The parent's pid, if this actor was spawned as a child.
    fn parent(&self) -> Option<&Pid>;

    /// The envelope currently being processed.
    fn envelope(&self) -> Option<&MessageEnvelope>;

    /// The message currently being processed.
    fn message(&self) -> Option<&Arc<dyn Message>>;

    /// The sender of the current envelope, if it carried one.
    fn sender(&self) -> Option<&Pid>;

    /// The pids of this actor's live children.
    fn children(&self) -> Vec<Pid>;

    /// A token cancelled when this actor reaches its terminal stop.
    fn cancellation_token(&self) -> CancellationToken;

    /// Fire-and-forget send.
    fn send(&self, target: &Pid, message: Arc<dyn Message>);

    /// Send with this actor as the envelope's sender, so the target can
    /// respond.
    fn request(&self, target: &Pid, message: Arc<dyn Message>);

    /// Send with an explicit reply-to pid as the envelope's sender.
    fn request_with_sender(&self, target: &Pid, message: Arc<dyn Message>, reply_to: &Pid);

    /// Send with a one-shot future pid as the sender; the returned handle
    /// completes with the first reply and faults on deadline or dead
    /// letter.
    fn request_future(
        &self,
        target: &Pid,
        message: Arc<dyn Message>,
        timeout: Duration,
    ) -> ActorFuture;

    /// Reply to the sender of the current envelope. Without a sender the
    /// reply is logged and routed to dead-letter.
    fn respond(&self, message: Arc<dyn Message>);

    /// Forward the current envelope, sender included, to another pid.
    fn forward(&self, target: &Pid);

    /// Spawn a child with an auto-generated unique name.
    fn spawn(&mut self, props: Props) -> Result<Pid, SpawnError>;

    /// Spawn a child under an explicit name; an empty name auto-generates.
    fn spawn_named(&mut self, props: Props, name: &str) -> Result<Pid, SpawnError>;

    /// Register for a [`Terminated`] notice when `target` stops. Watching
    /// an already stopped pid yields the notice immediately.
    fn watch(&self, target: &Pid);

    /// Remove a previously registered watch.
    fn unwatch(&self, target: &Pid);

    /// Stop `target` immediately, ahead of its pending user messages.
    fn stop(&self, target: &Pid);

    /// Stop `target` after it drains user messages enqueued before the
    /// pill.
    fn poison(&self, target: &Pid);

    /// As [`Context::stop`], returning a future that resolves when the
    /// target has terminated.
    fn stop_future(&self, target: &Pid, timeout: Duration) -> ActorFuture;

    /// As [`Context::poison`], returning a future that resolves when the
    /// target has terminated.
    fn poison_future(&self, target: &Pid, timeout: Duration) -> ActorFuture;

    /// Arm the idle timer: if no influencing user message is processed for
    /// `duration`, a [`ReceiveTimeout`] is delivered.
    fn set_receive_timeout(&mut self, duration: Duration);

    /// Disarm the idle timer.
    fn cancel_receive_timeout(&mut self);

    /// Schedule `continuation` to run on this actor when `future` settles,
    /// with the current envelope restored for its duration. Dropped if the
    /// actor restarts or stops before the future settles.
    fn reenter_after(&self, future: ActorFuture, continuation: ReenterContinuation);
}

/// The lifecycle states of an actor context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LifecycleState {
    Alive,
    Restarting,
    Stopping,
    Stopped,
}

/// Lazily initialized context state: most actors never watch, spawn, or arm
/// timers, and skip this allocation entirely.
struct ContextExtras {
    children: Vec<Pid>,
    watchers: Vec<Pid>,
    receive_timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
    restart_stats: RestartStatistics,
}

impl ContextExtras {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            watchers: Vec::new(),
            receive_timeout: None,
            timer: None,
            restart_stats: RestartStatistics::new(),
        }
    }
}

/// The per-actor state machine. One exists per spawned actor, owned by its
/// mailbox and driven exclusively from mailbox runs.
pub struct ActorContext {
    system: ActorSystem,
    props: Props,
    self_pid: Pid,
    parent: Option<Pid>,
    actor: Option<Box<dyn Actor>>,
    state: LifecycleState,
    envelope: Option<MessageEnvelope>,
    /// Incremented at every incarnation; continuations captured against an
    /// older generation are dropped at dispatch.
    generation: u64,
    receiver_chain: Option<ReceiverFn>,
    sender_chain: Option<SenderFn>,
    extras: Option<Box<ContextExtras>>,
    cancel: CancellationToken,
}

impl ActorContext {
    pub(crate) fn new(
        system: ActorSystem,
        props: Props,
        self_pid: Pid,
        parent: Option<Pid>,
    ) -> Self {
        let receiver_chain = props.receiver_chain();
        let sender_chain = props.sender_chain();
        let mut context = Self {
            system,
            props,
            self_pid,
            parent,
            actor: None,
            state: LifecycleState::Alive,
            envelope: None,
            generation: 0,
            receiver_chain,
            sender_chain,
            extras: None,
            cancel: CancellationToken::new(),
        };
        context.incarnate();
        context
    }

    fn incarnate(&mut self) {
        self.generation += 1;
        self.state = LifecycleState::Alive;
        self.actor = Some(self.props.produce(&self.system));
    }

    fn ensure_extras(&mut self) -> &mut ContextExtras {
        self.extras.get_or_insert_with(|| Box::new(ContextExtras::new()))
    }

    fn send_user(&self, target: &Pid, envelope: MessageEnvelope) {
        match &self.sender_chain {
            Some(chain) => chain(&self.system, target, envelope),
            None => target.send_user_message(&self.system, envelope),
        }
    }

    /// The undecorated receive path: unwrap control pills, hand the
    /// envelope to the actor, and apply auto-response.
    pub(crate) async fn default_receive(
        &mut self,
        envelope: MessageEnvelope,
    ) -> Result<(), anyhow::Error> {
        if envelope.is::<PoisonPill>() {
            let me = self.self_pid.clone();
            Context::stop(self, &me);
            return Ok(());
        }

        self.envelope = Some(envelope);
        let result = self.invoke_actor().await;

        if result.is_ok() {
            if let Some(envelope) = &self.envelope {
                if envelope.is::<Touch>() {
                    let who = self.self_pid.clone();
                    self.respond(Arc::new(Touched { who }));
                } else if let Some(auto) = envelope.downcast_ref::<AutoRespond>() {
                    let reply = auto.response_for(&self.self_pid);
                    self.respond(reply);
                }
            }
        }

        self.envelope = None;
        result
    }

    async fn invoke_actor(&mut self) -> Result<(), anyhow::Error> {
        let mut actor = self
            .actor
            .take()
            .ok_or_else(|| anyhow::anyhow!("{}: actor is not incarnated", self.self_pid))?;

        let decorators = self.props.context_decorators().to_vec();
        let result = {
            let actor = &mut actor;
            let this = &mut *self;
            let invocation = async move {
                if decorators.is_empty() {
                    actor.receive(this).await
                } else {
                    let mut decorated: Box<dyn Context + '_> =
                        Box::new(BaseContext { inner: this });
                    for decorator in &decorators {
                        decorated = decorator(decorated);
                    }
                    actor.receive(&mut *decorated).await
                }
            };
            AssertUnwindSafe(invocation).catch_unwind().await
        };
        self.actor = Some(actor);

        match result {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("panic payload cannot be downcast");
                Err(anyhow::anyhow!("receive panicked: {}", message))
            }
        }
    }

    async fn handle_start(&mut self) -> Result<(), anyhow::Error> {
        let started_at = Instant::now();
        let result = self
            .invoke_user_message(MessageEnvelope::new(Started))
            .await;

        let deadline = self
            .props
            .start_deadline()
            .unwrap_or_else(|| self.system.config().start_deadline);
        if !deadline.is_zero() {
            let took = started_at.elapsed();
            if took > deadline {
                if let Some(dropped) = self.system.start_deadline_throttle().admit() {
                    tracing::warn!(
                        actor = %self.self_pid,
                        took_ms = took.as_millis() as u64,
                        deadline_ms = deadline.as_millis() as u64,
                        suppressed_warnings = dropped,
                        "slow start handling"
                    );
                }
            }
        }
        result
    }

    async fn handle_stop(&mut self) -> Result<(), anyhow::Error> {
        if self.state >= LifecycleState::Stopping {
            return Ok(());
        }
        self.state = LifecycleState::Stopping;
        self.disarm_receive_timeout();
        self.invoke_user_message(MessageEnvelope::new(Stopping))
            .await?;
        self.stop_all_children();
        self.try_restart_or_terminate().await
    }

    async fn handle_restart(&mut self) -> Result<(), anyhow::Error> {
        if self.state >= LifecycleState::Stopping {
            return Ok(());
        }
        self.state = LifecycleState::Restarting;
        self.invoke_user_message(MessageEnvelope::new(Restarting))
            .await?;
        self.stop_all_children();
        self.try_restart_or_terminate().await
    }

    fn stop_all_children(&mut self) {
        let children = match &self.extras {
            Some(extras) => extras.children.clone(),
            None => return,
        };
        for child in children {
            child.stop(&self.system);
        }
    }

    /// Once every child has terminated, complete the pending restart or
    /// stop. The wait is event driven: each child's `Terminated` re-enters
    /// here.
    async fn try_restart_or_terminate(&mut self) -> Result<(), anyhow::Error> {
        let has_children = self
            .extras
            .as_ref()
            .is_some_and(|extras| !extras.children.is_empty());
        if has_children {
            return Ok(());
        }
        match self.state {
            LifecycleState::Restarting => self.restart().await,
            LifecycleState::Stopping => self.finalize_stop().await,
            _ => Ok(()),
        }
    }

    async fn restart(&mut self) -> Result<(), anyhow::Error> {
        self.disarm_receive_timeout();
        self.incarnate();
        self.self_pid
            .send_system_message(&self.system, SystemMessage::ResumeMailbox);
        self.invoke_user_message(MessageEnvelope::new(Started)).await
    }

    async fn finalize_stop(&mut self) -> Result<(), anyhow::Error> {
        // Unregister first: from this point every send targeting this pid
        // is routed to dead-letter.
        self.system.registry().remove(&self.self_pid);
        if self.parent.is_none() {
            self.system.deregister_root(&self.self_pid);
        }

        let result = self.invoke_user_message(MessageEnvelope::new(Stopped)).await;

        let notice = Terminated {
            who: self.self_pid.clone(),
            reason: TerminateReason::Stopped,
        };
        if let Some(extras) = &self.extras {
            for watcher in &extras.watchers {
                watcher
                    .send_system_message(&self.system, SystemMessage::Terminated(notice.clone()));
            }
        }
        if let Some(parent) = &self.parent {
            parent.send_system_message(&self.system, SystemMessage::Terminated(notice));
        }

        self.state = LifecycleState::Stopped;
        self.cancel.cancel();
        result
    }

    fn handle_watch(&mut self, watcher: Pid) {
        if self.state >= LifecycleState::Stopping {
            watcher.send_system_message(
                &self.system,
                SystemMessage::Terminated(Terminated {
                    who: self.self_pid.clone(),
                    reason: TerminateReason::Stopped,
                }),
            );
            return;
        }
        let extras = self.ensure_extras();
        if !extras.watchers.contains(&watcher) {
            extras.watchers.push(watcher);
        }
    }

    fn handle_unwatch(&mut self, watcher: &Pid) {
        if let Some(extras) = &mut self.extras {
            extras.watchers.retain(|w| w != watcher);
        }
    }

    async fn handle_terminated(&mut self, terminated: Terminated) -> Result<(), anyhow::Error> {
        if let Some(extras) = &mut self.extras {
            extras.children.retain(|child| child != &terminated.who);
        }
        self.invoke_user_message(MessageEnvelope::new(terminated))
            .await?;
        self.try_restart_or_terminate().await
    }

    fn handle_child_failure(&mut self, failure: Failure) {
        self.ensure_extras();
        let strategy = self
            .actor
            .as_ref()
            .and_then(|actor| actor.supervisor_strategy())
            .or_else(|| self.props.supervisor_strategy())
            .unwrap_or_else(default_strategy);
        let system = self.system.clone();
        strategy.handle_failure(
            &system,
            &*self,
            &failure.who,
            &failure.restart_stats,
            &failure.reason,
            failure.message.as_ref(),
        );
    }

    async fn handle_receive_timeout(&mut self) -> Result<(), anyhow::Error> {
        let armed = self
            .extras
            .as_ref()
            .and_then(|extras| extras.receive_timeout)
            .is_some();
        if !armed {
            return Ok(());
        }
        self.invoke_user_message(MessageEnvelope::new(ReceiveTimeout))
            .await
    }

    async fn handle_continuation(&mut self, continuation: Continuation) -> Result<(), anyhow::Error> {
        if continuation.generation != self.generation || self.state >= LifecycleState::Stopping {
            tracing::debug!(
                actor = %self.self_pid,
                captured = continuation.generation,
                current = self.generation,
                "dropping stale continuation"
            );
            return Ok(());
        }
        self.envelope = continuation.envelope;
        (continuation.action)(self);
        self.envelope = None;
        Ok(())
    }

    fn arm_receive_timeout(&mut self, duration: Duration) {
        let pid = self.self_pid.clone();
        let system = self.system.clone();
        let extras = self.ensure_extras();
        if let Some(timer) = extras.timer.take() {
            timer.abort();
        }
        extras.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            pid.send_system_message(&system, SystemMessage::ReceiveTimeout);
        }));
    }

    fn disarm_receive_timeout(&mut self) {
        if let Some(extras) = &mut self.extras {
            extras.receive_timeout = None;
            if let Some(timer) = extras.timer.take() {
                timer.abort();
            }
        }
    }

    fn stop_receive_timer(&mut self) {
        if let Some(extras) = &mut self.extras {
            if let Some(timer) = extras.timer.take() {
                timer.abort();
            }
        }
    }
}

#[async_trait]
impl MessageInvoker for ActorContext {
    async fn invoke_system_message(&mut self, message: SystemMessage) -> Result<(), anyhow::Error> {
        match message {
            SystemMessage::Start => self.handle_start().await,
            SystemMessage::Stop => self.handle_stop().await,
            SystemMessage::Restart => self.handle_restart().await,
            SystemMessage::Watch(watcher) => {
                self.handle_watch(watcher);
                Ok(())
            }
            SystemMessage::Unwatch(watcher) => {
                self.handle_unwatch(&watcher);
                Ok(())
            }
            SystemMessage::Terminated(terminated) => self.handle_terminated(terminated).await,
            SystemMessage::Failure(failure) => {
                self.handle_child_failure(failure);
                Ok(())
            }
            SystemMessage::ReceiveTimeout => self.handle_receive_timeout().await,
            SystemMessage::Continuation(continuation) => {
                self.handle_continuation(continuation).await
            }
            // Intercepted by the mailbox run loop; they never reach the
            // invoker.
            SystemMessage::SuspendMailbox | SystemMessage::ResumeMailbox => Ok(()),
        }
    }

    async fn invoke_user_message(
        &mut self,
        envelope: MessageEnvelope,
    ) -> Result<(), anyhow::Error> {
        if self.state == LifecycleState::Stopped {
            self.system
                .dead_letter()
                .send_user_message(&self.self_pid, envelope);
            return Ok(());
        }

        let influences = envelope.influences_receive_timeout();
        let armed = self
            .extras
            .as_ref()
            .and_then(|extras| extras.receive_timeout)
            .is_some();
        if armed && influences {
            self.stop_receive_timer();
        }

        let chain = self.receiver_chain.clone();
        let result = match chain {
            Some(chain) => chain(self, envelope).await,
            None => self.default_receive(envelope).await,
        };

        if influences {
            let rearm = self
                .extras
                .as_ref()
                .and_then(|extras| extras.receive_timeout);
            if let Some(duration) = rearm {
                self.arm_receive_timeout(duration);
            }
        }
        result
    }

    async fn escalate_failure(&mut self, reason: anyhow::Error, envelope: Option<MessageEnvelope>) {
        self.ensure_extras();
        Supervisor::escalate_failure(self, FailureReason::from(reason), envelope);
    }
}

impl Supervisor for ActorContext {
    fn children(&self) -> Vec<Pid> {
        self.extras
            .as_ref()
            .map(|extras| extras.children.clone())
            .unwrap_or_default()
    }

    fn resume_children(&self, pids: &[Pid]) {
        for pid in pids {
            pid.send_system_message(&self.system, SystemMessage::ResumeMailbox);
        }
    }

    fn restart_children(&self, pids: &[Pid]) {
        for pid in pids {
            pid.send_system_message(&self.system, SystemMessage::Restart);
        }
    }

    fn stop_children(&self, pids: &[Pid]) {
        for pid in pids {
            pid.send_system_message(&self.system, SystemMessage::Stop);
        }
    }

    fn escalate_failure(&self, reason: FailureReason, envelope: Option<MessageEnvelope>) {
        if self.system.config().developer_supervision_logging {
            tracing::error!(
                actor = %self.self_pid,
                %reason,
                message = ?envelope.as_ref().map(MessageEnvelope::message),
                "escalating failure"
            );
        }

        let restart_stats = self
            .extras
            .as_ref()
            .map(|extras| extras.restart_stats.clone())
            .unwrap_or_default();
        let failure = Failure {
            who: self.self_pid.clone(),
            reason,
            restart_stats,
            message: envelope,
        };

        self.self_pid
            .send_system_message(&self.system, SystemMessage::SuspendMailbox);
        match &self.parent {
            Some(parent) => {
                parent.send_system_message(&self.system, SystemMessage::Failure(failure));
            }
            None => {
                // No parent: the root guardian's default strategy decides.
                let guardian = RootGuardian {
                    system: self.system.clone(),
                };
                default_strategy().handle_failure(
                    &self.system,
                    &guardian,
                    &failure.who,
                    &failure.restart_stats,
                    &failure.reason,
                    failure.message.as_ref(),
                );
            }
        }
    }
}

/// The supervisor applied to actors with no parent. Directives are sent
/// straight to the failing pid; escalation has nowhere to go and is logged.
struct RootGuardian {
    system: ActorSystem,
}

impl Supervisor for RootGuardian {
    fn children(&self) -> Vec<Pid> {
        Vec::new()
    }

    fn resume_children(&self, pids: &[Pid]) {
        for pid in pids {
            pid.send_system_message(&self.system, SystemMessage::ResumeMailbox);
        }
    }

    fn restart_children(&self, pids: &[Pid]) {
        for pid in pids {
            pid.send_system_message(&self.system, SystemMessage::Restart);
        }
    }

    fn stop_children(&self, pids: &[Pid]) {
        for pid in pids {
            pid.send_system_message(&self.system, SystemMessage::Stop);
        }
    }

    fn escalate_failure(&self, reason: FailureReason, _envelope: Option<MessageEnvelope>) {
        tracing::error!(%reason, "failure escalated past the root guardian");
    }
}

impl Context for ActorContext {
    fn system(&self) -> &ActorSystem {
        &self.system
    }

    fn self_pid(&self) -> &Pid {
        &self.self_pid
    }

    fn parent(&self) -> Option<&Pid> {
        self.parent.as_ref()
    }

    fn envelope(&self) -> Option<&MessageEnvelope> {
        self.envelope.as_ref()
    }

    fn message(&self) -> Option<&Arc<dyn Message>> {
        self.envelope.as_ref().map(MessageEnvelope::message)
    }

    fn sender(&self) -> Option<&Pid> {
        self.envelope.as_ref().and_then(MessageEnvelope::sender)
    }

    fn children(&self) -> Vec<Pid> {
        Supervisor::children(self)
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn send(&self, target: &Pid, message: Arc<dyn Message>) {
        self.send_user(target, MessageEnvelope::from_message(message));
    }

    fn request(&self, target: &Pid, message: Arc<dyn Message>) {
        let envelope =
            MessageEnvelope::from_message(message).with_sender(self.self_pid.clone());
        self.send_user(target, envelope);
    }

    fn request_with_sender(&self, target: &Pid, message: Arc<dyn Message>, reply_to: &Pid) {
        let envelope = MessageEnvelope::from_message(message).with_sender(reply_to.clone());
        self.send_user(target, envelope);
    }

    fn request_future(
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

    fn respond(&self, message: Arc<dyn Message>) {
        match self.sender() {
            Some(sender) => {
                let sender = sender.clone();
                self.send_user(&sender, MessageEnvelope::from_message(message));
            }
            None => {
                tracing::info!(
                    actor = %self.self_pid,
                    "respond with no sender, routing to dead letter"
                );
                self.system
                    .dead_letter()
                    .send_user_message(&self.self_pid, MessageEnvelope::from_message(message));
            }
        }
    }

    fn forward(&self, target: &Pid) {
        if let Some(envelope) = &self.envelope {
            self.send_user(target, envelope.clone());
        }
    }

    fn spawn(&mut self, props: Props) -> Result<Pid, SpawnError> {
        let name = self.system.registry().next_id();
        self.spawn_named(props, &name)
    }

    fn spawn_named(&mut self, props: Props, name: &str) -> Result<Pid, SpawnError> {
        let name = if name.is_empty() {
            self.system.registry().next_id()
        } else {
            name.to_string()
        };
        let child_id = format!("{}/{}", self.self_pid.id(), name);
        let pid = props.spawn(&self.system, &child_id, Some(self.self_pid.clone()))?;
        self.ensure_extras().children.push(pid.clone());
        Ok(pid)
    }

    fn watch(&self, target: &Pid) {
        target.send_system_message(&self.system, SystemMessage::Watch(self.self_pid.clone()));
    }

    fn unwatch(&self, target: &Pid) {
        target.send_system_message(&self.system, SystemMessage::Unwatch(self.self_pid.clone()));
    }

    fn stop(&self, target: &Pid) {
        target.stop(&self.system);
    }

    fn poison(&self, target: &Pid) {
        target.send_user_message(&self.system, MessageEnvelope::new(PoisonPill));
    }

    fn stop_future(&self, target: &Pid, timeout: Duration) -> ActorFuture {
        let (future_pid, future) = spawn_future(&self.system, timeout);
        target.send_system_message(&self.system, SystemMessage::Watch(future_pid));
        target.stop(&self.system);
        future
    }

    fn poison_future(&self, target: &Pid, timeout: Duration) -> ActorFuture {
        let (future_pid, future) = spawn_future(&self.system, timeout);
        target.send_system_message(&self.system, SystemMessage::Watch(future_pid));
        self.poison(target);
        future
    }

    fn set_receive_timeout(&mut self, duration: Duration) {
        if duration < Duration::from_millis(1) {
            self.cancel_receive_timeout();
            return;
        }
        self.ensure_extras().receive_timeout = Some(duration);
        self.arm_receive_timeout(duration);
    }

    fn cancel_receive_timeout(&mut self) {
        self.disarm_receive_timeout();
    }

    fn reenter_after(&self, future: ActorFuture, continuation: ReenterContinuation) {
        let envelope = self.envelope.clone();
        let generation = self.generation;
        let pid = self.self_pid.clone();
        let system = self.system.clone();
        tokio::spawn(async move {
            let result = future.result().await;
            let action: crate::system_messages::ContinuationAction =
                Box::new(move |context: &mut dyn Context| continuation(context, result));
            pid.send_system_message(
                &system,
                SystemMessage::Continuation(Continuation::new(envelope, generation, action)),
            );
        });
    }
}

/// The innermost layer handed to context decorators: delegates every
/// operation to the real context.
struct BaseContext<'c> {
    inner: &'c mut ActorContext,
}

impl Context for BaseContext<'_> {
    fn system(&self) -> &ActorSystem {
        self.inner.system()
    }

    fn self_pid(&self) -> &Pid {
        self.inner.self_pid()
    }

    fn parent(&self) -> Option<&Pid> {
        self.inner.parent()
    }

    fn envelope(&self) -> Option<&MessageEnvelope> {
        self.inner.envelope()
    }

    fn message(&self) -> Option<&Arc<dyn Message>> {
        self.inner.message()
    }

    fn sender(&self) -> Option<&Pid> {
        self.inner.sender()
    }

    fn children(&self) -> Vec<Pid> {
        Context::children(self.inner)
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    fn send(&self, target: &Pid, message: Arc<dyn Message>) {
        self.inner.send(target, message);
    }

    fn request(&self, target: &Pid, message: Arc<dyn Message>) {
        self.inner.request(target, message);
    }

    fn request_with_sender(&self, target: &Pid, message: Arc<dyn Message>, reply_to: &Pid) {
        self.inner.request_with_sender(target, message, reply_to);
    }

    fn request_future(
        &self,
        target: &Pid,
        message: Arc<dyn Message>,
        timeout: Duration,
    ) -> ActorFuture {
        self.inner.request_future(target, message, timeout)
    }

    fn respond(&self, message: Arc<dyn Message>) {
        self.inner.respond(message);
    }

    fn forward(&self, target: &Pid) {
        self.inner.forward(target);
    }

    fn spawn(&mut self, props: Props) -> Result<Pid, SpawnError> {
        self.inner.spawn(props)
    }

    fn spawn_named(&mut self, props: Props, name: &str) -> Result<Pid, SpawnError> {
        self.inner.spawn_named(props, name)
    }

    fn watch(&self, target: &Pid) {
        self.inner.watch(target);
    }

    fn unwatch(&self, target: &Pid) {
        self.inner.unwatch(target);
    }

    fn stop(&self, target: &Pid) {
        self.inner.stop(target);
    }

    fn poison(&self, target: &Pid) {
        self.inner.poison(target);
    }

    fn stop_future(&self, target: &Pid, timeout: Duration) -> ActorFuture {
        self.inner.stop_future(target, timeout)
    }

    fn poison_future(&self, target: &Pid, timeout: Duration) -> ActorFuture {
        self.inner.poison_future(target, timeout)
    }

    fn set_receive_timeout(&mut self, duration: Duration) {
        self.inner.set_receive_timeout(duration);
    }

    fn cancel_receive_timeout(&mut self) {
        self.inner.cancel_receive_timeout();
    }

    fn reenter_after(&self, future: ActorFuture, continuation: ReenterContinuation) {
        self.inner.reenter_after(future, continuation);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Mutex;

    use super::*;
    use crate::props::ReceiverFn;
    use crate::props::ReceiverMiddleware;
    use crate::registry::SpawnError;

    struct EchoActor;

    #[async_trait]
    impl Actor for EchoActor {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            if let Some(text) = cx.message().and_then(|m| m.as_any().downcast_ref::<String>()) {
                let reply = text.clone();
                cx.respond(Arc::new(reply));
            }
            Ok(())
        }
    }

    struct CounterActor {
        count: u32,
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Actor for CounterActor {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            if cx.envelope().is_some_and(|e| e.is::<Started>()) {
                self.starts.fetch_add(1, AtomicOrdering::SeqCst);
                return Ok(());
            }
            match cx
                .message()
                .and_then(|m| m.as_any().downcast_ref::<String>())
                .map(String::as_str)
            {
                Some("inc") => self.count += 1,
                Some("boom") => anyhow::bail!("boom"),
                Some("get") => {
                    let count = self.count;
                    cx.respond(Arc::new(count));
                }
                _ => {}
            }
            Ok(())
        }
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn test_ask_echo() {
        let system = ActorSystem::new();
        let pid = system
            .root()
            .spawn(Props::from_producer(|_| Box::new(EchoActor)))
            .unwrap();

        let reply = system
            .root()
            .request_future(&pid, Arc::new("hi".to_string()), Duration::from_secs(1))
            .result()
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<String>().unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_restart_resets_state() {
        let system = ActorSystem::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let starts_clone = starts.clone();
        let pid = system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(CounterActor {
                    count: 0,
                    starts: starts_clone.clone(),
                })
            }))
            .unwrap();
        let root = system.root();

        root.send(&pid, Arc::new("inc".to_string()));
        root.send(&pid, Arc::new("inc".to_string()));
        let reply = root
            .request_future(&pid, Arc::new("get".to_string()), Duration::from_secs(1))
            .result()
            .await
            .unwrap();
        assert_eq!(*reply.downcast_ref::<u32>().unwrap(), 2);

        // The failure escalates to the root guardian, whose default
        // strategy restarts in place with a fresh incarnation.
        root.send(&pid, Arc::new("boom".to_string()));
        let reply = root
            .request_future(&pid, Arc::new("get".to_string()), Duration::from_secs(2))
            .result()
            .await
            .unwrap();
        assert_eq!(*reply.downcast_ref::<u32>().unwrap(), 0);
        assert_eq!(starts.load(AtomicOrdering::SeqCst), 2);
    }

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Actor for Recorder {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            if let Some(text) = cx.message().and_then(|m| m.as_any().downcast_ref::<String>()) {
                self.log.lock().unwrap().push(text.clone());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poison_pill_runs_behind_earlier_user_messages() {
        let system = ActorSystem::new();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let dead: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let dead_clone = dead.clone();
        let _sub = system
            .event_stream()
            .subscribe::<crate::process::DeadLetterEvent>(move |event| {
                if let Some(text) = event.message.as_any().downcast_ref::<String>() {
                    dead_clone.lock().unwrap().push(text.clone());
                }
            });

        let log_clone = log.clone();
        let pid = system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(Recorder {
                    log: log_clone.clone(),
                })
            }))
            .unwrap();
        let root = system.root();

        root.send(&pid, Arc::new("a".to_string()));
        root.send(&pid, Arc::new("b".to_string()));
        root.poison(&pid);
        root.send(&pid, Arc::new("c".to_string()));

        wait_until("c to reach dead letter", || {
            dead.lock().unwrap().contains(&"c".to_string())
        })
        .await;
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_poison_on_drained_mailbox_stops() {
        let system = ActorSystem::new();
        let pid = system
            .root()
            .spawn(Props::from_producer(|_| Box::new(EchoActor)))
            .unwrap();
        let envelope = system
            .root()
            .poison_future(&pid, Duration::from_secs(2))
            .result()
            .await
            .unwrap();
        let notice = envelope.downcast_ref::<Terminated>().unwrap();
        assert_eq!(notice.who, pid);
        assert_eq!(notice.reason, TerminateReason::Stopped);
    }

    #[tokio::test]
    async fn test_watch_is_notified_exactly_once_on_stop() {
        let system = ActorSystem::new();
        let pid = system
            .root()
            .spawn(Props::from_producer(|_| Box::new(EchoActor)))
            .unwrap();

        let (watcher, notice) = spawn_future(&system, Duration::from_secs(2));
        pid.send_system_message(&system, SystemMessage::Watch(watcher));
        system.root().stop(&pid);

        let envelope = notice.result().await.unwrap();
        let terminated = envelope.downcast_ref::<Terminated>().unwrap();
        assert_eq!(terminated.who, pid);
        assert_eq!(terminated.reason, TerminateReason::Stopped);
    }

    #[tokio::test]
    async fn test_watch_after_termination_yields_immediate_notice() {
        let system = ActorSystem::new();
        let pid = system
            .root()
            .spawn(Props::from_producer(|_| Box::new(EchoActor)))
            .unwrap();
        system
            .root()
            .stop_future(&pid, Duration::from_secs(2))
            .result()
            .await
            .unwrap();

        let (watcher, notice) = spawn_future(&system, Duration::from_secs(2));
        pid.send_system_message(&system, SystemMessage::Watch(watcher));
        let envelope = notice.result().await.unwrap();
        let terminated = envelope.downcast_ref::<Terminated>().unwrap();
        assert_eq!(terminated.who, pid);
        assert_eq!(terminated.reason, TerminateReason::Stopped);

        // A pid this system never registered is another matter entirely.
        let unknown = Pid::new(system.address(), "never-registered");
        let (watcher, notice) = spawn_future(&system, Duration::from_secs(2));
        unknown.send_system_message(&system, SystemMessage::Watch(watcher));
        let envelope = notice.result().await.unwrap();
        let terminated = envelope.downcast_ref::<Terminated>().unwrap();
        assert_eq!(terminated.who, unknown);
        assert_eq!(terminated.reason, TerminateReason::NotFound);
    }

    #[tokio::test]
    async fn test_unwatch_before_termination_suppresses_notice() {
        let system = ActorSystem::new();
        let pid = system
            .root()
            .spawn(Props::from_producer(|_| Box::new(EchoActor)))
            .unwrap();

        let (watcher, notice) = spawn_future(&system, Duration::from_millis(300));
        pid.send_system_message(&system, SystemMessage::Watch(watcher.clone()));
        pid.send_system_message(&system, SystemMessage::Unwatch(watcher));
        system.root().stop(&pid);

        assert_eq!(notice.result().await, Err(AskError::Timeout));
    }

    struct ParentActor {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Actor for ParentActor {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            let envelope = match cx.envelope() {
                Some(envelope) => envelope.clone(),
                None => return Ok(()),
            };
            if envelope.is::<Started>() {
                let log = self.log.clone();
                cx.spawn_named(
                    Props::from_producer(move |_| {
                        Box::new(LifecycleChild { log: log.clone() })
                    }),
                    "child",
                )?;
                self.log.lock().unwrap().push("parent:started".to_string());
            } else if envelope.is::<Stopped>() {
                self.log.lock().unwrap().push("parent:stopped".to_string());
            }
            Ok(())
        }
    }

    struct LifecycleChild {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Actor for LifecycleChild {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            if cx.envelope().is_some_and(|e| e.is::<Stopped>()) {
                self.log.lock().unwrap().push("child:stopped".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_children_stop_before_parent_finalizes() {
        let system = ActorSystem::new();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let pid = system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(ParentActor {
                    log: log_clone.clone(),
                })
            }))
            .unwrap();

        wait_until("parent start", || {
            log.lock().unwrap().contains(&"parent:started".to_string())
        })
        .await;

        system
            .root()
            .stop_future(&pid, Duration::from_secs(2))
            .result()
            .await
            .unwrap();

        let log = log.lock().unwrap();
        let child_stopped = log.iter().position(|e| e == "child:stopped").unwrap();
        let parent_stopped = log.iter().position(|e| e == "parent:stopped").unwrap();
        assert!(
            child_stopped < parent_stopped,
            "parent finalized before its child: {:?}",
            *log
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_fails_spawn() {
        let system = ActorSystem::new();
        let root = system.root();
        root.spawn_named(Props::from_producer(|_| Box::new(EchoActor)), "singleton")
            .unwrap();
        assert_eq!(
            root.spawn_named(Props::from_producer(|_| Box::new(EchoActor)), "singleton"),
            Err(SpawnError::NameExists("singleton".to_string()))
        );
    }

    struct TimerActor {
        fires: Arc<AtomicUsize>,
        timeout: Duration,
    }

    #[async_trait]
    impl Actor for TimerActor {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            let envelope = match cx.envelope() {
                Some(envelope) => envelope.clone(),
                None => return Ok(()),
            };
            if envelope.is::<Started>() {
                cx.set_receive_timeout(self.timeout);
            } else if envelope.is::<ReceiveTimeout>() {
                self.fires.fetch_add(1, AtomicOrdering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_receive_timeout_fires_when_idle() {
        let system = ActorSystem::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_clone = fires.clone();
        system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(TimerActor {
                    fires: fires_clone.clone(),
                    timeout: Duration::from_millis(100),
                })
            }))
            .unwrap();

        wait_until("idle timer to fire", || fires.load(AtomicOrdering::SeqCst) >= 2).await;
    }

    #[tokio::test]
    async fn test_receive_timeout_reset_by_influencing_messages() {
        let system = ActorSystem::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_clone = fires.clone();
        let pid = system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(TimerActor {
                    fires: fires_clone.clone(),
                    timeout: Duration::from_millis(700),
                })
            }))
            .unwrap();

        // A steady stream of influencing messages keeps resetting the
        // timer.
        for _ in 0..10 {
            system.root().send(&pid, Arc::new("busy".to_string()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fires.load(AtomicOrdering::SeqCst), 0);

        // Marked envelopes do not touch the timer, so it fires despite the
        // traffic.
        for _ in 0..10 {
            pid.send_user_message(
                &system,
                MessageEnvelope::new("noise".to_string()).without_timeout_influence(),
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(fires.load(AtomicOrdering::SeqCst) >= 1);
    }

    struct PipelineActor {
        downstream: Pid,
    }

    #[async_trait]
    impl Actor for PipelineActor {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            let is_go = cx
                .message()
                .and_then(|m| m.as_any().downcast_ref::<String>())
                .is_some_and(|text| text == "go");
            if is_go {
                let future = cx.request_future(
                    &self.downstream,
                    Arc::new("ping".to_string()),
                    Duration::from_secs(1),
                );
                cx.reenter_after(
                    future,
                    Box::new(|ctx: &mut dyn Context, result| {
                        let text = result
                            .ok()
                            .and_then(|envelope| envelope.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "failed".to_string());
                        // The original envelope is restored, so the reply
                        // reaches the "go" sender.
                        ctx.respond(Arc::new(format!("done:{}", text)));
                    }),
                );
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reenter_after_restores_the_original_envelope() {
        let system = ActorSystem::new();
        let echo = system
            .root()
            .spawn(Props::from_producer(|_| Box::new(EchoActor)))
            .unwrap();
        let pipeline = system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(PipelineActor {
                    downstream: echo.clone(),
                })
            }))
            .unwrap();

        let reply = system
            .root()
            .request_future(&pipeline, Arc::new("go".to_string()), Duration::from_secs(2))
            .result()
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<String>().unwrap(), "done:ping");
    }

    #[tokio::test]
    async fn test_stale_continuation_is_dropped() {
        let system = ActorSystem::new();
        let props = Props::from_producer(|_| Box::new(EchoActor));
        let pid = Pid::new(system.address(), "manual");
        let mut context = ActorContext::new(system, props, pid, None);

        let hit = Arc::new(AtomicUsize::new(0));

        // Captured against a generation that predates the current
        // incarnation: dropped.
        let hit_clone = hit.clone();
        let stale = Continuation::new(
            None,
            context.generation - 1,
            Box::new(move |_: &mut dyn Context| {
                hit_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );
        context
            .invoke_system_message(SystemMessage::Continuation(stale))
            .await
            .unwrap();
        assert_eq!(hit.load(AtomicOrdering::SeqCst), 0);

        let hit_clone = hit.clone();
        let fresh = Continuation::new(
            None,
            context.generation,
            Box::new(move |_: &mut dyn Context| {
                hit_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );
        context
            .invoke_system_message(SystemMessage::Continuation(fresh))
            .await
            .unwrap();
        assert_eq!(hit.load(AtomicOrdering::SeqCst), 1);
    }

    struct SupervisedParent {
        child: Option<Pid>,
        child_starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Actor for SupervisedParent {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            let envelope = match cx.envelope() {
                Some(envelope) => envelope.clone(),
                None => return Ok(()),
            };
            if envelope.is::<Started>() {
                let starts = self.child_starts.clone();
                let child = cx.spawn_named(
                    Props::from_producer(move |_| {
                        Box::new(CounterActor {
                            count: 0,
                            starts: starts.clone(),
                        })
                    }),
                    "worker",
                )?;
                self.child = Some(child);
            } else if let Some(text) = envelope.downcast_ref::<String>() {
                if let Some(child) = &self.child {
                    cx.send(child, Arc::new(text.clone()));
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_parent_strategy_restarts_failing_child() {
        let system = ActorSystem::new();
        let child_starts = Arc::new(AtomicUsize::new(0));
        let starts_clone = child_starts.clone();
        let parent = system
            .root()
            .spawn(Props::from_producer(move |_| {
                Box::new(SupervisedParent {
                    child: None,
                    child_starts: starts_clone.clone(),
                })
            }))
            .unwrap();

        wait_until("child to start", || {
            child_starts.load(AtomicOrdering::SeqCst) == 1
        })
        .await;
        system.root().send(&parent, Arc::new("boom".to_string()));
        wait_until("child to restart", || {
            child_starts.load(AtomicOrdering::SeqCst) == 2
        })
        .await;
    }

    #[tokio::test]
    async fn test_receiver_middleware_observes_every_user_message() {
        let system = ActorSystem::new();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = observed.clone();
        let middleware: ReceiverMiddleware = Arc::new(move |next: ReceiverFn| {
            let observed = observed_clone.clone();
            let wrapped: ReceiverFn =
                Arc::new(move |context: &mut ActorContext, envelope: MessageEnvelope| {
                    observed.fetch_add(1, AtomicOrdering::SeqCst);
                    next(context, envelope)
                });
            wrapped
        });

        let pid = system
            .root()
            .spawn(
                Props::from_producer(|_| Box::new(EchoActor))
                    .with_receiver_middleware(middleware),
            )
            .unwrap();

        let root = system.root();
        for _ in 0..3 {
            root.request_future(&pid, Arc::new("m".to_string()), Duration::from_secs(1))
                .result()
                .await
                .unwrap();
        }
        // Started plus the three user sends.
        assert_eq!(observed.load(AtomicOrdering::SeqCst), 4);
    }
}
