/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mailboxes: the per-actor message buffers and dispatcher.
//!
//! A mailbox owns two FIFO queues, a high-priority system queue and a user
//! queue, plus two flags: `running`, the single-consumer exclusion token,
//! and `suspended`, which pauses user-message delivery. Posting enqueues and
//! then attempts to transition `running` from false to true; the winner
//! hands a run to the dispatcher, everyone else returns because the
//! in-flight run will observe their message.
//!
//! Within a run, the system queue is drained before any user message is
//! taken, and each user invocation is awaited to completion before the next
//! begins. That pair of properties is what the rest of the runtime builds
//! on: signals outrank work, and an actor is strictly sequential.

use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use futures::future::BoxFuture;

use crate::message::MessageEnvelope;
use crate::system_messages::SystemMessage;

/// Errors produced while posting to a mailbox.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The bounded user queue is at capacity.
    #[error("mailbox full")]
    Full,
    /// The mailbox has been torn down.
    #[error("mailbox closed")]
    Closed,
}

/// Executes mailbox runs. The default dispatcher spawns onto the tokio
/// executor; tests may substitute their own.
pub type Dispatcher = Arc<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>;

/// The default dispatcher: hand the run to the tokio executor.
pub fn tokio_dispatcher() -> Dispatcher {
    Arc::new(|run| {
        tokio::spawn(run);
    })
}

/// The mailbox's view of an actor: one entry point per queue, plus the
/// escalation hook invoked when either entry point faults.
#[async_trait]
pub trait MessageInvoker: Send {
    /// Process one system message.
    async fn invoke_system_message(&mut self, message: SystemMessage) -> Result<(), anyhow::Error>;

    /// Process one user message envelope, running it to completion.
    async fn invoke_user_message(&mut self, envelope: MessageEnvelope)
        -> Result<(), anyhow::Error>;

    /// A handler faulted: wrap the failure for supervision. The invoker is
    /// expected to suspend its own mailbox as part of escalation.
    async fn escalate_failure(&mut self, reason: anyhow::Error, envelope: Option<MessageEnvelope>);
}

/// A shared, registered invoker guarded by the run's exclusive lock.
pub type InvokerHandle = Arc<tokio::sync::Mutex<dyn MessageInvoker>>;

struct MailboxInner {
    system_tx: Sender<SystemMessage>,
    system_rx: Receiver<SystemMessage>,
    user_tx: Sender<MessageEnvelope>,
    user_rx: Receiver<MessageEnvelope>,
    running: AtomicBool,
    suspended: AtomicBool,
    started: AtomicBool,
    throughput: usize,
    invoker: OnceLock<InvokerHandle>,
    dispatcher: OnceLock<Dispatcher>,
}

/// A dual-queue, single-consumer mailbox. Cheap to clone; all clones share
/// the same queues and flags.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Create an unbounded mailbox processing up to `throughput` user
    /// messages per run.
    pub fn unbounded(throughput: usize) -> Self {
        let (user_tx, user_rx) = crossbeam_channel::unbounded();
        Self::with_user_queue(user_tx, user_rx, throughput)
    }

    /// Create a mailbox whose user queue holds at most `capacity` messages.
    /// Posting past capacity fails with [`MailboxError::Full`]; the system
    /// queue is always unbounded.
    pub fn bounded(capacity: usize, throughput: usize) -> Self {
        let (user_tx, user_rx) = crossbeam_channel::bounded(capacity);
        Self::with_user_queue(user_tx, user_rx, throughput)
    }

    fn with_user_queue(
        user_tx: Sender<MessageEnvelope>,
        user_rx: Receiver<MessageEnvelope>,
        throughput: usize,
    ) -> Self {
        let (system_tx, system_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(MailboxInner {
                system_tx,
                system_rx,
                user_tx,
                user_rx,
                running: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                started: AtomicBool::new(false),
                throughput: throughput.max(1),
                invoker: OnceLock::new(),
                dispatcher: OnceLock::new(),
            }),
        }
    }

    /// Register the invoker and dispatcher. Must be called exactly once,
    /// before [`Mailbox::start`].
    pub fn register_handlers(&self, invoker: InvokerHandle, dispatcher: Dispatcher) {
        if self.inner.invoker.set(invoker).is_err() {
            tracing::error!("mailbox handlers registered twice");
        }
        let _ = self.inner.dispatcher.set(dispatcher);
    }

    /// Begin dispatching. Messages posted before `start` are retained and
    /// processed by the first run.
    pub fn start(&self) {
        self.inner.started.store(true, Ordering::Release);
        self.schedule();
    }

    /// Enqueue a user message envelope.
    pub fn post_user(&self, envelope: MessageEnvelope) -> Result<(), MailboxError> {
        match self.inner.user_tx.try_send(envelope) {
            Ok(()) => {
                self.schedule();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(MailboxError::Full),
            Err(TrySendError::Disconnected(_)) => Err(MailboxError::Closed),
        }
    }

    /// Enqueue a system message.
    pub fn post_system(&self, message: SystemMessage) -> Result<(), MailboxError> {
        match self.inner.system_tx.try_send(message) {
            Ok(()) => {
                self.schedule();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(MailboxError::Full),
            Err(TrySendError::Disconnected(_)) => Err(MailboxError::Closed),
        }
    }

    /// The number of pending user messages.
    pub fn user_queue_len(&self) -> usize {
        self.inner.user_rx.len()
    }

    fn schedule(&self) {
        let inner = &self.inner;
        if !inner.started.load(Ordering::Acquire) || inner.invoker.get().is_none() {
            return;
        }
        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let dispatcher = inner
                .dispatcher
                .get()
                .cloned()
                .unwrap_or_else(tokio_dispatcher);
            let inner = Arc::clone(inner);
            dispatcher(Box::pin(MailboxInner::run(inner)));
        }
    }
}

impl MailboxInner {
    fn backlog(&self) -> bool {
        !self.system_rx.is_empty()
            || (!self.suspended.load(Ordering::Acquire) && !self.user_rx.is_empty())
    }

    async fn run(inner: Arc<MailboxInner>) {
        let Some(invoker) = inner.invoker.get() else {
            inner.running.store(false, Ordering::Release);
            return;
        };
        // Uncontended: `running` admits one run at a time.
        let mut invoker = invoker.lock().await;

        loop {
            while let Ok(message) = inner.system_rx.try_recv() {
                match message {
                    SystemMessage::SuspendMailbox => {
                        inner.suspended.store(true, Ordering::Release);
                    }
                    SystemMessage::ResumeMailbox => {
                        inner.suspended.store(false, Ordering::Release);
                    }
                    message => {
                        if let Err(reason) = invoker.invoke_system_message(message).await {
                            invoker.escalate_failure(reason, None).await;
                        }
                    }
                }
            }

            if !inner.suspended.load(Ordering::Acquire) {
                let mut processed = 0;
                while processed < inner.throughput {
                    // Signals enqueued mid-batch outrank the rest of it.
                    if !inner.system_rx.is_empty() {
                        break;
                    }
                    let Ok(envelope) = inner.user_rx.try_recv() else {
                        break;
                    };
                    processed += 1;
                    if let Err(reason) = invoker.invoke_user_message(envelope.clone()).await {
                        invoker.escalate_failure(reason, Some(envelope)).await;
                    }
                }
            }

            inner.running.store(false, Ordering::Release);
            if inner.backlog()
                && inner
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tokio::task::yield_now().await;
                continue;
            }
            break;
        }
    }
}

impl Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("system_len", &self.inner.system_rx.len())
            .field("user_len", &self.inner.user_rx.len())
            .field("suspended", &self.inner.suspended.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::message::Terminated;
    use crate::message::TerminateReason;
    use crate::pid::Pid;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        System(String),
        User(String),
    }

    struct RecordingInvoker {
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    #[async_trait]
    impl MessageInvoker for RecordingInvoker {
        async fn invoke_system_message(
            &mut self,
            message: SystemMessage,
        ) -> Result<(), anyhow::Error> {
            self.seen
                .lock()
                .unwrap()
                .push(Seen::System(format!("{:?}", message)));
            Ok(())
        }

        async fn invoke_user_message(
            &mut self,
            envelope: MessageEnvelope,
        ) -> Result<(), anyhow::Error> {
            let text = envelope.downcast_ref::<String>().cloned().unwrap_or_default();
            self.seen.lock().unwrap().push(Seen::User(text));
            Ok(())
        }

        async fn escalate_failure(
            &mut self,
            _reason: anyhow::Error,
            _envelope: Option<MessageEnvelope>,
        ) {
        }
    }

    fn recording_mailbox() -> (Mailbox, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mailbox = Mailbox::unbounded(16);
        let invoker = Arc::new(tokio::sync::Mutex::new(RecordingInvoker { seen: seen.clone() }));
        mailbox.register_handlers(invoker, tokio_dispatcher());
        (mailbox, seen)
    }

    async fn wait_for_len(seen: &Arc<Mutex<Vec<Seen>>>, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seen.lock().unwrap().len() >= len {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("mailbox did not drain in time");
    }

    #[tokio::test]
    async fn test_system_messages_precede_user_messages() {
        let (mailbox, seen) = recording_mailbox();

        // Everything enqueued before the first run: one run observes all of
        // it, and must take the system queue first.
        mailbox
            .post_user(MessageEnvelope::new("a".to_string()))
            .unwrap();
        mailbox
            .post_user(MessageEnvelope::new("b".to_string()))
            .unwrap();
        mailbox
            .post_system(SystemMessage::Terminated(Terminated {
                who: Pid::new("nonhost", "$1"),
                reason: TerminateReason::Stopped,
            }))
            .unwrap();
        mailbox.start();

        wait_for_len(&seen, 3).await;
        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], Seen::System(_)));
        assert_eq!(seen[1], Seen::User("a".to_string()));
        assert_eq!(seen[2], Seen::User("b".to_string()));
    }

    #[tokio::test]
    async fn test_suspended_mailbox_delivers_only_system_messages() {
        let (mailbox, seen) = recording_mailbox();
        mailbox.post_system(SystemMessage::SuspendMailbox).unwrap();
        mailbox
            .post_user(MessageEnvelope::new("blocked".to_string()))
            .unwrap();
        mailbox.post_system(SystemMessage::Start).unwrap();
        mailbox.start();

        wait_for_len(&seen, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Seen::System("Start".to_string())]
        );

        mailbox.post_system(SystemMessage::ResumeMailbox).unwrap();
        wait_for_len(&seen, 2).await;
        assert_eq!(
            seen.lock().unwrap().last().unwrap(),
            &Seen::User("blocked".to_string())
        );
    }

    #[tokio::test]
    async fn test_bounded_mailbox_fails_posts_at_capacity() {
        let mailbox = Mailbox::bounded(2, 16);
        mailbox.post_user(MessageEnvelope::new(1u32)).unwrap();
        mailbox.post_user(MessageEnvelope::new(2u32)).unwrap();
        assert_eq!(
            mailbox.post_user(MessageEnvelope::new(3u32)),
            Err(MailboxError::Full)
        );
    }
}
