/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Request futures: the request/response bridge over one-shot pids.
//!
//! An [`ActorFuture`] is backed by a registered process whose pid is used as
//! the sender of a request envelope. The first user message delivered to
//! that pid completes the future; a dead-letter response or an elapsed
//! deadline faults it. Completion unregisters the pid, so each future is
//! strictly one-shot.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::actor_system::ActorSystem;
use crate::actor_system::WeakActorSystem;
use crate::message::DeadLetterResponse;
use crate::message::MessageEnvelope;
use crate::pid::Pid;
use crate::process::Process;
use crate::system_messages::SystemMessage;

/// Ways a request future can fault.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AskError {
    /// No reply arrived within the deadline.
    #[error("request timed out")]
    Timeout,
    /// The request (or its reply path) was routed to dead-letter.
    #[error("request hit dead letter")]
    DeadLetter,
}

/// A handle that completes with the first reply delivered to its one-shot
/// pid.
#[derive(Debug)]
pub struct ActorFuture {
    pid: Pid,
    receiver: oneshot::Receiver<Result<MessageEnvelope, AskError>>,
}

impl ActorFuture {
    /// The one-shot pid replies should be addressed to.
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Await the reply.
    pub async fn result(self) -> Result<MessageEnvelope, AskError> {
        match self.receiver.await {
            Ok(result) => result,
            // The process was torn down without completing, which only
            // happens when its system is shutting down.
            Err(_) => Err(AskError::DeadLetter),
        }
    }
}

/// Allocate a one-shot future process with the given deadline, returning
/// its pid (to be used as a reply target) and the completion handle.
pub(crate) fn spawn_future(system: &ActorSystem, timeout: Duration) -> (Pid, ActorFuture) {
    let (tx, rx) = oneshot::channel();
    let process = Arc::new(ActorFutureProcess {
        sender: Mutex::new(Some(tx)),
        system: system.downgrade(),
        pid: OnceLock::new(),
        done: AtomicBool::new(false),
    });

    let id = format!("futures/{}", system.registry().next_id());
    let pid = system
        .registry()
        .add(&id, process.clone())
        .expect("future ids are never reused");
    let _ = process.pid.set(pid.clone());

    if !timeout.is_zero() {
        let process = process.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            process.settle(Err(AskError::Timeout));
        });
    }

    (
        pid.clone(),
        ActorFuture { pid, receiver: rx },
    )
}

struct ActorFutureProcess {
    sender: Mutex<Option<oneshot::Sender<Result<MessageEnvelope, AskError>>>>,
    system: WeakActorSystem,
    pid: OnceLock<Pid>,
    done: AtomicBool,
}

impl ActorFutureProcess {
    /// Complete or fault the future, then self-unregister. Only the first
    /// settlement wins.
    fn settle(&self, result: Result<MessageEnvelope, AskError>) {
        let sender = self
            .sender
            .lock()
            .expect("future sender lock poisoned")
            .take();
        let Some(sender) = sender else {
            return;
        };
        let _ = sender.send(result);
        self.done.store(true, Ordering::Release);
        if let (Some(system), Some(pid)) = (self.system.upgrade(), self.pid.get()) {
            system.registry().remove(pid);
        }
    }
}

impl Process for ActorFutureProcess {
    fn send_user_message(&self, _target: &Pid, envelope: MessageEnvelope) {
        if envelope.is::<DeadLetterResponse>() {
            self.settle(Err(AskError::DeadLetter));
        } else {
            self.settle(Ok(envelope));
        }
    }

    fn send_system_message(&self, _target: &Pid, message: SystemMessage) {
        match message {
            // Watch-backed stop and poison futures resolve on the watched
            // actor's termination notice.
            SystemMessage::Terminated(terminated) => {
                self.settle(Ok(MessageEnvelope::new(terminated)));
            }
            SystemMessage::Stop => self.settle(Err(AskError::DeadLetter)),
            other => {
                tracing::debug!("future process ignoring system message {:?}", other);
            }
        }
    }

    fn is_dead(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
