/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Supervision: hierarchical failure handling.
//!
//! When an actor's receive faults, its context suspends the mailbox and
//! escalates a [`crate::system_messages::Failure`] to its parent. The
//! parent's strategy inspects the failure and issues directives back down:
//! resume, restart, or stop the affected children, or escalate further up.
//! Strategies are side-effect-only; they never touch actor state directly.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;

use crate::actor_system::ActorSystem;
use crate::message::MessageEnvelope;
use crate::pid::Pid;
use crate::system_messages::SystemMessage;

/// The cause of an actor failure, cloneable so it can be carried through
/// supervision messages and statistics.
#[derive(Clone, Debug)]
pub struct FailureReason(Arc<anyhow::Error>);

impl FailureReason {
    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempt to downcast the underlying error.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for FailureReason {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A sliding window of failure instants, shared between a child's context
/// and the supervision messages that describe it.
#[derive(Debug, Clone, Default)]
pub struct RestartStatistics {
    failures: Arc<Mutex<Vec<Instant>>>,
}

impl RestartStatistics {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure at the current instant.
    pub fn fail(&self) {
        self.failures
            .lock()
            .expect("restart statistics lock poisoned")
            .push(Instant::now());
    }

    /// Forget all recorded failures.
    pub fn reset(&self) {
        self.failures
            .lock()
            .expect("restart statistics lock poisoned")
            .clear();
    }

    /// The total number of recorded failures.
    pub fn failure_count(&self) -> u32 {
        self.failures
            .lock()
            .expect("restart statistics lock poisoned")
            .len() as u32
    }

    /// The number of failures recorded within the trailing `window`. A zero
    /// window counts everything.
    pub fn number_of_failures(&self, window: Duration) -> u32 {
        let failures = self
            .failures
            .lock()
            .expect("restart statistics lock poisoned");
        if window.is_zero() {
            return failures.len() as u32;
        }
        let cutoff = Instant::now();
        failures
            .iter()
            .filter(|instant| cutoff.duration_since(**instant) < window)
            .count() as u32
    }

    /// Time since the most recent failure, if any.
    pub fn time_since_last_failure(&self) -> Option<Duration> {
        self.failures
            .lock()
            .expect("restart statistics lock poisoned")
            .last()
            .map(|instant| instant.elapsed())
    }
}

/// What to do about a failing child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Resume the child's mailbox; the failing message is skipped.
    Resume,
    /// Dispose and re-create the child.
    Restart,
    /// Stop the child.
    Stop,
    /// Pass the failure to the supervisor's own parent.
    Escalate,
}

/// Maps a failure cause to a [`Directive`].
pub type Decider = Arc<dyn Fn(&FailureReason) -> Directive + Send + Sync>;

/// The default decider: restart on every failure.
pub fn default_decider() -> Decider {
    Arc::new(|_| Directive::Restart)
}

/// The supervisor side of the protocol: the set of operations a strategy
/// may apply to a supervising actor. Implemented by actor contexts; all
/// operations are message sends.
pub trait Supervisor: Send {
    /// The supervised children.
    fn children(&self) -> Vec<Pid>;

    /// Resume the mailboxes of the given children.
    fn resume_children(&self, pids: &[Pid]);

    /// Restart the given children.
    fn restart_children(&self, pids: &[Pid]);

    /// Stop the given children.
    fn stop_children(&self, pids: &[Pid]);

    /// Escalate the failure to this supervisor's own parent.
    fn escalate_failure(&self, reason: FailureReason, envelope: Option<MessageEnvelope>);
}

/// A supervision strategy: decides and applies directives for child
/// failures.
pub trait SupervisorStrategy: Send + Sync {
    /// Handle a failure of `child`, supervised by `supervisor`.
    fn handle_failure(
        &self,
        system: &ActorSystem,
        supervisor: &dyn Supervisor,
        child: &Pid,
        stats: &RestartStatistics,
        reason: &FailureReason,
        envelope: Option<&MessageEnvelope>,
    );
}

/// Affect only the failing child.
pub struct OneForOneStrategy {
    max_retries: u32,
    within: Duration,
    decider: Decider,
}

impl OneForOneStrategy {
    /// Restart up to `max_retries` times within `within` before stopping.
    pub fn new(max_retries: u32, within: Duration) -> Self {
        Self {
            max_retries,
            within,
            decider: default_decider(),
        }
    }

    /// Replace the decider.
    pub fn with_decider(mut self, decider: Decider) -> Self {
        self.decider = decider;
        self
    }

    fn request_restart_permission(&self, stats: &RestartStatistics) -> bool {
        stats.fail();
        if self.max_retries == 0 {
            return false;
        }
        stats.number_of_failures(self.within) <= self.max_retries
    }
}

impl SupervisorStrategy for OneForOneStrategy {
    fn handle_failure(
        &self,
        _system: &ActorSystem,
        supervisor: &dyn Supervisor,
        child: &Pid,
        stats: &RestartStatistics,
        reason: &FailureReason,
        envelope: Option<&MessageEnvelope>,
    ) {
        match (self.decider)(reason) {
            Directive::Resume => supervisor.resume_children(std::slice::from_ref(child)),
            Directive::Restart => {
                if self.request_restart_permission(stats) {
                    tracing::info!("{}: restarting: {}", child, reason);
                    supervisor.restart_children(std::slice::from_ref(child));
                } else {
                    tracing::info!("{}: stopping after repeated failures: {}", child, reason);
                    supervisor.stop_children(std::slice::from_ref(child));
                }
            }
            Directive::Stop => {
                tracing::info!("{}: stopping: {}", child, reason);
                supervisor.stop_children(std::slice::from_ref(child));
            }
            Directive::Escalate => {
                supervisor.escalate_failure(reason.clone(), envelope.cloned());
            }
        }
    }
}

/// Affect the failing child and all of its siblings.
pub struct AllForOneStrategy {
    max_retries: u32,
    within: Duration,
    decider: Decider,
}

impl AllForOneStrategy {
    /// Restart up to `max_retries` times within `within` before stopping.
    pub fn new(max_retries: u32, within: Duration) -> Self {
        Self {
            max_retries,
            within,
            decider: default_decider(),
        }
    }

    /// Replace the decider.
    pub fn with_decider(mut self, decider: Decider) -> Self {
        self.decider = decider;
        self
    }

    fn request_restart_permission(&self, stats: &RestartStatistics) -> bool {
        stats.fail();
        if self.max_retries == 0 {
            return false;
        }
        stats.number_of_failures(self.within) <= self.max_retries
    }
}

impl SupervisorStrategy for AllForOneStrategy {
    fn handle_failure(
        &self,
        _system: &ActorSystem,
        supervisor: &dyn Supervisor,
        child: &Pid,
        stats: &RestartStatistics,
        reason: &FailureReason,
        envelope: Option<&MessageEnvelope>,
    ) {
        match (self.decider)(reason) {
            Directive::Resume => supervisor.resume_children(std::slice::from_ref(child)),
            Directive::Restart => {
                let siblings = supervisor.children();
                if self.request_restart_permission(stats) {
                    tracing::info!("{}: restarting all children: {}", child, reason);
                    supervisor.restart_children(&siblings);
                } else {
                    tracing::info!("{}: stopping all children: {}", child, reason);
                    supervisor.stop_children(&siblings);
                }
            }
            Directive::Stop => supervisor.stop_children(&supervisor.children()),
            Directive::Escalate => {
                supervisor.escalate_failure(reason.clone(), envelope.cloned());
            }
        }
    }
}

/// Restart the failing child after an exponentially growing delay.
///
/// The nth consecutive failure is restarted after `2^min(n, cap)` seconds
/// plus up to 25% jitter. The consecutive-failure counter resets after an
/// idle window with no failures.
pub struct ExponentialBackoffStrategy {
    cap: u32,
    reset_window: Duration,
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self {
            cap: 6,
            reset_window: Duration::from_secs(60 * 60),
        }
    }
}

impl ExponentialBackoffStrategy {
    /// Cap the exponent at `cap` and reset the failure counter after
    /// `reset_window` without failures.
    pub fn new(cap: u32, reset_window: Duration) -> Self {
        Self { cap, reset_window }
    }

    fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let base = Duration::from_secs(1u64 << consecutive_failures.min(self.cap));
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
        base + jitter
    }
}

impl SupervisorStrategy for ExponentialBackoffStrategy {
    fn handle_failure(
        &self,
        system: &ActorSystem,
        _supervisor: &dyn Supervisor,
        child: &Pid,
        stats: &RestartStatistics,
        reason: &FailureReason,
        _envelope: Option<&MessageEnvelope>,
    ) {
        if let Some(idle) = stats.time_since_last_failure() {
            if idle > self.reset_window {
                stats.reset();
            }
        }
        stats.fail();

        let delay = self.delay_for(stats.failure_count());
        tracing::info!("{}: restarting in {:?}: {}", child, delay, reason);

        let system = system.clone();
        let child = child.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            child.send_system_message(&system, SystemMessage::Restart);
        });
    }
}

/// Restart the failing child unconditionally.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRestartStrategy;

impl SupervisorStrategy for AlwaysRestartStrategy {
    fn handle_failure(
        &self,
        _system: &ActorSystem,
        supervisor: &dyn Supervisor,
        child: &Pid,
        stats: &RestartStatistics,
        _reason: &FailureReason,
        _envelope: Option<&MessageEnvelope>,
    ) {
        stats.fail();
        supervisor.restart_children(std::slice::from_ref(child));
    }
}

/// Stop the failing child unconditionally.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysStopStrategy;

impl SupervisorStrategy for AlwaysStopStrategy {
    fn handle_failure(
        &self,
        _system: &ActorSystem,
        supervisor: &dyn Supervisor,
        child: &Pid,
        _stats: &RestartStatistics,
        _reason: &FailureReason,
        _envelope: Option<&MessageEnvelope>,
    ) {
        supervisor.stop_children(std::slice::from_ref(child));
    }
}

/// Pass every failure to the supervisor's own parent.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscalateStrategy;

impl SupervisorStrategy for EscalateStrategy {
    fn handle_failure(
        &self,
        _system: &ActorSystem,
        supervisor: &dyn Supervisor,
        _child: &Pid,
        _stats: &RestartStatistics,
        reason: &FailureReason,
        envelope: Option<&MessageEnvelope>,
    ) {
        supervisor.escalate_failure(reason.clone(), envelope.cloned());
    }
}

/// The strategy applied when props do not specify one, and by the root
/// guardian for actors with no parent.
pub fn default_strategy() -> Arc<dyn SupervisorStrategy> {
    Arc::new(OneForOneStrategy::new(10, Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSupervisor {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingSupervisor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, what: &str, pids: &[Pid]) {
            let ids: Vec<_> = pids.iter().map(|p| p.id().to_string()).collect();
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", what, ids.join(",")));
        }
    }

    impl Supervisor for RecordingSupervisor {
        fn children(&self) -> Vec<Pid> {
            vec![Pid::new("nonhost", "$1"), Pid::new("nonhost", "$2")]
        }

        fn resume_children(&self, pids: &[Pid]) {
            self.record("resume", pids);
        }

        fn restart_children(&self, pids: &[Pid]) {
            self.record("restart", pids);
        }

        fn stop_children(&self, pids: &[Pid]) {
            self.record("stop", pids);
        }

        fn escalate_failure(&self, _reason: FailureReason, _envelope: Option<MessageEnvelope>) {
            self.calls.lock().unwrap().push("escalate:".to_string());
        }
    }

    fn reason() -> FailureReason {
        anyhow::anyhow!("boom").into()
    }

    #[tokio::test]
    async fn test_one_for_one_restarts_then_stops() {
        let system = crate::actor_system::ActorSystem::new();
        let strategy = OneForOneStrategy::new(2, Duration::from_secs(60));
        let supervisor = RecordingSupervisor::default();
        let stats = RestartStatistics::new();
        let child = Pid::new("nonhost", "$1");

        for _ in 0..2 {
            strategy.handle_failure(&system, &supervisor, &child, &stats, &reason(), None);
        }
        // Third failure within the window exceeds max_retries.
        strategy.handle_failure(&system, &supervisor, &child, &stats, &reason(), None);

        assert_eq!(
            supervisor.calls(),
            vec!["restart:$1", "restart:$1", "stop:$1"]
        );
    }

    #[tokio::test]
    async fn test_all_for_one_affects_siblings() {
        let system = crate::actor_system::ActorSystem::new();
        let strategy = AllForOneStrategy::new(3, Duration::from_secs(60));
        let supervisor = RecordingSupervisor::default();
        let stats = RestartStatistics::new();
        let child = Pid::new("nonhost", "$1");

        strategy.handle_failure(&system, &supervisor, &child, &stats, &reason(), None);
        assert_eq!(supervisor.calls(), vec!["restart:$1,$2"]);
    }

    #[tokio::test]
    async fn test_decider_routes_directives() {
        let system = crate::actor_system::ActorSystem::new();
        let strategy = OneForOneStrategy::new(10, Duration::from_secs(60))
            .with_decider(Arc::new(|_| Directive::Resume));
        let supervisor = RecordingSupervisor::default();
        let stats = RestartStatistics::new();
        let child = Pid::new("nonhost", "$1");

        strategy.handle_failure(&system, &supervisor, &child, &stats, &reason(), None);
        assert_eq!(supervisor.calls(), vec!["resume:$1"]);
        assert_eq!(stats.failure_count(), 0);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let strategy = ExponentialBackoffStrategy::new(5, Duration::from_secs(3600));
        for n in 1..=8u32 {
            let base = Duration::from_secs(1u64 << n.min(5));
            for _ in 0..32 {
                let delay = strategy.delay_for(n);
                assert!(delay >= base, "delay {:?} below base {:?}", delay, base);
                assert!(
                    delay <= base.mul_f64(1.25),
                    "delay {:?} above jitter cap for base {:?}",
                    delay,
                    base
                );
            }
        }
    }

    #[test]
    fn test_restart_statistics_window() {
        let stats = RestartStatistics::new();
        stats.fail();
        stats.fail();
        assert_eq!(stats.failure_count(), 2);
        assert_eq!(stats.number_of_failures(Duration::from_secs(60)), 2);
        assert_eq!(stats.number_of_failures(Duration::ZERO), 2);
        stats.reset();
        assert_eq!(stats.failure_count(), 0);
        assert!(stats.time_since_last_failure().is_none());
    }
}
