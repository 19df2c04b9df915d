/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime configuration.
//!
//! A [`Config`] is fixed at system construction. Defaults suit production;
//! every knob can be overridden programmatically or, via [`Config::from_env`],
//! through `HIVE_`-prefixed environment variables.

use std::env;
use std::time::Duration;

/// Configuration recognized by the core runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log requests (sender-carrying envelopes) that are routed to the
    /// dead-letter process.
    pub dead_letter_request_logging: bool,

    /// Verbose supervision logging: every escalation is logged with its
    /// cause before the strategy runs.
    pub developer_supervision_logging: bool,

    /// How long an unresponsive cluster member stays blocked.
    pub blocked_member_duration: Duration,

    /// The default deadline for request futures issued by the cluster layer.
    pub actor_request_timeout: Duration,

    /// The default warning threshold for slow `Started` handling; can be
    /// overridden per actor on its props.
    pub start_deadline: Duration,

    /// The default number of user messages a mailbox processes per run.
    pub throughput: usize,

    /// Exit the hosting process when the cluster layer shuts down.
    pub exit_on_shutdown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dead_letter_request_logging: true,
            developer_supervision_logging: false,
            blocked_member_duration: Duration::from_secs(60 * 60),
            actor_request_timeout: Duration::from_secs(5),
            start_deadline: Duration::from_secs(3),
            throughput: 300,
            exit_on_shutdown: false,
        }
    }
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("HIVE_DEAD_LETTER_REQUEST_LOGGING") {
            if let Ok(parsed) = val.parse::<bool>() {
                config.dead_letter_request_logging = parsed;
            }
        }
        if let Ok(val) = env::var("HIVE_DEVELOPER_SUPERVISION_LOGGING") {
            if let Ok(parsed) = val.parse::<bool>() {
                config.developer_supervision_logging = parsed;
            }
        }
        if let Ok(val) = env::var("HIVE_BLOCKED_MEMBER_DURATION_SECS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.blocked_member_duration = Duration::from_secs(parsed);
            }
        }
        if let Ok(val) = env::var("HIVE_ACTOR_REQUEST_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.actor_request_timeout = Duration::from_millis(parsed);
            }
        }
        if let Ok(val) = env::var("HIVE_START_DEADLINE_MS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.start_deadline = Duration::from_millis(parsed);
            }
        }
        if let Ok(val) = env::var("HIVE_THROUGHPUT") {
            if let Ok(parsed) = val.parse::<usize>() {
                config.throughput = parsed;
            }
        }
        if let Ok(val) = env::var("HIVE_EXIT_ON_SHUTDOWN") {
            if let Ok(parsed) = val.parse::<bool>() {
                config.exit_on_shutdown = parsed;
            }
        }

        config
    }
}
