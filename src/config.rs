// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tunables for sessions and connections, with defaults that suit a small
//! deployment. Tests shrink the queues and timers to provoke the edges.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// How many operations a document keeps around to transform late client
    /// operations against. Clients further behind than this get a snapshot.
    pub history_limit: usize,
    /// How long a session with an empty roster stays alive.
    pub idle_timeout: Duration,
    /// How often a dirty document is persisted.
    pub persist_interval: Duration,
    /// Granularity of the session actor's housekeeping timer.
    pub tick_interval: Duration,
    /// Mailbox capacity of a session actor.
    pub session_mailbox: usize,
    /// Outbound queue capacity per client. A client that falls further
    /// behind than this is disconnected as a slow consumer.
    pub outbound_queue_limit: usize,
    /// Per-connection rate limits for inbound frames.
    pub max_messages_per_second: u32,
    pub max_bytes_per_second: u32,
    /// Upper bound on a single inbound frame.
    pub max_message_bytes: usize,
    /// How often we probe a connection for liveness.
    pub ping_interval: Duration,
    /// How long we wait for a pong before declaring the connection dead.
    pub pong_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_limit: 2000,
            idle_timeout: Duration::from_secs(5 * 60),
            persist_interval: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            session_mailbox: 256,
            outbound_queue_limit: 512,
            max_messages_per_second: 64,
            max_bytes_per_second: 512 * 1024,
            max_message_bytes: 256 * 1024,
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(45),
        }
    }
}
