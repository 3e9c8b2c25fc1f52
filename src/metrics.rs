//! Metrics instrumentation for resolvhook.
//!
//! All metrics are prefixed with `resolvhook.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::trigger::LifecycleState;

/// Record a proxied DNS query.
pub fn record_query(result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Forwarded => "forwarded",
        QueryResult::ServFail => "servfail",
        QueryResult::Malformed => "malformed",
    };

    counter!("resolvhook.query.count", "result" => result_str).increment(1);
    histogram!("resolvhook.query.duration.seconds", "result" => result_str)
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// An upstream answered and the answer was relayed.
    Forwarded,
    /// Every upstream failed.
    ServFail,
    /// The inbound datagram was not a DNS message.
    Malformed,
}

/// Record a failed exchange with an upstream.
pub fn record_upstream_failure(upstream: &str) {
    counter!("resolvhook.upstream.failure.count", "upstream" => upstream.to_string())
        .increment(1);
}

/// Record a domain matching a rule.
pub fn record_rule_match(tag: &str) {
    counter!("resolvhook.rule.match.count", "tag" => tag.to_string()).increment(1);
}

/// Record the size of the active rule set.
pub fn record_rules_loaded(count: usize) {
    gauge!("resolvhook.rules.count").set(count as f64);
}

/// Record a finished trigger invocation.
pub fn record_trigger(kind: TriggerKind, ok: bool) {
    let kind_str = match kind {
        TriggerKind::CommandEvent => "command_event",
        TriggerKind::CommandLifecycle => "command_lifecycle",
        TriggerKind::WebhookEvent => "webhook_event",
        TriggerKind::WebhookLifecycle => "webhook_lifecycle",
    };
    let result_str = if ok { "ok" } else { "error" };

    counter!("resolvhook.trigger.count", "kind" => kind_str, "result" => result_str)
        .increment(1);
}

/// Trigger invocation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Command trigger fired by a rule match.
    CommandEvent,
    /// Command trigger fired by a lifecycle event.
    CommandLifecycle,
    /// Webhook fired by a rule match.
    WebhookEvent,
    /// Webhook fired by a lifecycle event.
    WebhookLifecycle,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::CommandEvent => "event command",
            TriggerKind::CommandLifecycle => "lifecycle command",
            TriggerKind::WebhookEvent => "event json http",
            TriggerKind::WebhookLifecycle => "lifecycle json http",
        };
        f.write_str(s)
    }
}

/// Record a reload performed by the supervisor.
pub fn record_reload(kind: ReloadKind) {
    let kind_str = match kind {
        ReloadKind::Config => "config",
        ReloadKind::Rules => "rules",
    };

    counter!("resolvhook.reload.count", "kind" => kind_str).increment(1);
}

/// What a reload replaced.
#[derive(Debug, Clone, Copy)]
pub enum ReloadKind {
    /// Config changed; the server was restarted.
    Config,
    /// Rules were re-read and swapped into the server.
    Rules,
}

/// Record a lifecycle event being dispatched.
pub fn record_lifecycle(state: LifecycleState) {
    counter!("resolvhook.lifecycle.count", "state" => state.as_str()).increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
