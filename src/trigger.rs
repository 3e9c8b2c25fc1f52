//! Trigger dispatch.
//!
//! The [`Dispatcher`] is the sink for two kinds of events:
//!
//! - **match events**, fired by the query router when an answered domain matches a rule
//! - **lifecycle events**, fired by the supervisor around server start and stop
//!
//! Every configured command trigger runs, in order, followed by every webhook
//! trigger. Each entry is either awaited (`async: false`) or spawned detached
//! (`async: true`). Failures are logged per entry and never reach the caller.

use serde::Serialize;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::config::{CommandTrigger, Config, WebhookTrigger};
use crate::error::TriggerError;
use crate::metrics::{self, TriggerKind};
use crate::webhook::WebhookClient;

/// Supervisor lifecycle states reported to triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Server started at process startup.
    Start,
    /// Server stopped for good.
    Stop,
    /// Server restarted after a config reload.
    PartialStart,
    /// Server stopped for a config reload.
    PartialStop,
}

impl LifecycleState {
    /// Name used in templates and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Start => "start",
            LifecycleState::Stop => "stop",
            LifecycleState::PartialStart => "partial_start",
            LifecycleState::PartialStop => "partial_stop",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain from an upstream answer that matched a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    /// Tag of the matching rule.
    pub tag: String,
    /// Answer owner name without the trailing dot.
    pub domain: String,
    /// Requesting client. Not populated by the UDP proxy.
    pub client_ip: Option<IpAddr>,
    /// A record addresses for the domain.
    pub ipv4: Vec<String>,
    /// AAAA record addresses for the domain.
    pub ipv6: Vec<String>,
}

/// JSON body posted to `event_endpoint`.
#[derive(Debug, Serialize)]
pub struct EventPayload<'a> {
    /// Rule tag.
    pub tag: &'a str,
    /// Matched domain.
    pub domain: &'a str,
    /// A record addresses.
    pub ipv4: &'a [String],
    /// AAAA record addresses.
    pub ipv6: &'a [String],
    /// Client address, empty when unknown.
    pub client_ip: String,
}

impl<'a> From<&'a MatchEvent> for EventPayload<'a> {
    fn from(event: &'a MatchEvent) -> Self {
        Self {
            tag: &event.tag,
            domain: &event.domain,
            ipv4: &event.ipv4,
            ipv6: &event.ipv6,
            client_ip: event
                .client_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
        }
    }
}

/// JSON body posted to `lifecycle_endpoint`.
#[derive(Debug, Serialize)]
pub struct LifecyclePayload {
    /// Lifecycle state.
    pub state: LifecycleState,
}

/// Runs configured triggers for match and lifecycle events.
pub struct Dispatcher {
    runner: Arc<dyn CommandRunner>,
    webhook: WebhookClient,
    detached: TaskTracker,
}

impl Dispatcher {
    /// Create a dispatcher executing commands with `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, webhook: WebhookClient) -> Self {
        Self {
            runner,
            webhook,
            detached: TaskTracker::new(),
        }
    }

    /// Run every trigger configured for a rule match.
    pub async fn dispatch_event(&self, config: &Config, event: MatchEvent) {
        if config.verbose {
            info!(domain = %event.domain, rule = %event.tag, "Trigger event");
        } else {
            debug!(domain = %event.domain, rule = %event.tag, "Trigger event");
        }

        let event = Arc::new(event);
        let verbose = config.verbose;

        for trigger in &config.trigger.command {
            let fut = command_event(
                self.runner.clone(),
                trigger.clone(),
                event.clone(),
                verbose,
            );
            self.invoke(trigger.detached, TriggerKind::CommandEvent, fut)
                .await;
        }

        for trigger in &config.trigger.json_http {
            let fut = webhook_event(self.webhook.clone(), trigger.clone(), event.clone());
            self.invoke(trigger.detached, TriggerKind::WebhookEvent, fut)
                .await;
        }
    }

    /// Run every trigger configured for a lifecycle state.
    pub async fn dispatch_lifecycle(&self, config: &Config, state: LifecycleState) {
        if config.verbose {
            info!(%state, "Trigger lifecycle");
        } else {
            debug!(%state, "Trigger lifecycle");
        }
        metrics::record_lifecycle(state);

        let verbose = config.verbose;

        for trigger in &config.trigger.command {
            let fut = command_lifecycle(self.runner.clone(), trigger.clone(), state, verbose);
            self.invoke(trigger.detached, TriggerKind::CommandLifecycle, fut)
                .await;
        }

        for trigger in &config.trigger.json_http {
            let fut = webhook_lifecycle(self.webhook.clone(), trigger.clone(), state);
            self.invoke(trigger.detached, TriggerKind::WebhookLifecycle, fut)
                .await;
        }
    }

    /// Wait for every detached invocation spawned so far to finish.
    pub async fn wait_detached(&self) {
        self.detached.close();
        self.detached.wait().await;
        self.detached.reopen();
    }

    async fn invoke<F>(&self, detached: bool, kind: TriggerKind, fut: F)
    where
        F: Future<Output = Result<(), TriggerError>> + Send + 'static,
    {
        if detached {
            self.detached.spawn(async move { report(kind, fut.await) });
        } else {
            report(kind, fut.await);
        }
    }
}

fn report(kind: TriggerKind, result: Result<(), TriggerError>) {
    match result {
        Ok(()) => metrics::record_trigger(kind, true),
        Err(e) => {
            warn!(error = %e, "Trigger {} error", kind);
            metrics::record_trigger(kind, false);
        }
    }
}

async fn execute(
    runner: &dyn CommandRunner,
    command: &str,
    verbose: bool,
) -> Result<(), TriggerError> {
    if verbose {
        info!(command, "exec");
    } else {
        debug!(command, "exec");
    }

    let output = runner.run(command).await?;

    if verbose {
        info!(output = output.trim(), "exec output");
    } else {
        debug!(output = output.trim(), "exec output");
    }
    Ok(())
}

async fn command_event(
    runner: Arc<dyn CommandRunner>,
    trigger: CommandTrigger,
    event: Arc<MatchEvent>,
    verbose: bool,
) -> Result<(), TriggerError> {
    if trigger.event_template.is_empty() {
        return Ok(());
    }

    let command = trigger
        .event_template
        .replace("{tag}", &event.tag)
        .replace("{domain}", &event.domain);

    for (record_type, ips) in [("A", &event.ipv4), ("AAAA", &event.ipv6)] {
        if ips.is_empty() {
            continue;
        }

        let command = command.replace("{type}", record_type);
        if trigger.batch {
            let command = command.replace("{ips}", &ips.join(","));
            execute(runner.as_ref(), &command, verbose).await?;
        } else {
            for ip in ips {
                let command = command.replace("{ip}", ip);
                execute(runner.as_ref(), &command, verbose).await?;
            }
        }
    }

    Ok(())
}

async fn command_lifecycle(
    runner: Arc<dyn CommandRunner>,
    trigger: CommandTrigger,
    state: LifecycleState,
    verbose: bool,
) -> Result<(), TriggerError> {
    let hook = match state {
        LifecycleState::Start => &trigger.on_start,
        LifecycleState::Stop => &trigger.on_stop,
        LifecycleState::PartialStart => &trigger.on_partial_start,
        LifecycleState::PartialStop => &trigger.on_partial_stop,
    };
    if !hook.is_empty() {
        execute(runner.as_ref(), hook, verbose).await?;
    }

    if trigger.lifecycle_template.is_empty() {
        return Ok(());
    }

    let command = trigger.lifecycle_template.replace("{state}", state.as_str());
    execute(runner.as_ref(), &command, verbose).await
}

async fn webhook_event(
    client: WebhookClient,
    trigger: WebhookTrigger,
    event: Arc<MatchEvent>,
) -> Result<(), TriggerError> {
    if trigger.event_endpoint.is_empty() {
        return Ok(());
    }
    client
        .post(&trigger.event_endpoint, &EventPayload::from(event.as_ref()))
        .await
}

async fn webhook_lifecycle(
    client: WebhookClient,
    trigger: WebhookTrigger,
    state: LifecycleState,
) -> Result<(), TriggerError> {
    if trigger.lifecycle_endpoint.is_empty() {
        return Ok(());
    }
    client
        .post(&trigger.lifecycle_endpoint, &LifecyclePayload { state })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every command line instead of running it.
    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &str) -> Result<String, TriggerError> {
            self.commands.lock().push(command.to_string());
            if self.fail_on.as_deref() == Some(command) {
                return Err(TriggerError::NoShell);
            }
            Ok(String::new())
        }
    }

    impl RecordingRunner {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    fn dispatcher(runner: Arc<RecordingRunner>) -> Dispatcher {
        Dispatcher::new(runner, WebhookClient::new().unwrap())
    }

    fn config_with(commands: Vec<CommandTrigger>) -> Config {
        Config {
            verbose: false,
            trigger: TriggerConfig {
                command: commands,
                json_http: Vec::new(),
            },
            ..Config::default()
        }
    }

    fn event(ipv4: &[&str], ipv6: &[&str]) -> MatchEvent {
        MatchEvent {
            tag: "fw".to_string(),
            domain: "a.example.com".to_string(),
            client_ip: None,
            ipv4: ipv4.iter().map(|s| s.to_string()).collect(),
            ipv6: ipv6.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn event_trigger(template: &str, batch: bool) -> CommandTrigger {
        CommandTrigger {
            batch,
            event_template: template.to_string(),
            ..CommandTrigger::default()
        }
    }

    #[tokio::test]
    async fn test_per_address_execution() {
        let runner = Arc::new(RecordingRunner::default());
        let config = config_with(vec![event_trigger("add {tag} {domain} {type} {ip}", false)]);

        dispatcher(runner.clone())
            .dispatch_event(&config, event(&["1.1.1.1", "2.2.2.2"], &[]))
            .await;

        assert_eq!(
            runner.commands(),
            vec![
                "add fw a.example.com A 1.1.1.1",
                "add fw a.example.com A 2.2.2.2",
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_execution() {
        let runner = Arc::new(RecordingRunner::default());
        let config = config_with(vec![event_trigger("add {type} {ips}", true)]);

        dispatcher(runner.clone())
            .dispatch_event(&config, event(&["1.1.1.1", "2.2.2.2"], &[]))
            .await;

        assert_eq!(runner.commands(), vec!["add A 1.1.1.1,2.2.2.2"]);
    }

    #[tokio::test]
    async fn test_ipv6_family_uses_ipv6_addresses() {
        let runner = Arc::new(RecordingRunner::default());
        let config = config_with(vec![event_trigger("add {type} {ip}", false)]);

        dispatcher(runner.clone())
            .dispatch_event(&config, event(&["1.1.1.1"], &["2001:db8::1"]))
            .await;

        assert_eq!(
            runner.commands(),
            vec!["add A 1.1.1.1", "add AAAA 2001:db8::1"]
        );
    }

    #[tokio::test]
    async fn test_empty_family_contributes_nothing() {
        for batch in [false, true] {
            let runner = Arc::new(RecordingRunner::default());
            let config = config_with(vec![event_trigger("add {type}", batch)]);

            dispatcher(runner.clone())
                .dispatch_event(&config, event(&[], &["2001:db8::1"]))
                .await;

            assert_eq!(runner.commands(), vec!["add AAAA"]);
        }
    }

    #[tokio::test]
    async fn test_empty_template_contributes_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let config = config_with(vec![CommandTrigger::default()]);
        let dispatcher = dispatcher(runner.clone());

        dispatcher
            .dispatch_event(&config, event(&["1.1.1.1"], &[]))
            .await;
        dispatcher
            .dispatch_lifecycle(&config, LifecycleState::Start)
            .await;

        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_runs_named_hook_and_template() {
        let runner = Arc::new(RecordingRunner::default());
        let config = config_with(vec![CommandTrigger {
            lifecycle_template: "state {state}".to_string(),
            on_start: "on_start".to_string(),
            on_stop: "on_stop".to_string(),
            on_partial_start: "on_partial_start".to_string(),
            on_partial_stop: "on_partial_stop".to_string(),
            ..CommandTrigger::default()
        }]);

        dispatcher(runner.clone())
            .dispatch_lifecycle(&config, LifecycleState::PartialStart)
            .await;

        assert_eq!(
            runner.commands(),
            vec!["on_partial_start", "state partial_start"]
        );
    }

    #[tokio::test]
    async fn test_failing_trigger_does_not_block_others() {
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("first 1.1.1.1".to_string()),
            ..RecordingRunner::default()
        });
        let config = config_with(vec![
            event_trigger("first {ip}", false),
            event_trigger("second {ip}", false),
        ]);

        dispatcher(runner.clone())
            .dispatch_event(&config, event(&["1.1.1.1", "2.2.2.2"], &[]))
            .await;

        // The failing trigger stops at its first error; the next trigger still runs.
        assert_eq!(
            runner.commands(),
            vec!["first 1.1.1.1", "second 1.1.1.1", "second 2.2.2.2"]
        );
    }

    #[tokio::test]
    async fn test_detached_triggers_complete() {
        let runner = Arc::new(RecordingRunner::default());
        let mut trigger = event_trigger("bg {ip}", false);
        trigger.detached = true;
        let config = config_with(vec![trigger]);
        let dispatcher = dispatcher(runner.clone());

        dispatcher
            .dispatch_event(&config, event(&["1.1.1.1"], &[]))
            .await;
        dispatcher.wait_detached().await;

        assert_eq!(runner.commands(), vec!["bg 1.1.1.1"]);
    }

    #[test]
    fn test_event_payload_shape() {
        let event = event(&["1.1.1.1"], &[]);
        let json = serde_json::to_value(EventPayload::from(&event)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tag": "fw",
                "domain": "a.example.com",
                "ipv4": ["1.1.1.1"],
                "ipv6": [],
                "client_ip": "",
            })
        );
    }

    #[test]
    fn test_lifecycle_payload_shape() {
        let json = serde_json::to_value(LifecyclePayload {
            state: LifecycleState::PartialStop,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "state": "partial_stop" }));
    }
}
