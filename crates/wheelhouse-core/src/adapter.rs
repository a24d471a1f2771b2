//! Session adapter: the full pipeline from raw transport events to unified
//! messages, token accounting and compaction scheduling.
//!
//! One adapter fronts any number of sessions. Per event the pipeline is
//! dedup, identity resolution, normalization, delivery to the UI sink, then
//! token accounting and trigger evaluation for usage-bearing messages. Each
//! event is processed to completion before the next one starts, so no
//! per-session locking is needed beyond the adapter itself.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::compaction::{CompactionAction, CompactionTrigger, UserTurn};
use crate::config::AdapterConfig;
use crate::dedup::DedupFilter;
use crate::identity::SessionIdentityMap;
use crate::ledger::{TokenLedger, TokenLedgerEntry};
use crate::logging::{self, LogHandle};
use crate::protocol::{UnifiedMessage, Usage};
use crate::providers::{Normalizer, Provider};
use crate::registry::{ChannelRegistry, PumpEvent, RegistryError};
use crate::transport::{ChannelBus, ChannelKind};

/// Drives the underlying agent processes. Implemented by the process layer;
/// the adapter never touches a process directly.
pub trait Orchestrator: Send + Sync {
    fn spawn_session(&self, session_id: &str, provider: Provider) -> Result<(), OrchestratorError>;
    fn send_message(&self, session_id: &str, text: &str) -> Result<(), OrchestratorError>;
    fn interrupt(&self, session_id: &str) -> Result<(), OrchestratorError>;
    fn clear_context(&self, session_id: &str) -> Result<(), OrchestratorError>;
}

#[derive(Debug, Error)]
#[error("orchestrator: {0}")]
pub struct OrchestratorError(pub String);

/// Receives unified messages for delivery to the frontend.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, client_id: &str, message: &UnifiedMessage);
}

/// Optional user-extensible hook point. `fire` returns true when the hook
/// blocked the action.
pub trait HookSink: Send + Sync {
    fn fire(&self, name: &str, payload: &serde_json::Value) -> bool;
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("session {0} is not attached")]
    NotAttached(String),
}

/// Payload of an identity-update channel event.
#[derive(Debug, serde::Deserialize)]
struct IdentityUpdate {
    old: String,
    new: String,
}

pub struct SessionAdapter {
    config: AdapterConfig,
    registry: ChannelRegistry,
    events: mpsc::UnboundedReceiver<PumpEvent>,
    dedup: DedupFilter,
    identity: SessionIdentityMap,
    ledger: TokenLedger,
    trigger: CompactionTrigger,
    normalizers: HashMap<String, Normalizer>,
    logs: HashMap<String, LogHandle>,
    orchestrator: Box<dyn Orchestrator>,
    sink: Arc<dyn MessageSink>,
    hooks: Option<Arc<dyn HookSink>>,
}

impl SessionAdapter {
    pub fn new(
        config: AdapterConfig,
        bus: Arc<ChannelBus>,
        orchestrator: Box<dyn Orchestrator>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (registry, events) = ChannelRegistry::new(bus);
        let dedup = DedupFilter::new(config.dedup_capacity);
        let trigger = CompactionTrigger::new(config.compaction.clone());
        Self {
            config,
            registry,
            events,
            dedup,
            identity: SessionIdentityMap::new(),
            ledger: TokenLedger::new(),
            trigger,
            normalizers: HashMap::new(),
            logs: HashMap::new(),
            orchestrator,
            sink,
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookSink>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Current ledger entry for a session, following identity migrations.
    pub fn token_entry(&self, client_id: &str) -> Option<&TokenLedgerEntry> {
        self.ledger.get(&self.identity.resolve(client_id))
    }

    /// Spawn the session's process and open its channels.
    ///
    /// A channel setup failure is surfaced to the UI as an error message and
    /// returned; there is no automatic retry.
    pub async fn attach(&mut self, client_id: &str, provider: Provider) -> Result<(), AdapterError> {
        self.orchestrator.spawn_session(client_id, provider)?;

        if let Err(err) = self.registry.attach(client_id, client_id).await {
            log::error!("channel setup failed for {}: {}", client_id, err);
            self.sink.deliver(
                client_id,
                &UnifiedMessage::Error {
                    message: format!("failed to open session channels: {err}"),
                },
            );
            return Err(err.into());
        }

        self.normalizers
            .insert(client_id.to_string(), Normalizer::new(provider));
        self.logs.insert(
            client_id.to_string(),
            logging::open_log_file(self.config.log_dir.as_deref(), client_id),
        );
        Ok(())
    }

    /// Submit a user message. With an auto-compaction pending this sends the
    /// compact instruction first and holds the user's message until the
    /// compaction is detected as complete.
    pub fn send_user_message(&mut self, client_id: &str, text: &str) -> Result<(), AdapterError> {
        if !self.registry.is_attached(client_id) {
            return Err(AdapterError::NotAttached(client_id.to_string()));
        }
        let canonical = self.identity.resolve(client_id);
        let percentage = self.ledger.percentage(&canonical, self.config.window_ceiling);

        match self.trigger.on_user_message(client_id, text, percentage) {
            UserTurn::Forward => {
                self.orchestrator.send_message(&canonical, text)?;
            }
            UserTurn::CompactFirst { instruction } => {
                match self.orchestrator.send_message(&canonical, &instruction) {
                    Ok(()) => {
                        self.sink.deliver(
                            client_id,
                            &UnifiedMessage::System {
                                subtype: "compacting".to_string(),
                                text: "compacting context before continuing".to_string(),
                            },
                        );
                    }
                    Err(err) => {
                        // Roll back so the session is not stuck compacting
                        // and the user's message still goes out.
                        log::error!("compact instruction failed for {}: {}", client_id, err);
                        self.sink.deliver(
                            client_id,
                            &UnifiedMessage::Error {
                                message: format!("compaction failed to start: {err}"),
                            },
                        );
                        if let Some(held) = self.trigger.rollback_send(client_id) {
                            self.orchestrator.send_message(&canonical, &held)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn interrupt(&mut self, client_id: &str) -> Result<(), AdapterError> {
        let canonical = self.identity.resolve(client_id);
        self.orchestrator.interrupt(&canonical)?;
        Ok(())
    }

    /// Clear the session's context and reset its accounting.
    pub fn clear_context(&mut self, client_id: &str) -> Result<(), AdapterError> {
        let canonical = self.identity.resolve(client_id);
        self.orchestrator.clear_context(&canonical)?;
        self.ledger.remove(&canonical);
        self.sink.deliver(
            client_id,
            &UnifiedMessage::System {
                subtype: "context_cleared".to_string(),
                text: String::new(),
            },
        );
        Ok(())
    }

    /// Close a session: abort its subscriptions and drop all of its state.
    pub fn close(&mut self, client_id: &str) {
        let canonical = self.identity.resolve(client_id);
        self.registry.close(client_id);
        self.dedup.forget_session(client_id);
        self.identity.forget(client_id);
        self.ledger.remove(&canonical);
        self.trigger.forget_session(client_id);
        self.normalizers.remove(client_id);
        self.logs.remove(client_id);
    }

    /// Consume pump events until the bus closes.
    pub async fn run(&mut self) {
        loop {
            let event = match self.events.recv().await {
                Some(event) => event,
                None => break,
            };
            self.handle_pump_event(event);
        }
    }

    /// Process one transport event end to end.
    pub fn handle_pump_event(&mut self, event: PumpEvent) {
        if let Some(log) = self.logs.get(&event.client_id) {
            logging::log_line(log, event.kind.prefix(), &event.payload);
        }

        match event.kind {
            ChannelKind::Message => self.handle_message(&event.client_id, &event.payload),
            ChannelKind::IdentityUpdate => {
                self.handle_identity_update(&event.client_id, &event.payload);
            }
            ChannelKind::Completion => self.handle_completion(&event.client_id),
        }
    }

    fn handle_message(&mut self, client_id: &str, payload: &str) {
        // Migration overlap and re-emission both deliver the identical raw
        // payload twice; drop the second copy before parsing.
        if self.dedup.seen(client_id, payload) {
            log::debug!("duplicate payload dropped for {}", client_id);
            return;
        }
        self.dedup.remember(client_id, payload);

        let Some(normalizer) = self.normalizers.get_mut(client_id) else {
            log::warn!("message for unattached session {}", client_id);
            return;
        };
        let messages = normalizer.normalize(payload);
        for message in messages {
            self.deliver(client_id, message);
        }
    }

    fn handle_identity_update(&mut self, client_id: &str, payload: &str) {
        let update: IdentityUpdate = match serde_json::from_str(payload) {
            Ok(update) => update,
            Err(err) => {
                log::warn!("malformed identity update for {}: {}", client_id, err);
                return;
            }
        };
        if self.identity.resolve(&update.old) == update.new {
            // Already migrated; a re-delivered update is a no-op.
            return;
        }

        // Two-phase: the replacement channels must be confirmed open before
        // the new identity is acted on. The original channels stay alive
        // until the session closes.
        if let Err(err) = self.registry.open_replacement(client_id, &update.new) {
            log::error!(
                "replacement channel setup failed for {}: {}",
                client_id,
                err
            );
            self.sink.deliver(
                client_id,
                &UnifiedMessage::Error {
                    message: format!("failed to open channels for migrated session: {err}"),
                },
            );
            return;
        }

        self.identity.record(&update.old, &update.new);
        self.ledger.merge(&update.old, &update.new);
    }

    fn handle_completion(&mut self, client_id: &str) {
        let Some(normalizer) = self.normalizers.get_mut(client_id) else {
            return;
        };
        for message in normalizer.on_completion() {
            self.deliver(client_id, message);
        }
    }

    /// Deliver one unified message and run the accounting that hangs off it.
    fn deliver(&mut self, client_id: &str, message: UnifiedMessage) {
        match &message {
            UnifiedMessage::ToolUse { input, .. } => {
                self.trigger.note_activity(client_id, &input.to_string());
            }
            UnifiedMessage::AssistantText {
                streaming: false,
                content,
                ..
            } => {
                self.trigger.note_activity(client_id, content);
            }
            _ => {}
        }

        self.sink.deliver(client_id, &message);

        let canonical = self.identity.resolve(client_id);
        match &message {
            UnifiedMessage::Result {
                usage: Some(usage), ..
            } => {
                let compaction_in_flight = self
                    .trigger
                    .state(client_id)
                    .is_some_and(|s| s.is_compacting);
                if self
                    .ledger
                    .looks_like_compaction(&canonical, usage, compaction_in_flight)
                {
                    self.ledger.record_compaction(&canonical);
                    if let Some(held) = self.trigger.on_compaction_complete(client_id) {
                        if let Err(err) = self.orchestrator.send_message(&canonical, &held) {
                            log::error!("failed to release held message: {}", err);
                            self.sink.deliver(
                                client_id,
                                &UnifiedMessage::Error {
                                    message: format!("failed to send message: {err}"),
                                },
                            );
                        }
                    }
                    let entry = self.ledger.get(&canonical).cloned();
                    if let Some(entry) = entry {
                        self.sink.deliver(
                            client_id,
                            &UnifiedMessage::System {
                                subtype: "compaction_complete".to_string(),
                                text: format!("{} tokens saved", entry.tokens_saved),
                            },
                        );
                    }
                } else {
                    self.ledger.apply_usage(&canonical, usage);
                    self.evaluate_trigger(client_id, &canonical);
                }
            }
            UnifiedMessage::Result {
                usage: None,
                subtype,
                ..
            } => {
                // Protocol anomaly: a turn ended without usage counters. The
                // turn still happened, so it counts toward the minimum
                // message guard.
                log::warn!(
                    "result without usage for {} (subtype {})",
                    client_id,
                    subtype
                );
                self.ledger.apply_usage(&canonical, &Usage::default());
            }
            UnifiedMessage::Usage { usage } => {
                // Mid-turn usage notifications are cumulative snapshots of
                // the whole thread, so they override rather than accumulate.
                let total = usage.cache_read + usage.input + usage.output;
                self.ledger.apply_server_total(&canonical, total);
                self.evaluate_trigger(client_id, &canonical);
            }
            _ => {}
        }
    }

    fn evaluate_trigger(&mut self, client_id: &str, canonical: &str) {
        let Some(entry) = self.ledger.get(canonical).cloned() else {
            return;
        };
        let percentage = self.ledger.percentage(canonical, self.config.window_ceiling);
        let action =
            self.trigger
                .evaluate(client_id, &entry, percentage, self.config.window_ceiling);

        match action {
            CompactionAction::None => {}
            CompactionAction::Warning => {
                self.sink.deliver(
                    client_id,
                    &UnifiedMessage::System {
                        subtype: "context_warning".to_string(),
                        text: format!("context window {:.0}% full", percentage * 100.0),
                    },
                );
            }
            CompactionAction::AutoTrigger | CompactionAction::Force => {
                let blocked = self.hooks.as_ref().is_some_and(|hooks| {
                    hooks.fire(
                        "compaction_trigger",
                        &serde_json::json!({
                            "sessionId": client_id,
                            "usagePercentage": percentage,
                            "actionType": action.as_str(),
                        }),
                    )
                });
                if blocked {
                    log::info!("compaction for {} blocked by hook", client_id);
                    return;
                }
                self.trigger.schedule(client_id);
                self.ledger.mark_auto_compact_triggered(canonical);
                self.sink.deliver(
                    client_id,
                    &UnifiedMessage::System {
                        subtype: "compaction_scheduled".to_string(),
                        text: format!(
                            "context window {:.0}% full, compacting on next message",
                            percentage * 100.0
                        ),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockOrchestrator {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail_next_send: Arc<AtomicBool>,
    }

    impl Orchestrator for MockOrchestrator {
        fn spawn_session(&self, _: &str, _: Provider) -> Result<(), OrchestratorError> {
            Ok(())
        }

        fn send_message(&self, session_id: &str, text: &str) -> Result<(), OrchestratorError> {
            if self.fail_next_send.swap(false, Ordering::SeqCst) {
                return Err(OrchestratorError("process exited".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((session_id.to_string(), text.to_string()));
            Ok(())
        }

        fn interrupt(&self, _: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }

        fn clear_context(&self, _: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        messages: Mutex<Vec<(String, UnifiedMessage)>>,
    }

    impl MessageSink for CollectingSink {
        fn deliver(&self, client_id: &str, message: &UnifiedMessage) {
            self.messages
                .lock()
                .unwrap()
                .push((client_id.to_string(), message.clone()));
        }
    }

    impl CollectingSink {
        fn count_kind(&self, pred: impl Fn(&UnifiedMessage) -> bool) -> usize {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, m)| pred(m))
                .count()
        }

        fn has_system(&self, subtype: &str) -> bool {
            self.count_kind(|m| matches!(m, UnifiedMessage::System { subtype: s, .. } if s == subtype))
                > 0
        }
    }

    struct BlockingHook {
        block: bool,
        fired: Mutex<Vec<String>>,
    }

    impl HookSink for BlockingHook {
        fn fire(&self, name: &str, _payload: &serde_json::Value) -> bool {
            self.fired.lock().unwrap().push(name.to_string());
            self.block
        }
    }

    struct Harness {
        adapter: SessionAdapter,
        bus: Arc<ChannelBus>,
        sink: Arc<CollectingSink>,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail_next_send: Arc<AtomicBool>,
    }

    fn harness(config: AdapterConfig) -> Harness {
        harness_with_hooks(config, None)
    }

    fn harness_with_hooks(config: AdapterConfig, hooks: Option<Arc<dyn HookSink>>) -> Harness {
        let bus = Arc::new(ChannelBus::new());
        let sink = Arc::new(CollectingSink::default());
        let orchestrator = MockOrchestrator::default();
        let sent = orchestrator.sent.clone();
        let fail_next_send = orchestrator.fail_next_send.clone();
        let mut adapter = SessionAdapter::new(
            config,
            bus.clone(),
            Box::new(orchestrator),
            sink.clone(),
        );
        if let Some(hooks) = hooks {
            adapter = adapter.with_hooks(hooks);
        }
        Harness {
            adapter,
            bus,
            sink,
            sent,
            fail_next_send,
        }
    }

    fn test_config() -> AdapterConfig {
        AdapterConfig {
            // 80k tokens land at ~61%, inside the auto band.
            window_ceiling: 131_072,
            ..AdapterConfig::default()
        }
    }

    /// Emit on the bus and drain every pending pump event through the
    /// adapter.
    async fn pump(h: &mut Harness) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(event) = h.adapter.events.try_recv() {
            h.adapter.handle_pump_event(event);
        }
    }

    fn result_payload(input: u64, output: u64, cache_read: u64) -> String {
        format!(
            r#"{{"type":"result","subtype":"success","is_error":false,"usage":{{"input_tokens":{input},"output_tokens":{output},"cache_read_input_tokens":{cache_read},"cache_creation_input_tokens":0}}}}"#
        )
    }

    mod pipeline {
        use super::*;

        #[tokio::test]
        async fn message_events_reach_the_sink() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus.emit(
                "message:c1",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#,
            );
            pump(&mut h).await;

            assert_eq!(
                h.sink
                    .count_kind(|m| matches!(m, UnifiedMessage::AssistantText { .. })),
                1
            );
        }

        #[tokio::test]
        async fn duplicate_raw_payload_delivered_once() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            let payload = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"done"}]}}"#;
            h.bus.emit("message:c1", payload);
            h.bus.emit("message:c1", payload);
            pump(&mut h).await;

            assert_eq!(
                h.sink
                    .count_kind(|m| matches!(m, UnifiedMessage::AssistantText { .. })),
                1
            );
        }

        #[tokio::test]
        async fn completion_without_result_unsticks_streaming() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus.emit(
                "message:c1",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"part"}}"#,
            );
            h.bus.emit("completion:c1", "");
            h.bus.emit("completion:c1", "");
            pump(&mut h).await;

            assert_eq!(
                h.sink
                    .count_kind(|m| matches!(m, UnifiedMessage::StreamingEnd)),
                1
            );
        }

        #[tokio::test]
        async fn result_usage_lands_in_the_ledger() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus.emit("message:c1", &result_payload(200, 100, 1500));
            pump(&mut h).await;

            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.total_tokens, 1800);
            assert_eq!(entry.message_count, 1);
        }

        #[tokio::test]
        async fn output_only_result_does_not_reset_ledger() {
            // A provider that never reports cache usage produces
            // output-with-no-cache-read on every turn; that shape must not
            // be mistaken for a compaction outside an actual compact.
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus.emit("message:c1", &result_payload(800, 300, 0));
            h.bus.emit("message:c1", &result_payload(0, 120, 0));
            pump(&mut h).await;

            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.compact_count, 0);
            assert_eq!(entry.tokens_saved, 0);
            assert_eq!(entry.total_tokens, 800 + 300 + 120);
            assert_eq!(entry.message_count, 2);
        }

        #[tokio::test]
        async fn result_without_usage_still_counts_the_turn() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus
                .emit("message:c1", r#"{"type":"result","subtype":"success"}"#);
            pump(&mut h).await;

            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.message_count, 1);
            assert_eq!(entry.total_tokens, 0);
        }

        #[tokio::test]
        async fn send_message_requires_attachment() {
            let mut h = harness(test_config());
            assert!(matches!(
                h.adapter.send_user_message("ghost", "hi"),
                Err(AdapterError::NotAttached(_))
            ));
        }
    }

    mod migration {
        use super::*;

        fn identity_payload(old: &str, new: &str) -> String {
            format!(r#"{{"old":"{old}","new":"{new}"}}"#)
        }

        #[tokio::test]
        async fn events_flow_from_both_channels_without_gap() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus
                .emit("identity-update:c1", &identity_payload("c1", "real-1"));
            pump(&mut h).await;

            // Old channel still live, new channel live too.
            h.bus.emit("message:c1", &result_payload(100, 50, 0));
            h.bus.emit("message:real-1", &result_payload(20, 10, 1000));
            pump(&mut h).await;

            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.session_id, "real-1");
            assert_eq!(entry.message_count, 2);
        }

        #[tokio::test]
        async fn duplicate_payload_across_channels_dedups() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus
                .emit("identity-update:c1", &identity_payload("c1", "real-1"));
            pump(&mut h).await;

            let payload = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"overlap"}]}}"#;
            h.bus.emit("message:c1", payload);
            h.bus.emit("message:real-1", payload);
            pump(&mut h).await;

            assert_eq!(
                h.sink
                    .count_kind(|m| matches!(m, UnifiedMessage::AssistantText { .. })),
                1
            );
        }

        #[tokio::test]
        async fn ledger_entries_merge_across_migration() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus.emit("message:c1", &result_payload(1000, 400, 8000));
            pump(&mut h).await;

            h.bus
                .emit("identity-update:c1", &identity_payload("c1", "real-1"));
            pump(&mut h).await;

            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.session_id, "real-1");
            assert_eq!(entry.total_tokens, 8000 + 1000 + 400);
        }

        #[tokio::test]
        async fn redelivered_identity_update_is_a_noop() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            let update = identity_payload("c1", "real-1");
            h.bus.emit("identity-update:c1", &update);
            pump(&mut h).await;
            h.bus.emit("identity-update:c1", &update);
            pump(&mut h).await;

            h.bus.emit("message:real-1", &result_payload(10, 5, 0));
            pump(&mut h).await;
            assert_eq!(h.adapter.token_entry("c1").unwrap().message_count, 1);
        }

        #[tokio::test]
        async fn malformed_identity_update_is_ignored() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            h.bus.emit("identity-update:c1", "not json");
            pump(&mut h).await;

            h.bus.emit("message:c1", &result_payload(10, 5, 0));
            pump(&mut h).await;
            assert_eq!(h.adapter.token_entry("c1").unwrap().session_id, "c1");
        }
    }

    mod compaction_flow {
        use super::*;

        /// Push the session to ~61% of a 131_072-token window across three
        /// result messages.
        async fn fill_context(h: &mut Harness) {
            h.bus.emit("message:c1", &result_payload(1000, 500, 20_000));
            h.bus.emit("message:c1", &result_payload(200, 300, 40_000));
            h.bus.emit("message:c1", &result_payload(300, 200, 78_000));
            pump(h).await;
        }

        #[tokio::test]
        async fn high_usage_schedules_compaction() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            fill_context(&mut h).await;

            assert!(h.sink.has_system("compaction_scheduled"));
            assert!(h.adapter.token_entry("c1").unwrap().auto_compact_triggered);
        }

        #[tokio::test]
        async fn compact_instruction_precedes_held_user_message() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            fill_context(&mut h).await;

            h.adapter.send_user_message("c1", "keep going").unwrap();
            {
                let sent = h.sent.lock().unwrap();
                assert_eq!(sent.len(), 1);
                assert!(sent[0].1.starts_with("/compact"));
            }

            // The provider compacts and reports a zero-usage result.
            h.bus.emit("message:c1", &result_payload(0, 0, 0));
            pump(&mut h).await;

            let sent = h.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1].1, "keep going");
        }

        #[tokio::test]
        async fn compaction_resets_ledger_and_credits_savings() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            fill_context(&mut h).await;
            let before = h.adapter.token_entry("c1").unwrap().total_tokens;

            h.adapter.send_user_message("c1", "go").unwrap();
            h.bus.emit("message:c1", &result_payload(0, 0, 0));
            pump(&mut h).await;

            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.total_tokens, 0);
            assert_eq!(entry.compact_count, 1);
            assert_eq!(entry.tokens_saved, before);
            assert!(!entry.auto_compact_triggered);
            assert!(h.sink.has_system("compaction_complete"));
        }

        #[tokio::test]
        async fn failed_compact_send_rolls_back_and_forwards_message() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            fill_context(&mut h).await;

            h.fail_next_send.store(true, Ordering::SeqCst);
            h.adapter.send_user_message("c1", "keep going").unwrap();

            // The compact send failed; the user message went out directly.
            let sent = h.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1, "keep going");
            drop(sent);
            assert!(h
                .sink
                .count_kind(|m| matches!(m, UnifiedMessage::Error { .. }))
                > 0);
        }

        #[tokio::test]
        async fn warning_band_only_warns() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            // ~57%: above warn, below auto.
            h.bus.emit("message:c1", &result_payload(1000, 500, 20_000));
            h.bus.emit("message:c1", &result_payload(200, 300, 40_000));
            h.bus.emit("message:c1", &result_payload(100, 100, 73_500));
            pump(&mut h).await;

            assert!(h.sink.has_system("context_warning"));
            assert!(!h.sink.has_system("compaction_scheduled"));
        }

        #[tokio::test]
        async fn too_few_messages_never_triggers() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();

            // One message straight to 61%; under the minimum message count.
            h.bus.emit("message:c1", &result_payload(1500, 500, 78_000));
            pump(&mut h).await;

            assert!(!h.sink.has_system("compaction_scheduled"));
        }

        #[tokio::test]
        async fn blocking_hook_prevents_scheduling() {
            let hook = Arc::new(BlockingHook {
                block: true,
                fired: Mutex::new(Vec::new()),
            });
            let mut h = harness_with_hooks(test_config(), Some(hook.clone()));

            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            fill_context(&mut h).await;

            assert_eq!(hook.fired.lock().unwrap().as_slice(), ["compaction_trigger"]);
            assert!(!h.sink.has_system("compaction_scheduled"));

            // No compact instruction; the message is forwarded directly.
            h.adapter.send_user_message("c1", "hi").unwrap();
            let sent = h.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1, "hi");
        }

        #[tokio::test]
        async fn hook_payload_names_session_and_action() {
            struct AssertingHook;
            impl HookSink for AssertingHook {
                fn fire(&self, name: &str, payload: &serde_json::Value) -> bool {
                    assert_eq!(name, "compaction_trigger");
                    assert_eq!(payload["sessionId"], "c1");
                    assert_eq!(payload["actionType"], "auto");
                    assert!(payload["usagePercentage"].as_f64().unwrap() > 0.60);
                    false
                }
            }

            let mut h = harness_with_hooks(test_config(), Some(Arc::new(AssertingHook)));
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            fill_context(&mut h).await;

            assert!(h.sink.has_system("compaction_scheduled"));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn clear_context_resets_ledger() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            h.bus.emit("message:c1", &result_payload(100, 50, 1000));
            pump(&mut h).await;

            h.adapter.clear_context("c1").unwrap();
            assert!(h.adapter.token_entry("c1").is_none());
            assert!(h.sink.has_system("context_cleared"));
        }

        #[tokio::test]
        async fn close_drops_all_session_state() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            h.bus.emit("message:c1", &result_payload(100, 50, 1000));
            pump(&mut h).await;

            h.adapter.close("c1");
            assert!(h.adapter.token_entry("c1").is_none());

            // Late events for the closed session go nowhere.
            h.bus.emit("message:c1", &result_payload(1, 1, 1));
            pump(&mut h).await;
            assert!(h.adapter.token_entry("c1").is_none());
        }

        #[tokio::test]
        async fn double_attach_surfaces_error() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Claude).await.unwrap();
            let err = h.adapter.attach("c1", Provider::Claude).await;
            assert!(matches!(err, Err(AdapterError::Registry(_))));
            assert!(h
                .sink
                .count_kind(|m| matches!(m, UnifiedMessage::Error { .. }))
                > 0);
        }
    }

    mod codex_usage {
        use super::*;

        #[tokio::test]
        async fn mid_turn_usage_overrides_total() {
            let mut h = harness(test_config());
            h.adapter.attach("c1", Provider::Codex).await.unwrap();

            h.bus.emit(
                "message:c1",
                r#"{"method":"thread/tokenUsage/updated","params":{"input_tokens":100,"output_tokens":40,"cached_input_tokens":900}}"#,
            );
            h.bus.emit(
                "message:c1",
                r#"{"method":"thread/tokenUsage/updated","params":{"input_tokens":150,"output_tokens":60,"cached_input_tokens":1040}}"#,
            );
            pump(&mut h).await;

            // Snapshots override; they never accumulate.
            let entry = h.adapter.token_entry("c1").unwrap();
            assert_eq!(entry.total_tokens, 150 + 60 + 1040);
            assert_eq!(entry.message_count, 2);
        }
    }
}
