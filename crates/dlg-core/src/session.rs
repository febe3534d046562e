//! Streaming session orchestrator.
//!
//! One [`Orchestrator`] per host session. Each [`Orchestrator::invoke`] call
//! resolves the user message, updates the conversation context, sends the
//! request and drives the framed stream into the render surface and the
//! answer slot, holding the interaction lock for the duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::context::{resolve_user_message, ConversationContext, ExamplePair, PrefixSpec};
use crate::display::{wrap, DisplayOptions, DisplayPipeline};
use crate::error::Error;
use crate::framer::frame_lines;
use crate::host::{
    ControlExpander, InputLock, MessageSurface, RenderSurface, SlotId, SwitchStore, VariableStore,
};
use crate::lock::{Acknowledgement, InteractionLock, StreamLease};
use crate::message::Message;
use crate::protocol::{parse_completion, parse_line, SseEvent};
use crate::request::{self, ChatRequest, SamplingParams};
use crate::transport::{ByteStream, Transport};
use crate::Result;

const ERROR_WRAP_WIDTH: usize = 60;

/// Host collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Host {
    pub variables: Arc<dyn VariableStore>,
    pub switches: Arc<dyn SwitchStore>,
    pub input: Arc<dyn InputLock>,
    pub surface: Arc<dyn RenderSurface>,
    pub messages: Arc<dyn MessageSurface>,
    pub expander: Arc<dyn ControlExpander>,
}

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model: String,
    pub system_message: String,
    pub stream: bool,
    /// Receives the resolved question of every invocation.
    pub question_slot: Option<SlotId>,
    pub answer_slot: SlotId,
    pub memory_slot: SlotId,
    /// When this switch is on, answers are stored but not displayed.
    pub hide_switch: Option<SlotId>,
    pub display: DisplayOptions,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            system_message: "Please answer in Japanese.".to_string(),
            stream: true,
            question_slot: Some(SlotId::from(1)),
            answer_slot: SlotId::from(2),
            memory_slot: SlotId::from(3),
            hide_switch: None,
            display: DisplayOptions::default(),
        }
    }
}

/// Where an invocation keeps its history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Memory {
    /// The session's memory slot.
    #[default]
    Default,
    /// A per-invocation slot.
    Slot(SlotId),
    /// No persisted history; every call starts from the prefix.
    Disabled,
}

/// Arguments of one invocation.
#[derive(Clone, Default)]
pub struct Invocation {
    pub message: String,
    pub before: String,
    pub after: String,
    /// Appended as a second system message for this invocation only.
    pub system: Option<String>,
    pub example: Option<ExamplePair>,
    pub sampling: SamplingParams,
    /// Number of exchanges kept. 0 disables retention.
    pub retention: usize,
    /// Slot read when `message` is blank. Falls back to the question slot.
    pub question_source: Option<SlotId>,
    pub answer_slot: Option<SlotId>,
    pub memory: Memory,
    /// Do not lock the host or render; only store the answer.
    pub silent: bool,
    /// Direction lock of the actor being talked to.
    pub actor: Option<Arc<dyn InputLock>>,
}

impl Invocation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retention: 10,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No user message could be resolved; nothing changed.
    Skipped,
    /// Another invocation holds the session.
    Rejected,
    /// The answer streamed to completion. If it was displayed, the lock is
    /// now awaiting acknowledgement.
    Completed { answer: String },
    /// The invocation failed and the host was unlocked.
    Failed(Error),
}

/// Transient per-invocation stream state.
#[derive(Default)]
struct StreamSession {
    raw: String,
    fragments: usize,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    host: Host,
    settings: EngineSettings,
    lock: InteractionLock,
    in_flight: AtomicBool,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn Transport>, host: Host, settings: EngineSettings) -> Self {
        Self {
            transport,
            host,
            settings,
            lock: InteractionLock::new(),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn interaction_lock(&self) -> &InteractionLock {
        &self.lock
    }

    /// Whether an invocation is running or awaiting acknowledgement.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) || self.lock.is_busy()
    }

    /// Forward the host's "ok" gesture to the interaction lock.
    pub fn acknowledge(&self) -> Acknowledgement {
        self.lock.acknowledge(self.host.surface.as_ref())
    }

    pub async fn invoke(&self, invocation: Invocation) -> Outcome {
        if self.lock.is_busy()
            || self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            warn!("Invocation rejected: another conversation is in progress");
            return Outcome::Rejected;
        }
        let _in_flight = InFlight(&self.in_flight);

        if let Err(e) = invocation.sampling.validate() {
            return self.fail(e, None);
        }

        let expander = self.host.expander.as_ref();
        let source = invocation
            .question_source
            .as_ref()
            .or(self.settings.question_slot.as_ref());
        let Some(user_message) = resolve_user_message(
            self.host.variables.as_ref(),
            source,
            &invocation.message,
            &invocation.before,
            &invocation.after,
            expander,
        ) else {
            debug!("No user message resolved; skipping");
            return Outcome::Skipped;
        };

        if let Some(slot) = &self.settings.question_slot {
            self.host
                .variables
                .set(slot, serde_json::Value::String(user_message.clone()));
        }

        let (memory_slot, retention) = match &invocation.memory {
            Memory::Default => (Some(&self.settings.memory_slot), invocation.retention),
            Memory::Slot(slot) => (Some(slot), invocation.retention),
            Memory::Disabled => (None, 0),
        };

        let mut context = memory_slot
            .map(|slot| ConversationContext::load(self.host.variables.as_ref(), slot))
            .unwrap_or_default();
        context.set_prefix(
            PrefixSpec {
                system: &self.settings.system_message,
                supplemental: invocation.system.as_deref(),
                example: invocation.example.as_ref(),
            }
            .build(expander),
        );
        context.append_turn(Message::user(user_message), retention);
        context.trim(retention);
        if let Some(slot) = memory_slot {
            context.save(self.host.variables.as_ref(), slot);
        }

        let body = match request::build(
            &context,
            &self.settings.model,
            &invocation.sampling,
            self.settings.stream,
        ) {
            Ok(body) => body,
            Err(e) => return self.fail(e, None),
        };

        let visible = !invocation.silent && !self.display_hidden();
        let lease = if visible {
            match self
                .lock
                .begin(Arc::clone(&self.host.input), invocation.actor.clone())
            {
                Ok(lease) => Some(lease),
                Err(_) => return Outcome::Rejected,
            }
        } else {
            None
        };

        info!(
            transport = self.transport.name(),
            messages = body.messages.len(),
            stream = body.stream,
            visible,
            "Sending chat request"
        );

        let answer = match self.exchange(&body, visible).await {
            Ok(answer) => answer,
            Err(e) => return self.fail(e, lease),
        };

        context.finalize_assistant_turn(answer.clone());
        if let Some(slot) = memory_slot {
            context.save(self.host.variables.as_ref(), slot);
        }
        let answer_slot = invocation
            .answer_slot
            .as_ref()
            .unwrap_or(&self.settings.answer_slot);
        self.host
            .variables
            .set(answer_slot, serde_json::Value::String(answer.clone()));

        if let Some(lease) = lease {
            lease.commit();
        }
        info!(chars = answer.chars().count(), "Answer complete");
        Outcome::Completed { answer }
    }

    fn display_hidden(&self) -> bool {
        self.settings
            .hide_switch
            .as_ref()
            .is_some_and(|id| self.host.switches.get(id))
    }

    async fn exchange(&self, body: &ChatRequest, visible: bool) -> Result<String> {
        let bytes = self.transport.send(body).await?;

        let mut pipeline = DisplayPipeline::new(&self.settings.display, self.host.expander.as_ref());
        let surface = self.host.surface.as_ref();
        if visible {
            surface.clear();
        }

        let mut session = StreamSession::default();
        let mut emit = |fragment: &str| {
            session.raw.push_str(fragment);
            session.fragments += 1;
            if visible {
                surface.append(&pipeline.apply(fragment));
            }
        };

        if body.stream {
            drive_stream(bytes, &mut emit).await?;
        } else {
            let answer = parse_completion(&collect_body(bytes).await?)?;
            emit(&answer);
        }
        if visible {
            let rest = pipeline.finish();
            if !rest.is_empty() {
                surface.append(&rest);
            }
        }

        debug!(fragments = session.fragments, "Stream finished");
        Ok(session.raw)
    }

    fn fail(&self, e: Error, lease: Option<StreamLease>) -> Outcome {
        match &e {
            Error::Serialization(detail) => error!("Malformed stream frame: {}", detail),
            other => warn!("Invocation failed: {}", other),
        }
        self.host
            .messages
            .add(&wrap(&e.host_message(), ERROR_WRAP_WIDTH));
        if let Some(lease) = lease {
            lease.abort();
        }
        Outcome::Failed(e)
    }
}

/// Run the framer/parser loop until the terminal sentinel.
async fn drive_stream(bytes: ByteStream, emit: &mut impl FnMut(&str)) -> Result<()> {
    let mut lines = std::pin::pin!(frame_lines(bytes));
    while let Some(line) = lines.next().await {
        let line = line?;
        if !line.terminated {
            // Only a bare sentinel may arrive without its newline.
            if let Ok(Some(SseEvent::Done)) = parse_line(&line.text) {
                return Ok(());
            }
            debug!(tail = %line.text, "Body ended mid-frame");
            break;
        }
        match parse_line(&line.text)? {
            Some(SseEvent::Delta(fragment)) => emit(&fragment),
            Some(SseEvent::Done) => return Ok(()),
            None => {}
        }
    }
    Err(Error::stream("stream ended before [DONE]"))
}

async fn collect_body(mut bytes: ByteStream) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = bytes.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockState;
    use crate::testing::{
        sse_frame, CountingInputLock, MemorySwitches, MemoryVariables, RecordingMessages,
        RecordingSurface, ScriptedTransport,
    };
    use crate::host::NoExpansion;
    use bytes::Bytes;

    struct Fixture {
        variables: Arc<MemoryVariables>,
        switches: Arc<MemorySwitches>,
        input: Arc<CountingInputLock>,
        surface: Arc<RecordingSurface>,
        messages: Arc<RecordingMessages>,
        transport: Arc<ScriptedTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                variables: Arc::new(MemoryVariables::new()),
                switches: Arc::new(MemorySwitches::new()),
                input: Arc::new(CountingInputLock::new()),
                surface: Arc::new(RecordingSurface::new()),
                messages: Arc::new(RecordingMessages::new()),
                transport: Arc::new(ScriptedTransport::new()),
            }
        }

        fn orchestrator(&self, settings: EngineSettings) -> Orchestrator {
            let host = Host {
                variables: self.variables.clone(),
                switches: self.switches.clone(),
                input: self.input.clone(),
                surface: self.surface.clone(),
                messages: self.messages.clone(),
                expander: Arc::new(NoExpansion),
            };
            Orchestrator::new(self.transport.clone(), host, settings)
        }

        fn history(&self) -> ConversationContext {
            ConversationContext::load(self.variables.as_ref(), &SlotId::from(3))
        }
    }

    fn hi_there() -> Vec<String> {
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n".to_string(),
            "data: [DONE]\n".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_streamed_answer_reaches_surface_context_and_slot() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert_eq!(outcome, Outcome::Completed { answer: "Hi there".into() });
        assert_eq!(fx.surface.text(), "Hi there");
        assert_eq!(
            fx.variables.get(&SlotId::from(2)),
            Some(serde_json::json!("Hi there"))
        );
        assert_eq!(
            fx.variables.get(&SlotId::from(1)),
            Some(serde_json::json!("Hello"))
        );
        let history = fx.history();
        assert_eq!(history.exchange().back(), Some(&Message::assistant("Hi there")));
        assert_eq!(
            orchestrator.interaction_lock().state(),
            LockState::AwaitingAcknowledgement
        );

        assert_eq!(orchestrator.acknowledge(), Acknowledgement::Released);
        assert!(!orchestrator.is_busy());
        assert!(!fx.input.is_locked());
    }

    #[tokio::test]
    async fn test_request_carries_context_and_parameters() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let mut invocation = Invocation::new("Where am I?");
        invocation.system = Some("You are the village elder.".into());
        invocation.sampling.temperature = 0.5;
        orchestrator.invoke(invocation).await;

        let request = fx.transport.last_request().unwrap();
        assert!(request.stream);
        assert_eq!(request.temperature, 0.5);
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].content, "You are the village elder.");
        assert_eq!(request.messages[2], Message::user("Where am I?"));
    }

    #[tokio::test]
    async fn test_fragments_split_mid_frame_and_mid_character() {
        let fx = Fixture::new();
        let frame = sse_frame("こんにちは");
        let bytes = [frame.as_bytes(), b"data: [DONE]\n"].concat();
        let (a, b) = bytes.split_at(frame.len() - 20);
        fx.transport.queue_chunks(vec![a.to_vec(), b.to_vec()]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("挨拶して")).await;
        assert_eq!(outcome, Outcome::Completed { answer: "こんにちは".into() });
    }

    #[tokio::test]
    async fn test_display_transform_does_not_touch_raw_answer() {
        let fx = Fixture::new();
        fx.transport
            .queue_chunks(vec![sse_frame("「やあ」\n"), "data: [DONE]\n".to_string()]);
        let settings = EngineSettings {
            display: DisplayOptions {
                newline: Some("<br>".into()),
                ..DisplayOptions::default()
            },
            ..EngineSettings::default()
        };
        let orchestrator = fx.orchestrator(settings);

        orchestrator.invoke(Invocation::new("hi")).await;
        assert_eq!(fx.surface.text(), "やあ<br>");
        assert_eq!(
            fx.variables.get(&SlotId::from(2)),
            Some(serde_json::json!("「やあ」\n"))
        );
    }

    #[tokio::test]
    async fn test_http_error_surfaces_code_and_unlocks() {
        let fx = Fixture::new();
        fx.variables.set(&SlotId::from(2), serde_json::json!("previous"));
        fx.transport
            .queue_error(crate::protocol::decode_error(401, r#"{"error":{"code":"invalid_api_key"}}"#));
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert!(matches!(outcome, Outcome::Failed(Error::Auth(_))));
        assert!(fx.messages.joined().contains("invalid_api_key"));
        assert_eq!(orchestrator.interaction_lock().state(), LockState::Unlocked);
        assert_eq!(fx.input.unlock_count(), 1);
        assert_eq!(
            fx.variables.get(&SlotId::from(2)),
            Some(serde_json::json!("previous"))
        );
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_user_turn_only() {
        let fx = Fixture::new();
        fx.transport.queue_error(Error::network("connection refused"));
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert!(matches!(outcome, Outcome::Failed(Error::Network(_))));
        assert!(!orchestrator.is_busy());
        let history = fx.history();
        assert_eq!(history.exchange().len(), 1);
        assert_eq!(history.exchange()[0], Message::user("Hello"));
    }

    #[tokio::test]
    async fn test_malformed_frame_aborts_without_assistant_turn() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(vec![
            sse_frame("partial"),
            "data: {broken\n".to_string(),
            "data: [DONE]\n".to_string(),
        ]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert!(matches!(outcome, Outcome::Failed(Error::Serialization(_))));
        assert_eq!(orchestrator.interaction_lock().state(), LockState::Unlocked);
        assert!(fx.messages.joined().contains("parse"));
        assert!(fx
            .history()
            .exchange()
            .iter()
            .all(|m| m.role != crate::message::Role::Assistant));
        assert_eq!(fx.variables.get(&SlotId::from(2)), None);
    }

    #[tokio::test]
    async fn test_stream_without_sentinel_is_not_finalized() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(vec![sse_frame("cut off")]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert!(matches!(outcome, Outcome::Failed(Error::Stream(_))));
        assert!(!orchestrator.is_busy());
        assert_eq!(fx.history().exchange().len(), 1);
    }

    #[tokio::test]
    async fn test_body_cut_mid_frame_is_truncation() {
        let fx = Fixture::new();
        fx.transport
            .queue_chunks(vec![sse_frame("Hi"), "data: {\"choi".to_string()]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert_eq!(
            outcome,
            Outcome::Failed(Error::stream("stream ended before [DONE]"))
        );
        assert_eq!(orchestrator.interaction_lock().state(), LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_sentinel_without_trailing_newline() {
        let fx = Fixture::new();
        fx.transport
            .queue_chunks(vec![sse_frame("Hi"), "data: [DONE]".to_string()]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;
        assert_eq!(outcome, Outcome::Completed { answer: "Hi".into() });
    }

    #[tokio::test]
    async fn test_network_error_mid_stream_unlocks_without_answer() {
        let fx = Fixture::new();
        fx.variables.set(&SlotId::from(2), serde_json::json!("previous"));
        fx.transport.queue_stream(vec![
            Ok(Bytes::from(sse_frame("Hi"))),
            Ok(Bytes::from(sse_frame(" the"))),
            Err(Error::network("connection reset")),
        ]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;

        assert!(matches!(outcome, Outcome::Failed(Error::Network(_))));
        assert_eq!(fx.surface.text(), "Hi the");
        assert_eq!(orchestrator.interaction_lock().state(), LockState::Unlocked);
        assert_eq!(fx.input.lock_count(), 1);
        assert_eq!(fx.input.unlock_count(), 1);
        assert!(!orchestrator.is_busy());
        assert_eq!(fx.history().exchange().len(), 1);
        assert_eq!(
            fx.variables.get(&SlotId::from(2)),
            Some(serde_json::json!("previous"))
        );
        assert!(fx.messages.joined().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_escape_split_between_deltas_is_expanded() {
        struct Gold;

        impl ControlExpander for Gold {
            fn expand(&self, text: &str) -> String {
                text.replace("\\G", "gold")
            }
        }

        let fx = Fixture::new();
        fx.transport.queue_chunks(vec![
            sse_frame("100\\"),
            sse_frame("G please"),
            "data: [DONE]\n".to_string(),
        ]);
        let host = Host {
            variables: fx.variables.clone(),
            switches: fx.switches.clone(),
            input: fx.input.clone(),
            surface: fx.surface.clone(),
            messages: fx.messages.clone(),
            expander: Arc::new(Gold),
        };
        let settings = EngineSettings {
            display: DisplayOptions {
                expand_escapes: true,
                replacements: vec![crate::display::Replacement {
                    from: "please".into(),
                    to: "thanks".into(),
                }],
                ..DisplayOptions::default()
            },
            ..EngineSettings::default()
        };
        let orchestrator = Orchestrator::new(fx.transport.clone(), host, settings);

        let outcome = orchestrator.invoke(Invocation::new("Price?")).await;

        assert_eq!(outcome, Outcome::Completed { answer: "100\\G please".into() });
        assert_eq!(fx.surface.text(), "100gold thanks");
    }

    #[tokio::test]
    async fn test_held_tail_is_flushed_at_end_of_answer() {
        let fx = Fixture::new();
        fx.transport
            .queue_chunks(vec![sse_frame("Sure, co"), "data: [DONE]\n".to_string()]);
        let settings = EngineSettings {
            display: DisplayOptions {
                replacements: vec![crate::display::Replacement {
                    from: "coins".into(),
                    to: "G".into(),
                }],
                ..DisplayOptions::default()
            },
            ..EngineSettings::default()
        };
        let orchestrator = fx.orchestrator(settings);

        orchestrator.invoke(Invocation::new("Pay?")).await;
        assert_eq!(fx.surface.text(), "Sure, co");
    }

    #[tokio::test]
    async fn test_lines_after_sentinel_are_not_read() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(vec![
            sse_frame("done"),
            "data: [DONE]\n".to_string(),
            "data: {garbage after the end\n".to_string(),
        ]);
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let outcome = orchestrator.invoke(Invocation::new("Hello")).await;
        assert_eq!(outcome, Outcome::Completed { answer: "done".into() });
    }

    #[tokio::test]
    async fn test_empty_message_is_a_silent_no_op() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(EngineSettings {
            question_slot: None,
            ..EngineSettings::default()
        });

        let outcome = orchestrator.invoke(Invocation::new("")).await;

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(fx.transport.request_count(), 0);
        assert_eq!(fx.input.lock_count(), 0);
        assert!(fx.variables.is_empty());
    }

    #[tokio::test]
    async fn test_question_slot_supplies_message() {
        let fx = Fixture::new();
        fx.variables.set(&SlotId::from(9), serde_json::json!("typed by player"));
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let mut invocation = Invocation::new("");
        invocation.question_source = Some(SlotId::from(9));
        invocation.before = "Player: ".into();
        orchestrator.invoke(invocation).await;

        let request = fx.transport.last_request().unwrap();
        assert_eq!(
            request.messages.last().unwrap().content,
            "Player: typed by player"
        );
    }

    #[tokio::test]
    async fn test_silent_mode_never_locks_or_renders() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let mut invocation = Invocation::new("Hello");
        invocation.silent = true;
        let outcome = orchestrator.invoke(invocation).await;

        assert_eq!(outcome, Outcome::Completed { answer: "Hi there".into() });
        assert_eq!(fx.input.lock_count(), 0);
        assert_eq!(fx.surface.text(), "");
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_hide_switch_behaves_as_silent() {
        let fx = Fixture::new();
        fx.switches.set(&SlotId::from(7), true);
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings {
            hide_switch: Some(SlotId::from(7)),
            ..EngineSettings::default()
        });

        orchestrator.invoke(Invocation::new("Hello")).await;
        assert_eq!(fx.input.lock_count(), 0);
        assert_eq!(
            fx.variables.get(&SlotId::from(2)),
            Some(serde_json::json!("Hi there"))
        );
    }

    #[tokio::test]
    async fn test_invocation_while_awaiting_acknowledgement_is_rejected() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(hi_there());
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings::default());

        orchestrator.invoke(Invocation::new("first")).await;
        let second = orchestrator.invoke(Invocation::new("second")).await;

        assert_eq!(second, Outcome::Rejected);
        assert_eq!(fx.transport.request_count(), 1);

        orchestrator.acknowledge();
        let third = orchestrator.invoke(Invocation::new("third")).await;
        assert!(matches!(third, Outcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_acknowledge_catches_up_scrolled_view_first() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(hi_there());
        let orchestrator = fx.orchestrator(EngineSettings::default());
        orchestrator.invoke(Invocation::new("Hello")).await;

        fx.surface.set_scrolled_to_end(false);
        assert_eq!(orchestrator.acknowledge(), Acknowledgement::CaughtUp);
        assert!(orchestrator.is_busy());
        assert_eq!(orchestrator.acknowledge(), Acknowledgement::Released);
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_retention_across_invocations() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(EngineSettings::default());

        for n in 1..=4 {
            fx.transport
                .queue_chunks(vec![sse_frame(&format!("a{}", n)), "data: [DONE]\n".into()]);
            let mut invocation = Invocation::new(format!("q{}", n));
            invocation.retention = 3;
            orchestrator.invoke(invocation).await;
            orchestrator.acknowledge();
        }

        let contents: Vec<String> = fx
            .history()
            .exchange()
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["q2", "a2", "q3", "a3", "q4", "a4"]);
    }

    #[tokio::test]
    async fn test_disabled_memory_sends_prefix_and_question_only() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(EngineSettings::default());

        for n in 1..=2 {
            fx.transport.queue_chunks(hi_there());
            let mut invocation = Invocation::new(format!("q{}", n));
            invocation.memory = Memory::Disabled;
            orchestrator.invoke(invocation).await;
            orchestrator.acknowledge();
        }

        let request = fx.transport.last_request().unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1], Message::user("q2"));
        assert_eq!(fx.variables.get(&SlotId::from(3)), None);
    }

    #[tokio::test]
    async fn test_non_streaming_envelope() {
        let fx = Fixture::new();
        fx.transport.queue_chunks(vec![
            br#"{"choices":[{"message":{"role":"assistant","content":"#.to_vec(),
            br#""Hello from the envelope"}}]}"#.to_vec(),
        ]);
        let orchestrator = fx.orchestrator(EngineSettings {
            stream: false,
            ..EngineSettings::default()
        });

        let outcome = orchestrator.invoke(Invocation::new("Hi")).await;

        assert_eq!(
            outcome,
            Outcome::Completed { answer: "Hello from the envelope".into() }
        );
        assert!(!fx.transport.last_request().unwrap().stream);
        assert_eq!(fx.surface.text(), "Hello from the envelope");
    }

    #[tokio::test]
    async fn test_invalid_sampling_fails_before_any_mutation() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(EngineSettings::default());

        let mut invocation = Invocation::new("Hello");
        invocation.sampling.top_p = 3.0;
        let outcome = orchestrator.invoke(invocation).await;

        assert!(matches!(outcome, Outcome::Failed(Error::InvalidRequest(_))));
        assert!(fx.variables.is_empty());
        assert_eq!(fx.input.lock_count(), 0);
    }
}
