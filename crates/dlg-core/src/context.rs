//! Per-conversation context window.
//!
//! A context is a fixed prefix (system instruction, optional per-invocation
//! supplemental instruction, optional user/assistant example pair) followed
//! by the conversational exchange. Only the exchange is ever trimmed.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::host::{ControlExpander, SlotId, VariableStore};
use crate::message::{Message, Role};

/// A user/assistant exchange placed after the system instructions as a
/// style primer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamplePair {
    pub user: String,
    pub assistant: String,
}

/// Inputs for the fixed prefix of a context.
#[derive(Debug, Clone, Default)]
pub struct PrefixSpec<'a> {
    pub system: &'a str,
    pub supplemental: Option<&'a str>,
    pub example: Option<&'a ExamplePair>,
}

impl PrefixSpec<'_> {
    /// Compose the prefix messages, expanding escapes in every authored text.
    pub fn build(&self, expander: &dyn ControlExpander) -> Vec<Message> {
        let mut prefix = vec![Message::system(expander.expand(self.system))];

        if let Some(extra) = self.supplemental.filter(|s| !s.trim().is_empty()) {
            prefix.push(Message::system(expander.expand(extra)));
        }

        if let Some(example) = self.example {
            prefix.push(Message::user(expander.expand(&example.user)));
            prefix.push(Message::assistant(expander.expand(&example.assistant)));
        }

        prefix
    }
}

/// Pick the user message for an invocation.
///
/// A non-blank `explicit` text wins and is escape-expanded; otherwise the
/// text stored at `slot` is used. `before` and `after` wrap whichever source
/// was chosen. Returns `None` when neither source has text.
pub fn resolve_user_message(
    variables: &dyn VariableStore,
    slot: Option<&SlotId>,
    explicit: &str,
    before: &str,
    after: &str,
    expander: &dyn ControlExpander,
) -> Option<String> {
    let body = if !explicit.trim().is_empty() {
        expander.expand(explicit)
    } else {
        slot.and_then(|id| variables.get_text(id))?
    };

    Some(format!(
        "{}{}{}",
        expander.expand(before),
        body,
        expander.expand(after)
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    prefix: Vec<Message>,
    exchange: VecDeque<Message>,
}

impl ConversationContext {
    pub fn new(prefix: Vec<Message>) -> Self {
        Self {
            prefix,
            exchange: VecDeque::new(),
        }
    }

    /// Load the context persisted at `slot`. Anything that does not decode
    /// (never written, cleared by the host, foreign shape) starts fresh.
    pub fn load(variables: &dyn VariableStore, slot: &SlotId) -> Self {
        match variables.get(slot) {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                debug!(slot = %slot, "Discarding undecodable context: {}", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn save(&self, variables: &dyn VariableStore, slot: &SlotId) {
        match serde_json::to_value(self) {
            Ok(value) => variables.set(slot, value),
            Err(e) => debug!(slot = %slot, "Failed to serialize context: {}", e),
        }
    }

    /// Replace the fixed prefix. The exchange is kept.
    pub fn set_prefix(&mut self, prefix: Vec<Message>) {
        self.prefix = prefix;
    }

    pub fn prefix(&self) -> &[Message] {
        &self.prefix
    }

    pub fn exchange(&self) -> &VecDeque<Message> {
        &self.exchange
    }

    /// The full outgoing message array: prefix then exchange.
    pub fn messages(&self) -> Vec<Message> {
        self.prefix
            .iter()
            .chain(self.exchange.iter())
            .cloned()
            .collect()
    }

    /// Append a turn. With retention disabled (`retention == 0`) prior
    /// turns are dropped first, leaving the prefix plus this message.
    pub fn append_turn(&mut self, message: Message, retention: usize) {
        if retention == 0 {
            self.exchange.clear();
        }
        self.exchange.push_back(message);
    }

    /// Evict the oldest exchange messages until at most `cap_pairs * 2`
    /// remain. An assistant message left at the front without its user turn
    /// is evicted too, so the exchange always opens with a user message.
    ///
    /// A cap of zero means retention is disabled; `append_turn` already
    /// reset the exchange in that case, so nothing is evicted.
    pub fn trim(&mut self, cap_pairs: usize) {
        if cap_pairs == 0 {
            return;
        }
        let cap = cap_pairs.saturating_mul(2);
        let mut evicted = 0usize;

        while self.exchange.len() > cap {
            self.exchange.pop_front();
            evicted += 1;
        }
        while self.exchange.len() > 1
            && self.exchange.front().map(|m| m.role) == Some(Role::Assistant)
        {
            self.exchange.pop_front();
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.exchange.len(), "Trimmed context");
        }
    }

    /// Record the completed assistant answer. Only called once the stream
    /// reached its terminal sentinel.
    pub fn finalize_assistant_turn(&mut self, full_text: impl Into<String>) {
        self.exchange.push_back(Message::assistant(full_text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoExpansion;
    use crate::testing::MemoryVariables;

    fn prefix() -> Vec<Message> {
        PrefixSpec {
            system: "Answer briefly.",
            supplemental: None,
            example: None,
        }
        .build(&NoExpansion)
    }

    fn exchange_turn(ctx: &mut ConversationContext, n: usize, retention: usize) {
        ctx.append_turn(Message::user(format!("q{}", n)), retention);
        ctx.trim(retention);
        ctx.finalize_assistant_turn(format!("a{}", n));
    }

    #[test]
    fn test_prefix_composition() {
        let example = ExamplePair {
            user: "Who are you?".into(),
            assistant: "A humble innkeeper.".into(),
        };
        let prefix = PrefixSpec {
            system: "Please answer in Japanese.",
            supplemental: Some("Speak like an old man."),
            example: Some(&example),
        }
        .build(&NoExpansion);

        let roles: Vec<Role> = prefix.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::User, Role::Assistant]
        );
        assert_eq!(prefix[1].content, "Speak like an old man.");
    }

    #[test]
    fn test_blank_supplemental_is_skipped() {
        let prefix = PrefixSpec {
            system: "base",
            supplemental: Some("   "),
            example: None,
        }
        .build(&NoExpansion);
        assert_eq!(prefix.len(), 1);
    }

    #[test]
    fn test_resolve_prefers_explicit_text() {
        let vars = MemoryVariables::new();
        let slot = SlotId::from(5);
        vars.set(&slot, "from slot".into());

        let msg = resolve_user_message(&vars, Some(&slot), "typed", "[", "]", &NoExpansion);
        assert_eq!(msg.as_deref(), Some("[typed]"));
    }

    #[test]
    fn test_resolve_falls_back_to_slot() {
        let vars = MemoryVariables::new();
        let slot = SlotId::from(5);
        vars.set(&slot, "from slot".into());

        let msg = resolve_user_message(&vars, Some(&slot), "", "", "?", &NoExpansion);
        assert_eq!(msg.as_deref(), Some("from slot?"));
    }

    #[test]
    fn test_resolve_fails_when_both_empty() {
        let vars = MemoryVariables::new();
        let slot = SlotId::from(5);
        assert_eq!(
            resolve_user_message(&vars, Some(&slot), "", "before", "after", &NoExpansion),
            None
        );
        assert_eq!(
            resolve_user_message(&vars, None, "  ", "", "", &NoExpansion),
            None
        );
    }

    #[test]
    fn test_retention_cap_holds_for_any_sequence() {
        for retention in 1..=5 {
            let mut ctx = ConversationContext::new(prefix());
            let original_prefix = ctx.prefix().to_vec();
            for n in 0..20 {
                exchange_turn(&mut ctx, n, retention);
                assert!(ctx.exchange().len() <= retention * 2);
                assert_eq!(ctx.prefix(), original_prefix.as_slice());
                assert_eq!(ctx.exchange().front().unwrap().role, Role::User);
            }
        }
    }

    #[test]
    fn test_retention_three_evicts_oldest_pair() {
        let mut ctx = ConversationContext::new(prefix());
        for n in 1..=3 {
            exchange_turn(&mut ctx, n, 3);
        }
        assert_eq!(ctx.exchange().len(), 6);

        exchange_turn(&mut ctx, 4, 3);

        let contents: Vec<&str> = ctx.exchange().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q2", "a2", "q3", "a3", "q4", "a4"]);
    }

    #[test]
    fn test_pending_turn_never_exceeds_cap() {
        let mut ctx = ConversationContext::new(prefix());
        for n in 1..=3 {
            exchange_turn(&mut ctx, n, 3);
        }
        ctx.append_turn(Message::user("q4"), 3);
        ctx.trim(3);
        assert!(ctx.exchange().len() <= 6);
        assert_eq!(ctx.exchange().back().unwrap().content, "q4");
    }

    #[test]
    fn test_retention_zero_resets_every_invocation() {
        let mut ctx = ConversationContext::new(prefix());
        for n in 1..=3 {
            exchange_turn(&mut ctx, n, 4);
        }

        ctx.append_turn(Message::user("fresh"), 0);
        ctx.trim(0);

        let mut expected = prefix();
        expected.push(Message::user("fresh"));
        assert_eq!(ctx.messages(), expected);
    }

    #[test]
    fn test_persistence_round_trip_through_store() {
        let vars = MemoryVariables::new();
        let slot = SlotId::from(3);
        let mut ctx = ConversationContext::new(prefix());
        exchange_turn(&mut ctx, 1, 2);
        ctx.save(&vars, &slot);

        assert_eq!(ConversationContext::load(&vars, &slot), ctx);
    }

    #[test]
    fn test_load_of_cleared_slot_starts_fresh() {
        let vars = MemoryVariables::new();
        let slot = SlotId::from(3);
        vars.set(&slot, serde_json::Value::String(String::new()));

        let ctx = ConversationContext::load(&vars, &slot);
        assert!(ctx.exchange().is_empty());
        assert!(ctx.prefix().is_empty());
    }
}
