//! Standard expansion of host control escapes.
//!
//! Supported tokens (case-insensitive): `\V[n]` variable value, `\N[n]`
//! actor name, `\P[n]` party member name (1-based), `\G` currency unit.
//! `\V` is expanded twice so `\V[\V[1]]` resolves the inner id first.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};

use crate::host::{ControlExpander, SlotId, VariableStore};

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\\V\[(\d+)\]").expect("variable pattern is valid"))
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\\([NP])\[(\d+)\]|\\G").expect("name pattern is valid")
    })
}

pub struct StandardExpander {
    variables: Arc<dyn VariableStore>,
    actors: HashMap<u32, String>,
    party: Vec<String>,
    currency_unit: String,
}

impl StandardExpander {
    pub fn new(variables: Arc<dyn VariableStore>) -> Self {
        Self {
            variables,
            actors: HashMap::new(),
            party: Vec::new(),
            currency_unit: String::new(),
        }
    }

    pub fn with_actors(mut self, actors: HashMap<u32, String>) -> Self {
        self.actors = actors;
        self
    }

    pub fn with_party(mut self, party: Vec<String>) -> Self {
        self.party = party;
        self
    }

    pub fn with_currency_unit(mut self, unit: impl Into<String>) -> Self {
        self.currency_unit = unit.into();
        self
    }

    fn variable_text(&self, id: &str) -> String {
        self.variables
            .get(&SlotId::from(id))
            .map(|value| match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    }

    fn expand_variables(&self, text: &str) -> String {
        variable_pattern()
            .replace_all(text, |caps: &Captures| self.variable_text(&caps[1]))
            .into_owned()
    }
}

impl ControlExpander for StandardExpander {
    fn expand(&self, text: &str) -> String {
        if !text.contains('\\') {
            return text.to_string();
        }

        let text = self.expand_variables(&self.expand_variables(text));

        name_pattern()
            .replace_all(&text, |caps: &Captures| {
                let Some(kind) = caps.get(1) else {
                    return self.currency_unit.clone();
                };
                let n: usize = caps[2].parse().unwrap_or(0);
                match kind.as_str() {
                    "N" | "n" => u32::try_from(n)
                        .ok()
                        .and_then(|id| self.actors.get(&id))
                        .cloned()
                        .unwrap_or_default(),
                    _ => n
                        .checked_sub(1)
                        .and_then(|i| self.party.get(i))
                        .cloned()
                        .unwrap_or_default(),
                }
            })
            .into_owned()
    }
}
