//! Host collaborator interfaces.
//!
//! The engine never touches host state directly. Everything it needs from
//! the interactive application (variables, switches, input locking, the live
//! render surface, the message surface and escape expansion) is injected
//! through the traits below. All methods take `&self`; hosts share their
//! implementations behind `Arc` and use interior mutability.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Identifier of a host variable or switch.
///
/// Hosts commonly number their variables, so integers and strings are both
/// accepted when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SlotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u32> for SlotId {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for SlotId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => SlotId(n.to_string()),
            Raw::Text(s) => SlotId(s),
        })
    }
}

/// Keyed variable store used for conversation slots and history.
pub trait VariableStore: Send + Sync {
    fn get(&self, id: &SlotId) -> Option<Value>;

    fn set(&self, id: &SlotId, value: Value);

    /// Read a variable as non-empty text. Numbers are rendered; empty
    /// strings, nulls, arrays and objects count as absent.
    fn get_text(&self, id: &SlotId) -> Option<String> {
        match self.get(id)? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Boolean switch store.
pub trait SwitchStore: Send + Sync {
    fn get(&self, id: &SlotId) -> bool;
}

/// Suspends and restores a piece of host input handling.
///
/// Used both for the player's movement/menu predicates and for the
/// per-actor direction lock.
pub trait InputLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// The live text window the answer streams into.
pub trait RenderSurface: Send + Sync {
    fn clear(&self);
    fn append(&self, text: &str);
    fn scroll_to_end(&self);
    fn is_scrolled_to_end(&self) -> bool;
}

/// The host's message window, used for errors.
pub trait MessageSurface: Send + Sync {
    fn add(&self, text: &str);
}

/// Expands host-specific placeholders such as `\V[n]` in authored text.
pub trait ControlExpander: Send + Sync {
    fn expand(&self, text: &str) -> String;
}

/// Expander that leaves text untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpansion;

impl ControlExpander for NoExpansion {
    fn expand(&self, text: &str) -> String {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_accepts_numbers_and_strings() {
        let ids: Vec<SlotId> = serde_json::from_str(r#"[3, "memory"]"#).unwrap();
        assert_eq!(ids[0], SlotId::from(3));
        assert_eq!(ids[1].as_str(), "memory");
    }

    struct One(Option<Value>);

    impl VariableStore for One {
        fn get(&self, _id: &SlotId) -> Option<Value> {
            self.0.clone()
        }
        fn set(&self, _id: &SlotId, _value: Value) {}
    }

    #[test]
    fn test_get_text_treats_empty_as_absent() {
        let id = SlotId::from(1);
        assert_eq!(One(Some(Value::String(String::new()))).get_text(&id), None);
        assert_eq!(One(Some(serde_json::json!([]))).get_text(&id), None);
        assert_eq!(One(Some(serde_json::json!(42))).get_text(&id), Some("42".into()));
        assert_eq!(One(Some(serde_json::json!("hi"))).get_text(&id), Some("hi".into()));
    }
}
