//! dlg-core: Conversation context and streaming response engine
//!
//! This crate holds the per-conversation context window, the chat request
//! and streaming protocol layers, and the interaction lock that keeps the
//! host's input suspended while an answer streams and is acknowledged.

pub mod context;
pub mod display;
pub mod error;
pub mod escape;
pub mod framer;
pub mod host;
pub mod lock;
pub mod message;
pub mod protocol;
pub mod request;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{resolve_user_message, ConversationContext, ExamplePair, PrefixSpec};
pub use display::{DisplayOptions, DisplayPipeline, Replacement};
pub use error::Error;
pub use escape::StandardExpander;
pub use framer::{frame_lines, Line, LineFramer};
pub use host::{
    ControlExpander, InputLock, MessageSurface, NoExpansion, RenderSurface, SlotId, SwitchStore,
    VariableStore,
};
pub use lock::{Acknowledgement, InteractionLock, LockState, StreamLease};
pub use message::{Message, Role};
pub use protocol::{decode_error, parse_completion, parse_line, SseEvent};
pub use request::{ChatRequest, SamplingParams};
pub use session::{EngineSettings, Host, Invocation, Memory, Orchestrator, Outcome};
pub use transport::{ByteStream, Transport};

pub type Result<T> = std::result::Result<T, Error>;
