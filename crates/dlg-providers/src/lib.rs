//! dlg-providers: HTTP transports for dialogue-stream
//!
//! This crate provides implementations of the Transport trait for
//! OpenAI-compatible chat endpoints and relays.

pub mod openai;

pub use openai::OpenAiTransport;
