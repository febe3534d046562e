//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::Error;
use crate::host::{InputLock, MessageSurface, RenderSurface, SlotId, SwitchStore, VariableStore};
use crate::request::ChatRequest;
use crate::transport::{ByteStream, Transport};

/// Render one streaming `data:` frame carrying `content`.
pub fn sse_frame(content: &str) -> String {
    let frame = serde_json::json!({"choices": [{"delta": {"content": content}}]});
    format!("data: {}\n", frame)
}

#[derive(Default)]
pub struct MemoryVariables {
    values: Mutex<HashMap<SlotId, Value>>,
}

impl MemoryVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().unwrap().is_empty()
    }
}

impl VariableStore for MemoryVariables {
    fn get(&self, id: &SlotId) -> Option<Value> {
        self.values.lock().unwrap().get(id).cloned()
    }

    fn set(&self, id: &SlotId, value: Value) {
        self.values.lock().unwrap().insert(id.clone(), value);
    }
}

#[derive(Default)]
pub struct MemorySwitches {
    values: Mutex<HashMap<SlotId, bool>>,
}

impl MemorySwitches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: &SlotId, on: bool) {
        self.values.lock().unwrap().insert(id.clone(), on);
    }
}

impl SwitchStore for MemorySwitches {
    fn get(&self, id: &SlotId) -> bool {
        self.values.lock().unwrap().get(id).copied().unwrap_or(false)
    }
}

/// Input lock that counts calls.
#[derive(Default)]
pub struct CountingInputLock {
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl CountingInputLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn unlock_count(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count() > self.unlock_count()
    }
}

impl InputLock for CountingInputLock {
    fn lock(&self) {
        self.locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Render surface that records appended text. Starts scrolled to the end.
pub struct RecordingSurface {
    text: Mutex<String>,
    at_end: AtomicBool,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self {
            text: Mutex::new(String::new()),
            at_end: AtomicBool::new(true),
        }
    }

    pub fn text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    pub fn set_scrolled_to_end(&self, at_end: bool) {
        self.at_end.store(at_end, Ordering::SeqCst);
    }
}

impl Default for RecordingSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSurface for RecordingSurface {
    fn clear(&self) {
        self.text.lock().unwrap().clear();
    }

    fn append(&self, text: &str) {
        self.text.lock().unwrap().push_str(text);
    }

    fn scroll_to_end(&self) {
        self.at_end.store(true, Ordering::SeqCst);
    }

    fn is_scrolled_to_end(&self) -> bool {
        self.at_end.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingMessages {
    messages: Mutex<Vec<String>>,
}

impl RecordingMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn joined(&self) -> String {
        self.all().join("\n")
    }
}

impl MessageSurface for RecordingMessages {
    fn add(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}

/// A transport that replays pre-configured responses.
pub struct ScriptedTransport {
    responses: Mutex<Vec<Result<Vec<Result<Bytes, Error>>, Error>>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            captured_requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response body delivered as the given chunks.
    /// Responses are returned in FIFO order.
    pub fn queue_chunks<I, C>(&self, chunks: I)
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        let chunks = chunks.into_iter().map(|c| Ok(c.into())).collect();
        self.responses.lock().unwrap().insert(0, Ok(chunks));
    }

    /// Queue a response body whose items may fail part way through.
    pub fn queue_stream(&self, items: Vec<Result<Bytes, Error>>) {
        self.responses.lock().unwrap().insert(0, Ok(items));
    }

    /// Queue a failed send.
    pub fn queue_error(&self, error: Error) {
        self.responses.lock().unwrap().insert(0, Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &ChatRequest) -> Result<ByteStream, Error> {
        self.captured_requests.lock().unwrap().push(request.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(Error::network("No scripted response queued")));
        let items = response?;
        Ok(Box::pin(futures::stream::iter(items)) as ByteStream)
    }
}
