use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use dlg_core::{decode_error, ByteStream, ChatRequest, Error, Transport};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Posts chat requests to an OpenAI-compatible endpoint.
///
/// The same transport serves a relay: without an API key no
/// `Authorization` header is sent and the relay supplies credentials.
pub struct OpenAiTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        // Configure client for proper SSE streaming:
        // - Use HTTP/1.1 to avoid HTTP/2 framing issues
        // - Disable automatic decompression which can buffer entire response
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    /// Blank keys are treated as absent.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for OpenAiTransport {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

#[async_trait]
impl Transport for OpenAiTransport {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, request: &ChatRequest) -> Result<ByteStream, Error> {
        debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            "Sending chat request"
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        if request.stream {
            // Request SSE and disable compression to prevent buffering
            builder = builder
                .header("Accept", "text/event-stream")
                .header("Accept-Encoding", "identity")
                .header("Cache-Control", "no-cache");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Chat endpoint returned an error");
            return Err(decode_error(status.as_u16(), &error_text));
        }

        debug!(
            content_type = ?response.headers().get("content-type"),
            "Response accepted"
        );

        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| Error::network(e.to_string()))),
        );
        Ok(body)
    }
}
