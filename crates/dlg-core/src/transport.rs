use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Error;
use crate::request::ChatRequest;

/// Response body as it arrives off the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Sends a chat request to an endpoint, upstream or relay alike.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// POST `request` and hand back the body of a 2xx response.
    ///
    /// Non-2xx responses must be decoded into an error (see
    /// [`crate::protocol::decode_error`]); connection failures map to
    /// [`Error::Network`].
    async fn send(&self, request: &ChatRequest) -> Result<ByteStream, Error>;
}
