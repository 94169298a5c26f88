//! Request/response envelopes carried over the bus by the RPC layer.
//!
//! A [`Request`] is created once by the caller, tagged with a globally unique
//! correlation id, and never mutated afterwards. Every [`Response`] carries
//! the correlation id of the request that produced it; the client side uses
//! that id to route replies back to the pending call. A request expecting a
//! single reply gets exactly one response with `last = true`; a streaming
//! request gets zero or more `last = false` parts followed by one terminal
//! response.
//!
//! Envelopes are serialized with `bincode` on the wire. Bodies stay opaque
//! bytes at this layer: the handler and the caller agree on the body encoding,
//! the envelope does not.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Request kind answered directly by every RPC server, used for the
/// connection handshake. No handler may be registered under this kind.
pub const PING_KIND: &str = "ping";

/// Errors produced while encoding or decoding envelopes.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Failed to serialize an envelope to bytes.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// Failed to deserialize an envelope from bytes.
    #[error("Failed to decode envelope: {0}")]
    Decode(String),
}

/// An RPC request envelope.
///
/// Immutable value created through [`Request::builder`]. The `reply_to` topic
/// is the one field stamped later, by the client at send time, because only
/// the client knows which topic its reply listener consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Globally unique token linking this request to its response(s).
    pub correlation_id: String,

    /// Action discriminator, looked up in the server's dispatch table.
    pub kind: String,

    /// Opaque payload bytes. May be empty for control requests.
    pub body: Vec<u8>,

    /// Whether exactly one terminal reply is expected, as opposed to a stream.
    pub single_reply: bool,

    /// Routing hint to the bus; all messages sharing a key stay ordered.
    /// Typically the device id the request concerns.
    pub partition_key: Option<String>,

    /// Topic the server should publish replies to. Stamped by the client.
    pub reply_to: Option<String>,
}

impl Request {
    /// Start building a request for the given action kind.
    ///
    /// A fresh correlation id is generated unless one is supplied explicitly.
    #[must_use]
    pub fn builder(kind: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            kind: kind.into(),
            correlation_id: None,
            body: Vec::new(),
            single_reply: true,
            partition_key: None,
        }
    }

    /// Encode this request for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode a request from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if the bytes are not a valid request.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}

/// Builder for [`Request`] values.
#[derive(Debug)]
pub struct RequestBuilder {
    kind: String,
    correlation_id: Option<String>,
    body: Vec<u8>,
    single_reply: bool,
    partition_key: Option<String>,
}

impl RequestBuilder {
    /// Set an explicit correlation id instead of generating one.
    ///
    /// Intended for tests that need deterministic ids; production callers
    /// should let the builder generate a v4 uuid.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the request payload.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Expect a single terminal reply (`true`, the default) or a stream.
    #[must_use]
    pub const fn single_reply(mut self, single_reply: bool) -> Self {
        self.single_reply = single_reply;
        self
    }

    /// Set the partition key routing hint.
    #[must_use]
    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Build the request, generating a correlation id if none was supplied.
    #[must_use]
    pub fn build(self) -> Request {
        Request {
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: self.kind,
            body: self.body,
            single_reply: self.single_reply,
            partition_key: self.partition_key,
            reply_to: None,
        }
    }
}

/// An RPC response envelope.
///
/// Constructed through the [`Response::success`], [`Response::failure`] and
/// [`Response::timeout`] shape builders so each outbound message carries
/// exactly the fields its outcome needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the originating request.
    pub correlation_id: String,

    /// Opaque payload bytes. Empty on failures.
    pub body: Vec<u8>,

    /// True on the final reply of a stream; always true for a single reply.
    pub last: bool,

    /// True if the server-side handler failed.
    pub failed: bool,

    /// Human-readable failure text, present only when `failed` is set.
    pub error: Option<String>,

    /// Numeric status for failures that map to a protocol status code.
    pub status: Option<u16>,
}

impl Response {
    /// Build a successful response.
    #[must_use]
    pub fn success(correlation_id: impl Into<String>, body: Vec<u8>, last: bool) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body,
            last,
            failed: false,
            error: None,
            status: None,
        }
    }

    /// Build a terminal failure response.
    ///
    /// Failures always terminate the exchange, so `last` is implied.
    #[must_use]
    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: Vec::new(),
            last: true,
            failed: true,
            error: Some(error.into()),
            status: None,
        }
    }

    /// Build a terminal failure carrying a protocol status code.
    #[must_use]
    pub fn rejected(
        correlation_id: impl Into<String>,
        status: u16,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: Some(status),
            ..Self::failure(correlation_id, error)
        }
    }

    /// Build the synthetic failure delivered when a pending call expires
    /// before a terminal reply arrives.
    #[must_use]
    pub fn timeout(correlation_id: impl Into<String>) -> Self {
        Self::failure(correlation_id, "timed out waiting for reply")
    }

    /// Encode this response for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode a response from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if the bytes are not a valid response.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}
