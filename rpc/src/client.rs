//! Caller side of the RPC layer.
//!
//! The client publishes requests onto the bus, remembers each pending call in
//! the [`RequestMatcher`], and runs a background listener that routes every
//! inbound reply back to the right callback. A watchdog bounds the lifetime
//! of every outstanding call.

use crate::error::RpcError;
use crate::matcher::{oneshot_callback, RequestMatcher, ResponseCallback};
use devicemesh_core::{MessageBus, MessageStream, Request, Response, PING_KIND};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Configuration for an [`RpcClient`].
#[derive(Clone, Debug)]
pub struct RpcClientConfig {
    /// Topic requests are published to.
    pub request_topic: String,

    /// Topic this client's reply listener consumes; stamped into every
    /// outgoing request as `reply_to`.
    pub reply_topic: String,

    /// How long a call may stay pending before the watchdog expires it.
    pub call_timeout: Duration,

    /// How long to wait for each start-up ping reply.
    pub ping_timeout: Duration,

    /// How many pings to attempt before giving up on the server.
    /// Zero disables the handshake entirely.
    pub ping_attempts: u32,
}

impl RpcClientConfig {
    /// Configuration with the default timeouts.
    #[must_use]
    pub fn new(request_topic: impl Into<String>, reply_topic: impl Into<String>) -> Self {
        Self {
            request_topic: request_topic.into(),
            reply_topic: reply_topic.into(),
            call_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(3),
            ping_attempts: 10,
        }
    }

    /// Override the pending-call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override the handshake attempt count. Zero disables the handshake.
    #[must_use]
    pub const fn with_ping_attempts(mut self, attempts: u32) -> Self {
        self.ping_attempts = attempts;
        self
    }

    /// Override the per-attempt handshake timeout.
    #[must_use]
    pub const fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }
}

/// Client end of the request/response exchange.
///
/// `call` never blocks the caller beyond the publish itself: replies arrive
/// on a background task and are delivered through the registered callback.
pub struct RpcClient {
    bus: Arc<dyn MessageBus>,
    matcher: Arc<RequestMatcher>,
    config: RpcClientConfig,
    shutdown: watch::Sender<bool>,
}

impl RpcClient {
    /// Create a client over the given bus. Call [`RpcClient::start`] before
    /// issuing requests.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, config: RpcClientConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            matcher: Arc::new(RequestMatcher::new()),
            config,
            shutdown,
        }
    }

    /// Start the reply listener and ping the server until it answers.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Bus`] if the reply-topic subscription fails, or
    /// [`RpcError::ServerUnreachable`] if no ping is answered within the
    /// configured attempts.
    pub async fn start(&self) -> Result<(), RpcError> {
        let stream = self
            .bus
            .subscribe(&[self.config.reply_topic.as_str()])
            .await?;

        let matcher = Arc::clone(&self.matcher);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(listen(stream, matcher, shutdown));

        tracing::info!(
            request_topic = %self.config.request_topic,
            reply_topic = %self.config.reply_topic,
            "rpc client listener started"
        );

        self.ping().await
    }

    /// Issue a request and register `callback` for its replies.
    ///
    /// Returns as soon as the request is handed to the bus. The callback is
    /// invoked from a background task: once for a single-reply call, or
    /// repeatedly until a `last = true` part for a streaming call. If no
    /// terminal reply arrives within `call_timeout`, the callback receives a
    /// synthetic timeout failure instead, exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelationId`] on id reuse and
    /// [`RpcError::Bus`] if the publish fails; in both cases the callback
    /// will never be invoked.
    pub async fn call(&self, request: Request, callback: ResponseCallback) -> Result<(), RpcError> {
        self.matcher
            .register(&request.correlation_id, callback, request.single_reply)?;
        tracing::debug!(
            correlation_id = %request.correlation_id,
            kind = %request.kind,
            "request callback registered"
        );

        let correlation_id = request.correlation_id.clone();
        if let Err(e) = self.publish(request).await {
            // The reply can never arrive; drop the slot without a callback.
            self.matcher.cancel(&correlation_id);
            return Err(e);
        }

        let matcher = Arc::clone(&self.matcher);
        let timeout = self.config.call_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if matcher.expire(&correlation_id) {
                tracing::warn!(correlation_id = %correlation_id, "pending call expired");
            }
        });
        Ok(())
    }

    /// Publish a request without registering any callback.
    ///
    /// Replies, if the server produces them, are dropped as orphans by the
    /// listener.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Bus`] if the publish fails.
    pub async fn push(&self, request: Request) -> Result<(), RpcError> {
        self.publish(request).await
    }

    /// Cancel a pending call without invoking its callback.
    ///
    /// Distinct from a timeout, which does invoke the callback with a failure.
    /// Returns whether the call was still pending.
    #[must_use]
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.matcher.cancel(correlation_id)
    }

    /// Number of calls currently awaiting replies.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.matcher.len()
    }

    /// Stop the reply listener. Pending calls are left to their watchdogs.
    pub fn shutdown(&self) {
        self.shutdown.send(true).ok();
    }

    async fn publish(&self, request: Request) -> Result<(), RpcError> {
        let request = Request {
            reply_to: Some(self.config.reply_topic.clone()),
            ..request
        };
        let payload = request.to_bytes()?;
        self.bus
            .publish(
                &self.config.request_topic,
                request.partition_key.as_deref(),
                payload,
            )
            .await?;
        tracing::debug!(
            correlation_id = %request.correlation_id,
            topic = %self.config.request_topic,
            "request published"
        );
        Ok(())
    }

    /// Handshake: ping until the server replies or attempts run out.
    async fn ping(&self) -> Result<(), RpcError> {
        if self.config.ping_attempts == 0 {
            tracing::debug!("handshake disabled");
            return Ok(());
        }
        for attempt in 1..=self.config.ping_attempts {
            tracing::info!(attempt, "pinging rpc server");

            let (callback, rx) = oneshot_callback();
            let request = Request::builder(PING_KIND).build();
            let correlation_id = request.correlation_id.clone();
            self.call(request, callback).await?;

            match tokio::time::timeout(self.config.ping_timeout, rx).await {
                Ok(Ok(response)) if !response.failed => {
                    tracing::info!("rpc server reachable");
                    return Ok(());
                }
                Ok(Ok(_)) | Ok(Err(_)) => {
                    tracing::warn!(attempt, "rpc server answered ping with a failure");
                }
                Err(_) => {
                    tracing::warn!(attempt, "rpc server did not answer ping");
                }
            }
            // Late ping replies become orphans.
            self.matcher.cancel(&correlation_id);
        }
        Err(RpcError::ServerUnreachable(self.config.ping_attempts))
    }
}

/// Reply-listener loop: route every inbound response through the matcher.
async fn listen(
    mut stream: MessageStream,
    matcher: Arc<RequestMatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(message)) => match Response::from_bytes(&message.payload) {
                        Ok(response) => {
                            let correlation_id = response.correlation_id.clone();
                            if matcher.complete(response) {
                                tracing::debug!(correlation_id = %correlation_id, "reply delivered");
                            } else {
                                // Normal after expiry or cancellation.
                                tracing::debug!(correlation_id = %correlation_id, "orphan reply dropped");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable reply skipped");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "reply stream error");
                    }
                    None => {
                        tracing::debug!("reply stream closed, listener exiting");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown too.
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("shutdown signalled, listener exiting");
                    break;
                }
            }
        }
    }
}
