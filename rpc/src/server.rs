//! Server side of the RPC layer.
//!
//! The server consumes requests from the bus, looks each action kind up in an
//! explicit dispatch table built at startup, and runs the handler on a worker
//! pool so a slow handler never starves the consumption loop. Every exchange
//! ends in exactly one terminal reply: the handler's returned body on success,
//! a `failed = true` response on handler error or unknown kind.

use crate::error::RpcError;
use devicemesh_core::{BusError, MessageBus, MessageStream, Request, Response, PING_KIND};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

/// Error returned by a request handler.
///
/// Surfaced to the caller as a terminal response with `failed = true`; the
/// text travels in the response's `error` field.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler could not produce a result.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler rejected the request with a protocol status code,
    /// surfaced in the response's `status` field.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// Protocol status code, e.g. 404 for an unknown device.
        status: u16,
        /// Human-readable rejection text.
        message: String,
    },
}

impl HandlerError {
    /// Build a failure from any displayable cause.
    #[must_use]
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self::Failed(cause.to_string())
    }

    /// Build a rejection with a protocol status code.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Publishes the intermediate parts of a streaming reply.
///
/// Handed to every handler invocation. Parts published through
/// [`ReplySink::part`] carry `last = false`; the terminal reply is always the
/// body the handler returns, published by the server with `last = true`, so a
/// stream cannot end without its terminal flag.
pub struct ReplySink {
    bus: Arc<dyn MessageBus>,
    reply_topic: String,
    correlation_id: String,
}

impl ReplySink {
    /// Publish one intermediate part of a streaming reply.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Bus`] if the publish fails; the handler decides
    /// whether that aborts the exchange.
    pub async fn part(&self, body: Vec<u8>) -> Result<(), RpcError> {
        let response = Response::success(&self.correlation_id, body, false);
        publish_response(&*self.bus, &self.reply_topic, &response).await
    }
}

/// Future returned by a request handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, HandlerError>> + Send>>;

/// A registered request handler.
///
/// Implemented for free by any `Fn(Request, ReplySink) -> impl Future` with
/// the right output, so dispatch tables can be built from plain closures.
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound request.
    ///
    /// The returned body becomes the terminal `last = true` reply. Streaming
    /// handlers publish earlier parts through the sink first.
    fn handle(&self, request: Request, sink: ReplySink) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Request, ReplySink) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    fn handle(&self, request: Request, sink: ReplySink) -> HandlerFuture {
        Box::pin(self(request, sink))
    }
}

/// Explicit dispatch table mapping an action kind to its handler.
///
/// Built once at startup and queried by key per inbound request; there is no
/// reflection or runtime scanning anywhere in the path.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate an action kind with a handler, replacing any previous one.
    #[must_use]
    pub fn register(mut self, kind: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        let kind = kind.into();
        debug_assert!(kind != PING_KIND, "the ping kind is answered by the server itself");
        self.handlers.insert(kind, handler);
        self
    }

    /// Look up the handler for an action kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn RequestHandler>> {
        self.handlers.get(kind)
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Configuration for an [`RpcServer`].
#[derive(Clone, Debug)]
pub struct RpcServerConfig {
    /// Topic requests are consumed from.
    pub request_topic: String,

    /// Worker tasks draining the request queue.
    pub worker_count: usize,

    /// Bound of the in-process request queue between the consumption loop
    /// and the workers.
    pub buffer_size: usize,
}

impl RpcServerConfig {
    /// Configuration with the default worker pool sizing.
    #[must_use]
    pub fn new(request_topic: impl Into<String>) -> Self {
        Self {
            request_topic: request_topic.into(),
            worker_count: 2,
            buffer_size: 1024,
        }
    }

    /// Override the worker pool size.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

/// Server end of the request/response exchange.
pub struct RpcServer {
    bus: Arc<dyn MessageBus>,
    registry: Arc<HandlerRegistry>,
    config: RpcServerConfig,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    /// Create a server over the given bus with a fully built dispatch table.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, registry: HandlerRegistry, config: RpcServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            registry: Arc::new(registry),
            config,
            shutdown,
        }
    }

    /// Subscribe to the request topic and spawn the consumption loop and
    /// worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Bus`] if the subscription fails.
    pub async fn start(&self) -> Result<(), RpcError> {
        let stream = self
            .bus
            .subscribe(&[self.config.request_topic.as_str()])
            .await?;

        let (queue_tx, queue_rx) = mpsc::channel::<Request>(self.config.buffer_size);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        for worker in 0..self.config.worker_count.max(1) {
            let queue_rx = Arc::clone(&queue_rx);
            let bus = Arc::clone(&self.bus);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                loop {
                    let request = { queue_rx.lock().await.recv().await };
                    let Some(request) = request else {
                        tracing::debug!(worker, "request queue closed, worker exiting");
                        break;
                    };
                    process(Arc::clone(&bus), Arc::clone(&registry), request).await;
                }
            });
        }

        let shutdown = self.shutdown.subscribe();
        tokio::spawn(consume(stream, queue_tx, shutdown));

        tracing::info!(
            request_topic = %self.config.request_topic,
            workers = self.config.worker_count,
            handlers = self.registry.len(),
            "rpc server started"
        );
        Ok(())
    }

    /// Stop the consumption loop; workers drain the queue and exit.
    pub fn shutdown(&self) {
        self.shutdown.send(true).ok();
    }
}

/// Consumption loop: decode inbound requests and queue them for the workers.
///
/// Only queueing happens here, so handler latency never blocks the bus poll.
async fn consume(
    mut stream: MessageStream,
    queue: mpsc::Sender<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(message)) => match Request::from_bytes(&message.payload) {
                        Ok(request) => {
                            if queue.send(request).await.is_err() {
                                tracing::debug!("request queue dropped, consumer exiting");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable request skipped");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "request stream error");
                    }
                    None => {
                        tracing::debug!("request stream closed, consumer exiting");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown too.
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("shutdown signalled, consumer exiting");
                    break;
                }
            }
        }
    }
}

/// Handle one request on a worker: dispatch, then publish the terminal reply.
async fn process(bus: Arc<dyn MessageBus>, registry: Arc<HandlerRegistry>, request: Request) {
    let Some(reply_topic) = request.reply_to.clone() else {
        tracing::warn!(
            correlation_id = %request.correlation_id,
            kind = %request.kind,
            "request without reply_to dropped"
        );
        return;
    };
    let correlation_id = request.correlation_id.clone();
    let kind = request.kind.clone();

    let outcome = if kind == PING_KIND {
        Ok(Vec::new())
    } else if let Some(handler) = registry.get(&kind) {
        let sink = ReplySink {
            bus: Arc::clone(&bus),
            reply_topic: reply_topic.clone(),
            correlation_id: correlation_id.clone(),
        };
        handler.handle(request, sink).await
    } else {
        Err(HandlerError::Failed(format!(
            "no handler registered for kind '{kind}'"
        )))
    };

    let response = match outcome {
        Ok(body) => Response::success(&correlation_id, body, true),
        Err(e) => {
            tracing::error!(
                correlation_id = %correlation_id,
                kind = %kind,
                error = %e,
                "request handler failed"
            );
            match e {
                HandlerError::Rejected { status, message } => {
                    Response::rejected(&correlation_id, status, message)
                }
                HandlerError::Failed(message) => Response::failure(&correlation_id, message),
            }
        }
    };

    if let Err(e) = publish_response(&*bus, &reply_topic, &response).await {
        tracing::error!(
            correlation_id = %correlation_id,
            error = %e,
            "failed to publish reply"
        );
    }
}

/// Replies are keyed by correlation id so the parts of one exchange stay
/// partition-ordered.
async fn publish_response(
    bus: &dyn MessageBus,
    reply_topic: &str,
    response: &Response,
) -> Result<(), RpcError> {
    let payload = response.to_bytes()?;
    bus.publish(reply_topic, Some(&response.correlation_id), payload)
        .await
        .map_err(RpcError::from)
}

// Local helper so `BusError` converts on the sink path too.
impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        Self::failed(e)
    }
}
