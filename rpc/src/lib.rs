//! # Devicemesh RPC
//!
//! Asynchronous request/response layer on top of the shared message bus.
//!
//! A caller-side [`RpcClient`] publishes [`Request`](devicemesh_core::Request)
//! envelopes onto the bus, registers a completion callback in the
//! [`RequestMatcher`], and demultiplexes inbound replies back to the right
//! pending call. A server-side [`RpcServer`] consumes requests, looks the
//! action kind up in an explicit dispatch table, runs the handler on a worker
//! pool, and publishes one or more replies tagged with the original
//! correlation id.
//!
//! ## Outcome model
//!
//! A caller sees either a stream of responses ending in `last = true,
//! failed = false`, or a terminal failure (handler error or timeout) delivered
//! exactly once through the same callback, distinguished only by the `failed`
//! flag. There is one place to check outcome.

pub mod client;
pub mod error;
pub mod matcher;
pub mod server;

pub use client::{RpcClient, RpcClientConfig};
pub use error::RpcError;
pub use matcher::{oneshot_callback, RequestMatcher, ResponseCallback};
pub use server::{HandlerError, HandlerRegistry, ReplySink, RequestHandler, RpcServer, RpcServerConfig};
