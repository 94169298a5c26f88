//! Error type shared across the RPC layer.

use devicemesh_core::{BusError, EnvelopeError};
use thiserror::Error;

/// Errors surfaced by the RPC client and server APIs.
///
/// Timeouts and handler failures are deliberately *not* represented here:
/// both travel through the response callback as a terminal failed
/// [`Response`](devicemesh_core::Response), so callers check outcome in one
/// place.
#[derive(Error, Debug)]
pub enum RpcError {
    /// A correlation id was registered twice. Ids are generated uniquely, so
    /// hitting this is a programmer error on the calling side.
    #[error("correlation id already registered: {0}")]
    DuplicateCorrelationId(String),

    /// The underlying bus rejected a publish or subscribe.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The server did not answer any ping during client start-up.
    #[error("rpc server unreachable after {0} ping attempts")]
    ServerUnreachable(u32),
}
