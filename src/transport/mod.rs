//! Completion-port HTTP transport.
//!
//! The transport never parses HTTP. A listener service (the OS HTTP
//! listener, or the in-process [`loopback`] service) owns the wire protocol
//! and exchanges structured request records and responses with us through
//! overlapped operations:
//!
//! - [`HttpRequestQueue`] owns the native queue handle, the bound URL
//!   prefixes and a fixed pool of request slots. It keeps one receive posted
//!   per idle slot and is the single point where completions and server
//!   commands are dispatched.
//! - Each slot runs one receive and at most one send at a time. Response
//!   chunks submitted while a send is in flight are queued and released by
//!   send completions, in order.
//! - Buffers move into an operation when it is issued and come back with its
//!   completion, and every operation holds a [`HandleLease`], so the native
//!   handle cannot be released while anything is outstanding.
//!
//! The crate ships one [`NativeQueue`] backend, the in-process [`loopback`]
//! service. A binding to the operating system's HTTP listener service lives
//! outside this crate and plugs in by implementing [`NativeQueue`]: register
//! URLs in `add_url`/`remove_url`, forward its I/O completions to the
//! [`CompletionPort`] passed to `associate`, and encode received requests as
//! [`RecordParts`].

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

mod binding;
pub mod loopback;
mod native;
mod port;
mod queue;
mod receive;
mod record;
mod request;
mod send;

pub use binding::UrlBinding;
pub use native::{
    HandleLease, NativeQueue, RawRequestId, ReceiveOp, SendOp, SendPayload, TaskKey, TaskKind,
};
pub use port::{Completion, CompletionPort};
pub use queue::{HttpRequestQueue, PoolStats, RequestEventListener};
pub use record::{RecordError, RecordParts, RequestRecord};
pub use request::{RequestError, RequestHandle, RequestOutcome, RequestState};

/// Concurrent in-flight requests per listener.
pub const MAX_REQUESTS: usize = 64;

/// Size of each slot's receive buffer, and the largest one a
/// [`TransportConfig`](crate::config::TransportConfig) may ask for. Records
/// larger than the buffer fail.
pub const RECEIVE_BUFFER_SIZE: usize = 256 * 1024;

/// Errors reported synchronously by listener and binding operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid URL prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: &'static str },

    #[error("URL prefix {prefix:?} is already registered")]
    PrefixConflict { prefix: String },

    #[error("URL prefix {prefix:?} is not bound")]
    PrefixNotBound { prefix: String },

    #[error("request queue already started")]
    AlreadyStarted,

    #[error("request queue has not been started")]
    NotStarted,

    #[error("native queue is already associated with a completion port")]
    AlreadyAssociated,

    #[error("listener service closed")]
    Closed,

    #[error("invalid transport configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure delivered with an overlapped completion.
#[derive(Debug, Error)]
pub enum OverlappedError {
    /// Cancelled through [`NativeQueue::cancel`] or by queue shutdown.
    #[error("operation aborted")]
    Aborted,

    /// The request record does not fit in the receive buffer.
    #[error("request record needs {required} bytes but the buffer holds {capacity}")]
    MoreData {
        required: usize,
        capacity: usize,
        request_id: RawRequestId,
    },

    /// The client went away or the request was cancelled.
    #[error("request {0} no longer exists")]
    InvalidRequest(RawRequestId),

    #[error("native queue closed")]
    Closed,

    #[error("malformed request record: {0}")]
    Record(#[from] RecordError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
