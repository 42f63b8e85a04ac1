//! The listener-service contract and the overlapped operation vocabulary.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use super::{CompletionPort, TransportError};
use crate::http::{Body, Response};

/// Request identifier issued by the listener service when it hands out a
/// request record.
pub type RawRequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Receive,
    Send,
}

/// Tags an overlapped operation with the slot task that issued it.
///
/// A slot has at most one receive and one send outstanding, so the pair is
/// unique among in-flight operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub slot: usize,
    pub kind: TaskKind,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TaskKind::Receive => "recv",
            TaskKind::Send => "send",
        };
        write!(f, "{kind}@{}", self.slot)
    }
}

/// A native request queue exposed by a listener service.
///
/// Implementations release the native handle in `Drop`.
///
/// Every op passed to [`receive`](Self::receive) or [`send`](Self::send) must
/// come back exactly once through the associated [`CompletionPort`], either
/// with the number of bytes transferred or with an
/// [`OverlappedError`](super::OverlappedError). Cancellation is requested, not
/// performed: the cancelled op still completes, normally with
/// `OverlappedError::Aborted`. Completions must not be delivered while the
/// implementation holds locks its own `Drop` needs.
pub trait NativeQueue: Send + Sync + 'static {
    /// Registers a URL prefix. Fails without side effects if the service
    /// rejects it.
    fn add_url(&self, prefix: &str) -> Result<(), TransportError>;

    fn remove_url(&self, prefix: &str) -> Result<(), TransportError>;

    /// Routes this queue's completions to `port`. Called once, before any
    /// operation is issued.
    fn associate(&self, port: CompletionPort) -> Result<(), TransportError>;

    /// Reads the next request record into `op.buffer`.
    fn receive(&self, op: ReceiveOp);

    /// Transmits a response head or an entity-body chunk.
    fn send(&self, op: SendOp);

    /// Cancels the outstanding operation tagged `key`, if any.
    fn cancel(&self, key: TaskKey);

    /// Cancels every operation on `request_id` and resets its connection.
    fn cancel_request(&self, request_id: RawRequestId);
}

struct LeaseInner {
    native: Arc<dyn NativeQueue>,
}

/// A counted reference to a native queue.
///
/// The listener holds one lease and every outstanding op holds a clone, so the
/// native handle stays open until the last op has completed and been dropped,
/// however the listener itself is torn down.
#[derive(Clone)]
pub struct HandleLease {
    inner: Arc<LeaseInner>,
}

impl HandleLease {
    pub(crate) fn new(native: Arc<dyn NativeQueue>) -> Self {
        Self {
            inner: Arc::new(LeaseInner { native }),
        }
    }

    pub fn native(&self) -> &dyn NativeQueue {
        self.inner.native.as_ref()
    }

    /// Leases held besides this one, i.e. operations not yet returned when
    /// called on the listener's own lease.
    pub(crate) fn others(&self) -> usize {
        Arc::strong_count(&self.inner) - 1
    }
}

impl fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease")
            .field("holders", &Arc::strong_count(&self.inner))
            .finish()
    }
}

/// An overlapped receive of one request record.
///
/// `buffer` is empty with at least `limit` bytes of capacity; the service
/// writes the record into it and reports its length on completion.
#[derive(Debug)]
pub struct ReceiveOp {
    pub key: TaskKey,
    pub buffer: BytesMut,
    pub limit: usize,
    pub(crate) _lease: HandleLease,
}

/// What a send carries.
#[derive(Debug)]
pub enum SendPayload {
    /// Status, headers and the first body fragment.
    Response(Response),
    /// A further entity-body chunk of a response already started.
    Body(Body),
}

/// An overlapped send. `more_data` is set on every send except the one that
/// finishes the response.
#[derive(Debug)]
pub struct SendOp {
    pub key: TaskKey,
    pub request_id: RawRequestId,
    pub payload: SendPayload,
    pub more_data: bool,
    pub(crate) _lease: HandleLease,
}
