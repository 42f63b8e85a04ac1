//! The completion port: one channel carrying every event a listener reacts to.
//!
//! The listener service posts finished operations here and request handles
//! post server commands here. [`HttpRequestQueue`](super::HttpRequestQueue)
//! is the only consumer, so slot state is only ever touched from one place.

use tokio::sync::mpsc;
use tracing::trace;

use super::native::{ReceiveOp, SendOp};
use super::OverlappedError;
use crate::http::{Body, RequestToken, Response};

/// A finished overlapped operation, returning the op and everything it owns.
#[derive(Debug)]
pub enum Completion {
    Receive {
        op: ReceiveOp,
        result: Result<usize, OverlappedError>,
    },
    Send {
        op: SendOp,
        result: Result<usize, OverlappedError>,
    },
}

/// Server-side request commands, posted by [`RequestHandle`](super::RequestHandle).
#[derive(Debug)]
pub(crate) enum Command {
    Respond(Response),
    Begin(Response),
    Body(Body),
    End,
    Abort,
}

#[derive(Debug)]
pub(crate) enum Event {
    Completion(Completion),
    Command {
        token: RequestToken,
        command: Command,
    },
}

/// Sender side of a listener's event channel.
#[derive(Debug, Clone)]
pub struct CompletionPort {
    tx: mpsc::UnboundedSender<Event>,
}

impl CompletionPort {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Delivers a finished operation to the listener.
    ///
    /// If the listener is gone the completion is dropped here, which returns
    /// the op's buffer and lease.
    pub fn complete(&self, completion: Completion) {
        if self.tx.send(Event::Completion(completion)).is_err() {
            trace!("completion port closed; dropping completion");
        }
    }

    /// Returns `false` if the listener is gone.
    pub(crate) fn command(&self, token: RequestToken, command: Command) -> bool {
        self.tx.send(Event::Command { token, command }).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
