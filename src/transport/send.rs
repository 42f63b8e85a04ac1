//! One slot's send task.

use tracing::trace;

use super::native::{HandleLease, RawRequestId, SendOp, SendPayload, TaskKey, TaskKind};
use super::OverlappedError;
use crate::http::{Body, Response};

#[derive(Debug)]
pub(crate) struct SendTask {
    key: TaskKey,
    busy: bool,
    finished: bool,
}

impl SendTask {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            key: TaskKey {
                slot,
                kind: TaskKind::Send,
            },
            busy: false,
            finished: false,
        }
    }

    pub(crate) fn key(&self) -> TaskKey {
        self.key
    }

    /// True from issue until the completion has been processed.
    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    /// True once a send without `more_data` has completed successfully.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Issues the status line, headers and the response's own body.
    pub(crate) fn run_response(
        &mut self,
        lease: &HandleLease,
        request_id: RawRequestId,
        response: Response,
        more_data: bool,
    ) {
        self.issue(lease, request_id, SendPayload::Response(response), more_data);
    }

    /// Issues an entity-body chunk of a response already started.
    pub(crate) fn run_body(
        &mut self,
        lease: &HandleLease,
        request_id: RawRequestId,
        body: Body,
        more_data: bool,
    ) {
        self.issue(lease, request_id, SendPayload::Body(body), more_data);
    }

    fn issue(
        &mut self,
        lease: &HandleLease,
        request_id: RawRequestId,
        payload: SendPayload,
        more_data: bool,
    ) {
        // The request serializes sends; a second one here is a slot bug.
        assert!(!self.busy, "send issued on {} while busy", self.key);

        self.busy = true;
        trace!(key = %self.key, request_id, more_data, "send issued");

        lease.native().send(SendOp {
            key: self.key,
            request_id,
            payload,
            more_data,
            _lease: lease.clone(),
        });
    }

    pub(crate) fn complete(
        &mut self,
        op: SendOp,
        result: Result<usize, OverlappedError>,
    ) -> Result<usize, OverlappedError> {
        self.busy = false;
        if result.is_ok() && !op.more_data {
            self.finished = true;
        }
        result
    }

    pub(crate) fn reset(&mut self) {
        debug_assert!(!self.busy, "reset with a send outstanding");
        self.finished = false;
    }
}
