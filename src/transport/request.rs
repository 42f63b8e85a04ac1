//! Per-slot request state machine and the handle given to the server layer.
//!
//! ```text
//! Idle ──receive──▶ Receiving ──record──▶ Ready ──send──▶ Sending ─┐
//!                       │                  ▲  │                    │
//!                       │                  └──┼── chunk completed ◀┤
//!                       ▼                     ▼                    ▼
//!                    Aborted ◀──────────── abort / failure        Sent
//! ```
//!
//! `Sent` and `Aborted` are reported to the listener as [`SlotEvent::Done`];
//! the listener resets the slot back to `Idle` and posts a new receive.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, warn};

use super::native::{HandleLease, ReceiveOp, SendOp};
use super::port::{Command, CompletionPort};
use super::receive::ReceiveTask;
use super::send::SendTask;
use super::{OverlappedError, RawRequestId, RequestRecord};
use crate::http::{Body, HeaderView, Method, QueryParams, RequestCore, RequestToken, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Receiving,
    Ready,
    Sending,
    Sent,
    Aborted,
}

/// How a request that reached the server layer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The final chunk was transmitted.
    Completed,
    /// Cancelled, or failed in the transport.
    Aborted,
}

/// Server-side misuse of the response sequence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request is not ready for a response (state: {0:?})")]
    NotReady(RequestState),

    #[error("response already started")]
    AlreadyStarted,

    #[error("response not started")]
    NotStarted,

    #[error("response already ended")]
    AlreadyEnded,
}

/// What a slot transition asks of the listener.
#[derive(Debug)]
pub(crate) enum SlotEvent {
    /// A new request is ready for the server layer.
    Ready(RequestHandle),
    /// The request is over; the slot can be recycled.
    Done {
        /// Report the outcome to the listener.
        was_ready: bool,
        outcome: RequestOutcome,
        /// The service is gone; do not post another receive.
        fatal: bool,
    },
}

#[derive(Debug)]
pub(crate) struct HttpRequest {
    slot: usize,
    generation: u64,
    state: RequestState,
    request_id: Option<RawRequestId>,
    receive: ReceiveTask,
    send: SendTask,
    pending: VecDeque<Body>,
    end_after_sending_all_chunks: bool,
    response_started: bool,
    aborting: bool,
    notify_on_done: bool,
}

impl HttpRequest {
    pub(crate) fn new(slot: usize, buffer_size: usize) -> Self {
        Self {
            slot,
            generation: 0,
            state: RequestState::Idle,
            request_id: None,
            receive: ReceiveTask::new(slot, buffer_size),
            send: SendTask::new(slot),
            pending: VecDeque::new(),
            end_after_sending_all_chunks: false,
            response_started: false,
            aborting: false,
            notify_on_done: false,
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn token(&self) -> RequestToken {
        RequestToken {
            slot: self.slot,
            generation: self.generation,
        }
    }

    /// Posts the receive for the next client request. Only valid when idle.
    pub(crate) fn receive(&mut self, lease: &HandleLease) {
        if self.state != RequestState::Idle {
            warn!(slot = self.slot, state = ?self.state, "receive requested on a busy slot");
            return;
        }
        if self.receive.run(lease) {
            self.state = RequestState::Receiving;
        }
    }

    pub(crate) fn on_receive_complete(
        &mut self,
        lease: &HandleLease,
        port: &CompletionPort,
        op: ReceiveOp,
        result: Result<usize, OverlappedError>,
    ) -> Option<SlotEvent> {
        if self.state != RequestState::Receiving {
            warn!(slot = self.slot, state = ?self.state, "unexpected receive completion");
        }

        match self.receive.complete(op, result) {
            Ok(record) if self.aborting => {
                lease.native().cancel_request(record.request_id());
                Some(self.finish(RequestState::Aborted, false))
            }
            Ok(record) => {
                debug!(
                    slot = self.slot,
                    request_id = record.request_id(),
                    method = %record.method(),
                    path = record.path(),
                    "request received"
                );
                self.request_id = Some(record.request_id());
                self.state = RequestState::Ready;
                self.notify_on_done = true;
                Some(SlotEvent::Ready(RequestHandle::new(
                    self.token(),
                    record,
                    port.clone(),
                )))
            }
            Err(err) => {
                if let OverlappedError::MoreData { request_id, .. } = &err {
                    lease.native().cancel_request(*request_id);
                }
                let fatal = matches!(err, OverlappedError::Closed);
                if !self.aborting {
                    warn!(slot = self.slot, error = %err, "receive failed");
                }
                Some(self.finish(RequestState::Aborted, fatal))
            }
        }
    }

    pub(crate) fn on_send_complete(
        &mut self,
        lease: &HandleLease,
        op: SendOp,
        result: Result<usize, OverlappedError>,
    ) -> Option<SlotEvent> {
        let result = self.send.complete(op, result);

        if self.aborting {
            return Some(self.finish(RequestState::Aborted, false));
        }

        if let Err(err) = result {
            warn!(slot = self.slot, request_id = ?self.request_id, error = %err, "send failed");
            self.pending.clear();
            if let Some(id) = self.request_id {
                lease.native().cancel_request(id);
            }
            return Some(self.finish(RequestState::Aborted, matches!(err, OverlappedError::Closed)));
        }

        if self.send.is_finished() {
            return Some(self.finish(RequestState::Sent, false));
        }

        if let Some(chunk) = self.pending.pop_front() {
            let last = self.pending.is_empty() && self.end_after_sending_all_chunks;
            self.issue_body(lease, chunk, !last);
        } else if self.end_after_sending_all_chunks {
            self.issue_body(lease, Body::Empty, false);
        } else {
            self.state = RequestState::Ready;
        }
        None
    }

    /// Applies a server command. Contract violations leave the slot untouched.
    pub(crate) fn apply(
        &mut self,
        lease: &HandleLease,
        command: Command,
    ) -> Result<Option<SlotEvent>, RequestError> {
        match command {
            Command::Respond(response) => {
                self.start_response(lease, response, true)?;
                Ok(None)
            }
            Command::Begin(response) => {
                self.start_response(lease, response, false)?;
                Ok(None)
            }
            Command::Body(chunk) => {
                self.send_body(lease, chunk)?;
                Ok(None)
            }
            Command::End => {
                self.end_response(lease)?;
                Ok(None)
            }
            Command::Abort => {
                self.notify_on_done = false;
                Ok(self.abort(lease))
            }
        }
    }

    fn start_response(
        &mut self,
        lease: &HandleLease,
        response: Response,
        complete: bool,
    ) -> Result<(), RequestError> {
        if self.response_started {
            return Err(RequestError::AlreadyStarted);
        }
        let Some(request_id) = self.request_id.filter(|_| self.state == RequestState::Ready)
        else {
            return Err(RequestError::NotReady(self.state));
        };

        self.response_started = true;
        self.end_after_sending_all_chunks = complete;
        self.state = RequestState::Sending;
        self.send.run_response(lease, request_id, response, !complete);
        Ok(())
    }

    fn send_body(&mut self, lease: &HandleLease, chunk: Body) -> Result<(), RequestError> {
        self.check_streaming()?;
        if chunk.is_empty() {
            return Ok(());
        }

        if self.send.is_busy() {
            self.pending.push_back(chunk);
        } else {
            self.issue_body(lease, chunk, true);
        }
        Ok(())
    }

    fn end_response(&mut self, lease: &HandleLease) -> Result<(), RequestError> {
        self.check_streaming()?;
        self.end_after_sending_all_chunks = true;

        // Otherwise the send completion issues the final chunk.
        if !self.send.is_busy() {
            self.issue_body(lease, Body::Empty, false);
        }
        Ok(())
    }

    fn check_streaming(&self) -> Result<(), RequestError> {
        if !self.response_started {
            return Err(RequestError::NotStarted);
        }
        if self.end_after_sending_all_chunks {
            return Err(RequestError::AlreadyEnded);
        }
        Ok(())
    }

    fn issue_body(&mut self, lease: &HandleLease, chunk: Body, more_data: bool) {
        // `request_id` is always set once a response has started.
        let Some(request_id) = self.request_id else {
            return;
        };
        self.state = RequestState::Sending;
        self.send.run_body(lease, request_id, chunk, more_data);
    }

    /// Abandons the request from any state.
    ///
    /// Returns `Done` immediately when nothing is outstanding; otherwise the
    /// pending completion finishes the request.
    pub(crate) fn abort(&mut self, lease: &HandleLease) -> Option<SlotEvent> {
        self.pending.clear();

        match self.state {
            RequestState::Idle | RequestState::Sent | RequestState::Aborted => None,
            RequestState::Receiving => {
                if !self.aborting {
                    self.aborting = true;
                    lease.native().cancel(self.receive.key());
                }
                None
            }
            RequestState::Ready => {
                if let Some(id) = self.request_id {
                    lease.native().cancel_request(id);
                }
                Some(self.finish(RequestState::Aborted, false))
            }
            RequestState::Sending => {
                if !self.aborting {
                    self.aborting = true;
                    match self.request_id {
                        Some(id) => lease.native().cancel_request(id),
                        None => lease.native().cancel(self.send.key()),
                    }
                }
                None
            }
        }
    }

    fn finish(&mut self, state: RequestState, fatal: bool) -> SlotEvent {
        self.state = state;
        let outcome = match state {
            RequestState::Sent => RequestOutcome::Completed,
            _ => RequestOutcome::Aborted,
        };
        SlotEvent::Done {
            was_ready: self.notify_on_done,
            outcome,
            fatal,
        }
    }

    /// Returns the slot to `Idle` for the next client request.
    ///
    /// Must only be called once no completion for this request can arrive.
    pub(crate) fn release_resources(&mut self) {
        debug_assert!(!self.receive.is_outstanding() && !self.send.is_busy());

        self.generation += 1;
        self.state = RequestState::Idle;
        self.request_id = None;
        self.pending.clear();
        self.end_after_sending_all_chunks = false;
        self.response_started = false;
        self.aborting = false;
        self.notify_on_done = false;
        self.receive.reset();
        self.send.reset();
    }
}

/// The server layer's view of one received request.
///
/// Accessors read the request record in place. Response calls are posted to
/// the listener and applied there in call order. Dropping a handle that
/// never finished its response aborts the request.
#[derive(Debug)]
pub struct RequestHandle {
    token: RequestToken,
    record: Option<RequestRecord>,
    port: CompletionPort,
    finished: bool,
}

impl RequestHandle {
    pub(crate) fn new(token: RequestToken, record: RequestRecord, port: CompletionPort) -> Self {
        Self {
            token,
            record: Some(record),
            port,
            finished: false,
        }
    }

    /// The listener service's identifier for this request.
    pub fn request_id(&self) -> Option<RawRequestId> {
        self.record.as_ref().map(RequestRecord::request_id)
    }

    fn post(&self, command: Command) {
        if !self.port.command(self.token, command) {
            debug!(token = %self.token, "request queue closed; dropping command");
        }
    }
}

impl RequestCore for RequestHandle {
    fn token(&self) -> RequestToken {
        self.token
    }

    fn method(&self) -> Method {
        self.record
            .as_ref()
            .map(RequestRecord::method)
            .unwrap_or_else(|| Method::Unknown(String::new()))
    }

    fn path(&self) -> &str {
        self.record.as_ref().map_or("", RequestRecord::path)
    }

    fn headers(&self) -> HeaderView<'_> {
        self.record
            .as_ref()
            .map(RequestRecord::headers)
            .unwrap_or_default()
    }

    fn query_params(&self) -> QueryParams<'_> {
        self.record
            .as_ref()
            .map(RequestRecord::query_params)
            .unwrap_or_default()
    }

    fn body(&self) -> &[u8] {
        self.record
            .as_ref()
            .map(RequestRecord::body)
            .unwrap_or_default()
    }

    fn send_response(&mut self, response: Response) {
        self.finished = true;
        self.post(Command::Respond(response));
    }

    fn send_response_begin(&mut self, response: Response) {
        self.post(Command::Begin(response));
    }

    fn send_response_body(&mut self, chunk: Body) {
        self.post(Command::Body(chunk));
    }

    fn send_response_end(&mut self) {
        self.finished = true;
        self.post(Command::End);
    }

    fn abort(&mut self) {
        self.finished = true;
        self.post(Command::Abort);
    }

    fn release_resources(&mut self) {
        self.record = None;
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.finished {
            debug!(token = %self.token, "request dropped without a response; aborting");
            self.post(Command::Abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::http::StatusCode;
    use crate::transport::port::Event;
    use crate::transport::{NativeQueue, RecordParts, SendPayload, TaskKey, TransportError};

    #[derive(Default)]
    struct Parked {
        receives: Mutex<Vec<ReceiveOp>>,
        sends: Mutex<Vec<SendOp>>,
        cancelled: Mutex<Vec<TaskKey>>,
        cancelled_requests: Mutex<Vec<RawRequestId>>,
    }

    impl NativeQueue for Parked {
        fn add_url(&self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn remove_url(&self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn associate(&self, _: CompletionPort) -> Result<(), TransportError> {
            Ok(())
        }
        fn receive(&self, op: ReceiveOp) {
            self.receives.lock().unwrap().push(op);
        }
        fn send(&self, op: SendOp) {
            self.sends.lock().unwrap().push(op);
        }
        fn cancel(&self, key: TaskKey) {
            self.cancelled.lock().unwrap().push(key);
        }
        fn cancel_request(&self, request_id: RawRequestId) {
            self.cancelled_requests.lock().unwrap().push(request_id);
        }
    }

    struct Fixture {
        native: Arc<Parked>,
        lease: HandleLease,
        port: CompletionPort,
        events: mpsc::UnboundedReceiver<Event>,
        slot: HttpRequest,
    }

    impl Fixture {
        fn new() -> Self {
            let native = Arc::new(Parked::default());
            let (port, events) = CompletionPort::new();
            Self {
                lease: HandleLease::new(native.clone()),
                native,
                port,
                events,
                slot: HttpRequest::new(0, 4096),
            }
        }

        fn take_receive(&self) -> ReceiveOp {
            self.native.receives.lock().unwrap().pop().unwrap()
        }

        fn take_send(&self) -> SendOp {
            self.native.sends.lock().unwrap().remove(0)
        }

        /// Drives the slot to `Ready` and returns the handle.
        fn ready(&mut self) -> RequestHandle {
            self.slot.receive(&self.lease);
            let mut op = self.take_receive();
            let len = RecordParts {
                request_id: 77,
                verb: "GET",
                target: "/api/browse?path=%2Fmusic",
                headers: &[("Accept", "application/json")],
                body: b"",
            }
            .encode(&mut op.buffer, op.limit)
            .unwrap();
            match self.slot.on_receive_complete(&self.lease, &self.port, op, Ok(len)) {
                Some(SlotEvent::Ready(handle)) => handle,
                other => panic!("expected a ready request, got {other:?}"),
            }
        }

        fn apply(&mut self, command: Command) -> Result<Option<SlotEvent>, RequestError> {
            self.slot.apply(&self.lease, command)
        }

        fn complete_send(&mut self, result: Result<usize, OverlappedError>) -> Option<SlotEvent> {
            let op = self.take_send();
            self.slot.on_send_complete(&self.lease, op, result)
        }
    }

    fn done(event: Option<SlotEvent>) -> (bool, RequestOutcome, bool) {
        match event {
            Some(SlotEvent::Done {
                was_ready,
                outcome,
                fatal,
            }) => (was_ready, outcome, fatal),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn handle_views_the_received_record() {
        let mut fixture = Fixture::new();
        let handle = fixture.ready();
        assert_eq!(fixture.slot.state(), RequestState::Ready);
        assert_eq!(handle.request_id(), Some(77));
        assert_eq!(handle.method(), Method::Get);
        assert_eq!(handle.path(), "/api/browse");
        assert_eq!(handle.query_params().get("path"), Some("/music"));
        assert_eq!(handle.headers().get("accept"), Some("application/json"));
        assert_eq!(handle.token(), fixture.slot.token());
    }

    #[test]
    fn full_response_is_one_final_send() {
        let mut fixture = Fixture::new();
        let _handle = fixture.ready();

        let response = Response::new(StatusCode::OK).body(Bytes::from_static(b"{}"));
        assert!(fixture.apply(Command::Respond(response)).unwrap().is_none());
        assert_eq!(fixture.slot.state(), RequestState::Sending);
        assert!(!fixture.native.sends.lock().unwrap()[0].more_data);

        let (was_ready, outcome, fatal) = done(fixture.complete_send(Ok(2)));
        assert!(was_ready && !fatal);
        assert_eq!(outcome, RequestOutcome::Completed);
        assert_eq!(fixture.slot.state(), RequestState::Sent);

        let before = fixture.slot.token();
        fixture.slot.release_resources();
        assert_eq!(fixture.slot.state(), RequestState::Idle);
        assert_ne!(fixture.slot.token(), before);
    }

    #[test]
    fn chunks_after_a_drained_queue_are_issued_directly() {
        let mut fixture = Fixture::new();
        let _handle = fixture.ready();

        fixture.apply(Command::Begin(Response::new(StatusCode::OK))).unwrap();
        assert!(fixture.complete_send(Ok(0)).is_none());
        assert_eq!(fixture.slot.state(), RequestState::Ready);

        fixture.apply(Command::Body(Body::from("a"))).unwrap();
        assert!(fixture.native.sends.lock().unwrap()[0].more_data);
        fixture.apply(Command::Body(Body::Empty)).unwrap();
        fixture.apply(Command::End).unwrap();
        assert_eq!(fixture.native.sends.lock().unwrap().len(), 1);

        // The end arrived while "a" was in flight, so the empty final
        // chunk follows it.
        assert!(fixture.complete_send(Ok(1)).is_none());
        let last = fixture.take_send();
        assert!(!last.more_data);
        assert!(matches!(last.payload, SendPayload::Body(Body::Empty)));
        let event = fixture.slot.on_send_complete(&fixture.lease, last, Ok(0));
        assert_eq!(done(event).1, RequestOutcome::Completed);
    }

    #[test]
    fn response_sequence_is_enforced() {
        let mut fixture = Fixture::new();
        assert_eq!(
            fixture.apply(Command::Begin(Response::default())).unwrap_err(),
            RequestError::NotReady(RequestState::Idle)
        );

        let _handle = fixture.ready();
        assert_eq!(
            fixture.apply(Command::End).unwrap_err(),
            RequestError::NotStarted
        );
        fixture.apply(Command::Respond(Response::default())).unwrap();
        assert_eq!(
            fixture.apply(Command::Begin(Response::default())).unwrap_err(),
            RequestError::AlreadyStarted
        );
        assert_eq!(
            fixture.apply(Command::Body(Body::from("late"))).unwrap_err(),
            RequestError::AlreadyEnded
        );
        assert_eq!(fixture.native.sends.lock().unwrap().len(), 1);
    }

    #[test]
    fn oversized_record_cancels_the_request() {
        let mut fixture = Fixture::new();
        fixture.slot.receive(&fixture.lease);
        let op = fixture.take_receive();
        let result = Err(OverlappedError::MoreData {
            required: 5000,
            capacity: 4096,
            request_id: 12,
        });

        let event = fixture.slot.on_receive_complete(&fixture.lease, &fixture.port, op, result);
        assert_eq!(done(event), (false, RequestOutcome::Aborted, false));
        assert_eq!(*fixture.native.cancelled_requests.lock().unwrap(), vec![12]);
    }

    #[test]
    fn closed_service_is_fatal() {
        let mut fixture = Fixture::new();
        fixture.slot.receive(&fixture.lease);
        let op = fixture.take_receive();
        let event = fixture.slot.on_receive_complete(
            &fixture.lease,
            &fixture.port,
            op,
            Err(OverlappedError::Closed),
        );
        assert!(done(event).2);
    }

    #[test]
    fn abort_while_receiving_waits_for_the_completion() {
        let mut fixture = Fixture::new();
        fixture.slot.receive(&fixture.lease);

        assert!(fixture.slot.abort(&fixture.lease).is_none());
        assert!(fixture.slot.abort(&fixture.lease).is_none());
        assert_eq!(fixture.native.cancelled.lock().unwrap().len(), 1);

        // The record raced the cancellation; the request is still dropped.
        let mut op = fixture.take_receive();
        let len = RecordParts {
            request_id: 3,
            verb: "GET",
            target: "/",
            headers: &[],
            body: b"",
        }
        .encode(&mut op.buffer, op.limit)
        .unwrap();
        let event = fixture.slot.on_receive_complete(&fixture.lease, &fixture.port, op, Ok(len));
        assert_eq!(done(event), (false, RequestOutcome::Aborted, false));
        assert_eq!(*fixture.native.cancelled_requests.lock().unwrap(), vec![3]);

        fixture.slot.release_resources();
        fixture.slot.receive(&fixture.lease);
        assert_eq!(fixture.slot.state(), RequestState::Receiving);
    }

    #[test]
    fn abort_from_the_handle_is_not_reported() {
        let mut fixture = Fixture::new();
        let _handle = fixture.ready();
        let event = fixture.apply(Command::Abort).unwrap();
        assert_eq!(done(event), (false, RequestOutcome::Aborted, false));
    }

    #[test]
    fn transport_abort_of_a_ready_request_is_reported() {
        let mut fixture = Fixture::new();
        let _handle = fixture.ready();
        let event = fixture.slot.abort(&fixture.lease);
        assert_eq!(done(event), (true, RequestOutcome::Aborted, false));
        assert_eq!(*fixture.native.cancelled_requests.lock().unwrap(), vec![77]);
    }

    #[test]
    fn dropping_an_unanswered_handle_posts_abort() {
        let mut fixture = Fixture::new();
        let handle = fixture.ready();
        let token = handle.token();
        drop(handle);

        match fixture.events.try_recv().unwrap() {
            Event::Command {
                token: posted,
                command: Command::Abort,
            } => assert_eq!(posted, token),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn answered_handle_drops_quietly() {
        let mut fixture = Fixture::new();
        let mut handle = fixture.ready();
        handle.send_response(Response::default());
        handle.release_resources();
        assert_eq!(handle.path(), "");
        drop(handle);

        assert!(matches!(
            fixture.events.try_recv().unwrap(),
            Event::Command {
                command: Command::Respond(_),
                ..
            }
        ));
        assert!(fixture.events.try_recv().is_err());
    }
}
