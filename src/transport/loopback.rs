//! An in-process listener service.
//!
//! [`LoopbackService`] plays the part of the OS HTTP listener: it owns the URL
//! table, parses raw client requests with [`httparse`], routes each one to the
//! queue whose prefix matches best, writes it into a posted receive as a
//! request record, and collects the response sends into a [`ClientResponse`].
//!
//! Requests that arrive while a queue has no receive posted wait in that
//! queue's backlog, the same backpressure the OS service applies once every
//! slot of a listener is busy.
//!
//! ```no_run
//! use std::sync::Arc;
//! use playwire::transport::HttpRequestQueue;
//! use playwire::transport::loopback::LoopbackService;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let service = LoopbackService::new();
//! let mut queue = HttpRequestQueue::with_defaults(service.open_queue());
//! queue.bind_prefix("/api/")?;
//! queue.start()?;
//!
//! let pending = service.request(b"GET /api/status HTTP/1.1\r\nHost: player\r\n\r\n");
//! queue.dispatch_pending();
//! # let _ = pending;
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::native::{NativeQueue, RawRequestId, ReceiveOp, SendOp, SendPayload, TaskKey, TaskKind};
use super::port::{Completion, CompletionPort};
use super::{OverlappedError, RecordParts, TransportError};
use crate::http::{Body, Headers, Response, StatusCode};

const MAX_HEADERS: usize = 64;

/// What a client sees when its request fails before a full response.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request is incomplete")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("connection reset")]
    Reset,
}

/// A complete response as collected by the service.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl ClientResponse {
    fn from_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

type Reply = oneshot::Sender<Result<ClientResponse, ClientError>>;

/// The client side of one submitted request.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<ClientResponse, ClientError>>,
}

impl PendingResponse {
    fn ready(result: Result<ClientResponse, ClientError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    pub async fn wait(self) -> Result<ClientResponse, ClientError> {
        self.rx.await.unwrap_or(Err(ClientError::Reset))
    }

    /// Returns the response if it has been completed.
    pub fn try_take(&mut self) -> Option<Result<ClientResponse, ClientError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::Reset)),
        }
    }
}

/// A parsed client request waiting for a receive.
struct Inbound {
    request_id: RawRequestId,
    verb: String,
    target: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    reply: Reply,
}

impl Inbound {
    fn encode(&self, op: &mut ReceiveOp) -> Result<usize, usize> {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        RecordParts {
            request_id: self.request_id,
            verb: &self.verb,
            target: &self.target,
            headers: &headers,
            body: &self.body,
        }
        .encode(&mut op.buffer, op.limit)
    }
}

/// A request handed to a queue and the response collected so far.
struct Exchange {
    reply: Reply,
    status: StatusCode,
    headers: Headers,
    body: BytesMut,
}

impl Exchange {
    fn finish(self) {
        let _ = self.reply.send(Ok(ClientResponse {
            status: self.status,
            headers: self.headers,
            body: self.body.freeze(),
        }));
    }
}

#[derive(Default)]
struct QueueState {
    port: Option<CompletionPort>,
    receives: VecDeque<ReceiveOp>,
    backlog: VecDeque<Inbound>,
    active: HashMap<RawRequestId, Exchange>,
}

struct Route {
    prefix: String,
    path: String,
    queue: u64,
}

#[derive(Default)]
struct State {
    routes: Vec<Route>,
    queues: HashMap<u64, QueueState>,
    next_queue: u64,
    next_request: RawRequestId,
}

impl State {
    /// Longest registered path prefix of `path`.
    fn route(&self, path: &str) -> Option<u64> {
        self.routes
            .iter()
            .filter(|route| path.starts_with(&route.path))
            .max_by_key(|route| route.path.len())
            .map(|route| route.queue)
    }
}

/// Completions gathered under the lock and delivered after it is released.
///
/// Dropping a completion can release the last lease on the queue, whose
/// `Drop` takes the lock again.
#[derive(Default)]
struct Outbox(Vec<(Option<CompletionPort>, Completion)>);

impl Outbox {
    fn push(&mut self, port: Option<&CompletionPort>, completion: Completion) {
        self.0.push((port.cloned(), completion));
    }

    fn deliver(self) {
        for (port, completion) in self.0 {
            match port {
                Some(port) => port.complete(completion),
                None => trace!("completion for an unassociated queue dropped"),
            }
        }
    }
}

/// Writes `inbound` into a posted receive and tracks it until its final send.
fn fill(
    queue: &mut QueueState,
    mut op: ReceiveOp,
    inbound: Inbound,
    outbox: &mut Outbox,
) {
    let request_id = inbound.request_id;
    let result = inbound.encode(&mut op).map_err(|required| {
        debug!(request_id, required, limit = op.limit, "request record exceeds receive buffer");
        OverlappedError::MoreData {
            required,
            capacity: op.limit,
            request_id,
        }
    });

    queue.active.insert(
        request_id,
        Exchange {
            reply: inbound.reply,
            status: StatusCode::OK,
            headers: Headers::new(),
            body: BytesMut::new(),
        },
    );
    outbox.push(queue.port.as_ref(), Completion::Receive { op, result });
}

/// An in-process HTTP listener service. Clones share the same URL table.
#[derive(Clone, Default)]
pub struct LoopbackService {
    state: Arc<Mutex<State>>,
}

impl LoopbackService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a request queue on this service.
    pub fn open_queue(&self) -> Arc<LoopbackQueue> {
        let mut state = self.lock();
        let id = state.next_queue;
        state.next_queue += 1;
        state.queues.insert(id, QueueState::default());
        Arc::new(LoopbackQueue {
            id,
            service: self.clone(),
        })
    }

    /// Submits a raw HTTP/1.1 request.
    pub fn request(&self, raw: &[u8]) -> PendingResponse {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);

        let body_offset = match parsed.parse(raw) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => return PendingResponse::ready(Err(ClientError::Incomplete)),
            Err(err) => return PendingResponse::ready(Err(err.into())),
        };

        let verb = parsed.method.unwrap_or("GET").to_owned();
        let target = parsed.path.unwrap_or("/").to_owned();
        let headers = parsed
            .headers
            .iter()
            .map(|header| {
                std::str::from_utf8(header.value)
                    .map(|value| (header.name.to_owned(), value.to_owned()))
                    .map_err(|_| httparse::Error::HeaderValue)
            })
            .collect::<Result<Vec<_>, _>>();
        let headers = match headers {
            Ok(headers) => headers,
            Err(err) => return PendingResponse::ready(Err(err.into())),
        };

        let rest = &raw[body_offset..];
        let body = match content_length(&headers) {
            Some(len) if len > rest.len() => {
                return PendingResponse::ready(Err(ClientError::Incomplete));
            }
            Some(len) => rest[..len].to_vec(),
            None => rest.to_vec(),
        };

        let (reply, rx) = oneshot::channel();
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock();
            let path = target.split('?').next().unwrap_or_default();
            let Some(queue_id) = state.route(path) else {
                trace!(target = %target, "no prefix matches; answering 404");
                let _ = reply.send(Ok(ClientResponse::from_status(StatusCode::NOT_FOUND)));
                return PendingResponse { rx };
            };

            state.next_request += 1;
            let inbound = Inbound {
                request_id: state.next_request,
                verb,
                target,
                headers,
                body,
                reply,
            };

            if let Some(queue) = state.queues.get_mut(&queue_id) {
                match queue.receives.pop_front() {
                    Some(op) => fill(queue, op, inbound, &mut outbox),
                    None => queue.backlog.push_back(inbound),
                }
            }
        }
        outbox.deliver();

        PendingResponse { rx }
    }

    /// `GET` for `target` with a `Host` header.
    pub fn get(&self, target: &str) -> PendingResponse {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: loopback\r\n\r\n");
        self.request(raw.as_bytes())
    }

    /// Requests waiting for a receive, across all queues.
    pub fn backlog(&self) -> usize {
        self.lock().queues.values().map(|queue| queue.backlog.len()).sum()
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.lock().routes.iter().map(|route| route.prefix.clone()).collect()
    }
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Splits a URL prefix into the path it matches on.
///
/// Accepts `/path/` and `scheme://host[:port]/path/`.
fn prefix_path(prefix: &str) -> Result<&str, TransportError> {
    let invalid = |reason| TransportError::InvalidPrefix {
        prefix: prefix.to_owned(),
        reason,
    };

    let path = match prefix.split_once("://") {
        Some((scheme, rest)) => {
            if scheme != "http" && scheme != "https" {
                return Err(invalid("unsupported scheme"));
            }
            let at = rest.find('/').ok_or_else(|| invalid("missing path"))?;
            if at == 0 {
                return Err(invalid("missing host"));
            }
            &rest[at..]
        }
        None if prefix.starts_with('/') => prefix,
        None => return Err(invalid("must be absolute")),
    };

    if !path.ends_with('/') {
        return Err(invalid("must end with '/'"));
    }
    Ok(path)
}

/// One request queue on a [`LoopbackService`].
pub struct LoopbackQueue {
    id: u64,
    service: LoopbackService,
}

impl LoopbackQueue {
    fn with_queue<R>(&self, f: impl FnOnce(&mut QueueState, &mut Outbox) -> R) -> Option<R> {
        let mut outbox = Outbox::default();
        let result = {
            let mut state = self.service.lock();
            state.queues.get_mut(&self.id).map(|queue| f(queue, &mut outbox))
        };
        outbox.deliver();
        result
    }

    fn transmit(exchange: &mut Exchange, payload: SendPayload) -> Result<usize, OverlappedError> {
        let body = match payload {
            SendPayload::Response(response) => {
                let (status, headers, body) = Response::into_parts(response);
                exchange.status = status;
                exchange.headers = headers;
                body
            }
            SendPayload::Body(body) => body,
        };

        match body {
            Body::Empty => Ok(0),
            Body::Bytes(bytes) => {
                exchange.body.extend_from_slice(&bytes);
                Ok(bytes.len())
            }
            Body::File(mut file) => {
                let mut contents = Vec::new();
                let len = file.read_to_end(&mut contents)?;
                exchange.body.extend_from_slice(&contents);
                Ok(len)
            }
        }
    }
}

impl NativeQueue for LoopbackQueue {
    fn add_url(&self, prefix: &str) -> Result<(), TransportError> {
        let path = prefix_path(prefix)?;
        let mut state = self.service.lock();
        if state.routes.iter().any(|route| route.path == path) {
            return Err(TransportError::PrefixConflict {
                prefix: prefix.to_owned(),
            });
        }
        state.routes.push(Route {
            prefix: prefix.to_owned(),
            path: path.to_owned(),
            queue: self.id,
        });
        Ok(())
    }

    fn remove_url(&self, prefix: &str) -> Result<(), TransportError> {
        let mut state = self.service.lock();
        let at = state
            .routes
            .iter()
            .position(|route| route.queue == self.id && route.prefix == prefix)
            .ok_or_else(|| TransportError::PrefixNotBound {
                prefix: prefix.to_owned(),
            })?;
        state.routes.remove(at);
        Ok(())
    }

    fn associate(&self, port: CompletionPort) -> Result<(), TransportError> {
        self.with_queue(|queue, _| match queue.port {
            Some(_) => Err(TransportError::AlreadyAssociated),
            None => {
                queue.port = Some(port);
                Ok(())
            }
        })
        .unwrap_or(Err(TransportError::Closed))
    }

    fn receive(&self, op: ReceiveOp) {
        self.with_queue(move |queue, outbox| match queue.backlog.pop_front() {
            Some(inbound) => fill(queue, op, inbound, outbox),
            None => queue.receives.push_back(op),
        });
    }

    fn send(&self, mut op: SendOp) {
        self.with_queue(move |queue, outbox| {
            let payload = mem::replace(&mut op.payload, SendPayload::Body(Body::Empty));
            let result = match queue.active.get_mut(&op.request_id) {
                Some(exchange) => Self::transmit(exchange, payload),
                None => Err(OverlappedError::InvalidRequest(op.request_id)),
            };

            match &result {
                Ok(_) if !op.more_data => {
                    if let Some(exchange) = queue.active.remove(&op.request_id) {
                        exchange.finish();
                    }
                }
                Err(OverlappedError::Io(_)) => {
                    if queue.active.remove(&op.request_id).is_some() {
                        debug!(request_id = op.request_id, "send failed; connection reset");
                    }
                }
                _ => {}
            }
            outbox.push(queue.port.as_ref(), Completion::Send { op, result });
        });
    }

    fn cancel(&self, key: TaskKey) {
        if key.kind != TaskKind::Receive {
            return;
        }
        self.with_queue(|queue, outbox| {
            if let Some(at) = queue.receives.iter().position(|op| op.key == key) {
                if let Some(op) = queue.receives.remove(at) {
                    outbox.push(
                        queue.port.as_ref(),
                        Completion::Receive {
                            op,
                            result: Err(OverlappedError::Aborted),
                        },
                    );
                }
            }
        });
    }

    fn cancel_request(&self, request_id: RawRequestId) {
        self.with_queue(|queue, _| {
            // Dropping the reply resets the client.
            if queue.active.remove(&request_id).is_some() {
                debug!(request_id, "request cancelled; connection reset");
            }
        });
    }
}

impl Drop for LoopbackQueue {
    fn drop(&mut self) {
        let (queue, backlog_len) = {
            let mut state = self.service.lock();
            state.routes.retain(|route| route.queue != self.id);
            let queue = state.queues.remove(&self.id);
            let backlog_len = queue.as_ref().map_or(0, |queue| queue.backlog.len());
            (queue, backlog_len)
        };

        let Some(queue) = queue else {
            return;
        };
        for inbound in queue.backlog {
            let _ = inbound
                .reply
                .send(Ok(ClientResponse::from_status(StatusCode::SERVICE_UNAVAILABLE)));
        }
        debug!(queue = self.id, backlog = backlog_len, "loopback queue closed");
    }
}
