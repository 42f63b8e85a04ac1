//! The listener: native handle, URL bindings and the request slot pool.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::binding::UrlBinding;
use super::native::{HandleLease, NativeQueue};
use super::port::{Completion, CompletionPort, Event};
use super::request::{HttpRequest, RequestOutcome, RequestState, SlotEvent};
use super::TransportError;
use crate::config::TransportConfig;
use crate::http::{RequestCore, RequestToken};

/// Receives the requests a [`HttpRequestQueue`] hands to the server layer.
///
/// Both methods run inside the queue's dispatch, on whatever task drives it.
pub trait RequestEventListener: Send {
    /// A client request is ready to be answered.
    fn on_request_ready(&mut self, request: Box<dyn RequestCore>);

    /// A request handed out by `on_request_ready` has ended, either after its
    /// final chunk was sent or because the transport gave up on it. Not
    /// called for requests the server layer aborted itself.
    fn on_request_done(&mut self, token: RequestToken, outcome: RequestOutcome) {
        let _ = (token, outcome);
    }
}

/// Snapshot of the slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    /// Slots with a receive posted.
    pub receiving: usize,
    /// Slots holding a request handed to the server layer.
    pub active: usize,
    pub idle: usize,
}

/// A URL-bound request queue on a native listener service.
///
/// ```text
/// bind_prefix* ─▶ start ─▶ run_until / dispatch_pending ─▶ shutdown
/// ```
///
/// After [`start`](Self::start) every slot is either receiving or serving a
/// request, so the queue always has `capacity` requests in flight. Slot state
/// changes only inside dispatch.
pub struct HttpRequestQueue {
    capacity: usize,
    buffer_size: usize,
    native: Arc<dyn NativeQueue>,
    lease: HandleLease,
    port: CompletionPort,
    events: mpsc::UnboundedReceiver<Event>,
    bindings: Vec<UrlBinding>,
    requests: Vec<HttpRequest>,
    listener: Option<Box<dyn RequestEventListener>>,
    started: bool,
    stopping: bool,
}

impl HttpRequestQueue {
    /// Creates a queue on `native` sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if `config` fails validation.
    pub fn new(
        native: Arc<dyn NativeQueue>,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self::build(native, config))
    }

    fn build(native: Arc<dyn NativeQueue>, config: &TransportConfig) -> Self {
        let (port, events) = CompletionPort::new();
        Self {
            capacity: config.max_requests,
            buffer_size: config.receive_buffer_size,
            lease: HandleLease::new(Arc::clone(&native)),
            native,
            port,
            events,
            bindings: Vec::new(),
            requests: Vec::new(),
            listener: None,
            started: false,
            stopping: false,
        }
    }

    /// A queue with [`MAX_REQUESTS`](super::MAX_REQUESTS) slots of
    /// [`RECEIVE_BUFFER_SIZE`](super::RECEIVE_BUFFER_SIZE) bytes.
    pub fn with_defaults(native: Arc<dyn NativeQueue>) -> Self {
        Self::build(native, &TransportConfig::default())
    }

    /// Replaces the listener. Requests already handed out are unaffected.
    pub fn set_listener(&mut self, listener: impl RequestEventListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Registers `prefix` with the listener service.
    ///
    /// On failure the queue is left unchanged.
    pub fn bind_prefix(&mut self, prefix: &str) -> Result<(), TransportError> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        if self.bindings.iter().any(|binding| binding.prefix() == prefix) {
            return Err(TransportError::PrefixConflict {
                prefix: prefix.to_owned(),
            });
        }

        let binding = UrlBinding::new(Arc::clone(&self.native), prefix)?;
        debug!(prefix, "prefix bound");
        self.bindings.push(binding);
        Ok(())
    }

    pub fn unbind_prefix(&mut self, prefix: &str) -> Result<(), TransportError> {
        let at = self
            .bindings
            .iter()
            .position(|binding| binding.prefix() == prefix)
            .ok_or_else(|| TransportError::PrefixNotBound {
                prefix: prefix.to_owned(),
            })?;
        self.bindings.remove(at);
        Ok(())
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(UrlBinding::prefix)
    }

    /// Associates the native queue with this queue's completion port and
    /// posts one receive per slot.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        if let Err(err) = self.native.associate(self.port.clone()) {
            error!(error = %err, "failed to associate request queue");
            return Err(err);
        }
        self.started = true;

        self.requests = (0..self.capacity)
            .map(|slot| HttpRequest::new(slot, self.buffer_size))
            .collect();
        for request in &mut self.requests {
            request.receive(&self.lease);
        }

        info!(
            capacity = self.capacity,
            prefixes = ?self.bindings.iter().map(UrlBinding::prefix).collect::<Vec<_>>(),
            "request queue started"
        );
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn pool_stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.capacity,
            ..PoolStats::default()
        };
        for request in &self.requests {
            match request.state() {
                RequestState::Receiving => stats.receiving += 1,
                RequestState::Ready | RequestState::Sending => stats.active += 1,
                RequestState::Idle | RequestState::Sent | RequestState::Aborted => {
                    stats.idle += 1
                }
            }
        }
        stats.idle += self.capacity - self.requests.len();
        stats
    }

    /// Overlapped operations issued and not yet dispatched.
    pub fn outstanding_operations(&self) -> usize {
        self.lease.others()
    }

    /// Dispatches every event already queued without waiting. Returns the
    /// number of events handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Dispatches events as they arrive until `signal` resolves.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        if !self.started {
            return Err(TransportError::NotStarted);
        }
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;
                _ = &mut signal => break,
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Stops receiving, unbinds every prefix, aborts every request and waits
    /// for all outstanding operations to complete.
    ///
    /// Requests still being served are reported to the listener as aborted.
    pub async fn shutdown(&mut self) {
        self.begin_shutdown();

        while self.lease.others() > 0 {
            match self.events.recv().await {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
        info!("request queue shut down");
    }

    fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        debug!(
            outstanding = self.lease.others(),
            "stopping request queue"
        );

        self.bindings.clear();
        for slot in 0..self.requests.len() {
            let event = self.requests[slot].abort(&self.lease);
            self.on_slot_event(slot, event);
        }
    }

    /// Aborts the request on `slot` from whatever state it is in.
    pub(crate) fn abort_slot(&mut self, slot: usize) {
        if let Some(request) = self.requests.get_mut(slot) {
            let event = request.abort(&self.lease);
            self.on_slot_event(slot, event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Completion(Completion::Receive { op, result }) => {
                let slot = op.key.slot;
                let Some(request) = self.requests.get_mut(slot) else {
                    warn!(key = %op.key, "receive completion for unknown slot");
                    return;
                };
                let event = request.on_receive_complete(&self.lease, &self.port, op, result);
                self.on_slot_event(slot, event);
            }
            Event::Completion(Completion::Send { op, result }) => {
                let slot = op.key.slot;
                let Some(request) = self.requests.get_mut(slot) else {
                    warn!(key = %op.key, "send completion for unknown slot");
                    return;
                };
                let event = request.on_send_complete(&self.lease, op, result);
                self.on_slot_event(slot, event);
            }
            Event::Command { token, command } => {
                let Some(request) = self.requests.get_mut(token.slot) else {
                    warn!(%token, "command for unknown slot");
                    return;
                };
                if request.token() != token {
                    debug!(%token, current = %request.token(), "dropping command for a finished request");
                    return;
                }

                let event = match request.apply(&self.lease, command) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(%token, error = %err, "response out of sequence; aborting request");
                        request.abort(&self.lease)
                    }
                };
                self.on_slot_event(token.slot, event);
            }
        }
    }

    fn on_slot_event(&mut self, slot: usize, event: Option<SlotEvent>) {
        match event {
            None => {}
            Some(SlotEvent::Ready(handle)) => match self.listener.as_mut() {
                Some(listener) => listener.on_request_ready(Box::new(handle)),
                // Dropping the handle aborts the request.
                None => warn!(slot, "no request listener registered"),
            },
            Some(SlotEvent::Done {
                was_ready,
                outcome,
                fatal,
            }) => self.notify_done(slot, was_ready, outcome, fatal),
        }
    }

    /// Reports the end of a request, resets its slot and posts the next
    /// receive on it.
    fn notify_done(&mut self, slot: usize, was_ready: bool, outcome: RequestOutcome, fatal: bool) {
        let request = &mut self.requests[slot];
        let token = request.token();
        request.release_resources();
        debug!(%token, ?outcome, was_ready, "request done");

        if was_ready {
            if let Some(listener) = self.listener.as_mut() {
                listener.on_request_done(token, outcome);
            }
        }

        if fatal {
            warn!(slot, "listener service closed; slot retired");
        } else if !self.stopping {
            self.requests[slot].receive(&self.lease);
        }
    }
}

impl fmt::Debug for HttpRequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequestQueue")
            .field("capacity", &self.capacity)
            .field("prefixes", &self.prefixes().collect::<Vec<_>>())
            .field("started", &self.started)
            .field("stopping", &self.stopping)
            .field("stats", &self.pool_stats())
            .finish()
    }
}

impl Drop for HttpRequestQueue {
    /// Cancels everything without waiting. The native handle is released by
    /// whichever outstanding operation returns last.
    fn drop(&mut self) {
        self.begin_shutdown();
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            drop(event);
        }
    }
}
