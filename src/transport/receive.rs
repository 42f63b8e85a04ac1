//! One slot's receive task and the lifecycle of its buffer.

use std::mem;

use bytes::BytesMut;
use tracing::debug;

use super::native::{HandleLease, ReceiveOp, TaskKey, TaskKind};
use super::{OverlappedError, RequestRecord};

/// Where the receive buffer currently lives.
#[derive(Debug)]
enum Buffer {
    /// Owned by the task, ready for the next receive.
    Idle(BytesMut),
    /// Moved into an op the service has not returned yet.
    Outstanding,
    /// Frozen into the record of the request being served.
    Filled(RequestRecord),
}

#[derive(Debug)]
pub(crate) struct ReceiveTask {
    key: TaskKey,
    size: usize,
    buffer: Buffer,
}

impl ReceiveTask {
    /// The buffer itself is allocated on the first [`run`](Self::run).
    pub(crate) fn new(slot: usize, size: usize) -> Self {
        Self {
            key: TaskKey {
                slot,
                kind: TaskKind::Receive,
            },
            size,
            buffer: Buffer::Idle(BytesMut::new()),
        }
    }

    pub(crate) fn key(&self) -> TaskKey {
        self.key
    }

    pub(crate) fn is_outstanding(&self) -> bool {
        matches!(self.buffer, Buffer::Outstanding)
    }

    #[cfg(test)]
    pub(crate) fn record(&self) -> Option<&RequestRecord> {
        match &self.buffer {
            Buffer::Filled(record) => Some(record),
            _ => None,
        }
    }

    /// Issues one receive for the next request record.
    ///
    /// Returns `false` without issuing anything if the buffer is not idle.
    pub(crate) fn run(&mut self, lease: &HandleLease) -> bool {
        let mut buffer = match mem::replace(&mut self.buffer, Buffer::Outstanding) {
            Buffer::Idle(buffer) => buffer,
            other => {
                self.buffer = other;
                return false;
            }
        };

        buffer.clear();
        buffer.reserve(self.size);

        lease.native().receive(ReceiveOp {
            key: self.key,
            buffer,
            limit: self.size,
            _lease: lease.clone(),
        });
        true
    }

    /// Takes the buffer back from a finished receive and parses the record.
    pub(crate) fn complete(
        &mut self,
        op: ReceiveOp,
        result: Result<usize, OverlappedError>,
    ) -> Result<RequestRecord, OverlappedError> {
        let ReceiveOp { mut buffer, .. } = op;

        let len = match result {
            Ok(len) => len,
            Err(err) => {
                self.buffer = Buffer::Idle(buffer);
                return Err(err);
            }
        };

        buffer.truncate(len);
        match RequestRecord::parse(buffer.freeze()) {
            Ok(record) => {
                self.buffer = Buffer::Filled(record.clone());
                Ok(record)
            }
            Err(err) => {
                // The failed parse consumed the frozen buffer; `reset` will
                // allocate a fresh one.
                self.buffer = Buffer::Idle(BytesMut::new());
                Err(err.into())
            }
        }
    }

    /// Reclaims the buffer for the next request on this slot.
    ///
    /// If a request handle still holds the previous record the buffer cannot
    /// be reused and a new one is allocated.
    pub(crate) fn reset(&mut self) {
        let record = match mem::replace(&mut self.buffer, Buffer::Idle(BytesMut::new())) {
            Buffer::Filled(record) => record,
            Buffer::Idle(mut buffer) => {
                buffer.clear();
                self.buffer = Buffer::Idle(buffer);
                return;
            }
            Buffer::Outstanding => {
                self.buffer = Buffer::Outstanding;
                return;
            }
        };

        match record.into_bytes().try_into_mut() {
            Ok(mut buffer) => {
                buffer.clear();
                self.buffer = Buffer::Idle(buffer);
            }
            Err(_) => {
                debug!(slot = self.key.slot, "receive buffer still referenced; reallocating");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::transport::{
        CompletionPort, NativeQueue, RawRequestId, RecordParts, SendOp, TransportError,
    };

    #[derive(Default)]
    struct Parked {
        ops: Mutex<Vec<ReceiveOp>>,
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
            self.ops.lock().unwrap().push(op);
        }
        fn send(&self, _: SendOp) {}
        fn cancel(&self, _: TaskKey) {}
        fn cancel_request(&self, _: RawRequestId) {}
    }

    fn fill(op: &mut ReceiveOp) -> usize {
        RecordParts {
            request_id: 42,
            verb: "GET",
            target: "/api/query?x=1",
            headers: &[("Host", "localhost")],
            body: b"",
        }
        .encode(&mut op.buffer, op.limit)
        .unwrap()
    }

    #[test]
    fn buffer_moves_into_op_and_back() {
        let native = Arc::new(Parked::default());
        let lease = HandleLease::new(native.clone());
        let mut task = ReceiveTask::new(3, 4096);

        assert!(task.run(&lease));
        assert!(task.is_outstanding());
        assert!(!task.run(&lease), "second receive while outstanding");
        assert_eq!(lease.others(), 1);

        let mut op = native.ops.lock().unwrap().pop().unwrap();
        assert_eq!(op.key, TaskKey { slot: 3, kind: TaskKind::Receive });
        assert!(op.buffer.capacity() >= 4096);
        let len = fill(&mut op);

        let record = task.complete(op, Ok(len)).unwrap();
        assert_eq!(lease.others(), 0);
        assert_eq!(record.request_id(), 42);
        assert_eq!(record.path(), "/api/query");
        assert_eq!(task.record().map(|r| r.request_id()), Some(42));
    }

    #[test]
    fn reset_reuses_unshared_buffer() {
        let native = Arc::new(Parked::default());
        let lease = HandleLease::new(native.clone());
        let mut task = ReceiveTask::new(0, 4096);

        task.run(&lease);
        let mut op = native.ops.lock().unwrap().pop().unwrap();
        let len = fill(&mut op);
        let record = task.complete(op, Ok(len)).unwrap();
        drop(record);

        task.reset();
        assert!(task.record().is_none());
        assert!(task.run(&lease));
        let op = native.ops.lock().unwrap().pop().unwrap();
        assert!(op.buffer.is_empty());
        assert!(op.buffer.capacity() >= 4096);
    }

    #[test]
    fn reset_while_record_is_shared_allocates_fresh_buffer() {
        let native = Arc::new(Parked::default());
        let lease = HandleLease::new(native.clone());
        let mut task = ReceiveTask::new(0, 1024);

        task.run(&lease);
        let mut op = native.ops.lock().unwrap().pop().unwrap();
        let len = fill(&mut op);
        let held = task.complete(op, Ok(len)).unwrap();

        task.reset();
        assert!(task.run(&lease));
        // The old record is untouched by the new receive.
        assert_eq!(held.path(), "/api/query");
    }

    #[test]
    fn failed_receive_returns_buffer() {
        let native = Arc::new(Parked::default());
        let lease = HandleLease::new(native.clone());
        let mut task = ReceiveTask::new(0, 1024);

        task.run(&lease);
        let op = native.ops.lock().unwrap().pop().unwrap();
        let err = task.complete(op, Err(OverlappedError::Aborted)).unwrap_err();
        assert!(matches!(err, OverlappedError::Aborted));
        assert!(!task.is_outstanding());
        assert!(task.run(&lease));
    }

    #[test]
    fn malformed_record_is_a_request_failure() {
        let native = Arc::new(Parked::default());
        let lease = HandleLease::new(native.clone());
        let mut task = ReceiveTask::new(0, 1024);

        task.run(&lease);
        let mut op = native.ops.lock().unwrap().pop().unwrap();
        op.buffer.extend_from_slice(&[1, 2, 3]);
        let err = task.complete(op, Ok(3)).unwrap_err();
        assert!(matches!(err, OverlappedError::Record(_)));
        assert!(task.run(&lease));
    }
}
