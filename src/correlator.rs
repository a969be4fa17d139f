use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::timer::{TimeoutHandle, Timer};

/// never issued as a request id
pub const NO_REQUEST_ID: i32 = -1;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResponseMessage {
    pub request_id: i32,
    pub payload: Bytes,
}

pub type ResponseResult = Result<ResponseMessage, TransportError>;

struct PendingRequest {
    created_at: Instant,
    /// `None` for timeouts too large to be represented, i.e. no effective deadline
    deadline: Option<Instant>,
    result_slot: oneshot::Sender<ResponseResult>,
    timeout: Option<TimeoutHandle>,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    entries: FxHashMap<i32, PendingRequest>,
}

/// Tracks requests awaiting a response. Each pending request is resolved exactly once, by
///  whichever comes first of response, timeout, write failure and connection close: resolving
///  means removing the entry, and only one party can remove it.
pub struct RequestCorrelator {
    name: Arc<str>,
    timer: Timer,
    next_request_id: AtomicI32,
    pending: Arc<Mutex<PendingTable>>,
}

impl RequestCorrelator {
    pub fn new(name: Arc<str>, timer: Timer) -> RequestCorrelator {
        RequestCorrelator {
            name,
            timer,
            next_request_id: AtomicI32::new(0),
            pending: Default::default(),
        }
    }

    /// Allocates a request id and registers a pending request with the given timeout. Fails with
    ///  [TransportError::ConnectionClosed] after [RequestCorrelator::close].
    pub fn register(&self, timeout: Duration) -> Result<(i32, ResponseFuture), TransportError> {
        let now = Instant::now();
        let deadline = now.checked_add(timeout);

        let mut pending = self.pending.lock().unwrap();
        if pending.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let request_id = self.next_free_id(&pending.entries);
        let (result_slot, rx) = oneshot::channel();

        let timeout_handle = {
            let name = self.name.clone();
            let table = self.pending.clone();
            self.timer.schedule(timeout, async move {
                let removed = table.lock().unwrap().entries.remove(&request_id);
                if let Some(request) = removed {
                    debug!(%name, request_id, elapsed=?request.created_at.elapsed(), "request timed out");
                    let _ = request.result_slot.send(Err(TransportError::Timeout(timeout)));
                }
            })
        };

        // a stopped timer means teardown is in progress
        let timeout_handle = match timeout_handle {
            Ok(h) => h,
            Err(e) => {
                debug!(name=%self.name, "not registering request: {}", e);
                return Err(TransportError::ConnectionClosed);
            }
        };

        pending.entries.insert(request_id, PendingRequest {
            created_at: now,
            deadline,
            result_slot,
            timeout: Some(timeout_handle),
        });
        trace!(name=%self.name, request_id, "registered request");

        Ok((request_id, ResponseFuture { request_id, rx }))
    }

    fn next_free_id(&self, entries: &FxHashMap<i32, PendingRequest>) -> i32 {
        loop {
            // wrapping
            let candidate = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if candidate != NO_REQUEST_ID && !entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Resolves the pending request with this id. Returns `false` for responses without a
    ///  matching request, e.g. because it timed out already.
    pub fn complete(&self, request_id: i32, payload: Bytes) -> bool {
        match self.remove(request_id) {
            Some(request) => {
                if request.deadline.is_some_and(|d| d < Instant::now()) {
                    // the timeout task was about to fire
                    debug!(name=%self.name, request_id, elapsed=?request.created_at.elapsed(), "response arrived after the deadline - accepting it");
                }
                else {
                    trace!(name=%self.name, request_id, elapsed=?request.created_at.elapsed(), "received response");
                }
                let _ = request.result_slot.send(Ok(ResponseMessage { request_id, payload }));
                true
            }
            None => {
                warn!(name=%self.name, request_id, "received response for unknown or expired request - dropping");
                false
            }
        }
    }

    /// resolves the pending request with an error, e.g. because the request packet could not be
    ///  written
    pub fn fail(&self, request_id: i32, error: TransportError) -> bool {
        match self.remove(request_id) {
            Some(request) => {
                let _ = request.result_slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    fn remove(&self, request_id: i32) -> Option<PendingRequest> {
        let mut request = self.pending.lock().unwrap().entries.remove(&request_id)?;
        if let Some(timeout) = request.timeout.take() {
            timeout.cancel();
        }
        Some(request)
    }

    /// Fails all pending requests with [TransportError::ConnectionClosed], and rejects
    ///  subsequent registrations. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut pending = self.pending.lock().unwrap();
            pending.closed = true;
            std::mem::take(&mut pending.entries)
        };

        if !drained.is_empty() {
            debug!(name=%self.name, num_pending=drained.len(), "failing pending requests on close");
        }
        for (_, mut request) in drained {
            if let Some(timeout) = request.timeout.take() {
                timeout.cancel();
            }
            let _ = request.result_slot.send(Err(TransportError::ConnectionClosed));
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().unwrap().entries.len()
    }
}

/// Resolves to the response of a request, or to the reason why there is none.
pub struct ResponseFuture {
    request_id: i32,
    rx: oneshot::Receiver<ResponseResult>,
}

impl ResponseFuture {
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// a future that is failed from the start, for requests that could not be sent at all
    pub fn failed(error: TransportError) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        ResponseFuture {
            request_id: NO_REQUEST_ID,
            rx,
        }
    }
}

impl Future for ResponseFuture {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
