//! Pending request store.
//!
//! Bridges the request dispatcher and the VMs' local poll/callback channel:
//!
//! 1. The dispatcher builds a [`PendingRequest`] and keeps the receiver half
//!    of its completion channel.
//! 2. [`PendingRequestStore::write_pending_request`] registers the
//!    correlation id and enqueues the invocation on the function's bounded
//!    queue, waiting while the queue is full.
//! 3. A VM polling `GET /next` takes the invocation via
//!    [`PendingRequestStore::dequeue`]; each invocation is consumed once.
//! 4. The VM posts its result and [`PendingRequestStore::try_complete`]
//!    resolves the dispatcher's receiver.
//!
//! A request whose VM dies is never completed; the end-to-end timeout is
//! enforced upstream.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::models::{Invocation, InvocationRequest, InvocationResponse};

/// Default per-function queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Errors from the pending request store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a request with correlation id {0} is already in flight")]
    DuplicateCorrelationId(String),

    #[error("queue for function {0} is closed")]
    QueueClosed(String),
}

/// An in-flight invocation awaiting a VM response.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: InvocationRequest,
    pub correlation_id: String,
    pub partition: i32,
    pub offset: i64,
    completion: oneshot::Sender<InvocationResponse>,
}

impl PendingRequest {
    /// Create a request and the receiver its response will be delivered on.
    pub fn new(
        request: InvocationRequest,
        correlation_id: &str,
        partition: i32,
        offset: i64,
    ) -> (Self, oneshot::Receiver<InvocationResponse>) {
        let (completion, rx) = oneshot::channel();
        let pending = Self {
            request,
            correlation_id: correlation_id.to_string(),
            partition,
            offset,
            completion,
        };
        (pending, rx)
    }
}

/// Completion side of an in-flight request.
#[derive(Debug)]
struct InFlight {
    completion: oneshot::Sender<InvocationResponse>,
    function_key: String,
    partition: i32,
    offset: i64,
}

/// Multi-producer, multi-consumer bounded queue for one function.
#[derive(Debug)]
struct FunctionQueue {
    tx: mpsc::Sender<Invocation>,
    rx: Mutex<mpsc::Receiver<Invocation>>,
}

/// Per-function queues plus the correlation map of in-flight requests.
#[derive(Debug)]
pub struct PendingRequestStore {
    capacity: usize,
    queues: DashMap<String, Arc<FunctionQueue>>,
    in_flight: DashMap<String, InFlight>,
}

impl Default for PendingRequestStore {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl PendingRequestStore {
    /// Create a store whose per-function queues hold `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    fn queue(&self, function_key: &str) -> Arc<FunctionQueue> {
        self.queues
            .entry(function_key.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                Arc::new(FunctionQueue {
                    tx,
                    rx: Mutex::new(rx),
                })
            })
            .clone()
    }

    /// Register `pending` by correlation id and enqueue it for `function_key`.
    ///
    /// Waits while the function's queue is full.
    pub async fn write_pending_request(
        &self,
        function_key: &str,
        pending: PendingRequest,
    ) -> Result<(), StoreError> {
        let PendingRequest {
            request,
            correlation_id,
            partition,
            offset,
            completion,
        } = pending;

        match self.in_flight.entry(correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::DuplicateCorrelationId(correlation_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    completion,
                    function_key: function_key.to_string(),
                    partition,
                    offset,
                });
            }
        }

        let queue = self.queue(function_key);
        let invocation = Invocation {
            correlation_id: correlation_id.clone(),
            request,
        };

        if queue.tx.send(invocation).await.is_err() {
            self.in_flight.remove(&correlation_id);
            return Err(StoreError::QueueClosed(function_key.to_string()));
        }

        debug!(
            correlation_id = %correlation_id,
            function_key = %function_key,
            partition = partition,
            offset = offset,
            "Queued pending request"
        );
        Ok(())
    }

    /// Take the next invocation for `function_key`, waiting until one arrives.
    ///
    /// Cancel-safe: dropping the future never loses an invocation.
    pub async fn dequeue(&self, function_key: &str) -> Result<Invocation, StoreError> {
        let queue = self.queue(function_key);
        let mut rx = queue.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| StoreError::QueueClosed(function_key.to_string()))
    }

    /// Complete the in-flight request for `correlation_id`.
    ///
    /// Returns `false` if the id is unknown (stale or duplicate completion).
    pub fn try_complete(&self, correlation_id: &str, response: InvocationResponse) -> bool {
        let Some((_, in_flight)) = self.in_flight.remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "No in-flight request for correlation id");
            return false;
        };

        info!(
            correlation_id = %correlation_id,
            function_key = %in_flight.function_key,
            partition = in_flight.partition,
            offset = in_flight.offset,
            "Completed pending request"
        );

        // The dispatcher may have gone away; the entry is consumed either way.
        let _ = in_flight.completion.send(response);
        true
    }

    /// Number of requests registered and not yet completed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of invocations waiting in `function_key`'s queue.
    pub fn queued(&self, function_key: &str) -> usize {
        self.queues
            .get(function_key)
            .map(|q| self.capacity - q.tx.capacity())
            .unwrap_or(0)
    }
}
