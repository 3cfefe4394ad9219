//! Per-partition offset tracking for concurrently processed messages.
//!
//! Messages of one partition are dispatched concurrently and may complete in
//! any order. The [`OffsetManager`] hands out an [`AckId`] per accepted
//! offset and reports the highest offset that is safe to commit: the
//! smallest offset still unacknowledged, or the last accepted offset plus one
//! when nothing is outstanding. A single stuck message therefore holds the
//! commit cursor of its whole partition, which guarantees redelivery after a
//! restart.
//!
//! The number of unacknowledged offsets is bounded. Once the bound is
//! reached, [`OffsetManager::get_ack_id`] waits for an acknowledgement,
//! backpressuring the consumer.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// Default interval between reset attempts.
pub const DEFAULT_RESET_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Offset tracking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OffsetError {
    /// Offset is not strictly greater than the last accepted offset.
    #[error("offset {offset} must be greater than last accepted offset {last}")]
    OutOfOrder { offset: i64, last: i64 },

    /// Acknowledgement id is unknown or was already acknowledged.
    #[error("unknown ack id: {0}")]
    UnknownAckId(AckId),

    /// The manager was closed while waiting for a free slot.
    #[error("offset manager closed")]
    Closed,
}

/// Opaque acknowledgement handle for one accepted offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckId(u64);

impl std::fmt::Display for AckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct State {
    last_offset: Option<i64>,
    next_id: u64,
    by_id: HashMap<AckId, i64>,
    unacked: BTreeSet<i64>,
}

impl State {
    fn update_last_offset(&mut self, offset: i64) -> Result<(), OffsetError> {
        if let Some(last) = self.last_offset {
            if offset <= last {
                return Err(OffsetError::OutOfOrder { offset, last });
            }
        }
        self.last_offset = Some(offset);
        Ok(())
    }
}

/// Tracks out-of-order acknowledgements for one partition.
#[derive(Debug)]
pub struct OffsetManager {
    max_outstanding: usize,
    reset_check_interval: Duration,
    slots: Semaphore,
    state: Mutex<State>,
}

impl OffsetManager {
    /// Create a manager allowing at most `max_outstanding` unacknowledged
    /// offsets. A bound of zero is raised to one.
    pub fn new(max_outstanding: usize) -> Self {
        Self::with_reset_interval(max_outstanding, DEFAULT_RESET_CHECK_INTERVAL)
    }

    /// Create a manager with a custom reset polling interval.
    pub fn with_reset_interval(max_outstanding: usize, reset_check_interval: Duration) -> Self {
        let max_outstanding = max_outstanding.max(1);
        Self {
            max_outstanding,
            reset_check_interval,
            slots: Semaphore::new(max_outstanding),
            state: Mutex::new(State::default()),
        }
    }

    /// Maximum number of unacknowledged offsets.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Accept `offset` and return the id used to acknowledge it later.
    ///
    /// Waits while `max_outstanding` offsets are unacknowledged. Fails with
    /// [`OffsetError::OutOfOrder`] if `offset` does not exceed the last
    /// accepted offset; the slot is not consumed in that case.
    pub async fn get_ack_id(&self, offset: i64) -> Result<AckId, OffsetError> {
        let permit = self.slots.acquire().await.map_err(|_| OffsetError::Closed)?;

        let mut state = self.lock();
        state.update_last_offset(offset)?;

        let id = AckId(state.next_id);
        state.next_id += 1;
        state.by_id.insert(id, offset);
        state.unacked.insert(offset);

        // Returned to the semaphore by `ack`.
        permit.forget();
        Ok(id)
    }

    /// Acknowledge a previously accepted offset and free its slot.
    pub fn ack(&self, id: AckId) -> Result<(), OffsetError> {
        {
            let mut state = self.lock();
            let offset = state.by_id.remove(&id).ok_or(OffsetError::UnknownAckId(id))?;
            state.unacked.remove(&offset);
        }
        self.slots.add_permits(1);
        Ok(())
    }

    /// Advance the watermark without occupying a slot.
    ///
    /// For consumers that process a partition sequentially.
    pub fn mark_as_acked(&self, offset: i64) -> Result<(), OffsetError> {
        self.lock().update_last_offset(offset)
    }

    /// Offset that can be safely committed, if any.
    pub fn commit_offset(&self) -> Option<i64> {
        let state = self.lock();
        match state.unacked.first() {
            Some(first) => Some(*first),
            None => state.last_offset.map(|last| last + 1),
        }
    }

    /// Number of unacknowledged offsets.
    pub fn outstanding(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Wait until nothing is outstanding, then forget the watermark.
    ///
    /// Used when the partition is revoked. Cancel by dropping the future.
    pub async fn reset(&self) {
        loop {
            if self.try_reset() {
                return;
            }
            debug!(
                outstanding = self.outstanding(),
                "Waiting for outstanding offsets before reset"
            );
            tokio::time::sleep(self.reset_check_interval).await;
        }
    }

    /// Reject every current and future waiter in [`OffsetManager::get_ack_id`].
    pub fn close(&self) {
        self.slots.close();
    }

    fn try_reset(&self) -> bool {
        let mut state = self.lock();
        if !state.unacked.is_empty() {
            return false;
        }
        state.last_offset = None;
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
