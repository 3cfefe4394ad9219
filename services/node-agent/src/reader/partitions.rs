//! Per-partition dispatch with ordered acknowledgement.
//!
//! Each assigned partition gets a worker that takes messages in offset
//! order, reserves an [`OffsetManager`] slot, waits for a concurrency permit
//! and runs the handler on its own task. Successful messages are acked;
//! failed ones are not, which pins the partition's commit offset.
//!
//! An offset at or below the last one routed to a partition means the
//! consumer was moved back, typically by a revoke and reassign that
//! happened between two assignment checks. The partition then starts over
//! with a fresh worker and offset manager, and the old ones drain in the
//! background.

use std::collections::HashMap;
use std::sync::Arc;

use mango_offsets::{OffsetError, OffsetManager};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{InboundMessage, MessageHandler};
use crate::error::ErrorKind;

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Handler tasks running at once per partition.
    pub partition_concurrency: usize,
    /// Unacknowledged offsets per partition before the worker waits.
    pub max_outstanding: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            partition_concurrency: 4,
            max_outstanding: 1024,
        }
    }
}

struct PartitionState {
    offsets: Arc<OffsetManager>,
    tx: mpsc::Sender<InboundMessage>,
    worker: JoinHandle<()>,
    last_committed: Option<i64>,
    last_routed: Option<i64>,
}

/// Routes consumed messages to per-partition workers.
pub struct PartitionRouter {
    config: RouterConfig,
    handler: Arc<dyn MessageHandler>,
    partitions: HashMap<i32, PartitionState>,
    shutdown: watch::Receiver<bool>,
}

impl PartitionRouter {
    pub fn new(config: RouterConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config,
            handler,
            partitions: HashMap::new(),
            shutdown: watch::channel(false).1,
        }
    }

    /// Stop draining retired partition state once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn partition(&mut self, partition: i32) -> &mut PartitionState {
        let config = &self.config;
        let handler = &self.handler;
        self.partitions.entry(partition).or_insert_with(|| {
            let offsets = Arc::new(OffsetManager::new(config.max_outstanding.max(1)));
            let (tx, rx) = mpsc::channel(config.partition_concurrency.max(1));
            let worker = tokio::spawn(run_partition(
                partition,
                rx,
                offsets.clone(),
                Arc::new(Semaphore::new(config.partition_concurrency.max(1))),
                handler.clone(),
            ));
            info!(partition = partition, "Started partition worker");
            PartitionState {
                offsets,
                tx,
                worker,
                last_committed: None,
                last_routed: None,
            }
        })
    }

    /// Hand `message` to its partition's worker.
    ///
    /// Waits while the worker's backlog is full.
    pub async fn route(&mut self, message: InboundMessage) {
        let partition = message.partition;
        let offset = message.offset;

        let rewound = self
            .partitions
            .get(&partition)
            .and_then(|state| state.last_routed)
            .filter(|last| offset <= *last);
        if let Some(last) = rewound {
            if let Some(state) = self.partitions.remove(&partition) {
                warn!(
                    partition = partition,
                    offset = offset,
                    last_routed = last,
                    outstanding = state.offsets.outstanding(),
                    "Partition rewound, restarting offset tracking"
                );
                retire(partition, state, self.shutdown.clone());
            }
        }

        let state = self.partition(partition);
        state.last_routed = Some(offset);
        let tx = state.tx.clone();
        if tx.send(message).await.is_err() {
            warn!(partition = partition, "Partition worker stopped, message dropped");
        }
    }

    /// Partitions whose commit offset moved since the last [`Self::mark_committed`].
    pub fn commit_positions(&self) -> Vec<(i32, i64)> {
        let mut positions: Vec<_> = self
            .partitions
            .iter()
            .filter_map(|(partition, state)| {
                let offset = state.offsets.commit_offset()?;
                (state.last_committed != Some(offset)).then_some((*partition, offset))
            })
            .collect();
        positions.sort_unstable();
        positions
    }

    /// Record offsets the broker accepted.
    pub fn mark_committed(&mut self, positions: &[(i32, i64)]) {
        for (partition, offset) in positions {
            if let Some(state) = self.partitions.get_mut(partition) {
                state.last_committed = Some(*offset);
            }
        }
    }

    /// Currently routed partitions.
    pub fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<_> = self.partitions.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Outstanding offsets of `partition`.
    pub fn outstanding(&self, partition: i32) -> Option<usize> {
        self.partitions
            .get(&partition)
            .map(|state| state.offsets.outstanding())
    }

    /// Stop routing `partition`.
    ///
    /// In-flight messages keep running; the returned task finishes once they
    /// are all acknowledged, or on shutdown.
    pub fn revoke(&mut self, partition: i32, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let state = self.partitions.remove(&partition)?;
        info!(
            partition = partition,
            outstanding = state.offsets.outstanding(),
            "Partition revoked"
        );
        Some(retire(partition, state, shutdown))
    }
}

/// Close `state` to new messages and stop its worker once its in-flight
/// messages are acknowledged, or on shutdown.
fn retire(partition: i32, state: PartitionState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let PartitionState {
        offsets, tx, worker, ..
    } = state;
    drop(tx);

    tokio::spawn(async move {
        tokio::select! {
            _ = offsets.reset() => {
                debug!(partition = partition, "Retired partition state drained");
            }
            _ = stopped(&mut shutdown) => {
                debug!(partition = partition, "Shutdown before partition drained");
            }
        }
        offsets.close();
        worker.abort();
    })
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_partition(
    partition: i32,
    mut rx: mpsc::Receiver<InboundMessage>,
    offsets: Arc<OffsetManager>,
    slots: Arc<Semaphore>,
    handler: Arc<dyn MessageHandler>,
) {
    let mut tasks = JoinSet::new();

    while let Some(message) = rx.recv().await {
        let offset = message.offset;
        let ack_id = match offsets.get_ack_id(offset).await {
            Ok(id) => id,
            Err(e @ OffsetError::OutOfOrder { .. }) => {
                error!(
                    partition = partition,
                    offset = offset,
                    kind = %ErrorKind::OrderingViolation,
                    error = %e,
                    "Rejected out-of-order message"
                );
                continue;
            }
            Err(e) => {
                debug!(partition = partition, error = %e, "Offset manager closed");
                break;
            }
        };

        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };

        let offsets = offsets.clone();
        let handler = handler.clone();
        tasks.spawn(async move {
            let _permit = permit;
            match handler.handle(&message).await {
                Ok(()) => {
                    if let Err(e) = offsets.ack(ack_id) {
                        warn!(partition = partition, offset = offset, error = %e, "Failed to ack offset");
                    }
                }
                Err(e) => {
                    error!(
                        partition = partition,
                        offset = offset,
                        kind = %e.kind(),
                        error = %e,
                        "Dispatch failed, offset left unacknowledged"
                    );
                }
            }
        });

        while tasks.try_join_next().is_some() {}
    }

    while tasks.join_next().await.is_some() {}
    debug!(partition = partition, "Partition worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::DispatchError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails offsets in `fail`, succeeds otherwise.
    struct ScriptedHandler {
        fail: HashSet<i64>,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, message: &InboundMessage) -> Result<(), DispatchError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail.contains(&message.offset) {
                Err(DispatchError::MissingFunction)
            } else {
                Ok(())
            }
        }
    }

    /// Blocks every message until released.
    struct GatedHandler {
        gate: Arc<Semaphore>,
        running: AtomicUsize,
        peak: Mutex<usize>,
    }

    #[async_trait]
    impl MessageHandler for GatedHandler {
        async fn handle(&self, _message: &InboundMessage) -> Result<(), DispatchError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(now);
            }
            let _ = self.gate.acquire().await.unwrap();
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(partition: i32, offset: i64) -> InboundMessage {
        InboundMessage {
            partition,
            offset,
            ..Default::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_commit_advances_past_successes() {
        let handler = Arc::new(ScriptedHandler {
            fail: HashSet::new(),
            handled: AtomicUsize::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());

        for offset in [10, 11, 12] {
            router.route(message(0, offset)).await;
        }
        wait_until(|| router.outstanding(0) == Some(0)).await;

        assert_eq!(router.commit_positions(), vec![(0, 13)]);
        router.mark_committed(&[(0, 13)]);
        assert!(router.commit_positions().is_empty());
    }

    #[tokio::test]
    async fn test_failure_pins_commit_offset() {
        let handler = Arc::new(ScriptedHandler {
            fail: HashSet::from([6]),
            handled: AtomicUsize::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());

        for offset in [5, 6, 7] {
            router.route(message(3, offset)).await;
        }
        wait_until(|| handler.handled.load(Ordering::SeqCst) == 3).await;
        wait_until(|| router.outstanding(3) == Some(1)).await;

        assert_eq!(router.commit_positions(), vec![(3, 6)]);
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let handler = Arc::new(ScriptedHandler {
            fail: HashSet::from([1]),
            handled: AtomicUsize::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());

        router.route(message(0, 1)).await;
        router.route(message(1, 1)).await;
        wait_until(|| handler.handled.load(Ordering::SeqCst) == 2).await;
        wait_until(|| router.outstanding(0) == Some(1) && router.outstanding(1) == Some(1)).await;

        assert_eq!(router.partitions(), vec![0, 1]);
        assert_eq!(router.commit_positions(), vec![(0, 1), (1, 1)]);
    }

    #[tokio::test]
    async fn test_redelivered_offsets_restart_partition() {
        let handler = Arc::new(ScriptedHandler {
            fail: HashSet::new(),
            handled: AtomicUsize::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());

        for offset in [5, 6, 7] {
            router.route(message(0, offset)).await;
        }
        wait_until(|| handler.handled.load(Ordering::SeqCst) == 3).await;
        wait_until(|| router.outstanding(0) == Some(0)).await;
        router.mark_committed(&[(0, 8)]);

        // Reassigned and rewound to the last broker commit before ours landed.
        for offset in [6, 7] {
            router.route(message(0, offset)).await;
        }
        wait_until(|| handler.handled.load(Ordering::SeqCst) == 5).await;
        wait_until(|| router.outstanding(0) == Some(0)).await;

        assert_eq!(router.partitions(), vec![0]);
        assert_eq!(router.commit_positions(), vec![(0, 8)]);
    }

    #[tokio::test]
    async fn test_rewind_keeps_in_flight_messages_running() {
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(GatedHandler {
            gate: gate.clone(),
            running: AtomicUsize::new(0),
            peak: Mutex::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());

        router.route(message(1, 20)).await;
        wait_until(|| handler.running.load(Ordering::SeqCst) == 1).await;

        router.route(message(1, 20)).await;
        wait_until(|| handler.running.load(Ordering::SeqCst) == 2).await;
        assert_eq!(router.outstanding(1), Some(1));

        gate.add_permits(2);
        wait_until(|| handler.running.load(Ordering::SeqCst) == 0).await;
        wait_until(|| router.outstanding(1) == Some(0)).await;
        assert_eq!(router.commit_positions(), vec![(1, 21)]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(GatedHandler {
            gate: gate.clone(),
            running: AtomicUsize::new(0),
            peak: Mutex::new(0),
        });
        let config = RouterConfig {
            partition_concurrency: 2,
            max_outstanding: 16,
        };
        let mut router = PartitionRouter::new(config, handler.clone());

        for offset in 0..4 {
            router.route(message(0, offset)).await;
        }
        wait_until(|| handler.running.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.running.load(Ordering::SeqCst), 2);
        assert_eq!(router.commit_positions(), vec![(0, 0)]);

        gate.add_permits(4);
        wait_until(|| router.outstanding(0) == Some(0)).await;
        assert_eq!(*handler.peak.lock().unwrap(), 2);
        assert_eq!(router.commit_positions(), vec![(0, 4)]);
    }

    #[tokio::test]
    async fn test_revoke_waits_for_outstanding() {
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(GatedHandler {
            gate: gate.clone(),
            running: AtomicUsize::new(0),
            peak: Mutex::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        router.route(message(2, 40)).await;
        wait_until(|| handler.running.load(Ordering::SeqCst) == 1).await;

        let drained = router.revoke(2, shutdown_rx).unwrap();
        assert!(router.partitions().is_empty());
        assert!(router.revoke(2, watch::channel(false).1).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drained.is_finished());

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoke_cancelled_by_shutdown() {
        let handler = Arc::new(ScriptedHandler {
            fail: HashSet::from([1]),
            handled: AtomicUsize::new(0),
        });
        let mut router = PartitionRouter::new(RouterConfig::default(), handler.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        router.route(message(0, 1)).await;
        wait_until(|| handler.handled.load(Ordering::SeqCst) == 1).await;

        let drained = router.revoke(0, shutdown_rx).unwrap();
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
    }
}
