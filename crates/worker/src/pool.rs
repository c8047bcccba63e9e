//! Bounded worker pool
//!
//! A fixed number of slots pull deliveries from one bounded channel. When
//! every slot is busy and the channel is full, `submit` waits, which stops
//! the consumer from taking more deliveries off the broker.

use crate::broker::Acknowledger;
use chatrelay_common::metrics::PoolMetrics;
use chatrelay_common::{RelayError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// A delivery waiting for a pool slot
#[derive(Debug)]
pub struct Inbound<A> {
    /// Raw message body
    pub payload: Vec<u8>,

    /// Settles the delivery once processing is done
    pub acker: A,

    /// When the consumer received it
    pub received_at: Instant,
}

impl<A> Inbound<A> {
    pub fn new(payload: Vec<u8>, acker: A) -> Self {
        Self {
            payload,
            acker,
            received_at: Instant::now(),
        }
    }
}

/// Processes one delivery end to end, including settling it
pub trait MessageHandler<A: Acknowledger>: Send + Sync + 'static {
    fn handle(&self, job: Inbound<A>) -> impl Future<Output = ()> + Send;

    /// Settle a delivery whose `handle` panicked. `job` holds the original
    /// body and an unused handle on the same delivery.
    fn recover(&self, job: Inbound<A>) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = job.acker.reject().await {
                warn!("Failed to reject delivery: {}", e);
            }
        }
    }
}

/// Slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting for a message
    Idle,

    /// Inside generation and publish
    Processing,
}

/// Pool of slots sharing one bounded channel
pub struct WorkerPool<A> {
    sender: mpsc::Sender<Inbound<A>>,
    slots: Vec<JoinHandle<()>>,
    busy: Arc<Vec<AtomicBool>>,
    capacity: usize,
    metrics: PoolMetrics,
}

impl<A: Acknowledger + Clone> WorkerPool<A> {
    /// Spawn `concurrency` slots over a channel holding `capacity` deliveries
    pub fn spawn<H>(handler: Arc<H>, concurrency: usize, capacity: usize, metrics: PoolMetrics) -> Self
    where
        H: MessageHandler<A>,
    {
        let concurrency = concurrency.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let busy: Arc<Vec<AtomicBool>> =
            Arc::new((0..concurrency).map(|_| AtomicBool::new(false)).collect());

        let slots = (0..concurrency)
            .map(|slot| {
                tokio::spawn(run_slot(
                    slot,
                    handler.clone(),
                    receiver.clone(),
                    busy.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        info!(concurrency, capacity, "Worker pool started");

        Self {
            sender,
            slots,
            busy,
            capacity,
            metrics,
        }
    }

    /// Queue a delivery, waiting for room if the channel is full
    pub async fn submit(&self, job: Inbound<A>) -> Result<()> {
        // Counted before the send so a slot never decrements first
        self.metrics.queue_depth.inc();
        if self.sender.send(job).await.is_err() {
            self.metrics.queue_depth.dec();
            return Err(RelayError::internal("worker pool is shut down"));
        }
        Ok(())
    }

    /// Queue a delivery without waiting
    ///
    /// Returns error if the channel is full (backpressure).
    pub fn try_submit(&self, job: Inbound<A>) -> Result<()> {
        self.metrics.queue_depth.inc();
        let result = self.sender.try_send(job);
        if result.is_err() {
            self.metrics.queue_depth.dec();
        }

        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::queue_full(format!(
                "worker pool holds {} pending deliveries",
                self.capacity
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RelayError::internal("worker pool is shut down"))
            }
        }
    }

    /// Deliveries waiting for a slot
    pub fn queue_depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    /// Current state of every slot
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.busy
            .iter()
            .map(|busy| {
                if busy.load(Ordering::Acquire) {
                    SlotState::Processing
                } else {
                    SlotState::Idle
                }
            })
            .collect()
    }

    /// Stop accepting deliveries and wait for queued and in-flight ones to finish
    pub async fn shutdown(self) {
        let WorkerPool { sender, slots, .. } = self;
        drop(sender);

        for (slot, handle) in slots.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(slot, "Pool slot terminated abnormally: {}", e);
            }
        }
        info!("Worker pool drained");
    }
}

async fn run_slot<A, H>(
    slot: usize,
    handler: Arc<H>,
    receiver: Arc<Mutex<mpsc::Receiver<Inbound<A>>>>,
    busy: Arc<Vec<AtomicBool>>,
    metrics: PoolMetrics,
) where
    A: Acknowledger + Clone,
    H: MessageHandler<A>,
{
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            break;
        };

        metrics.queue_depth.dec();
        metrics
            .queue_time
            .observe(job.received_at.elapsed().as_secs_f64());

        busy[slot].store(true, Ordering::Release);
        metrics.in_flight.inc();
        trace!(slot, state = ?SlotState::Processing, "Slot picked up delivery");

        // Each delivery runs on its own task so a panicking handler
        // cannot take the slot down with it
        let recovery = Inbound {
            payload: job.payload.clone(),
            acker: job.acker.clone(),
            received_at: job.received_at,
        };
        let task = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle(job).await }
        });
        if let Err(e) = task.await {
            metrics.handler_panics.inc();
            error!(slot, "Delivery handler aborted: {}", e);
            handler.recover(recovery).await;
        }

        metrics.in_flight.dec();
        busy[slot].store(false, Ordering::Release);
        trace!(slot, state = ?SlotState::Idle, "Slot finished delivery");
    }

    debug!(slot, "Pool slot stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chatrelay_common::MetricsRegistry;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Acker recording how each delivery was settled
    #[derive(Debug, Clone, Default)]
    pub struct RecordingAcker {
        pub id: usize,
        pub log: Arc<SyncMutex<Vec<(usize, &'static str)>>>,
    }

    impl RecordingAcker {
        pub fn with_id(&self, id: usize) -> Self {
            Self {
                id,
                log: self.log.clone(),
            }
        }

        pub fn events(&self) -> Vec<(usize, &'static str)> {
            self.log.lock().clone()
        }
    }

    impl Acknowledger for RecordingAcker {
        async fn ack(self) -> Result<()> {
            self.log.lock().push((self.id, "ack"));
            Ok(())
        }

        async fn reject(self) -> Result<()> {
            self.log.lock().push((self.id, "reject"));
            Ok(())
        }
    }

    struct CountingHandler {
        handled: AtomicUsize,
    }

    impl MessageHandler<RecordingAcker> for CountingHandler {
        async fn handle(&self, job: Inbound<RecordingAcker>) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.handled.fetch_add(1, Ordering::SeqCst);
            job.acker.ack().await.unwrap();
        }
    }

    /// Blocks every delivery until released
    struct GatedHandler {
        gate: Arc<Notify>,
    }

    impl MessageHandler<RecordingAcker> for GatedHandler {
        async fn handle(&self, job: Inbound<RecordingAcker>) {
            self.gate.notified().await;
            job.acker.ack().await.unwrap();
        }
    }

    /// Panics on an empty payload, acks everything else
    struct PanickyHandler;

    impl MessageHandler<RecordingAcker> for PanickyHandler {
        async fn handle(&self, job: Inbound<RecordingAcker>) {
            if job.payload.is_empty() {
                panic!("handler fault");
            }
            job.acker.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pool_processes_all_jobs() {
        let metrics = MetricsRegistry::new();
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(handler.clone(), 3, 4, metrics.pool.clone());
        let acker = RecordingAcker::default();

        for i in 0..10 {
            pool.submit(Inbound::new(vec![i as u8], acker.with_id(i)))
                .await
                .unwrap();
        }
        pool.shutdown().await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 10);
        let mut ids: Vec<usize> = acker.events().into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert_eq!(metrics.pool.queue_depth.get(), 0);
        assert_eq!(metrics.pool.in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_pool_backpressure() {
        let metrics = MetricsRegistry::new();
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(GatedHandler { gate: gate.clone() });
        let pool = WorkerPool::spawn(handler, 1, 2, metrics.pool.clone());
        let acker = RecordingAcker::default();

        // First delivery occupies the only slot
        pool.try_submit(Inbound::new(vec![], acker.with_id(0))).unwrap();
        for _ in 0..100 {
            if pool.slot_states() == vec![SlotState::Processing] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(pool.slot_states(), vec![SlotState::Processing]);

        // Two more fill the channel
        pool.try_submit(Inbound::new(vec![], acker.with_id(1))).unwrap();
        pool.try_submit(Inbound::new(vec![], acker.with_id(2))).unwrap();
        assert_eq!(pool.queue_depth(), 2);

        let err = pool
            .try_submit(Inbound::new(vec![], acker.with_id(3)))
            .unwrap_err();
        assert!(matches!(err, RelayError::QueueFull(_)));

        for _ in 0..3 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;
        assert_eq!(acker.events().len(), 3);
    }

    #[tokio::test]
    async fn test_pool_survives_handler_panic() {
        let metrics = MetricsRegistry::new();
        let pool = WorkerPool::spawn(Arc::new(PanickyHandler), 1, 4, metrics.pool.clone());
        let acker = RecordingAcker::default();

        pool.submit(Inbound::new(vec![], acker.with_id(0))).await.unwrap();
        pool.submit(Inbound::new(vec![1], acker.with_id(1))).await.unwrap();
        pool.submit(Inbound::new(vec![2], acker.with_id(2))).await.unwrap();

        for _ in 0..100 {
            if acker.events().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(acker.events(), vec![(0, "reject"), (1, "ack"), (2, "ack")]);

        // Still accepting work after the panic
        pool.submit(Inbound::new(vec![3], acker.with_id(3))).await.unwrap();
        pool.shutdown().await;

        assert_eq!(acker.events().len(), 4);
        assert_eq!(metrics.pool.handler_panics.get(), 1);
        assert_eq!(metrics.pool.in_flight.get(), 0);
        assert_eq!(metrics.pool.queue_depth.get(), 0);
    }

    #[tokio::test]
    async fn test_queue_depth_gauge_never_negative() {
        let metrics = MetricsRegistry::new();
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(handler, 4, 1, metrics.pool.clone());
        let acker = RecordingAcker::default();

        for i in 0..50 {
            pool.submit(Inbound::new(vec![], acker.with_id(i))).await.unwrap();
            assert!(metrics.pool.queue_depth.get() >= 0);
        }
        pool.shutdown().await;
        assert_eq!(metrics.pool.queue_depth.get(), 0);
    }

    #[tokio::test]
    async fn test_rejected_submit_leaves_gauge_unchanged() {
        let metrics = MetricsRegistry::new();
        let gate = Arc::new(Notify::new());
        let pool = WorkerPool::spawn(
            Arc::new(GatedHandler { gate: gate.clone() }),
            1,
            1,
            metrics.pool.clone(),
        );
        let acker = RecordingAcker::default();

        pool.try_submit(Inbound::new(vec![], acker.with_id(0))).unwrap();
        for _ in 0..100 {
            if pool.slot_states() == vec![SlotState::Processing] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        pool.try_submit(Inbound::new(vec![], acker.with_id(1))).unwrap();
        assert_eq!(metrics.pool.queue_depth.get(), 1);

        assert!(pool.try_submit(Inbound::new(vec![], acker.with_id(2))).is_err());
        assert_eq!(metrics.pool.queue_depth.get(), 1);

        for _ in 0..2 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;
        assert_eq!(metrics.pool.queue_depth.get(), 0);
    }

    #[tokio::test]
    async fn test_pool_idle_after_drain() {
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(handler.clone(), 2, 1, MetricsRegistry::new().pool);
        pool.submit(Inbound::new(vec![], RecordingAcker::default()))
            .await
            .unwrap();

        for _ in 0..100 {
            let idle = pool.slot_states().iter().all(|s| *s == SlotState::Idle);
            if handler.handled.load(Ordering::SeqCst) == 1 && idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pool.slot_states(), vec![SlotState::Idle, SlotState::Idle]);
        pool.shutdown().await;
    }
}
