//! Partition-ordered dispatch, independent of the broker client.
//!
//! One dispatcher task reads from a [`MessageSource`] and hands each message
//! to worker `partition % concurrency` over a bounded channel. A partition
//! therefore always lands on the same worker and is handled in offset order,
//! while distinct partitions run concurrently.
//!
//! A worker redelivers a message whose enqueue or commit failed, with
//! exponential backoff and a heartbeat between tries. Nothing is committed
//! for it until a delivery succeeds. Poison messages, unknown topics and an
//! exhausted retry budget stop the dispatcher.

use async_trait::async_trait;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use docflow_core::{KafkaConfig, MAX_KAFKA_CONCURRENCY};

use crate::error::IngestError;
use crate::handler::{BrokerSession, InboundMessage, MessageRouter};

const PARTITION_QUEUE_DEPTH: usize = 64;

/// Where the dispatcher pulls messages from.
#[async_trait]
pub trait MessageSource: Send {
    /// The next message. `None` closes the source; an `Err` is a receive
    /// error that consumption survives.
    async fn next_message(&mut self) -> Option<anyhow::Result<InboundMessage>>;
}

#[async_trait]
impl MessageSource for mpsc::Receiver<InboundMessage> {
    async fn next_message(&mut self) -> Option<anyhow::Result<InboundMessage>> {
        self.recv().await.map(Ok)
    }
}

/// Redelivery policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            retries: config.retries,
            initial_backoff: Duration::from_millis(config.retry_initial_ms),
            max_backoff: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Delay before retry `retry` (1-based): `initial * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct PartitionDispatcher {
    router: Arc<MessageRouter>,
    session: Arc<dyn BrokerSession>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl PartitionDispatcher {
    pub fn new(
        router: Arc<MessageRouter>,
        session: Arc<dyn BrokerSession>,
        concurrency: usize,
    ) -> Self {
        Self {
            router,
            session,
            concurrency: concurrency.clamp(1, MAX_KAFKA_CONCURRENCY),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Index of the worker that owns `partition`.
    pub fn worker_for(&self, partition: i32) -> usize {
        // concurrency is bounded by MAX_KAFKA_CONCURRENCY
        let workers = i32::try_from(self.concurrency).unwrap_or(i32::MAX);
        usize::try_from(partition.rem_euclid(workers)).unwrap_or_default()
    }

    /// Dispatch until `shutdown` flips to true, the source closes, or a
    /// worker hits a fatal error. Routed messages finish before this returns.
    pub async fn run<S: MessageSource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<IngestError>(self.concurrency);

        let mut workers = JoinSet::new();
        let mut senders = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let (tx, mut rx) = mpsc::channel::<InboundMessage>(PARTITION_QUEUE_DEPTH);
            senders.push(tx);

            let router = self.router.clone();
            let session = self.session.clone();
            let retry = self.retry;
            let fatal_tx = fatal_tx.clone();
            workers.spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = deliver(&router, session.as_ref(), retry, &msg).await {
                        tracing::error!(
                            worker_id = worker_id,
                            topic = %msg.topic,
                            partition = msg.partition,
                            offset = msg.offset,
                            error = %e,
                            "Partition worker stopped"
                        );
                        let _ = fatal_tx.send(e).await;
                        return;
                    }
                }
            });
        }
        drop(fatal_tx);

        let outcome = loop {
            if *shutdown.borrow_and_update() {
                tracing::info!("Dispatcher stopping");
                break Ok(());
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::info!("Shutdown handle dropped, dispatcher stopping");
                        break Ok(());
                    }
                }
                Some(err) = fatal_rx.recv() => break Err(err),
                received = source.next_message() => {
                    let msg = match received {
                        None => {
                            tracing::info!("Message source closed");
                            break Ok(());
                        }
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Receive error");
                            continue;
                        }
                    };
                    let worker_id = self.worker_for(msg.partition);

                    if senders[worker_id].send(msg).await.is_err() {
                        // The worker is gone; its error is waiting in `fatal_rx`.
                        break Err(fatal_rx
                            .recv()
                            .await
                            .unwrap_or(IngestError::WorkerStopped(worker_id)));
                    }
                }
            }
        };

        drop(senders);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Partition worker panicked");
            }
        }

        // A worker may have failed while draining.
        match outcome {
            Ok(()) => match fatal_rx.try_recv() {
                Ok(err) => Err(err),
                Err(_) => Ok(()),
            },
            Err(err) => Err(err),
        }
    }
}

/// Route one message, redelivering it while the failure is transient and
/// the retry budget lasts.
async fn deliver(
    router: &MessageRouter,
    session: &dyn BrokerSession,
    retry: RetryPolicy,
    msg: &InboundMessage,
) -> Result<(), IngestError> {
    let mut retries = 0;
    loop {
        match router.dispatch(msg, session).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && retries < retry.retries => {
                retries += 1;
                let delay = retry.backoff(retries);
                tracing::warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    cause = ?e.source().map(ToString::to_string),
                    retry = retries,
                    max_retries = retry.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Message delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;

                if let Err(e) = session.heartbeat().await {
                    tracing::warn!(error = %e, "Heartbeat between retries failed");
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TopicHandler;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    const TOPIC: &str = "document.uploaded";

    #[derive(Default)]
    struct RecordingSession {
        heartbeats: AtomicUsize,
        commits: Mutex<Vec<(i32, i64)>>,
    }

    #[async_trait]
    impl BrokerSession for RecordingSession {
        async fn heartbeat(&self) -> anyhow::Result<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn commit(&self, _topic: &str, partition: i32, next_offset: i64) -> anyhow::Result<()> {
            self.commits.lock().unwrap().push((partition, next_offset));
            Ok(())
        }
    }

    /// Commits every message, optionally after waiting on a gate or failing
    /// the first few tries with an enqueue error.
    #[derive(Default)]
    struct StubHandler {
        gate: Option<Arc<Semaphore>>,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        slow_even_offsets: bool,
    }

    #[async_trait]
    impl TopicHandler for StubHandler {
        async fn handle(
            &self,
            msg: &InboundMessage,
            session: &dyn BrokerSession,
        ) -> Result<(), IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            if self.slow_even_offsets && msg.offset % 2 == 0 {
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(IngestError::Enqueue {
                    topic: msg.topic.clone(),
                    partition: msg.partition,
                    offset: msg.offset,
                    source: anyhow::anyhow!("pool timed out"),
                });
            }
            session
                .commit(&msg.topic, msg.partition, msg.offset + 1)
                .await
                .map_err(|source| IngestError::Commit {
                    topic: msg.topic.clone(),
                    partition: msg.partition,
                    next_offset: msg.offset + 1,
                    source,
                })
        }
    }

    fn message(topic: &str, partition: i32, offset: i64) -> InboundMessage {
        InboundMessage {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: Some(b"{}".to_vec()),
        }
    }

    fn fast_retry(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn dispatcher(
        handler: Arc<StubHandler>,
        session: Arc<RecordingSession>,
        concurrency: usize,
    ) -> PartitionDispatcher {
        let router = MessageRouter::new().register(TOPIC, handler);
        PartitionDispatcher::new(Arc::new(router), session, concurrency).with_retry(fast_retry(3))
    }

    #[test]
    fn partitions_map_to_stable_workers() {
        let d = dispatcher(Arc::default(), Arc::default(), 3);
        assert_eq!(d.worker_for(0), 0);
        assert_eq!(d.worker_for(4), 1);
        assert_eq!(d.worker_for(5), 2);
        assert_eq!(d.worker_for(-1), 2);
        assert_eq!(d.worker_for(i32::MAX), (i32::MAX % 3) as usize);
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(dispatcher(Arc::default(), Arc::default(), 0).concurrency(), 1);
        assert_eq!(
            dispatcher(Arc::default(), Arc::default(), usize::MAX).concurrency(),
            MAX_KAFKA_CONCURRENCY
        );
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            retries: 10,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(300));
        assert_eq!(policy.backoff(2), Duration::from_millis(600));
        assert_eq!(policy.backoff(3), Duration::from_millis(1200));
        assert_eq!(policy.backoff(4), Duration::from_secs(2));
        assert_eq!(policy.backoff(60), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn each_partition_is_committed_in_offset_order() {
        let handler = Arc::new(StubHandler {
            slow_even_offsets: true,
            ..Default::default()
        });
        let session = Arc::new(RecordingSession::default());
        let d = dispatcher(handler, session.clone(), 2);

        let (tx, rx) = mpsc::channel(64);
        for offset in 0..6 {
            for partition in 0..4 {
                tx.send(message(TOPIC, partition, offset)).await.unwrap();
            }
        }
        drop(tx);
        let (_stop, shutdown) = watch::channel(false);

        d.run(rx, shutdown).await.unwrap();

        let commits = session.commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 24);
        let mut per_partition: HashMap<i32, Vec<i64>> = HashMap::new();
        for (partition, next) in commits {
            per_partition.entry(partition).or_default().push(next);
        }
        for partition in 0..4 {
            assert_eq!(per_partition[&partition], vec![1, 2, 3, 4, 5, 6]);
        }
    }

    #[tokio::test]
    async fn shutdown_finishes_routed_messages() {
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(StubHandler {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let session = Arc::new(RecordingSession::default());
        let d = dispatcher(handler.clone(), session.clone(), 1);

        let (tx, rx) = mpsc::channel(8);
        for offset in 0..3 {
            tx.send(message(TOPIC, 0, offset)).await.unwrap();
        }
        let (stop, shutdown) = watch::channel(false);
        let run = tokio::spawn(async move { d.run(rx, shutdown).await });

        // Wait until the dispatcher has routed everything to the worker.
        for _ in 0..200 {
            if tx.capacity() == tx.max_capacity() && handler.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tx.capacity(), tx.max_capacity());

        stop.send(true).unwrap();
        gate.add_permits(1);
        run.await.unwrap().unwrap();

        assert_eq!(
            session.commits.lock().unwrap().clone(),
            vec![(0, 1), (0, 2), (0, 3)]
        );
    }

    #[tokio::test]
    async fn fatal_error_stops_the_dispatcher() {
        let handler = Arc::new(StubHandler::default());
        let session = Arc::new(RecordingSession::default());
        let d = dispatcher(handler.clone(), session.clone(), 1);

        let (tx, rx) = mpsc::channel(8);
        tx.send(message(TOPIC, 0, 0)).await.unwrap();
        tx.send(message("document.deleted", 0, 1)).await.unwrap();
        tx.send(message(TOPIC, 0, 2)).await.unwrap();
        let (_stop, shutdown) = watch::channel(false);

        let err = d.run(rx, shutdown).await.unwrap_err();

        assert!(matches!(err, IngestError::UnhandledTopic { offset: 1, .. }));
        assert_eq!(session.commits.lock().unwrap().clone(), vec![(0, 1)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered_then_committed() {
        let handler = Arc::new(StubHandler {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let session = Arc::new(RecordingSession::default());
        let d = dispatcher(handler.clone(), session.clone(), 1);

        let (tx, rx) = mpsc::channel(8);
        tx.send(message(TOPIC, 3, 10)).await.unwrap();
        drop(tx);
        let (_stop, shutdown) = watch::channel(false);

        d.run(rx, shutdown).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(session.heartbeats.load(Ordering::SeqCst), 2);
        assert_eq!(session.commits.lock().unwrap().clone(), vec![(3, 11)]);
    }

    #[tokio::test]
    async fn exhausted_retries_are_fatal_without_commit() {
        let handler = Arc::new(StubHandler {
            failures_left: AtomicUsize::new(usize::MAX),
            ..Default::default()
        });
        let session = Arc::new(RecordingSession::default());
        let d = dispatcher(handler.clone(), session.clone(), 1);

        let (tx, rx) = mpsc::channel(8);
        tx.send(message(TOPIC, 0, 4)).await.unwrap();
        let (_stop, shutdown) = watch::channel(false);

        let err = d.run(rx, shutdown).await.unwrap_err();

        assert!(matches!(err, IngestError::Enqueue { offset: 4, .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert!(session.commits.lock().unwrap().is_empty());
        drop(tx);
    }
}
