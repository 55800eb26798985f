//! Wiring: builds the store, publisher, ingestor, sweeper and consumer from a
//! [`Config`] and runs them together.

use crate::aggregation::{AggregationPolicy, Emitter, FinalizedBatch, Ingestor, Sweeper};
use crate::clock::{system_clock, SharedClock};
use crate::config::{expand_path, Config, PublisherKind};
use crate::consumer::{BatchHandler, Consumer, LoggingHandler};
use crate::gateway::{self, AppState};
use crate::idempotency::{
    IdempotencyGate, IdempotencyLedger, MemoryIdempotencyLedger, SqliteIdempotencyLedger,
};
use crate::observability::Metrics;
use crate::publisher::{BatchPublisher, ChannelPublisher, HttpPublisher};
use crate::retry::Backoff;
use crate::store::{GroupStore, SqliteGroupStore};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Max distinct inbound webhook idempotency keys retained in memory.
pub const INBOUND_IDEMPOTENCY_MAX_KEYS: usize = 10_000;

pub struct Components {
    pub metrics: Metrics,
    pub ingestor: Arc<Ingestor>,
    pub sweeper: Arc<Sweeper>,
    pub consumer: Arc<Consumer>,
    /// Receiving end of the in-process queue; `None` for an external queue.
    pub queue: Option<mpsc::Receiver<FinalizedBatch>>,
    pub inbound: IdempotencyGate,
}

fn seconds(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

impl Components {
    /// Open the SQLite store and ledger named in `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let clock = system_clock();
        let busy_timeout = Duration::from_millis(config.store.busy_timeout_ms);

        let store_path = expand_path(&config.store.path);
        let store = SqliteGroupStore::open_with_clock(&store_path, busy_timeout, clock.clone())
            .with_context(|| format!("Failed to open group store {}", store_path.display()))?;

        let ledger_path = expand_path(&config.idempotency.path);
        let ledger = SqliteIdempotencyLedger::open(
            &ledger_path,
            busy_timeout,
            clock.clone(),
            seconds(config.idempotency.claim_timeout_seconds),
        )
        .with_context(|| format!("Failed to open idempotency ledger {}", ledger_path.display()))?;

        Self::assemble(config, Arc::new(store), Arc::new(ledger), clock)
    }

    /// Assemble around caller-supplied backends.
    pub fn assemble(
        config: &Config,
        store: Arc<dyn GroupStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        clock: SharedClock,
    ) -> Result<Self> {
        let metrics = Metrics::new().context("Failed to register metrics")?;

        let (publisher, queue): (Arc<dyn BatchPublisher>, _) = match config.publisher.kind {
            PublisherKind::Channel => {
                let (publisher, rx) = ChannelPublisher::new(config.publisher.queue_capacity);
                (Arc::new(publisher), Some(rx))
            }
            PublisherKind::Http => {
                let url = config
                    .publisher
                    .url
                    .as_deref()
                    .context("publisher.url is required for the http publisher")?;
                let publisher =
                    HttpPublisher::new(url, Duration::from_secs(config.publisher.timeout_secs))?;
                (Arc::new(publisher), None)
            }
        };

        let policy = AggregationPolicy::new(&config.aggregation);
        let volatile_queue = !publisher.is_durable();
        let emitter = Emitter::new(
            store.clone(),
            publisher,
            config.aggregation.max_items,
            metrics.clone(),
        )
        .with_store_retry(Backoff::from(&config.store.retry))
        .with_publish_retry(Backoff::new(
            config.publisher.max_attempts,
            Duration::from_millis(config.store.retry.base_delay_ms),
            Duration::from_millis(config.store.retry.max_delay_ms),
        ));

        let ingestor = Ingestor::new(
            policy.clone(),
            emitter.clone(),
            config.aggregation.append_max_attempts,
        );
        let sweeper = Sweeper::new(emitter, policy, &config.aggregation);

        let handler: Arc<dyn BatchHandler> = Arc::new(LoggingHandler);
        let mut consumer = Consumer::new(IdempotencyGate::new(ledger), handler, metrics.clone())
            .with_retention(seconds(config.idempotency.retention_seconds))
            .with_store_retry(Backoff::from(&config.store.retry));
        if volatile_queue {
            consumer = consumer.with_outbox(store);
        }

        let inbound = IdempotencyGate::new(Arc::new(MemoryIdempotencyLedger::new(
            clock,
            seconds(config.idempotency.claim_timeout_seconds),
            INBOUND_IDEMPOTENCY_MAX_KEYS,
        )));

        Ok(Self {
            metrics,
            ingestor: Arc::new(ingestor),
            sweeper: Arc::new(sweeper),
            consumer: Arc::new(consumer),
            queue,
            inbound,
        })
    }

    /// Run gateway, sweeper and (for the in-process queue) the consumer until
    /// `cancel` fires.
    pub async fn serve(self, host: &str, port: u16, cancel: CancellationToken) -> Result<()> {
        let sweeper = {
            let sweeper = self.sweeper.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sweeper.run(cancel).await })
        };
        let consumer = self.queue.map(|rx| {
            let consumer = self.consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(rx, cancel).await })
        });

        let state = AppState {
            ingestor: self.ingestor,
            metrics: self.metrics,
            inbound: self.inbound,
        };
        let served = gateway::run_gateway(host, port, state, cancel.clone()).await;

        cancel.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!("Sweeper task ended abnormally: {e}");
        }
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                tracing::warn!("Consumer task ended abnormally: {e}");
            }
        }
        served
    }

    /// One sweep pass, handing any batches it queued in-process to the consumer.
    pub async fn sweep_once(&mut self) -> crate::aggregation::SweepReport {
        let report = self.sweeper.run_once().await;
        if let Some(rx) = self.queue.as_mut() {
            while let Ok(batch) = rx.try_recv() {
                if let Err(e) = self.consumer.consume(&batch).await {
                    tracing::error!("Batch {} not handled: {e:#}", batch.idempotency_key);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::ArrivalEvent;
    use crate::clock::ManualClock;
    use crate::store::MemoryGroupStore;

    fn components(config: &Config, clock: &ManualClock) -> Components {
        components_with_store(config, clock).0
    }

    fn components_with_store(
        config: &Config,
        clock: &ManualClock,
    ) -> (Components, Arc<MemoryGroupStore>) {
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryGroupStore::with_clock(shared.clone()));
        let components = Components::assemble(
            config,
            store.clone(),
            Arc::new(MemoryIdempotencyLedger::new(
                shared.clone(),
                ChronoDuration::seconds(60),
                100,
            )),
            shared,
        )
        .unwrap();
        (components, store)
    }

    #[tokio::test]
    async fn sweep_once_drains_in_process_queue() {
        let clock = ManualClock::at_secs(0);
        let (mut components, store) = components_with_store(&Config::default(), &clock);
        components
            .ingestor
            .ingest(ArrivalEvent::new("+2", "m", clock.now()))
            .await
            .unwrap();

        clock.advance_secs(5);
        let report = components.sweep_once().await;
        assert_eq!(report.finalized, 1);
        assert!(components.queue.as_mut().unwrap().try_recv().is_err());
        assert_eq!(store.outbox_len(), 0);
    }

    #[test]
    fn http_publisher_has_no_local_queue() {
        let mut config = Config::default();
        config.publisher.kind = PublisherKind::Http;
        config.publisher.url = Some("http://127.0.0.1:9/batches".into());
        let components = components(&config, &ManualClock::at_secs(0));
        assert!(components.queue.is_none());
    }

    #[test]
    fn open_creates_sqlite_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.path = dir.path().join("groups.db").to_string_lossy().into_owned();
        config.idempotency.path = dir.path().join("ledger.db").to_string_lossy().into_owned();
        Components::open(&config).unwrap();
        assert!(dir.path().join("groups.db").exists());
        assert!(dir.path().join("ledger.db").exists());
    }
}
