//! Periodic snapshot publishing over Zenoh.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use regpoll_common::{Format, KeyExprBuilder, SnapshotKind, encode};

use crate::scheduler::PollScheduler;

/// Publishes device, collector and traffic snapshots.
#[derive(Clone, Debug)]
pub struct SnapshotPublisher {
    session: Arc<zenoh::Session>,
    keys: KeyExprBuilder,
    format: Format,
}

/// Outcome of one publishing round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub success: usize,
    pub failed: usize,
}

impl SnapshotPublisher {
    pub fn new(session: Arc<zenoh::Session>, key_prefix: impl Into<String>, format: Format) -> Self {
        Self {
            session,
            keys: KeyExprBuilder::new(key_prefix),
            format,
        }
    }

    pub fn keys(&self) -> &KeyExprBuilder {
        &self.keys
    }

    /// Serialize `value` and put it on `key`.
    pub async fn publish<T: Serialize>(&self, key: &str, value: &T) -> regpoll_common::Result<()> {
        let payload = encode(value, self.format)?;
        self.session.put(key, payload).await?;
        Ok(())
    }

    /// Publish every snapshot once.
    pub async fn publish_round(&self, scheduler: &PollScheduler) -> PublishStats {
        let mut stats = PublishStats::default();

        let mut record = |key: &str, result: regpoll_common::Result<()>| match result {
            Ok(()) => stats.success += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(key = %key, error = %e, "Failed to publish snapshot");
            }
        };

        for device in scheduler.devices() {
            let key = self.keys.entity(SnapshotKind::Device, &device.id);
            let result = self.publish(&key, &device).await;
            record(&key, result);
        }
        for collector in scheduler.collectors() {
            let key = self.keys.entity(SnapshotKind::Collector, &collector.id);
            let result = self.publish(&key, &collector).await;
            record(&key, result);
        }

        let key = self.keys.traffic();
        let result = self.publish(&key, &scheduler.traffic()).await;
        record(&key, result);

        stats
    }

    /// Publish on a fixed cadence until cancelled.
    pub async fn run(self, scheduler: Arc<PollScheduler>, period: Duration, cancel: CancellationToken) {
        info!(
            "Publishing snapshots under '{}' every {}ms",
            self.keys.prefix(),
            period.as_millis()
        );

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let stats = self.publish_round(&scheduler).await;
            debug!(success = stats.success, failed = stats.failed, "Published snapshots");
        }
    }
}
