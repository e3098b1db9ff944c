use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::manager::NotificationManager;
use crate::model::{MarketSnapshot, TriggerEvent};
use crate::storage::Storage;

/// Passes whose events are waiting for delivery before evaluation blocks.
const DISPATCH_BACKLOG: usize = 64;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub snapshots: u64,
    pub triggered: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Feeds market snapshots through the engine and hands trigger events to
/// the notification manager.
///
/// Evaluation and delivery run on separate tasks so a slow channel never
/// delays the next pass. Events still reach the manager in pass order.
pub struct Pipeline {
    engine: Arc<Engine>,
    manager: Arc<NotificationManager>,
    storage: Option<Arc<dyn Storage>>,
}

impl Pipeline {
    pub fn new(engine: Arc<Engine>, manager: Arc<NotificationManager>) -> Self {
        Self {
            engine,
            manager,
            storage: None,
        }
    }

    /// Persist the counters of conditions that fired.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Run until `snapshots` closes, `cancel` fires or the engine stops.
    /// Returns once every queued event has been dispatched.
    pub async fn run(
        &self,
        mut snapshots: mpsc::Receiver<MarketSnapshot>,
        cancel: CancellationToken,
    ) -> PipelineSummary {
        let (events_tx, events_rx) = mpsc::channel::<Vec<TriggerEvent>>(DISPATCH_BACKLOG);
        let dispatcher = tokio::spawn(dispatch_loop(events_rx, Arc::clone(&self.manager)));

        let mut snapshot_count = 0u64;
        let mut triggered = 0u64;
        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pipeline cancelled");
                    break;
                }
                next = snapshots.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => {
                        debug!("snapshot source closed");
                        break;
                    }
                },
            };
            snapshot_count += 1;

            let events = match self.engine.evaluate_all(&snapshot).await {
                Ok(events) => events,
                Err(report)
                    if matches!(
                        report.current_context(),
                        EngineError::NotRunning | EngineError::Cancelled
                    ) =>
                {
                    info!(reason = %report.current_context(), "engine stopped, pipeline exiting");
                    break;
                }
                Err(report) => {
                    warn!(symbol = %snapshot.symbol, error = ?report, "evaluation pass failed");
                    continue;
                }
            };
            if events.is_empty() {
                continue;
            }
            triggered += events.len() as u64;
            self.persist_conditions(&events).await;

            if events_tx.send(events).await.is_err() {
                warn!("dispatcher exited early");
                break;
            }
        }

        drop(events_tx);
        let (delivered, failed) = match dispatcher.await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "dispatcher task failed");
                (0, 0)
            }
        };

        let summary = PipelineSummary {
            snapshots: snapshot_count,
            triggered,
            delivered,
            failed,
        };
        info!(
            snapshots = summary.snapshots,
            triggered = summary.triggered,
            delivered = summary.delivered,
            failed = summary.failed,
            "pipeline finished"
        );
        summary
    }

    async fn persist_conditions(&self, events: &[TriggerEvent]) {
        let Some(storage) = &self.storage else {
            return;
        };
        for event in events {
            let Some(condition) = self.engine.registry().get(&event.condition_id) else {
                continue;
            };
            if let Err(e) = storage.save_condition(&condition).await {
                warn!(condition_id = %event.condition_id, error = ?e, "failed to persist condition");
            }
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Vec<TriggerEvent>>,
    manager: Arc<NotificationManager>,
) -> (u64, u64) {
    let (mut delivered, mut failed) = (0u64, 0u64);
    while let Some(events) = rx.recv().await {
        let report = manager.dispatch(&events).await;
        delivered += report.successful() as u64;
        failed += report.failed() as u64;
    }
    (delivered, failed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::NotificationChannel;
    use crate::channel::popup::{PopupChannel, PopupConfig};
    use crate::condition::registry::ConditionRegistry;
    use crate::condition::{Condition, ConditionType, Operator};
    use crate::engine::EngineConfig;
    use crate::manager::ChannelRoute;
    use crate::model::ConditionId;
    use crate::storage::sqlite::SqliteStorage;
    use crate::template::TemplateEngine;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<Engine>, Arc<NotificationManager>, Arc<PopupChannel>) {
        let registry = Arc::new(ConditionRegistry::new());
        registry
            .register(
                Condition::new(
                    "BTC above 49k",
                    "BTCUSDT",
                    ConditionType::Price,
                    Operator::GreaterThan,
                    dec!(49000),
                )
                .with_id("btc-49k"),
            )
            .unwrap();
        let engine = Arc::new(Engine::new(registry, EngineConfig::default()));
        engine.start();

        let manager = Arc::new(NotificationManager::new(Arc::new(TemplateEngine::new())));
        let popup = Arc::new(PopupChannel::new("popup", PopupConfig::default()));
        manager
            .add_channel(popup.clone(), ChannelRoute::default())
            .unwrap();
        (engine, manager, popup)
    }

    #[tokio::test]
    async fn snapshots_flow_to_channels_in_order() {
        let (engine, manager, popup) = setup();
        let pipeline = Pipeline::new(engine, manager);

        let (tx, rx) = mpsc::channel(8);
        for price in [dec!(50000), dec!(48000), dec!(51000)] {
            tx.send(MarketSnapshot::with_price("BTCUSDT", price)).await.unwrap();
        }
        tx.send(MarketSnapshot::with_price("ETHUSDT", dec!(60000)))
            .await
            .unwrap();
        drop(tx);

        let summary = pipeline.run(rx, CancellationToken::new()).await;
        assert_eq!(
            summary,
            PipelineSummary {
                snapshots: 4,
                triggered: 2,
                delivered: 2,
                failed: 0,
            }
        );

        let recent = popup.recent(10);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].content.contains("50000"));
        assert!(recent[1].content.contains("51000"));
        assert_eq!(popup.statistics().stats.successful, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_reading() {
        let (engine, manager, _popup) = setup();
        let pipeline = Pipeline::new(engine, manager);
        let (_tx, rx) = mpsc::channel::<MarketSnapshot>(1);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let summary = tokio::time::timeout(Duration::from_secs(1), pipeline.run(rx, cancel))
            .await
            .unwrap();
        canceller.await.unwrap();
        assert_eq!(summary.snapshots, 0);
    }

    #[tokio::test]
    async fn stopped_engine_ends_the_pipeline() {
        let (engine, manager, _popup) = setup();
        engine.stop().await;
        let pipeline = Pipeline::new(engine, manager);

        let (tx, rx) = mpsc::channel(2);
        tx.send(MarketSnapshot::with_price("BTCUSDT", dec!(50000)))
            .await
            .unwrap();
        let summary = pipeline.run(rx, CancellationToken::new()).await;
        assert_eq!(summary.snapshots, 1);
        assert_eq!(summary.triggered, 0);
        drop(tx);
    }

    #[tokio::test]
    async fn triggered_conditions_are_persisted() {
        let (engine, manager, _popup) = setup();
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let pipeline = Pipeline::new(Arc::clone(&engine), manager).with_storage(storage.clone());

        let (tx, rx) = mpsc::channel(2);
        tx.send(MarketSnapshot::with_price("BTCUSDT", dec!(50000)))
            .await
            .unwrap();
        drop(tx);
        pipeline.run(rx, CancellationToken::new()).await;

        let saved = storage.trigger_count(&ConditionId::from("btc-49k")).await.unwrap();
        assert_eq!(saved, Some(1));
    }
}
