use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use error_stack::{Report, bail};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::condition::evaluator::{ConditionEvaluator, DEFAULT_HISTORY_LIMIT};
use crate::condition::registry::{ConditionRegistry, PassItem, PassOutcome};
use crate::config::GeneralConfig;
use crate::error::EngineError;
use crate::model::{ConditionId, EvaluationContext, EvaluationStrategy, MarketSnapshot, TriggerEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub strategy: EvaluationStrategy,
    /// Pull interval; when set, each evaluated condition gets a
    /// `next_evaluation` of pass time plus this interval.
    pub evaluation_interval: Option<Duration>,
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: EvaluationStrategy::Sequential,
            evaluation_interval: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Values are validated by `config::load`; unknown strategies fall back
    /// to sequential.
    pub fn from_general(general: &GeneralConfig) -> Self {
        Self {
            strategy: EvaluationStrategy::from_str(&general.evaluation_strategy).unwrap_or_default(),
            evaluation_interval: general.evaluation_interval_secs.map(Duration::from_secs),
            history_limit: general.history_limit,
        }
    }
}

struct Lifecycle {
    running: bool,
    cancel: CancellationToken,
}

/// Drives evaluation passes over the conditions of a [`ConditionRegistry`].
///
/// Passes never overlap: concurrent `evaluate_all` calls queue on a FIFO
/// lock and run one after another in arrival order. `stop` cancels the pass
/// in flight (its conditions keep the state they had before it started),
/// fails queued passes with [`EngineError::Cancelled`] and returns once the
/// lock is free.
pub struct Engine {
    registry: Arc<ConditionRegistry>,
    evaluator: ConditionEvaluator,
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(registry: Arc<ConditionRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            evaluator: ConditionEvaluator::new(config.history_limit),
            config,
            lifecycle: Mutex::new(Lifecycle {
                running: false,
                cancel: CancellationToken::new(),
            }),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConditionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if lifecycle.running {
            return;
        }
        lifecycle.running = true;
        lifecycle.cancel = CancellationToken::new();
        info!(strategy = %self.config.strategy, conditions = self.registry.len(), "evaluation engine started");
    }

    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if !lifecycle.running {
                return;
            }
            lifecycle.running = false;
            lifecycle.cancel.cancel();
        }
        // Wait for the pass in flight to observe the cancellation.
        let _drained = self.pass_lock.lock().await;
        info!("evaluation engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
    }

    /// Evaluate every active condition for `snapshot.symbol` and return the
    /// trigger events of the satisfied ones, in registration order.
    pub async fn evaluate_all(
        &self,
        snapshot: &MarketSnapshot,
    ) -> Result<Vec<TriggerEvent>, Report<EngineError>> {
        let cancel = {
            let lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if !lifecycle.running {
                bail!(EngineError::NotRunning);
            }
            lifecycle.cancel.clone()
        };

        let _pass = self.pass_lock.lock().await;
        if cancel.is_cancelled() {
            bail!(EngineError::Cancelled);
        }

        let started = Instant::now();
        let context = EvaluationContext::new(self.config.strategy);
        let items = self.registry.begin_pass(&snapshot.symbol);
        if items.is_empty() {
            debug!(symbol = %snapshot.symbol, "no active conditions for symbol");
            return Ok(Vec::new());
        }
        let ids: Vec<ConditionId> = items.iter().map(|i| i.condition.id().clone()).collect();

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.registry.abort_pass(&ids);
                warn!(evaluation_id = %context.evaluation_id, symbol = %snapshot.symbol, "evaluation pass cancelled");
                bail!(EngineError::Cancelled);
            }
            outcomes = self.run_pass(items, snapshot, &context) => outcomes,
        };

        let errors = outcomes
            .iter()
            .filter(|o| matches!(o, PassOutcome::Failed { .. }))
            .count();
        let now = Utc::now();
        let next_evaluation = self
            .config
            .evaluation_interval
            .and_then(|interval| chrono::Duration::from_std(interval).ok())
            .map(|interval| now + interval);
        let committed = self.registry.commit_pass(outcomes, now, next_evaluation);
        let evaluated = committed.len();

        let events: Vec<TriggerEvent> = committed
            .into_iter()
            .filter_map(|(condition, result)| TriggerEvent::from_condition(&condition, result, &context))
            .collect();

        info!(
            evaluation_id = %context.evaluation_id,
            symbol = %snapshot.symbol,
            strategy = %context.strategy,
            evaluated,
            triggered = events.len(),
            errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "evaluation pass complete"
        );
        Ok(events)
    }

    async fn run_pass(
        &self,
        items: Vec<PassItem>,
        snapshot: &MarketSnapshot,
        context: &EvaluationContext,
    ) -> Vec<PassOutcome> {
        match context.strategy {
            EvaluationStrategy::Sequential => {
                let mut outcomes = Vec::with_capacity(items.len());
                for item in items {
                    outcomes.push(evaluate_item(&self.evaluator, item, snapshot, context));
                    // Lets `stop` interrupt long passes between conditions.
                    tokio::task::yield_now().await;
                }
                outcomes
            }
            EvaluationStrategy::Parallel => {
                let ids: Vec<ConditionId> = items.iter().map(|i| i.condition.id().clone()).collect();
                let mut tasks = JoinSet::new();
                for (index, item) in items.into_iter().enumerate() {
                    let evaluator = self.evaluator.clone();
                    let snapshot = snapshot.clone();
                    let context = context.clone();
                    tasks.spawn(async move {
                        (index, evaluate_item(&evaluator, item, &snapshot, &context))
                    });
                }

                let mut slots: Vec<Option<PassOutcome>> = ids.iter().map(|_| None).collect();
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((index, outcome)) => slots[index] = Some(outcome),
                        Err(e) => warn!(error = %e, "evaluation task failed"),
                    }
                }
                slots
                    .into_iter()
                    .zip(ids)
                    .map(|(slot, id)| {
                        slot.unwrap_or_else(|| PassOutcome::Failed {
                            id,
                            error: "evaluation task panicked".into(),
                        })
                    })
                    .collect()
            }
        }
    }
}

fn evaluate_item(
    evaluator: &ConditionEvaluator,
    item: PassItem,
    snapshot: &MarketSnapshot,
    context: &EvaluationContext,
) -> PassOutcome {
    let condition = &item.condition;
    match evaluator.evaluate(condition, &item.state, snapshot, context) {
        Ok(evaluation) => {
            debug!(
                condition_id = %condition.id(),
                satisfied = evaluation.result.satisfied,
                details = %evaluation.result.details,
                "condition evaluated"
            );
            PassOutcome::Evaluated(evaluation)
        }
        Err(report) => {
            warn!(condition_id = %condition.id(), error = ?report, "condition evaluation failed");
            PassOutcome::Failed {
                id: condition.id().clone(),
                error: report.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, ConditionStatus, ConditionType, MarketMetric, Operator};
    use futures::future::join_all;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn price_condition(id: &str, op: Operator, threshold: Decimal) -> Condition {
        Condition::new(id, "BTCUSDT", ConditionType::Price, op, threshold).with_id(id)
    }

    fn engine_with(conditions: Vec<Condition>, strategy: EvaluationStrategy) -> Engine {
        let registry = Arc::new(ConditionRegistry::new());
        for condition in conditions {
            registry.register(condition).unwrap();
        }
        let engine = Engine::new(
            registry,
            EngineConfig {
                strategy,
                ..EngineConfig::default()
            },
        );
        engine.start();
        engine
    }

    fn snapshot(price: Decimal) -> MarketSnapshot {
        MarketSnapshot::with_price("BTCUSDT", price)
    }

    fn status(engine: &Engine, id: &str) -> ConditionStatus {
        engine.registry().get(&ConditionId::from(id)).unwrap().status
    }

    #[tokio::test]
    async fn stopped_engine_rejects_passes() {
        let engine = Engine::new(Arc::new(ConditionRegistry::new()), EngineConfig::default());
        let err = engine.evaluate_all(&snapshot(dec!(1))).await.unwrap_err();
        assert_eq!(err.current_context(), &EngineError::NotRunning);

        engine.start();
        assert!(engine.evaluate_all(&snapshot(dec!(1))).await.is_ok());
        engine.stop().await;
        assert!(!engine.is_running());
        let err = engine.evaluate_all(&snapshot(dec!(1))).await.unwrap_err();
        assert_eq!(err.current_context(), &EngineError::NotRunning);

        engine.start();
        assert!(engine.evaluate_all(&snapshot(dec!(1))).await.is_ok());
    }

    #[tokio::test]
    async fn btc_price_scenario() {
        let engine = engine_with(
            vec![price_condition("btc-49k", Operator::GreaterThan, dec!(49000))],
            EvaluationStrategy::Sequential,
        );

        let events = engine.evaluate_all(&snapshot(dec!(50000))).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].condition_id.as_str(), "btc-49k");
        assert!(events[0].result.satisfied);
        assert_eq!(events[0].result.value, dec!(50000));
        assert_eq!(status(&engine, "btc-49k"), ConditionStatus::Triggered);

        let events = engine.evaluate_all(&snapshot(dec!(48000))).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(status(&engine, "btc-49k"), ConditionStatus::Idle);

        let condition = engine.registry().get(&ConditionId::from("btc-49k")).unwrap();
        assert_eq!(condition.trigger_count, 1);
        assert_eq!(condition.evaluation_count, 2);
        assert_eq!(condition.success_rate(), 50.0);
        assert!(condition.last_triggered.is_some());
    }

    #[tokio::test]
    async fn greater_than_emits_iff_value_exceeds_threshold() {
        let thresholds = [dec!(0.1), dec!(100), dec!(49999.99), dec!(50000)];
        let prices = [dec!(0.1), dec!(0.11), dec!(99.999), dec!(100), dec!(50000), dec!(50000.01)];
        let conditions = thresholds
            .iter()
            .enumerate()
            .map(|(i, t)| price_condition(&format!("gt-{i}"), Operator::GreaterThan, *t))
            .collect();
        let engine = engine_with(conditions, EvaluationStrategy::Parallel);

        for price in prices {
            let events = engine.evaluate_all(&snapshot(price)).await.unwrap();
            let fired: Vec<&str> = events.iter().map(|e| e.condition_id.as_str()).collect();
            let expected: Vec<String> = thresholds
                .iter()
                .enumerate()
                .filter(|(_, t)| price > **t)
                .map(|(i, _)| format!("gt-{i}"))
                .collect();
            assert_eq!(fired, expected, "price {price}");
        }
    }

    #[tokio::test]
    async fn disabled_conditions_are_skipped_until_reactivated() {
        let engine = engine_with(
            vec![price_condition("c1", Operator::GreaterThan, dec!(1))],
            EvaluationStrategy::Sequential,
        );
        let id = ConditionId::from("c1");
        engine.registry().set_active(&id, false).unwrap();

        for _ in 0..3 {
            let events = engine.evaluate_all(&snapshot(dec!(10))).await.unwrap();
            assert!(events.iter().all(|e| e.condition_id != id));
        }
        let condition = engine.registry().get(&id).unwrap();
        assert_eq!(condition.status, ConditionStatus::Disabled);
        assert_eq!(condition.evaluation_count, 0);

        engine.registry().set_active(&id, true).unwrap();
        assert_eq!(status(&engine, "c1"), ConditionStatus::Idle);
        assert_eq!(engine.evaluate_all(&snapshot(dec!(10))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn symbol_mismatch_is_skipped() {
        let engine = engine_with(
            vec![price_condition("c1", Operator::GreaterThan, dec!(1))],
            EvaluationStrategy::Sequential,
        );
        let events = engine
            .evaluate_all(&MarketSnapshot::with_price("ETHUSDT", dec!(10)))
            .await
            .unwrap();
        assert!(events.is_empty());
        let condition = engine.registry().get(&ConditionId::from("c1")).unwrap();
        assert_eq!(condition.status, ConditionStatus::Idle);
        assert_eq!(condition.evaluation_count, 0);
    }

    #[tokio::test]
    async fn one_failing_condition_does_not_abort_the_pass() {
        for strategy in [EvaluationStrategy::Sequential, EvaluationStrategy::Parallel] {
            let range = Condition::new(
                "range",
                "BTCUSDT",
                ConditionType::Market {
                    metric: MarketMetric::RangePercent24h,
                },
                Operator::GreaterThan,
                dec!(5),
            )
            .with_id("range");
            let engine = engine_with(
                vec![
                    range,
                    price_condition("price", Operator::GreaterThan, dec!(1)),
                ],
                strategy,
            );

            let mut broken = snapshot(dec!(10));
            broken.low_24h = Decimal::ZERO;
            let events = engine.evaluate_all(&broken).await.unwrap();
            assert_eq!(events.len(), 1, "{strategy}");
            assert_eq!(events[0].condition_id.as_str(), "price");

            let failed = engine.registry().get(&ConditionId::from("range")).unwrap();
            assert_eq!(failed.status, ConditionStatus::Error);
            assert!(failed.last_error.is_some());
            assert_eq!(failed.evaluation_count, 0);

            let mut healthy = snapshot(dec!(10));
            healthy.high_24h = dec!(11);
            healthy.low_24h = dec!(10);
            let events = engine.evaluate_all(&healthy).await.unwrap();
            assert_eq!(events.len(), 2);
            let recovered = engine.registry().get(&ConditionId::from("range")).unwrap();
            assert_eq!(recovered.status, ConditionStatus::Triggered);
            assert!(recovered.last_error.is_none());
        }
    }

    #[tokio::test]
    async fn parallel_results_keep_registration_order() {
        let ids = ["e", "b", "d", "a", "c", "f", "h", "g"];
        let conditions = ids
            .iter()
            .map(|id| price_condition(id, Operator::GreaterEqual, dec!(1)))
            .collect();
        let engine = engine_with(conditions, EvaluationStrategy::Parallel);

        let events = engine.evaluate_all(&snapshot(dec!(2))).await.unwrap();
        let fired: Vec<&str> = events.iter().map(|e| e.condition_id.as_str()).collect();
        assert_eq!(fired, ids);
        let evaluation_id = events[0].context.evaluation_id;
        assert!(events.iter().all(|e| e.context.evaluation_id == evaluation_id));
        assert!(events.iter().all(|e| e.context.strategy == EvaluationStrategy::Parallel));
    }

    #[tokio::test]
    async fn overlapping_passes_are_serialized_in_arrival_order() {
        let engine = Arc::new(engine_with(
            vec![
                price_condition("gt", Operator::GreaterThan, dec!(49000)),
                price_condition("cross", Operator::CrossesAbove, dec!(49000)),
            ],
            EvaluationStrategy::Parallel,
        ));

        let prices = [48000, 50000, 48000, 50000, 50000, 48000, 50000, 50000, 50000, 50000];
        let passes = prices
            .iter()
            .map(|p| {
                let engine = Arc::clone(&engine);
                let snap = snapshot(Decimal::from(*p));
                async move { engine.evaluate_all(&snap).await.unwrap() }
            })
            .collect::<Vec<_>>();
        let results = join_all(passes).await;

        let gt = engine.registry().get(&ConditionId::from("gt")).unwrap();
        assert_eq!(gt.evaluation_count, 10);
        assert_eq!(gt.trigger_count, 7);

        // Crossings only fire on 48000 -> 50000 transitions, which exist only
        // if the passes ran in order.
        let crossed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, events)| events.iter().any(|e| e.condition_id.as_str() == "cross"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(crossed, vec![1, 3, 6]);
    }

    #[tokio::test]
    async fn stop_cancels_queued_passes_without_touching_state() {
        let engine = Arc::new(engine_with(
            vec![price_condition("c1", Operator::GreaterThan, dec!(1))],
            EvaluationStrategy::Sequential,
        ));

        let held = engine.pass_lock.lock().await;
        let queued = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.evaluate_all(&snapshot(dec!(10))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopping = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let err = queued.await.unwrap().unwrap_err();
        assert_eq!(err.current_context(), &EngineError::Cancelled);
        stopping.await.unwrap();

        let condition = engine.registry().get(&ConditionId::from("c1")).unwrap();
        assert_eq!(condition.status, ConditionStatus::Idle);
        assert_eq!(condition.evaluation_count, 0);
    }

    #[tokio::test]
    async fn next_evaluation_follows_interval() {
        let registry = Arc::new(ConditionRegistry::new());
        registry
            .register(price_condition("c1", Operator::LessThan, dec!(1)))
            .unwrap();
        let engine = Engine::new(
            Arc::clone(&registry),
            EngineConfig {
                evaluation_interval: Some(Duration::from_secs(60)),
                ..EngineConfig::default()
            },
        );
        engine.start();
        let before = Utc::now();
        engine.evaluate_all(&snapshot(dec!(5))).await.unwrap();
        let next = registry
            .get(&ConditionId::from("c1"))
            .unwrap()
            .next_evaluation
            .unwrap();
        assert!(next >= before + chrono::Duration::seconds(60));
    }
}
