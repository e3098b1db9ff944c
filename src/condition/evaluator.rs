use std::collections::VecDeque;

use chrono::{Datelike, Timelike};
use error_stack::{Report, ResultExt};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::condition::{Condition, ConditionType, MarketMetric, Operator, TimeField};
use crate::error::EvaluationError;
use crate::indicator;
use crate::model::{ConditionResult, EvaluationContext, MarketSnapshot};

/// Upper bound on the price history kept per technical condition.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Per-condition state carried between passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeState {
    /// Metric observed on the last successful evaluation; drives crossings.
    pub previous_value: Option<Decimal>,
    /// Snapshot prices seen so far (technical conditions only), oldest first.
    pub price_history: VecDeque<f64>,
}

/// A completed evaluation: the result plus the state to commit.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: ConditionResult,
    pub state: RuntimeState,
}

/// Evaluates one condition against one snapshot.
///
/// Evaluation is a pure function of the condition, its runtime state and the
/// snapshot; the caller decides whether to commit the returned state.
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    history_limit: usize,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ConditionEvaluator {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
        }
    }

    /// Disabled and symbol-mismatched conditions are skipped entirely.
    pub fn applies_to(condition: &Condition, symbol: &str) -> bool {
        condition.is_active && condition.symbol == symbol
    }

    pub fn evaluate(
        &self,
        condition: &Condition,
        state: &RuntimeState,
        snapshot: &MarketSnapshot,
        _context: &EvaluationContext,
    ) -> Result<Evaluation, Report<EvaluationError>> {
        let mut next = state.clone();

        let observed = match &condition.condition_type {
            ConditionType::Price => Some(snapshot.price),
            ConditionType::Volume => Some(snapshot.volume_24h),
            ConditionType::Market { metric } => Some(market_value(*metric, snapshot)?),
            ConditionType::Time { field } => Some(time_value(*field, snapshot)),
            ConditionType::Technical { indicator } => {
                self.push_price(&mut next, snapshot)?;
                technical_value(condition, indicator, &next.price_history)?
            }
        };

        let Some(current) = observed else {
            let required = match &condition.condition_type {
                ConditionType::Technical { indicator } => indicator::required_history(indicator),
                _ => 0,
            };
            let details = format!(
                "{} warming up: {}/{} samples",
                condition.condition_type.metric_name(),
                next.price_history.len(),
                required
            );
            return Ok(Evaluation {
                result: ConditionResult {
                    condition_id: condition.id().clone(),
                    satisfied: false,
                    value: Decimal::ZERO,
                    details,
                },
                state: next,
            });
        };

        let satisfied = is_satisfied(
            condition.operator,
            current,
            state.previous_value,
            condition.threshold,
        );
        next.previous_value = Some(current);

        let details = if condition.operator.is_crossing() && state.previous_value.is_none() {
            format!(
                "{} {} = {current}; no previous value to detect a crossing",
                condition.symbol,
                condition.condition_type.metric_name()
            )
        } else {
            format!(
                "{} {} = {current} {} {} ({})",
                condition.symbol,
                condition.condition_type.metric_name(),
                condition.operator.symbol(),
                condition.threshold,
                if satisfied { "satisfied" } else { "not satisfied" }
            )
        };

        Ok(Evaluation {
            result: ConditionResult {
                condition_id: condition.id().clone(),
                satisfied,
                value: current,
                details,
            },
            state: next,
        })
    }

    fn push_price(
        &self,
        state: &mut RuntimeState,
        snapshot: &MarketSnapshot,
    ) -> Result<(), Report<EvaluationError>> {
        let price = snapshot
            .price
            .to_f64()
            .ok_or_else(|| {
                Report::new(EvaluationError::NonFiniteValue {
                    metric: "price".into(),
                })
            })?;
        state.price_history.push_back(price);
        while state.price_history.len() > self.history_limit {
            state.price_history.pop_front();
        }
        Ok(())
    }
}

fn is_satisfied(
    operator: Operator,
    current: Decimal,
    previous: Option<Decimal>,
    threshold: Decimal,
) -> bool {
    match operator {
        Operator::GreaterThan => current > threshold,
        Operator::GreaterEqual => current >= threshold,
        Operator::LessThan => current < threshold,
        Operator::LessEqual => current <= threshold,
        Operator::Equal => current == threshold,
        Operator::NotEqual => current != threshold,
        Operator::CrossesAbove => {
            previous.is_some_and(|prev| prev <= threshold) && current > threshold
        }
        Operator::CrossesBelow => {
            previous.is_some_and(|prev| prev >= threshold) && current < threshold
        }
    }
}

fn market_value(
    metric: MarketMetric,
    snapshot: &MarketSnapshot,
) -> Result<Decimal, Report<EvaluationError>> {
    match metric {
        MarketMetric::ChangePercent24h => Ok(snapshot.change_percent_24h),
        MarketMetric::Change24h => Ok(snapshot.change_24h),
        MarketMetric::High24h => Ok(snapshot.high_24h),
        MarketMetric::Low24h => Ok(snapshot.low_24h),
        MarketMetric::RangePercent24h => (snapshot.high_24h - snapshot.low_24h)
            .checked_div(snapshot.low_24h)
            .map(|ratio| (ratio * Decimal::ONE_HUNDRED).round_dp(4))
            .ok_or_else(|| {
                Report::new(EvaluationError::NonFiniteValue {
                    metric: metric.as_str().into(),
                })
                .attach(format!("low_24h: {}", snapshot.low_24h))
            }),
    }
}

fn time_value(field: TimeField, snapshot: &MarketSnapshot) -> Decimal {
    let ts = snapshot.timestamp;
    match field {
        TimeField::HourOfDay => Decimal::from(ts.hour()),
        TimeField::MinuteOfDay => Decimal::from(ts.hour() * 60 + ts.minute()),
        TimeField::DayOfWeek => Decimal::from(ts.weekday().number_from_monday()),
        TimeField::UnixTimestamp => Decimal::from(ts.timestamp()),
    }
}

/// Returns `None` while the history is shorter than the indicator needs.
fn technical_value(
    condition: &Condition,
    technical: &crate::condition::TechnicalIndicator,
    history: &VecDeque<f64>,
) -> Result<Option<Decimal>, Report<EvaluationError>> {
    let indicator_error = || EvaluationError::Indicator {
        id: condition.id().to_string(),
    };
    let indicator = indicator::build(technical).change_context_lazy(indicator_error)?;
    if history.len() < indicator.required_history() {
        return Ok(None);
    }

    let prices: Vec<f64> = history.iter().copied().collect();
    let values = indicator
        .calculate(&prices)
        .change_context_lazy(indicator_error)?;
    let Some(&latest) = values.last() else {
        return Ok(None);
    };

    Decimal::try_from(latest)
        .map(|value| Some(value.round_dp(8)))
        .change_context(EvaluationError::NonFiniteValue {
            metric: technical.as_str().into(),
        })
        .attach_with(|| format!("indicator value: {latest}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::TechnicalIndicator;
    use crate::model::EvaluationStrategy;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn make_condition(operator: Operator, threshold: Decimal) -> Condition {
        Condition::new(
            "test-condition",
            "BTCUSDT",
            ConditionType::Price,
            operator,
            threshold,
        )
    }

    fn run(
        condition: &Condition,
        state: &RuntimeState,
        snapshot: &MarketSnapshot,
    ) -> Evaluation {
        let ctx = EvaluationContext::new(EvaluationStrategy::Sequential);
        ConditionEvaluator::default()
            .evaluate(condition, state, snapshot, &ctx)
            .unwrap()
    }

    fn price(value: Decimal) -> MarketSnapshot {
        MarketSnapshot::with_price("BTCUSDT", value)
    }

    #[test]
    fn greater_than_triggers_above_threshold() {
        let condition = make_condition(Operator::GreaterThan, dec!(49000));
        let eval = run(&condition, &RuntimeState::default(), &price(dec!(50000)));
        assert!(eval.result.satisfied);
        assert_eq!(eval.result.value, dec!(50000));
        assert_eq!(eval.state.previous_value, Some(dec!(50000)));
    }

    #[test]
    fn greater_than_does_not_trigger_at_threshold() {
        let condition = make_condition(Operator::GreaterThan, dec!(49000));
        let eval = run(&condition, &RuntimeState::default(), &price(dec!(49000)));
        assert!(!eval.result.satisfied);
    }

    #[test]
    fn decimal_comparison_has_no_float_drift() {
        let condition = make_condition(Operator::Equal, dec!(0.3));
        let eval = run(
            &condition,
            &RuntimeState::default(),
            &price(dec!(0.1) + dec!(0.2)),
        );
        assert!(eval.result.satisfied);
    }

    #[test]
    fn less_equal_and_not_equal() {
        let le = make_condition(Operator::LessEqual, dec!(100));
        assert!(run(&le, &RuntimeState::default(), &price(dec!(100))).result.satisfied);
        let ne = make_condition(Operator::NotEqual, dec!(100));
        assert!(!run(&ne, &RuntimeState::default(), &price(dec!(100))).result.satisfied);
    }

    #[test]
    fn crosses_above_needs_previous_value() {
        let condition = make_condition(Operator::CrossesAbove, dec!(100));
        let first = run(&condition, &RuntimeState::default(), &price(dec!(105)));
        assert!(!first.result.satisfied);
        assert!(first.result.details.contains("no previous value"));
    }

    #[test]
    fn crosses_above_triggers_on_upward_crossing_only() {
        let condition = make_condition(Operator::CrossesAbove, dec!(100));
        let below = run(&condition, &RuntimeState::default(), &price(dec!(99)));
        let crossed = run(&condition, &below.state, &price(dec!(101)));
        assert!(crossed.result.satisfied);
        let still_above = run(&condition, &crossed.state, &price(dec!(102)));
        assert!(!still_above.result.satisfied);
    }

    #[test]
    fn crosses_below_triggers_on_downward_crossing() {
        let condition = make_condition(Operator::CrossesBelow, dec!(100));
        let above = run(&condition, &RuntimeState::default(), &price(dec!(100)));
        let crossed = run(&condition, &above.state, &price(dec!(99.5)));
        assert!(crossed.result.satisfied);
    }

    #[test]
    fn volume_condition_reads_24h_volume() {
        let condition = Condition::new(
            "volume spike",
            "BTCUSDT",
            ConditionType::Volume,
            Operator::GreaterThan,
            dec!(1000),
        );
        let mut snapshot = price(dec!(1));
        snapshot.volume_24h = dec!(1500);
        assert!(run(&condition, &RuntimeState::default(), &snapshot).result.satisfied);
    }

    #[test]
    fn market_range_percent() {
        let condition = Condition::new(
            "wide range",
            "BTCUSDT",
            ConditionType::Market {
                metric: MarketMetric::RangePercent24h,
            },
            Operator::GreaterEqual,
            dec!(10),
        );
        let mut snapshot = price(dec!(105));
        snapshot.high_24h = dec!(110);
        snapshot.low_24h = dec!(100);
        let eval = run(&condition, &RuntimeState::default(), &snapshot);
        assert_eq!(eval.result.value, dec!(10));
        assert!(eval.result.satisfied);
    }

    #[test]
    fn market_range_with_zero_low_is_an_error() {
        let condition = Condition::new(
            "wide range",
            "BTCUSDT",
            ConditionType::Market {
                metric: MarketMetric::RangePercent24h,
            },
            Operator::GreaterThan,
            dec!(10),
        );
        let mut snapshot = price(dec!(1));
        snapshot.low_24h = Decimal::ZERO;
        let ctx = EvaluationContext::new(EvaluationStrategy::Sequential);
        let result = ConditionEvaluator::default().evaluate(
            &condition,
            &RuntimeState::default(),
            &snapshot,
            &ctx,
        );
        assert!(result.is_err());
    }

    #[test]
    fn time_condition_uses_snapshot_hour() {
        let condition = Condition::new(
            "after 14h",
            "BTCUSDT",
            ConditionType::Time {
                field: TimeField::HourOfDay,
            },
            Operator::GreaterEqual,
            dec!(14),
        );
        let mut snapshot = price(dec!(1));
        snapshot.timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 15, 30, 0).unwrap();
        let eval = run(&condition, &RuntimeState::default(), &snapshot);
        assert_eq!(eval.result.value, dec!(15));
        assert!(eval.result.satisfied);
    }

    #[test]
    fn technical_condition_warms_up_then_evaluates() {
        let condition = Condition::new(
            "sma above",
            "BTCUSDT",
            ConditionType::Technical {
                indicator: TechnicalIndicator::Sma { period: 3 },
            },
            Operator::GreaterThan,
            dec!(100),
        );
        let mut state = RuntimeState::default();
        for p in [dec!(100), dec!(102)] {
            let eval = run(&condition, &state, &price(p));
            assert!(!eval.result.satisfied);
            assert!(eval.result.details.contains("warming up"));
            state = eval.state;
        }
        let eval = run(&condition, &state, &price(dec!(104)));
        assert_eq!(eval.result.value, dec!(102));
        assert!(eval.result.satisfied);
    }

    #[test]
    fn technical_condition_with_invalid_period_errors() {
        let condition = Condition::new(
            "broken",
            "BTCUSDT",
            ConditionType::Technical {
                indicator: TechnicalIndicator::Rsi { period: 0 },
            },
            Operator::LessThan,
            dec!(30),
        );
        let ctx = EvaluationContext::new(EvaluationStrategy::Sequential);
        let result = ConditionEvaluator::default().evaluate(
            &condition,
            &RuntimeState::default(),
            &price(dec!(1)),
            &ctx,
        );
        assert!(result.is_err());
    }

    #[test]
    fn oversized_periods_stay_in_warm_up() {
        for indicator in [
            TechnicalIndicator::Rsi { period: usize::MAX },
            TechnicalIndicator::Macd {
                fast: 1,
                slow: usize::MAX,
                signal: 9,
            },
        ] {
            let condition = Condition::new(
                "huge",
                "BTCUSDT",
                ConditionType::Technical { indicator },
                Operator::LessThan,
                dec!(30),
            );
            let eval = run(&condition, &RuntimeState::default(), &price(dec!(1)));
            assert!(!eval.result.satisfied);
            assert!(eval.result.details.contains(&format!("/{}", usize::MAX)));
        }
    }

    #[test]
    fn history_is_capped() {
        let evaluator = ConditionEvaluator::new(3);
        let condition = Condition::new(
            "ema",
            "BTCUSDT",
            ConditionType::Technical {
                indicator: TechnicalIndicator::Ema { period: 2 },
            },
            Operator::GreaterThan,
            dec!(0),
        );
        let ctx = EvaluationContext::new(EvaluationStrategy::Sequential);
        let mut state = RuntimeState::default();
        for p in 1..=6 {
            state = evaluator
                .evaluate(&condition, &state, &price(Decimal::from(p)), &ctx)
                .unwrap()
                .state;
        }
        assert_eq!(state.price_history.len(), 3);
        assert_eq!(state.price_history.front(), Some(&4.0));
    }

    #[test]
    fn applies_to_checks_symbol_and_activity() {
        let condition = make_condition(Operator::GreaterThan, dec!(1));
        assert!(ConditionEvaluator::applies_to(&condition, "BTCUSDT"));
        assert!(!ConditionEvaluator::applies_to(&condition, "ETHUSDT"));
        assert!(!ConditionEvaluator::applies_to(
            &condition.clone().inactive(),
            "BTCUSDT"
        ));
    }
}
