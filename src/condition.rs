pub mod evaluator;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use error_stack::Report;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ConditionConfig;
use crate::error::ConfigError;
use crate::indicator;
use crate::model::{ConditionId, Priority};

/// Technical indicators computed over a condition's rolling price history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TechnicalIndicator {
    Rsi { period: usize },
    Sma { period: usize },
    Ema { period: usize },
    /// MACD histogram (macd line minus signal line).
    Macd { fast: usize, slow: usize, signal: usize },
    /// Bollinger %B: 0 at the lower band, 1 at the upper band.
    Bollinger { period: usize, std_dev_multiplier: f64 },
}

impl TechnicalIndicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsi { .. } => "rsi",
            Self::Sma { .. } => "sma",
            Self::Ema { .. } => "ema",
            Self::Macd { .. } => "macd",
            Self::Bollinger { .. } => "bollinger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketMetric {
    ChangePercent24h,
    Change24h,
    High24h,
    Low24h,
    RangePercent24h,
}

impl MarketMetric {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "change_percent_24h" => Some(Self::ChangePercent24h),
            "change_24h" => Some(Self::Change24h),
            "high_24h" => Some(Self::High24h),
            "low_24h" => Some(Self::Low24h),
            "range_percent_24h" => Some(Self::RangePercent24h),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangePercent24h => "change_percent_24h",
            Self::Change24h => "change_24h",
            Self::High24h => "high_24h",
            Self::Low24h => "low_24h",
            Self::RangePercent24h => "range_percent_24h",
        }
    }
}

/// Calendar fields of the snapshot timestamp (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeField {
    HourOfDay,
    MinuteOfDay,
    /// 1 = Monday ... 7 = Sunday.
    DayOfWeek,
    UnixTimestamp,
}

impl TimeField {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "hour_of_day" => Some(Self::HourOfDay),
            "minute_of_day" => Some(Self::MinuteOfDay),
            "day_of_week" => Some(Self::DayOfWeek),
            "unix_timestamp" => Some(Self::UnixTimestamp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HourOfDay => "hour_of_day",
            Self::MinuteOfDay => "minute_of_day",
            Self::DayOfWeek => "day_of_week",
            Self::UnixTimestamp => "unix_timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionType {
    Price,
    Volume,
    Technical { indicator: TechnicalIndicator },
    Time { field: TimeField },
    Market { metric: MarketMetric },
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Volume => "volume",
            Self::Technical { .. } => "technical",
            Self::Time { .. } => "time",
            Self::Market { .. } => "market",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Price => "Price",
            Self::Volume => "24h Volume",
            Self::Technical { .. } => "Technical Indicator",
            Self::Time { .. } => "Time",
            Self::Market { .. } => "Market Movement",
        }
    }

    /// Name of the metric this condition observes, used in result details.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Volume => "volume_24h",
            Self::Technical { indicator } => indicator.as_str(),
            Self::Time { field } => field.as_str(),
            Self::Market { metric } => metric.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Equal,
    NotEqual,
    CrossesAbove,
    CrossesBelow,
}

impl Operator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "greater_than" => Some(Self::GreaterThan),
            "greater_equal" => Some(Self::GreaterEqual),
            "less_than" => Some(Self::LessThan),
            "less_equal" => Some(Self::LessEqual),
            "equal" => Some(Self::Equal),
            "not_equal" => Some(Self::NotEqual),
            "crosses_above" => Some(Self::CrossesAbove),
            "crosses_below" => Some(Self::CrossesBelow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GreaterThan => "greater_than",
            Self::GreaterEqual => "greater_equal",
            Self::LessThan => "less_than",
            Self::LessEqual => "less_equal",
            Self::Equal => "equal",
            Self::NotEqual => "not_equal",
            Self::CrossesAbove => "crosses_above",
            Self::CrossesBelow => "crosses_below",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterEqual => ">=",
            Self::LessThan => "<",
            Self::LessEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::CrossesAbove => "crosses above",
            Self::CrossesBelow => "crosses below",
        }
    }

    /// Whether this operator needs the previously observed value.
    pub fn is_crossing(self) -> bool {
        matches!(self, Self::CrossesAbove | Self::CrossesBelow)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    Idle,
    Evaluating,
    Triggered,
    Error,
    Disabled,
}

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Evaluating => "evaluating",
            Self::Triggered => "triggered",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-defined rule comparing a market metric to a threshold.
///
/// The runtime fields (`status`, counters, timestamps) are owned by the
/// [`registry::ConditionRegistry`]; values handed out by the registry are
/// point-in-time copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    condition_id: ConditionId,
    pub name: String,
    pub symbol: String,
    pub condition_type: ConditionType,
    pub operator: Operator,
    pub threshold: Decimal,
    pub priority: Priority,
    pub is_active: bool,
    pub metadata: BTreeMap<String, String>,
    pub status: ConditionStatus,
    pub trigger_count: u64,
    pub evaluation_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub next_evaluation: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Condition {
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        condition_type: ConditionType,
        operator: Operator,
        threshold: Decimal,
    ) -> Self {
        Self {
            condition_id: ConditionId::generate(),
            name: name.into(),
            symbol: symbol.into(),
            condition_type,
            operator,
            threshold,
            priority: Priority::default(),
            is_active: true,
            metadata: BTreeMap::new(),
            status: ConditionStatus::Idle,
            trigger_count: 0,
            evaluation_count: 0,
            last_triggered: None,
            next_evaluation: None,
            last_error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.condition_id = ConditionId::new(id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn id(&self) -> &ConditionId {
        &self.condition_id
    }

    /// Percentage of completed evaluations that fired.
    pub fn success_rate(&self) -> f64 {
        if self.evaluation_count == 0 {
            return 0.0;
        }
        self.trigger_count as f64 / self.evaluation_count as f64 * 100.0
    }

    /// Human-readable rule, e.g. `BTCUSDT price > 49000`.
    pub fn describe(&self) -> String {
        format!(
            "{} {} {} {}",
            self.symbol,
            self.condition_type.metric_name(),
            self.operator.symbol(),
            self.threshold
        )
    }

    /// Build a condition from its `[[conditions]]` config entry.
    pub fn from_config(config: &ConditionConfig) -> Result<Self, Report<ConfigError>> {
        let invalid = |what: String| {
            Report::new(ConfigError::Validation {
                field: format!("conditions[\"{}\"].{what}", config.name),
            })
        };

        let condition_type = parse_condition_type(config).map_err(invalid)?;
        let operator = Operator::from_str(&config.operator)
            .ok_or_else(|| invalid(format!("operator \"{}\" is not valid", config.operator)))?;
        let priority = match config.priority {
            Some(level) => Priority::new(level)
                .ok_or_else(|| invalid(format!("priority {level} is outside 1-5")))?,
            None => Priority::default(),
        };

        let mut condition = Self::new(
            config.name.clone(),
            config.symbol.clone(),
            condition_type,
            operator,
            config.threshold,
        )
        .with_priority(priority);
        if let Some(id) = &config.id {
            condition = condition.with_id(id.clone());
        }
        condition.is_active = config.active;
        condition.metadata = config.metadata.clone();
        Ok(condition)
    }
}

fn parse_condition_type(config: &ConditionConfig) -> Result<ConditionType, String> {
    match config.condition_type.as_str() {
        "price" => Ok(ConditionType::Price),
        "volume" => Ok(ConditionType::Volume),
        "market" => {
            let name = config.metric.as_deref().unwrap_or("change_percent_24h");
            MarketMetric::from_str(name)
                .map(|metric| ConditionType::Market { metric })
                .ok_or_else(|| format!("metric \"{name}\" is not a market metric"))
        }
        "time" => {
            let name = config.metric.as_deref().unwrap_or("hour_of_day");
            TimeField::from_str(name)
                .map(|field| ConditionType::Time { field })
                .ok_or_else(|| format!("metric \"{name}\" is not a time field"))
        }
        "technical" => parse_indicator(config).map(|indicator| ConditionType::Technical { indicator }),
        other => Err(format!("condition_type \"{other}\" is not valid")),
    }
}

fn parse_indicator(config: &ConditionConfig) -> Result<TechnicalIndicator, String> {
    let get_usize = |key: &str, default: usize| -> Result<usize, String> {
        let Some(value) = config.params.get(key) else {
            return Ok(default);
        };
        value
            .as_integer()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| format!("params.{key} must be a non-negative integer, got {value}"))
    };
    let get_f64 = |key: &str, default: f64| -> Result<f64, String> {
        let Some(value) = config.params.get(key) else {
            return Ok(default);
        };
        value
            .as_float()
            .or_else(|| value.as_integer().map(|n| n as f64))
            .ok_or_else(|| format!("params.{key} must be a number, got {value}"))
    };

    let indicator = match config.indicator.as_deref().unwrap_or("rsi") {
        "rsi" => TechnicalIndicator::Rsi {
            period: get_usize("period", 14)?,
        },
        "sma" => TechnicalIndicator::Sma {
            period: get_usize("period", 20)?,
        },
        "ema" => TechnicalIndicator::Ema {
            period: get_usize("period", 20)?,
        },
        "macd" => TechnicalIndicator::Macd {
            fast: get_usize("fast_period", 12)?,
            slow: get_usize("slow_period", 26)?,
            signal: get_usize("signal_period", 9)?,
        },
        "bollinger" => TechnicalIndicator::Bollinger {
            period: get_usize("period", 20)?,
            std_dev_multiplier: get_f64("std_dev_multiplier", 2.0)?,
        },
        other => return Err(format!("indicator \"{other}\" is not valid")),
    };

    // Rejects zero periods and fast >= slow before the first pass sees them.
    indicator::build(&indicator)
        .map_err(|report| format!("params: {}", report.current_context()))?;
    Ok(indicator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config(toml_src: &str) -> ConditionConfig {
        toml::from_str(toml_src).expect("parse failed")
    }

    #[test]
    fn builds_price_condition_from_config() {
        let cfg = config(
            r#"
id = "btc-49k"
name = "BTC above 49k"
symbol = "BTCUSDT"
condition_type = "price"
operator = "greater_than"
threshold = "49000"
priority = 4
"#,
        );
        let condition = Condition::from_config(&cfg).unwrap();
        assert_eq!(condition.id().as_str(), "btc-49k");
        assert_eq!(condition.condition_type, ConditionType::Price);
        assert_eq!(condition.operator, Operator::GreaterThan);
        assert_eq!(condition.threshold, dec!(49000));
        assert_eq!(condition.priority, Priority::HIGH);
        assert_eq!(condition.status, ConditionStatus::Idle);
    }

    #[test]
    fn builds_technical_condition_with_params() {
        let cfg = config(
            r#"
name = "BTC RSI oversold"
symbol = "BTCUSDT"
condition_type = "technical"
indicator = "rsi"
params = { period = 7 }
operator = "less_than"
threshold = 30
"#,
        );
        let condition = Condition::from_config(&cfg).unwrap();
        assert_eq!(
            condition.condition_type,
            ConditionType::Technical {
                indicator: TechnicalIndicator::Rsi { period: 7 }
            }
        );
    }

    #[test]
    fn rejects_unknown_operator_and_bad_priority() {
        let bad_operator = config(
            r#"
name = "x"
symbol = "BTCUSDT"
condition_type = "price"
operator = "around"
threshold = 1
"#,
        );
        assert!(Condition::from_config(&bad_operator).is_err());

        let bad_priority = config(
            r#"
name = "x"
symbol = "BTCUSDT"
condition_type = "price"
operator = "equal"
threshold = 1
priority = 9
"#,
        );
        assert!(Condition::from_config(&bad_priority).is_err());
    }

    #[test]
    fn rejects_unknown_market_metric() {
        let cfg = config(
            r#"
name = "x"
symbol = "BTCUSDT"
condition_type = "market"
metric = "open_interest"
operator = "greater_than"
threshold = 1
"#,
        );
        assert!(Condition::from_config(&cfg).is_err());
    }

    fn technical_config(indicator: &str, params: &str) -> ConditionConfig {
        config(&format!(
            r#"
name = "x"
symbol = "BTCUSDT"
condition_type = "technical"
indicator = "{indicator}"
params = {params}
operator = "less_than"
threshold = 30
"#
        ))
    }

    fn config_field(report: Report<ConfigError>) -> String {
        match report.current_context() {
            ConfigError::Validation { field } => field.clone(),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn negative_period_is_rejected() {
        let err = Condition::from_config(&technical_config("rsi", "{ period = -1 }")).unwrap_err();
        assert!(config_field(err).contains("params.period must be a non-negative integer"));
    }

    #[test]
    fn invalid_indicator_parameters_are_rejected_at_load() {
        for (indicator, params) in [
            ("rsi", "{ period = 0 }"),
            ("sma", "{ period = 0 }"),
            ("macd", "{ fast_period = 26, slow_period = 12 }"),
            ("bollinger", "{ std_dev_multiplier = -2.0 }"),
            ("ema", "{ period = \"14\" }"),
        ] {
            let err = Condition::from_config(&technical_config(indicator, params)).unwrap_err();
            assert!(config_field(err).contains("params"), "{indicator} {params}");
        }
    }

    #[test]
    fn integer_multiplier_is_accepted() {
        let condition =
            Condition::from_config(&technical_config("bollinger", "{ std_dev_multiplier = 3 }"))
                .unwrap();
        assert_eq!(
            condition.condition_type,
            ConditionType::Technical {
                indicator: TechnicalIndicator::Bollinger {
                    period: 20,
                    std_dev_multiplier: 3.0
                }
            }
        );
    }

    #[test]
    fn success_rate_is_zero_before_any_evaluation() {
        let mut condition = Condition::new(
            "x",
            "BTCUSDT",
            ConditionType::Volume,
            Operator::GreaterThan,
            dec!(1),
        );
        assert_eq!(condition.success_rate(), 0.0);
        condition.evaluation_count = 4;
        condition.trigger_count = 1;
        assert_eq!(condition.success_rate(), 25.0);
    }

    #[test]
    fn operator_round_trip() {
        for op in [
            Operator::GreaterThan,
            Operator::GreaterEqual,
            Operator::LessThan,
            Operator::LessEqual,
            Operator::Equal,
            Operator::NotEqual,
            Operator::CrossesAbove,
            Operator::CrossesBelow,
        ] {
            assert_eq!(Operator::from_str(op.as_str()), Some(op));
        }
    }
}
