use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;

/// Stable identifier of a registered condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionId(String);

impl ConditionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConditionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Urgency of a trigger, 1 (lowest) to 5 (most urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Self = Self(1);
    pub const NORMAL: Self = Self(2);
    pub const MEDIUM: Self = Self(3);
    pub const HIGH: Self = Self(4);
    pub const CRITICAL: Self = Self(5);

    pub fn new(level: u8) -> Option<Self> {
        (1..=5).contains(&level).then_some(Self(level))
    }

    pub fn level(self) -> u8 {
        self.0
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            1 => "low",
            2 => "normal",
            3 => "medium",
            4 => "high",
            _ => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("priority must be 1-5, got {value}"))
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time market data for one symbol, produced by the external feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub volume_24h: Decimal,
    #[serde(default)]
    pub change_24h: Decimal,
    #[serde(default)]
    pub change_percent_24h: Decimal,
    #[serde(default)]
    pub high_24h: Decimal,
    #[serde(default)]
    pub low_24h: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Snapshot with only a price set; the 24h fields default to zero.
    pub fn with_price(symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume_24h: Decimal::ZERO,
            change_24h: Decimal::ZERO,
            change_percent_24h: Decimal::ZERO,
            high_24h: price,
            low_24h: price,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStrategy {
    #[default]
    Sequential,
    Parallel,
}

impl EvaluationStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

impl fmt::Display for EvaluationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, read-only context of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationContext {
    pub evaluation_id: Uuid,
    pub strategy: EvaluationStrategy,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationContext {
    pub fn new(strategy: EvaluationStrategy) -> Self {
        Self {
            evaluation_id: Uuid::new_v4(),
            strategy,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of evaluating one condition against one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionResult {
    pub condition_id: ConditionId,
    pub satisfied: bool,
    pub value: Decimal,
    pub details: String,
}

/// Emitted for every satisfied condition in a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub condition_id: ConditionId,
    pub condition_name: String,
    pub symbol: String,
    pub result: ConditionResult,
    pub timestamp: DateTime<Utc>,
    pub context: EvaluationContext,
    pub priority: Priority,
    pub metadata: BTreeMap<String, String>,
}

impl TriggerEvent {
    /// Returns `None` for an unsatisfied result.
    pub fn from_condition(
        condition: &Condition,
        result: ConditionResult,
        context: &EvaluationContext,
    ) -> Option<Self> {
        if !result.satisfied {
            return None;
        }
        Some(Self {
            event_id: Uuid::new_v4(),
            condition_id: condition.id().clone(),
            condition_name: condition.name.clone(),
            symbol: condition.symbol.clone(),
            result,
            timestamp: Utc::now(),
            context: context.clone(),
            priority: condition.priority,
            metadata: condition.metadata.clone(),
        })
    }
}

/// Rendered, channel-specific message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub message_id: Uuid,
    pub event_id: Option<Uuid>,
    pub channel: String,
    pub title: String,
    pub content: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn new(
        channel: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            event_id: None,
            channel: channel.into(),
            title: title.into(),
            content: content.into(),
            priority,
            timestamp: Utc::now(),
        }
    }

    pub fn for_event(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionType, Operator};
    use rust_decimal_macros::dec;

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::new(0).is_none());
        assert!(Priority::new(6).is_none());
        assert_eq!(Priority::new(5), Some(Priority::CRITICAL));
    }

    #[test]
    fn priority_serde_validates_level() {
        let parsed: Priority = serde_json::from_str("4").unwrap();
        assert_eq!(parsed, Priority::HIGH);
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }

    #[test]
    fn snapshot_parses_from_json_line() {
        let line = r#"{"symbol":"BTCUSDT","price":"50000.5","volume_24h":1200}"#;
        let snapshot: MarketSnapshot = serde_json::from_str(line).unwrap();
        assert_eq!(snapshot.symbol, "BTCUSDT");
        assert_eq!(snapshot.price, dec!(50000.5));
        assert_eq!(snapshot.volume_24h, dec!(1200));
        assert_eq!(snapshot.change_24h, Decimal::ZERO);
    }

    #[test]
    fn trigger_event_requires_satisfied_result() {
        let condition = Condition::new(
            "BTC above 49k",
            "BTCUSDT",
            ConditionType::Price,
            Operator::GreaterThan,
            dec!(49000),
        );
        let context = EvaluationContext::new(EvaluationStrategy::Sequential);
        let unsatisfied = ConditionResult {
            condition_id: condition.id().clone(),
            satisfied: false,
            value: dec!(48000),
            details: String::new(),
        };
        assert!(TriggerEvent::from_condition(&condition, unsatisfied.clone(), &context).is_none());

        let satisfied = ConditionResult {
            satisfied: true,
            ..unsatisfied
        };
        let event = TriggerEvent::from_condition(&condition, satisfied, &context).unwrap();
        assert_eq!(&event.condition_id, condition.id());
        assert_eq!(event.context.evaluation_id, context.evaluation_id);
    }

    #[test]
    fn strategy_round_trip() {
        for strategy in [EvaluationStrategy::Sequential, EvaluationStrategy::Parallel] {
            assert_eq!(EvaluationStrategy::from_str(strategy.as_str()), Some(strategy));
        }
        assert_eq!(EvaluationStrategy::from_str("random"), None);
    }
}
