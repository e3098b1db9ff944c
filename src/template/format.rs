//! Typed formatters applied to template placeholders.
//!
//! A placeholder picks its formatter from its name suffix: `_price` uses
//! `currency`, `_percent` uses `percentage`, `_datetime` uses `datetime` and
//! `_emoji` uses `emoji_priority`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// A value that can be substituted into a template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Text(String),
    Decimal(Decimal),
    Integer(i64),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

impl TemplateValue {
    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            Self::Integer(i) => Some(Decimal::from(*i)),
            Self::Text(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Decimal(d) => write!(f, "{}", d.normalize()),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::DateTime(dt) => f.write_str(&dt.to_rfc3339()),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Decimal> for TemplateValue {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u8> for TemplateValue {
    fn from(value: u8) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for TemplateValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

/// Returns `None` when the value has the wrong type for the formatter.
pub type Formatter = fn(&TemplateValue) -> Option<String>;

/// Named formatters available to templates.
#[derive(Clone)]
pub struct FormatterRegistry {
    formatters: BTreeMap<String, Formatter>,
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            formatters: BTreeMap::new(),
        };
        registry.register("currency", currency);
        registry.register("percentage", percentage);
        registry.register("emoji_priority", emoji_priority);
        registry.register("datetime", datetime);
        registry
    }
}

impl FormatterRegistry {
    pub fn register(&mut self, name: impl Into<String>, formatter: Formatter) {
        self.formatters.insert(name.into(), formatter);
    }

    pub fn get(&self, name: &str) -> Option<Formatter> {
        self.formatters.get(name).copied()
    }
}

/// Formatter selected by a placeholder's name suffix, if any.
pub fn formatter_for(placeholder: &str) -> Option<&'static str> {
    const SUFFIXES: &[(&str, &str)] = &[
        ("_datetime", "datetime"),
        ("_price", "currency"),
        ("_percent", "percentage"),
        ("_emoji", "emoji_priority"),
    ];
    SUFFIXES
        .iter()
        .find(|(suffix, _)| placeholder.ends_with(suffix))
        .map(|(_, formatter)| *formatter)
}

/// `$1,234.50`: two decimals, thousands separators, sign before the symbol.
pub fn currency(value: &TemplateValue) -> Option<String> {
    let amount = value
        .as_decimal()?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let fixed = format!("{:.2}", amount.abs());
    let (int_part, frac_part) = fixed.split_once('.')?;
    let sign = if amount.is_sign_negative() && !amount.is_zero() {
        "-"
    } else {
        ""
    };
    Some(format!("{sign}${}.{frac_part}", group_thousands(int_part)))
}

/// `2.5%`: one decimal.
pub fn percentage(value: &TemplateValue) -> Option<String> {
    let pct = value
        .as_decimal()?
        .round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero);
    Some(format!("{pct:.1}%"))
}

/// Severity glyph for priorities 1 through 5.
pub fn emoji_priority(value: &TemplateValue) -> Option<String> {
    let level = match value {
        TemplateValue::Integer(i) => *i,
        other => other.as_decimal()?.trunc().to_i64()?,
    };
    let glyph = match level {
        1 => "🔵",
        2 => "🟢",
        3 => "🟡",
        4 => "🟠",
        5 => "🔴",
        _ => return None,
    };
    Some(glyph.to_string())
}

/// `2024-01-01 15:30:00 UTC`.
pub fn datetime(value: &TemplateValue) -> Option<String> {
    let dt = match value {
        TemplateValue::DateTime(dt) => *dt,
        TemplateValue::Text(s) => DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc),
        TemplateValue::Integer(secs) => DateTime::from_timestamp(*secs, 0)?,
        _ => return None,
    };
    Some(dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
