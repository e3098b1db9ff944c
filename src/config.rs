use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use error_stack::{Report, ResultExt};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::channel::ChannelKind;
use crate::condition::Condition;
use crate::condition::evaluator::DEFAULT_HISTORY_LIMIT;
use crate::error::ConfigError;
use crate::model::{EvaluationStrategy, Priority};
use crate::template::manager::is_prebuilt;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_strategy() -> String {
    EvaluationStrategy::Sequential.as_str().into()
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_min_priority() -> u8 {
    Priority::LOW.level()
}

fn default_template() -> String {
    "default".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Accepted values: `"sequential"` | `"parallel"`
    #[serde(default = "default_strategy")]
    pub evaluation_strategy: String,
    pub evaluation_interval_secs: Option<u64>,
    /// Prices kept per technical condition.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Persist conditions, trigger events and deliveries to SQLite.
    #[serde(default)]
    pub audit: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConditionConfig {
    /// Generated when omitted.
    pub id: Option<String>,
    pub name: String,
    pub symbol: String,
    /// `price` | `volume` | `technical` | `time` | `market`
    pub condition_type: String,
    /// Market metric or time field, depending on `condition_type`.
    pub metric: Option<String>,
    pub indicator: Option<String>,
    #[serde(default)]
    pub params: toml::Table,
    pub operator: String,
    pub threshold: Decimal,
    pub priority: Option<u8>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_priority")]
    pub min_priority: u8,
    /// Condition ids routed to this channel; empty means all.
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default = "default_template")]
    pub template: String,
    /// Passed as-is to the channel constructor.
    #[serde(default)]
    pub settings: toml::Table,
}

#[derive(Debug, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub description: String,
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_general(&config.general)?;
    validate_conditions(config)?;
    validate_templates(config)?;
    validate_channels(config)?;
    Ok(())
}

fn invalid(field: String) -> Report<ConfigError> {
    Report::new(ConfigError::Validation { field })
}

fn validate_general(general: &GeneralConfig) -> Result<(), Report<ConfigError>> {
    if !matches!(general.log_format.as_str(), "text" | "json") {
        return Err(invalid(format!(
            "general.log_format \"{}\" is not valid",
            general.log_format
        )));
    }
    if EvaluationStrategy::from_str(&general.evaluation_strategy).is_none() {
        return Err(invalid(format!(
            "general.evaluation_strategy \"{}\" is not valid",
            general.evaluation_strategy
        )));
    }
    if general.evaluation_interval_secs == Some(0) {
        return Err(invalid("general.evaluation_interval_secs must be positive".into()));
    }
    if general.history_limit == 0 {
        return Err(invalid("general.history_limit must be positive".into()));
    }
    Ok(())
}

fn validate_conditions(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    for entry in &config.conditions {
        if let Some(id) = &entry.id
            && !seen.insert(id.as_str())
        {
            return Err(invalid(format!("conditions: duplicate id \"{id}\"")));
        }
        // Rejects unknown types, operators, indicators and priorities.
        Condition::from_config(entry)?;
    }
    Ok(())
}

fn validate_templates(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    for template in &config.templates {
        if is_prebuilt(&template.name) {
            return Err(invalid(format!(
                "templates[\"{}\"]: name is reserved for a prebuilt template",
                template.name
            )));
        }
        if !seen.insert(template.name.as_str()) {
            return Err(invalid(format!(
                "templates: duplicate name \"{}\"",
                template.name
            )));
        }
    }
    Ok(())
}

fn validate_channels(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let condition_ids: HashSet<&str> = config
        .conditions
        .iter()
        .filter_map(|c| c.id.as_deref())
        .collect();
    let mut seen = HashSet::new();

    for channel in &config.channels {
        if !seen.insert(channel.name.as_str()) {
            return Err(invalid(format!(
                "channels: duplicate name \"{}\"",
                channel.name
            )));
        }
        if ChannelKind::from_str(&channel.kind).is_none() {
            return Err(invalid(format!(
                "channels[\"{}\"].kind \"{}\" is not a known channel kind",
                channel.name, channel.kind
            )));
        }
        if Priority::new(channel.min_priority).is_none() {
            return Err(invalid(format!(
                "channels[\"{}\"].min_priority {} is outside 1-5",
                channel.name, channel.min_priority
            )));
        }
        let template_known = is_prebuilt(&channel.template)
            || config.templates.iter().any(|t| t.name == channel.template);
        if !template_known {
            return Err(invalid(format!(
                "channels[\"{}\"].template \"{}\" does not exist",
                channel.name, channel.template
            )));
        }
        if let Some(missing) = channel
            .conditions
            .iter()
            .find(|id| !condition_ids.contains(id.as_str()))
        {
            return Err(invalid(format!(
                "channels[\"{}\"].conditions: \"{missing}\" does not match any condition id",
                channel.name
            )));
        }
    }
    Ok(())
}
