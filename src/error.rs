use derive_more::{Display, Error};

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[display("condition {id} is already registered")]
    DuplicateCondition { id: String },
    #[display("condition {id} not found")]
    NotFound { id: String },
}

/// Failure while evaluating a single condition. Never aborts a pass.
#[derive(Debug, Display, Error)]
pub enum EvaluationError {
    #[display("indicator failed for condition {id}")]
    Indicator { id: String },
    #[display("metric {metric} is not representable as a decimal")]
    NonFiniteValue { metric: String },
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum EngineError {
    #[display("evaluation engine is not running")]
    NotRunning,
    #[display("evaluation pass cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[display("no value for template variable ${name}")]
    MissingVariable { name: String },
    #[display("template syntax error at byte {position}: {reason}")]
    Syntax { position: usize, reason: String },
    #[display("formatter {formatter} cannot format {name}")]
    Format { formatter: String, name: String },
    #[display("template {name} not found")]
    NotFound { name: String },
    #[display("template {name} already exists")]
    TemplateExists { name: String },
    #[display("template {name} is prebuilt and read-only")]
    ReadOnly { name: String },
    #[display("failed to (de)serialize templates")]
    Serialization,
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[display("channel {channel} is disabled")]
    Disabled { channel: String },
    #[display("channel {channel} is missing required configuration: {reason}")]
    ConfigInvalid { channel: String, reason: String },
    #[display("delivery through {channel} failed")]
    Delivery { channel: String },
    #[display("delivery through {channel} timed out")]
    Timeout { channel: String },
    #[display("invalid configuration for {channel}")]
    InvalidConfig { channel: String },
    #[display("unknown channel kind: {kind}")]
    UnknownKind { kind: String },
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[display("no channel named {name}")]
    UnknownChannel { name: String },
    #[display("channel {name} is already registered")]
    DuplicateChannel { name: String },
    #[display("channel operation failed")]
    Channel,
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}
