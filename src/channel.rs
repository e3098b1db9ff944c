pub mod chatbot;
pub mod desktop;
pub mod email;
pub mod popup;
pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt, bail};
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::model::NotificationMessage;
use crate::template::TemplateKind;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Popup,
    Desktop,
    Chatbot,
    Email,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [Self::Popup, Self::Desktop, Self::Chatbot, Self::Email];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "popup" => Some(Self::Popup),
            "desktop" => Some(Self::Desktop),
            "chatbot" => Some(Self::Chatbot),
            "email" => Some(Self::Email),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Popup => "popup",
            Self::Desktop => "desktop",
            Self::Chatbot => "chatbot",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery counters. Always updated together so that
/// `total_sent == successful + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub total_sent: u64,
    pub successful: u64,
    pub failed: u64,
}

impl ChannelStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_sent == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_sent as f64 * 100.0
    }
}

impl std::ops::AddAssign for ChannelStats {
    fn add_assign(&mut self, rhs: Self) {
        self.total_sent += rhs.total_sent;
        self.successful += rhs.successful;
        self.failed += rhs.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub stats: ChannelStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub message: String,
}

impl ConnectionStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Successful delivery of one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub channel: String,
    pub message_id: Uuid,
    pub delivered_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// A delivery bound to the configuration it was prepared with.
pub struct PreparedSend<'a> {
    pub timeout: Duration,
    pub delivery: BoxFuture<'a, Result<(), Report<ChannelError>>>,
}

impl<'a> PreparedSend<'a> {
    pub fn new(timeout: Duration, delivery: BoxFuture<'a, Result<(), Report<ChannelError>>>) -> Self {
        Self { timeout, delivery }
    }
}

/// State every channel carries: its name, the enabled flag and counters.
#[derive(Debug)]
pub struct ChannelCore {
    name: String,
    enabled: AtomicBool,
    stats: Mutex<ChannelStats>,
}

impl ChannelCore {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(enabled),
            stats: Mutex::new(ChannelStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_success(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total_sent += 1;
        stats.successful += 1;
    }

    pub fn record_failure(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total_sent += 1;
        stats.failed += 1;
    }

    pub fn stats(&self) -> ChannelStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = ChannelStats::default();
    }
}

/// A delivery mechanism for rendered notification messages.
///
/// Implementors provide `prepare` and the channel-specific hooks; the
/// provided `send` wraps the prepared delivery with the enabled check, its
/// timeout and the statistics bookkeeping. Uses `BoxFuture` to keep the
/// trait object-safe (`dyn NotificationChannel`).
pub trait NotificationChannel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    fn kind(&self) -> ChannelKind;

    /// Medium the channel's content is rendered for.
    fn template_kind(&self) -> TemplateKind {
        TemplateKind::Plain
    }

    /// Why the current configuration cannot deliver, if it cannot.
    fn config_problem(&self) -> Option<String>;

    /// Take one configuration snapshot and bind the delivery of `message`
    /// to it, or return why that snapshot cannot deliver. Called only by
    /// `send`.
    fn prepare<'a>(&'a self, message: &'a NotificationMessage) -> Result<PreparedSend<'a>, String>;

    /// Cheapest possible liveness check.
    fn test_connection(&self) -> BoxFuture<'_, ConnectionStatus>;

    /// Merge `patch` into the current configuration. A send already in
    /// progress keeps the configuration it started with.
    fn update_config(&self, patch: &serde_json::Value) -> Result<(), Report<ChannelError>>;

    /// Release held resources. Safe to call repeatedly.
    fn cleanup(&self) -> BoxFuture<'_, ()>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn enable(&self) {
        self.core().enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.core().enabled.store(false, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.core().enabled.load(Ordering::SeqCst)
    }

    fn is_config_valid(&self) -> bool {
        self.config_problem().is_none()
    }

    fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            name: self.name().to_string(),
            kind: self.kind(),
            enabled: self.is_enabled(),
            stats: self.core().stats(),
        }
    }

    fn reset_statistics(&self) {
        self.core().reset();
    }

    /// Deliver `message`, recording exactly one outcome in the statistics.
    fn send<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> BoxFuture<'a, Result<Delivery, Report<ChannelError>>> {
        Box::pin(async move {
            let core = self.core();
            let channel = core.name().to_string();

            if !self.is_enabled() {
                core.record_failure();
                bail!(ChannelError::Disabled { channel });
            }
            let prepared = match self.prepare(message) {
                Ok(prepared) => prepared,
                Err(reason) => {
                    core.record_failure();
                    bail!(ChannelError::ConfigInvalid { channel, reason });
                }
            };
            let timeout = prepared.timeout;

            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, prepared.delivery).await;
            match outcome {
                Ok(Ok(())) => {
                    core.record_success();
                    let elapsed = started.elapsed();
                    tracing::debug!(
                        channel = %channel,
                        message_id = %message.message_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "message delivered"
                    );
                    Ok(Delivery {
                        channel,
                        message_id: message.message_id,
                        delivered_at: Utc::now(),
                        elapsed,
                    })
                }
                Ok(Err(report)) => {
                    core.record_failure();
                    Err(report.attach(format!("message_id: {}", message.message_id)))
                }
                Err(_) => {
                    core.record_failure();
                    Err(Report::new(ChannelError::Timeout { channel })
                        .attach(format!("timeout: {timeout:?}")))
                }
            }
        })
    }
}

/// Live configuration of a channel. Readers take an `Arc` snapshot; updates
/// swap in a new value.
#[derive(Debug)]
pub struct ConfigCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> ConfigCell<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(config: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<T> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Shallow-merge the object `patch` over the current configuration and
    /// swap in the result. Nothing changes when the merged value does not
    /// deserialize.
    pub fn merge(&self, patch: &serde_json::Value, channel: &str) -> Result<Arc<T>, Report<ChannelError>> {
        let invalid = || ChannelError::InvalidConfig {
            channel: channel.to_string(),
        };
        let Some(patch) = patch.as_object() else {
            bail!(invalid());
        };
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut merged = serde_json::to_value(guard.as_ref()).change_context_lazy(invalid)?;
        let Some(target) = merged.as_object_mut() else {
            bail!(invalid());
        };
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
        let updated: T = serde_json::from_value(merged)
            .change_context_lazy(invalid)
            .attach_with(|| format!("patch keys: {:?}", patch.keys().collect::<Vec<_>>()))?;
        let updated = Arc::new(updated);
        *guard = Arc::clone(&updated);
        Ok(updated)
    }
}

/// Parse constructor settings; a `null` value means "all defaults".
pub fn parse_settings<T>(settings: &serde_json::Value, channel: &str) -> Result<T, Report<ChannelError>>
where
    T: DeserializeOwned,
{
    let value = if settings.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        settings.clone()
    };
    serde_json::from_value(value).change_context(ChannelError::InvalidConfig {
        channel: channel.to_string(),
    })
}

/// Lazily built HTTP client that `cleanup` can drop.
#[derive(Debug, Default)]
pub struct HttpClientSlot {
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpClientSlot {
    pub fn get(&self, timeout: Duration) -> Result<reqwest::Client, Report<ChannelError>> {
        let mut slot = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(ChannelError::Delivery {
                channel: "http".into(),
            })?;
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn release(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}
