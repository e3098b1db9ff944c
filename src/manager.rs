use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use error_stack::{Report, ResultExt, bail};
use futures::FutureExt;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::registry::ChannelRegistry;
use crate::channel::{ChannelStatistics, ChannelStats, ConnectionStatus, NotificationChannel};
use crate::config::AppConfig;
use crate::error::{ConfigError, ManagerError};
use crate::model::{ConditionId, Priority, TriggerEvent};
use crate::storage::{DeliveryRecord, Storage};
use crate::template::TemplateEngine;

/// Which events a channel receives and how they are rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRoute {
    pub min_priority: Priority,
    /// Empty means every condition.
    pub conditions: Vec<ConditionId>,
    pub template: String,
}

impl Default for ChannelRoute {
    fn default() -> Self {
        Self {
            min_priority: Priority::LOW,
            conditions: Vec::new(),
            template: "default".into(),
        }
    }
}

impl ChannelRoute {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        event.priority >= self.min_priority
            && (self.conditions.is_empty() || self.conditions.contains(&event.condition_id))
    }
}

#[derive(Clone)]
struct RoutedChannel {
    channel: Arc<dyn NotificationChannel>,
    route: ChannelRoute,
}

/// Result of sending one event through one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub event_id: Uuid,
    pub channel: String,
    pub message_id: Option<Uuid>,
    pub success: bool,
    pub error: Option<String>,
}

impl DeliveryResult {
    fn to_record(&self) -> DeliveryRecord {
        DeliveryRecord {
            event_id: self.event_id,
            message_id: self.message_id,
            channel: self.channel.clone(),
            success: self.success,
            error: self.error.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    /// Grouped by event in dispatch order, then by channel registration order.
    pub deliveries: Vec<DeliveryResult>,
    /// Set when `shutdown` interrupted the dispatch.
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn successful(&self) -> usize {
        self.deliveries.iter().filter(|d| d.success).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.successful()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatistics {
    pub channels: Vec<ChannelStatistics>,
    pub totals: ChannelStats,
}

/// Routes trigger events to channels and aggregates their statistics.
pub struct NotificationManager {
    channels: RwLock<Vec<RoutedChannel>>,
    templates: Arc<TemplateEngine>,
    storage: Option<Arc<dyn Storage>>,
    cancel: CancellationToken,
}

impl NotificationManager {
    pub fn new(templates: Arc<TemplateEngine>) -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            templates,
            storage: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Record trigger events and delivery results in `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the manager and its channels from `[[channels]]`.
    pub fn from_config(
        config: &AppConfig,
        registry: &ChannelRegistry,
        templates: Arc<TemplateEngine>,
    ) -> Result<Self, Report<ConfigError>> {
        let manager = Self::new(templates);
        for entry in &config.channels {
            let field = |what: &str| ConfigError::Validation {
                field: format!("channels[\"{}\"].{what}", entry.name),
            };
            let settings = serde_json::to_value(&entry.settings).change_context(field("settings"))?;
            let channel = registry
                .build(&entry.kind, &entry.name, &settings)
                .change_context(field("settings"))?;
            if !entry.enabled {
                channel.disable();
            }
            let min_priority = Priority::new(entry.min_priority)
                .ok_or_else(|| Report::new(field("min_priority")))?;
            let route = ChannelRoute {
                min_priority,
                conditions: entry.conditions.iter().map(|id| ConditionId::from(id.as_str())).collect(),
                template: entry.template.clone(),
            };
            manager
                .add_channel(channel, route)
                .change_context(field("name"))?;
        }
        Ok(manager)
    }

    pub fn add_channel(
        &self,
        channel: Arc<dyn NotificationChannel>,
        route: ChannelRoute,
    ) -> Result<(), Report<ManagerError>> {
        let mut channels = self.write_channels();
        if channels.iter().any(|c| c.channel.name() == channel.name()) {
            bail!(ManagerError::DuplicateChannel {
                name: channel.name().to_string()
            });
        }
        info!(
            channel = %channel.name(),
            kind = %channel.kind(),
            enabled = channel.is_enabled(),
            config_valid = channel.is_config_valid(),
            template = %route.template,
            "channel added"
        );
        channels.push(RoutedChannel { channel, route });
        Ok(())
    }

    /// Remove a channel. Sends already in flight on it still complete.
    pub fn remove_channel(&self, name: &str) -> Result<Arc<dyn NotificationChannel>, Report<ManagerError>> {
        let mut channels = self.write_channels();
        let Some(index) = channels.iter().position(|c| c.channel.name() == name) else {
            bail!(unknown(name));
        };
        Ok(channels.remove(index).channel)
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn NotificationChannel>> {
        self.read_channels()
            .iter()
            .find(|c| c.channel.name() == name)
            .map(|c| Arc::clone(&c.channel))
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.read_channels()
            .iter()
            .map(|c| c.channel.name().to_string())
            .collect()
    }

    fn require(&self, name: &str) -> Result<Arc<dyn NotificationChannel>, Report<ManagerError>> {
        self.channel(name).ok_or_else(|| Report::new(unknown(name)))
    }

    pub fn enable_channel(&self, name: &str) -> Result<(), Report<ManagerError>> {
        self.require(name)?.enable();
        info!(channel = name, "channel enabled");
        Ok(())
    }

    pub fn disable_channel(&self, name: &str) -> Result<(), Report<ManagerError>> {
        self.require(name)?.disable();
        info!(channel = name, "channel disabled");
        Ok(())
    }

    pub fn update_channel_config(
        &self,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Report<ManagerError>> {
        self.require(name)?
            .update_config(patch)
            .change_context(ManagerError::Channel)?;
        info!(channel = name, "channel config updated");
        Ok(())
    }

    pub async fn test_channel(&self, name: &str) -> Result<ConnectionStatus, Report<ManagerError>> {
        let channel = self.require(name)?;
        Ok(channel.test_connection().await)
    }

    /// Connection status of every channel, in registration order.
    pub async fn test_all(&self) -> Vec<(String, ConnectionStatus)> {
        let channels = self.snapshot();
        let checks = channels.iter().map(|c| async move {
            (c.channel.name().to_string(), c.channel.test_connection().await)
        });
        join_all(checks).await
    }

    pub fn channel_statistics(&self, name: &str) -> Result<ChannelStatistics, Report<ManagerError>> {
        Ok(self.require(name)?.statistics())
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let channels: Vec<ChannelStatistics> =
            self.read_channels().iter().map(|c| c.channel.statistics()).collect();
        let mut totals = ChannelStats::default();
        for channel in &channels {
            totals += channel.stats;
        }
        ManagerStatistics { channels, totals }
    }

    pub fn reset_statistics(&self) {
        for entry in self.read_channels().iter() {
            entry.channel.reset_statistics();
        }
    }

    /// Cancel in-flight and future dispatches.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Release every channel's resources.
    pub async fn cleanup(&self) {
        let channels = self.snapshot();
        join_all(channels.iter().map(|c| c.channel.cleanup())).await;
        debug!(channels = channels.len(), "channels cleaned up");
    }

    /// Deliver `events` to every channel whose route matches them.
    ///
    /// Channels run concurrently and independently of each other. Each
    /// channel receives its events one at a time in the order given, so a
    /// slow channel only delays itself. On `shutdown` the sends still in
    /// flight are dropped and the ones already finished are kept.
    pub async fn dispatch(&self, events: &[TriggerEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let channels = self.snapshot();
        // Per channel, the positions of the events its route accepts.
        let lanes: Vec<Vec<usize>> = channels
            .iter()
            .map(|c| {
                (0..events.len())
                    .filter(|&position| c.route.matches(&events[position]))
                    .collect()
            })
            .collect();

        for (position, event) in events.iter().enumerate() {
            self.audit_trigger(event).await;
            if !lanes.iter().any(|lane| lane.contains(&position)) {
                debug!(event_id = %event.event_id, condition = %event.condition_id, "no channel routes this event");
            }
        }

        let mut cursors = vec![0usize; lanes.len()];
        let mut in_flight = FuturesUnordered::new();
        for (lane, positions) in lanes.iter().enumerate() {
            if let Some(&position) = positions.first() {
                in_flight.push(self.send_in_lane(lane, &channels[lane], position, &events[position]));
            }
        }

        let mut finished = Vec::new();
        loop {
            let next = tokio::select! {
                next = in_flight.next() => next,
                _ = self.cancel.cancelled() => {
                    while let Some(Some(done)) = in_flight.next().now_or_never() {
                        finished.push(done);
                    }
                    warn!(dropped = in_flight.len(), "dispatch cancelled with sends in flight");
                    report.cancelled = true;
                    break;
                }
            };
            let Some((lane, position, result)) = next else {
                break;
            };
            finished.push((lane, position, result));

            cursors[lane] += 1;
            if let Some(&position) = lanes[lane].get(cursors[lane]) {
                in_flight.push(self.send_in_lane(lane, &channels[lane], position, &events[position]));
            }
        }
        drop(in_flight);

        finished.sort_by_key(|(lane, position, _)| (*position, *lane));
        for (_, _, result) in finished {
            self.audit_delivery(&result).await;
            report.deliveries.push(result);
        }

        if !report.deliveries.is_empty() {
            info!(
                events = events.len(),
                successful = report.successful(),
                failed = report.failed(),
                cancelled = report.cancelled,
                "dispatch complete"
            );
        }
        report
    }

    async fn send_in_lane(
        &self,
        lane: usize,
        target: &RoutedChannel,
        position: usize,
        event: &TriggerEvent,
    ) -> (usize, usize, DeliveryResult) {
        (lane, position, self.send_one(target, event).await)
    }

    async fn send_one(&self, target: &RoutedChannel, event: &TriggerEvent) -> DeliveryResult {
        let channel = &target.channel;
        let failed = |error: String| DeliveryResult {
            event_id: event.event_id,
            channel: channel.name().to_string(),
            message_id: None,
            success: false,
            error: Some(error),
        };

        let message = match self.templates.build_message(
            &target.route.template,
            event,
            channel.name(),
            channel.template_kind(),
        ) {
            Ok(message) => message,
            Err(report) => {
                channel.core().record_failure();
                warn!(channel = %channel.name(), template = %target.route.template, error = ?report, "render failed");
                return failed(report.current_context().to_string());
            }
        };

        match channel.send(&message).await {
            Ok(delivery) => DeliveryResult {
                event_id: event.event_id,
                channel: delivery.channel,
                message_id: Some(delivery.message_id),
                success: true,
                error: None,
            },
            Err(report) => {
                warn!(channel = %channel.name(), event_id = %event.event_id, error = ?report, "send failed");
                DeliveryResult {
                    message_id: Some(message.message_id),
                    ..failed(report.current_context().to_string())
                }
            }
        }
    }

    async fn audit_trigger(&self, event: &TriggerEvent) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.record_trigger(event).await
        {
            warn!(event_id = %event.event_id, error = ?e, "failed to record trigger event");
        }
    }

    async fn audit_delivery(&self, result: &DeliveryResult) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.record_delivery(&result.to_record()).await
        {
            warn!(channel = %result.channel, error = ?e, "failed to record delivery");
        }
    }

    fn snapshot(&self) -> Vec<RoutedChannel> {
        self.read_channels().clone()
    }

    fn read_channels(&self) -> std::sync::RwLockReadGuard<'_, Vec<RoutedChannel>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_channels(&self) -> std::sync::RwLockWriteGuard<'_, Vec<RoutedChannel>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown(name: &str) -> ManagerError {
    ManagerError::UnknownChannel {
        name: name.to_string(),
    }
}
