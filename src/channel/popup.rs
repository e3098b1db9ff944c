use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use error_stack::Report;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::channel::{
    ChannelCore, ChannelKind, ConfigCell, ConnectionStatus, DEFAULT_SEND_TIMEOUT,
    NotificationChannel, PreparedSend, parse_settings,
};
use crate::error::ChannelError;
use crate::model::NotificationMessage;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopupConfig {
    /// Content longer than this many characters is cut and ends in "...".
    pub max_length: usize,
    pub max_history: usize,
}

impl PopupConfig {
    fn problem(&self) -> Option<String> {
        (self.max_length == 0).then(|| "max_length must be positive".into())
    }
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            max_length: 200,
            max_history: 100,
        }
    }
}

/// In-app popup: messages go to in-process subscribers (the presentation
/// layer) and to a bounded history.
pub struct PopupChannel {
    core: ChannelCore,
    config: ConfigCell<PopupConfig>,
    sender: broadcast::Sender<NotificationMessage>,
    history: Mutex<VecDeque<NotificationMessage>>,
}

impl PopupChannel {
    pub fn new(name: impl Into<String>, config: PopupConfig) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            core: ChannelCore::new(name, true),
            config: ConfigCell::new(config),
            sender,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_settings(
        name: &str,
        settings: &serde_json::Value,
    ) -> Result<Self, Report<ChannelError>> {
        Ok(Self::new(name, parse_settings(settings, name)?))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationMessage> {
        self.sender.subscribe()
    }

    /// Most recent messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<NotificationMessage> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

/// Cut `content` to at most `max_length` characters, the last three being
/// "..." when anything was removed.
pub fn truncate(content: &str, max_length: usize) -> String {
    if content.chars().count() <= max_length {
        return content.to_string();
    }
    let keep = max_length.saturating_sub(3);
    let mut out: String = content.chars().take(keep).collect();
    out.push_str(&"..."[..max_length.min(3)]);
    out
}

impl NotificationChannel for PopupChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Popup
    }

    fn config_problem(&self) -> Option<String> {
        self.config.snapshot().problem()
    }

    fn prepare<'a>(&'a self, message: &'a NotificationMessage) -> Result<PreparedSend<'a>, String> {
        let config = self.config.snapshot();
        if let Some(problem) = config.problem() {
            return Err(problem);
        }
        let delivery: BoxFuture<'a, Result<(), Report<ChannelError>>> = Box::pin(async move {
            let mut shown = message.clone();
            shown.content = truncate(&message.content, config.max_length);

            {
                let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
                history.push_back(shown.clone());
                while history.len() > config.max_history {
                    history.pop_front();
                }
            }

            // No subscriber is not an error; the history still holds it.
            let receivers = self.sender.send(shown).unwrap_or(0);
            tracing::debug!(channel = %self.name(), receivers, "popup shown");
            Ok(())
        });
        Ok(PreparedSend::new(DEFAULT_SEND_TIMEOUT, delivery))
    }

    fn test_connection(&self) -> BoxFuture<'_, ConnectionStatus> {
        Box::pin(async move {
            ConnectionStatus::ok(format!(
                "popup ready, {} subscriber(s)",
                self.sender.receiver_count()
            ))
        })
    }

    fn update_config(&self, patch: &serde_json::Value) -> Result<(), Report<ChannelError>> {
        let updated = self.config.merge(patch, self.name())?;
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() > updated.max_history {
            history.pop_front();
        }
        Ok(())
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    fn message(content: &str) -> NotificationMessage {
        NotificationMessage::new("popup", "title", content, Priority::NORMAL)
    }

    #[test]
    fn truncate_respects_max_length() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("hello world", 8).chars().count(), 8);
        assert_eq!(truncate("héllo wörld", 6), "hél...");
        assert_eq!(truncate("hello", 2), "..");
    }

    #[tokio::test]
    async fn subscribers_receive_truncated_content() {
        let channel = PopupChannel::new(
            "popup",
            PopupConfig {
                max_length: 10,
                ..PopupConfig::default()
            },
        );
        let mut rx = channel.subscribe();
        channel
            .send(&message("a very long notification body"))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.content, "a very ...");
        assert_eq!(channel.statistics().stats.successful, 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let channel = PopupChannel::new(
            "popup",
            PopupConfig {
                max_history: 3,
                ..PopupConfig::default()
            },
        );
        for i in 0..5 {
            channel.send(&message(&format!("m{i}"))).await.unwrap();
        }
        let recent: Vec<String> = channel.recent(10).into_iter().map(|m| m.content).collect();
        assert_eq!(recent, vec!["m2", "m3", "m4"]);
        assert_eq!(channel.recent(1)[0].content, "m4");
    }

    #[tokio::test]
    async fn update_config_applies_to_next_send() {
        let channel = PopupChannel::new("popup", PopupConfig::default());
        channel
            .update_config(&serde_json::json!({ "max_length": 5 }))
            .unwrap();
        channel.send(&message("abcdefghij")).await.unwrap();
        assert_eq!(channel.recent(1)[0].content, "ab...");
        assert!(
            channel
                .update_config(&serde_json::json!({ "max_length": -1 }))
                .is_err()
        );
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let channel = PopupChannel::new("popup", PopupConfig::default());
        channel.send(&message("hi")).await.unwrap();
        let before = channel.statistics();
        channel.cleanup().await;
        channel.cleanup().await;
        assert!(channel.recent(10).is_empty());
        assert_eq!(channel.statistics(), before);
    }

    #[tokio::test]
    async fn test_connection_always_succeeds() {
        let channel = PopupChannel::new("popup", PopupConfig::default());
        assert!(channel.test_connection().await.ok);
    }
}
