use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::channel::{
    ChannelCore, ChannelKind, ConfigCell, ConnectionStatus, HttpClientSlot, NotificationChannel,
    PreparedSend, parse_settings,
};
use crate::error::ChannelError;
use crate::model::NotificationMessage;
use crate::template::TemplateKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Endpoint of the JSON mail relay.
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject_prefix: String,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            from: None,
            to: Vec::new(),
            subject_prefix: "[alert]".into(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: String,
    html: &'a str,
}

/// Email delivery through an HTTP mail relay (`POST` of a JSON message with
/// a bearer key).
pub struct EmailChannel {
    core: ChannelCore,
    config: ConfigCell<EmailConfig>,
    client: HttpClientSlot,
}

impl EmailChannel {
    pub fn new(name: impl Into<String>, config: EmailConfig) -> Self {
        Self {
            core: ChannelCore::new(name, true),
            config: ConfigCell::new(config),
            client: HttpClientSlot::default(),
        }
    }

    pub fn from_settings(
        name: &str,
        settings: &serde_json::Value,
    ) -> Result<Self, Report<ChannelError>> {
        Ok(Self::new(name, parse_settings(settings, name)?))
    }
}

impl EmailConfig {
    fn problem(&self) -> Option<String> {
        let mut missing = Vec::new();
        if blank(&self.api_url) {
            missing.push("api_url");
        }
        if blank(&self.api_key) {
            missing.push("api_key");
        }
        if blank(&self.from) {
            missing.push("from");
        }
        if self.to.iter().all(|r| r.trim().is_empty()) {
            missing.push("to");
        }
        (!missing.is_empty()).then(|| format!("missing {}", missing.join(", ")))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn subject(config: &EmailConfig, message: &NotificationMessage) -> String {
    if config.subject_prefix.is_empty() {
        message.title.clone()
    } else {
        format!("{} {}", config.subject_prefix, message.title)
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|s| s.trim().is_empty())
}

impl NotificationChannel for EmailChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn template_kind(&self) -> TemplateKind {
        TemplateKind::Html
    }

    fn config_problem(&self) -> Option<String> {
        self.config.snapshot().problem()
    }

    fn prepare<'a>(&'a self, message: &'a NotificationMessage) -> Result<PreparedSend<'a>, String> {
        let config = self.config.snapshot();
        if let Some(problem) = config.problem() {
            return Err(problem);
        }
        let timeout = config.timeout();
        let delivery: BoxFuture<'a, Result<(), Report<ChannelError>>> = Box::pin(async move {
            let channel = self.name().to_string();
            let delivery_error = || ChannelError::Delivery {
                channel: channel.clone(),
            };
            let (Some(url), Some(key), Some(from)) = (
                config.api_url.as_deref(),
                config.api_key.as_deref(),
                config.from.as_deref(),
            ) else {
                return Err(Report::new(delivery_error()).attach("relay settings missing"));
            };

            let client = self.client.get(timeout)?;
            let request = RelayRequest {
                from,
                to: &config.to,
                subject: subject(&config, message),
                html: &message.content,
            };
            let response = client
                .post(url)
                .bearer_auth(key)
                .json(&request)
                .send()
                .await
                .change_context_lazy(delivery_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Report::new(delivery_error())
                    .attach(format!("HTTP status: {status}"))
                    .attach(body));
            }
            tracing::debug!(channel = %channel, recipients = config.to.len(), "email relayed");
            Ok(())
        });
        Ok(PreparedSend::new(timeout, delivery))
    }

    fn test_connection(&self) -> BoxFuture<'_, ConnectionStatus> {
        let config = self.config.snapshot();
        Box::pin(async move {
            if let Some(problem) = config.problem() {
                return ConnectionStatus::failed(problem);
            }
            let Some(url) = config.api_url.as_deref() else {
                return ConnectionStatus::failed("api_url is not set");
            };
            let client = match self.client.get(config.timeout()) {
                Ok(client) => client,
                Err(e) => return ConnectionStatus::failed(e.to_string()),
            };
            // Any HTTP answer proves the relay is reachable.
            match client.head(url).send().await {
                Ok(response) => ConnectionStatus::ok(format!("relay answered {}", response.status())),
                Err(e) => ConnectionStatus::failed(format!("relay unreachable: {e}")),
            }
        })
    }

    fn update_config(&self, patch: &serde_json::Value) -> Result<(), Report<ChannelError>> {
        self.config.merge(patch, self.name())?;
        self.client.release();
        Ok(())
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.client.release();
        })
    }
}
