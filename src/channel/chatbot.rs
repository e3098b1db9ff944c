use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};

use crate::channel::{
    ChannelCore, ChannelKind, ConfigCell, ConnectionStatus, HttpClientSlot, NotificationChannel,
    PreparedSend, parse_settings,
};
use crate::error::ChannelError;
use crate::model::NotificationMessage;
use crate::template::{TemplateKind, escape};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatbotConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base: String,
    /// `HTML`, `Markdown` or empty for plain text.
    pub parse_mode: String,
    pub messages_per_second: u32,
    pub timeout_secs: u64,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: TELEGRAM_API_BASE.into(),
            parse_mode: "HTML".into(),
            messages_per_second: 1,
            timeout_secs: 10,
        }
    }
}

impl ChatbotConfig {
    fn template_kind(&self) -> TemplateKind {
        match self.parse_mode.as_str() {
            "HTML" => TemplateKind::Html,
            "Markdown" | "MarkdownV2" => TemplateKind::Markdown,
            _ => TemplateKind::Plain,
        }
    }

    fn problem(&self) -> Option<String> {
        let missing = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        match (missing(&self.bot_token), missing(&self.chat_id)) {
            (true, true) => Some("bot_token and chat_id are not set".into()),
            (true, false) => Some("bot_token is not set".into()),
            (false, true) => Some("chat_id is not set".into()),
            (false, false) => None,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn method_url(&self, method: &str) -> Option<String> {
        let token = self.bot_token.as_deref()?;
        Some(format!(
            "{}/bot{token}/{method}",
            self.api_base.trim_end_matches('/')
        ))
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

fn quota(messages_per_second: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(messages_per_second).unwrap_or(nonzero!(1u32)))
}

/// Chat-bot delivery through the Telegram Bot API.
pub struct ChatbotChannel {
    core: ChannelCore,
    config: ConfigCell<ChatbotConfig>,
    rate_limiter: Mutex<Arc<DefaultDirectRateLimiter>>,
    client: HttpClientSlot,
}

impl ChatbotChannel {
    pub fn new(name: impl Into<String>, config: ChatbotConfig) -> Self {
        let limiter = RateLimiter::direct(quota(config.messages_per_second));
        Self {
            core: ChannelCore::new(name, true),
            config: ConfigCell::new(config),
            rate_limiter: Mutex::new(Arc::new(limiter)),
            client: HttpClientSlot::default(),
        }
    }

    pub fn from_settings(
        name: &str,
        settings: &serde_json::Value,
    ) -> Result<Self, Report<ChannelError>> {
        Ok(Self::new(name, parse_settings(settings, name)?))
    }

    fn limiter(&self) -> Arc<DefaultDirectRateLimiter> {
        Arc::clone(&self.rate_limiter.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn message_text(config: &ChatbotConfig, message: &NotificationMessage) -> String {
        let kind = config.template_kind();
        let title = escape(&message.title, kind);
        match kind {
            TemplateKind::Html => format!("<b>{title}</b>\n\n{}", message.content),
            TemplateKind::Markdown => format!("*{title}*\n\n{}", message.content),
            TemplateKind::Plain => format!("{title}\n\n{}", message.content),
        }
    }
}

impl NotificationChannel for ChatbotChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Chatbot
    }

    fn template_kind(&self) -> TemplateKind {
        self.config.snapshot().template_kind()
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
        let limiter = self.limiter();
        let delivery: BoxFuture<'a, Result<(), Report<ChannelError>>> = Box::pin(async move {
            let channel = self.name().to_string();
            let delivery_error = || ChannelError::Delivery {
                channel: channel.clone(),
            };
            let (Some(url), Some(chat_id)) = (config.method_url("sendMessage"), config.chat_id.as_deref())
            else {
                return Err(Report::new(delivery_error()).attach("credentials missing"));
            };

            limiter.until_ready().await;

            let client = self.client.get(timeout)?;
            let request = SendMessageRequest {
                chat_id,
                text: Self::message_text(&config, message),
                parse_mode: (!config.parse_mode.is_empty()).then_some(config.parse_mode.as_str()),
            };
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await
                .change_context_lazy(delivery_error)?;
            let status = response.status();
            let body: BotApiResponse = response
                .json()
                .await
                .change_context_lazy(delivery_error)
                .attach_with(|| format!("HTTP status: {status}"))?;

            if !status.is_success() || !body.ok {
                return Err(Report::new(delivery_error())
                    .attach(format!("HTTP status: {status}"))
                    .attach(body.description.unwrap_or_default()));
            }
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
            let Some(url) = config.method_url("getMe") else {
                return ConnectionStatus::failed("bot_token is not set");
            };
            let client = match self.client.get(config.timeout()) {
                Ok(client) => client,
                Err(e) => return ConnectionStatus::failed(e.to_string()),
            };
            let response = match client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => return ConnectionStatus::failed(format!("request failed: {e}")),
            };
            match response.json::<BotApiResponse>().await {
                Ok(body) if body.ok => ConnectionStatus::ok("bot token accepted"),
                Ok(body) => ConnectionStatus::failed(body.description.unwrap_or_default()),
                Err(e) => ConnectionStatus::failed(format!("unexpected response: {e}")),
            }
        })
    }

    fn update_config(&self, patch: &serde_json::Value) -> Result<(), Report<ChannelError>> {
        let previous = self.config.snapshot();
        let updated = self.config.merge(patch, self.name())?;
        // A fresh limiter forgets the tokens already spent, so keep the
        // current one unless the quota itself changed.
        if updated.messages_per_second != previous.messages_per_second {
            *self.rate_limiter.lock().unwrap_or_else(PoisonError::into_inner) =
                Arc::new(RateLimiter::direct(quota(updated.messages_per_second)));
        }
        if updated.timeout_secs != previous.timeout_secs {
            self.client.release();
        }
        Ok(())
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.client.release() {
                tracing::debug!(channel = %self.name(), "chatbot http client released");
            }
        })
    }
}
