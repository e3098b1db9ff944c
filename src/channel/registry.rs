use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::{Report, bail};

use crate::channel::chatbot::ChatbotChannel;
use crate::channel::desktop::DesktopChannel;
use crate::channel::email::EmailChannel;
use crate::channel::popup::PopupChannel;
use crate::channel::{ChannelKind, NotificationChannel};
use crate::error::ChannelError;

/// Builds a channel from its name and its `settings` value.
pub type ChannelConstructor =
    fn(&str, &serde_json::Value) -> Result<Arc<dyn NotificationChannel>, Report<ChannelError>>;

/// Explicit channel-kind to constructor table, filled at process start.
pub struct ChannelRegistry {
    constructors: BTreeMap<String, ChannelConstructor>,
}

impl ChannelRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ChannelKind::Popup.as_str(), |name, settings| {
            Ok(Arc::new(PopupChannel::from_settings(name, settings)?))
        });
        registry.register(ChannelKind::Desktop.as_str(), |name, settings| {
            Ok(Arc::new(DesktopChannel::from_settings(name, settings)?))
        });
        registry.register(ChannelKind::Chatbot.as_str(), |name, settings| {
            Ok(Arc::new(ChatbotChannel::from_settings(name, settings)?))
        });
        registry.register(ChannelKind::Email.as_str(), |name, settings| {
            Ok(Arc::new(EmailChannel::from_settings(name, settings)?))
        });
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: ChannelConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn build(
        &self,
        kind: &str,
        name: &str,
        settings: &serde_json::Value,
    ) -> Result<Arc<dyn NotificationChannel>, Report<ChannelError>> {
        let Some(constructor) = self.constructors.get(kind) else {
            bail!(ChannelError::UnknownKind {
                kind: kind.to_string()
            });
        };
        constructor(name, settings)
    }
}
