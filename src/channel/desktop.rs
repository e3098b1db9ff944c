use std::path::PathBuf;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::channel::{
    ChannelCore, ChannelKind, ConfigCell, ConnectionStatus, NotificationChannel, PreparedSend,
    parse_settings,
};
use crate::error::ChannelError;
use crate::model::{NotificationMessage, Priority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// Notifier executable, looked up on `PATH` unless absolute.
    pub command: String,
    pub app_name: String,
    /// How long the notification stays visible, in milliseconds.
    pub expire_ms: u64,
    pub timeout_secs: u64,
}

impl DesktopConfig {
    fn problem(&self) -> Option<String> {
        self.command.trim().is_empty().then(|| "command is empty".into())
    }
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            command: "notify-send".into(),
            app_name: "alert-dispatch".into(),
            expire_ms: 10_000,
            timeout_secs: 5,
        }
    }
}

/// Native desktop notification through a notifier command.
pub struct DesktopChannel {
    core: ChannelCore,
    config: ConfigCell<DesktopConfig>,
}

impl DesktopChannel {
    pub fn new(name: impl Into<String>, config: DesktopConfig) -> Self {
        Self {
            core: ChannelCore::new(name, true),
            config: ConfigCell::new(config),
        }
    }

    pub fn from_settings(
        name: &str,
        settings: &serde_json::Value,
    ) -> Result<Self, Report<ChannelError>> {
        Ok(Self::new(name, parse_settings(settings, name)?))
    }
}

fn urgency(priority: Priority) -> &'static str {
    match priority.level() {
        1 | 2 => "low",
        3 => "normal",
        _ => "critical",
    }
}

fn notifier_args(config: &DesktopConfig, message: &NotificationMessage) -> Vec<String> {
    vec![
        format!("--app-name={}", config.app_name),
        format!("--urgency={}", urgency(message.priority)),
        format!("--expire-time={}", config.expire_ms),
        message.title.clone(),
        message.content.clone(),
    ]
}

/// Resolve `command` against `PATH` the way a shell would.
fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

impl NotificationChannel for DesktopChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Desktop
    }

    fn config_problem(&self) -> Option<String> {
        self.config.snapshot().problem()
    }

    fn prepare<'a>(&'a self, message: &'a NotificationMessage) -> Result<PreparedSend<'a>, String> {
        let config = self.config.snapshot();
        if let Some(problem) = config.problem() {
            return Err(problem);
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        let delivery: BoxFuture<'a, Result<(), Report<ChannelError>>> = Box::pin(async move {
            let channel = self.name().to_string();
            let output = Command::new(&config.command)
                .args(notifier_args(&config, message))
                .kill_on_drop(true)
                .output()
                .await
                .change_context_lazy(|| ChannelError::Delivery {
                    channel: channel.clone(),
                })
                .attach_with(|| format!("command: {}", config.command))?;

            if !output.status.success() {
                return Err(Report::new(ChannelError::Delivery { channel })
                    .attach(format!("exit status: {}", output.status))
                    .attach(String::from_utf8_lossy(&output.stderr).trim().to_string()));
            }
            Ok(())
        });
        Ok(PreparedSend::new(timeout, delivery))
    }

    fn test_connection(&self) -> BoxFuture<'_, ConnectionStatus> {
        let config = self.config.snapshot();
        Box::pin(async move {
            match find_executable(&config.command) {
                Some(path) => ConnectionStatus::ok(format!("notifier found at {}", path.display())),
                None => ConnectionStatus::failed(format!("{} not found on PATH", config.command)),
            }
        })
    }

    fn update_config(&self, patch: &serde_json::Value) -> Result<(), Report<ChannelError>> {
        self.config.merge(patch, self.name()).map(|_| ())
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
