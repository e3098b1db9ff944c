//! Message templates.
//!
//! Placeholders are written `$name` or `${name}`; `$$` produces a literal
//! dollar sign and a `$` not followed by an identifier is kept as-is. A
//! placeholder with no matching variable is an error
//! ([`TemplateError::MissingVariable`]), never an empty substitution.

pub mod format;
pub mod manager;

use std::collections::BTreeMap;

use error_stack::{Report, bail};

use crate::error::TemplateError;
use crate::model::{NotificationMessage, TriggerEvent};
use format::{FormatterRegistry, TemplateValue, formatter_for};
use manager::TemplateManager;

pub type Variables = BTreeMap<String, TemplateValue>;

/// Title rendered for every message, independent of the body template.
pub const TITLE_TEMPLATE: &str = "$priority_emoji $condition_name ($symbol)";

/// Variables produced by [`flatten_event`]. `meta_<key>` placeholders are
/// also accepted; they resolve against the condition's metadata.
pub const REFERENCE_VARIABLES: &[&str] = &[
    "event_id",
    "condition_id",
    "condition_name",
    "symbol",
    "priority",
    "priority_label",
    "priority_emoji",
    "satisfied",
    "value",
    "value_price",
    "value_percent",
    "details",
    "timestamp",
    "timestamp_datetime",
    "evaluation_id",
    "strategy",
    "evaluated_datetime",
];

/// Target medium of a rendered template; substituted values are escaped
/// for it, the template text itself is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateKind {
    #[default]
    Plain,
    Markdown,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Dollar,
    Placeholder(&'a str),
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn parse(text: &str) -> Result<Vec<Segment<'_>>, Report<TemplateError>> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let next = bytes.get(i + 1).copied();
        let (segment, end) = match next {
            Some(b'$') => (Segment::Dollar, i + 2),
            Some(b'{') => {
                let start = i + 2;
                let Some(len) = text[start..].find('}') else {
                    bail!(TemplateError::Syntax {
                        position: i,
                        reason: "unterminated ${".into(),
                    });
                };
                let name = &text[start..start + len];
                let valid = name.bytes().next().is_some_and(is_ident_start)
                    && name.bytes().all(is_ident);
                if !valid {
                    bail!(TemplateError::Syntax {
                        position: i,
                        reason: format!("invalid placeholder name \"{name}\""),
                    });
                }
                (Segment::Placeholder(name), start + len + 1)
            }
            Some(b) if is_ident_start(b) => {
                let start = i + 1;
                let len = bytes[start..].iter().take_while(|&&b| is_ident(b)).count();
                (Segment::Placeholder(&text[start..start + len]), start + len)
            }
            _ => {
                i += 1;
                continue;
            }
        };
        if literal_start < i {
            segments.push(Segment::Literal(&text[literal_start..i]));
        }
        segments.push(segment);
        i = end;
        literal_start = end;
    }
    if literal_start < bytes.len() {
        segments.push(Segment::Literal(&text[literal_start..]));
    }
    Ok(segments)
}

/// Placeholder names referenced by a template, in order of first use.
pub fn placeholders(text: &str) -> Result<Vec<String>, Report<TemplateError>> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse(text)? {
        if let Segment::Placeholder(name) = segment
            && !names.iter().any(|n| n == name)
        {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Escape a substituted value for the target medium.
pub fn escape(value: &str, kind: TemplateKind) -> String {
    match kind {
        TemplateKind::Plain => value.to_string(),
        TemplateKind::Html => {
            let mut out = String::with_capacity(value.len());
            for ch in value.chars() {
                match ch {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    '"' => out.push_str("&quot;"),
                    '\'' => out.push_str("&#39;"),
                    other => out.push(other),
                }
            }
            out
        }
        TemplateKind::Markdown => {
            let mut out = String::with_capacity(value.len());
            for ch in value.chars() {
                if matches!(ch, '_' | '*' | '`' | '[') {
                    out.push('\\');
                }
                out.push(ch);
            }
            out
        }
    }
}

/// Result of [`TemplateEngine::validate_template`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValidation {
    pub valid: bool,
    pub placeholders: Vec<String>,
    pub unknown: Vec<String>,
    pub syntax_error: Option<String>,
}

/// Flatten a trigger event into template variables.
pub fn flatten_event(event: &TriggerEvent) -> Variables {
    let mut vars = Variables::new();
    let mut set = |key: &str, value: TemplateValue| {
        vars.insert(key.to_string(), value);
    };
    set("event_id", event.event_id.to_string().into());
    set("condition_id", event.condition_id.to_string().into());
    set("condition_name", event.condition_name.clone().into());
    set("symbol", event.symbol.clone().into());
    set("priority", event.priority.level().into());
    set("priority_label", event.priority.label().into());
    set("priority_emoji", event.priority.level().into());
    set("satisfied", event.result.satisfied.into());
    set("value", event.result.value.into());
    set("value_price", event.result.value.into());
    set("value_percent", event.result.value.into());
    set("details", event.result.details.clone().into());
    set("timestamp", event.timestamp.into());
    set("timestamp_datetime", event.timestamp.into());
    set("evaluation_id", event.context.evaluation_id.to_string().into());
    set("strategy", event.context.strategy.as_str().into());
    set("evaluated_datetime", event.context.timestamp.into());
    for (key, value) in &event.metadata {
        vars.insert(format!("meta_{key}"), value.clone().into());
    }
    vars
}

/// Renders templates and trigger events.
#[derive(Default)]
pub struct TemplateEngine {
    formatters: FormatterRegistry,
    templates: TemplateManager,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn templates(&self) -> &TemplateManager {
        &self.templates
    }

    /// Substitute every placeholder in `text` from `variables`.
    pub fn render_template(
        &self,
        text: &str,
        variables: &Variables,
        kind: TemplateKind,
    ) -> Result<String, Report<TemplateError>> {
        let mut out = String::with_capacity(text.len());
        for segment in parse(text)? {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Dollar => out.push('$'),
                Segment::Placeholder(name) => {
                    let value = variables.get(name).ok_or_else(|| {
                        Report::new(TemplateError::MissingVariable {
                            name: name.to_string(),
                        })
                    })?;
                    let rendered = self.format_value(name, value)?;
                    out.push_str(&escape(&rendered, kind));
                }
            }
        }
        Ok(out)
    }

    fn format_value(
        &self,
        name: &str,
        value: &TemplateValue,
    ) -> Result<String, Report<TemplateError>> {
        let Some(formatter_name) = formatter_for(name) else {
            return Ok(value.to_string());
        };
        let Some(formatter) = self.formatters.get(formatter_name) else {
            return Ok(value.to_string());
        };
        formatter(value).ok_or_else(|| {
            Report::new(TemplateError::Format {
                formatter: formatter_name.to_string(),
                name: name.to_string(),
            })
            .attach(format!("value: {value}"))
        })
    }

    /// Render the registered template `template_name` for `event`.
    pub fn render_trigger_event(
        &self,
        template_name: &str,
        event: &TriggerEvent,
        kind: TemplateKind,
    ) -> Result<String, Report<TemplateError>> {
        let template = self.templates.get(template_name).ok_or_else(|| {
            Report::new(TemplateError::NotFound {
                name: template_name.to_string(),
            })
        })?;
        self.render_template(&template.text, &flatten_event(event), kind)
    }

    /// Render title and body of `event` into a message for `channel`.
    pub fn build_message(
        &self,
        template_name: &str,
        event: &TriggerEvent,
        channel: &str,
        kind: TemplateKind,
    ) -> Result<NotificationMessage, Report<TemplateError>> {
        let variables = flatten_event(event);
        let template = self.templates.get(template_name).ok_or_else(|| {
            Report::new(TemplateError::NotFound {
                name: template_name.to_string(),
            })
        })?;
        let title = self.render_template(TITLE_TEMPLATE, &variables, TemplateKind::Plain)?;
        let content = self.render_template(&template.text, &variables, kind)?;
        Ok(NotificationMessage::new(channel, title, content, event.priority).for_event(event.event_id))
    }

    /// Check that `text` parses and only references known variables.
    /// No formatter runs.
    pub fn validate_template(&self, text: &str) -> TemplateValidation {
        match placeholders(text) {
            Ok(names) => {
                let unknown: Vec<String> = names
                    .iter()
                    .filter(|n| !n.starts_with("meta_") && !REFERENCE_VARIABLES.contains(&n.as_str()))
                    .cloned()
                    .collect();
                TemplateValidation {
                    valid: unknown.is_empty(),
                    placeholders: names,
                    unknown,
                    syntax_error: None,
                }
            }
            Err(report) => TemplateValidation {
                valid: false,
                placeholders: Vec::new(),
                unknown: Vec::new(),
                syntax_error: Some(report.current_context().to_string()),
            },
        }
    }
}
