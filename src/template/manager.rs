use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use error_stack::{Report, ResultExt, bail};
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;
use crate::template::placeholders;

const PREBUILT: &[(&str, &str, &str)] = &[
    (
        "default",
        "Generic trigger notification",
        "$priority_emoji $condition_name\n\
         Symbol: $symbol\n\
         Value: $value\n\
         $details\n\
         Time: $timestamp_datetime",
    ),
    (
        "price_alert",
        "Price threshold crossed",
        "$priority_emoji $symbol price alert\n\
         $condition_name\n\
         Price: $value_price\n\
         Time: $timestamp_datetime",
    ),
    (
        "market_alert",
        "24h market statistics alert",
        "$priority_emoji $symbol market alert\n\
         $condition_name\n\
         Value: $value_percent\n\
         $details\n\
         Time: $timestamp_datetime",
    ),
    (
        "technical_alert",
        "Technical indicator alert",
        "$priority_emoji $symbol technical alert\n\
         $condition_name\n\
         Indicator value: $value\n\
         $details\n\
         Evaluated: $evaluated_datetime ($strategy)",
    ),
    (
        "compact",
        "Single line summary",
        "$priority_emoji $symbol: $condition_name ($value)",
    ),
];

pub fn is_prebuilt(name: &str) -> bool {
    PREBUILT.iter().any(|(prebuilt, _, _)| *prebuilt == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOrigin {
    Prebuilt,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub text: String,
    pub description: String,
    pub origin: TemplateOrigin,
}

/// Serialized form of a custom template, used for import and export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub description: String,
}

/// Prebuilt templates plus a mutable set of custom ones. Prebuilt names
/// cannot be overwritten or deleted.
pub struct TemplateManager {
    prebuilt: BTreeMap<String, Template>,
    custom: RwLock<BTreeMap<String, Template>>,
}

impl Default for TemplateManager {
    fn default() -> Self {
        let prebuilt = PREBUILT
            .iter()
            .map(|(name, description, text)| {
                (
                    name.to_string(),
                    Template {
                        name: name.to_string(),
                        text: text.to_string(),
                        description: description.to_string(),
                        origin: TemplateOrigin::Prebuilt,
                    },
                )
            })
            .collect();
        Self {
            prebuilt,
            custom: RwLock::new(BTreeMap::new()),
        }
    }
}

impl TemplateManager {
    pub fn get(&self, name: &str) -> Option<Template> {
        if let Some(template) = self.prebuilt.get(name) {
            return Some(template.clone());
        }
        self.custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prebuilt.contains_key(name)
            || self
                .custom
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(name)
    }

    /// Prebuilt templates first, then custom ones, each sorted by name.
    pub fn list(&self) -> Vec<Template> {
        let custom = self.custom.read().unwrap_or_else(PoisonError::into_inner);
        self.prebuilt
            .values()
            .chain(custom.values())
            .cloned()
            .collect()
    }

    /// Returns `true` when the template was created and `false` when an
    /// existing custom template was replaced.
    pub fn create_custom_template(
        &self,
        name: &str,
        text: &str,
        description: &str,
        replace: bool,
    ) -> Result<bool, Report<TemplateError>> {
        self.check_writable(name, text)?;
        let mut custom = self.custom.write().unwrap_or_else(PoisonError::into_inner);
        if custom.contains_key(name) && !replace {
            bail!(TemplateError::TemplateExists {
                name: name.to_string()
            });
        }
        let created = custom
            .insert(name.to_string(), custom_template(name, text, description))
            .is_none();
        tracing::info!(template = name, created, "custom template stored");
        Ok(created)
    }

    pub fn update_custom_template(
        &self,
        name: &str,
        text: &str,
        description: Option<&str>,
    ) -> Result<(), Report<TemplateError>> {
        self.check_writable(name, text)?;
        let mut custom = self.custom.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = custom.get_mut(name) else {
            bail!(TemplateError::NotFound {
                name: name.to_string()
            });
        };
        existing.text = text.to_string();
        if let Some(description) = description {
            existing.description = description.to_string();
        }
        Ok(())
    }

    pub fn delete_custom_template(&self, name: &str) -> Result<Template, Report<TemplateError>> {
        if self.prebuilt.contains_key(name) {
            bail!(TemplateError::ReadOnly {
                name: name.to_string()
            });
        }
        self.custom
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| {
                Report::new(TemplateError::NotFound {
                    name: name.to_string(),
                })
            })
    }

    /// Custom templates only, sorted by name.
    pub fn export_templates(&self) -> Vec<TemplateRecord> {
        self.custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| TemplateRecord {
                name: t.name.clone(),
                text: t.text.clone(),
                description: t.description.clone(),
            })
            .collect()
    }

    /// All records are checked before any is stored; a single bad record
    /// leaves the manager unchanged. Returns the number imported.
    pub fn import_templates(
        &self,
        records: Vec<TemplateRecord>,
        replace: bool,
    ) -> Result<usize, Report<TemplateError>> {
        let mut custom = self.custom.write().unwrap_or_else(PoisonError::into_inner);
        let mut seen: Vec<&str> = Vec::with_capacity(records.len());
        for record in &records {
            self.check_writable(&record.name, &record.text)?;
            let duplicate = seen.contains(&record.name.as_str());
            if duplicate || (!replace && custom.contains_key(&record.name)) {
                bail!(TemplateError::TemplateExists {
                    name: record.name.clone()
                });
            }
            seen.push(&record.name);
        }
        let count = records.len();
        for record in records {
            let template = custom_template(&record.name, &record.text, &record.description);
            custom.insert(record.name, template);
        }
        Ok(count)
    }

    pub fn export_json(&self) -> Result<String, Report<TemplateError>> {
        serde_json::to_string_pretty(&self.export_templates())
            .change_context(TemplateError::Serialization)
    }

    pub fn import_json(&self, json: &str, replace: bool) -> Result<usize, Report<TemplateError>> {
        let records: Vec<TemplateRecord> =
            serde_json::from_str(json).change_context(TemplateError::Serialization)?;
        self.import_templates(records, replace)
    }

    fn check_writable(&self, name: &str, text: &str) -> Result<(), Report<TemplateError>> {
        if self.prebuilt.contains_key(name) {
            bail!(TemplateError::ReadOnly {
                name: name.to_string()
            });
        }
        placeholders(text).attach_with(|| format!("template: {name}"))?;
        Ok(())
    }
}

fn custom_template(name: &str, text: &str, description: &str) -> Template {
    Template {
        name: name.to_string(),
        text: text.to_string(),
        description: description.to_string(),
        origin: TemplateOrigin::Custom,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{REFERENCE_VARIABLES, TemplateEngine};

    #[test]
    fn prebuilt_templates_only_use_known_variables() {
        let engine = TemplateEngine::new();
        for template in engine.templates().list() {
            let validation = engine.validate_template(&template.text);
            assert!(validation.valid, "{}: {:?}", template.name, validation);
        }
        assert!(!REFERENCE_VARIABLES.is_empty());
    }

    #[test]
    fn create_then_replace() {
        let manager = TemplateManager::default();
        assert!(manager.create_custom_template("mine", "$symbol", "", false).unwrap());

        let err = manager
            .create_custom_template("mine", "$symbol!", "", false)
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &TemplateError::TemplateExists {
                name: "mine".into()
            }
        );

        assert!(!manager.create_custom_template("mine", "$symbol!", "v2", true).unwrap());
        let stored = manager.get("mine").unwrap();
        assert_eq!(stored.text, "$symbol!");
        assert_eq!(stored.origin, TemplateOrigin::Custom);
    }

    #[test]
    fn prebuilt_templates_are_read_only() {
        let manager = TemplateManager::default();
        let err = manager
            .create_custom_template("default", "$symbol", "", true)
            .unwrap_err();
        assert!(matches!(err.current_context(), TemplateError::ReadOnly { .. }));
        assert!(manager.delete_custom_template("compact").is_err());
        assert!(manager.get("compact").is_some());
    }

    #[test]
    fn rejects_unparseable_text() {
        let manager = TemplateManager::default();
        let err = manager
            .create_custom_template("broken", "${symbol", "", false)
            .unwrap_err();
        assert!(matches!(err.current_context(), TemplateError::Syntax { .. }));
        assert!(!manager.contains("broken"));
    }

    #[test]
    fn update_and_delete() {
        let manager = TemplateManager::default();
        assert!(manager.update_custom_template("ghost", "$symbol", None).is_err());

        manager
            .create_custom_template("mine", "$symbol", "first", false)
            .unwrap();
        manager
            .update_custom_template("mine", "$symbol $value", None)
            .unwrap();
        let stored = manager.get("mine").unwrap();
        assert_eq!(stored.text, "$symbol $value");
        assert_eq!(stored.description, "first");

        manager.delete_custom_template("mine").unwrap();
        assert!(manager.get("mine").is_none());
    }

    #[test]
    fn export_import_preserves_custom_templates() {
        let source = TemplateManager::default();
        source
            .create_custom_template("b", "$symbol", "second", false)
            .unwrap();
        source
            .create_custom_template("a", "$value_price", "first", false)
            .unwrap();
        let json = source.export_json().unwrap();

        let target = TemplateManager::default();
        assert_eq!(target.import_json(&json, false).unwrap(), 2);
        assert_eq!(target.export_templates(), source.export_templates());
        assert_eq!(target.export_templates()[0].name, "a");
    }

    #[test]
    fn import_is_all_or_nothing() {
        let manager = TemplateManager::default();
        let records = vec![
            TemplateRecord {
                name: "ok".into(),
                text: "$symbol".into(),
                description: String::new(),
            },
            TemplateRecord {
                name: "price_alert".into(),
                text: "$symbol".into(),
                description: String::new(),
            },
        ];
        assert!(manager.import_templates(records, true).is_err());
        assert!(!manager.contains("ok"));
    }
}
