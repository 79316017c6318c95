use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateKey {
    #[serde(rename = "confirmation")]
    Confirmation,
    #[serde(rename = "reminder_24h")]
    Reminder24h,
    #[serde(rename = "same_day")]
    SameDay,
    #[serde(rename = "same_day_multi")]
    SameDayMulti,
    #[serde(rename = "payment_48h")]
    Payment48h,
}

impl TemplateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKey::Confirmation => "confirmation",
            TemplateKey::Reminder24h => "reminder_24h",
            TemplateKey::SameDay => "same_day",
            TemplateKey::SameDayMulti => "same_day_multi",
            TemplateKey::Payment48h => "payment_48h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    Missing(TemplateKey),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Missing(key) => write!(f, "no template for {}", key.as_str()),
        }
    }
}

impl std::error::Error for TemplateError {}

/// Message templates with `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Templates {
    entries: HashMap<TemplateKey, Template>,
}

impl Default for Templates {
    fn default() -> Self {
        let t = |subject: &str, body: &str| Template {
            subject: subject.into(),
            body: body.into(),
        };
        let entries = HashMap::from([
            (
                TemplateKey::Confirmation,
                t(
                    "Your appointment on {date}",
                    "Hi {recipient}, {client} is booked for {package} on {date} at {time}. See you at {address}.",
                ),
            ),
            (
                TemplateKey::Reminder24h,
                t(
                    "Reminder: appointment tomorrow at {time}",
                    "Hi {recipient}, this is a reminder that {client} has {package} tomorrow ({date}) at {time}, {address}. Need to change it? {booking_url}",
                ),
            ),
            (
                TemplateKey::SameDay,
                t("", "Hi {recipient}! See you today at {time} for {client}'s {package}. {address}"),
            ),
            (
                TemplateKey::SameDayMulti,
                t("", "Hi {recipient}! You have {count} appointments with us today:\n{appointments}\n{address}"),
            ),
            (
                TemplateKey::Payment48h,
                t(
                    "",
                    "Hi {recipient}, {client}'s appointment on {date} at {time} needs an advance payment of {amount} to stay confirmed. {booking_url}",
                ),
            ),
        ]);
        Self { entries }
    }
}

impl Templates {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Defaults overridden by a JSON object keyed by template name.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let overrides: HashMap<TemplateKey, Template> = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Invalid(format!("templates {}: {e}", path.display())))?;
        let mut templates = Self::default();
        templates.entries.extend(overrides);
        Ok(templates)
    }

    pub fn with(mut self, key: TemplateKey, template: Template) -> Self {
        self.entries.insert(key, template);
        self
    }

    pub fn without(mut self, key: TemplateKey) -> Self {
        self.entries.remove(&key);
        self
    }

    pub fn render(&self, key: TemplateKey, vars: &[(&str, String)]) -> Result<Rendered, TemplateError> {
        let template = self.entries.get(&key).ok_or(TemplateError::Missing(key))?;
        Ok(Rendered {
            subject: substitute(&template.subject, vars),
            body: substitute(&template.body, vars),
        })
    }
}

/// Calendar date as shown in messages for `locale`.
pub fn format_date(date: NaiveDate, locale: &str) -> String {
    let lang = locale.split(['-', '_']).next().unwrap_or_default();
    match lang {
        "en" => date.format("%a %-d %b %Y").to_string(),
        "es" | "pt" | "fr" | "it" => date.format("%d/%m/%Y").to_string(),
        "de" => date.format("%d.%m.%Y").to_string(),
        _ => date.format("%Y-%m-%d").to_string(),
    }
}

/// Minor currency units as a decimal amount, e.g. `5000` → `"50.00"`.
pub fn format_amount(minor: u64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

/// Unknown placeholders are left as-is.
fn substitute(text: &str, vars: &[(&str, String)]) -> String {
    let mut out = text.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
