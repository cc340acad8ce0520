//! Placeholder rendering: `{{firstName}}` → lead attribute.
//!
//! Pure text substitution. Tokens with no value are left exactly as written,
//! so an operator can spot a typo in the rendered output.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::Lead;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Substitute every known `{{name}}` in `template`.
pub fn render(template: &str, values: &Placeholders) -> String {
    TOKEN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match values.get(key) {
                Some(v) => v.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Named values available to a template.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: HashMap<String, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values for a lead. Missing attributes render as empty strings.
    pub fn for_lead(lead: &Lead) -> Self {
        let mut p = Self::new();
        for (key, value) in &lead.custom {
            p.insert(key, value);
        }
        let first = lead.first_name.clone().unwrap_or_default();
        let last = lead.last_name.clone().unwrap_or_default();
        let full = format!("{first} {last}").trim().to_string();
        p.insert("firstName", &first);
        p.insert("lastName", &last);
        p.insert("fullName", &full);
        p.insert("email", lead.email.as_deref().unwrap_or_default());
        p.insert("phone", lead.phone.as_deref().unwrap_or_default());
        p.insert("company", lead.company.as_deref().unwrap_or_default());
        p.insert("title", lead.title.as_deref().unwrap_or_default());
        p
    }

    /// Replace blank lead attributes with spoken-friendly fallback text.
    pub fn with_fallbacks(mut self) -> Self {
        for (key, fallback) in [
            ("firstName", "there"),
            ("fullName", "there"),
            ("company", "your company"),
            ("title", "your role"),
        ] {
            if self.get(key).is_none_or(|v| v.trim().is_empty()) {
                self.insert(key, fallback);
            }
        }
        self
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn extend(&mut self, other: &Placeholders) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }
}
