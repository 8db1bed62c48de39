//! Workflow configuration.
//!
//! The configuration is INI-shaped: named sections holding string options.
//! On disk it is JSON:
//!
//! {
//!   "workflow": { "trigger-name": "090802" },
//!   "executables": { "trig_combiner": "/opt/bin/trig_combiner" },
//!   "workflow-postproc": { "do-two-stage-clustering": "" },
//!   "trig_combiner": { "num-trials": 6 }
//! }
//!
//! Option values may be written as strings, numbers or booleans; they are
//! normalised to strings. Tag-specific overrides live in sections named
//! `<section>-<tag in lower case>`.

use crate::Result;
use crate::diagnostics;

use anyhow::{Context, anyhow, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Raw option value as it appears in the JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
    Empty(()),
}

impl RawValue {
    fn into_string(self) -> String {
        match self {
            RawValue::Text(s) => s,
            RawValue::Number(n) => n.to_string(),
            RawValue::Flag(b) => b.to_string(),
            RawValue::Empty(()) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = BTreeMap::<String, BTreeMap<String, RawValue>>::deserialize(deserializer)?;
        let sections = raw
            .into_iter()
            .map(|(name, opts)| {
                let opts = opts
                    .into_iter()
                    .map(|(k, v)| (k, v.into_string().trim().to_string()))
                    .collect();
                (name, opts)
            })
            .collect();
        Ok(Config { sections })
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| {
            diagnostics::error_message(format!("read config file {}", path.display()))
        })?;
        serde_json::from_str(&text).with_context(|| {
            diagnostics::error_message(format!("parse config file {}", path.display()))
        })
    }

    #[cfg(test)]
    pub fn set(&mut self, section: &str, option: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value.into());
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.sections
            .get(section)
            .map(|s| s.contains_key(option))
            .unwrap_or(false)
    }

    /// True if `option` is set in `section` or in its `tag` subsection.
    pub fn has_option_tag(&self, section: &str, option: &str, tag: &str) -> bool {
        self.has_option(&tagged_section(section, tag), option) || self.has_option(section, option)
    }

    pub fn get(&self, section: &str, option: &str) -> Result<&str> {
        let sec = self.sections.get(section).ok_or_else(|| {
            anyhow!(diagnostics::error_message(format!(
                "config has no section [{}]",
                section
            )))
        })?;
        sec.get(option).map(String::as_str).ok_or_else(|| {
            anyhow!(diagnostics::error_message(format!(
                "config section [{}] has no option '{}'",
                section, option
            )))
        })
    }

    pub fn get_parsed<T>(&self, section: &str, option: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let raw = self.get(section, option)?;
        raw.parse::<T>().with_context(|| {
            diagnostics::error_message(format!(
                "config option [{}] {} has bad value {:?}",
                section, option, raw
            ))
        })
    }

    /// Look `option` up in the tag subsections first, then in `section`.
    ///
    /// Setting the same option in more than one tag subsection is an error.
    pub fn get_opt_tags(&self, section: &str, option: &str, tags: &[String]) -> Result<&str> {
        let mut found: Option<(String, &str)> = None;
        for tag in tags {
            let name = tagged_section(section, tag);
            if let Some(v) = self.sections.get(&name).and_then(|s| s.get(option)) {
                if let Some((prev, _)) = &found {
                    bail!(
                        "{}",
                        diagnostics::error_message(format!(
                            "option '{}' is set in both [{}] and [{}]",
                            option, prev, name
                        ))
                    );
                }
                found = Some((name, v.as_str()));
            }
        }
        match found {
            Some((_, v)) => Ok(v),
            None => self.get(section, option),
        }
    }

    /// All options of a section in key order; empty if the section is absent.
    pub fn items(&self, section: &str) -> Vec<(&str, &str)> {
        self.sections
            .get(section)
            .map(|s| s.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect())
            .unwrap_or_default()
    }
}

fn tagged_section(section: &str, tag: &str) -> String {
    format!("{}-{}", section, tag.to_lowercase())
}
