use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::ConfigError;

/// keys of one section, kept in key order
pub type Section = BTreeMap<String, String>;

/// Sectioned key/value configuration.
///
/// Sections and keys are stored sorted, so rendering depends only on content and
/// never on insertion order. Values are opaque strings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IniConfig(BTreeMap<String, Section>);

impl IniConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// number of sections
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.0.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.0
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(|value| value.as_str())
    }

    /// set value, returning the previous one if any
    pub fn set<S, K, V>(&mut self, section: S, key: K, value: V) -> Option<String>
    where
        S: Into<String>,
        K: Into<String>,
        V: Into<String>,
    {
        self.0
            .entry(section.into())
            .or_default()
            .insert(key.into(), value.into())
    }

    pub fn with<S, K, V>(mut self, section: S, key: K, value: V) -> Self
    where
        S: Into<String>,
        K: Into<String>,
        V: Into<String>,
    {
        self.set(section, key, value);
        self
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.0.iter().map(|(name, keys)| (name.as_str(), keys))
    }

    /// Merge overrides on top of this template and return the result.
    ///
    /// Template sections and keys are always kept. A key present in both takes the
    /// override value, sections or keys only present in the overrides are added.
    /// Neither input is modified.
    pub fn merge(&self, overrides: Option<&IniConfig>) -> IniConfig {
        let mut merged = self.clone();
        let Some(overrides) = overrides else {
            return merged;
        };

        for (section, keys) in &overrides.0 {
            let target = merged.0.entry(section.clone()).or_default();
            for (key, value) in keys {
                if let Some(previous) = target.insert(key.clone(), value.clone()) {
                    trace!(%section, %key, %previous, %value, "override");
                }
            }
        }
        merged
    }

    /// check every section, key and value can be written as a single INI line
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, keys) in &self.0 {
            validate_section(section)?;
            for (key, value) in keys {
                validate_key(section, key)?;
                validate_value(section, key, value)?;
            }
        }
        Ok(())
    }

    /// Render as `keystone.conf` text.
    ///
    /// Each section is a `[name]` header followed by `key = value` lines. Every
    /// line is newline terminated and sections are separated by one blank line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, (section, keys)) in self.0.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(section);
            out.push_str("]\n");
            for (key, value) in keys {
                out.push_str(key);
                out.push_str(" = ");
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }
}

impl From<BTreeMap<String, Section>> for IniConfig {
    fn from(sections: BTreeMap<String, Section>) -> Self {
        Self(sections)
    }
}

impl fmt::Display for IniConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// parse INI text; comments start with `#` or `;`, later duplicates win
impl FromStr for IniConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut config = IniConfig::new();
        let mut current: Option<String> = None;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| ConfigError::Malformed {
                    line: line_no,
                    content: raw.to_owned(),
                })?;
                let name = name.trim();
                validate_section(name)?;
                config.0.entry(name.to_owned()).or_default();
                current = Some(name.to_owned());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line: line_no,
                    content: raw.to_owned(),
                });
            };
            let section = current
                .as_ref()
                .ok_or(ConfigError::OrphanKey { line: line_no })?;
            let key = key.trim();
            validate_key(section, key)?;
            config.set(section.as_str(), key, value.trim());
        }

        Ok(config)
    }
}

fn has_line_break(value: &str) -> bool {
    value.contains('\n') || value.contains('\r')
}

fn validate_section(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        Some("empty name")
    } else if has_line_break(name) {
        Some("contains a line break")
    } else if name.contains('[') || name.contains(']') {
        Some("contains a bracket")
    } else if name.trim() != name {
        Some("surrounded by whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InvalidSection {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

fn validate_key(section: &str, key: &str) -> Result<(), ConfigError> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if has_line_break(key) {
        Some("contains a line break")
    } else if key.contains('=') {
        Some("contains '='")
    } else if key.starts_with(['[', '#', ';']) {
        Some("starts with a reserved character")
    } else if key.trim() != key {
        Some("surrounded by whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InvalidKey {
            section: section.to_owned(),
            key: key.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

fn validate_value(section: &str, key: &str, value: &str) -> Result<(), ConfigError> {
    if has_line_break(value) {
        Err(ConfigError::InvalidValue {
            section: section.to_owned(),
            key: key.to_owned(),
            reason: "contains a line break",
        })
    } else {
        Ok(())
    }
}
