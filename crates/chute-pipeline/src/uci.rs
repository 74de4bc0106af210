//! UCI-style OS configuration files.
//!
//! The OS-configuration daemon reads one file per subsystem:
//!
//! ```text
//! config interface 'seccam_wlan0' # seccam
//!     option proto 'static'
//!     option ipaddr '192.168.128.1'
//!     list dns '8.8.8.8'
//! ```
//!
//! The trailing `# owner` on a `config` line names the chute (or the host)
//! that generated the section. Writers only ever replace their own sections.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Owner tag for sections generated from the host configuration.
pub const HOST_OWNER: &str = "__hostconfig__";

/// The four files the pipeline generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    Network,
    Firewall,
    Dhcp,
    Wireless,
}

impl ConfigKind {
    pub const ALL: [ConfigKind; 4] = [
        ConfigKind::Network,
        ConfigKind::Firewall,
        ConfigKind::Dhcp,
        ConfigKind::Wireless,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ConfigKind::Network => "network",
            ConfigKind::Firewall => "firewall",
            ConfigKind::Dhcp => "dhcp",
            ConfigKind::Wireless => "wireless",
        }
    }

    pub fn path(self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

impl std::fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionValue {
    Single(String),
    List(Vec<String>),
}

/// One `config` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub kind: String,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub options: Vec<(String, OptionValue)>,
}

impl Section {
    pub fn new(kind: &str, name: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            name: Some(name.into()),
            owner: None,
            options: Vec::new(),
        }
    }

    pub fn anonymous(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: None,
            owner: None,
            options: Vec::new(),
        }
    }

    pub fn option(mut self, key: &str, value: impl ToString) -> Self {
        self.options
            .push((key.to_string(), OptionValue::Single(value.to_string())));
        self
    }

    pub fn list(mut self, key: &str, values: impl IntoIterator<Item = impl ToString>) -> Self {
        let values: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        if !values.is_empty() {
            self.options.push((key.to_string(), OptionValue::List(values)));
        }
        self
    }

    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.iter().find_map(|(k, v)| match v {
            OptionValue::Single(s) if k == key => Some(s.as_str()),
            _ => None,
        })
    }
}

/// A parsed OS config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub sections: Vec<Section>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<ConfigFile> {
        let mut sections: Vec<Section> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad = |what: &str| {
                PipelineError::Io(format!("config line {}: {what}: {raw}", lineno + 1))
            };

            let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            match head {
                "config" => {
                    let (body, owner) = match rest.split_once('#') {
                        Some((body, owner)) => (body.trim(), Some(owner.trim().to_string())),
                        None => (rest.trim(), None),
                    };
                    let (kind, name) = body
                        .split_once(char::is_whitespace)
                        .map(|(k, n)| (k, Some(unquote(n.trim()))))
                        .unwrap_or((body, None));
                    if kind.is_empty() {
                        return Err(bad("config without type"));
                    }
                    sections.push(Section {
                        kind: kind.to_string(),
                        name,
                        owner: owner.filter(|o| !o.is_empty()),
                        options: Vec::new(),
                    });
                }
                "option" | "list" => {
                    let section = sections.last_mut().ok_or_else(|| bad("option outside section"))?;
                    let (key, value) = rest
                        .trim()
                        .split_once(char::is_whitespace)
                        .ok_or_else(|| bad("missing value"))?;
                    let value = unquote(value.trim());
                    if head == "option" {
                        section
                            .options
                            .push((key.to_string(), OptionValue::Single(value)));
                    } else {
                        match section.options.iter_mut().find(|(k, _)| k == key) {
                            Some((_, OptionValue::List(values))) => values.push(value),
                            _ => section
                                .options
                                .push((key.to_string(), OptionValue::List(vec![value]))),
                        }
                    }
                }
                _ => return Err(bad("unknown directive")),
            }
        }

        Ok(ConfigFile { sections })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            let _ = write!(out, "config {}", section.kind);
            if let Some(name) = &section.name {
                let _ = write!(out, " {}", quote(name));
            }
            if let Some(owner) = &section.owner {
                let _ = write!(out, " # {owner}");
            }
            out.push('\n');
            for (key, value) in &section.options {
                match value {
                    OptionValue::Single(v) => {
                        let _ = writeln!(out, "\toption {key} {}", quote(v));
                    }
                    OptionValue::List(vs) => {
                        for v in vs {
                            let _ = writeln!(out, "\tlist {key} {}", quote(v));
                        }
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn owned_by<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a Section> + 'a {
        self.sections
            .iter()
            .filter(move |s| s.owner.as_deref() == Some(owner))
    }

    /// Drop every section `owner` generated and append `replacement`, tagged.
    pub fn replace_owned(&mut self, owner: &str, replacement: Vec<Section>) {
        self.sections.retain(|s| s.owner.as_deref() != Some(owner));
        self.sections.extend(
            replacement
                .into_iter()
                .map(|s| s.owned_by(owner)),
        );
    }

    /// Drop every section that belongs to a chute (anything not host-owned).
    pub fn remove_chute_sections(&mut self) {
        self.sections
            .retain(|s| s.owner.is_none() || s.owner.as_deref() == Some(HOST_OWNER));
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn unquote(value: &str) -> String {
    let v = value.trim();
    if v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'') {
        v[1..v.len() - 1].replace("'\\''", "'")
    } else if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}
