//! Line-oriented world config with comment-preserving round trips.
//!
//! Format:
//! ```text
//! # comment
//! key: value
//! group:variant:
//!   data line
//!   data line
//! ```
//! `#` starts a comment, hex integers use `0x`, and a key ending in `:`
//! opens a multi-valued entry whose data lines are whitespace-indented.

use std::path::Path;

use crate::codec::PersistError;

#[derive(Clone, Debug, PartialEq)]
enum Line {
    Blank,
    Comment(String),
    Entry { key: String, value: String },
    Multi { key: String, lines: Vec<String> },
}

/// Parsed config file. Order and comments survive a parse/serialize round
/// trip, so hand-edited files stay hand-editable.
#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    lines: Vec<Line>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let trimmed = raw.trim_end();
            if trimmed.trim().is_empty() {
                lines.push(Line::Blank);
                continue;
            }
            if trimmed.trim_start().starts_with('#') {
                lines.push(Line::Comment(trimmed.to_string()));
                continue;
            }
            if raw.starts_with(char::is_whitespace) {
                // Indented data line: belongs to the open multi entry.
                if let Some(Line::Multi { lines: data, .. }) = lines.last_mut() {
                    data.push(trimmed.trim_start().to_string());
                    continue;
                }
                // Stray indentation with no open entry: keep it verbatim.
                lines.push(Line::Comment(trimmed.to_string()));
                continue;
            }
            if let Some(key) = trimmed.strip_suffix(':') {
                if !key.contains(": ") {
                    lines.push(Line::Multi {
                        key: key.to_string(),
                        lines: Vec::new(),
                    });
                    continue;
                }
            }
            match trimmed.split_once(':') {
                Some((key, value)) => lines.push(Line::Entry {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                }),
                None => lines.push(Line::Comment(trimmed.to_string())),
            }
        }
        Self { lines }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Integer value; `0x` prefixes parse as hex.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok()
        } else {
            value.parse().ok()
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }

    /// Data lines of a multi-valued `key:variant:` entry.
    pub fn get_multi(&self, key: &str) -> Option<&[String]> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Multi { key: k, lines } if k == key => Some(lines.as_slice()),
            _ => None,
        })
    }

    /// Update an existing entry in place or append a new one at the end.
    pub fn set(&mut self, key: &str, value: &str) {
        for line in self.lines.iter_mut().rev() {
            if let Line::Entry { key: k, value: v } = line {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        self.lines.push(Line::Entry {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn set_multi(&mut self, key: &str, data: Vec<String>) {
        for line in self.lines.iter_mut().rev() {
            if let Line::Multi { key: k, lines } = line {
                if k == key {
                    *lines = data;
                    return;
                }
            }
        }
        self.lines.push(Line::Multi {
            key: key.to_string(),
            lines: data,
        });
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { key, .. } | Line::Multi { key, .. } => Some(key.as_str()),
            _ => None,
        })
    }
}

impl std::fmt::Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            match line {
                Line::Blank => writeln!(f)?,
                Line::Comment(text) => writeln!(f, "{text}")?,
                Line::Entry { key, value } => writeln!(f, "{key}: {value}")?,
                Line::Multi { key, lines } => {
                    writeln!(f, "{key}:")?;
                    for data in lines {
                        writeln!(f, "  {data}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# world settings
seed: 0x1A2B
name: test world

render_distance: 12
spawn:overrides:
  0 64 0
  8 70 8
";

    #[test]
    fn parses_entries_and_hex() {
        let cfg = ConfigFile::parse(SAMPLE);
        assert_eq!(cfg.get("name"), Some("test world"));
        assert_eq!(cfg.get_int("seed"), Some(0x1A2B));
        assert_eq!(cfg.get_int("render_distance"), Some(12));
        assert_eq!(
            cfg.get_multi("spawn:overrides").unwrap(),
            &["0 64 0".to_string(), "8 70 8".to_string()]
        );
    }

    #[test]
    fn roundtrip_preserves_comments_and_order() {
        let cfg = ConfigFile::parse(SAMPLE);
        assert_eq!(cfg.to_string(), SAMPLE);
        // A second parse of the output is stable too.
        assert_eq!(ConfigFile::parse(&cfg.to_string()).to_string(), SAMPLE);
    }

    #[test]
    fn set_updates_in_place() {
        let mut cfg = ConfigFile::parse(SAMPLE);
        cfg.set("render_distance", "16");
        cfg.set("new_key", "fresh");
        let text = cfg.to_string();
        assert!(text.contains("render_distance: 16"));
        assert!(text.contains("# world settings"));
        assert!(text.ends_with("new_key: fresh\n"));
        assert_eq!(cfg.get_int("render_distance"), Some(16));
    }

    #[test]
    fn bools_and_missing_keys() {
        let cfg = ConfigFile::parse("flag: true\nother: nope\n");
        assert_eq!(cfg.get_bool("flag"), Some(true));
        assert_eq!(cfg.get_bool("other"), None);
        assert_eq!(cfg.get("absent"), None);
        assert_eq!(cfg.get_int("flag"), None);
    }
}
