// Parset Configuration Store
// Ordered flat key/value configuration loaded from YAML or `key = value` files

use crate::parser::error::{ParseError, ParseErrorKind, ParseResult};

use indexmap::IndexMap;
use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Ordered flat configuration. Keys are dotted paths such as
/// `prep.control.kind`; values are raw strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parset {
    entries: IndexMap<String, String>,
    /// File the parset was loaded from, if any
    source: Option<PathBuf>,
}

impl Parset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a parset from disk. `.yaml`/`.yml` files are flattened; anything
    /// else is read as `key = value` lines.
    pub fn from_file(path: impl AsRef<Path>) -> ParseResult<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| ParseError::io_error(path.display(), &e))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let mut parset = if is_yaml {
            Self::from_yaml(&content)?
        } else {
            Self::from_parset_str(&content)?
        };
        parset.source = Some(path.to_path_buf());
        Ok(parset)
    }

    /// Parse YAML, flattening nested mappings into dotted keys
    pub fn from_yaml(content: &str) -> ParseResult<Self> {
        let root: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;

        let mut parset = Parset::new();
        match root {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Mapping(map) => flatten_mapping("", &map, &mut parset)?,
            _ => {
                return Err(ParseError::new("configuration root must be a mapping", 1, 1)
                    .with_kind(ParseErrorKind::InvalidValue))
            }
        }
        Ok(parset)
    }

    /// Parse `key = value` lines; `#` starts a comment
    pub fn from_parset_str(content: &str) -> ParseResult<Self> {
        let mut parset = Parset::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ParseError::new(
                    format!("expected 'key = value', found '{}'", line),
                    idx + 1,
                    1,
                )
                .with_source_context(content, 1)
                .with_suggestion("separate the key and its value with '='"));
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(ParseError::new("empty key", idx + 1, 1).with_source_context(content, 1));
            }

            parset.insert(key, unquote(value.trim()));
        }

        Ok(parset)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Directory relative paths in this parset resolve against
    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert a value. Replacing an existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut String)> {
        self.entries.iter_mut()
    }

    /// Ordered sub-map of every key under `prefix`, with the prefix stripped.
    /// `prefix` should end with a dot.
    pub fn subset(&self, prefix: &str) -> IndexMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }

    /// Read a list value (`[a, b]` or `a, b`)
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(parse_list)
    }

    /// Read a step list, expanding entries that name a group list
    /// (`<key>.<entry>`) in place.
    pub fn step_list(&self, key: &str) -> Option<Vec<String>> {
        let names = self.get_list(key)?;
        let mut expanded = Vec::with_capacity(names.len());
        let mut visiting = Vec::new();
        self.expand_groups(key, names, &mut expanded, &mut visiting);
        Some(expanded)
    }

    fn expand_groups(
        &self,
        key: &str,
        names: Vec<String>,
        out: &mut Vec<String>,
        visiting: &mut Vec<String>,
    ) {
        for name in names {
            let group = self.get_list(&format!("{}.{}", key, name));
            match group {
                Some(group) if !visiting.contains(&name) => {
                    visiting.push(name);
                    self.expand_groups(key, group, out, visiting);
                    visiting.pop();
                }
                _ => out.push(name),
            }
        }
    }

    /// Render as `key = value` lines
    pub fn to_parset_string(&self) -> String {
        render_entries(self.entries.iter())
    }

    /// Write the parset to disk as `key = value` lines
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        write_argument_file(path, &self.entries)
    }
}

impl FromIterator<(String, String)> for Parset {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Parset {
            entries: iter.into_iter().collect(),
            source: None,
        }
    }
}

/// Write an ordered argument map as `key = value` lines, creating parent
/// directories as needed
pub fn write_argument_file(
    path: impl AsRef<Path>,
    entries: &IndexMap<String, String>,
) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render_entries(entries.iter()))
}

fn render_entries<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> String {
    let mut out = String::new();
    for (k, v) in entries {
        let _ = writeln!(out, "{} = {}", k, render_value(v));
    }
    out
}

/// Parse `[a, b, c]` (brackets optional) into its trimmed, non-empty items
pub fn parse_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    inner
        .split(',')
        .map(|item| unquote(item.trim()))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Render items back into the bracketed list form
pub fn format_list(items: &[String]) -> String {
    format!("[{}]", items.join(", "))
}

/// Parse a `{KEY: value, OTHER: value}` string into an ordered map
pub fn parse_environment(value: &str) -> IndexMap<String, String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);

    inner
        .split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let key = unquote(k.trim());
            if key.is_empty() {
                return None;
            }
            Some((key, unquote(v.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Cut a trailing comment. `#` opens one only at the start of the line or
/// after whitespace, and never inside a quoted value.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;
    for (idx, c) in line.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') if prev.map_or(true, |p| p.is_whitespace() || p == '=') => {
                quote = Some(c)
            }
            (None, '#') if prev.map_or(true, char::is_whitespace) => return &line[..idx],
            _ => {}
        }
        prev = Some(c);
    }
    line
}

/// Quote a value when reading it back would otherwise change it
fn render_value(value: &str) -> Cow<'_, str> {
    let needs_quotes = value != value.trim()
        || value.starts_with('#')
        || value.contains(" #")
        || value.contains("\t#")
        || unquote(value) != value;
    if !needs_quotes {
        Cow::Borrowed(value)
    } else if value.contains('"') {
        Cow::Owned(format!("'{}'", value))
    } else {
        Cow::Owned(format!("\"{}\"", value))
    }
}

fn flatten_mapping(
    prefix: &str,
    map: &serde_yaml::Mapping,
    out: &mut Parset,
) -> ParseResult<()> {
    for (k, v) in map {
        let key = scalar_to_string(k).ok_or_else(|| {
            ParseError::new(format!("non-scalar key under '{}'", prefix), 0, 0)
                .with_kind(ParseErrorKind::InvalidValue)
        })?;
        let full_key = if prefix.is_empty() {
            key
        } else {
            format!("{}.{}", prefix, key)
        };

        match v {
            serde_yaml::Value::Mapping(inner) => flatten_mapping(&full_key, inner, out)?,
            serde_yaml::Value::Sequence(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    let s = scalar_to_string(item).ok_or_else(|| {
                        ParseError::new(
                            format!("list '{}' may only contain scalar values", full_key),
                            0,
                            0,
                        )
                        .with_kind(ParseErrorKind::InvalidValue)
                    })?;
                    rendered.push(s);
                }
                out.insert(full_key, format_list(&rendered));
            }
            other => {
                let s = scalar_to_string(other).ok_or_else(|| {
                    ParseError::new(format!("unsupported value for '{}'", full_key), 0, 0)
                        .with_kind(ParseErrorKind::InvalidValue)
                })?;
                out.insert(full_key, s);
            }
        }
    }
    Ok(())
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}
