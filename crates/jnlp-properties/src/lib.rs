//! An ordered reader/writer for Java `.properties` files.
//!
//! The cache index and every per-artifact `.info` file are plain `.properties`
//! documents shared with other launcher processes, so both directions matter:
//! [`parse`] accepts what Java's `Properties.load` accepts, and
//! [`Properties::to_text`] produces output that `Properties.load` (and [`parse`])
//! reads back to the same map.

use indexmap::IndexMap;
use std::io::{self, Read, Write};

/// An insertion-ordered `.properties` map.
///
/// Re-setting an existing key keeps its original position, which keeps rewritten
/// files diff-friendly for people inspecting them by hand.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    entries: IndexMap<String, String>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Removes `key`, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads and parses a whole document from `reader`.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; a damaged metadata file
    /// should degrade to missing values, not to an error.
    pub fn read_from(mut reader: impl Read) -> io::Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(parse(&String::from_utf8_lossy(&bytes)))
    }

    pub fn write_to(&self, mut writer: impl Write, comment: Option<&str>) -> io::Result<()> {
        writer.write_all(self.to_text(comment).as_bytes())?;
        writer.flush()
    }

    /// Serializes the map as `key=value` lines.
    ///
    /// `comment` is emitted as a leading `#` line; embedded newlines in it are
    /// turned into further comment lines.
    #[must_use]
    pub fn to_text(&self, comment: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(comment) = comment {
            for line in comment.lines() {
                out.push('#');
                out.push_str(line);
                out.push('\n');
            }
        }
        for (key, value) in &self.entries {
            escape_into(&mut out, key, true);
            out.push('=');
            escape_into(&mut out, value, false);
            out.push('\n');
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

/// Parse a `.properties` document.
///
/// Later duplicates of a key overwrite the value but keep the first position.
#[must_use]
pub fn parse(text: &str) -> Properties {
    let chars: Vec<char> = text.chars().collect();
    let mut offset = 0usize;
    let mut props = Properties::new();

    while offset < chars.len() {
        let line_start = offset;
        let logical = read_logical_line(&chars, &mut offset);
        if let Some((key, value)) = parse_logical_line(&logical) {
            props.set(key, value);
        }

        // Ensure we always make progress even on pathological inputs.
        if offset == line_start {
            offset += 1;
        }
    }

    props
}

fn read_logical_line(chars: &[char], offset: &mut usize) -> Vec<char> {
    let mut out = Vec::new();
    let mut first = true;

    loop {
        let segment_start = *offset;
        let mut line_end = segment_start;
        while line_end < chars.len() && chars[line_end] != '\n' && chars[line_end] != '\r' {
            line_end += 1;
        }

        // Consume `\n`, `\r` or `\r\n`.
        *offset = line_end;
        if *offset < chars.len() && chars[*offset] == '\r' {
            *offset += 1;
        }
        if *offset < chars.len() && chars[*offset] == '\n' {
            *offset += 1;
        }

        let segment = &chars[segment_start..line_end];

        // Comments are only recognised at the start of a logical line, never inside
        // a continuation.
        if first {
            let trimmed = segment.iter().position(|c| !is_whitespace(*c));
            if let Some(idx) = trimmed {
                if segment[idx] == '#' || segment[idx] == '!' {
                    return Vec::new();
                }
            }
        }
        first = false;

        let continues = ends_with_unescaped_backslash(segment);
        let copy_end = if continues {
            segment.len() - 1
        } else {
            segment.len()
        };
        out.extend_from_slice(&segment[..copy_end]);

        if !continues || *offset >= chars.len() {
            break;
        }

        // Continuation: skip leading whitespace on the next physical line.
        while *offset < chars.len() && is_whitespace(chars[*offset]) {
            *offset += 1;
        }
    }

    out
}

fn ends_with_unescaped_backslash(line: &[char]) -> bool {
    line.iter().rev().take_while(|c| **c == '\\').count() % 2 == 1
}

fn parse_logical_line(line: &[char]) -> Option<(String, String)> {
    let mut i = 0usize;
    while i < line.len() && is_whitespace(line[i]) {
        i += 1;
    }
    if i >= line.len() {
        return None;
    }

    let key_start = i;
    while i < line.len() {
        match line[i] {
            '\\' => i += 2,
            '=' | ':' => break,
            c if is_whitespace(c) => break,
            _ => i += 1,
        }
    }
    let key_end = i.min(line.len());

    while i < line.len() && is_whitespace(line[i]) {
        i += 1;
    }
    if i < line.len() && (line[i] == '=' || line[i] == ':') {
        i += 1;
    }
    while i < line.len() && is_whitespace(line[i]) {
        i += 1;
    }

    let key = unescape(&line[key_start..key_end]);
    let value = unescape(&line[i.min(line.len())..]);
    Some((key, value))
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\x0C')
}

fn unescape(chars: &[char]) -> String {
    // Work in UTF-16 units so `\uD83D\uDE00` style surrogate pairs combine.
    let mut units: Vec<u16> = Vec::with_capacity(chars.len());
    let mut buf = [0u16; 2];
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '\\' {
            units.extend_from_slice(c.encode_utf16(&mut buf));
            continue;
        }
        let Some(&escaped) = chars.get(i) else {
            break;
        };
        i += 1;
        match escaped {
            't' => units.push(u16::from(b'\t')),
            'n' => units.push(u16::from(b'\n')),
            'r' => units.push(u16::from(b'\r')),
            'f' => units.push(0x0C),
            'u' => match chars.get(i..i + 4).and_then(parse_hex4) {
                Some(unit) => {
                    units.push(unit);
                    i += 4;
                }
                None => units.push(u16::from(b'u')),
            },
            other => units.extend_from_slice(other.encode_utf16(&mut buf)),
        }
    }

    String::from_utf16_lossy(&units)
}

fn parse_hex4(digits: &[char]) -> Option<u16> {
    digits.iter().try_fold(0u16, |acc, c| {
        let digit = c.to_digit(16)?;
        Some((acc << 4) | digit as u16)
    })
}

fn escape_into(out: &mut String, text: &str, is_key: bool) {
    let mut buf = [0u16; 2];
    for (idx, c) in text.chars().enumerate() {
        match c {
            ' ' if is_key || idx == 0 => out.push_str("\\ "),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x0C' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{unit:04X}"));
                }
            }
            c => out.push(c),
        }
    }
}
