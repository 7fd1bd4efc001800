//! Decoding flat configuration maps onto adaptor fields.
//!
//! Adaptors are plain serde structs. A configuration map is overlaid on the
//! serialized defaults of a fresh instance and decoded back, so keys that are
//! absent keep their defaults and unknown keys are ignored.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{Error, Result};

/// Flat key/value adaptor configuration.
pub type ConfigMap = Map<String, Value>;

/// Timeout applied when an adaptor does not set one.
pub const DEFAULT_TIMEOUT: &str = "30s";

/// Reconfigurable from a [`ConfigMap`] and exportable back to one.
pub trait Configurable {
    /// Overlays `config` on the current field values.
    fn configure(&mut self, config: &ConfigMap) -> Result<()>;

    /// Exports the current field values.
    fn to_config(&self) -> Result<ConfigMap>;
}

impl<T> Configurable for T
where
    T: Serialize + DeserializeOwned,
{
    fn configure(&mut self, config: &ConfigMap) -> Result<()> {
        *self = decode_onto(self, config)?;
        Ok(())
    }

    fn to_config(&self) -> Result<ConfigMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Config(format!(
                "adaptor configuration must be an object, got {other}"
            ))),
        }
    }
}

/// Decodes `config` onto a copy of `current`.
///
/// Keys are matched by field name; `camelCase` and `kebab-case` spellings are
/// folded to `snake_case` when the literal key is not a known field.
pub fn decode_onto<T>(current: &T, config: &ConfigMap) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = match serde_json::to_value(current)? {
        Value::Object(map) => map,
        other => {
            return Err(Error::Config(format!(
                "adaptor configuration must be an object, got {other}"
            )))
        }
    };

    for (key, value) in config {
        let field = if merged.contains_key(key) {
            key.clone()
        } else {
            to_snake_case(key)
        };
        merged.insert(field, value.clone());
    }

    serde_json::from_value(Value::Object(merged))
        .map_err(|e| Error::Config(format!("cannot decode configuration: {e}")))
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch == '-' || ch == '.' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Parses a sample configuration string.
///
/// Samples are JSON with `//` line comments and optional trailing commas.
pub fn parse_sample(sample: &str) -> Result<ConfigMap> {
    let cleaned = strip_trailing_commas(&strip_comments(sample));
    match serde_json::from_str::<Value>(&cleaned)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Config(format!(
            "sample configuration must be an object, got {other}"
        ))),
    }
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for line in input.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut = line.len();
        let bytes = line.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => {
                    cut = i;
                    break;
                }
                _ => {}
            }
        }
        out.push_str(&line[..cut]);
        out.push('\n');
    }
    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Parses a humane duration such as `30s`, `500ms`, `1m30s` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::InvalidTimeout(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_secs_f64(total))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
