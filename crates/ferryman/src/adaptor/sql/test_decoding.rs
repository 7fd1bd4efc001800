//! Parser for the `test_decoding` logical replication output plugin.
//!
//! Change lines look like
//! `table public.users: UPDATE: id[integer]:1 name[text]:'ada'`.
//! `BEGIN` and `COMMIT` lines carry no data and are ignored.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{Data, Op};

/// One decoded row change.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// `schema.table` the change applies to.
    pub namespace: String,
    /// Insert, update or delete.
    pub op: Op,
    /// New row values; key columns only for deletes.
    pub data: Data,
}

/// Parses one line of plugin output. Returns `Ok(None)` for transaction
/// markers and truncations.
pub fn parse_change(line: &str) -> Result<Option<Change>> {
    let Some(rest) = line.strip_prefix("table ") else {
        return Ok(None);
    };
    let (namespace, rest) = rest
        .split_once(": ")
        .ok_or_else(|| malformed(line, "missing table separator"))?;
    let (action, columns) = match rest.split_once(':') {
        Some((action, columns)) => (action, columns.trim_start()),
        None => (rest, ""),
    };
    let op = match action {
        "INSERT" => Op::Insert,
        "UPDATE" => Op::Update,
        "DELETE" => Op::Delete,
        _ => return Ok(None),
    };

    Ok(Some(Change {
        namespace: namespace.to_string(),
        op,
        data: parse_columns(columns).map_err(|reason| malformed(line, &reason))?,
    }))
}

/// True for the line closing a transaction.
#[must_use]
pub fn is_commit(line: &str) -> bool {
    line.starts_with("COMMIT")
}

fn malformed(line: &str, reason: &str) -> Error {
    Error::Extraction(format!("cannot parse change '{line}': {reason}"))
}

fn parse_columns(input: &str) -> std::result::Result<Data, String> {
    let mut data = Data::new();
    let mut rest = input.trim();
    if rest == "(no-tuple-data)" {
        return Ok(data);
    }

    while !rest.is_empty() {
        let open = rest.find('[').ok_or("missing column type")?;
        let name = rest[..open].to_string();
        let close = rest[open..].find("]:").ok_or("unterminated column type")? + open;
        let kind = &rest[open + 1..close];
        rest = &rest[close + 2..];

        let (raw, remaining) = if let Some(quoted) = rest.strip_prefix('\'') {
            let (text, used) = read_quoted(quoted)?;
            (RawValue::Quoted(text), &quoted[used..])
        } else {
            let end = rest.find(' ').unwrap_or(rest.len());
            (RawValue::Bare(&rest[..end]), &rest[end..])
        };
        data.insert(name, cast(kind, raw));
        rest = remaining.trim_start();
    }
    Ok(data)
}

enum RawValue<'a> {
    Quoted(String),
    Bare(&'a str),
}

/// Reads a single-quoted literal where `''` escapes a quote. Returns the
/// text and the number of bytes consumed, closing quote included.
fn read_quoted(input: &str) -> std::result::Result<(String, usize), String> {
    let mut out = String::new();
    let mut chars = input.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        if ch == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                out.push('\'');
                chars.next();
            } else {
                return Ok((out, i + 1));
            }
        } else {
            out.push(ch);
        }
    }
    Err("unterminated quoted value".to_string())
}

fn cast(kind: &str, raw: RawValue<'_>) -> Value {
    let text = match raw {
        RawValue::Quoted(text) => {
            if kind == "json" || kind == "jsonb" {
                return serde_json::from_str(&text).unwrap_or(Value::String(text));
            }
            return Value::String(text);
        }
        RawValue::Bare("null") => return Value::Null,
        RawValue::Bare(text) => text,
    };
    match kind {
        "smallint" | "integer" | "bigint" => text
            .parse::<i64>()
            .map_or_else(|_| Value::String(text.to_string()), Value::from),
        "real" | "double precision" | "numeric" => text
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map_or_else(|| Value::String(text.to_string()), Value::from),
        "boolean" => Value::Bool(text == "true"),
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_with_typed_columns() {
        let change = parse_change(
            "table public.users: INSERT: id[integer]:1 name[text]:'ada lovelace' score[double precision]:9.5 active[boolean]:true",
        )
        .unwrap()
        .unwrap();
        assert_eq!(change.namespace, "public.users");
        assert_eq!(change.op, Op::Insert);
        assert_eq!(
            Value::Object(change.data),
            json!({"id": 1, "name": "ada lovelace", "score": 9.5, "active": true})
        );
    }

    #[test]
    fn test_quotes_nulls_and_json() {
        let change = parse_change(
            "table s.t: UPDATE: note[text]:'it''s' gone[text]:null meta[jsonb]:'{\"a\": 1}'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(change.op, Op::Update);
        assert_eq!(change.data.get("note"), Some(&json!("it's")));
        assert_eq!(change.data.get("gone"), Some(&Value::Null));
        assert_eq!(change.data.get("meta"), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_delete_key_only() {
        let change = parse_change("table public.users: DELETE: id[integer]:7")
            .unwrap()
            .unwrap();
        assert_eq!(change.op, Op::Delete);
        assert_eq!(change.data.get("id"), Some(&json!(7)));

        let change = parse_change("table public.logs: DELETE: (no-tuple-data)")
            .unwrap()
            .unwrap();
        assert!(change.data.is_empty());
    }

    #[test]
    fn test_markers_are_ignored() {
        assert_eq!(parse_change("BEGIN 529").unwrap(), None);
        assert_eq!(parse_change("COMMIT 529").unwrap(), None);
        assert_eq!(parse_change("table public.users: TRUNCATE: (no-flags)").unwrap(), None);
        assert!(is_commit("COMMIT 529"));
        assert!(!is_commit("BEGIN 529"));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_change("table public.users").is_err());
        assert!(parse_change("table public.users: INSERT: id[integer:1").is_err());
        assert!(parse_change("table public.users: INSERT: name[text]:'open").is_err());
    }
}
