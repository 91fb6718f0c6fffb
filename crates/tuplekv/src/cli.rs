//! CLI command handlers
//!
//! Every handler writes JSON lines to the given writer.

use std::io::Write;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use serde_json::{json, Value};

use tuplekv_storage::{EntryMaybe, Key, KeyPart, KvStore, ListOptions, Selector, SelectorSpec};

/// Parse a command-line segment: integers and booleans keep their type,
/// everything else is a string
pub fn parse_segment(raw: &str) -> KeyPart {
    if let Ok(n) = raw.parse::<i64>() {
        return KeyPart::Integer(n);
    }
    match raw {
        "true" => KeyPart::Bool(true),
        "false" => KeyPart::Bool(false),
        _ => KeyPart::String(raw.to_string()),
    }
}

pub fn parse_key(segments: &[String]) -> Key {
    segments.iter().map(|s| parse_segment(s)).collect()
}

fn non_empty(segments: &[String]) -> Option<Key> {
    (!segments.is_empty()).then(|| parse_key(segments))
}

/// Print one entry; absent keys print `"value": null`
pub async fn handle_get(store: &KvStore, segments: &[String], out: &mut impl Write) -> Result<()> {
    let entry: EntryMaybe<Value> = store.get(&parse_key(segments)).await?;
    writeln!(out, "{}", serde_json::to_string(&entry)?)?;
    Ok(())
}

pub async fn handle_set(
    store: &KvStore,
    segments: &[String],
    value: &str,
    out: &mut impl Write,
) -> Result<()> {
    let value: Value = serde_json::from_str(value).context("--value must be valid JSON")?;
    let key = parse_key(segments);
    store.set(&key, &value).await?;
    writeln!(out, "{}", json!({ "key": key, "ok": true }))?;
    Ok(())
}

pub async fn handle_delete(store: &KvStore, segments: &[String], out: &mut impl Write) -> Result<()> {
    let key = parse_key(segments);
    store.delete(&key).await?;
    writeln!(out, "{}", json!({ "key": key, "ok": true }))?;
    Ok(())
}

/// Arguments of the `list` subcommand
#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    pub prefix: Vec<String>,
    pub start: Vec<String>,
    pub end: Vec<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

pub async fn handle_list(store: &KvStore, args: &ListArgs, out: &mut impl Write) -> Result<()> {
    let spec = SelectorSpec {
        prefix: non_empty(&args.prefix),
        start: non_empty(&args.start),
        end: non_empty(&args.end),
    };
    let options = ListOptions {
        limit: args.limit,
        reverse: args.reverse,
    };

    let mut stream = store.list::<Value>(Selector::try_from(spec)?, options)?;
    let mut count = 0usize;
    while let Some(entry) = stream.try_next().await? {
        writeln!(out, "{}", serde_json::to_string(&entry)?)?;
        count += 1;
    }
    tracing::debug!(count, "Listed entries");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuplekv_storage::key;

    fn segments(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_segment() {
        assert_eq!(parse_segment("42"), KeyPart::Integer(42));
        assert_eq!(parse_segment("-1"), KeyPart::Integer(-1));
        assert_eq!(parse_segment("true"), KeyPart::Bool(true));
        assert_eq!(parse_segment("alice"), KeyPart::String("alice".into()));
        assert_eq!(parse_segment("4x"), KeyPart::String("4x".into()));
    }

    #[tokio::test]
    async fn test_set_get_list_delete() {
        let store = KvStore::in_memory().await.unwrap();
        let mut out = Vec::new();

        handle_set(&store, &segments(&["users", "alice"]), r#"{"age": 30}"#, &mut out)
            .await
            .unwrap();
        handle_set(&store, &segments(&["users", "bob"]), "1", &mut out)
            .await
            .unwrap();
        out.clear();

        handle_get(&store, &segments(&["users", "alice"]), &mut out)
            .await
            .unwrap();
        let line: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line, json!({"key": ["users", "alice"], "value": {"age": 30}}));
        out.clear();

        let args = ListArgs {
            prefix: segments(&["users"]),
            reverse: true,
            ..ListArgs::default()
        };
        handle_list(&store, &args, &mut out).await.unwrap();
        let lines: Vec<Value> = String::from_utf8(out.clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], json!(["users", "bob"]));
        out.clear();

        handle_delete(&store, &segments(&["users", "bob"]), &mut out)
            .await
            .unwrap();
        let entry: EntryMaybe<Value> = store.get(&key!["users", "bob"]).await.unwrap();
        assert!(!entry.is_present());
    }

    #[tokio::test]
    async fn test_list_requires_selector() {
        let store = KvStore::in_memory().await.unwrap();
        let args = ListArgs {
            start: segments(&["a"]),
            ..ListArgs::default()
        };
        assert!(handle_list(&store, &args, &mut Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_json() {
        let store = KvStore::in_memory().await.unwrap();
        let err = handle_set(&store, &segments(&["k"]), "{nope", &mut Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--value must be valid JSON"));
    }
}
