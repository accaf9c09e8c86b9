//! Parser registry and execution.
//!
//! Parsers run as short-lived subprocesses rather than in-process modules:
//! a Rust host can't import Python/JS/bash source directly, so the
//! interpreter is invoked with the stored source file as its argument, fed
//! `{"payload", "config"}` as a single JSON line on stdin, and expected to
//! print one JSON object to stdout. This keeps the
//! `parse(payload, config) -> map<metric_id, value>` capability interface
//! while staying within what Rust can execute natively, following the
//! same stdio JSON-exchange shape used for subprocess tool calls
//! elsewhere in this codebase.

pub mod store;

use crate::error::{RelayError, Result};
use crate::model::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use store::{Language, ParserStore};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

const PARSER_TIMEOUT: Duration = Duration::from_secs(10);

/// A parser's raw output: string keys, some of which parse as integer
/// `metric_id`s (real points) and the rest of which are metadata folded
/// into `meta_json`.
pub type ParserOutput = HashMap<String, Value>;

pub struct ParserRegistry {
    store: ParserStore,
}

impl ParserRegistry {
    pub fn new(store: ParserStore) -> Self {
        Self { store }
    }

    /// Run `parser` over `payload_decoded` with `config`: resolve the
    /// source by (name, version, language), then invoke it.
    pub async fn run(&self, parser: &Parser, payload: &Value, config: &Value) -> Result<ParserOutput> {
        let lang: Language = parser
            .language
            .parse()
            .map_err(|_| RelayError::LanguageNotHandled(parser.id, parser.language.clone()))?;

        let source_path = self.materialize_for_exec(parser, lang)?;
        run_subprocess(lang, &source_path, payload, config).await
    }

    /// The subprocess entrypoint needs a real file path with the right
    /// extension (interpreters dispatch on it); `ParserStore::get` already
    /// keeps that file around, so just resolve its path instead of
    /// re-reading and rewriting the source.
    fn materialize_for_exec(&self, parser: &Parser, lang: Language) -> Result<std::path::PathBuf> {
        // Touch the store to raise ParserCodeNotFound with the right id if
        // the extensioned file is missing, then build a concrete path.
        self.store.get(&parser.name, &parser.version, lang, parser.id)?;
        let slug = store::slug(&parser.name, &parser.version);
        Ok(self.store.root().join(format!("{slug}.{}", lang.extension())))
    }
}

async fn run_subprocess(
    lang: Language,
    source_path: &std::path::Path,
    payload: &Value,
    config: &Value,
) -> Result<ParserOutput> {
    let mut cmd = match lang {
        Language::Python => {
            let mut c = Command::new("python3");
            c.arg(source_path);
            c
        }
        Language::Javascript => {
            let mut c = Command::new("node");
            c.arg(source_path);
            c
        }
        Language::Bash => {
            let mut c = Command::new("bash");
            c.arg(source_path);
            c
        }
    };

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RelayError::ParserRuntime(format!("failed to spawn interpreter: {e}")))?;

    let request = serde_json::json!({ "payload": payload, "config": config });
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(request.to_string().as_bytes())
            .await
            .map_err(|e| RelayError::ParserRuntime(format!("failed to write stdin: {e}")))?;
    }

    let output = timeout(PARSER_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| RelayError::ParserRuntime("parser timed out".to_string()))?
        .map_err(|e| RelayError::ParserRuntime(format!("failed to wait on child: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RelayError::ParserRuntime(format!(
            "parser exited with {}: {}",
            output.status, stderr
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim())
        .map_err(|e| RelayError::ParserRuntime(format!("parser did not print a JSON object: {e}")))
}

/// Split a parser's raw output into `(metric points, metadata)`:
/// integer-parsing keys are metric ids, everything else (including
/// `"at"`) is metadata.
pub fn split_metrics_and_meta(output: ParserOutput) -> (HashMap<i64, Value>, serde_json::Map<String, Value>) {
    let mut metrics = HashMap::new();
    let mut meta = serde_json::Map::new();
    for (key, value) in output {
        match key.parse::<i64>() {
            Ok(metric_id) => {
                metrics.insert(metric_id, value);
            }
            Err(_) => {
                meta.insert(key, value);
            }
        }
    }
    (metrics, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_integer_keys_from_metadata() {
        let mut output = HashMap::new();
        output.insert("7".to_string(), json!(12.3));
        output.insert("at".to_string(), json!("2024-05-01T10:00:00Z"));
        output.insert("battery_low".to_string(), json!(true));

        let (metrics, meta) = split_metrics_and_meta(output);
        assert_eq!(metrics.get(&7), Some(&json!(12.3)));
        assert_eq!(meta.get("at"), Some(&json!("2024-05-01T10:00:00Z")));
        assert_eq!(meta.get("battery_low"), Some(&json!(true)));
        assert_eq!(metrics.len(), 1);
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn empty_output_splits_to_empty() {
        let (metrics, meta) = split_metrics_and_meta(HashMap::new());
        assert!(metrics.is_empty());
        assert!(meta.is_empty());
    }
}
