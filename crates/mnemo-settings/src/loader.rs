//! Settings loading: defaults, then the user file, then `MNEMO_*` variables.
//!
//! The user file is deep-merged over the serialized defaults before typed
//! deserialization, so nested objects only need the keys they change. A
//! `null` in the file keeps the default; arrays and scalars replace it.
//!
//! Environment overrides go through [`EnvOverrides`], which reads from any
//! lookup function. The process environment is just one such lookup, so the
//! override table is testable without mutating global state.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{CompactionMode, MnemoSettings};

/// Directory holding Mnemo's files (`~/.mnemo`).
pub fn mnemo_home() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".mnemo")
}

/// `$MNEMO_SETTINGS`, or `~/.mnemo/settings.json`.
pub fn settings_path() -> PathBuf {
    process_env("MNEMO_SETTINGS").map_or_else(|| mnemo_home().join("settings.json"), PathBuf::from)
}

/// Load from [`settings_path`] with overrides from the process environment.
pub fn load_settings() -> Result<MnemoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with overrides from the process environment.
///
/// A missing file yields defaults. Malformed JSON and out-of-range values
/// are errors; malformed environment values are logged and skipped.
pub fn load_settings_from_path(path: &Path) -> Result<MnemoSettings> {
    load_with_env(path, process_env)
}

fn load_with_env(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<MnemoSettings> {
    let mut merged = serde_json::to_value(MnemoSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "merging settings file");
            merged = deep_merge(merged, serde_json::from_str(&text)?);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
        }
        Err(e) => return Err(e.into()),
    }

    let mut settings: MnemoSettings = serde_json::from_value(merged)?;
    EnvOverrides::new(lookup).apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Merge `source` into `target`, recursing through objects.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut into), Value::Object(from)) => {
            for (key, value) in from.into_iter().filter(|(_, v)| !v.is_null()) {
                let next = match into.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = into.insert(key, next);
            }
            Value::Object(into)
        }
        (_, source) => source,
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Typed reads of `MNEMO_*` variables from a lookup function.
pub struct EnvOverrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvOverrides<F> {
    /// Wrap a variable lookup.
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Overwrite every field whose variable is set and valid.
    pub fn apply(&self, s: &mut MnemoSettings) {
        if let Some(v) = self.parsed("MNEMO_MAX_TOKENS", |v| parse_u64_range(v, 1, 10_000_000)) {
            s.budget.max_tokens = v;
        }
        if let Some(v) = self.parsed("MNEMO_SUMMARIZATION_RATIO", |v| parse_f64_range(v, 0.01, 1.0)) {
            s.budget.summarization_ratio = v;
        }
        if let Some(v) = self.parsed("MNEMO_PRESERVE_RECENT", |v| parse_u64_range(v, 0, 10_000)) {
            s.compaction.preserve_recent = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = self.parsed("MNEMO_SUMMARY_TIMEOUT_MS", |v| parse_u64_range(v, 100, 600_000)) {
            s.compaction.timeout_ms = v;
        }
        if let Some(v) = self.parsed("MNEMO_SUMMARY_MAX_ATTEMPTS", |v| parse_u64_range(v, 1, 20)) {
            s.compaction.retry.max_attempts = u32::try_from(v).unwrap_or(1);
        }
        if let Some(v) = self.parsed("MNEMO_COMPACTION_MODE", parse_compaction_mode) {
            s.compaction.mode = v;
        }
        if let Some(v) = self.parsed("MNEMO_EXTRACTION_TIMEOUT_MS", |v| parse_u64_range(v, 10, 600_000)) {
            s.extraction.timeout_ms = v;
        }
        if let Some(v) = self.parsed("MNEMO_TRACK_MESSAGES", parse_bool) {
            s.extraction.track_messages = v;
        }
        if let Some(v) = self.raw("MNEMO_SESSION_PATH") {
            s.persistence.session_path = Some(v);
        }
        if let Some(v) = self.parsed("MNEMO_AUTOSAVE_INTERVAL_MS", |v| parse_u64_range(v, 10, 3_600_000)) {
            s.persistence.autosave_interval_ms = Some(v);
        }
        if let Some(v) = self.raw("MNEMO_LOG_LEVEL") {
            s.logging.level = v;
        }
        if let Some(v) = self.parsed("MNEMO_LOG_JSON", parse_bool) {
            s.logging.json = v;
        }
    }

    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let raw = self.raw(name)?;
        let value = parse(&raw);
        if value.is_none() {
            warn!(key = name, value = %raw, "ignoring invalid environment override");
        }
        value
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Integer within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim().parse().ok().filter(|n| (min..=max).contains(n))
}

/// Finite float within `min..=max`.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    val.trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && (min..=max).contains(n))
}

/// `inline` or `background`, case-insensitive.
pub fn parse_compaction_mode(val: &str) -> Option<CompactionMode> {
    match val.trim().to_ascii_lowercase().as_str() {
        "inline" => Some(CompactionMode::Inline),
        "background" => Some(CompactionMode::Background),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn nested_objects_merge_per_key() {
        let merged = deep_merge(
            json!({"budget": {"maxTokens": 1000, "summarizationRatio": 0.8}}),
            json!({"budget": {"maxTokens": 5000}}),
        );
        assert_eq!(merged, json!({"budget": {"maxTokens": 5000, "summarizationRatio": 0.8}}));
    }

    #[test]
    fn null_keeps_and_scalars_replace() {
        let merged = deep_merge(
            json!({"a": 1, "b": {"deep": true}, "c": [1, 2]}),
            json!({"a": null, "b": 7, "c": [3]}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 7, "c": [3]}));
    }

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_with_env(&dir.path().join("absent.json"), no_env).unwrap();
        assert_eq!(settings, MnemoSettings::default());
    }

    #[test]
    fn partial_file_overrides_only_its_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"budget": {"maxTokens": 1000}, "compaction": {"retry": {"maxAttempts": 5}, "mode": "background"}}"#,
        )
        .unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.budget.max_tokens, 1000);
        assert!((settings.budget.summarization_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(settings.compaction.retry.max_attempts, 5);
        assert_eq!(settings.compaction.retry.base_delay_ms, 500);
        assert_eq!(settings.compaction.mode, CompactionMode::Background);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert_matches!(load_with_env(&path, no_env), Err(SettingsError::Json(_)));
    }

    #[test]
    fn out_of_range_file_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"budget": {"summarizationRatio": 2.0}}"#).unwrap();
        assert_matches!(
            load_with_env(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        );
    }

    #[test]
    fn env_beats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"budget": {"maxTokens": 1000}}"#).unwrap();

        let lookup = env(&[
            ("MNEMO_MAX_TOKENS", "4096"),
            ("MNEMO_SUMMARIZATION_RATIO", "0.5"),
            ("MNEMO_PRESERVE_RECENT", "4"),
            ("MNEMO_COMPACTION_MODE", "Background"),
            ("MNEMO_TRACK_MESSAGES", "off"),
            ("MNEMO_SESSION_PATH", "/tmp/s.json"),
            ("MNEMO_AUTOSAVE_INTERVAL_MS", "2000"),
        ]);
        let settings = load_with_env(&path, lookup).unwrap();
        assert_eq!(settings.budget.max_tokens, 4096);
        assert!((settings.budget.summarization_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(settings.compaction.preserve_recent, 4);
        assert_eq!(settings.compaction.mode, CompactionMode::Background);
        assert!(!settings.extraction.track_messages);
        assert_eq!(settings.persistence.session_path.as_deref(), Some("/tmp/s.json"));
        assert_eq!(settings.persistence.autosave_interval_ms, Some(2_000));
    }

    #[test]
    fn invalid_env_values_are_skipped() {
        let mut settings = MnemoSettings::default();
        EnvOverrides::new(env(&[
            ("MNEMO_MAX_TOKENS", "0"),
            ("MNEMO_SUMMARIZATION_RATIO", "NaN"),
            ("MNEMO_LOG_JSON", "maybe"),
            ("MNEMO_LOG_LEVEL", "  "),
            ("MNEMO_AUTOSAVE_INTERVAL_MS", "0"),
        ]))
        .apply(&mut settings);
        assert_eq!(settings, MnemoSettings::default());
    }

    #[test]
    fn scalar_parsers() {
        assert_eq!(parse_bool(" YES "), Some(true));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u64_range("10", 1, 10), Some(10));
        assert_eq!(parse_u64_range("-3", 0, 10), None);
        assert_eq!(parse_f64_range("1.2", 0.0, 1.0), None);
        assert_eq!(parse_compaction_mode("later"), None);
    }
}
