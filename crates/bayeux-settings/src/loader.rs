//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BayeuxSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `BAYEUX_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BayeuxSettings;

/// Default settings file location (`~/.bayeux/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".bayeux").join("settings.json")
}

/// Load settings from [`settings_path`].
pub fn load_settings() -> Result<BayeuxSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path`, falling back to defaults when it is missing.
///
/// Invalid JSON and values rejected by [`BayeuxSettings::validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<BayeuxSettings> {
    let defaults = serde_json::to_value(BayeuxSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BayeuxSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, anything else in `source` replaces `target`.
/// Nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BAYEUX_*` environment overrides.
///
/// Unparseable or out-of-range values are logged and ignored.
pub fn apply_env_overrides(settings: &mut BayeuxSettings) {
    // server
    if let Some(v) = read_env_string("BAYEUX_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("BAYEUX_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("BAYEUX_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_u64("BAYEUX_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }

    // transport
    let t = &mut settings.transport;
    if let Some(v) = read_env_u64("BAYEUX_TIMEOUT_MS", 0, 3_600_000) {
        t.timeout_ms = v;
    }
    if let Some(v) = read_env_u64("BAYEUX_INTERVAL_MS", 0, 3_600_000) {
        t.interval_ms = v;
    }
    if let Some(v) = read_env_u64("BAYEUX_MAX_INTERVAL_MS", 0, 3_600_000) {
        t.max_interval_ms = v;
    }
    if let Some(v) = read_env_u64("BAYEUX_MAX_LAZY_TIMEOUT_MS", 0, 3_600_000) {
        t.max_lazy_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("BAYEUX_MAX_MESSAGE_SIZE", 0, usize::MAX) {
        t.max_message_size = v;
    }
    if let Some(v) = read_env_u16("BAYEUX_DUPLICATE_META_CONNECT_STATUS", 100, 599) {
        t.duplicate_meta_connect_status = v;
    }
    if let Some(v) = read_env_bool("BAYEUX_HANDSHAKE_DELIVERY") {
        t.allow_message_delivery_during_handshake = v;
    }
    if let Some(v) = read_env_bool("BAYEUX_META_CONNECT_DELIVERY_ONLY") {
        t.meta_connect_delivery_only = v;
    }
    if let Some(v) = read_env_u64("BAYEUX_SWEEP_PERIOD_MS", 1, 600_000) {
        t.sweep_period_ms = v;
    }

    // logging
    if let Some(v) = read_env_string("BAYEUX_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("BAYEUX_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` within `min..=max`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_parsed<T>(name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
    }
    result
}

fn read_env_bool(name: &str) -> Option<bool> {
    read_env_parsed(name, "bool", parse_bool)
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    read_env_parsed(name, "u16", |v| parse_u16_range(v, min, max))
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    read_env_parsed(name, "u64", |v| parse_u64_range(v, min, max))
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    read_env_parsed(name, "usize", |v| parse_usize_range(v, min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use serde_json::json;

    #[test]
    fn merge_nested_override_keeps_siblings() {
        let merged = deep_merge(
            json!({"transport": {"timeoutMs": 30000, "intervalMs": 0}}),
            json!({"transport": {"timeoutMs": 500}}),
        );
        assert_eq!(merged["transport"]["timeoutMs"], 500);
        assert_eq!(merged["transport"]["intervalMs"], 0);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1, "b": 2}), json!({"a": null}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_array_and_primitive_replace() {
        let merged = deep_merge(json!({"a": [1, 2], "b": {"c": 1}}), json!({"a": [3], "b": 4}));
        assert_eq!(merged, json!({"a": [3], "b": 4}));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.transport.timeout_ms, 30_000);
        assert_eq!(settings.transport.sweep_period_ms, 997);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9090}, "transport": {"maxLazyTimeoutMs": 250, "allowMessageDeliveryDuringHandshake": true}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.transport.max_lazy_timeout_ms, 250);
        assert!(settings.transport.allow_message_delivery_during_handshake);
        assert_eq!(settings.transport.timeout_ms, 30_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"transport": {"duplicateMetaConnectStatus": 7}}"#).unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
    }

    #[test]
    fn settings_path_under_home() {
        let path = settings_path();
        assert!(path.ends_with(".bayeux/settings.json"));
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "TRUE", "1", "yes", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range(" 500 ", 0, 1000), Some(500));
        assert_eq!(parse_u64_range("-1", 0, 1000), None);
        assert_eq!(parse_usize_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("10", 0, 10), Some(10));
    }
}
