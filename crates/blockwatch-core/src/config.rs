//! Environment variable helpers shared by the binaries' `Config::from_env`.

use std::str::FromStr;

use crate::{Error, Result};

/// Read `key` and parse it, falling back to `default` when unset or blank.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        _ => Ok(default),
    }
}

/// Read `key` as a string, falling back to `default`.
pub fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Read `key` as a boolean. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("{key}={raw:?}: expected a boolean"))),
        },
        _ => Ok(default),
    }
}

/// Read `key` as a comma-separated list, dropping blank items.
pub fn env_list(key: &str, default: &str) -> Vec<String> {
    env_string(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
