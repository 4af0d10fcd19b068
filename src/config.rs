use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Option names recognized by [`crate::QuotaPolicy::derive`].
pub const OPTION_NAMES: &[&str] = &[
    "codeExecEnabled",
    "netFetchEnabled",
    "pkgInstallEnabled",
    "execTimeoutMs",
    "execMemoryMb",
    "execStackKb",
    "execMaxHostCalls",
    "execMaxLogLines",
    "execMaxOutputBytes",
    "netMaxRequestsPerRun",
    "netMaxParallelRequests",
    "netRequestTimeoutMs",
    "netMaxResponseBytes",
    "netMaxTotalDownloadBytes",
    "netMaxRedirects",
    "pkgInstallTimeoutMs",
    "pkgMaxSpecLength",
    "pkgMaxModuleBytes",
    "pkgMaxTotalInstallBytesPerRun",
    "pkgMaxInstallsPerRun",
];

/// Raw, unvalidated configuration keyed by camelCase option name
///
/// Values stay as text; interpretation (and defaulting) happens in
/// `QuotaPolicy::derive`, so a bad value never fails construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    values: BTreeMap<String, String>,
}

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every known option from its SCREAMING_SNAKE_CASE environment variable
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RawConfig::from_env`] with an injectable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let values = OPTION_NAMES
            .iter()
            .filter_map(|option| lookup(&env_var_name(option)).map(|v| (option.to_string(), v)))
            .collect();
        Self { values }
    }

    /// Build from a JSON object; strings, numbers and booleans are kept
    pub fn from_json(value: &JsonValue) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let values = object
            .iter()
            .filter_map(|(key, value)| {
                let text = match value {
                    JsonValue::String(s) => s.clone(),
                    JsonValue::Number(n) => n.to_string(),
                    JsonValue::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.clone(), text))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, option: &str) -> Option<&str> {
        self.values.get(option).map(String::as_str)
    }

    pub fn set(&mut self, option: impl Into<String>, value: impl Into<String>) {
        self.values.insert(option.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// `execTimeoutMs` -> `EXEC_TIMEOUT_MS`
pub fn env_var_name(option: &str) -> String {
    let mut out = String::with_capacity(option.len() + 8);
    for (i, ch) in option.chars().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
    }
    out
}

/// Parse a positive number, flooring decimals. Anything else is `None`.
pub(crate) fn parse_positive(raw: Option<&str>) -> Option<u64> {
    let value: f64 = raw?.trim().parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let floored = value.floor();
    if floored < 1.0 || floored > u64::MAX as f64 {
        return None;
    }
    Some(floored as u64)
}

/// Recognized boolean tokens; unrecognized text is `None`.
pub(crate) fn parse_flag(raw: Option<&str>) -> Option<bool> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("execTimeoutMs"), "EXEC_TIMEOUT_MS");
        assert_eq!(
            env_var_name("pkgMaxTotalInstallBytesPerRun"),
            "PKG_MAX_TOTAL_INSTALL_BYTES_PER_RUN"
        );
    }

    #[test]
    fn test_from_lookup_only_known_options() {
        let config = RawConfig::from_lookup(|name| match name {
            "EXEC_TIMEOUT_MS" => Some("500".to_string()),
            "NET_FETCH_ENABLED" => Some("off".to_string()),
            _ => None,
        });

        assert_eq!(config.get("execTimeoutMs"), Some("500"));
        assert_eq!(config.get("netFetchEnabled"), Some("off"));
        assert_eq!(config.get("execMemoryMb"), None);
    }

    #[test]
    fn test_from_json_keeps_scalars() {
        let config = RawConfig::from_json(&json!({
            "execTimeoutMs": 100,
            "codeExecEnabled": false,
            "execMemoryMb": "8",
            "ignored": { "nested": true },
        }));

        assert_eq!(config.get("execTimeoutMs"), Some("100"));
        assert_eq!(config.get("codeExecEnabled"), Some("false"));
        assert_eq!(config.get("execMemoryMb"), Some("8"));
        assert_eq!(config.get("ignored"), None);
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive(Some("42")), Some(42));
        assert_eq!(parse_positive(Some(" 7.9 ")), Some(7));
        assert_eq!(parse_positive(Some("0.5")), None);
        assert_eq!(parse_positive(Some("0")), None);
        assert_eq!(parse_positive(Some("-3")), None);
        assert_eq!(parse_positive(Some("abc")), None);
        assert_eq!(parse_positive(Some("NaN")), None);
        assert_eq!(parse_positive(None), None);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag(Some("TRUE")), Some(true));
        assert_eq!(parse_flag(Some(" off ")), Some(false));
        assert_eq!(parse_flag(Some("maybe")), None);
        assert_eq!(parse_flag(None), None);
    }
}
