use crate::config::{RawConfig, parse_flag, parse_positive};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits for one sandbox run
///
/// Built once from configuration and never mutated while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPolicy {
    pub code_exec_enabled: bool,
    pub net_fetch_enabled: bool,
    pub pkg_install_enabled: bool,

    /// Wall-clock budget for the whole run (default: 2s)
    pub exec_timeout_ms: u64,
    /// Interpreter heap ceiling in MB (default: 32MB)
    pub exec_memory_mb: u64,
    /// Interpreter stack ceiling in KB (default: 512KB)
    pub exec_stack_kb: u64,
    /// Privileged calls allowed per run, across all host functions (default: 25)
    pub exec_max_host_calls: u64,
    /// Console lines kept; extra lines are dropped silently (default: 120)
    pub exec_max_log_lines: u64,
    /// Serialized result size before clamping (default: 64KB)
    pub exec_max_output_bytes: u64,

    pub net_max_requests_per_run: u64,
    /// Declared only: the drain loop settles one request at a time
    pub net_max_parallel_requests: u64,
    pub net_request_timeout_ms: u64,
    pub net_max_response_bytes: u64,
    pub net_max_total_download_bytes: u64,
    pub net_max_redirects: u64,

    pub pkg_install_timeout_ms: u64,
    pub pkg_max_spec_length: u64,
    pub pkg_max_module_bytes: u64,
    /// Caps bytes prefetched into the module store per run
    pub pkg_max_total_install_bytes_per_run: u64,
    pub pkg_max_installs_per_run: u64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            code_exec_enabled: true,
            net_fetch_enabled: true,
            pkg_install_enabled: true,
            exec_timeout_ms: 2_000,
            exec_memory_mb: 32,
            exec_stack_kb: 512,
            exec_max_host_calls: 25,
            exec_max_log_lines: 120,
            exec_max_output_bytes: 65_536,
            net_max_requests_per_run: 25,
            net_max_parallel_requests: 4,
            net_request_timeout_ms: 10_000,
            net_max_response_bytes: 2 * 1024 * 1024,
            net_max_total_download_bytes: 10 * 1024 * 1024,
            net_max_redirects: 5,
            pkg_install_timeout_ms: 15_000,
            pkg_max_spec_length: 120,
            pkg_max_module_bytes: 3 * 1024 * 1024,
            pkg_max_total_install_bytes_per_run: 15 * 1024 * 1024,
            pkg_max_installs_per_run: 5,
        }
    }
}

impl QuotaPolicy {
    /// Derive a policy from raw configuration
    ///
    /// Each field falls back to its default on its own when the option is
    /// absent, unparsable, or not positive. Never fails.
    pub fn derive(raw: &RawConfig) -> Self {
        let d = Self::default();
        let num = |option: &str, default: u64| parse_positive(raw.get(option)).unwrap_or(default);
        let flag = |option: &str, default: bool| parse_flag(raw.get(option)).unwrap_or(default);

        Self {
            code_exec_enabled: flag("codeExecEnabled", d.code_exec_enabled),
            net_fetch_enabled: flag("netFetchEnabled", d.net_fetch_enabled),
            pkg_install_enabled: flag("pkgInstallEnabled", d.pkg_install_enabled),
            exec_timeout_ms: num("execTimeoutMs", d.exec_timeout_ms),
            exec_memory_mb: num("execMemoryMb", d.exec_memory_mb),
            exec_stack_kb: num("execStackKb", d.exec_stack_kb),
            exec_max_host_calls: num("execMaxHostCalls", d.exec_max_host_calls),
            exec_max_log_lines: num("execMaxLogLines", d.exec_max_log_lines),
            exec_max_output_bytes: num("execMaxOutputBytes", d.exec_max_output_bytes),
            net_max_requests_per_run: num("netMaxRequestsPerRun", d.net_max_requests_per_run),
            net_max_parallel_requests: num("netMaxParallelRequests", d.net_max_parallel_requests),
            net_request_timeout_ms: num("netRequestTimeoutMs", d.net_request_timeout_ms),
            net_max_response_bytes: num("netMaxResponseBytes", d.net_max_response_bytes),
            net_max_total_download_bytes: num(
                "netMaxTotalDownloadBytes",
                d.net_max_total_download_bytes,
            ),
            net_max_redirects: num("netMaxRedirects", d.net_max_redirects),
            pkg_install_timeout_ms: num("pkgInstallTimeoutMs", d.pkg_install_timeout_ms),
            pkg_max_spec_length: num("pkgMaxSpecLength", d.pkg_max_spec_length),
            pkg_max_module_bytes: num("pkgMaxModuleBytes", d.pkg_max_module_bytes),
            pkg_max_total_install_bytes_per_run: num(
                "pkgMaxTotalInstallBytesPerRun",
                d.pkg_max_total_install_bytes_per_run,
            ),
            pkg_max_installs_per_run: num("pkgMaxInstallsPerRun", d.pkg_max_installs_per_run),
        }
    }

    /// Shorthand for `derive(&RawConfig::from_env())`
    pub fn from_env() -> Self {
        Self::derive(&RawConfig::from_env())
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn net_request_timeout(&self) -> Duration {
        Duration::from_millis(self.net_request_timeout_ms)
    }

    pub fn pkg_install_timeout(&self) -> Duration {
        Duration::from_millis(self.pkg_install_timeout_ms)
    }

    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.exec_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn stack_limit_bytes(&self) -> usize {
        usize::try_from(self.exec_stack_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(QuotaPolicy::derive(&RawConfig::new()), QuotaPolicy::default());
    }

    #[test]
    fn test_each_field_defaults_independently() {
        let raw: RawConfig = [
            ("execTimeoutMs", "750"),
            ("execMemoryMb", "-1"),
            ("execStackKb", "lots"),
            ("netMaxRedirects", "0"),
            ("pkgMaxInstallsPerRun", "2.9"),
        ]
        .into_iter()
        .collect();

        let policy = QuotaPolicy::derive(&raw);
        assert_eq!(policy.exec_timeout_ms, 750);
        assert_eq!(policy.exec_memory_mb, 32);
        assert_eq!(policy.exec_stack_kb, 512);
        assert_eq!(policy.net_max_redirects, 5);
        assert_eq!(policy.pkg_max_installs_per_run, 2);
        assert_eq!(policy.exec_max_host_calls, 25);
    }

    #[test]
    fn test_flags() {
        let raw: RawConfig = [
            ("codeExecEnabled", "no"),
            ("netFetchEnabled", "bogus"),
            ("pkgInstallEnabled", "0"),
        ]
        .into_iter()
        .collect();

        let policy = QuotaPolicy::derive(&raw);
        assert!(!policy.code_exec_enabled);
        assert!(policy.net_fetch_enabled);
        assert!(!policy.pkg_install_enabled);
    }

    #[test]
    fn test_serializes_camel_case() {
        let value = serde_json::to_value(QuotaPolicy::default()).unwrap();
        assert_eq!(value["execTimeoutMs"], 2000);
        assert_eq!(value["pkgMaxTotalInstallBytesPerRun"], 15_728_640);
        assert_eq!(value["codeExecEnabled"], true);
    }

    #[test]
    fn test_byte_conversions() {
        let policy = QuotaPolicy::default();
        assert_eq!(policy.memory_limit_bytes(), 32 * 1024 * 1024);
        assert_eq!(policy.stack_limit_bytes(), 512 * 1024);
        assert_eq!(policy.exec_timeout(), Duration::from_secs(2));
    }
}
