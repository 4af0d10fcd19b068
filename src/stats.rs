use serde::{Deserialize, Serialize};

/// Counters for one run; never persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub host_calls: u64,
    pub fetch_requests: u64,
    pub fetch_bytes: u64,
    pub fetch_errors: u64,
    pub package_installs: u64,
}
