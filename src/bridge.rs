//! Host side of the four privileged guest primitives
//!
//! Host functions exchange text only. Each returns a JSON envelope:
//! `{"ok":true,"value":…}`, `{"ok":true,"pending":<id>}` for deferred
//! operations, or `{"ok":false,"error":"…"}`. The bootstrap shim turns
//! errors into exceptions and pending ids into promises.

use crate::http::FetchInit;
use crate::log::{LogBuffer, LogEvent, LogLevel};
use crate::ops::{HostOp, HostRequest};
use crate::{QuotaPolicy, RuntimeState, SandboxError};
use serde_json::{Value as JsonValue, json};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// Global names the host functions are installed under
pub const HOST_LOG: &str = "__host_log";
pub const HOST_PKG_INSTALL: &str = "__host_pkg_install";
pub const HOST_PKG_LIST: &str = "__host_pkg_list";
pub const HOST_FETCH: &str = "__host_fetch";

pub const HOST_FUNCTIONS: [&str; 4] = [HOST_LOG, HOST_PKG_INSTALL, HOST_PKG_LIST, HOST_FETCH];

/// Per-run bridge state shared with the interpreter's host functions
pub struct HostBridge {
    policy: QuotaPolicy,
    host_calls: Cell<u64>,
    next_id: Cell<u32>,
    logs: RefCell<LogBuffer>,
    queue: RefCell<VecDeque<HostRequest>>,
    ledger: RefCell<RuntimeState>,
}

impl HostBridge {
    pub fn new(policy: QuotaPolicy, ledger: RuntimeState) -> Self {
        let logs = LogBuffer::new(policy.exec_max_log_lines);
        Self {
            policy,
            host_calls: Cell::new(0),
            next_id: Cell::new(1),
            logs: RefCell::new(logs),
            queue: RefCell::new(VecDeque::new()),
            ledger: RefCell::new(ledger),
        }
    }

    /// Dispatch a host function by its global name
    pub fn call(&self, function: &str, first: &str, second: &str) -> String {
        match function {
            HOST_LOG => self.log(first, second),
            HOST_PKG_INSTALL => self.pkg_install(first),
            HOST_PKG_LIST => self.pkg_list(),
            HOST_FETCH => self.fetch(first, second),
            other => failure(&format!("unknown host function {other}")),
        }
    }

    /// `log(level, text)`
    pub fn log(&self, level: &str, text: &str) -> String {
        if let Err(err) = self.charge() {
            return failure(&err.to_string());
        }
        let Ok(level) = level.parse::<LogLevel>() else {
            return failure(&format!("unsupported log level {level:?}"));
        };

        tracing::debug!(target: "codebox::guest", level = %level, "{}", text);
        self.logs.borrow_mut().push(level, text);
        success(JsonValue::Null)
    }

    /// `pkgInstall(spec)`: deferred
    pub fn pkg_install(&self, spec: &str) -> String {
        if let Err(err) = self.charge() {
            return failure(&err.to_string());
        }
        if !self.policy.pkg_install_enabled {
            return failure(&SandboxError::PkgInstallDisabled.to_string());
        }
        self.defer(HostOp::PkgInstall {
            spec: spec.to_string(),
        })
    }

    /// `pkgList()`
    pub fn pkg_list(&self) -> String {
        if let Err(err) = self.charge() {
            return failure(&err.to_string());
        }
        success(json!(self.ledger.borrow().packages()))
    }

    /// `fetch(url, initJson)`: deferred
    pub fn fetch(&self, url: &str, init: &str) -> String {
        if let Err(err) = self.charge() {
            return failure(&err.to_string());
        }
        if !self.policy.net_fetch_enabled {
            return failure(&SandboxError::NetFetchDisabled.to_string());
        }

        let init: FetchInit = if init.trim().is_empty() {
            FetchInit::default()
        } else {
            match serde_json::from_str(init) {
                Ok(init) => init,
                Err(err) => return failure(&format!("invalid fetch init: {err}")),
            }
        };
        self.defer(HostOp::Fetch {
            url: url.to_string(),
            init,
        })
    }

    /// Count a host call; fails once the count exceeds the budget
    fn charge(&self) -> Result<(), SandboxError> {
        let calls = self.host_calls.get() + 1;
        self.host_calls.set(calls);
        if calls > self.policy.exec_max_host_calls {
            tracing::warn!(calls, limit = self.policy.exec_max_host_calls, "host call budget exhausted");
            return Err(SandboxError::HostCallLimit(self.policy.exec_max_host_calls));
        }
        Ok(())
    }

    fn defer(&self, op: HostOp) -> String {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        self.queue.borrow_mut().push_back(HostRequest { id, op });
        json!({ "ok": true, "pending": id }).to_string()
    }

    /// Take every request queued since the last call
    pub fn take_queued(&self) -> Vec<HostRequest> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    /// Replace the snapshot `pkgList` reports
    pub fn publish_ledger(&self, ledger: &RuntimeState) {
        *self.ledger.borrow_mut() = ledger.clone();
    }

    pub fn host_calls(&self) -> u64 {
        self.host_calls.get()
    }

    pub fn take_logs(&self) -> Vec<LogEvent> {
        let max = self.policy.exec_max_log_lines;
        let logs = std::mem::replace(&mut *self.logs.borrow_mut(), LogBuffer::new(max));
        if logs.dropped() > 0 {
            tracing::debug!(dropped = logs.dropped(), kept = max, "console lines dropped");
        }
        logs.into_events()
    }
}

/// Settlement message handed to the shim's `__settle`
pub fn settlement(id: u32, outcome: &Result<JsonValue, SandboxError>) -> String {
    match outcome {
        Ok(value) => json!({ "id": id, "ok": true, "value": value }).to_string(),
        Err(err) => json!({ "id": id, "ok": false, "error": err.to_string() }).to_string(),
    }
}

fn success(value: JsonValue) -> String {
    json!({ "ok": true, "value": value }).to_string()
}

fn failure(message: &str) -> String {
    json!({ "ok": false, "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::sample_package;

    fn reply(text: &str) -> JsonValue {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_host_call_budget_is_global() {
        let policy = QuotaPolicy {
            exec_max_host_calls: 3,
            ..QuotaPolicy::default()
        };
        let bridge = HostBridge::new(policy, RuntimeState::new());

        assert_eq!(reply(&bridge.log("log", "a"))["ok"], true);
        assert_eq!(reply(&bridge.pkg_list())["ok"], true);
        assert_eq!(reply(&bridge.fetch("https://a.test", "{}"))["ok"], true);

        let fourth = reply(&bridge.log("log", "b"));
        assert_eq!(fourth["ok"], false);
        assert!(fourth["error"].as_str().unwrap().contains("host call budget"));
        assert_eq!(bridge.host_calls(), 4);
        assert_eq!(bridge.take_logs().len(), 1);
    }

    #[test]
    fn test_zero_budget_fails_first_call() {
        let policy = QuotaPolicy {
            exec_max_host_calls: 0,
            ..QuotaPolicy::default()
        };
        let bridge = HostBridge::new(policy, RuntimeState::new());
        assert_eq!(reply(&bridge.pkg_list())["ok"], false);
    }

    #[test]
    fn test_rejected_calls_still_count() {
        let policy = QuotaPolicy {
            exec_max_host_calls: 2,
            ..QuotaPolicy::default()
        };
        let bridge = HostBridge::new(policy, RuntimeState::new());

        assert_eq!(reply(&bridge.log("info", "x"))["ok"], false);
        assert_eq!(reply(&bridge.log("warn", "x"))["ok"], true);
        assert_eq!(reply(&bridge.log("warn", "x"))["ok"], false);
    }

    #[test]
    fn test_disabled_features() {
        let policy = QuotaPolicy {
            pkg_install_enabled: false,
            net_fetch_enabled: false,
            ..QuotaPolicy::default()
        };
        let bridge = HostBridge::new(policy, RuntimeState::new());

        let install = reply(&bridge.pkg_install("left-pad"));
        assert!(install["error"].as_str().unwrap().starts_with("PKG_INSTALL_DISABLED"));
        let fetch = reply(&bridge.fetch("https://a.test", ""));
        assert!(fetch["error"].as_str().unwrap().starts_with("NET_FETCH_DISABLED"));
        assert!(!bridge.has_queued());
    }

    #[test]
    fn test_deferred_ops_are_queued_in_order() {
        let bridge = HostBridge::new(QuotaPolicy::default(), RuntimeState::new());

        assert_eq!(reply(&bridge.pkg_install("left-pad"))["pending"], 1);
        assert_eq!(
            reply(&bridge.call(HOST_FETCH, "https://a.test", r#"{"method":"POST"}"#))["pending"],
            2
        );

        let queued = bridge.take_queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].op.name(), "pkgInstall");
        match &queued[1].op {
            HostOp::Fetch { url, init } => {
                assert_eq!(url, "https://a.test");
                assert_eq!(init.method.as_deref(), Some("POST"));
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(bridge.take_queued().is_empty());
    }

    #[test]
    fn test_invalid_fetch_init() {
        let bridge = HostBridge::new(QuotaPolicy::default(), RuntimeState::new());
        let bad = reply(&bridge.fetch("https://a.test", "{not json"));
        assert_eq!(bad["ok"], false);
    }

    #[test]
    fn test_pkg_list_reflects_published_ledger() {
        let bridge = HostBridge::new(QuotaPolicy::default(), RuntimeState::new());
        assert_eq!(reply(&bridge.pkg_list())["value"], json!([]));

        bridge.publish_ledger(&RuntimeState::from_packages([sample_package("zod")]));
        assert_eq!(reply(&bridge.pkg_list())["value"][0]["spec"], "zod");
    }

    #[test]
    fn test_log_lines_dropped_silently() {
        let policy = QuotaPolicy {
            exec_max_log_lines: 1,
            ..QuotaPolicy::default()
        };
        let bridge = HostBridge::new(policy, RuntimeState::new());
        assert_eq!(reply(&bridge.log("log", "kept"))["ok"], true);
        assert_eq!(reply(&bridge.log("error", "dropped"))["ok"], true);
        assert_eq!(bridge.take_logs(), vec![LogEvent {
            level: LogLevel::Log,
            message: "kept".into()
        }]);
    }

    #[test]
    fn test_settlement_shape() {
        let ok = reply(&settlement(7, &Ok(json!({"a": 1}))));
        assert_eq!(ok, json!({"id": 7, "ok": true, "value": {"a": 1}}));

        let err = reply(&settlement(8, &Err(SandboxError::RequestLimit(25))));
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "fetch request limit reached (25 per run)");
    }
}
