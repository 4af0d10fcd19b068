//! Execution session: one bounded run of untrusted code
//!
//! ```text
//! INIT -> CONFIGURED -> BOOTSTRAPPED -> RUNNING -> DRAINING -> DONE | TIMEOUT | ERROR
//!                                                                  \-> TEARDOWN (always)
//! ```
//!
//! Every failure is folded into the returned [`ExecuteResult`]; nothing is
//! raised to the caller.

use crate::bridge::{HOST_FUNCTIONS, HostBridge, settlement};
use crate::interpreter::{HostFunction, Interpreter, InterpreterLimits};
use crate::log::LogEvent;
use crate::modules::{ModuleStore, SharedModules, prefetch_graph};
use crate::net::fetch_bounded;
use crate::ops::{HostOp, TransportHandle};
use crate::output::{clamp, clean_message};
use crate::packages::PackageCache;
use crate::resolve::{Cdn, Locator, resolve_specifier, scan_imports};
use crate::shim::{BOOTSTRAP, FINISH, INIT, RESULT_GLOBAL, RUN, SETTLE};
use crate::{
    ErrorCode, InstalledPackage, QuotaPolicy, Result, RunStats, RuntimeState, SandboxError, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Instant;
use url::Url;

/// One run request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    #[serde(default)]
    pub input: JsonValue,
}

impl ExecuteInput {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            input: JsonValue::Null,
        }
    }

    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input = input;
        self
    }

    /// Accept a loosely-typed request, rejecting non-text code
    pub fn from_value(value: &JsonValue) -> Result<Self> {
        let code = match value.get("code") {
            Some(JsonValue::String(code)) => code.clone(),
            Some(_) => return Err(SandboxError::InvalidInput("code must be text".into())),
            None => return Err(SandboxError::InvalidInput("code is required".into())),
        };
        let input = value.get("input").cloned().unwrap_or(JsonValue::Null);
        Ok(Self { code, input })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&SandboxError> for ExecuteError {
    fn from(err: &SandboxError) -> Self {
        Self {
            code: err.code(),
            message: clean_message(&err.to_string()),
        }
    }
}

/// Result of one run; always fully populated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub ok: bool,
    pub result: JsonValue,
    pub logs: Vec<LogEvent>,
    pub stats: RunStats,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ExecuteError>,
}

impl ExecuteResult {
    fn success(result: JsonValue, logs: Vec<LogEvent>, stats: RunStats) -> Self {
        Self {
            ok: true,
            result,
            logs,
            stats,
            error: None,
        }
    }

    fn failure(err: &SandboxError, logs: Vec<LogEvent>, stats: RunStats) -> Self {
        Self {
            ok: false,
            result: JsonValue::Null,
            logs,
            stats,
            error: Some(ExecuteError::from(err)),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Guest operations, in bridge order
pub const OPERATIONS: [&str; 4] = ["log", "pkgInstall", "pkgList", "fetch"];

/// Globals the bootstrap exposes to guest code
pub const GUEST_GLOBALS: [&str; 5] = ["console", "fetch", "pkg", "input", RESULT_GLOBAL];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeFeatures {
    pub code_exec: bool,
    pub net_fetch: bool,
    pub pkg_install: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapabilities {
    pub engine: String,
    pub operations: Vec<String>,
    pub globals: Vec<String>,
    pub features: RuntimeFeatures,
    pub cdn: String,
}

/// Output of [`Sandbox::search`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub runtime: RuntimeCapabilities,
    pub limits: QuotaPolicy,
    pub packages: Vec<InstalledPackage>,
}

/// Guest jobs run per drain round
const JOBS_PER_ROUND: usize = 256;

/// Lifecycle phases, reported through tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Configured,
    Bootstrapped,
    Running,
    Draining,
    Done,
    Timeout,
    Error,
    Teardown,
}

/// How the bootstrap reports the end of a run
#[derive(Debug, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
enum GuestOutcome {
    Fulfilled { json: Option<String> },
    Rejected { error: String },
    Pending,
}

/// Entry point for running guest code against a quota policy
///
/// The ledger is borrowed per call and never stored. Calls against the same
/// ledger must be serialized by the caller.
pub struct Sandbox<I: Interpreter> {
    policy: QuotaPolicy,
    transport: TransportHandle,
    cdn: Cdn,
    _interpreter: PhantomData<fn() -> I>,
}

impl<I: Interpreter> Sandbox<I> {
    pub fn new(policy: QuotaPolicy, transport: TransportHandle) -> Self {
        Self {
            policy,
            transport,
            cdn: Cdn::default(),
            _interpreter: PhantomData,
        }
    }

    pub fn with_cdn(mut self, cdn: Cdn) -> Self {
        self.cdn = cdn;
        self
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Capability surface plus ledger, filtered by a case-insensitive `spec` substring
    pub fn search(&self, query: Option<&str>, ledger: &RuntimeState) -> SearchResult {
        SearchResult {
            runtime: RuntimeCapabilities {
                engine: I::ENGINE.to_string(),
                operations: OPERATIONS.iter().map(|s| s.to_string()).collect(),
                globals: GUEST_GLOBALS.iter().map(|s| s.to_string()).collect(),
                features: RuntimeFeatures {
                    code_exec: self.policy.code_exec_enabled,
                    net_fetch: self.policy.net_fetch_enabled,
                    pkg_install: self.policy.pkg_install_enabled,
                },
                cdn: self.cdn.base().to_string(),
            },
            limits: self.policy.clone(),
            packages: ledger.search(query),
        }
    }

    /// Run `input` once
    ///
    /// `persist` receives the updated ledger after each successful install.
    pub async fn execute(
        &self,
        input: ExecuteInput,
        ledger: &RuntimeState,
        persist: &mut dyn FnMut(&RuntimeState),
    ) -> ExecuteResult {
        if !self.policy.code_exec_enabled {
            return ExecuteResult::failure(&SandboxError::CodeExecDisabled, Vec::new(), RunStats::default());
        }
        if input.code.trim().is_empty() {
            let err = SandboxError::InvalidInput("code must be non-empty text".into());
            return ExecuteResult::failure(&err, Vec::new(), RunStats::default());
        }

        let started = Instant::now();
        let deadline = started + self.policy.exec_timeout();
        tracing::debug!(engine = I::ENGINE, code_len = input.code.len(), "sandbox run started");

        let modules = ModuleStore::shared(self.cdn.clone());
        let bridge = Rc::new(HostBridge::new(self.policy.clone(), ledger.clone()));
        let mut run = Run {
            policy: &self.policy,
            transport: &self.transport,
            cdn: &self.cdn,
            bridge: Rc::clone(&bridge),
            modules: Rc::clone(&modules),
            ledger: ledger.clone(),
            stats: RunStats::default(),
            deadline,
            persist,
        };

        let limits = InterpreterLimits {
            memory_bytes: self.policy.memory_limit_bytes(),
            stack_bytes: self.policy.stack_limit_bytes(),
            deadline,
        };

        let outcome = match I::create(limits, modules) {
            Ok(mut interpreter) => {
                phase(Phase::Configured);
                let outcome = run.drive(&mut interpreter, &input).await;
                phase(Phase::Teardown);
                interpreter.dispose();
                outcome
            }
            Err(err) => Err(err),
        };
        let outcome = outcome.map_err(|err| run.as_timeout(err));

        let mut stats = run.stats;
        stats.host_calls = bridge.host_calls();
        let logs = bridge.take_logs();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                tracing::debug!(elapsed_ms, host_calls = stats.host_calls, "sandbox run finished");
                ExecuteResult::success(result, logs, stats)
            }
            Err(err) => {
                tracing::debug!(elapsed_ms, code = %err.code(), error = %err, "sandbox run failed");
                ExecuteResult::failure(&err, logs, stats)
            }
        }
    }

    /// Same as [`Sandbox::execute`] for a loosely-typed request
    pub async fn execute_value(
        &self,
        request: &JsonValue,
        ledger: &RuntimeState,
        persist: &mut dyn FnMut(&RuntimeState),
    ) -> ExecuteResult {
        if !self.policy.code_exec_enabled {
            return ExecuteResult::failure(&SandboxError::CodeExecDisabled, Vec::new(), RunStats::default());
        }
        match ExecuteInput::from_value(request) {
            Ok(input) => self.execute(input, ledger, persist).await,
            Err(err) => ExecuteResult::failure(&err, Vec::new(), RunStats::default()),
        }
    }
}

fn phase(phase: Phase) {
    tracing::trace!(?phase, "sandbox phase");
}

/// State owned by a single run
struct Run<'a> {
    policy: &'a QuotaPolicy,
    transport: &'a TransportHandle,
    cdn: &'a Cdn,
    bridge: Rc<HostBridge>,
    modules: SharedModules,
    ledger: RuntimeState,
    stats: RunStats,
    deadline: Instant,
    persist: &'a mut dyn FnMut(&RuntimeState),
}

impl Run<'_> {
    async fn drive<I: Interpreter>(&mut self, interpreter: &mut I, input: &ExecuteInput) -> Result<JsonValue> {
        for name in HOST_FUNCTIONS {
            let bridge = Rc::clone(&self.bridge);
            let function: HostFunction = Rc::new(move |first: &str, second: &str| bridge.call(name, first, second));
            interpreter.install(name, function)?;
        }
        interpreter.eval(BOOTSTRAP)?;
        interpreter.call(INIT, &input.input.to_string())?;
        phase(Phase::Bootstrapped);

        self.preload(&input.code).await?;

        phase(Phase::Running);
        interpreter.call(RUN, &input.code)?;
        self.check_deadline()?;

        phase(Phase::Draining);
        self.drain(interpreter).await?;

        let finished = interpreter.call(FINISH, "")?;
        let outcome: GuestOutcome = serde_json::from_str(&finished)
            .map_err(|err| SandboxError::Interpreter(format!("malformed run outcome: {err}")))?;

        match outcome {
            GuestOutcome::Fulfilled { json: None } => {
                phase(Phase::Done);
                Ok(JsonValue::Null)
            }
            GuestOutcome::Fulfilled { json: Some(text) } => {
                let value: JsonValue = serde_json::from_str(&text)
                    .map_err(|err| SandboxError::Interpreter(format!("malformed result: {err}")))?;
                phase(Phase::Done);
                Ok(clamp(value, &text, self.policy.exec_max_output_bytes))
            }
            GuestOutcome::Rejected { error } => Err(SandboxError::Guest(error)),
            GuestOutcome::Pending => Err(SandboxError::Guest("result promise never settled".into())),
        }
    }

    /// Install or download what the code imports by literal specifier
    ///
    /// The loader is synchronous, so `npm:` packages go through the install
    /// path and CDN URLs are prefetched before the code starts. A failure is
    /// recorded against the module name and surfaces when the guest imports
    /// it; only the run deadline aborts here.
    async fn preload(&mut self, code: &str) -> Result<()> {
        for specifier in scan_imports(code) {
            let Ok(locator) = resolve_specifier(self.cdn, None, &specifier) else {
                continue;
            };
            let name = locator.module_name();
            let loaded = match locator {
                Locator::Package(_) if !self.policy.pkg_install_enabled => Err(SandboxError::PkgInstallDisabled),
                Locator::Package(spec) => self.perform_before_deadline(HostOp::PkgInstall { spec }).await?.map(drop),
                Locator::Url(url) => {
                    let remaining = self.deadline.saturating_duration_since(Instant::now());
                    let transport: &dyn Transport = self.transport.as_ref();
                    let prefetch = prefetch_graph(&self.modules, transport, self.policy, &url, None);
                    match tokio::time::timeout(remaining, prefetch).await {
                        Ok(outcome) => outcome.map(drop),
                        Err(_) => return Err(SandboxError::Timeout(self.policy.exec_timeout_ms)),
                    }
                }
            };
            if let Err(err) = loaded {
                tracing::debug!(%name, error = %err, "import preload failed");
                self.modules.borrow_mut().set_failure(name, err.to_string());
            }
        }
        Ok(())
    }

    /// Settle deferred host calls and run guest jobs, round by round
    ///
    /// Each round runs at most [`JOBS_PER_ROUND`] jobs. Rounds are bounded by
    /// `exec_max_host_calls` regardless of the host-call counter.
    async fn drain<I: Interpreter>(&mut self, interpreter: &mut I) -> Result<()> {
        let max_rounds = self.policy.exec_max_host_calls;
        let mut rounds: u64 = 0;

        loop {
            if !self.bridge.has_queued() && !interpreter.has_pending_jobs() {
                return Ok(());
            }
            if rounds >= max_rounds {
                tracing::warn!(rounds, "pending work left after drain budget");
                return Err(SandboxError::MaxPendingJobs(max_rounds));
            }
            rounds += 1;

            for request in self.bridge.take_queued() {
                let outcome = self.perform_before_deadline(request.op).await?;
                interpreter.call(SETTLE, &settlement(request.id, &outcome))?;
            }
            let ran = interpreter.run_pending_jobs(JOBS_PER_ROUND)?;
            tracing::trace!(round = rounds, jobs = ran, "drain round");
            self.check_deadline()?;
        }
    }

    /// Host operations get whatever is left of the run's wall-clock budget
    async fn perform_before_deadline(&mut self, op: HostOp) -> Result<Result<JsonValue>> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let timeout_ms = self.policy.exec_timeout_ms;
        match tokio::time::timeout(remaining, self.perform(op)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(SandboxError::Timeout(timeout_ms)),
        }
    }

    async fn perform(&mut self, op: HostOp) -> Result<JsonValue> {
        let transport: &dyn Transport = self.transport.as_ref();
        match op {
            HostOp::Fetch { url, init } => {
                let reply = fetch_bounded(transport, &url, &init, self.policy, &mut self.stats).await?;
                to_json(&reply)
            }
            HostOp::PkgInstall { spec } => {
                let cache = PackageCache::new(transport, self.policy, self.cdn);
                let installed = cache
                    .ensure_installed(&spec, &mut self.ledger, &mut self.stats, &mut *self.persist)
                    .await?;
                if !installed.is_cache_hit() {
                    self.bridge.publish_ledger(&self.ledger);
                }

                let package = installed.package;
                let entry = Url::parse(&package.entry_url)
                    .map_err(|err| SandboxError::ModuleNotFound(format!("{}: {err}", package.entry_url)))?;
                self.modules.borrow_mut().set_alias(package.spec.clone(), entry.as_str());
                prefetch_graph(&self.modules, transport, self.policy, &entry, installed.entry_source).await?;
                to_json(&package)
            }
        }
    }

    fn check_deadline(&self) -> Result<()> {
        if Instant::now() > self.deadline {
            return Err(SandboxError::Timeout(self.policy.exec_timeout_ms));
        }
        Ok(())
    }

    /// Interpreter interrupts surface as guest text; report them uniformly
    fn as_timeout(&self, err: SandboxError) -> SandboxError {
        if err.code() == ErrorCode::Timeout && !matches!(err, SandboxError::Timeout(_)) {
            phase(Phase::Timeout);
            return SandboxError::Timeout(self.policy.exec_timeout_ms);
        }
        if err.code() == ErrorCode::Timeout {
            phase(Phase::Timeout);
        } else {
            phase(Phase::Error);
        }
        err
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<JsonValue> {
    serde_json::to_value(value).map_err(|err| SandboxError::Interpreter(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::sample_package;
    use crate::ops::DisabledTransport;
    use crate::testing::ScriptedInterpreter;
    use serde_json::json;
    use std::sync::Arc;

    fn sandbox(policy: QuotaPolicy) -> Sandbox<ScriptedInterpreter> {
        Sandbox::new(policy, Arc::new(DisabledTransport))
    }

    #[tokio::test]
    async fn test_disabled_execution_creates_no_interpreter() {
        let before = ScriptedInterpreter::created();
        let policy = QuotaPolicy {
            code_exec_enabled: false,
            ..QuotaPolicy::default()
        };

        let result = sandbox(policy)
            .execute(ExecuteInput::new("1 + 1"), &RuntimeState::new(), &mut |_| {})
            .await;

        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::CodeExecDisabled));
        assert_eq!(ScriptedInterpreter::created(), before);
    }

    #[tokio::test]
    async fn test_empty_code_is_invalid_input() {
        let before = ScriptedInterpreter::created();
        let result = sandbox(QuotaPolicy::default())
            .execute(ExecuteInput::new("   "), &RuntimeState::new(), &mut |_| {})
            .await;

        assert_eq!(result.error_code(), Some(ErrorCode::InvalidInput));
        assert_eq!(ScriptedInterpreter::created(), before);
    }

    #[tokio::test]
    async fn test_non_text_code_is_invalid_input() {
        let result = sandbox(QuotaPolicy::default())
            .execute_value(&json!({"code": 42}), &RuntimeState::new(), &mut |_| {})
            .await;
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidInput));
        assert_eq!(result.result, JsonValue::Null);
    }

    #[tokio::test]
    async fn test_success_disposes_interpreter() {
        let before = ScriptedInterpreter::disposed();
        let result = sandbox(QuotaPolicy::default())
            .execute(ExecuteInput::new("{\"a\":1}"), &RuntimeState::new(), &mut |_| {})
            .await;

        assert!(result.ok, "{result:?}");
        assert_eq!(result.result, json!({"a": 1}));
        assert_eq!(ScriptedInterpreter::disposed(), before + 1);
    }

    #[tokio::test]
    async fn test_guest_error_disposes_interpreter() {
        let before = ScriptedInterpreter::disposed();
        let result = sandbox(QuotaPolicy::default())
            .execute(ExecuteInput::new("throw:Error: boom"), &RuntimeState::new(), &mut |_| {})
            .await;

        assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
        assert_eq!(result.error.unwrap().message, "Error: boom");
        assert_eq!(ScriptedInterpreter::disposed(), before + 1);
    }

    #[tokio::test]
    async fn test_interrupt_reports_timeout() {
        let policy = QuotaPolicy {
            exec_timeout_ms: 1234,
            ..QuotaPolicy::default()
        };
        let result = sandbox(policy)
            .execute(ExecuteInput::new("throw:InternalError: interrupted"), &RuntimeState::new(), &mut |_| {})
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::Timeout);
        assert_eq!(error.message, "TIMEOUT: execution exceeded 1234ms");
    }

    #[tokio::test]
    async fn test_runaway_jobs_hit_drain_backstop() {
        let before = ScriptedInterpreter::disposed();
        let policy = QuotaPolicy {
            exec_max_host_calls: 4,
            ..QuotaPolicy::default()
        };
        let result = sandbox(policy)
            .execute(ExecuteInput::new("pending"), &RuntimeState::new(), &mut |_| {})
            .await;

        assert_eq!(result.error_code(), Some(ErrorCode::MaxPendingJobs));
        assert_eq!(ScriptedInterpreter::jobs_run_last(), 4);
        assert_eq!(ScriptedInterpreter::disposed(), before + 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_reported() {
        let policy = QuotaPolicy {
            exec_memory_mb: 0,
            ..QuotaPolicy::default()
        };
        let result = sandbox(policy)
            .execute(ExecuteInput::new("1"), &RuntimeState::new(), &mut |_| {})
            .await;
        assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
        assert!(result.error.unwrap().message.starts_with("interpreter error"));
    }

    #[tokio::test]
    async fn test_output_clamped_not_failed() {
        let policy = QuotaPolicy {
            exec_max_output_bytes: 8,
            ..QuotaPolicy::default()
        };
        let result = sandbox(policy)
            .execute(ExecuteInput::new("\"a long string\""), &RuntimeState::new(), &mut |_| {})
            .await;

        assert!(result.ok);
        assert_eq!(result.result, json!({"truncated": true, "output": "\"a long "}));
    }

    #[test]
    fn test_search_reports_surface_and_filters() {
        let ledger = RuntimeState::from_packages([sample_package("zod"), sample_package("left-pad")]);
        let found = sandbox(QuotaPolicy::default()).search(Some("PAD"), &ledger);

        assert_eq!(found.runtime.engine, "scripted");
        assert_eq!(found.runtime.operations, vec!["log", "pkgInstall", "pkgList", "fetch"]);
        assert!(found.runtime.features.net_fetch);
        assert_eq!(found.limits, QuotaPolicy::default());
        assert_eq!(found.packages.len(), 1);
        assert_eq!(found.packages[0].spec, "left-pad");

        let all = sandbox(QuotaPolicy::default()).search(None, &ledger);
        let specs: Vec<_> = all.packages.iter().map(|p| p.spec.as_str()).collect();
        assert_eq!(specs, vec!["left-pad", "zod"]);
    }

    #[test]
    fn test_result_serialization_shape() {
        let failed = ExecuteResult::failure(&SandboxError::NetFetchDisabled, Vec::new(), RunStats::default());
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "NET_FETCH_DISABLED");
        assert_eq!(value["stats"]["fetchRequests"], 0);

        let ok = ExecuteResult::success(json!(2), Vec::new(), RunStats::default());
        let value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["result"], 2);
    }
}
