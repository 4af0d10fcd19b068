//! Test utilities for sandbox interpreters
//!
//! This module provides a canned [`Transport`], a scripted fake
//! [`Interpreter`], and a macro generating the standard run tests for any
//! real interpreter.
//!
//! # Usage
//!
//! In your interpreter's test module:
//!
//! ```ignore
//! use codebox_core::generate_interpreter_tests;
//!
//! generate_interpreter_tests!(MyInterpreter);
//! ```

use crate::http::{FetchRequest, FetchResponse};
use crate::interpreter::{HostFunction, Interpreter, InterpreterLimits};
use crate::modules::SharedModules;
use crate::ops::{OpFuture, Transport};
use crate::shim::{FINISH, RUN};
use crate::SandboxError;
use bytes::Bytes;
use serde_json::json;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Transport answering from a fixed URL table
///
/// Unknown URLs get a `404 not found`. Every requested URL is recorded.
#[derive(Debug, Default)]
pub struct StaticTransport {
    routes: HashMap<String, (u16, Bytes)>,
    delay: Option<Duration>,
    requested: Mutex<Vec<String>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        self.routes.insert(url.into(), (status, Bytes::from(body.into())));
        self
    }

    /// Sleep before answering every request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// URLs requested so far, in order
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().map(|urls| urls.clone()).unwrap_or_default()
    }
}

impl Transport for StaticTransport {
    fn fetch(&self, request: FetchRequest) -> OpFuture<'_, Result<FetchResponse, String>> {
        Box::pin(async move {
            if let Ok(mut urls) = self.requested.lock() {
                urls.push(request.url.clone());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let (status, body) = self
                .routes
                .get(&request.url)
                .cloned()
                .unwrap_or_else(|| (404, Bytes::from_static(b"not found")));

            Ok(FetchResponse {
                status,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body,
                final_url: request.url,
            })
        })
    }
}

thread_local! {
    static CREATED: Cell<u64> = const { Cell::new(0) };
    static DISPOSED: Cell<u64> = const { Cell::new(0) };
    static JOBS_RUN: Cell<u64> = const { Cell::new(0) };
}

/// Fake interpreter whose behavior is picked by the code it runs
///
/// - `throw:<message>` fails `__run` with `<message>`
/// - `pending` always reports queued jobs
/// - anything else is taken as the JSON text of the result
///
/// Creation fails when the memory limit is zero. Counters are per thread,
/// which matches `#[tokio::test]`'s current-thread runtime.
pub struct ScriptedInterpreter {
    code: String,
    functions: Vec<String>,
}

impl ScriptedInterpreter {
    pub fn created() -> u64 {
        CREATED.with(Cell::get)
    }

    pub fn disposed() -> u64 {
        DISPOSED.with(Cell::get)
    }

    /// Job batches run by the most recently created instance
    pub fn jobs_run_last() -> u64 {
        JOBS_RUN.with(Cell::get)
    }

    pub fn functions(&self) -> &[String] {
        &self.functions
    }
}

impl Interpreter for ScriptedInterpreter {
    const ENGINE: &'static str = "scripted";

    fn create(limits: InterpreterLimits, _modules: SharedModules) -> Result<Self, SandboxError> {
        if limits.memory_bytes == 0 {
            return Err(SandboxError::Interpreter("memory limit too small".into()));
        }
        CREATED.with(|c| c.set(c.get() + 1));
        JOBS_RUN.with(|c| c.set(0));
        Ok(Self {
            code: String::new(),
            functions: Vec::new(),
        })
    }

    fn install(&mut self, name: &str, _function: HostFunction) -> Result<(), SandboxError> {
        self.functions.push(name.to_string());
        Ok(())
    }

    fn eval(&mut self, _source: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    fn call(&mut self, function: &str, argument: &str) -> Result<String, SandboxError> {
        match function {
            RUN => {
                if let Some(message) = argument.strip_prefix("throw:") {
                    return Err(SandboxError::Guest(message.to_string()));
                }
                self.code = argument.to_string();
                Ok(String::new())
            }
            FINISH => Ok(json!({ "state": "fulfilled", "json": self.code }).to_string()),
            _ => Ok(String::new()),
        }
    }

    fn has_pending_jobs(&self) -> bool {
        self.code == "pending"
    }

    fn run_pending_jobs(&mut self, max_jobs: usize) -> Result<usize, SandboxError> {
        JOBS_RUN.with(|c| c.set(c.get() + 1));
        Ok(if self.has_pending_jobs() { max_jobs } else { 0 })
    }

    fn dispose(self) {
        DISPOSED.with(|c| c.set(c.get() + 1));
    }
}

/// Generate the standard run tests for an interpreter
///
/// Covers results, the `input` and `__result` globals, console capture,
/// timeouts, host-call budgets, disabled features, fetch and packages.
#[macro_export]
macro_rules! generate_interpreter_tests {
    ($interp:ty) => {
        use $crate::testing::StaticTransport;
        use $crate::{
            ErrorCode, ExecuteInput, ExecuteResult, InstalledPackage, LogLevel, QuotaPolicy,
            RuntimeState, Sandbox,
        };
        use serde_json::json;
        use std::sync::Arc;

        const INDEX: &str = "export * from \"/v135/left-pad@1.3.0/es2022/left-pad.mjs\";";
        const ENTRY: &str = "import { pad } from \"./pad.mjs\";\nexport default function leftPad(s, n) { return pad(String(s), n); }";
        const PAD: &str = "export const pad = (s, n) => s.padStart(n);";

        fn packages_transport() -> StaticTransport {
            StaticTransport::new()
                .with_text("https://esm.sh/left-pad", 200, INDEX)
                .with_text("https://esm.sh/v135/left-pad@1.3.0/es2022/left-pad.mjs", 200, ENTRY)
                .with_text("https://esm.sh/v135/left-pad@1.3.0/es2022/pad.mjs", 200, PAD)
        }

        async fn run_with(
            policy: QuotaPolicy,
            transport: Arc<StaticTransport>,
            code: &str,
            ledger: &RuntimeState,
        ) -> (ExecuteResult, Vec<RuntimeState>) {
            let sandbox = Sandbox::<$interp>::new(policy, transport);
            let mut persisted = Vec::new();
            let result = sandbox
                .execute(ExecuteInput::new(code), ledger, &mut |l: &RuntimeState| persisted.push(l.clone()))
                .await;
            (result, persisted)
        }

        async fn run(policy: QuotaPolicy, code: &str) -> ExecuteResult {
            run_with(policy, Arc::new(StaticTransport::new()), code, &RuntimeState::new())
                .await
                .0
        }

        #[tokio::test]
        async fn test_expression_result() {
            let result = run(QuotaPolicy::default(), "1 + 1").await;
            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!(2));
            assert!(result.error.is_none());
        }

        #[tokio::test]
        async fn test_undefined_result_is_null() {
            let result = run(QuotaPolicy::default(), "undefined").await;
            assert!(result.ok);
            assert_eq!(result.result, serde_json::Value::Null);
        }

        #[tokio::test]
        async fn test_input_global() {
            let sandbox = Sandbox::<$interp>::new(QuotaPolicy::default(), Arc::new(StaticTransport::new()));
            let input = ExecuteInput::new("input.a * 3").with_input(json!({ "a": 2 }));
            let result = sandbox.execute(input, &RuntimeState::new(), &mut |_| {}).await;
            assert_eq!(result.result, json!(6));
        }

        #[tokio::test]
        async fn test_explicit_result_wins() {
            let result = run(QuotaPolicy::default(), "globalThis.__result = { x: 1 }; 5").await;
            assert!(result.ok);
            assert_eq!(result.result, json!({ "x": 1 }));
        }

        #[tokio::test]
        async fn test_explicit_result_ignored_on_rejection() {
            let result = run(
                QuotaPolicy::default(),
                "(async () => { globalThis.__result = 1; throw new Error('boom'); })()",
            )
            .await;
            assert!(!result.ok);
            assert_eq!(result.result, serde_json::Value::Null);
            assert!(result.error.unwrap().message.contains("boom"));
        }

        #[tokio::test]
        async fn test_explicit_result_ignored_while_pending() {
            let result = run(QuotaPolicy::default(), "globalThis.__result = 1; new Promise(() => {})").await;
            assert!(!result.ok);
            assert!(result.error.unwrap().message.contains("never settled"));
        }

        #[tokio::test]
        async fn test_async_result() {
            let result = run(
                QuotaPolicy::default(),
                "(async () => { const v = await Promise.resolve(20); return v + 1; })()",
            )
            .await;
            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!(21));
        }

        #[tokio::test]
        async fn test_rejected_promise() {
            let result = run(QuotaPolicy::default(), "Promise.reject(new Error('nope'))").await;
            assert!(!result.ok);
            let error = result.error.unwrap();
            assert_eq!(error.code, ErrorCode::ExecutionError);
            assert!(error.message.contains("nope"), "{}", error.message);
        }

        #[tokio::test]
        async fn test_unsettled_promise() {
            let result = run(QuotaPolicy::default(), "new Promise(() => {})").await;
            assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
            assert!(result.error.unwrap().message.contains("never settled"));
        }

        #[tokio::test]
        async fn test_thrown_error() {
            let result = run(QuotaPolicy::default(), "throw new TypeError('boom')").await;
            let error = result.error.unwrap();
            assert_eq!(error.code, ErrorCode::ExecutionError);
            assert!(error.message.contains("boom"));
            assert!(!error.message.contains("\n    at "));
        }

        #[tokio::test]
        async fn test_syntax_error() {
            let result = run(QuotaPolicy::default(), "this is not valid javascript").await;
            assert!(!result.ok);
            assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
        }

        #[tokio::test]
        async fn test_console_capture() {
            let result = run(
                QuotaPolicy::default(),
                "console.log('a', 1, { b: 2 }); console.warn('careful'); console.error(new Error('bad')); 0",
            )
            .await;
            assert!(result.ok);
            assert_eq!(result.logs.len(), 3);
            assert_eq!(result.logs[0].level, LogLevel::Log);
            assert_eq!(result.logs[0].message, "a 1 {\"b\":2}");
            assert_eq!(result.logs[1].level, LogLevel::Warn);
            assert_eq!(result.logs[2].level, LogLevel::Error);
            assert_eq!(result.logs[2].message, "Error: bad");
            assert_eq!(result.stats.host_calls, 3);
        }

        #[tokio::test]
        async fn test_log_lines_bounded() {
            let policy = QuotaPolicy {
                exec_max_log_lines: 2,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "for (let i = 0; i < 5; i++) console.log(i); 'done'").await;
            assert!(result.ok);
            assert_eq!(result.logs.len(), 2);
            assert_eq!(result.stats.host_calls, 5);
        }

        #[tokio::test]
        async fn test_host_call_budget() {
            let policy = QuotaPolicy {
                exec_max_host_calls: 3,
                ..QuotaPolicy::default()
            };
            let ok = run(policy.clone(), "console.log(1); console.log(2); console.log(3); 'ok'").await;
            assert!(ok.ok, "{ok:?}");

            let over = run(policy, "for (let i = 0; i < 4; i++) console.log(i); 'never'").await;
            assert!(!over.ok);
            let error = over.error.unwrap();
            assert_eq!(error.code, ErrorCode::ExecutionError);
            assert!(error.message.contains("host call budget"), "{}", error.message);
        }

        #[tokio::test]
        async fn test_busy_loop_times_out() {
            let policy = QuotaPolicy {
                exec_timeout_ms: 100,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "while (true) {}").await;
            assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
        }

        #[tokio::test]
        async fn test_runaway_microtasks_stop() {
            let result = run(QuotaPolicy::default(), "const spin = () => Promise.resolve().then(spin); spin(); 1").await;
            assert!(!result.ok);
            assert_eq!(result.error_code(), Some(ErrorCode::MaxPendingJobs));
        }

        #[tokio::test]
        async fn test_busy_job_times_out() {
            let policy = QuotaPolicy {
                exec_timeout_ms: 100,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "Promise.resolve().then(() => { while (true) {} }); 1").await;
            assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
        }

        #[tokio::test]
        async fn test_stack_overflow_fails() {
            let result = run(QuotaPolicy::default(), "function f() { return f() + 1; } f()").await;
            assert!(!result.ok);
        }

        #[tokio::test]
        async fn test_memory_limit_fails() {
            let policy = QuotaPolicy {
                exec_memory_mb: 4,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "const a = []; while (true) a.push(new Array(100000).fill(1));").await;
            assert!(!result.ok);
        }

        #[tokio::test]
        async fn test_large_output_clamped() {
            let policy = QuotaPolicy {
                exec_max_output_bytes: 100,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "'x'.repeat(1000)").await;
            assert!(result.ok);
            assert_eq!(result.result["truncated"], json!(true));
            assert_eq!(result.result["output"].as_str().unwrap().chars().count(), 100);
        }

        #[tokio::test]
        async fn test_host_functions_hidden() {
            let result = run(
                QuotaPolicy::default(),
                "[typeof __host_log, typeof __host_fetch, typeof pkg.install, Object.isFrozen(pkg)]",
            )
            .await;
            assert_eq!(result.result, json!(["undefined", "undefined", "function", true]));
        }

        #[tokio::test]
        async fn test_pkg_install_disabled() {
            let policy = QuotaPolicy {
                pkg_install_enabled: false,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "pkg.install('left-pad')").await;
            assert_eq!(result.error_code(), Some(ErrorCode::PkgInstallDisabled));
        }

        #[tokio::test]
        async fn test_fetch_disabled() {
            let policy = QuotaPolicy {
                net_fetch_enabled: false,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "fetch('https://api.test/data')").await;
            assert_eq!(result.error_code(), Some(ErrorCode::NetFetchDisabled));
            assert_eq!(result.stats.fetch_requests, 0);
        }

        #[tokio::test]
        async fn test_disabled_error_caught_by_guest() {
            let policy = QuotaPolicy {
                net_fetch_enabled: false,
                ..QuotaPolicy::default()
            };
            let result = run(policy, "try { fetch('https://a.test'); 'no' } catch (e) { 'caught' }").await;
            assert!(result.ok);
            assert_eq!(result.result, json!("caught"));
        }

        #[tokio::test]
        async fn test_fetch_round_trip() {
            let transport = Arc::new(StaticTransport::new().with_text("https://api.test/data", 200, "{\"value\":42}"));
            let code = "(async () => { const r = await fetch('https://api.test/data'); const body = await r.json(); return { status: r.status, ok: r.ok, value: body.value }; })()";
            let (result, _) = run_with(QuotaPolicy::default(), transport.clone(), code, &RuntimeState::new()).await;

            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!({ "status": 200, "ok": true, "value": 42 }));
            assert_eq!(result.stats.fetch_requests, 1);
            assert_eq!(result.stats.fetch_bytes, 12);
            assert_eq!(transport.requested(), vec!["https://api.test/data".to_string()]);
        }

        #[tokio::test]
        async fn test_fetch_request_limit() {
            let policy = QuotaPolicy {
                net_max_requests_per_run: 1,
                ..QuotaPolicy::default()
            };
            let transport = Arc::new(StaticTransport::new().with_text("https://api.test/a", 200, "a"));
            let code = "(async () => { await fetch('https://api.test/a'); await fetch('https://api.test/a'); })()";
            let (result, _) = run_with(policy, transport.clone(), code, &RuntimeState::new()).await;

            assert!(!result.ok);
            assert!(result.error.unwrap().message.contains("fetch request limit"));
            assert_eq!(transport.requested().len(), 1);
        }

        #[tokio::test]
        async fn test_fetch_rejects_non_http() {
            let code = "fetch('file:///etc/passwd')";
            let (result, _) = run_with(
                QuotaPolicy::default(),
                Arc::new(StaticTransport::new()),
                code,
                &RuntimeState::new(),
            )
            .await;
            assert!(!result.ok);
            assert_eq!(result.stats.fetch_requests, 0);
        }

        #[tokio::test]
        async fn test_pkg_import_installs_and_persists() {
            let transport = Arc::new(packages_transport());
            let code = "(async () => { const mod = await pkg.import('left-pad'); return mod.default(7, 3); })()";
            let (result, persisted) = run_with(QuotaPolicy::default(), transport, code, &RuntimeState::new()).await;

            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!("  7"));
            assert_eq!(result.stats.package_installs, 1);
            assert_eq!(persisted.len(), 1);
            assert!(persisted[0].contains("left-pad"));
        }

        #[tokio::test]
        async fn test_cached_install_skips_index() {
            let transport = Arc::new(packages_transport());
            let ledger = RuntimeState::from_packages([InstalledPackage {
                spec: "left-pad".into(),
                resolved_url: "https://esm.sh/left-pad".into(),
                entry_url: "https://esm.sh/v135/left-pad@1.3.0/es2022/left-pad.mjs".into(),
                sha256: "00".repeat(32),
                size_bytes: ENTRY.len() as u64,
                installed_at: "2024-01-01T00:00:00+00:00".into(),
            }]);
            let code = "(async () => { const p = await pkg.install('left-pad'); const m = await pkg.import('left-pad'); return [p.spec, m.default('a', 2), pkg.list().length]; })()";
            let (result, persisted) = run_with(QuotaPolicy::default(), transport.clone(), code, &ledger).await;

            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!(["left-pad", " a", 1]));
            assert_eq!(result.stats.package_installs, 0);
            assert!(persisted.is_empty());
            assert!(!transport.requested().contains(&"https://esm.sh/left-pad".to_string()));
        }

        #[tokio::test]
        async fn test_invalid_spec_does_no_io() {
            let transport = Arc::new(packages_transport());
            let (result, persisted) =
                run_with(QuotaPolicy::default(), transport.clone(), "pkg.install('left pad')", &RuntimeState::new()).await;

            assert!(!result.ok);
            assert!(result.error.unwrap().message.contains("invalid package spec"));
            assert!(transport.requested().is_empty());
            assert!(persisted.is_empty());
        }

        #[tokio::test]
        async fn test_computed_import_hints_install() {
            let result = run(QuotaPolicy::default(), "const name = 'npm:' + 'zod'; import(name)").await;
            assert!(!result.ok);
            assert!(result.error.unwrap().message.contains("pkg.install"));
        }

        #[tokio::test]
        async fn test_npm_import_installs() {
            let transport = Arc::new(packages_transport());
            let code = "(async () => (await import('npm:left-pad')).default(5, 2))()";
            let (result, persisted) = run_with(QuotaPolicy::default(), transport, code, &RuntimeState::new()).await;

            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!(" 5"));
            assert_eq!(result.stats.package_installs, 1);
            assert_eq!(persisted.len(), 1);
        }

        #[tokio::test]
        async fn test_npm_import_unknown_package_fails() {
            let result = run(QuotaPolicy::default(), "import('npm:zod')").await;
            assert!(!result.ok);
            assert!(result.error.unwrap().message.contains("zod"));
        }

        #[tokio::test]
        async fn test_npm_import_respects_disabled_install() {
            let policy = QuotaPolicy {
                pkg_install_enabled: false,
                ..QuotaPolicy::default()
            };
            let transport = Arc::new(packages_transport());
            let (result, _) = run_with(policy, transport.clone(), "import('npm:left-pad')", &RuntimeState::new()).await;

            assert_eq!(result.error_code(), Some(ErrorCode::PkgInstallDisabled));
            assert!(transport.requested().is_empty());
        }

        #[tokio::test]
        async fn test_cdn_url_import_fetched_directly() {
            let transport = Arc::new(packages_transport());
            let code = "(async () => (await import('https://esm.sh/v135/left-pad@1.3.0/es2022/left-pad.mjs')).default('x', 3))()";
            let (result, persisted) = run_with(QuotaPolicy::default(), transport.clone(), code, &RuntimeState::new()).await;

            assert!(result.ok, "{result:?}");
            assert_eq!(result.result, json!("  x"));
            assert_eq!(result.stats.package_installs, 0);
            assert!(persisted.is_empty());
            assert!(!transport.requested().contains(&"https://esm.sh/left-pad".to_string()));
        }
    };
}
