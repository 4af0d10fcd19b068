//! Bounded sandbox for running untrusted JavaScript
//!
//! Each run gets a fresh interpreter with hard memory, stack and wall-clock
//! limits, a small privileged surface (`console`, `fetch`, `pkg`) backed by
//! host functions, and per-run quotas on every privileged operation.
//! Installed packages are recorded in a ledger the caller persists between
//! runs.

mod bridge;
mod config;
mod error;
mod http;
mod interpreter;
mod ledger;
mod limits;
mod log;
mod modules;
mod net;
mod ops;
mod output;
mod packages;
mod resolve;
mod session;
mod shim;
mod stats;

#[cfg(feature = "quickjs")]
mod quickjs;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{OPTION_NAMES, RawConfig, env_var_name};
pub use error::{ErrorCode, Result, SandboxError};
pub use http::{FetchInit, FetchReply, FetchRequest, FetchResponse, HttpMethod, RedirectMode};
pub use interpreter::{HostFunction, Interpreter, InterpreterLimits};
pub use ledger::{InstalledPackage, RuntimeState};
pub use limits::QuotaPolicy;
pub use log::{LogEvent, LogLevel};
pub use modules::{ModuleStore, SharedModules};
pub use ops::{DisabledTransport, OpFuture, Transport, TransportHandle};
pub use output::classify;
pub use resolve::{Cdn, DEFAULT_CDN_BASE};
pub use session::{
    ExecuteError, ExecuteInput, ExecuteResult, RuntimeCapabilities, RuntimeFeatures, Sandbox,
    SearchResult,
};
pub use stats::RunStats;

#[cfg(feature = "reqwest")]
pub use ops::ReqwestTransport;

#[cfg(feature = "quickjs")]
pub use quickjs::QuickJs;

/// Sandbox running on the bundled QuickJS interpreter
#[cfg(feature = "quickjs")]
pub type QuickJsSandbox = Sandbox<QuickJs>;
