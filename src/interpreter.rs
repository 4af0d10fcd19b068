use crate::SandboxError;
use crate::modules::SharedModules;
use std::rc::Rc;
use std::time::Instant;

/// Host function installed into the guest: two text arguments in, text out
pub type HostFunction = Rc<dyn Fn(&str, &str) -> String>;

/// Limits applied when an interpreter is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterLimits {
    pub memory_bytes: usize,
    pub stack_bytes: usize,
    /// Guest execution is interrupted once `Instant::now()` passes this
    pub deadline: Instant,
}

/// Narrow port onto an embedded script interpreter
///
/// The execution session drives any implementation through these calls
/// only: create, install, eval, call, drain, dispose. Values never cross
/// the boundary as live references, only as text.
///
/// Note: implementations are usually `!Send`, since interpreter contexts
/// are bound to the thread that created them.
pub trait Interpreter: Sized {
    /// Engine name reported by `search`
    const ENGINE: &'static str;

    /// Create a fresh instance with memory, stack and deadline limits
    /// installed, and its module loader reading from `modules`
    fn create(limits: InterpreterLimits, modules: SharedModules) -> Result<Self, SandboxError>;

    /// Expose `function` as a global named `name`
    fn install(&mut self, name: &str, function: HostFunction) -> Result<(), SandboxError>;

    /// Evaluate a script, discarding its completion value
    fn eval(&mut self, source: &str) -> Result<(), SandboxError>;

    /// Call the global function `function` with one string, returning its string result
    ///
    /// Uncaught guest exceptions come back as `SandboxError::Guest`.
    fn call(&mut self, function: &str, argument: &str) -> Result<String, SandboxError>;

    /// Whether queued jobs (promise reactions, module evaluation) remain
    fn has_pending_jobs(&self) -> bool;

    /// Run at most `max_jobs` queued jobs; returns how many ran
    ///
    /// An exception escaping a job comes back as `SandboxError::Guest`.
    fn run_pending_jobs(&mut self, max_jobs: usize) -> Result<usize, SandboxError>;

    /// Release the instance; must be called on every exit path
    fn dispose(self);
}
