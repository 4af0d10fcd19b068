//! QuickJS interpreter backed by `rquickjs`

use crate::interpreter::{HostFunction, Interpreter, InterpreterLimits};
use crate::modules::SharedModules;
use crate::SandboxError;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Module, Runtime};

pub struct QuickJs {
    context: Context,
    runtime: Runtime,
}

impl Interpreter for QuickJs {
    const ENGINE: &'static str = "quickjs";

    fn create(limits: InterpreterLimits, modules: SharedModules) -> Result<Self, SandboxError> {
        let runtime = Runtime::new().map_err(engine_error)?;
        runtime.set_memory_limit(limits.memory_bytes);
        runtime.set_max_stack_size(limits.stack_bytes);

        let deadline = limits.deadline;
        runtime.set_interrupt_handler(Some(Box::new(move || std::time::Instant::now() > deadline)));
        runtime.set_loader(
            StoreResolver {
                modules: modules.clone(),
            },
            StoreLoader { modules },
        );

        let context = Context::full(&runtime).map_err(engine_error)?;
        Ok(Self { context, runtime })
    }

    fn install(&mut self, name: &str, function: HostFunction) -> Result<(), SandboxError> {
        self.context
            .with(|ctx| {
                let host = Function::new(ctx.clone(), move |first: String, second: String| {
                    function(&first, &second)
                })?;
                ctx.globals().set(name, host)
            })
            .map_err(engine_error)
    }

    fn eval(&mut self, source: &str) -> Result<(), SandboxError> {
        self.context.with(|ctx| {
            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|err| SandboxError::Guest(err.to_string()))
        })
    }

    fn call(&mut self, function: &str, argument: &str) -> Result<String, SandboxError> {
        self.context.with(|ctx| {
            call_global(&ctx, function, argument)
                .catch(&ctx)
                .map_err(|err| SandboxError::Guest(err.to_string()))
        })
    }

    fn has_pending_jobs(&self) -> bool {
        self.runtime.is_job_pending()
    }

    fn run_pending_jobs(&mut self, max_jobs: usize) -> Result<usize, SandboxError> {
        let mut ran = 0;
        while ran < max_jobs {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(job) => {
                    // Not owned: dropping it would release the context a second time
                    std::mem::forget(job);
                    let message = self.context.with(|ctx| {
                        Err::<(), _>(rquickjs::Error::Exception)
                            .catch(&ctx)
                            .err()
                            .map(|err| err.to_string())
                            .unwrap_or_else(|| "pending job failed".to_string())
                    });
                    return Err(SandboxError::Guest(message));
                }
            }
        }
        Ok(ran)
    }

    fn dispose(self) {
        drop(self);
    }
}

impl Drop for QuickJs {
    fn drop(&mut self) {
        self.runtime.set_interrupt_handler(None);
        self.runtime.run_gc();
    }
}

fn call_global<'js>(ctx: &Ctx<'js>, name: &str, argument: &str) -> rquickjs::Result<String> {
    let function: Function<'js> = ctx.globals().get(name)?;
    function.call((argument.to_string(),))
}

fn engine_error(err: rquickjs::Error) -> SandboxError {
    SandboxError::Interpreter(err.to_string())
}

struct StoreResolver {
    modules: SharedModules,
}

impl Resolver for StoreResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        self.modules
            .borrow()
            .module_name(Some(base), name)
            .map_err(|err| rquickjs::Error::new_resolving_message(base, name, err.to_string()))
    }
}

struct StoreLoader {
    modules: SharedModules,
}

impl Loader for StoreLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = self
            .modules
            .borrow()
            .load(name)
            .map(str::to_string)
            .map_err(|err| rquickjs::Error::new_loading_message(name, err.to_string()))?;
        Module::declare(ctx.clone(), name, source)
    }
}
