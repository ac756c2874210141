//! JavaScript runtime powered by Boa engine
//!
//! Every execution context, the top-level one and each worker, is a
//! [`Runtime`]: one Boa `Context` on one thread, with WebAPI support from
//! boa_runtime and the `Worker` class installed.
//!
//! Features provided:
//! - Console API (console.log, console.error, etc.)
//! - Timers (setTimeout, setInterval, clearTimeout, clearInterval)
//! - URL API (URL, URLSearchParams)
//! - Text encoding (TextEncoder, TextDecoder)
//! - structuredClone, queueMicrotask, fetch
//! - ES Modules and CommonJS entries
//! - `new Worker(...)` in every context, worker globals inside workers

mod event_loop;
mod loader;
mod scope;

pub use event_loop::EventLoop;
pub use loader::{BundleTarget, WorkerModuleLoader};
pub use scope::ContextScope;

use boa_engine::{
    Context, JsError, JsResult, JsValue, Source,
    builtins::promise::PromiseState,
    context::ContextBuilder,
    js_string,
    module::Module,
    object::builtins::JsPromise,
};
use boa_gc::{Finalize, Trace};
use boa_runtime::{
    ConsoleState, Logger,
    extensions::{
        ConsoleExtension, EncodingExtension, FetchExtension, MicrotaskExtension,
        StructuredCloneExtension, TimeoutExtension, UrlExtension,
    },
    fetch::BlockingReqwestFetcher,
    register_extensions,
};
use log::{debug, warn};
use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::worker::{
    ContextLink, EventKind, EventSink, Mailbox, MaterializedEntry, ScriptKind, Signal,
    StructuredValue, WorkerEvent, next_context_id,
};

/// Runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Module error: {0}")]
    ModuleError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Console logger that prints to stdout/stderr, tagged with the worker name
#[derive(Debug, Clone, Default, Trace, Finalize)]
pub struct WorkerLogger {
    #[unsafe_ignore_trace]
    name: Option<String>,
}

impl WorkerLogger {
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }

    fn line(&self, level: &str, msg: &str) -> String {
        match &self.name {
            Some(name) => format!("[{name}] {level}{msg}"),
            None => format!("{level}{msg}"),
        }
    }
}

impl Logger for WorkerLogger {
    fn log(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        println!("{}", self.line("", &msg));
        Ok(())
    }

    fn info(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        println!("{}", self.line("[INFO] ", &msg));
        Ok(())
    }

    fn warn(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        eprintln!("{}", self.line("[WARN] ", &msg));
        Ok(())
    }

    fn error(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        eprintln!("{}", self.line("[ERROR] ", &msg));
        Ok(())
    }
}

/// Configuration for a runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base path for module resolution and relative worker references
    pub base_path: PathBuf,
    /// Safety limit for the top-level event loop
    pub max_runtime: Duration,
    /// Context name, used as the console prefix and `self.name`
    pub name: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_runtime: Duration::from_secs(300),
            name: None,
        }
    }
}

/// One execution context
pub struct Runtime {
    context: Context,
    event_loop: Rc<EventLoop>,
    loader: Rc<WorkerModuleLoader>,
    scope: Arc<ContextScope>,
    config: RuntimeConfig,
    /// Module entry still evaluating (top-level await)
    pending_entry: Option<JsPromise>,
}

impl Runtime {
    /// Create a top-level runtime with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a top-level runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> RuntimeResult<Self> {
        Self::build(config, next_context_id(), Arc::new(Mailbox::new()), None)
    }

    fn build(
        config: RuntimeConfig,
        id: u32,
        inbox: Arc<Mailbox<Signal>>,
        parent: Option<Arc<dyn EventSink>>,
    ) -> RuntimeResult<Self> {
        let event_loop = Rc::new(EventLoop::new());
        let loader = Rc::new(WorkerModuleLoader::new(&config.base_path));

        let mut context = ContextBuilder::default()
            .module_loader(loader.clone())
            .job_executor(event_loop.clone())
            .build()
            .map_err(|e| RuntimeError::JsError(e.to_string()))?;

        // Match Node.js/V8 defaults for deep module graphs
        context.runtime_limits_mut().set_recursion_limit(16384);
        context
            .runtime_limits_mut()
            .set_stack_size_limit(1024 * 1024); // 1MB

        register_extensions(
            (
                ConsoleExtension(WorkerLogger::new(config.name.clone())),
                TimeoutExtension,
                UrlExtension,
                EncodingExtension,
                StructuredCloneExtension,
                MicrotaskExtension,
                FetchExtension(BlockingReqwestFetcher::default()),
            ),
            None,
            &mut context,
        )
        .map_err(|e| RuntimeError::JsError(e.to_string()))?;

        let is_worker = parent.is_some();
        scope::install_worker_class(&mut context).map_err(|e| RuntimeError::JsError(e.to_string()))?;
        if is_worker {
            scope::install_worker_scope(&mut context, config.name.as_deref())
                .map_err(|e| RuntimeError::JsError(e.to_string()))?;
        }

        let scope = ContextScope::new(id, config.base_path.clone(), inbox, parent)
            .register(&mut context)
            .map_err(|e| RuntimeError::JsError(e.to_string()))?;

        debug!("context {} ready (worker: {})", id, is_worker);

        Ok(Self {
            context,
            event_loop,
            loader,
            scope,
            config,
            pending_entry: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.scope.id()
    }

    /// Evaluate a script and run whatever became runnable
    pub fn eval(&mut self, code: &str, filename: &str) -> RuntimeResult<JsValue> {
        let source = Source::from_bytes(code.as_bytes()).with_path(Path::new(filename));
        let result = self.context.eval(source);
        let result = result.map_err(|e| RuntimeError::JsError(self.describe(e)));
        self.run_ready()?;
        result
    }

    /// Evaluate a script and clone its completion value out of the engine
    pub fn eval_structured(&mut self, code: &str) -> RuntimeResult<StructuredValue> {
        let value = self.eval(code, "<eval>")?;
        StructuredValue::from_js(&value, &mut self.context)
            .map_err(|e| RuntimeError::JsError(e.to_string()))
    }

    /// Load a file as the entry point and run until the context is idle
    pub fn run_file(&mut self, path: &Path, kind: ScriptKind) -> RuntimeResult<()> {
        self.load_entry(path, kind)?;
        self.run_event_loop()
    }

    /// Load and evaluate an entry point without entering the event loop.
    ///
    /// A module entry that is still awaiting is kept and checked on every
    /// turn of the loop.
    pub fn load_entry(&mut self, path: &Path, kind: ScriptKind) -> RuntimeResult<()> {
        debug!("context {} loading {} entry {}", self.id(), kind, path.display());
        match kind {
            ScriptKind::Module => {
                // Parsed as written; only imported files get the CommonJS treatment
                let code = std::fs::read_to_string(path).map_err(|e| {
                    RuntimeError::Load(format!("Failed to read module '{}': {}", path.display(), e))
                })?;
                let source = Source::from_bytes(code.as_bytes()).with_path(path);
                let module = Module::parse(source, None, &mut self.context);
                let module = module.map_err(|e| RuntimeError::ModuleError(self.describe(e)))?;

                let promise = module.load_link_evaluate(&mut self.context);
                self.run_ready()?;
                self.settle_entry(promise)
            }
            ScriptKind::Classic => {
                let bundle = self
                    .loader
                    .bundle_commonjs(path, BundleTarget::Script)
                    .map_err(RuntimeError::Load)?;
                let source = Source::from_bytes(bundle.as_bytes()).with_path(path);
                let result = self.context.eval(source);
                result.map_err(|e| RuntimeError::JsError(self.describe(e)))?;
                self.run_ready()
            }
        }
    }

    fn settle_entry(&mut self, promise: JsPromise) -> RuntimeResult<()> {
        match promise.state() {
            PromiseState::Fulfilled(_) => Ok(()),
            PromiseState::Rejected(err) => Err(RuntimeError::ModuleError(
                scope::describe_error(&err, &mut self.context),
            )),
            PromiseState::Pending => {
                self.pending_entry = Some(promise);
                Ok(())
            }
        }
    }

    fn poll_entry(&mut self) -> RuntimeResult<()> {
        match self.pending_entry.take() {
            Some(promise) => self.settle_entry(promise),
            None => Ok(()),
        }
    }

    fn run_ready(&mut self) -> RuntimeResult<()> {
        let result = self.event_loop.run_ready(&mut self.context);
        result.map_err(|e| RuntimeError::JsError(self.describe(e)))
    }

    /// Drive the top-level context until it owns no live workers and has no
    /// pending jobs or timers, or until `max_runtime` elapses.
    pub fn run_event_loop(&mut self) -> RuntimeResult<()> {
        let deadline = Instant::now() + self.config.max_runtime;

        loop {
            self.run_ready()?;
            self.poll_entry()?;

            if !self.scope.has_children() && !self.event_loop.has_pending_work() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "context {} still busy after {:?}; giving up",
                    self.id(),
                    self.config.max_runtime
                );
                return Ok(());
            }

            let remaining = deadline - now;
            let timeout = self
                .event_loop
                .time_until_next_timer()
                .map_or(remaining, |next| next.min(remaining));

            for signal in self.scope.inbox().wait(Some(timeout)) {
                if self.dispatch(signal)?.is_break() {
                    debug!("context {} asked to stop", self.id());
                    return Ok(());
                }
            }
        }
    }

    /// Worker loop: deliver inbound signals and run timers until the
    /// context is terminated or closes itself.
    fn serve(&mut self) -> RuntimeResult<()> {
        loop {
            if let Err(e) = self.run_ready() {
                self.report(e);
            }
            self.poll_entry()?;

            if self.scope.close_requested() {
                debug!("worker {} closed itself", self.id());
                self.scope.emit(WorkerEvent::Close);
                return Ok(());
            }

            let inbox = Arc::clone(self.scope.inbox());
            let signals = inbox.wait(self.event_loop.time_until_next_timer());
            if signals.is_empty() && inbox.is_closed() {
                return Ok(());
            }

            for signal in signals {
                match self.dispatch(signal) {
                    Ok(ControlFlow::Break(())) => return Ok(()),
                    Ok(ControlFlow::Continue(())) => {}
                    Err(e) => self.report(e),
                }
                // Tasks queued behind close() are discarded
                if self.scope.close_requested() {
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, signal: Signal) -> RuntimeResult<ControlFlow<()>> {
        match signal {
            Signal::Message(data) => {
                let value = data
                    .to_js(&mut self.context)
                    .map_err(|e| RuntimeError::JsError(e.to_string()))?;
                self.call_global("__webworker_deliver", &[value])?;
            }
            Signal::Terminate => {
                debug!("worker {} terminated", self.id());
                return Ok(ControlFlow::Break(()));
            }
            Signal::Child { worker_id, event } => self.dispatch_child(worker_id, event)?,
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Hand an event from one of this context's workers to its JS listeners.
    fn dispatch_child(&mut self, worker_id: u32, event: WorkerEvent) -> RuntimeResult<()> {
        let (kind, data, message) = match event {
            WorkerEvent::Message(data) => (EventKind::Message, data, None),
            WorkerEvent::Error(message) => (EventKind::Error, StructuredValue::Undefined, Some(message)),
            WorkerEvent::Close => (EventKind::Close, StructuredValue::Undefined, None),
            WorkerEvent::Exited => {
                if let Some(child) = self.scope.release(worker_id) {
                    child.lifecycle().reclaim();
                }
                self.call_global(
                    "__webworker_deliver_child",
                    &[JsValue::from(worker_id), js_string!("exit").into()],
                )?;
                return Ok(());
            }
        };

        let Some(child) = self.scope.child(worker_id) else {
            return Ok(());
        };
        if !child.lifecycle().admit(kind) {
            debug!("dropping {} event from worker {} in state {}", kind, worker_id, child.state());
            return Ok(());
        }

        let data = data
            .to_js(&mut self.context)
            .map_err(|e| RuntimeError::JsError(e.to_string()))?;
        let message = message.map_or_else(JsValue::undefined, |m| js_string!(m.as_str()).into());
        self.call_global(
            "__webworker_deliver_child",
            &[JsValue::from(worker_id), js_string!(kind.as_str()).into(), data, message],
        )?;
        Ok(())
    }

    fn call_global(&mut self, name: &str, args: &[JsValue]) -> RuntimeResult<JsValue> {
        let global = self.context.global_object();
        let func = global
            .get(js_string!(name), &mut self.context)
            .map_err(|e| RuntimeError::JsError(e.to_string()))?;
        let Some(func) = func.as_callable() else {
            return Err(RuntimeError::JsError(format!("{name} is not installed")));
        };
        let result = func.call(&JsValue::undefined(), args, &mut self.context);
        result.map_err(|e| RuntimeError::JsError(self.describe(e)))
    }

    /// Errors while a worker is running become `error` events; it keeps going.
    fn report(&self, error: RuntimeError) {
        debug!("worker {} reporting: {}", self.id(), error);
        self.scope.emit(WorkerEvent::Error(error.to_string()));
    }

    fn describe(&mut self, error: JsError) -> String {
        let value = error.to_opaque(&mut self.context);
        scope::describe_error(&value, &mut self.context)
    }

    /// Convert a JsValue to a displayable string
    pub fn value_to_string(&mut self, value: &JsValue) -> String {
        value
            .to_string(&mut self.context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| "[error converting value]".to_string())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scope.terminate_children();
        ContextScope::unregister(self.scope.id());
    }
}

/// Body of a worker thread: build the context, load the entry, serve.
///
/// Load failures are returned; the caller turns them into an `error` event.
pub(crate) fn run_worker(link: &ContextLink, entry: &MaterializedEntry) -> RuntimeResult<()> {
    if !link.lifecycle.mark_running() {
        debug!("worker {} terminated before it started", link.id);
        return Ok(());
    }

    let config = RuntimeConfig {
        base_path: link.base_path.clone(),
        name: link.name.clone(),
        ..RuntimeConfig::default()
    };
    let mut runtime = Runtime::build(
        config,
        link.id,
        Arc::clone(&link.inbox),
        Some(Arc::clone(&link.parent)),
    )?;

    runtime.load_entry(entry.path(), entry.kind())?;
    runtime.serve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("webworker-runtime-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_runtime_creation() {
        let runtime = Runtime::new();
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_basic_javascript() {
        let mut runtime = Runtime::new().unwrap();
        let result = runtime.eval_structured("1 + 1").unwrap();
        assert_eq!(result, StructuredValue::Number(2.0));
    }

    #[test]
    fn test_console_log() {
        let mut runtime = Runtime::new().unwrap();
        let result = runtime.eval("console.log('Hello from a worker runtime')", "test.js");
        assert!(result.is_ok());
    }

    #[test]
    fn test_promise() {
        let mut runtime = Runtime::new().unwrap();
        runtime
            .eval(
                "globalThis.result = 0; Promise.resolve(42).then(v => { result = v; });",
                "test.js",
            )
            .unwrap();
        assert_eq!(runtime.eval_structured("result").unwrap(), StructuredValue::Number(42.0));
    }

    #[test]
    fn test_timers_run_in_event_loop() {
        let mut runtime = Runtime::new().unwrap();
        runtime
            .eval("globalThis.ticks = []; setTimeout(() => ticks.push('b'), 20); setTimeout(() => ticks.push('a'), 5);", "test.js")
            .unwrap();
        runtime.run_event_loop().unwrap();
        assert_eq!(
            runtime.eval_structured("ticks").unwrap().to_json(),
            serde_json::json!(["a", "b"])
        );
    }

    #[test]
    fn test_worker_globals_absent_at_top_level() {
        let mut runtime = Runtime::new().unwrap();
        let result = runtime
            .eval_structured("[typeof Worker, typeof postMessage, typeof onmessage]")
            .unwrap();
        assert_eq!(result.to_json(), serde_json::json!(["function", "undefined", "undefined"]));
    }

    #[test]
    fn test_module_entry_with_imports() {
        let dir = scratch("module");
        fs::write(dir.join("dep.mjs"), "export const value = 20;").unwrap();
        fs::write(dir.join("legacy.cjs"), "module.exports = { extra: 1 };").unwrap();
        fs::write(
            dir.join("main.mjs"),
            "import { value } from './dep.mjs';\nimport legacy from './legacy.cjs';\nglobalThis.total = value * 2 + legacy.extra;",
        )
        .unwrap();

        let mut runtime = Runtime::with_config(RuntimeConfig {
            base_path: dir.clone(),
            ..RuntimeConfig::default()
        })
        .unwrap();
        runtime.run_file(&dir.join("main.mjs"), ScriptKind::Module).unwrap();
        assert_eq!(runtime.eval_structured("total").unwrap(), StructuredValue::Number(41.0));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_module_entry_is_parsed_as_written() {
        let dir = scratch("verbatim");
        fs::write(
            dir.join("main.js"),
            "const exports = {};\nexports.answer = 42;\nglobalThis.answer = await Promise.resolve(exports.answer);",
        )
        .unwrap();
        fs::write(dir.join("dep.js"), "exports.value = 1;").unwrap();
        fs::write(
            dir.join("importer.mjs"),
            "import dep from './dep.js';\nglobalThis.imported = dep.value;",
        )
        .unwrap();

        let mut runtime = Runtime::new().unwrap();
        runtime.run_file(&dir.join("main.js"), ScriptKind::Module).unwrap();
        assert_eq!(runtime.eval_structured("answer").unwrap(), StructuredValue::Number(42.0));

        // Imported CommonJS files are still bundled
        runtime.run_file(&dir.join("importer.mjs"), ScriptKind::Module).unwrap();
        assert_eq!(runtime.eval_structured("imported").unwrap(), StructuredValue::Number(1.0));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_classic_entry_with_require() {
        let dir = scratch("classic");
        fs::write(dir.join("dep.js"), "exports.greet = (n) => 'hi ' + n;").unwrap();
        fs::write(
            dir.join("main.js"),
            "const { greet } = require('./dep');\nglobalThis.greeting = greet('there');",
        )
        .unwrap();

        let mut runtime = Runtime::new().unwrap();
        runtime.run_file(&dir.join("main.js"), ScriptKind::Classic).unwrap();
        assert_eq!(
            runtime.eval_structured("greeting").unwrap(),
            StructuredValue::from("hi there")
        );

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_rejected_module_entry_is_an_error() {
        let dir = scratch("rejected");
        fs::write(dir.join("main.mjs"), "await Promise.resolve();\nthrow new Error('nope');").unwrap();

        let mut runtime = Runtime::new().unwrap();
        let err = runtime
            .run_file(&dir.join("main.mjs"), ScriptKind::Module)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleError(ref m) if m.contains("nope")), "{err}");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_terminate_signal_stops_the_top_level_loop() {
        let mut runtime = Runtime::new().unwrap();
        runtime.eval("setTimeout(() => {}, 60000);", "timer.js").unwrap();
        runtime.scope.inbox().push(Signal::Terminate);

        let start = Instant::now();
        runtime.run_event_loop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_entry_is_a_load_error() {
        let mut runtime = Runtime::new().unwrap();
        let err = runtime
            .load_entry(Path::new("/definitely/not/here.mjs"), ScriptKind::Module)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Load(_)));
    }
}
