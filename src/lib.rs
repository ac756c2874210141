//! webworker - browser-style Web Workers on native threads
//!
//! Each worker is an isolated Boa JS context on its own OS thread:
//! - Boa: ECMAScript engine written in Rust
//! - boa_runtime: WebAPI support (console, timers, URL, etc.)
//! - oxc_resolver: Node-style resolution for worker imports
//! - Structured-clone message passing with timestamped events

pub mod resolver;
pub mod runtime;
pub mod worker;

// Re-export commonly used types
pub use resolver::ModuleResolver;
pub use runtime::{Runtime, RuntimeConfig, RuntimeError, RuntimeResult};
pub use worker::{
    EventKind, LifecycleState, MessageEvent, ScriptKind, StructuredValue, Worker, WorkerError,
    WorkerOptions, WorkerReference, WorkerResult,
};
