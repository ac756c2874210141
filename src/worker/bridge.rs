//! Spawns isolated execution contexts and wires their channels.
//!
//! Every context (the top-level runtime and each worker) gets an id and an
//! inbox of [`Signal`]s. A worker thread owns its engine; the only things
//! shared with the owner are the inbox, the lifecycle and the event sink
//! that carries outbound events back.

use boa_engine::JsData;
use boa_gc::{Finalize, Trace};
use log::debug;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use super::codec::StructuredValue;
use super::error::{WorkerError, WorkerResult};
use super::lifecycle::{Lifecycle, LifecycleState};
use super::mailbox::Mailbox;
use super::materialize::MaterializedEntry;
use super::reference::{ScriptKind, WorkerReference};
use crate::runtime;

/// Global counter for context ids. The top-level runtime and every worker
/// draw from the same sequence.
static CONTEXT_COUNTER: AtomicU32 = AtomicU32::new(1);

pub fn next_context_id() -> u32 {
    CONTEXT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Events a worker context emits towards its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(StructuredValue),
    Error(String),
    /// The context asked to close itself
    Close,
    /// The thread is gone; always the last event of a context
    Exited,
}

/// What a context's inbox carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A message from the owner
    Message(StructuredValue),
    Terminate,
    /// An event from a worker this context created
    Child { worker_id: u32, event: WorkerEvent },
}

/// Receives the events of one worker, on the worker's thread.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: WorkerEvent);
}

/// Everything a worker thread needs to talk to its owner.
pub(crate) struct ContextLink {
    pub id: u32,
    pub name: Option<String>,
    pub base_path: PathBuf,
    pub inbox: Arc<Mailbox<Signal>>,
    pub lifecycle: Arc<Lifecycle>,
    pub parent: Arc<dyn EventSink>,
}

/// Native data behind a JS `Worker` object.
#[derive(Debug, Clone, Trace, Finalize, JsData)]
pub struct WorkerBinding {
    #[unsafe_ignore_trace]
    pub id: u32,
}

/// Parameters for spawning one worker.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub kind: ScriptKind,
    pub name: Option<String>,
    /// Anchors relative references and seeds the worker's module resolution
    pub base_path: PathBuf,
}

/// Owner-side handle to a running worker thread.
pub struct WorkerHandle {
    id: u32,
    name: Option<String>,
    lifecycle: Arc<Lifecycle>,
    inbox: Arc<Mailbox<Signal>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Start a worker thread running `entry`. Returns immediately; whether
    /// the entry loads is reported through `sink`.
    pub(crate) fn spawn(
        id: u32,
        entry: MaterializedEntry,
        options: &SpawnOptions,
        sink: Arc<dyn EventSink>,
    ) -> WorkerResult<Arc<Self>> {
        let lifecycle = Arc::new(Lifecycle::new());
        let inbox = Arc::new(Mailbox::new());

        let link = ContextLink {
            id,
            name: options.name.clone(),
            base_path: options.base_path.clone(),
            inbox: Arc::clone(&inbox),
            lifecycle: Arc::clone(&lifecycle),
            parent: sink,
        };

        let thread_name = match &options.name {
            Some(name) => format!("webworker-{id}-{name}"),
            None => format!("webworker-{id}"),
        };

        debug!("spawning worker {} for {}", id, entry.path().display());

        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| runtime::run_worker(&link, &entry)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => link.parent.deliver(WorkerEvent::Error(e.to_string())),
                    Err(payload) => link.parent.deliver(WorkerEvent::Error(format!(
                        "worker {} crashed: {}",
                        link.id,
                        panic_message(payload.as_ref())
                    ))),
                }
                drop(entry);
                debug!("worker {} exited", link.id);
                link.parent.deliver(WorkerEvent::Exited);
            })
            .map_err(WorkerError::Spawn)?;

        Ok(Arc::new(Self {
            id,
            name: options.name.clone(),
            lifecycle,
            inbox,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Queue a message for the worker. Dropped once the handle is terminal.
    pub fn post(&self, value: StructuredValue) -> bool {
        if self.lifecycle.state().is_terminal() {
            return false;
        }
        self.inbox.push(Signal::Message(value))
    }

    /// Stop the worker. The state flips immediately; the thread stops once
    /// it next looks at its inbox. Repeated calls are no-ops.
    pub fn terminate(&self) -> bool {
        let first = self.lifecycle.terminate();
        if first {
            debug!("terminating worker {}", self.id);
            self.inbox.push(Signal::Terminate);
            self.inbox.close();
        }
        first
    }

    /// Wait for the thread to finish. Only useful after `terminate` or a
    /// self-close; never call it from the worker's own thread.
    pub fn join(&self) {
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Parse, resolve, materialize and spawn in one step.
///
/// `sink_for` receives the new worker's id so the sink can tag events.
pub(crate) fn spawn_reference(
    reference: &str,
    options: &SpawnOptions,
    sink_for: impl FnOnce(u32) -> Arc<dyn EventSink>,
) -> WorkerResult<Arc<WorkerHandle>> {
    let reference = WorkerReference::parse(reference)?;
    spawn_resolved(&reference, options, sink_for)
}

pub(crate) fn spawn_resolved(
    reference: &WorkerReference,
    options: &SpawnOptions,
    sink_for: impl FnOnce(u32) -> Arc<dyn EventSink>,
) -> WorkerResult<Arc<WorkerHandle>> {
    let entry = reference.resolve(options.kind, &options.base_path)?;
    let entry = MaterializedEntry::materialize(entry)?;
    let id = next_context_id();
    WorkerHandle::spawn(id, entry, options, sink_for(id))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
