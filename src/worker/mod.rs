//! Browser-style Workers on native threads.
//!
//! A [`Worker`] is created from a script reference (file path, `file:` URL
//! or `data:` URL), runs in its own engine on its own thread, and talks to
//! its owner only through cloned messages.
//!
//! ```no_run
//! use webworker::worker::{EventKind, Worker, WorkerOptions};
//!
//! let worker = Worker::new_with("./worker.mjs", WorkerOptions::module(), |worker| {
//!     worker.add_event_listener(EventKind::Message, |event| {
//!         println!("worker said {:?}", event.data);
//!     });
//! })?;
//! worker.post_message(&serde_json::json!({ "greeting": "hello" }))?;
//! # Ok::<(), webworker::worker::WorkerError>(())
//! ```

mod bridge;
mod codec;
mod error;
mod event;
mod lifecycle;
mod mailbox;
mod materialize;
mod reference;

pub use bridge::{EventSink, Signal, SpawnOptions, WorkerBinding, WorkerEvent, WorkerHandle};
pub use codec::{MAX_DEPTH, StructuredValue};
pub use error::{WorkerError, WorkerResult};
pub use event::{EventKind, Listener, ListenerId, ListenerRegistry, MessageEvent};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use mailbox::Mailbox;
pub use materialize::{MaterializedEntry, scratch_dir};
pub use reference::{EntryDescriptor, EntrySource, ScriptKind, WorkerReference};

pub(crate) use bridge::{ContextLink, next_context_id, spawn_reference};

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Options accepted by [`Worker::new`].
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub kind: ScriptKind,
    /// Label for the thread, console output and `self.name`
    pub name: Option<String>,
    /// Anchor for relative references (defaults to the current directory)
    pub base_dir: Option<PathBuf>,
}

impl WorkerOptions {
    pub fn classic() -> Self {
        Self::default()
    }

    pub fn module() -> Self {
        Self {
            kind: ScriptKind::Module,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            kind: self.kind,
            name: self.name.clone(),
            base_path: self
                .base_dir
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// State shared between a [`Worker`] and its dispatch thread.
struct Shared {
    /// Also serializes `terminate` against event admission
    listeners: Mutex<ListenerRegistry>,
    queue: Mailbox<WorkerEvent>,
}

/// Feeds worker events into the dispatch queue.
struct DispatchSink(Arc<Shared>);

impl EventSink for DispatchSink {
    fn deliver(&self, event: WorkerEvent) {
        self.0.queue.push(event);
    }
}

/// Caller-facing worker handle for Rust code.
///
/// Listeners run on a dedicated dispatch thread, one event at a time and
/// in arrival order. Dropping the `Worker` terminates it.
pub struct Worker {
    handle: Arc<WorkerHandle>,
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(reference: &str, options: WorkerOptions) -> WorkerResult<Self> {
        Self::new_with(reference, options, |_| {})
    }

    /// Like [`Worker::new`], but `setup` runs before any event is
    /// dispatched, so listeners it registers see the worker's first event.
    pub fn new_with<F>(reference: &str, options: WorkerOptions, setup: F) -> WorkerResult<Self>
    where
        F: FnOnce(&Worker),
    {
        Self::from_reference(&WorkerReference::parse(reference)?, options, setup)
    }

    pub fn from_reference<F>(
        reference: &WorkerReference,
        options: WorkerOptions,
        setup: F,
    ) -> WorkerResult<Self>
    where
        F: FnOnce(&Worker),
    {
        let shared = Arc::new(Shared {
            listeners: Mutex::new(ListenerRegistry::new()),
            queue: Mailbox::new(),
        });

        let sink: Arc<dyn EventSink> = Arc::new(DispatchSink(Arc::clone(&shared)));
        let handle = bridge::spawn_resolved(reference, &options.spawn_options(), move |_| sink)?;

        let mut worker = Self {
            handle,
            shared,
            dispatcher: None,
        };
        // Events queue up in the mailbox until the dispatcher starts
        setup(&worker);

        let shared = Arc::clone(&worker.shared);
        let lifecycle = Arc::clone(worker.handle.lifecycle());
        let dispatcher = thread::Builder::new()
            .name(format!("webworker-{}-events", worker.id()))
            .spawn(move || dispatch_loop(&shared, &lifecycle))
            .map_err(WorkerError::Spawn)?;
        worker.dispatcher = Some(dispatcher);

        Ok(worker)
    }

    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.handle.name()
    }

    pub fn state(&self) -> LifecycleState {
        self.handle.state()
    }

    /// Clone `value` and queue it for the worker.
    ///
    /// Fails with [`WorkerError::UncloneableValue`] if the value has no
    /// structured representation. Messages to a terminated worker are
    /// silently discarded.
    pub fn post_message<T: Serialize + ?Sized>(&self, value: &T) -> WorkerResult<()> {
        let value = StructuredValue::from_serialize(value)?;
        self.handle.post(value);
        Ok(())
    }

    pub fn post_value(&self, value: &StructuredValue) -> WorkerResult<()> {
        self.handle.post(value.clone());
        Ok(())
    }

    /// Stop the worker. Idempotent; no listener runs after the first call.
    pub fn terminate(&self) {
        let _registry = self.shared.listeners.lock();
        if self.handle.terminate() {
            self.shared.queue.close();
        }
    }

    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().add(kind, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.shared.listeners.lock().remove(kind, id)
    }

    /// Assign or clear the single handler slot for `kind`.
    pub fn set_handler<F>(&self, kind: EventKind, listener: Option<F>)
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        let listener = listener.map(|f| Arc::new(f) as Listener);
        self.shared.listeners.lock().set_handler(kind, listener);
    }

    pub fn clear_handler(&self, kind: EventKind) {
        self.shared.listeners.lock().set_handler(kind, None);
    }

    /// Shorthand for the `message` handler slot.
    pub fn set_onmessage<F>(&self, listener: F)
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.set_handler(EventKind::Message, Some(listener));
    }

    pub fn set_onerror<F>(&self, listener: F)
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.set_handler(EventKind::Error, Some(listener));
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.terminate();
        // Detached: the last reference may be dropped from inside a listener.
        self.dispatcher.take();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("handle", &self.handle).finish()
    }
}

fn dispatch_loop(shared: &Shared, lifecycle: &Lifecycle) {
    loop {
        let events = shared.queue.wait(None);
        if events.is_empty() && shared.queue.is_closed() {
            return;
        }

        for event in events {
            let event = match event {
                WorkerEvent::Message(data) => MessageEvent::message(data),
                WorkerEvent::Error(message) => MessageEvent::error(message),
                WorkerEvent::Close => MessageEvent::close(),
                WorkerEvent::Exited => {
                    lifecycle.reclaim();
                    shared.queue.close();
                    return;
                }
            };

            let listeners = {
                let registry = shared.listeners.lock();
                if !lifecycle.admit(event.kind) {
                    debug!("dropping {} event in state {}", event.kind, lifecycle.state());
                    continue;
                }
                registry.snapshot(event.kind)
            };

            for listener in listeners {
                if lifecycle.state() == LifecycleState::Terminated {
                    break;
                }
                listener(&event);
            }
        }
    }
}
