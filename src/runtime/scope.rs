//! Per-context global scope: the `Worker` class every context sees, the
//! worker-global API (`self`, `postMessage`, `onmessage`, `close`) installed
//! inside spawned workers, and the native functions behind both.
//!
//! Native functions are plain fn pointers, so they find their context's
//! [`ContextScope`] through the `__webworker_scope_id` global and the
//! registry below.

use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsValue, NativeFunction, Source,
    js_string, object::builtins::JsArray,
};
use log::{debug, error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::worker::{
    EventSink, Mailbox, ScriptKind, Signal, SpawnOptions, StructuredValue, WorkerBinding,
    WorkerError, WorkerEvent, WorkerHandle, spawn_reference,
};

const SCOPE_ID_GLOBAL: &str = "__webworker_scope_id";

lazy_static::lazy_static! {
    static ref SCOPES: Mutex<HashMap<u32, Arc<ContextScope>>> = Mutex::new(HashMap::new());
}

/// Host-side state of one execution context.
pub struct ContextScope {
    id: u32,
    base_path: PathBuf,
    inbox: Arc<Mailbox<Signal>>,
    /// Where outbound events go; `None` for the top-level context
    parent: Option<Arc<dyn EventSink>>,
    children: Mutex<HashMap<u32, Arc<WorkerHandle>>>,
    close_requested: AtomicBool,
}

impl ContextScope {
    pub fn new(
        id: u32,
        base_path: impl Into<PathBuf>,
        inbox: Arc<Mailbox<Signal>>,
        parent: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            id,
            base_path: base_path.into(),
            inbox,
            parent,
            children: Mutex::new(HashMap::new()),
            close_requested: AtomicBool::new(false),
        }
    }

    /// Make the scope reachable from native functions running in `context`.
    pub fn register(self, context: &mut Context) -> JsResult<Arc<Self>> {
        let scope = Arc::new(self);
        context.global_object().set(
            js_string!(SCOPE_ID_GLOBAL),
            JsValue::from(scope.id),
            false,
            context,
        )?;
        SCOPES.lock().insert(scope.id, Arc::clone(&scope));
        Ok(scope)
    }

    /// The scope of the context a native function was called from.
    pub fn current(context: &mut Context) -> JsResult<Arc<Self>> {
        let id = context
            .global_object()
            .get(js_string!(SCOPE_ID_GLOBAL), context)?
            .to_u32(context)?;
        SCOPES.lock().get(&id).cloned().ok_or_else(|| {
            JsNativeError::error()
                .with_message(format!("execution context {id} is gone"))
                .into()
        })
    }

    pub fn unregister(id: u32) {
        SCOPES.lock().remove(&id);
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn inbox(&self) -> &Arc<Mailbox<Signal>> {
        &self.inbox
    }

    pub fn is_worker(&self) -> bool {
        self.parent.is_some()
    }

    /// Send an event to whoever owns this context. No-op at top level.
    pub fn emit(&self, event: WorkerEvent) {
        if let Some(parent) = &self.parent {
            parent.deliver(event);
        }
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    pub fn adopt(&self, handle: Arc<WorkerHandle>) {
        self.children.lock().insert(handle.id(), handle);
    }

    pub fn child(&self, id: u32) -> Option<Arc<WorkerHandle>> {
        self.children.lock().get(&id).cloned()
    }

    pub fn release(&self, id: u32) -> Option<Arc<WorkerHandle>> {
        self.children.lock().remove(&id)
    }

    pub fn has_children(&self) -> bool {
        !self.children.lock().is_empty()
    }

    /// Terminate every child still owned by this context.
    pub fn terminate_children(&self) {
        let children: Vec<_> = self.children.lock().drain().map(|(_, h)| h).collect();
        for child in children {
            debug!("context {} reclaiming worker {}", self.id, child.id());
            child.terminate();
        }
    }
}

/// Routes a child's events into its owner's inbox, tagged with the child id.
struct ChildSink {
    worker_id: u32,
    inbox: Arc<Mailbox<Signal>>,
}

impl EventSink for ChildSink {
    fn deliver(&self, event: WorkerEvent) {
        self.inbox.push(Signal::Child {
            worker_id: self.worker_id,
            event,
        });
    }
}

fn clone_error(e: WorkerError) -> JsError {
    JsNativeError::typ().with_message(e.to_string()).into()
}

fn spawn_error(e: WorkerError) -> JsError {
    match e {
        WorkerError::UnsupportedReferenceKind(_) | WorkerError::MalformedDataReference(_) => {
            JsNativeError::syntax().with_message(e.to_string()).into()
        }
        other => JsNativeError::error().with_message(other.to_string()).into(),
    }
}

fn binding_id(value: &JsValue) -> JsResult<u32> {
    value
        .as_object()
        .and_then(|obj| obj.downcast_ref::<WorkerBinding>().map(|b| b.id))
        .ok_or_else(|| JsNativeError::typ().with_message("Illegal invocation").into())
}

/// Text of a thrown value, as `Error.prototype.toString` would render it.
pub(crate) fn describe_error(value: &JsValue, context: &mut Context) -> String {
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| value.display().to_string())
}

/// Native functions shared by the caller-side and worker-side preludes.
fn register_natives(context: &mut Context) -> JsResult<()> {
    // __webworker_spawn(url, type, name, prototype) -> [id, worker]
    let spawn_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let scope = ContextScope::current(context)?;
        let reference = args
            .get_or_undefined(0)
            .to_string(context)?
            .to_std_string_escaped();

        let kind_arg = args.get_or_undefined(1);
        let kind = if kind_arg.is_undefined() {
            ScriptKind::Classic
        } else {
            let kind = kind_arg.to_string(context)?.to_std_string_escaped();
            kind.parse::<ScriptKind>().map_err(|_| {
                JsNativeError::typ()
                    .with_message(format!("'{kind}' is not a valid WorkerType"))
            })?
        };

        let name_arg = args.get_or_undefined(2);
        let name = if name_arg.is_undefined() {
            None
        } else {
            Some(name_arg.to_string(context)?.to_std_string_escaped())
        };

        let options = SpawnOptions {
            kind,
            name,
            base_path: scope.base_path.clone(),
        };
        let inbox = Arc::clone(&scope.inbox);
        let handle = spawn_reference(&reference, &options, move |worker_id| {
            Arc::new(ChildSink { worker_id, inbox }) as Arc<dyn EventSink>
        })
        .map_err(spawn_error)?;

        let id = handle.id();
        scope.adopt(handle);

        let proto = args.get_or_undefined(3).as_object().map(|o| o.clone());
        let worker = JsObject::from_proto_and_data(proto, WorkerBinding { id });
        let pair = JsArray::from_iter([JsValue::from(id), JsValue::from(worker)], context);
        Ok(pair.into())
    });
    context.register_global_callable(js_string!("__webworker_spawn"), 4, spawn_fn)?;

    // __webworker_post_to(worker, data)
    let post_to_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let id = binding_id(args.get_or_undefined(0))?;
        let data = StructuredValue::from_js(args.get_or_undefined(1), context).map_err(clone_error)?;
        if let Some(child) = ContextScope::current(context)?.child(id) {
            child.post(data);
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__webworker_post_to"), 2, post_to_fn)?;

    // __webworker_terminate(worker)
    let terminate_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let id = binding_id(args.get_or_undefined(0))?;
        if let Some(child) = ContextScope::current(context)?.release(id) {
            child.terminate();
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__webworker_terminate"), 1, terminate_fn)?;

    // __webworker_post(data): worker -> owner
    let post_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let data = StructuredValue::from_js(args.get_or_undefined(0), context).map_err(clone_error)?;
        let scope = ContextScope::current(context)?;
        // Nothing leaves a context once it asked to close
        if !scope.close_requested() {
            scope.emit(WorkerEvent::Message(data));
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__webworker_post"), 1, post_fn)?;

    let close_fn = NativeFunction::from_fn_ptr(|_this, _args, context| {
        ContextScope::current(context)?.request_close();
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__webworker_close"), 0, close_fn)?;

    // __webworker_report_error(error): listener failures that must not stop dispatch
    let report_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let message = describe_error(args.get_or_undefined(0), context);
        let scope = ContextScope::current(context)?;
        if scope.is_worker() {
            scope.emit(WorkerEvent::Error(message));
        } else {
            error!("Uncaught {message}");
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__webworker_report_error"), 1, report_fn)?;

    Ok(())
}

/// Caller-side `Worker` class. Listener lists keep the `on<kind>` handler
/// in slot 0; `live` holds workers until their thread exits so events still
/// reach listeners of an otherwise unreachable worker.
const WORKER_CLASS_JS: &str = r#"
(function () {
    const spawn = globalThis.__webworker_spawn;
    const postTo = globalThis.__webworker_post_to;
    const terminateWorker = globalThis.__webworker_terminate;
    const reportError = globalThis.__webworker_report_error;
    const states = new WeakMap();
    const live = new Map();

    function stateOf(worker) {
        const state = states.get(worker);
        if (state === undefined) {
            throw new TypeError('Illegal invocation');
        }
        return state;
    }

    function invoke(listener, target, event) {
        if (typeof listener === 'function') {
            listener.call(target, event);
        } else if (listener !== null && typeof listener.handleEvent === 'function') {
            listener.handleEvent(event);
        }
    }

    class Worker {
        constructor(url, options) {
            const href = url !== null && typeof url === 'object' && 'href' in url
                ? String(url.href)
                : String(url);
            const opts = options == null ? {} : options;
            const name = opts.name === undefined ? undefined : String(opts.name);
            const [id, worker] = spawn(href, opts.type, name, new.target.prototype);
            states.set(worker, {
                id,
                listeners: { message: [null], error: [null], close: [null] },
            });
            live.set(id, worker);
            return worker;
        }

        postMessage(data) {
            stateOf(this);
            postTo(this, data);
        }

        terminate() {
            const state = stateOf(this);
            terminateWorker(this);
            live.delete(state.id);
        }

        addEventListener(type, listener) {
            const list = stateOf(this).listeners[type];
            if (list === undefined || listener == null) return;
            if (list.indexOf(listener, 1) === -1) list.push(listener);
        }

        removeEventListener(type, listener) {
            const list = stateOf(this).listeners[type];
            if (list === undefined) return;
            const at = list.indexOf(listener, 1);
            if (at !== -1) list.splice(at, 1);
        }

        get onmessage() { return stateOf(this).listeners.message[0]; }
        set onmessage(fn) { stateOf(this).listeners.message[0] = typeof fn === 'function' ? fn : null; }

        get onerror() { return stateOf(this).listeners.error[0]; }
        set onerror(fn) { stateOf(this).listeners.error[0] = typeof fn === 'function' ? fn : null; }
    }

    Object.defineProperty(Worker.prototype, Symbol.toStringTag, { value: 'Worker' });
    Object.defineProperty(globalThis, 'Worker', { value: Worker, writable: true, configurable: true });

    globalThis.__webworker_deliver_child = function (id, type, data, message) {
        const worker = live.get(id);
        if (worker === undefined) return;
        if (type === 'exit') {
            live.delete(id);
            return;
        }
        const event = { type, data, timeStamp: Date.now(), target: worker, currentTarget: worker };
        if (type === 'error') {
            event.message = message;
            event.error = new Error(message);
        }
        for (const listener of stateOf(worker).listeners[type].slice()) {
            try {
                invoke(listener, worker, event);
            } catch (e) {
                reportError(e);
            }
        }
    };
})();
"#;

/// Worker-global API. `onmessage` is slot 0 of the message listener list.
const WORKER_SCOPE_JS: &str = r#"
(function () {
    const post = globalThis.__webworker_post;
    const closeScope = globalThis.__webworker_close;
    const reportError = globalThis.__webworker_report_error;
    const listeners = [null];

    Object.defineProperties(globalThis, {
        self: { value: globalThis, writable: true, configurable: true },
        postMessage: {
            value: function postMessage(data) { post(data); },
            writable: true,
            configurable: true,
        },
        close: {
            value: function close() { closeScope(); },
            writable: true,
            configurable: true,
        },
        onmessage: {
            get() { return listeners[0]; },
            set(fn) { listeners[0] = typeof fn === 'function' ? fn : null; },
            configurable: true,
        },
        addEventListener: {
            value: function addEventListener(type, listener) {
                if (type !== 'message' || listener == null) return;
                if (listeners.indexOf(listener, 1) === -1) listeners.push(listener);
            },
            writable: true,
            configurable: true,
        },
        removeEventListener: {
            value: function removeEventListener(type, listener) {
                if (type !== 'message') return;
                const at = listeners.indexOf(listener, 1);
                if (at !== -1) listeners.splice(at, 1);
            },
            writable: true,
            configurable: true,
        },
        __webworker_deliver: {
            value: function (data) {
                const event = {
                    type: 'message',
                    data,
                    timeStamp: Date.now(),
                    target: globalThis,
                    currentTarget: globalThis,
                };
                for (const listener of listeners.slice()) {
                    if (listener === null) continue;
                    try {
                        if (typeof listener === 'function') {
                            listener.call(globalThis, event);
                        } else if (typeof listener.handleEvent === 'function') {
                            listener.handleEvent(event);
                        }
                    } catch (e) {
                        reportError(e);
                    }
                }
            },
        },
    });
})();
"#;

/// Install the `Worker` class. Every context gets it, so workers can nest.
pub fn install_worker_class(context: &mut Context) -> JsResult<()> {
    register_natives(context)?;
    context.eval(Source::from_bytes(WORKER_CLASS_JS))?;
    Ok(())
}

/// Install the worker-global API inside a spawned context.
pub fn install_worker_scope(context: &mut Context, name: Option<&str>) -> JsResult<()> {
    context.eval(Source::from_bytes(WORKER_SCOPE_JS))?;
    context.global_object().set(
        js_string!("name"),
        JsValue::from(js_string!(name.unwrap_or_default())),
        false,
        context,
    )?;
    Ok(())
}
