use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use url::Url;

use webworker::runtime::{Runtime, RuntimeConfig};
use webworker::worker::ScriptKind;

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig {
        base_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        max_runtime: Duration::from_secs(10),
        name: None,
    })
    .unwrap()
}

fn run(code: &str) -> serde_json::Value {
    let mut runtime = runtime();
    runtime.eval(code, "main.js").unwrap();
    runtime.run_event_loop().unwrap();
    runtime.eval_structured("log").unwrap().to_json()
}

#[test]
fn module_worker_first_message() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/worker.mjs', { type: 'module' });
        worker.onmessage = (e) => {
            log.push(e.data, e.type, typeof e.timeStamp, e.target === worker);
            worker.terminate();
        };
    "#);
    assert_eq!(log, json!([42, "message", "number", true]));
}

#[test]
fn classic_worker_accepts_url_objects() {
    let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/worker.js");
    let href = Url::from_file_path(fixture).unwrap();
    let log = run(&format!(
        r#"
        globalThis.log = [];
        const worker = new Worker(new URL('{href}'));
        worker.addEventListener('message', (e) => {{
            log.push(e.data);
            worker.terminate();
        }});
        "#
    ));
    assert_eq!(log, json!([42]));
}

#[test]
fn received_data_is_a_copy() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        const sent = { list: [1, { deep: 'value' }] };
        worker.onmessage = (e) => {
            log.push(e.data !== sent, e.data.list[1].deep, e.data.list.length);
            worker.terminate();
        };
        worker.postMessage(sent);
        sent.list[1].deep = 'mutated after posting';
        sent.list.push('extra');
    "#);
    assert_eq!(log, json!([true, "value", 2]));
}

#[test]
fn uncloneable_values_throw_data_clone_error() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        const cyclic = { name: 'loop' };
        cyclic.self = cyclic;
        for (const bad of [() => 1, Symbol('s'), 10n, Promise.resolve(), worker, cyclic, { nested: [worker] }]) {
            try {
                worker.postMessage(bad);
                log.push('sent');
            } catch (e) {
                log.push(e instanceof TypeError && e.message.startsWith('DataCloneError'));
            }
        }
        worker.terminate();
    "#);
    assert_eq!(log, json!([true, true, true, true, true, true, true]));
}

#[test]
fn built_in_values_keep_their_type_across_workers() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        worker.onmessage = (e) => {
            const [map, date, regexp, set] = e.data;
            log.push(
                map instanceof Map && map.get(1) === 2,
                date instanceof Date && date.getTime() === 0,
                regexp instanceof RegExp && String(regexp) === '/re/g',
                set instanceof Set && set.has('x'),
            );
            worker.terminate();
        };
        worker.postMessage([new Map([[1, 2]]), new Date(0), /re/g, new Set(['x'])]);
    "#);
    assert_eq!(log, json!([true, true, true, true]));
}

#[test]
fn unsupported_built_ins_are_refused_before_posting() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        for (const bad of [new Error('e'), new Uint8Array(2), new WeakMap()]) {
            try {
                worker.postMessage(bad);
                log.push('sent');
            } catch (e) {
                log.push(e.message.startsWith('DataCloneError'));
            }
        }
        worker.terminate();
    "#);
    assert_eq!(log, json!([true, true, true]));
}

#[test]
fn worker_objects_look_like_workers() {
    let log = run(r#"
        globalThis.log = [];
        const a = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        const b = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        log.push(a instanceof Worker, Object.prototype.toString.call(a), a !== b, a.onmessage);
        a.terminate();
        b.terminate();
    "#);
    assert_eq!(log, json!([true, "[object Worker]", true, null]));
}

#[test]
fn listeners_are_deduplicated_and_removable() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/echo.mjs', { type: 'module' });
        const counted = () => log.push('counted');
        const removed = () => log.push('removed');
        worker.addEventListener('message', counted);
        worker.addEventListener('message', counted);
        worker.addEventListener('message', removed);
        worker.removeEventListener('message', removed);
        worker.onmessage = () => {
            log.push('handler');
            worker.terminate();
        };
        worker.postMessage('ping');
    "#);
    assert_eq!(log, json!(["handler", "counted"]));
}

#[test]
fn error_events_carry_message_and_worker_keeps_running() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/throws.mjs', { type: 'module' });
        worker.onerror = (e) => log.push(e.type, e.message.includes('listener failed'), e.error instanceof Error);
        worker.onmessage = (e) => {
            log.push(e.data);
            if (e.data === 'ready') {
                worker.postMessage(1);
            } else {
                worker.terminate();
            }
        };
    "#);
    assert_eq!(log, json!(["ready", "error", true, true, ["still running", 1]]));
}

#[test]
fn close_event_after_self_close() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/close.mjs', { type: 'module' });
        worker.addEventListener('message', (e) => log.push(e.data));
        worker.addEventListener('close', (e) => log.push(e.type));
    "#);
    assert_eq!(log, json!(["closing", "close"]));
}

#[test]
fn load_failure_is_an_error_event() {
    let log = run(r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/not-there.mjs', { type: 'module' });
        worker.onerror = (e) => log.push(e.type);
        worker.onmessage = () => log.push('unexpected');
    "#);
    assert_eq!(log, json!(["error"]));
}

#[test]
fn bad_references_throw_synchronously() {
    let log = run(r#"
        globalThis.log = [];
        for (const reference of ['https://example.com/w.js', 'data:text/javascript;base64,@@@']) {
            try {
                new Worker(reference);
                log.push('created');
            } catch (e) {
                log.push(e.name);
            }
        }
        try {
            new Worker('./tests/fixtures/echo.mjs', { type: 'shared' });
        } catch (e) {
            log.push(e.name);
        }
    "#);
    assert_eq!(log, json!(["SyntaxError", "SyntaxError", "TypeError"]));
}

#[test]
fn nested_workers_from_a_module_entry() {
    let dir = std::env::temp_dir().join(format!("webworker-nested-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let main = dir.join("main.mjs");
    std::fs::write(
        &main,
        r#"
        globalThis.log = [];
        const worker = new Worker('./tests/fixtures/worker-making-worker.mjs', { type: 'module' });
        worker.onmessage = (e) => {
            log.push(e.data);
            worker.terminate();
        };
        "#,
    )
    .unwrap();

    let mut runtime = runtime();
    runtime.run_file(&main, ScriptKind::Module).unwrap();
    assert_eq!(runtime.eval_structured("log").unwrap().to_json(), json!([42]));
    std::fs::remove_dir_all(dir).ok();
}

#[test]
fn event_loop_gives_up_after_max_runtime() {
    let mut runtime = Runtime::with_config(RuntimeConfig {
        base_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        max_runtime: Duration::from_millis(200),
        name: None,
    })
    .unwrap();
    runtime
        .eval("new Worker('./tests/fixtures/echo.mjs', { type: 'module' });", "main.js")
        .unwrap();

    let start = Instant::now();
    runtime.run_event_loop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}
