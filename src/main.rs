//! webworker - run scripts that use browser-style Web Workers
//!
//! `webworker FILE` runs a script with `new Worker(...)` available;
//! `webworker spawn REFERENCE` starts a single worker from the command line
//! and prints every event it emits.

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use webworker::runtime::{Runtime, RuntimeConfig};
use webworker::worker::{EventKind, MessageEvent, ScriptKind, Worker, WorkerOptions};

#[derive(Parser)]
#[command(name = "webworker")]
#[command(author, version, about = "Browser-style Web Workers on native threads")]
struct Cli {
    /// JavaScript file to execute
    file: Option<PathBuf>,

    /// Load the file as an ES module instead of a classic script
    #[arg(long)]
    module: bool,

    /// Evaluate JavaScript code from command line
    #[arg(short, long)]
    eval: Option<String>,

    /// Give up on the event loop after this many seconds
    #[arg(long, default_value = "300")]
    max_runtime: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file with full event loop support (timers, workers)
    Run {
        /// JavaScript file to run
        file: PathBuf,
        /// Load the file as an ES module
        #[arg(long)]
        module: bool,
    },
    /// Start one worker and print the events it emits
    Spawn {
        /// Path, file: URL or data: URL of the worker entry
        reference: String,
        /// Start a module worker
        #[arg(long)]
        module: bool,
        /// JSON message to post once the worker is created
        #[arg(short, long)]
        message: Option<String>,
        /// Seconds to wait for events before terminating the worker
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = RuntimeConfig {
        max_runtime: Duration::from_secs(cli.max_runtime),
        ..RuntimeConfig::default()
    };

    match cli.command {
        Some(Commands::Run { file, module }) => {
            run_file(&file, script_kind(module), config)?;
        }
        Some(Commands::Spawn {
            reference,
            module,
            message,
            timeout,
        }) => {
            spawn_worker(&reference, script_kind(module), message.as_deref(), timeout)?;
        }
        None => {
            if let Some(code) = cli.eval {
                eval_code(&code, config)?;
            } else if let Some(file) = cli.file {
                run_file(&file, script_kind(cli.module), config)?;
            } else {
                eprintln!("{}: nothing to run; pass a FILE, -e CODE or a subcommand", "Error".red());
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn script_kind(module: bool) -> ScriptKind {
    if module {
        ScriptKind::Module
    } else {
        ScriptKind::Classic
    }
}

/// Execute a file with full event loop support
fn run_file(path: &Path, kind: ScriptKind, config: RuntimeConfig) -> Result<()> {
    let mut runtime = Runtime::with_config(config).into_diagnostic()?;
    let path = path.canonicalize().into_diagnostic()?;

    if let Err(e) = runtime.run_file(&path, kind) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    Ok(())
}

/// Evaluate code from the command line, then drain the event loop
fn eval_code(code: &str, config: RuntimeConfig) -> Result<()> {
    let mut runtime = Runtime::with_config(config).into_diagnostic()?;

    match runtime.eval(code, "eval.js") {
        Ok(value) => {
            if !value.is_undefined() {
                println!("{}", runtime.value_to_string(&value));
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    runtime.run_event_loop().into_diagnostic()?;
    Ok(())
}

/// Drive one worker through the Rust API
fn spawn_worker(reference: &str, kind: ScriptKind, message: Option<&str>, timeout: u64) -> Result<()> {
    let options = WorkerOptions {
        kind,
        ..WorkerOptions::default()
    };
    let (tx, rx) = mpsc::channel::<MessageEvent>();
    let worker = Worker::new_with(reference, options, |worker| {
        for kind in EventKind::ALL {
            let tx = tx.clone();
            worker.add_event_listener(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
    })
    .into_diagnostic()?;
    drop(tx);

    if let Some(json) = message {
        let value: serde_json::Value = serde_json::from_str(json).into_diagnostic()?;
        worker.post_message(&value).into_diagnostic()?;
    }

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let poll = Duration::from_millis(100);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            println!("{}: no more events after {}s", "Info".cyan(), timeout);
            break;
        }
        match rx.recv_timeout(remaining.min(poll)) {
            Ok(event) => {
                print_event(&event);
                if event.kind == EventKind::Close {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) if worker.state().is_terminal() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    worker.terminate();
    Ok(())
}

fn print_event(event: &MessageEvent) {
    let stamp = event.timestamp_millis() as u64;
    match event.kind {
        EventKind::Message => {
            println!("{} {} {}", stamp, "message".green(), event.data.to_json());
        }
        EventKind::Error => {
            println!(
                "{} {} {}",
                stamp,
                "error".red(),
                event.message.as_deref().unwrap_or("unknown error")
            );
        }
        EventKind::Close => println!("{} {}", stamp, "close".yellow()),
    }
}
