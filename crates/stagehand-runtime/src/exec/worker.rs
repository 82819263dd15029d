//! Worker-process side of the process pool
//!
//! A worker is a re-execution of the current binary with
//! `STAGEHAND_WORKER=1` in its environment. It reads line-delimited JSON
//! messages on stdin, executes registry-backed tasks, and serves context
//! operations by round-tripping them to the parent on stdout. Both sides
//! skip lines that do not parse as protocol messages, so output from a test
//! harness sharing stdout cannot corrupt the stream.
//!
//! Embedding binaries call [`init`] first thing in `main`, after their task
//! registrations. Test binaries expose a shim test that calls
//! [`test_entry`] instead, because the libtest harness owns `main`.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};

use eyre::{eyre, WrapErr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Context, ContextTransport, CtxRequest, CtxResponse};
use crate::error::BoxError;
use crate::registry::{self, RegisteredCallable};
use crate::task::Kwargs;
use crate::util::lock;

/// Environment variable that switches a process into worker mode.
pub const WORKER_ENV: &str = "STAGEHAND_WORKER";

/// Messages sent from the owning process to a worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum ParentMessage {
    /// Execute a registered task with fully assembled arguments.
    Run {
        task: String,
        args: Vec<Value>,
        kwargs: Kwargs,
    },
    /// Reply to a context request the worker sent.
    CtxReply { response: CtxResponse },
    /// Drain and exit.
    Shutdown,
}

/// Messages sent from a worker back to the owning process.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum WorkerMessage {
    /// A context operation to service against the shared context.
    Ctx { request: CtxRequest },
    /// Terminal reply for the current task.
    Done {
        result: Option<Value>,
        error: Option<String>,
    },
}

/// Enter the worker loop and exit the process if worker mode is requested;
/// otherwise return immediately.
///
/// Call after task registration, before anything else in `main`.
pub fn init() {
    if worker_requested() {
        run_worker_loop();
        std::process::exit(0);
    }
}

/// Test-harness variant of [`init`]: runs the worker loop when worker mode
/// is requested and returns instead of exiting, so the harness can finish
/// its bookkeeping. A no-op in a normal test run.
pub fn test_entry() {
    if worker_requested() {
        run_worker_loop();
    }
}

fn worker_requested() -> bool {
    std::env::var(WORKER_ENV).map(|v| v == "1").unwrap_or(false)
}

struct WorkerPipes {
    reader: Mutex<BufReader<io::Stdin>>,
    writer: Mutex<io::Stdout>,
}

impl WorkerPipes {
    fn new() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(io::stdin())),
            writer: Mutex::new(io::stdout()),
        }
    }

    /// Next line from the parent; `None` on EOF.
    fn read_line(&self) -> eyre::Result<Option<String>> {
        let mut line = String::new();
        let read = lock(&self.reader)
            .read_line(&mut line)
            .wrap_err("reading from parent pipe")?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }

    fn send<T: Serialize>(&self, message: &T) -> eyre::Result<()> {
        let line = serde_json::to_string(message).wrap_err("encoding protocol message")?;
        let mut writer = lock(&self.writer);
        writeln!(writer, "{line}").wrap_err("writing to parent pipe")?;
        writer.flush().wrap_err("flushing parent pipe")?;
        Ok(())
    }
}

/// Context transport over the worker's stdio pipes. Requests and replies
/// strictly alternate while a task is executing, so no correlation ids are
/// needed.
struct PipeTransport {
    pipes: Arc<WorkerPipes>,
}

impl ContextTransport for PipeTransport {
    fn roundtrip(&self, request: CtxRequest) -> Result<CtxResponse, BoxError> {
        self.pipes.send(&WorkerMessage::Ctx { request })?;
        loop {
            let line = self
                .pipes
                .read_line()?
                .ok_or_else(|| eyre!("parent closed the pipe mid-operation"))?;
            match serde_json::from_str::<ParentMessage>(&line) {
                Ok(ParentMessage::CtxReply { response }) => return Ok(response),
                Ok(other) => {
                    return Err(format!("expected a context reply, got {other:?}").into())
                }
                Err(_) => continue,
            }
        }
    }
}

fn run_worker_loop() {
    let pipes = Arc::new(WorkerPipes::new());
    tracing::debug!(pid = std::process::id(), "worker loop started");
    loop {
        let line = match pipes.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "worker failed to read from parent");
                break;
            }
        };
        let message = match serde_json::from_str::<ParentMessage>(&line) {
            Ok(message) => message,
            Err(_) => continue,
        };
        match message {
            ParentMessage::Run { task, args, kwargs } => {
                let reply = execute(&pipes, &task, args, kwargs);
                if let Err(err) = pipes.send(&reply) {
                    tracing::warn!(error = %err, "worker failed to reply");
                    break;
                }
            }
            ParentMessage::Shutdown => break,
            ParentMessage::CtxReply { .. } => {
                // Stray reply outside any task execution; nothing to pair it
                // with.
                continue;
            }
        }
    }
    tracing::debug!(pid = std::process::id(), "worker loop finished");
}

fn execute(pipes: &Arc<WorkerPipes>, key: &str, args: Vec<Value>, kwargs: Kwargs) -> WorkerMessage {
    let Some(callable) = registry::lookup(key) else {
        return WorkerMessage::Done {
            result: None,
            error: Some(format!("task `{key}` is not registered in the worker")),
        };
    };
    let outcome = match callable {
        RegisteredCallable::Sync(f) => f.call(&args, &kwargs),
        RegisteredCallable::WithContext(f) => {
            let ctx = Context::remote(Arc::new(PipeTransport {
                pipes: pipes.clone(),
            }));
            f.call(&ctx, &args, &kwargs)
        }
    };
    match outcome {
        Ok(value) => WorkerMessage::Done {
            result: Some(value),
            error: None,
        },
        Err(err) => WorkerMessage::Done {
            result: None,
            error: Some(err.to_string()),
        },
    }
}
