//! Process-pool stage execution
//!
//! Each branch runs in a pooled worker process (a re-execution of the
//! current binary, see [`super::worker`]). The parent thread that dispatched
//! a branch doubles as that worker's context broker: while waiting for the
//! branch to finish it services every [`CtxRequest`] the worker sends
//! against the shared local context, which is how worker processes keep the
//! same context semantics as in-process branches.
//!
//! Only registry-backed tasks can run here; closures and nested workflows
//! cannot cross a process boundary.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::context::Context;
use crate::error::EngineError;
use crate::node::Node;
use crate::registry;
use crate::task::TaskState;
use crate::util::lock;

use super::worker::{ParentMessage, WorkerMessage, WORKER_ENV};
use super::{apply_outcome, BranchJob, StageOutcome};

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Re-execute the current binary with no extra arguments (the normal
    /// case for embedding binaries that call `worker::init()`).
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: Vec::new(),
        })
    }

    /// Re-execute the current test binary so that only the named shim test
    /// runs and the harness does not capture the protocol stream.
    pub fn test_shim(shim_test: &str) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![
                shim_test.to_string(),
                "--exact".to_string(),
                "--nocapture".to_string(),
                // Quiet format prints a single progress char *after* the test
                // finishes, so libtest's per-test banner ("test NAME ... ")
                // never shares a line with the worker's first protocol
                // message. Without this the banner prefixes the first `Done`
                // line, the parent fails to parse it, and both sides deadlock.
                "-q".to_string(),
                "--test-threads=1".to_string(),
            ],
        })
    }
}

struct PoolWorker {
    child: Child,
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl PoolWorker {
    fn send(&mut self, message: &ParentMessage) -> Result<(), EngineError> {
        let line = serde_json::to_string(message)
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Next protocol message from the worker; skips lines that do not parse
    /// (a test harness may share the worker's stdout).
    fn read_message(&mut self) -> Result<WorkerMessage, EngineError> {
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                return Err(EngineError::Worker(
                    "worker process closed its pipe unexpectedly".to_string(),
                ));
            }
            if let Ok(message) = serde_json::from_str::<WorkerMessage>(&line) {
                return Ok(message);
            }
        }
    }
}

/// Pooled worker-process executor.
#[derive(TypedBuilder)]
pub struct ProcessPool {
    #[builder(default = 4)]
    size: usize,
    /// Override how workers are spawned; defaults to re-executing the
    /// current binary.
    #[builder(default, setter(strip_option))]
    worker_command: Option<WorkerCommand>,
    #[builder(default, setter(skip))]
    idle: Mutex<Vec<PoolWorker>>,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("size", &self.size)
            .field("worker_command", &self.worker_command)
            .finish()
    }
}

impl ProcessPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            worker_command: None,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn spawn_worker(&self) -> Result<PoolWorker, EngineError> {
        let command = match &self.worker_command {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe()?,
        };
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Worker("worker stdin unavailable".to_string()))?;
        let reader = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| EngineError::Worker("worker stdout unavailable".to_string()))?;
        tracing::debug!(pid = child.id(), "spawned worker process");
        Ok(PoolWorker {
            child,
            writer,
            reader,
        })
    }

    fn checkout(&self) -> Result<PoolWorker, EngineError> {
        if let Some(worker) = lock(&self.idle).pop() {
            return Ok(worker);
        }
        self.spawn_worker()
    }

    fn checkin(&self, worker: PoolWorker) {
        lock(&self.idle).push(worker);
    }

    /// Run the branch on `worker`, serving its context requests until it
    /// reports completion.
    fn service(
        &self,
        worker: &mut PoolWorker,
        ctx: &Context,
        run: &ParentMessage,
    ) -> Result<Result<Value, String>, EngineError> {
        worker.send(run)?;
        loop {
            match worker.read_message()? {
                WorkerMessage::Ctx { request } => {
                    let response = ctx.apply(request);
                    worker.send(&ParentMessage::CtxReply { response })?;
                }
                WorkerMessage::Done { result, error } => {
                    return Ok(match error {
                        Some(error) => Err(error),
                        None => Ok(result.unwrap_or(Value::Null)),
                    });
                }
            }
        }
    }

    pub(crate) fn run_stage(
        &self,
        ctx: &Context,
        jobs: Vec<BranchJob>,
    ) -> Result<StageOutcome, EngineError> {
        // Structural validation up front: every branch must be shippable.
        let mut runs = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let Node::Task(task) = &job.node else {
                return Err(EngineError::ProcessPoolBranch(job.node.name()));
            };
            let Some(key) = task.registered_key() else {
                return Err(EngineError::ProcessPoolBranch(task.name()));
            };
            if registry::lookup(&key).is_none() {
                return Err(EngineError::UnregisteredTask(key));
            }
            // Binding semantics are applied here in the parent, so the wire
            // carries final call arguments.
            let (args, kwargs) = task.effective_call(&job.input, &job.kwargs);
            runs.push(ParentMessage::Run { task: key, args, kwargs });
        }

        for job in &jobs {
            job.node.set_state(TaskState::Running);
        }

        let slots: Vec<Mutex<Option<Result<Value, String>>>> =
            jobs.iter().map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);
        let infra: Mutex<Option<EngineError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..self.size.min(jobs.len()) {
                scope.spawn(|| {
                    let mut worker = match self.checkout() {
                        Ok(worker) => worker,
                        Err(err) => {
                            lock(&infra).get_or_insert(err);
                            return;
                        }
                    };
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= jobs.len() {
                            break;
                        }
                        match self.service(&mut worker, ctx, &runs[index]) {
                            Ok(outcome) => *lock(&slots[index]) = Some(outcome),
                            Err(err) => {
                                // The worker is no longer trustworthy; drop
                                // it and surface the infrastructure error.
                                let _ = worker.child.kill();
                                let _ = worker.child.wait();
                                lock(&infra).get_or_insert(err);
                                return;
                            }
                        }
                    }
                    self.checkin(worker);
                });
            }
        });

        if let Some(err) = lock(&infra).take() {
            return Err(err);
        }

        let mut stage = StageOutcome::default();
        for (job, slot) in jobs.iter().zip(slots) {
            let outcome = slot
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .unwrap_or_else(|| Err("branch produced no outcome".to_string()));
            apply_outcome(&job.node, outcome, &mut stage);
        }
        Ok(stage)
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        for mut worker in lock(&self.idle).drain(..) {
            let _ = worker.send(&ParentMessage::Shutdown);
            drop(worker.writer);
            if let Err(err) = worker.child.wait() {
                tracing::warn!(error = %err, "failed to reap worker process");
            }
        }
    }
}
