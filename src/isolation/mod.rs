// src/isolation/mod.rs

//! Runs each mesh request in its own worker unit.
//!
//! A kernel keeps one mutable "current model" per session, so every request gets
//! a fresh kernel value in a fresh worker: a named thread, or a `mesh-worker`
//! process fed a [`WorkerTask`] on stdin and answering a [`WorkerReply`] on stdout.
//! Crashes, panics and timeouts surface as [`EngineError::WorkerFailed`].

use crate::config::{EngineConfig, IsolationConfig, IsolationMode, KernelBackend};
use crate::kernel::KernelError;
use crate::{meshing, EngineError, Mesh, MeshRequest};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL: usize = 2048;
const WORKER_BINARY: &str = "mesh-worker";

/// Input of one worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub backend: KernelBackend,
    pub request: MeshRequest,
    /// Limit for external programs the kernel runs [ms]
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
}

/// What a healthy worker sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    Completed(Mesh),
    /// The request reached the kernel and failed there.
    Rejected(String),
    /// An external program run by the kernel exceeded its time limit and was killed.
    TimedOut(String),
}

/// Meshes a task with a fresh kernel. Used by both isolation modes.
pub fn run_task(task: &WorkerTask) -> WorkerReply {
    let mut kernel = task.backend.instantiate(task.time_limit_ms.map(Duration::from_millis));
    match meshing::generate_mesh(&mut kernel, &task.request) {
        Ok(mesh) => WorkerReply::Completed(mesh),
        Err(EngineError::Kernel(e @ KernelError::TimedOut(_))) => {
            log::warn!("{} kernel: {}", task.backend.name(), e);
            WorkerReply::TimedOut(e.to_string())
        }
        Err(e) => {
            log::warn!("{} kernel rejected the request: {}", task.backend.name(), e);
            WorkerReply::Rejected(e.to_string())
        }
    }
}

/// Time granted to programs a kernel runs: a tenth less than the worker's own limit,
/// so they are killed before their worker is.
fn kernel_time_limit_ms(worker_timeout_ms: u64) -> u64 {
    (worker_timeout_ms - worker_timeout_ms / 10).max(1)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `job` on a named thread and waits at most `timeout` for its result.
///
/// A panic or a thread that vanishes without a result becomes `WorkerFailed`.
/// On timeout the thread is detached and left to finish on its own; external
/// programs its kernel started are bounded by the task's own time limit.
pub fn run_isolated<T, F>(name: &str, timeout: Duration, job: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(outcome);
        })
        .map_err(|e| EngineError::WorkerFailed(format!("could not spawn worker thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => {
            let _ = handle.join();
            Ok(value)
        }
        Ok(Err(payload)) => {
            let _ = handle.join();
            Err(EngineError::WorkerFailed(format!("worker panicked: {}", panic_message(payload.as_ref()))))
        }
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("worker thread '{}' detached after {:?}", name, timeout);
            Err(EngineError::WorkerFailed(format!("worker timed out after {:?}", timeout)))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(EngineError::WorkerFailed("worker exited without a result".to_string()))
        }
    }
}

fn stderr_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end();
    let start = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| trimmed.len() - i <= STDERR_TAIL)
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

fn read_to_end<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Hands requests to isolated workers and maps their outcome to engine results.
pub struct Supervisor {
    backend: KernelBackend,
    isolation: IsolationConfig,
}

impl Supervisor {
    pub fn new(config: &EngineConfig) -> Self {
        Supervisor {
            backend: config.backend.clone(),
            isolation: config.isolation.clone(),
        }
    }

    /// Validates `request`, then runs it in a worker, retrying only after worker failures.
    pub fn run(&self, request: &MeshRequest) -> Result<Mesh, EngineError> {
        request.validate()?;
        let task = WorkerTask {
            backend: self.backend.clone(),
            request: request.clone(),
            time_limit_ms: Some(kernel_time_limit_ms(self.isolation.timeout_ms)),
        };

        let attempts = self.isolation.retries + 1;
        let mut last_failure = String::new();
        for attempt in 1..=attempts {
            let outcome = match self.isolation.mode {
                IsolationMode::Thread => self.run_in_thread(&task),
                IsolationMode::Process => self.run_in_process(&task),
            };
            let failure = match outcome {
                Ok(WorkerReply::Completed(mesh)) => match mesh.validate() {
                    Ok(()) => return Ok(mesh),
                    Err(e) => format!("worker returned a malformed mesh: {}", e),
                },
                Ok(WorkerReply::Rejected(message)) => return Err(EngineError::MeshingFailed(message)),
                Ok(WorkerReply::TimedOut(message)) | Err(EngineError::WorkerFailed(message)) => message,
                Err(e) => return Err(e),
            };
            log::warn!("worker attempt {}/{} failed: {}", attempt, attempts, failure);
            last_failure = failure;
        }
        Err(EngineError::WorkerFailed(last_failure))
    }

    fn run_in_thread(&self, task: &WorkerTask) -> Result<WorkerReply, EngineError> {
        let task = task.clone();
        run_isolated("mesh-worker", self.isolation.timeout(), move || run_task(&task))
    }

    fn worker_program(&self) -> Result<PathBuf, EngineError> {
        if let Some(program) = &self.isolation.worker_program {
            return Ok(program.clone());
        }
        let exe = std::env::current_exe().map_err(|e| EngineError::Config(format!("cannot locate current executable: {}", e)))?;
        let file_name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
        // Test binaries live one level below the worker, in `deps/`.
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| EngineError::Config(format!("no {} found next to {}", file_name, exe.display())))
    }

    fn run_in_process(&self, task: &WorkerTask) -> Result<WorkerReply, EngineError> {
        let program = self.worker_program()?;
        let payload = serde_json::to_vec(task).map_err(|e| EngineError::WorkerFailed(e.to_string()))?;

        let mut command = Command::new(&program);
        command
            .args(&self.isolation.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("spawning worker: {:?}", command);
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::WorkerFailed(format!("could not start {}: {}", program.display(), e)))?;

        let stdout = read_to_end(child.stdout.take());
        let stderr = read_to_end(child.stderr.take());
        // Written off the deadline loop: a worker that never reads its task must not stall it.
        let stdin = child.stdin.take();
        thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload) {
                    log::warn!("could not send task to worker: {}", e);
                }
            }
        });

        let deadline = Instant::now() + self.isolation.timeout();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::WorkerFailed(format!(
                        "worker timed out after {:?} and was killed",
                        self.isolation.timeout()
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    return Err(EngineError::WorkerFailed(format!("could not wait for worker: {}", e)));
                }
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        match serde_json::from_slice::<WorkerReply>(&stdout) {
            Ok(reply) => Ok(reply),
            Err(e) => Err(EngineError::WorkerFailed(format!(
                "worker exited with {} without a valid reply ({}); stderr: {}",
                status,
                e,
                stderr_tail(&stderr)
            ))),
        }
    }
}
