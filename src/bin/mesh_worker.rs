// src/bin/mesh_worker.rs

//! Process-isolated mesh worker.
//!
//! Reads one `WorkerTask` as JSON from stdin, meshes it with a fresh kernel and
//! writes the `WorkerReply` as JSON to stdout. Logs go to stderr.

use mesh_engine::isolation::{run_task, WorkerTask};
use std::io::{self, Read, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        log::error!("could not read task from stdin: {}", e);
        return ExitCode::from(2);
    }
    let task: WorkerTask = match serde_json::from_str(&input) {
        Ok(task) => task,
        Err(e) => {
            log::error!("malformed task: {}", e);
            return ExitCode::from(2);
        }
    };

    log::info!("meshing {} with the {} kernel", task.request.model_name(), task.backend.name());
    let reply = run_task(&task);

    let mut stdout = io::stdout().lock();
    match serde_json::to_writer(&mut stdout, &reply).map_err(io::Error::from).and_then(|_| stdout.flush()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("could not write reply: {}", e);
            ExitCode::FAILURE
        }
    }
}
