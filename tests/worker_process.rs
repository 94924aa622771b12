// tests/worker_process.rs

//! Process isolation against the real `mesh-worker` binary and against
//! stand-in programs that crash, hang or answer on their own.

use mesh_engine::{
    Domain, ElementFamily, EngineConfig, EngineError, IsolationConfig, IsolationMode, MeshEngine, MeshKind,
    MeshRequest,
};
use std::time::{Duration, Instant};

fn process_config(program: &str, args: &[&str], timeout_ms: u64, retries: u32) -> EngineConfig {
    EngineConfig {
        isolation: IsolationConfig {
            mode: IsolationMode::Process,
            timeout_ms,
            retries,
            worker_program: Some(program.into()),
            worker_args: args.iter().map(|a| a.to_string()).collect(),
        },
        ..EngineConfig::default()
    }
}

fn worker_config() -> EngineConfig {
    process_config(env!("CARGO_BIN_EXE_mesh-worker"), &[], 60_000, 0)
}

fn square(n: usize) -> MeshRequest {
    MeshRequest::new(
        Domain::Rectangle { width: 10.0, height: 10.0, nx: n, ny: n },
        MeshKind::Structured,
        ElementFamily::Quadrilateral,
    )
}

#[test]
fn worker_process_meshes_a_square() {
    let mut engine = MeshEngine::new(worker_config()).unwrap();
    let mesh = engine.generate_mesh(&square(10)).unwrap();

    assert_eq!(mesh.node_count(), 121);
    assert_eq!(mesh.element_count(), 100);
    assert!((mesh.measure() - 100.0).abs() < 1e-9);
    assert_eq!(engine.ledger().records().len(), 1);
}

#[test]
fn worker_process_meshes_a_box() {
    let mut engine = MeshEngine::new(worker_config()).unwrap();
    let request = MeshRequest::new(
        Domain::Box { width: 1.0, height: 1.0, depth: 1.0, nx: 2, ny: 2, nz: 2 },
        MeshKind::Structured,
        ElementFamily::Quadrilateral,
    );
    let mesh = engine.generate_mesh(&request).unwrap();
    assert_eq!(mesh.nodes.dim(), (27, 3));
    assert!(mesh.elements().all(|(_, e)| e.iter().all(|&i| i < 27)));
}

#[test]
fn process_and_thread_workers_agree() {
    let mut in_process = MeshEngine::new(worker_config()).unwrap();
    let mut in_thread = MeshEngine::new(EngineConfig::default()).unwrap();
    let request = square(4);
    assert_eq!(
        in_process.generate_mesh(&request).unwrap(),
        in_thread.generate_mesh(&request).unwrap()
    );
}

#[test]
fn kernel_failure_in_worker_is_a_meshing_failure() {
    let mut config = worker_config();
    config.backend = mesh_engine::KernelBackend::GmshCli {
        executable: "/nonexistent/gmsh".into(),
    };
    let mut engine = MeshEngine::new(config).unwrap();
    assert!(matches!(engine.generate_mesh(&square(2)), Err(EngineError::MeshingFailed(_))));
}

#[test]
fn invalid_request_never_reaches_a_worker() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let script = format!("touch {}", marker.display());
    let mut engine = MeshEngine::new(process_config("sh", &["-c", &script], 5_000, 0)).unwrap();

    let request = MeshRequest::new(
        Domain::Rectangle { width: 1.0, height: 1.0, nx: 1, ny: 3 },
        MeshKind::Structured,
        ElementFamily::Quadrilateral,
    );
    assert!(matches!(engine.generate_mesh(&request), Err(EngineError::InvalidDomain(_))));
    assert!(!marker.exists());
}

#[cfg(unix)]
#[test]
fn crashing_worker_is_reported() {
    let mut engine = MeshEngine::new(process_config("sh", &["-c", "echo boom >&2; exit 3"], 5_000, 0)).unwrap();
    match engine.generate_mesh(&square(2)) {
        Err(EngineError::WorkerFailed(message)) => {
            assert!(message.contains('3'));
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(engine.ledger().records().is_empty());
}

#[cfg(unix)]
#[test]
fn hanging_worker_is_killed_at_the_deadline() {
    let mut engine = MeshEngine::new(process_config("sleep", &["5"], 200, 0)).unwrap();
    let started = Instant::now();
    assert!(matches!(engine.generate_mesh(&square(2)), Err(EngineError::WorkerFailed(_))));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[cfg(unix)]
#[test]
fn retries_apply_to_worker_failures() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("attempts");
    let script = format!("echo attempt >> {}; exit 1", log.display());
    let mut engine = MeshEngine::new(process_config("sh", &["-c", &script], 5_000, 2)).unwrap();

    assert!(matches!(engine.generate_mesh(&square(2)), Err(EngineError::WorkerFailed(_))));
    let attempts = std::fs::read_to_string(&log).unwrap();
    assert_eq!(attempts.lines().count(), 3);
}

#[cfg(unix)]
#[test]
fn rejections_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("attempts");
    let script = format!(
        r#"cat > /dev/null; echo attempt >> {}; printf '{{"Rejected":"no kernel"}}'"#,
        log.display()
    );
    let mut engine = MeshEngine::new(process_config("sh", &["-c", &script], 5_000, 2)).unwrap();

    match engine.generate_mesh(&square(2)) {
        Err(EngineError::MeshingFailed(message)) => assert_eq!(message, "no kernel"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
}

#[cfg(unix)]
#[test]
fn malformed_mesh_reply_is_a_worker_failure() {
    let reply = r#"{"Completed":{"nodes":{"v":1,"dim":[3,2],"data":[0.0,0.0,1.0,0.0,0.0,1.0]},"elements":[{"element_type":"Triangle","connectivity":{"v":1,"dim":[1,3],"data":[0,1,7]}}],"boundary_regions":{}}}"#;
    let script = format!("cat > /dev/null; printf '%s' '{}'", reply);
    let mut engine = MeshEngine::new(process_config("sh", &["-c", &script], 5_000, 0)).unwrap();

    match engine.generate_mesh(&square(2)) {
        Err(EngineError::WorkerFailed(message)) => assert!(message.contains("malformed")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(engine.ledger().records().is_empty());
}

#[cfg(unix)]
#[test]
fn kernel_timeouts_are_retried_as_worker_failures() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("attempts");
    let script = format!(
        r#"cat > /dev/null; echo attempt >> {}; printf '{{"TimedOut":"gmsh killed"}}'"#,
        log.display()
    );
    let mut engine = MeshEngine::new(process_config("sh", &["-c", &script], 5_000, 1)).unwrap();

    match engine.generate_mesh(&square(2)) {
        Err(EngineError::WorkerFailed(message)) => assert_eq!(message, "gmsh killed"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);
}
