// demos/structured_rectangle.rs

use mesh_engine::{Domain, ElementFamily, EngineConfig, MeshEngine, MeshKind, MeshRequest};

/// Meshes a 10 x 10 square into 100 quadrangles using the configuration from
/// `MESH_ENGINE_CONFIG` (or the defaults) and prints a summary.
fn main() {
    env_logger::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return;
        }
    };
    let mut engine = match MeshEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error creating engine: {}", e);
            return;
        }
    };

    let request = MeshRequest::new(
        Domain::Rectangle { width: 10.0, height: 10.0, nx: 10, ny: 10 },
        MeshKind::Structured,
        ElementFamily::Quadrilateral,
    );

    match engine.generate_mesh(&request) {
        Ok(mesh) => {
            println!("Successfully generated mesh!");
            println!("  - Number of nodes: {}", mesh.node_count());
            println!("  - Number of elements: {}", mesh.element_count());
            println!("  - Covered area: {:.6}", mesh.measure());
            for (name, nodes) in &mesh.boundary_regions {
                println!("  - Boundary '{}': {} nodes", name, nodes.len());
            }
            if let Some(record) = engine.ledger().records().last() {
                println!("  - Fingerprint: {}", record.mesh_fingerprint);
            }
        }
        Err(e) => {
            println!("Error generating mesh: {}", e);
        }
    }
}
