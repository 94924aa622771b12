pub mod config;
pub mod isolation;
pub mod kernel;
pub mod meshing;
pub mod provenance;

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use config::{EngineConfig, IsolationConfig, IsolationMode, KernelBackend};
pub use kernel::{Arrangement, ElementType, GeometryKernel, Grading, KernelError};

// --- Errors ---

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("invalid combination: {0}")]
    InvalidCombination(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("meshing failed: {0}")]
    MeshingFailed(String),
    #[error("mesh extraction failed: {0}")]
    Extraction(String),
    #[error("worker failed: {0}")]
    WorkerFailed(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("provenance failed: {0}")]
    ProvenanceFailed(String),
}

// --- Request Model ---

/// Largest subdivision count accepted along one axis.
pub const MAX_SUBDIVISIONS: usize = 1000;

/// Largest number of lattice nodes `(nx+1)(ny+1)(nz+1)` a request may ask for.
pub const MAX_LATTICE_NODES: usize = 4_000_000;

/// The meshed region. Rectangles span `[0, width] x [0, height]`, boxes add `[0, depth]` along z.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Domain {
    Rectangle {
        width: f64,
        height: f64,
        nx: usize,
        ny: usize,
    },
    Box {
        width: f64,
        height: f64,
        depth: f64,
        nx: usize,
        ny: usize,
        nz: usize,
    },
}

impl Domain {
    pub fn dim(&self) -> usize {
        match self {
            Domain::Rectangle { .. } => 2,
            Domain::Box { .. } => 3,
        }
    }

    /// Subdivision counts along x, y and z. Rectangles report 0 along z.
    pub fn subdivisions(&self) -> [usize; 3] {
        match *self {
            Domain::Rectangle { nx, ny, .. } => [nx, ny, 0],
            Domain::Box { nx, ny, nz, .. } => [nx, ny, nz],
        }
    }

    pub fn extents(&self) -> [f64; 3] {
        match *self {
            Domain::Rectangle { width, height, .. } => [width, height, 0.0],
            Domain::Box { width, height, depth, .. } => [width, height, depth],
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let names = ["width", "height", "depth"];
        let counts = ["nx", "ny", "nz"];
        for axis in 0..self.dim() {
            let extent = self.extents()[axis];
            if !(extent.is_finite() && extent > 0.0) {
                return Err(EngineError::InvalidDomain(format!(
                    "{} must be a positive number, got {}",
                    names[axis], extent
                )));
            }
            let n = self.subdivisions()[axis];
            if n < 2 {
                return Err(EngineError::InvalidDomain(format!("{} must be at least 2, got {}", counts[axis], n)));
            }
            if n > MAX_SUBDIVISIONS {
                return Err(EngineError::InvalidDomain(format!(
                    "{} must be at most {}, got {}",
                    counts[axis], MAX_SUBDIVISIONS, n
                )));
            }
        }
        let lattice_nodes: usize = self.subdivisions()[..self.dim()].iter().map(|n| n + 1).product();
        if lattice_nodes > MAX_LATTICE_NODES {
            return Err(EngineError::InvalidDomain(format!(
                "{} lattice nodes requested, the limit is {}",
                lattice_nodes, MAX_LATTICE_NODES
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshKind {
    Structured,
    Unstructured,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementFamily {
    Triangle,
    Quadrilateral,
    Tetrahedron,
}

/// Everything a worker needs to build, constrain, mesh and extract one domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshRequest {
    pub domain: Domain,
    pub kind: MeshKind,
    pub family: ElementFamily,
    /// Diagonal direction of structured 2D triangles.
    #[serde(default)]
    pub arrangement: Arrangement,
    #[serde(default)]
    pub grading: Grading,
}

impl MeshRequest {
    pub fn new(domain: Domain, kind: MeshKind, family: ElementFamily) -> Self {
        MeshRequest {
            domain,
            kind,
            family,
            arrangement: Arrangement::default(),
            grading: Grading::default(),
        }
    }

    pub fn with_arrangement(mut self, arrangement: Arrangement) -> Self {
        self.arrangement = arrangement;
        self
    }

    pub fn with_grading(mut self, grading: Grading) -> Self {
        self.grading = grading;
        self
    }

    /// Rejects degenerate domains and unsupported kind/family pairs.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.domain.validate()?;
        if let Grading::Progression(r) = self.grading {
            if !(r.is_finite() && r > 0.0) {
                return Err(EngineError::InvalidDomain(format!(
                    "progression ratio must be a positive number, got {}",
                    r
                )));
            }
        }
        if self.family == ElementFamily::Tetrahedron {
            if self.kind == MeshKind::Structured {
                return Err(EngineError::InvalidCombination(
                    "structured meshes cannot be made of tetrahedra".to_string(),
                ));
            }
            if self.domain.dim() == 2 {
                return Err(EngineError::InvalidCombination(
                    "tetrahedra need a three-dimensional domain".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Name of the kernel model built for this request.
    pub fn model_name(&self) -> &'static str {
        match self.domain {
            Domain::Rectangle { .. } => "rectangle",
            Domain::Box { .. } => "box",
        }
    }
}

// --- Mesh Output ---

/// Elements of a single type. Each row of `connectivity` holds 0-based node indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementBlock {
    pub element_type: ElementType,
    pub connectivity: Array2<usize>,
}

impl ElementBlock {
    pub fn len(&self) -> usize {
        self.connectivity.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.connectivity.nrows() == 0
    }
}

/// A meshed domain: an `(N, d)` node table, element blocks referencing it, and the
/// node indices lying on each named side of the domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub nodes: Array2<f64>,
    pub elements: Vec<ElementBlock>,
    pub boundary_regions: BTreeMap<String, Vec<usize>>,
}

impl Mesh {
    pub fn dim(&self) -> usize {
        self.nodes.ncols()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.nrows()
    }

    pub fn element_count(&self) -> usize {
        self.elements.iter().map(ElementBlock::len).sum()
    }

    /// Iterates over every element with its type, block by block.
    pub fn elements(&self) -> impl Iterator<Item = (ElementType, ArrayView1<'_, usize>)> + '_ {
        self.elements
            .iter()
            .flat_map(|b| b.connectivity.rows().into_iter().map(move |row| (b.element_type, row)))
    }

    /// Per-axis `(min, max)` of the node coordinates, `None` for an empty mesh.
    pub fn bounding_box(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        if self.nodes.nrows() == 0 {
            return None;
        }
        let mut lo = vec![f64::INFINITY; self.dim()];
        let mut hi = vec![f64::NEG_INFINITY; self.dim()];
        for row in self.nodes.rows() {
            for (k, &v) in row.iter().enumerate() {
                lo[k] = lo[k].min(v);
                hi[k] = hi[k].max(v);
            }
        }
        Some((lo, hi))
    }

    fn point(&self, index: usize) -> Vector3<f64> {
        let row = self.nodes.row(index);
        Vector3::new(row[0], row[1], if row.len() > 2 { row[2] } else { 0.0 })
    }

    fn triangle_area(&self, a: usize, b: usize, c: usize) -> f64 {
        let (pa, pb, pc) = (self.point(a), self.point(b), self.point(c));
        0.5 * (pb - pa).cross(&(pc - pa)).norm()
    }

    fn tetrahedron_volume(&self, a: usize, b: usize, c: usize, d: usize) -> f64 {
        let pa = self.point(a);
        Matrix3::from_columns(&[self.point(b) - pa, self.point(c) - pa, self.point(d) - pa])
            .determinant()
            .abs()
            / 6.0
    }

    /// Sum of element measures: areas of surface elements plus volumes of solid elements.
    /// Points and lines contribute nothing.
    pub fn measure(&self) -> f64 {
        self.elements()
            .map(|(element_type, e)| match element_type {
                ElementType::Triangle => self.triangle_area(e[0], e[1], e[2]),
                ElementType::Quadrangle => self.triangle_area(e[0], e[1], e[2]) + self.triangle_area(e[0], e[2], e[3]),
                ElementType::Tetrahedron => self.tetrahedron_volume(e[0], e[1], e[2], e[3]),
                ElementType::Pyramid => {
                    self.tetrahedron_volume(e[0], e[1], e[2], e[4]) + self.tetrahedron_volume(e[0], e[2], e[3], e[4])
                }
                ElementType::Prism => {
                    self.tetrahedron_volume(e[0], e[1], e[2], e[3])
                        + self.tetrahedron_volume(e[1], e[2], e[3], e[4])
                        + self.tetrahedron_volume(e[2], e[3], e[4], e[5])
                }
                ElementType::Hexahedron => {
                    self.tetrahedron_volume(e[0], e[1], e[3], e[4])
                        + self.tetrahedron_volume(e[1], e[2], e[3], e[6])
                        + self.tetrahedron_volume(e[1], e[4], e[5], e[6])
                        + self.tetrahedron_volume(e[3], e[4], e[6], e[7])
                        + self.tetrahedron_volume(e[1], e[3], e[4], e[6])
                }
                ElementType::Point | ElementType::Line => 0.0,
            })
            .sum()
    }

    /// Checks the shape invariants the accessors rely on: a 2- or 3-column node table,
    /// element rows of their type's arity, and node indices that exist.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(2..=3).contains(&self.dim()) {
            return Err(EngineError::Extraction(format!("node table has {} columns", self.dim())));
        }
        let n = self.node_count();
        for block in &self.elements {
            if block.connectivity.ncols() != block.element_type.arity() {
                return Err(EngineError::Extraction(format!(
                    "{:?} block has rows of {} nodes",
                    block.element_type,
                    block.connectivity.ncols()
                )));
            }
            if let Some(&i) = block.connectivity.iter().find(|&&i| i >= n) {
                return Err(EngineError::Extraction(format!(
                    "{:?} element references node {} of {}",
                    block.element_type, i, n
                )));
            }
        }
        for (name, region) in &self.boundary_regions {
            if let Some(&i) = region.iter().find(|&&i| i >= n) {
                return Err(EngineError::Extraction(format!("boundary '{}' references node {} of {}", name, i, n)));
            }
        }
        Ok(())
    }
}

// --- Engine Facade ---

/// Validates requests, meshes them in isolated workers and keeps a ledger of the runs.
pub struct MeshEngine {
    config: EngineConfig,
    supervisor: isolation::Supervisor,
    ledger: provenance::RunLedger,
}

impl MeshEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(MeshEngine {
            supervisor: isolation::Supervisor::new(&config),
            config,
            ledger: provenance::RunLedger::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &provenance::RunLedger {
        &self.ledger
    }

    /// Hands over the recorded runs and starts a new chain.
    ///
    /// The ledger keeps one record per mesh; a long-lived engine should drain it
    /// periodically and persist the records elsewhere.
    pub fn drain_ledger(&mut self) -> Vec<provenance::RunRecord> {
        self.ledger.drain_records()
    }

    /// The main entry point: validate, mesh in a worker, record the run.
    pub fn generate_mesh(&mut self, request: &MeshRequest) -> Result<Mesh, EngineError> {
        request.validate()?;
        log::info!(
            "meshing {} ({:?}, {:?}) with the {} kernel",
            request.model_name(),
            request.kind,
            request.family,
            self.config.backend.name()
        );

        let mesh = self.supervisor.run(request)?;
        log::info!("mesh ready: {} nodes, {} elements", mesh.node_count(), mesh.element_count());

        self.ledger.record(request, &mesh, self.config.backend.name())?;
        Ok(mesh)
    }
}
