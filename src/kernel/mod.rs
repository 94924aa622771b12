// src/kernel/mod.rs

//! The geometry/meshing kernel seam.
//!
//! A kernel owns one "current model" per session: entities are created with
//! the `add_*` calls, constrained with the `set_transfinite_*` calls, meshed
//! with [`GeometryKernel::generate`] and read back with
//! [`GeometryKernel::get_nodes`] / [`GeometryKernel::get_elements`].
//! All tags handed out by a kernel are 1-based, as in Gmsh.

pub mod builtin;
pub mod gmsh_cli;
pub mod topology;

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

pub use builtin::BuiltinKernel;
pub use gmsh_cli::GmshCliKernel;
pub use topology::Topology;

/// Kernel-assigned entity tag. Negative values reverse a curve inside a curve loop.
pub type Tag = i32;

/// Errors raised by a kernel implementation.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("kernel session is not initialized")]
    SessionNotInitialized,
    #[error("kernel session is already active")]
    SessionAlreadyActive,
    #[error("unknown entity of dimension {dim} with tag {tag}")]
    UnknownEntity { dim: i32, tag: Tag },
    #[error("curve loop {0} is not closed")]
    OpenCurveLoop(Tag),
    #[error("unsupported by this kernel: {0}")]
    Unsupported(String),
    #[error("invalid mesh constraint: {0}")]
    InvalidConstraint(String),
    #[error("gmsh failed: {0}")]
    GmshFailed(String),
    #[error("kernel did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("could not parse kernel output: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Identifies an entity by topological dimension and tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub dim: i32,
    pub tag: Tag,
}

impl EntityId {
    pub fn new(dim: i32, tag: Tag) -> Self {
        EntityId { dim, tag }
    }
}

/// How a transfinite quadrangular surface is split into triangles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arrangement {
    #[default]
    Left,
    Right,
    AlternateLeft,
    AlternateRight,
}

impl Arrangement {
    /// Keyword used in `.geo` scripts.
    pub fn geo_keyword(self) -> &'static str {
        match self {
            Arrangement::Left => "Left",
            Arrangement::Right => "Right",
            Arrangement::AlternateLeft => "AlternateLeft",
            Arrangement::AlternateRight => "AlternateRight",
        }
    }
}

/// Node distribution along a transfinite curve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Grading {
    #[default]
    Uniform,
    /// Each segment is `ratio` times the previous one, walking from the curve's start.
    Progression(f64),
}

impl Grading {
    pub fn ratio(self) -> f64 {
        match self {
            Grading::Uniform => 1.0,
            Grading::Progression(r) => r,
        }
    }

    /// The same grading seen from the other end of the curve.
    pub fn reversed(self) -> Self {
        match self {
            Grading::Uniform => Grading::Uniform,
            Grading::Progression(r) => Grading::Progression(1.0 / r),
        }
    }

    /// Normalized node parameters in `[0, 1]` for a curve with `nodes` nodes.
    pub fn parameters(self, nodes: usize) -> Vec<f64> {
        let segments = nodes.saturating_sub(1);
        if segments == 0 {
            return vec![0.0];
        }
        let r = self.ratio();
        let mut lengths = Vec::with_capacity(segments);
        let mut h = 1.0;
        for _ in 0..segments {
            lengths.push(h);
            h *= r;
        }
        let total: f64 = lengths.iter().sum();
        let mut params = Vec::with_capacity(nodes);
        let mut acc = 0.0;
        params.push(0.0);
        for l in &lengths[..segments - 1] {
            acc += l;
            params.push(acc / total);
        }
        params.push(1.0);
        params
    }
}

/// First-order element types the kernels can emit (Gmsh numbering).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Point,
    Line,
    Triangle,
    Quadrangle,
    Tetrahedron,
    Hexahedron,
    Prism,
    Pyramid,
}

impl ElementType {
    /// Number of nodes per element.
    pub fn arity(self) -> usize {
        match self {
            ElementType::Point => 1,
            ElementType::Line => 2,
            ElementType::Triangle => 3,
            ElementType::Quadrangle => 4,
            ElementType::Tetrahedron => 4,
            ElementType::Hexahedron => 8,
            ElementType::Prism => 6,
            ElementType::Pyramid => 5,
        }
    }

    /// Topological dimension of the element.
    pub fn dim(self) -> i32 {
        match self {
            ElementType::Point => 0,
            ElementType::Line => 1,
            ElementType::Triangle | ElementType::Quadrangle => 2,
            ElementType::Tetrahedron
            | ElementType::Hexahedron
            | ElementType::Prism
            | ElementType::Pyramid => 3,
        }
    }

    pub fn from_gmsh_code(code: i32) -> Option<Self> {
        match code {
            15 => Some(ElementType::Point),
            1 => Some(ElementType::Line),
            2 => Some(ElementType::Triangle),
            3 => Some(ElementType::Quadrangle),
            4 => Some(ElementType::Tetrahedron),
            5 => Some(ElementType::Hexahedron),
            6 => Some(ElementType::Prism),
            7 => Some(ElementType::Pyramid),
            _ => None,
        }
    }
}

/// Nodes as emitted by a kernel: tags, flat `(x, y, z)` triples and the entity
/// each node is classified on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawNodes {
    pub tags: Vec<usize>,
    pub coords: Vec<f64>,
    pub entities: Vec<EntityId>,
}

impl RawNodes {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Elements of one type as emitted by a kernel. `node_tags` is flat, `arity`
/// entries per element, referencing kernel node tags.
#[derive(Clone, Debug, PartialEq)]
pub struct RawElementBlock {
    pub element_type: ElementType,
    pub element_tags: Vec<usize>,
    pub node_tags: Vec<usize>,
}

/// The stateful geometry and meshing service.
///
/// Implementations keep one model per session. Every operation other than
/// [`initialize`](GeometryKernel::initialize) fails with
/// [`KernelError::SessionNotInitialized`] while no session is active.
pub trait GeometryKernel {
    /// Returns the name of the kernel, used in logs.
    fn name(&self) -> &'static str;

    fn is_active(&self) -> bool;

    /// Starts a session with an empty model.
    fn initialize(&mut self, model: &str) -> Result<(), KernelError>;

    /// Ends the session and discards the model.
    fn finalize(&mut self) -> Result<(), KernelError>;

    fn add_point(&mut self, x: f64, y: f64, z: f64) -> Result<Tag, KernelError>;

    fn add_line(&mut self, start: Tag, end: Tag) -> Result<Tag, KernelError>;

    /// Adds a closed loop of signed curve tags.
    fn add_curve_loop(&mut self, curves: &[Tag]) -> Result<Tag, KernelError>;

    fn add_plane_surface(&mut self, curve_loop: Tag) -> Result<Tag, KernelError>;

    fn add_surface_loop(&mut self, surfaces: &[Tag]) -> Result<Tag, KernelError>;

    fn add_volume(&mut self, surface_loop: Tag) -> Result<Tag, KernelError>;

    /// Forces `nodes` nodes (endpoints included) along a curve.
    fn set_transfinite_curve(&mut self, curve: Tag, nodes: usize, grading: Grading) -> Result<(), KernelError>;

    fn set_transfinite_surface(&mut self, surface: Tag, arrangement: Arrangement) -> Result<(), KernelError>;

    fn set_transfinite_volume(&mut self, volume: Tag) -> Result<(), KernelError>;

    /// Meshes every entity up to and including `dim`.
    fn generate(&mut self, dim: i32) -> Result<(), KernelError>;

    /// Recombines the generated triangles into quadrangles where possible.
    fn recombine(&mut self) -> Result<(), KernelError>;

    /// All mesh nodes of the model, in kernel order.
    fn get_nodes(&mut self) -> Result<RawNodes, KernelError>;

    /// All elements of the given dimension, one block per element type.
    fn get_elements(&mut self, dim: i32) -> Result<Vec<RawElementBlock>, KernelError>;

    /// Tags of the nodes classified on an entity, optionally including its boundary.
    fn get_entity_nodes(&mut self, entity: EntityId, include_boundary: bool) -> Result<Vec<usize>, KernelError>;
}

impl<K: GeometryKernel + ?Sized> GeometryKernel for Box<K> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn is_active(&self) -> bool {
        (**self).is_active()
    }
    fn initialize(&mut self, model: &str) -> Result<(), KernelError> {
        (**self).initialize(model)
    }
    fn finalize(&mut self) -> Result<(), KernelError> {
        (**self).finalize()
    }
    fn add_point(&mut self, x: f64, y: f64, z: f64) -> Result<Tag, KernelError> {
        (**self).add_point(x, y, z)
    }
    fn add_line(&mut self, start: Tag, end: Tag) -> Result<Tag, KernelError> {
        (**self).add_line(start, end)
    }
    fn add_curve_loop(&mut self, curves: &[Tag]) -> Result<Tag, KernelError> {
        (**self).add_curve_loop(curves)
    }
    fn add_plane_surface(&mut self, curve_loop: Tag) -> Result<Tag, KernelError> {
        (**self).add_plane_surface(curve_loop)
    }
    fn add_surface_loop(&mut self, surfaces: &[Tag]) -> Result<Tag, KernelError> {
        (**self).add_surface_loop(surfaces)
    }
    fn add_volume(&mut self, surface_loop: Tag) -> Result<Tag, KernelError> {
        (**self).add_volume(surface_loop)
    }
    fn set_transfinite_curve(&mut self, curve: Tag, nodes: usize, grading: Grading) -> Result<(), KernelError> {
        (**self).set_transfinite_curve(curve, nodes, grading)
    }
    fn set_transfinite_surface(&mut self, surface: Tag, arrangement: Arrangement) -> Result<(), KernelError> {
        (**self).set_transfinite_surface(surface, arrangement)
    }
    fn set_transfinite_volume(&mut self, volume: Tag) -> Result<(), KernelError> {
        (**self).set_transfinite_volume(volume)
    }
    fn generate(&mut self, dim: i32) -> Result<(), KernelError> {
        (**self).generate(dim)
    }
    fn recombine(&mut self) -> Result<(), KernelError> {
        (**self).recombine()
    }
    fn get_nodes(&mut self) -> Result<RawNodes, KernelError> {
        (**self).get_nodes()
    }
    fn get_elements(&mut self, dim: i32) -> Result<Vec<RawElementBlock>, KernelError> {
        (**self).get_elements(dim)
    }
    fn get_entity_nodes(&mut self, entity: EntityId, include_boundary: bool) -> Result<Vec<usize>, KernelError> {
        (**self).get_entity_nodes(entity, include_boundary)
    }
}

/// A kernel session scoped to a value: initialized on [`open`](KernelSession::open),
/// finalized by [`close`](KernelSession::close) or on drop.
pub struct KernelSession<'k, K: GeometryKernel + ?Sized> {
    kernel: &'k mut K,
    closed: bool,
}

impl<'k, K: GeometryKernel + ?Sized> KernelSession<'k, K> {
    pub fn open(kernel: &'k mut K, model: &str) -> Result<Self, KernelError> {
        kernel.initialize(model)?;
        log::debug!("{} session opened for model '{}'", kernel.name(), model);
        Ok(KernelSession { kernel, closed: false })
    }

    /// Finalizes the session, reporting any error the kernel raises while doing so.
    pub fn close(mut self) -> Result<(), KernelError> {
        self.closed = true;
        self.kernel.finalize()
    }
}

impl<K: GeometryKernel + ?Sized> Deref for KernelSession<'_, K> {
    type Target = K;

    fn deref(&self) -> &K {
        self.kernel
    }
}

impl<K: GeometryKernel + ?Sized> DerefMut for KernelSession<'_, K> {
    fn deref_mut(&mut self) -> &mut K {
        self.kernel
    }
}

impl<K: GeometryKernel + ?Sized> Drop for KernelSession<'_, K> {
    fn drop(&mut self) {
        if !self.closed && self.kernel.is_active() {
            if let Err(e) = self.kernel.finalize() {
                log::warn!("{} session could not be finalized: {}", self.kernel.name(), e);
            }
        }
    }
}
