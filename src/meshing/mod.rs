// src/meshing/mod.rs

//! The meshing pipeline: build the domain, constrain it, generate, extract.

pub mod constraints;
pub mod domain;
pub mod extract;

use crate::kernel::{GeometryKernel, KernelSession};
use crate::{Domain, ElementFamily, EngineError, Mesh, MeshKind, MeshRequest};

/// Which kernel calls a request turns into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationPlan {
    /// Dimension passed to `generate`.
    pub mesh_dim: i32,
    /// Dimension of the extracted elements.
    pub element_dim: i32,
    pub recombine: bool,
}

impl GenerationPlan {
    pub fn for_request(request: &MeshRequest) -> Self {
        let element_dim = match request.family {
            ElementFamily::Tetrahedron => 3,
            ElementFamily::Triangle | ElementFamily::Quadrilateral => 2,
        };
        // A structured box is meshed through its volume so that every lattice node exists.
        let mesh_dim = match request.domain {
            Domain::Rectangle { .. } => 2,
            Domain::Box { .. } if element_dim == 3 || request.kind == MeshKind::Structured => 3,
            Domain::Box { .. } => 2,
        };
        GenerationPlan {
            mesh_dim,
            element_dim,
            recombine: request.family == ElementFamily::Quadrilateral,
        }
    }
}

/// Runs one request against `kernel` inside a fresh session.
///
/// The session is finalized on every path, including errors.
pub fn generate_mesh<K: GeometryKernel + ?Sized>(kernel: &mut K, request: &MeshRequest) -> Result<Mesh, EngineError> {
    request.validate()?;
    let plan = GenerationPlan::for_request(request);

    let mut session = KernelSession::open(kernel, request.model_name())?;
    let handles = domain::build_domain(&mut *session, &request.domain)?;
    constraints::apply_constraints(&mut *session, &handles, request)?;

    log::debug!("generating {}D mesh", plan.mesh_dim);
    session.generate(plan.mesh_dim)?;
    if plan.recombine {
        session.recombine()?;
    }

    let mesh = extract::extract_mesh(&mut *session, &handles, plan.element_dim)?;
    session.close()?;
    Ok(mesh)
}
