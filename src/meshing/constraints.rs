// src/meshing/constraints.rs

//! Transfinite constraints for a built domain.

use super::domain::{DomainHandles, EdgeHandle};
use crate::kernel::{Arrangement, GeometryKernel, Grading, KernelError};
use crate::{ElementFamily, MeshKind, MeshRequest};

/// Relative tolerance under which two end-point coordinates count as equal.
const AXIS_TOLERANCE: f64 = 1e-12;

/// The axis an edge runs along and whether it runs towards decreasing coordinates.
///
/// The axis is the first coordinate (x, then y, then z) that differs between the
/// end points, so x wins over y and y wins over z.
pub fn edge_axis(edge: &EdgeHandle) -> Option<(usize, bool)> {
    let scale = edge
        .start
        .iter()
        .chain(&edge.end)
        .fold(1.0_f64, |acc, c| acc.max(c.abs()));
    (0..3)
        .find(|&k| (edge.end[k] - edge.start[k]).abs() > AXIS_TOLERANCE * scale)
        .map(|k| (k, edge.end[k] < edge.start[k]))
}

/// Sets subdivision counts and grading on every edge and, for structured requests,
/// marks the surfaces (and the volume) transfinite.
pub fn apply_constraints<K: GeometryKernel + ?Sized>(
    kernel: &mut K,
    handles: &DomainHandles,
    request: &MeshRequest,
) -> Result<(), KernelError> {
    let counts = request.domain.subdivisions();
    for edge in &handles.edges {
        let (axis, reversed) = edge_axis(edge)
            .ok_or_else(|| KernelError::InvalidConstraint(format!("curve {} has zero length", edge.tag)))?;
        let grading = if reversed { request.grading.reversed() } else { request.grading };
        kernel.set_transfinite_curve(edge.tag, counts[axis] + 1, grading)?;
    }

    if request.kind == MeshKind::Unstructured {
        return Ok(());
    }

    match handles.volume {
        None => {
            let arrangement = match request.family {
                ElementFamily::Triangle => request.arrangement,
                _ => Arrangement::default(),
            };
            for &surface in &handles.surfaces {
                kernel.set_transfinite_surface(surface, arrangement)?;
            }
        }
        Some(volume) => {
            for &surface in &handles.surfaces {
                kernel.set_transfinite_surface(surface, Arrangement::default())?;
            }
            kernel.set_transfinite_volume(volume)?;
        }
    }
    log::debug!("{} surfaces marked transfinite", handles.surfaces.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BuiltinKernel, KernelSession};
    use crate::meshing::domain::build_domain;
    use crate::Domain;

    fn edge(start: [f64; 3], end: [f64; 3]) -> EdgeHandle {
        EdgeHandle { tag: 1, start, end }
    }

    #[test]
    fn axis_follows_first_differing_coordinate() {
        assert_eq!(edge_axis(&edge([0.0, 0.0, 0.0], [2.0, 0.0, 0.0])), Some((0, false)));
        assert_eq!(edge_axis(&edge([2.0, 1.0, 0.0], [2.0, 0.0, 0.0])), Some((1, true)));
        assert_eq!(edge_axis(&edge([0.0, 0.0, 0.0], [0.0, 0.0, 5.0])), Some((2, false)));
        // diagonal: x wins
        assert_eq!(edge_axis(&edge([1.0, 0.0, 0.0], [0.0, 1.0, 1.0])), Some((0, true)));
        assert_eq!(edge_axis(&edge([1.0, 1.0, 1.0], [1.0, 1.0, 1.0])), None);
    }

    fn constrained(domain: Domain, kind: MeshKind, family: ElementFamily, grading: Grading) -> BuiltinKernel {
        let request = MeshRequest::new(domain, kind, family)
            .with_arrangement(Arrangement::Right)
            .with_grading(grading);
        let mut kernel = BuiltinKernel::new();
        kernel.initialize("constraints").unwrap();
        let handles = build_domain(&mut kernel, &request.domain).unwrap();
        apply_constraints(&mut kernel, &handles, &request).unwrap();
        kernel
    }

    #[test]
    fn rectangle_edges_get_counts_by_axis() {
        let kernel = constrained(
            Domain::Rectangle { width: 4.0, height: 1.0, nx: 8, ny: 3 },
            MeshKind::Structured,
            ElementFamily::Triangle,
            Grading::Progression(1.5),
        );
        let topology = kernel.topology().unwrap();
        let nodes: Vec<usize> = (1..=4).map(|c| topology.transfinite_curves[&c].nodes).collect();
        assert_eq!(nodes, [9, 4, 9, 4]);

        // top and left run backwards
        assert_eq!(topology.transfinite_curves[&1].grading, Grading::Progression(1.5));
        assert_eq!(topology.transfinite_curves[&3].grading, Grading::Progression(1.0 / 1.5));
        assert_eq!(topology.transfinite_curves[&4].grading, Grading::Progression(1.0 / 1.5));
        assert_eq!(topology.transfinite_surfaces[&1], Arrangement::Right);
    }

    #[test]
    fn quadrilaterals_use_the_default_arrangement() {
        let kernel = constrained(
            Domain::Rectangle { width: 1.0, height: 1.0, nx: 2, ny: 2 },
            MeshKind::Structured,
            ElementFamily::Quadrilateral,
            Grading::Uniform,
        );
        assert_eq!(kernel.topology().unwrap().transfinite_surfaces[&1], Arrangement::Left);
    }

    #[test]
    fn box_marks_every_face_and_the_volume() {
        let kernel = constrained(
            Domain::Box { width: 1.0, height: 1.0, depth: 1.0, nx: 2, ny: 3, nz: 4 },
            MeshKind::Structured,
            ElementFamily::Triangle,
            Grading::Uniform,
        );
        let topology = kernel.topology().unwrap();
        assert_eq!(topology.transfinite_curves.len(), 12);
        assert_eq!(topology.transfinite_curves[&9].nodes, 5);
        assert_eq!(topology.transfinite_curves[&2].nodes, 4);
        assert_eq!(topology.transfinite_surfaces.len(), 6);
        assert!(topology.transfinite_surfaces.values().all(|a| *a == Arrangement::Left));
        assert!(topology.transfinite_volumes.contains(&1));
    }

    #[test]
    fn unstructured_only_constrains_curves() {
        let kernel = constrained(
            Domain::Box { width: 1.0, height: 1.0, depth: 1.0, nx: 2, ny: 2, nz: 2 },
            MeshKind::Unstructured,
            ElementFamily::Tetrahedron,
            Grading::Uniform,
        );
        let topology = kernel.topology().unwrap();
        assert_eq!(topology.transfinite_curves.len(), 12);
        assert!(topology.transfinite_surfaces.is_empty());
        assert!(topology.transfinite_volumes.is_empty());
    }

    #[test]
    fn constraints_need_an_active_session() {
        let mut kernel = BuiltinKernel::new();
        let handles = {
            let mut session = KernelSession::open(&mut kernel, "gone").unwrap();
            build_domain(&mut *session, &Domain::Rectangle { width: 1.0, height: 1.0, nx: 2, ny: 2 }).unwrap()
        };
        let request = MeshRequest::new(
            Domain::Rectangle { width: 1.0, height: 1.0, nx: 2, ny: 2 },
            MeshKind::Structured,
            ElementFamily::Triangle,
        );
        assert!(matches!(
            apply_constraints(&mut kernel, &handles, &request),
            Err(KernelError::SessionNotInitialized)
        ));
    }
}
