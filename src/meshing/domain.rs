// src/meshing/domain.rs

//! Builds rectangle and box topology inside a kernel session.

use crate::kernel::{EntityId, GeometryKernel, KernelError, Tag};
use crate::Domain;

/// A straight boundary edge and the coordinates of its end points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeHandle {
    pub tag: Tag,
    pub start: [f64; 3],
    pub end: [f64; 3],
}

/// Kernel handles of a built domain.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainHandles {
    pub edges: Vec<EdgeHandle>,
    pub surfaces: Vec<Tag>,
    pub volume: Option<Tag>,
    /// Named sides: curves of a rectangle, surfaces of a box.
    pub boundaries: Vec<(String, EntityId)>,
}

impl DomainHandles {
    pub fn dim(&self) -> usize {
        if self.volume.is_some() {
            3
        } else {
            2
        }
    }
}

/// Creates the points, lines, loops, surfaces and (for boxes) the volume of `domain`
/// in the kernel's current model.
pub fn build_domain<K: GeometryKernel + ?Sized>(kernel: &mut K, domain: &Domain) -> Result<DomainHandles, KernelError> {
    if !kernel.is_active() {
        return Err(KernelError::SessionNotInitialized);
    }
    match *domain {
        Domain::Rectangle { width, height, .. } => build_rectangle(kernel, width, height),
        Domain::Box { width, height, depth, .. } => build_box(kernel, width, height, depth),
    }
}

fn add_edges<K: GeometryKernel + ?Sized>(
    kernel: &mut K,
    corners: &[[f64; 3]],
    point_tags: &[Tag],
    pairs: &[(usize, usize)],
) -> Result<Vec<EdgeHandle>, KernelError> {
    pairs
        .iter()
        .map(|&(a, b)| {
            let tag = kernel.add_line(point_tags[a], point_tags[b])?;
            Ok(EdgeHandle { tag, start: corners[a], end: corners[b] })
        })
        .collect()
}

fn add_points<K: GeometryKernel + ?Sized>(kernel: &mut K, corners: &[[f64; 3]]) -> Result<Vec<Tag>, KernelError> {
    corners.iter().map(|c| kernel.add_point(c[0], c[1], c[2])).collect()
}

fn build_rectangle<K: GeometryKernel + ?Sized>(kernel: &mut K, w: f64, h: f64) -> Result<DomainHandles, KernelError> {
    let corners = [[0.0, 0.0, 0.0], [w, 0.0, 0.0], [w, h, 0.0], [0.0, h, 0.0]];
    let points = add_points(kernel, &corners)?;
    let edges = add_edges(kernel, &corners, &points, &[(0, 1), (1, 2), (2, 3), (3, 0)])?;

    let curve_loop = kernel.add_curve_loop(&edges.iter().map(|e| e.tag).collect::<Vec<_>>())?;
    let surface = kernel.add_plane_surface(curve_loop)?;

    let boundaries = ["bottom", "right", "top", "left"]
        .iter()
        .zip(&edges)
        .map(|(name, e)| (name.to_string(), EntityId::new(1, e.tag)))
        .collect();

    Ok(DomainHandles {
        edges,
        surfaces: vec![surface],
        volume: None,
        boundaries,
    })
}

fn build_box<K: GeometryKernel + ?Sized>(kernel: &mut K, w: f64, h: f64, d: f64) -> Result<DomainHandles, KernelError> {
    let corners = [
        [0.0, 0.0, 0.0],
        [w, 0.0, 0.0],
        [w, h, 0.0],
        [0.0, h, 0.0],
        [0.0, 0.0, d],
        [w, 0.0, d],
        [w, h, d],
        [0.0, h, d],
    ];
    let points = add_points(kernel, &corners)?;
    let edges = add_edges(
        kernel,
        &corners,
        &points,
        &[
            // bottom
            (0, 1),
            (1, 2),
            (2, 3),
            (3, 0),
            // top
            (4, 5),
            (5, 6),
            (6, 7),
            (7, 4),
            // verticals
            (0, 4),
            (1, 5),
            (2, 6),
            (3, 7),
        ],
    )?;
    let t: Vec<Tag> = edges.iter().map(|e| e.tag).collect();

    // Faces as signed edge cycles, named by where they sit.
    let faces: [(&str, [Tag; 4]); 6] = [
        ("bottom", [t[0], t[1], t[2], t[3]]),
        ("top", [t[4], t[5], t[6], t[7]]),
        ("front", [t[0], t[9], -t[4], -t[8]]),
        ("right", [t[1], t[10], -t[5], -t[9]]),
        ("back", [t[2], t[11], -t[6], -t[10]]),
        ("left", [t[3], t[8], -t[7], -t[11]]),
    ];

    let mut surfaces = Vec::with_capacity(faces.len());
    let mut boundaries = Vec::with_capacity(faces.len());
    for (name, cycle) in &faces {
        let curve_loop = kernel.add_curve_loop(cycle)?;
        let surface = kernel.add_plane_surface(curve_loop)?;
        surfaces.push(surface);
        boundaries.push((name.to_string(), EntityId::new(2, surface)));
    }

    let surface_loop = kernel.add_surface_loop(&surfaces)?;
    let volume = kernel.add_volume(surface_loop)?;

    Ok(DomainHandles {
        edges,
        surfaces,
        volume: Some(volume),
        boundaries,
    })
}
