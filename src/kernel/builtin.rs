// src/kernel/builtin.rs

//! A pure-Rust kernel for quadrangular surfaces and hexahedral volumes.
//!
//! It covers the domains this crate builds (rectangles and boxes) without an
//! external Gmsh installation:
//!
//! * curves are split uniformly or by a geometric progression,
//! * four-sided surfaces are filled by discrete transfinite (Coons) interpolation
//!   and split into triangles following their [`Arrangement`],
//! * six-faced volumes are filled with a node lattice whose cells are split into
//!   six Kuhn tetrahedra,
//! * [`recombine`](GeometryKernel::recombine) pairs triangles across their longest edge.
//!
//! Entities without a transfinite constraint are meshed on the same lattice
//! (with alternating diagonals) instead of by a free algorithm.

use super::topology::Topology;
use super::{
    Arrangement, ElementType, EntityId, GeometryKernel, Grading, KernelError, RawElementBlock, RawNodes, Tag,
};
use nalgebra::{Matrix3, Vector3};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug)]
struct MeshNode {
    coords: [f64; 3],
    entity: EntityId,
}

#[derive(Clone, Debug)]
struct MeshElement {
    element_type: ElementType,
    entity: EntityId,
    /// Node tags.
    nodes: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
struct MeshState {
    nodes: Vec<MeshNode>,
    elements: Vec<MeshElement>,
}

impl MeshState {
    fn add_node(&mut self, coords: [f64; 3], entity: EntityId) -> usize {
        self.nodes.push(MeshNode { coords, entity });
        self.nodes.len()
    }

    fn coords(&self, tag: usize) -> Vector3<f64> {
        let c = self.nodes[tag - 1].coords;
        Vector3::new(c[0], c[1], c[2])
    }
}

struct Model {
    name: String,
    topology: Topology,
    mesh: MeshState,
}

/// In-process kernel. See the module documentation for what it can mesh.
#[derive(Default)]
pub struct BuiltinKernel {
    model: Option<Model>,
}

impl BuiltinKernel {
    pub fn new() -> Self {
        BuiltinKernel { model: None }
    }

    /// The entities recorded in the active session.
    pub fn topology(&self) -> Option<&Topology> {
        self.model.as_ref().map(|m| &m.topology)
    }

    fn model(&mut self) -> Result<&mut Model, KernelError> {
        self.model.as_mut().ok_or(KernelError::SessionNotInitialized)
    }

    fn topology_mut(&mut self) -> Result<&mut Topology, KernelError> {
        Ok(&mut self.model()?.topology)
    }
}

impl GeometryKernel for BuiltinKernel {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn is_active(&self) -> bool {
        self.model.is_some()
    }

    fn initialize(&mut self, model: &str) -> Result<(), KernelError> {
        if self.model.is_some() {
            return Err(KernelError::SessionAlreadyActive);
        }
        self.model = Some(Model {
            name: model.to_string(),
            topology: Topology::new(),
            mesh: MeshState::default(),
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), KernelError> {
        self.model.take().map(|_| ()).ok_or(KernelError::SessionNotInitialized)
    }

    fn add_point(&mut self, x: f64, y: f64, z: f64) -> Result<Tag, KernelError> {
        Ok(self.topology_mut()?.add_point(x, y, z))
    }

    fn add_line(&mut self, start: Tag, end: Tag) -> Result<Tag, KernelError> {
        self.topology_mut()?.add_line(start, end)
    }

    fn add_curve_loop(&mut self, curves: &[Tag]) -> Result<Tag, KernelError> {
        self.topology_mut()?.add_curve_loop(curves)
    }

    fn add_plane_surface(&mut self, curve_loop: Tag) -> Result<Tag, KernelError> {
        self.topology_mut()?.add_plane_surface(curve_loop)
    }

    fn add_surface_loop(&mut self, surfaces: &[Tag]) -> Result<Tag, KernelError> {
        self.topology_mut()?.add_surface_loop(surfaces)
    }

    fn add_volume(&mut self, surface_loop: Tag) -> Result<Tag, KernelError> {
        self.topology_mut()?.add_volume(surface_loop)
    }

    fn set_transfinite_curve(&mut self, curve: Tag, nodes: usize, grading: Grading) -> Result<(), KernelError> {
        self.topology_mut()?.set_transfinite_curve(curve, nodes, grading)
    }

    fn set_transfinite_surface(&mut self, surface: Tag, arrangement: Arrangement) -> Result<(), KernelError> {
        self.topology_mut()?.set_transfinite_surface(surface, arrangement)
    }

    fn set_transfinite_volume(&mut self, volume: Tag) -> Result<(), KernelError> {
        self.topology_mut()?.set_transfinite_volume(volume)
    }

    fn generate(&mut self, dim: i32) -> Result<(), KernelError> {
        let model = self.model()?;
        if !(0..=3).contains(&dim) {
            return Err(KernelError::Unsupported(format!("mesh dimension {}", dim)));
        }
        let mut mesher = Mesher::new(&model.topology);
        mesher.mesh_points();
        if dim >= 1 {
            mesher.mesh_curves()?;
        }
        if dim >= 2 {
            mesher.mesh_surfaces()?;
        }
        if dim >= 3 {
            mesher.mesh_volumes()?;
        }
        model.mesh = mesher.state;
        log::debug!(
            "builtin kernel meshed '{}' up to dimension {}: {} nodes, {} elements",
            model.name,
            dim,
            model.mesh.nodes.len(),
            model.mesh.elements.len()
        );
        Ok(())
    }

    fn recombine(&mut self) -> Result<(), KernelError> {
        let model = self.model()?;
        let recombined = recombine_triangles(&model.mesh);
        model.mesh.elements = recombined;
        Ok(())
    }

    fn get_nodes(&mut self) -> Result<RawNodes, KernelError> {
        let model = self.model()?;
        let mut raw = RawNodes::default();
        for (i, node) in model.mesh.nodes.iter().enumerate() {
            raw.tags.push(i + 1);
            raw.coords.extend_from_slice(&node.coords);
            raw.entities.push(node.entity);
        }
        Ok(raw)
    }

    fn get_elements(&mut self, dim: i32) -> Result<Vec<RawElementBlock>, KernelError> {
        let model = self.model()?;
        let mut blocks: Vec<RawElementBlock> = Vec::new();
        for (i, element) in model.mesh.elements.iter().enumerate() {
            if element.element_type.dim() != dim {
                continue;
            }
            let block = match blocks.iter().position(|b| b.element_type == element.element_type) {
                Some(pos) => &mut blocks[pos],
                None => {
                    blocks.push(RawElementBlock {
                        element_type: element.element_type,
                        element_tags: Vec::new(),
                        node_tags: Vec::new(),
                    });
                    let last = blocks.len() - 1;
                    &mut blocks[last]
                }
            };
            block.element_tags.push(i + 1);
            block.node_tags.extend_from_slice(&element.nodes);
        }
        Ok(blocks)
    }

    fn get_entity_nodes(&mut self, entity: EntityId, include_boundary: bool) -> Result<Vec<usize>, KernelError> {
        let model = self.model()?;
        let entities = if include_boundary {
            model.topology.closure(entity)?
        } else {
            model.topology.closure(entity)?;
            BTreeSet::from([entity])
        };
        Ok(model
            .mesh
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| entities.contains(&n.entity))
            .map(|(i, _)| i + 1)
            .collect())
    }
}

/// Builds a fresh [`MeshState`] from a topology, one dimension at a time.
struct Mesher<'t> {
    topology: &'t Topology,
    state: MeshState,
    point_nodes: Vec<usize>,
    /// Node tags along each curve, from its start point to its end point.
    curve_nodes: BTreeMap<Tag, Vec<usize>>,
}

impl<'t> Mesher<'t> {
    fn new(topology: &'t Topology) -> Self {
        Mesher {
            topology,
            state: MeshState::default(),
            point_nodes: Vec::new(),
            curve_nodes: BTreeMap::new(),
        }
    }

    fn mesh_points(&mut self) {
        for (i, p) in self.topology.points.iter().enumerate() {
            let entity = EntityId::new(0, i as Tag + 1);
            let node = self.state.add_node(*p, entity);
            self.point_nodes.push(node);
            self.state.elements.push(MeshElement {
                element_type: ElementType::Point,
                entity,
                nodes: vec![node],
            });
        }
    }

    fn default_curve_nodes(&self, length: f64) -> usize {
        let extent = self.topology.extent();
        let size = if extent > 0.0 { extent / 10.0 } else { 1.0 };
        ((length / size).ceil() as usize).max(1) + 1
    }

    fn mesh_curves(&mut self) -> Result<(), KernelError> {
        let topology = self.topology;
        for (i, line) in topology.lines.iter().enumerate() {
            let tag = i as Tag + 1;
            let a = topology.point(line.start)?;
            let b = topology.point(line.end)?;
            let length = (0..3).map(|k| (b[k] - a[k]).powi(2)).sum::<f64>().sqrt();
            let (count, grading) = match topology.transfinite_curves.get(&tag) {
                Some(c) => (c.nodes, c.grading),
                None => (self.default_curve_nodes(length), Grading::Uniform),
            };
            let params = grading.parameters(count);

            let mut nodes = Vec::with_capacity(count);
            nodes.push(self.point_nodes[line.start as usize - 1]);
            for t in &params[1..count - 1] {
                let coords = [a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1]), a[2] + t * (b[2] - a[2])];
                nodes.push(self.state.add_node(coords, EntityId::new(1, tag)));
            }
            nodes.push(self.point_nodes[line.end as usize - 1]);

            for pair in nodes.windows(2) {
                self.state.elements.push(MeshElement {
                    element_type: ElementType::Line,
                    entity: EntityId::new(1, tag),
                    nodes: pair.to_vec(),
                });
            }
            self.curve_nodes.insert(tag, nodes);
        }
        Ok(())
    }

    fn oriented_curve_nodes(&self, signed: Tag) -> Result<Vec<usize>, KernelError> {
        let nodes = self
            .curve_nodes
            .get(&signed.abs())
            .ok_or(KernelError::UnknownEntity { dim: 1, tag: signed.abs() })?;
        let mut nodes = nodes.clone();
        if signed < 0 {
            nodes.reverse();
        }
        Ok(nodes)
    }

    /// Cumulative arc-length fractions along a polyline of node tags.
    fn arc_parameters(&self, nodes: &[usize]) -> Vec<f64> {
        let mut acc = vec![0.0];
        let mut total = 0.0;
        for pair in nodes.windows(2) {
            total += (self.state.coords(pair[1]) - self.state.coords(pair[0])).norm();
            acc.push(total);
        }
        if total > 0.0 {
            acc.iter_mut().for_each(|v| *v /= total);
        }
        acc
    }

    fn mesh_surfaces(&mut self) -> Result<(), KernelError> {
        for s in 1..=self.topology.surfaces.len() as Tag {
            let curves = self.topology.surface_curve_loop(s)?;
            if curves.len() != 4 {
                return Err(KernelError::Unsupported(format!(
                    "surface {} is bounded by {} curves, only 4 are supported",
                    s,
                    curves.len()
                )));
            }
            let sides = curves
                .iter()
                .map(|&c| self.oriented_curve_nodes(c))
                .collect::<Result<Vec<_>, _>>()?;
            let ni = sides[0].len();
            let nj = sides[1].len();
            if sides[2].len() != ni || sides[3].len() != nj {
                return Err(KernelError::Unsupported(format!(
                    "opposite sides of surface {} have different node counts",
                    s
                )));
            }

            // grid[j * ni + i], i along the first side, j along the second
            let mut grid = vec![0usize; ni * nj];
            for i in 0..ni {
                grid[i] = sides[0][i];
                grid[(nj - 1) * ni + i] = sides[2][ni - 1 - i];
            }
            for j in 0..nj {
                grid[j * ni + ni - 1] = sides[1][j];
                grid[j * ni] = sides[3][nj - 1 - j];
            }

            let top: Vec<usize> = sides[2].iter().rev().copied().collect();
            let left: Vec<usize> = sides[3].iter().rev().copied().collect();
            let u: Vec<f64> = self
                .arc_parameters(&sides[0])
                .iter()
                .zip(self.arc_parameters(&top))
                .map(|(a, b)| 0.5 * (a + b))
                .collect();
            let v: Vec<f64> = self
                .arc_parameters(&left)
                .iter()
                .zip(self.arc_parameters(&sides[1]))
                .map(|(a, b)| 0.5 * (a + b))
                .collect();

            let c00 = self.state.coords(grid[0]);
            let c10 = self.state.coords(grid[ni - 1]);
            let c01 = self.state.coords(grid[(nj - 1) * ni]);
            let c11 = self.state.coords(grid[nj * ni - 1]);
            for j in 1..nj.saturating_sub(1) {
                for i in 1..ni.saturating_sub(1) {
                    let (ui, vj) = (u[i], v[j]);
                    let bottom = self.state.coords(grid[i]);
                    let upper = self.state.coords(grid[(nj - 1) * ni + i]);
                    let west = self.state.coords(grid[j * ni]);
                    let east = self.state.coords(grid[j * ni + ni - 1]);
                    let p = bottom * (1.0 - vj) + upper * vj + west * (1.0 - ui) + east * ui
                        - (c00 * ((1.0 - ui) * (1.0 - vj)) + c10 * (ui * (1.0 - vj)) + c01 * ((1.0 - ui) * vj) + c11 * (ui * vj));
                    grid[j * ni + i] = self.state.add_node([p.x, p.y, p.z], EntityId::new(2, s));
                }
            }

            let arrangement = self
                .topology
                .transfinite_surfaces
                .get(&s)
                .copied()
                .unwrap_or(Arrangement::AlternateLeft);
            let entity = EntityId::new(2, s);
            for j in 0..nj - 1 {
                for i in 0..ni - 1 {
                    let a = grid[j * ni + i];
                    let b = grid[j * ni + i + 1];
                    let c = grid[(j + 1) * ni + i + 1];
                    let d = grid[(j + 1) * ni + i];
                    let even = (i + j) % 2 == 0;
                    let left = match arrangement {
                        Arrangement::Left => true,
                        Arrangement::Right => false,
                        Arrangement::AlternateLeft => even,
                        Arrangement::AlternateRight => !even,
                    };
                    let pair = if left { [[a, b, d], [b, c, d]] } else { [[a, b, c], [a, c, d]] };
                    for tri in pair {
                        self.state.elements.push(MeshElement {
                            element_type: ElementType::Triangle,
                            entity,
                            nodes: tri.to_vec(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn mesh_volumes(&mut self) -> Result<(), KernelError> {
        for vol in 1..=self.topology.volumes.len() as Tag {
            self.mesh_volume(vol)?;
        }
        Ok(())
    }

    fn mesh_volume(&mut self, vol: Tag) -> Result<(), KernelError> {
        let surfaces = self.topology.volume_surfaces(vol)?;
        let mut curves = BTreeSet::new();
        let mut points = BTreeSet::new();
        for &s in surfaces {
            for &c in self.topology.surface_curve_loop(s)? {
                let line = self.topology.line(c.abs())?;
                curves.insert(c.abs());
                points.insert(line.start);
                points.insert(line.end);
            }
        }
        if surfaces.len() != 6 || curves.len() != 12 || points.len() != 8 {
            return Err(KernelError::Unsupported(format!(
                "volume {} is not a hexahedron ({} faces, {} curves, {} corners)",
                vol,
                surfaces.len(),
                curves.len(),
                points.len()
            )));
        }

        // 1. Span the lattice from the lowest-tag corner along its three curves.
        let origin_point = *points.iter().next().ok_or(KernelError::UnknownEntity { dim: 3, tag: vol })?;
        let origin_node = self.point_nodes[origin_point as usize - 1];
        let origin = self.state.coords(origin_node);
        let mut axes: Vec<(Vec<f64>, Vector3<f64>)> = Vec::with_capacity(3);
        for &c in &curves {
            let line = self.topology.line(c)?;
            let signed = if line.start == origin_point {
                c
            } else if line.end == origin_point {
                -c
            } else {
                continue;
            };
            let nodes = self.oriented_curve_nodes(signed)?;
            let far = self.state.coords(nodes[nodes.len() - 1]) - origin;
            let params = self.arc_parameters(&nodes);
            axes.push((params, far));
        }
        if axes.len() != 3 {
            return Err(KernelError::Unsupported(format!(
                "corner {} of volume {} has {} incident curves",
                origin_point,
                vol,
                axes.len()
            )));
        }
        let frame = Matrix3::from_columns(&[axes[0].1, axes[1].1, axes[2].1]);
        let scale = axes[0].1.norm() * axes[1].1.norm() * axes[2].1.norm();
        if frame.determinant().abs() <= 1e-12 * scale {
            return Err(KernelError::Unsupported(format!("volume {} is flat", vol)));
        }

        // 2. Index the nodes already placed on the volume boundary.
        let closure = self.topology.closure(EntityId::new(3, vol))?;
        let tolerance = 1e-8 * scale.cbrt().max(f64::MIN_POSITIVE);
        let mut index = SpatialIndex::new(tolerance);
        for (i, node) in self.state.nodes.iter().enumerate() {
            if closure.contains(&node.entity) {
                index.insert(node.coords, i + 1);
            }
        }

        // 3. Place lattice nodes, reusing boundary ones.
        let (na, nb, nc) = (axes[0].0.len(), axes[1].0.len(), axes[2].0.len());
        let mut lattice = vec![0usize; na * nb * nc];
        let at = |a: usize, b: usize, c: usize| (c * nb + b) * na + a;
        for c in 0..nc {
            for b in 0..nb {
                for a in 0..na {
                    let p = origin + axes[0].1 * axes[0].0[a] + axes[1].1 * axes[1].0[b] + axes[2].1 * axes[2].0[c];
                    let coords = [p.x, p.y, p.z];
                    let boundary = a == 0 || b == 0 || c == 0 || a == na - 1 || b == nb - 1 || c == nc - 1;
                    lattice[at(a, b, c)] = if boundary {
                        index.find(&self.state, coords).ok_or_else(|| {
                            KernelError::Unsupported(format!("boundary of volume {} does not match its lattice", vol))
                        })?
                    } else {
                        self.state.add_node(coords, EntityId::new(3, vol))
                    };
                }
            }
        }

        // 4. Six tetrahedra per cell, one per path through the cell's diagonal.
        const PATHS: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        let entity = EntityId::new(3, vol);
        for c in 0..nc - 1 {
            for b in 0..nb - 1 {
                for a in 0..na - 1 {
                    for path in PATHS {
                        let mut step = [a, b, c];
                        let mut tet = [lattice[at(a, b, c)], 0, 0, 0];
                        for (k, axis) in path.iter().enumerate() {
                            step[*axis] += 1;
                            tet[k + 1] = lattice[at(step[0], step[1], step[2])];
                        }
                        if signed_volume(&self.state, &tet) < 0.0 {
                            tet.swap(2, 3);
                        }
                        self.state.elements.push(MeshElement {
                            element_type: ElementType::Tetrahedron,
                            entity,
                            nodes: tet.to_vec(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn signed_volume(state: &MeshState, tet: &[usize; 4]) -> f64 {
    let p0 = state.coords(tet[0]);
    let m = Matrix3::from_columns(&[
        state.coords(tet[1]) - p0,
        state.coords(tet[2]) - p0,
        state.coords(tet[3]) - p0,
    ]);
    m.determinant() / 6.0
}

/// Hash grid for matching coordinates within a tolerance.
struct SpatialIndex {
    tolerance: f64,
    cells: HashMap<[i64; 3], Vec<usize>>,
}

impl SpatialIndex {
    fn new(tolerance: f64) -> Self {
        SpatialIndex { tolerance, cells: HashMap::new() }
    }

    fn key(&self, coords: [f64; 3]) -> [i64; 3] {
        coords.map(|x| (x / self.tolerance).round() as i64)
    }

    fn insert(&mut self, coords: [f64; 3], tag: usize) {
        let key = self.key(coords);
        self.cells.entry(key).or_default().push(tag);
    }

    fn find(&self, state: &MeshState, coords: [f64; 3]) -> Option<usize> {
        let key = self.key(coords);
        let target = Vector3::new(coords[0], coords[1], coords[2]);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let neighbor = [key[0] + dx, key[1] + dy, key[2] + dz];
                    if let Some(tags) = self.cells.get(&neighbor) {
                        for &tag in tags {
                            if (state.coords(tag) - target).norm() <= self.tolerance {
                                return Some(tag);
                            }
                        }
                    }
                }
            }
        }
        None
    }
}

/// Pairs triangles of the same surface that share their longest edge into quadrangles.
/// Elements that are not triangles, and triangles left without a partner, are kept as they are.
fn recombine_triangles(mesh: &MeshState) -> Vec<MeshElement> {
    let longest_edge = |nodes: &[usize]| -> ((usize, usize), f64) {
        let mut best = ((0, 0), f64::NEG_INFINITY);
        for k in 0..3 {
            let (p, q) = (nodes[k], nodes[(k + 1) % 3]);
            let len = (mesh.coords(q) - mesh.coords(p)).norm();
            if len > best.1 {
                best = ((p.min(q), p.max(q)), len);
            }
        }
        best
    };

    let mut by_edge: HashMap<(EntityId, (usize, usize)), Vec<usize>> = HashMap::new();
    for (i, e) in mesh.elements.iter().enumerate() {
        if e.element_type != ElementType::Triangle {
            continue;
        }
        for k in 0..3 {
            let (p, q) = (e.nodes[k], e.nodes[(k + 1) % 3]);
            by_edge.entry((e.entity, (p.min(q), p.max(q)))).or_default().push(i);
        }
    }

    let mut partner: Vec<Option<usize>> = vec![None; mesh.elements.len()];
    for (i, e) in mesh.elements.iter().enumerate() {
        if e.element_type != ElementType::Triangle || partner[i].is_some() {
            continue;
        }
        let (edge, len) = longest_edge(&e.nodes);
        let Some(candidates) = by_edge.get(&(e.entity, edge)) else {
            continue;
        };
        for &j in candidates {
            if j == i || partner[j].is_some() {
                continue;
            }
            let (other_edge, other_len) = longest_edge(&mesh.elements[j].nodes);
            if other_edge == edge || (other_len - len).abs() <= 1e-12 * len {
                partner[i] = Some(j);
                partner[j] = Some(i);
                break;
            }
        }
    }

    let mut out = Vec::with_capacity(mesh.elements.len());
    for (i, e) in mesh.elements.iter().enumerate() {
        match partner[i] {
            None => out.push(e.clone()),
            Some(j) if j > i => out.push(MeshElement {
                element_type: ElementType::Quadrangle,
                entity: e.entity,
                nodes: merge_pair(&e.nodes, &mesh.elements[j].nodes),
            }),
            Some(_) => {}
        }
    }
    out
}

/// Quadrangle `(r1, p, r2, q)` from triangles `(r1, p, q)` and one sharing edge `p-q`,
/// keeping the first triangle's orientation.
fn merge_pair(first: &[usize], second: &[usize]) -> Vec<usize> {
    let opposite = |tri: &[usize], other: &[usize]| tri.iter().position(|n| !other.contains(n));
    let (Some(k1), Some(k2)) = (opposite(first, second), opposite(second, first)) else {
        return first.to_vec();
    };
    let r1 = first[k1];
    let p = first[(k1 + 1) % 3];
    let q = first[(k1 + 2) % 3];
    vec![r1, p, second[k2], q]
}
