// src/kernel/topology.rs

//! Bookkeeping for the entities of one kernel model.
//!
//! Both kernels record the same point/curve/surface/volume structure here;
//! the built-in kernel meshes from it and the Gmsh kernel renders it to a script.

use super::{Arrangement, EntityId, Grading, KernelError, Tag};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    pub start: Tag,
    pub end: Tag,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CurveConstraint {
    pub nodes: usize,
    pub grading: Grading,
}

/// Entities and mesh constraints of a model. Tags are 1-based indices into the vectors.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    pub points: Vec<[f64; 3]>,
    pub lines: Vec<Line>,
    pub curve_loops: Vec<Vec<Tag>>,
    /// Each plane surface references one curve loop.
    pub surfaces: Vec<Tag>,
    pub surface_loops: Vec<Vec<Tag>>,
    /// Each volume references one surface loop.
    pub volumes: Vec<Tag>,
    pub transfinite_curves: BTreeMap<Tag, CurveConstraint>,
    pub transfinite_surfaces: BTreeMap<Tag, Arrangement>,
    pub transfinite_volumes: BTreeSet<Tag>,
}

fn next_tag(len: usize) -> Tag {
    len as Tag
}

fn lookup<T>(items: &[T], dim: i32, tag: Tag) -> Result<&T, KernelError> {
    if tag < 1 {
        return Err(KernelError::UnknownEntity { dim, tag });
    }
    items.get(tag as usize - 1).ok_or(KernelError::UnknownEntity { dim, tag })
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, x: f64, y: f64, z: f64) -> Tag {
        self.points.push([x, y, z]);
        next_tag(self.points.len())
    }

    pub fn add_line(&mut self, start: Tag, end: Tag) -> Result<Tag, KernelError> {
        self.point(start)?;
        self.point(end)?;
        if start == end {
            return Err(KernelError::Unsupported(format!("line from point {} to itself", start)));
        }
        self.lines.push(Line { start, end });
        Ok(next_tag(self.lines.len()))
    }

    pub fn add_curve_loop(&mut self, curves: &[Tag]) -> Result<Tag, KernelError> {
        let tag = next_tag(self.curve_loops.len() + 1);
        if curves.is_empty() {
            return Err(KernelError::OpenCurveLoop(tag));
        }
        let mut oriented = Vec::with_capacity(curves.len());
        for &c in curves {
            oriented.push(self.oriented_line(c)?);
        }
        for (i, (_, end)) in oriented.iter().enumerate() {
            let (next_start, _) = oriented[(i + 1) % oriented.len()];
            if *end != next_start {
                return Err(KernelError::OpenCurveLoop(tag));
            }
        }
        self.curve_loops.push(curves.to_vec());
        Ok(tag)
    }

    pub fn add_plane_surface(&mut self, curve_loop: Tag) -> Result<Tag, KernelError> {
        lookup(&self.curve_loops, -1, curve_loop)?;
        self.surfaces.push(curve_loop);
        Ok(next_tag(self.surfaces.len()))
    }

    pub fn add_surface_loop(&mut self, surfaces: &[Tag]) -> Result<Tag, KernelError> {
        for &s in surfaces {
            self.surface_curve_loop(s)?;
        }
        self.surface_loops.push(surfaces.to_vec());
        Ok(next_tag(self.surface_loops.len()))
    }

    pub fn add_volume(&mut self, surface_loop: Tag) -> Result<Tag, KernelError> {
        lookup(&self.surface_loops, -2, surface_loop)?;
        self.volumes.push(surface_loop);
        Ok(next_tag(self.volumes.len()))
    }

    pub fn set_transfinite_curve(&mut self, curve: Tag, nodes: usize, grading: Grading) -> Result<(), KernelError> {
        self.line(curve)?;
        if nodes < 2 {
            return Err(KernelError::InvalidConstraint(format!(
                "curve {} needs at least 2 nodes, got {}",
                curve, nodes
            )));
        }
        if let Grading::Progression(r) = grading {
            if !(r.is_finite() && r > 0.0) {
                return Err(KernelError::InvalidConstraint(format!("progression ratio {} on curve {}", r, curve)));
            }
        }
        self.transfinite_curves.insert(curve, CurveConstraint { nodes, grading });
        Ok(())
    }

    pub fn set_transfinite_surface(&mut self, surface: Tag, arrangement: Arrangement) -> Result<(), KernelError> {
        self.surface_curve_loop(surface)?;
        self.transfinite_surfaces.insert(surface, arrangement);
        Ok(())
    }

    pub fn set_transfinite_volume(&mut self, volume: Tag) -> Result<(), KernelError> {
        self.volume_surfaces(volume)?;
        self.transfinite_volumes.insert(volume);
        Ok(())
    }

    pub fn point(&self, tag: Tag) -> Result<[f64; 3], KernelError> {
        lookup(&self.points, 0, tag).copied()
    }

    pub fn line(&self, tag: Tag) -> Result<&Line, KernelError> {
        lookup(&self.lines, 1, tag)
    }

    /// `(start, end)` of a signed curve reference.
    pub fn oriented_line(&self, signed: Tag) -> Result<(Tag, Tag), KernelError> {
        let line = self.line(signed.abs())?;
        if signed > 0 {
            Ok((line.start, line.end))
        } else {
            Ok((line.end, line.start))
        }
    }

    pub fn surface_curve_loop(&self, surface: Tag) -> Result<&[Tag], KernelError> {
        let loop_tag = *lookup(&self.surfaces, 2, surface)?;
        Ok(lookup(&self.curve_loops, -1, loop_tag)?.as_slice())
    }

    pub fn volume_surfaces(&self, volume: Tag) -> Result<&[Tag], KernelError> {
        let loop_tag = *lookup(&self.volumes, 3, volume)?;
        Ok(lookup(&self.surface_loops, -2, loop_tag)?.as_slice())
    }

    /// The entity itself plus every lower-dimensional entity on its boundary.
    pub fn closure(&self, entity: EntityId) -> Result<BTreeSet<EntityId>, KernelError> {
        let mut out = BTreeSet::new();
        match entity.dim {
            0 => {
                self.point(entity.tag)?;
            }
            1 => {
                let line = self.line(entity.tag)?;
                out.insert(EntityId::new(0, line.start));
                out.insert(EntityId::new(0, line.end));
            }
            2 => {
                for &c in self.surface_curve_loop(entity.tag)? {
                    out.extend(self.closure(EntityId::new(1, c.abs()))?);
                }
            }
            3 => {
                for &s in self.volume_surfaces(entity.tag)? {
                    out.extend(self.closure(EntityId::new(2, s))?);
                }
            }
            _ => return Err(KernelError::UnknownEntity { dim: entity.dim, tag: entity.tag }),
        }
        out.insert(entity);
        Ok(out)
    }

    /// Largest distance between two points, used to derive default mesh sizes.
    pub fn extent(&self) -> f64 {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for p in &self.points {
            for k in 0..3 {
                lo[k] = lo[k].min(p[k]);
                hi[k] = hi[k].max(p[k]);
            }
        }
        if self.points.is_empty() {
            return 0.0;
        }
        (0..3).map(|k| (hi[k] - lo[k]).powi(2)).sum::<f64>().sqrt()
    }
}
