// src/meshing/extract.rs

//! Translates kernel output into dense, 0-based arrays.
//!
//! Kernel node tags are arbitrary positive integers; the node table keeps the
//! kernel's emission order, and every tag is mapped to its position in that order
//! through a single [`NodeIndex`].

use super::domain::DomainHandles;
use crate::kernel::{GeometryKernel, RawElementBlock, RawNodes};
use crate::{ElementBlock, EngineError, Mesh};
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};

/// Maps kernel node tags to 0-based row indices of the node table.
#[derive(Clone, Debug)]
pub enum NodeIndex {
    /// Tags are exactly `1..=n` in emission order.
    Sequential(usize),
    Mapped(HashMap<usize, usize>),
}

impl NodeIndex {
    pub fn new(tags: &[usize]) -> Result<Self, EngineError> {
        if tags.iter().enumerate().all(|(i, &t)| t == i + 1) {
            return Ok(NodeIndex::Sequential(tags.len()));
        }
        let mut map = HashMap::with_capacity(tags.len());
        for (i, &t) in tags.iter().enumerate() {
            if map.insert(t, i).is_some() {
                return Err(EngineError::Extraction(format!("node tag {} appears more than once", t)));
            }
        }
        Ok(NodeIndex::Mapped(map))
    }

    pub fn len(&self) -> usize {
        match self {
            NodeIndex::Sequential(n) => *n,
            NodeIndex::Mapped(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self, tag: usize) -> Result<usize, EngineError> {
        let found = match self {
            NodeIndex::Sequential(n) => (1..=*n).contains(&tag).then(|| tag - 1),
            NodeIndex::Mapped(map) => map.get(&tag).copied(),
        };
        found.ok_or_else(|| EngineError::Extraction(format!("element references unknown node tag {}", tag)))
    }
}

/// Reshapes flat `(x, y, z)` triples into an `(N, dim)` table, dropping z for 2D meshes.
pub fn node_table(raw: &RawNodes, dim: usize) -> Result<Array2<f64>, EngineError> {
    if raw.coords.len() != 3 * raw.len() {
        return Err(EngineError::Extraction(format!(
            "{} node tags but {} coordinates",
            raw.len(),
            raw.coords.len()
        )));
    }
    let coords: Vec<f64> = raw.coords.chunks_exact(3).flat_map(|c| c[..dim].iter().copied()).collect();
    Array2::from_shape_vec((raw.len(), dim), coords).map_err(|e| EngineError::Extraction(e.to_string()))
}

/// Reshapes each raw block to its element type's arity and translates tags to indices.
pub fn element_blocks(blocks: &[RawElementBlock], index: &NodeIndex) -> Result<Vec<ElementBlock>, EngineError> {
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        let arity = block.element_type.arity();
        if block.node_tags.len() % arity != 0 {
            return Err(EngineError::Extraction(format!(
                "{:?} block has {} node references, not a multiple of {}",
                block.element_type,
                block.node_tags.len(),
                arity
            )));
        }
        let indices = block
            .node_tags
            .iter()
            .map(|&t| index.position(t))
            .collect::<Result<Vec<_>, _>>()?;
        let connectivity = Array2::from_shape_vec((indices.len() / arity, arity), indices)
            .map_err(|e| EngineError::Extraction(e.to_string()))?;
        out.push(ElementBlock {
            element_type: block.element_type,
            connectivity,
        });
    }
    Ok(out)
}

/// Reads the generated mesh back from the kernel.
///
/// `element_dim` selects which elements are returned; an empty element list is
/// a valid result.
pub fn extract_mesh<K: GeometryKernel + ?Sized>(
    kernel: &mut K,
    handles: &DomainHandles,
    element_dim: i32,
) -> Result<Mesh, EngineError> {
    let raw_nodes = kernel.get_nodes()?;
    let index = NodeIndex::new(&raw_nodes.tags)?;
    let nodes = node_table(&raw_nodes, handles.dim())?;

    let blocks = kernel.get_elements(element_dim)?;
    let elements = element_blocks(&blocks, &index)?;
    if elements.iter().all(|b| b.is_empty()) {
        log::warn!("kernel returned no elements of dimension {}", element_dim);
    }

    let mut boundary_regions = BTreeMap::new();
    for (name, entity) in &handles.boundaries {
        let mut region = kernel
            .get_entity_nodes(*entity, true)?
            .into_iter()
            .map(|t| index.position(t))
            .collect::<Result<Vec<_>, _>>()?;
        region.sort_unstable();
        region.dedup();
        boundary_regions.insert(name.clone(), region);
    }

    Ok(Mesh {
        nodes,
        elements,
        boundary_regions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ElementType;

    fn raw_nodes(tags: Vec<usize>) -> RawNodes {
        let coords = tags.iter().flat_map(|&t| [t as f64, 10.0 * t as f64, 0.5]).collect();
        let entities = vec![crate::kernel::EntityId::new(2, 1); tags.len()];
        RawNodes { tags, coords, entities }
    }

    #[test]
    fn sequential_tags_use_the_fast_path() {
        let index = NodeIndex::new(&[1, 2, 3]).unwrap();
        assert!(matches!(index, NodeIndex::Sequential(3)));
        assert_eq!(index.position(1).unwrap(), 0);
        assert_eq!(index.position(3).unwrap(), 2);
        assert!(matches!(index.position(0), Err(EngineError::Extraction(_))));
        assert!(matches!(index.position(4), Err(EngineError::Extraction(_))));
    }

    #[test]
    fn sparse_tags_follow_emission_order() {
        let index = NodeIndex::new(&[7, 3, 42]).unwrap();
        assert_eq!(index.position(7).unwrap(), 0);
        assert_eq!(index.position(42).unwrap(), 2);
        assert!(index.position(1).is_err());
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        assert!(matches!(NodeIndex::new(&[2, 5, 2]), Err(EngineError::Extraction(_))));
    }

    #[test]
    fn node_table_drops_z_in_2d() {
        let raw = raw_nodes(vec![1, 2]);
        let table = node_table(&raw, 2).unwrap();
        assert_eq!(table.dim(), (2, 2));
        assert_eq!(table[[1, 1]], 20.0);

        let table = node_table(&raw, 3).unwrap();
        assert_eq!(table[[0, 2]], 0.5);
    }

    #[test]
    fn short_coordinate_list_is_an_error() {
        let mut raw = raw_nodes(vec![1, 2]);
        raw.coords.pop();
        assert!(matches!(node_table(&raw, 3), Err(EngineError::Extraction(_))));
    }

    #[test]
    fn blocks_are_reshaped_by_their_own_arity() {
        let index = NodeIndex::new(&[10, 20, 30, 40, 50]).unwrap();
        let blocks = vec![
            RawElementBlock {
                element_type: ElementType::Triangle,
                element_tags: vec![1, 2],
                node_tags: vec![10, 20, 30, 30, 40, 50],
            },
            RawElementBlock {
                element_type: ElementType::Quadrangle,
                element_tags: vec![3],
                node_tags: vec![10, 20, 40, 50],
            },
        ];
        let out = element_blocks(&blocks, &index).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].connectivity.dim(), (2, 3));
        assert_eq!(out[0].connectivity.row(1).to_vec(), vec![2, 3, 4]);
        assert_eq!(out[1].element_type, ElementType::Quadrangle);
        assert_eq!(out[1].connectivity.row(0).to_vec(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn ragged_block_is_an_error() {
        let index = NodeIndex::new(&[1, 2, 3, 4]).unwrap();
        let blocks = vec![RawElementBlock {
            element_type: ElementType::Tetrahedron,
            element_tags: vec![1],
            node_tags: vec![1, 2, 3],
        }];
        assert!(matches!(element_blocks(&blocks, &index), Err(EngineError::Extraction(_))));
    }

    #[test]
    fn unknown_node_reference_is_an_error() {
        let index = NodeIndex::new(&[1, 2, 3]).unwrap();
        let blocks = vec![RawElementBlock {
            element_type: ElementType::Triangle,
            element_tags: vec![1],
            node_tags: vec![1, 2, 9],
        }];
        assert!(matches!(element_blocks(&blocks, &index), Err(EngineError::Extraction(_))));
    }

    #[test]
    fn no_blocks_means_no_elements() {
        let index = NodeIndex::new(&[1]).unwrap();
        assert!(element_blocks(&[], &index).unwrap().is_empty());
    }
}
