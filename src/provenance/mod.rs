// src/provenance/mod.rs

//! A hash-chained ledger of mesh runs.
//!
//! Each record stores a hash of the request, a fingerprint of the produced mesh and
//! the hash of the previous record, so a tampered or reordered ledger fails [`RunLedger::verify`].

use crate::{EngineError, Mesh, MeshRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub backend: String,
    pub software_version: String,
    pub request_hash: String,
    pub mesh_fingerprint: String,
    pub node_count: usize,
    pub element_count: usize,
    pub previous_record_hash: Option<String>,
}

impl RunRecord {
    /// Hash of the whole record, used as the next record's link.
    pub fn record_hash(&self) -> Result<String, EngineError> {
        let serialized = serde_json::to_string(self).map_err(|e| EngineError::ProvenanceFailed(e.to_string()))?;
        Ok(hex_digest(serialized.as_bytes()))
    }
}

fn hex_digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash of the canonical JSON form of a request.
pub fn request_hash(request: &MeshRequest) -> Result<String, EngineError> {
    let json = serde_json::to_vec(request).map_err(|e| EngineError::ProvenanceFailed(e.to_string()))?;
    Ok(hex_digest(&json))
}

/// Digest of node coordinates (bit patterns), element types and connectivity.
///
/// Two meshes share a fingerprint exactly when they are identical, node order included.
pub fn mesh_fingerprint(mesh: &Mesh) -> String {
    let mut hasher = Sha256::new();
    hasher.update((mesh.nodes.nrows() as u64).to_le_bytes());
    hasher.update((mesh.nodes.ncols() as u64).to_le_bytes());
    for &v in mesh.nodes.iter() {
        hasher.update(v.to_bits().to_le_bytes());
    }
    for block in &mesh.elements {
        hasher.update(format!("{:?}", block.element_type).as_bytes());
        hasher.update((block.connectivity.nrows() as u64).to_le_bytes());
        for &i in block.connectivity.iter() {
            hasher.update((i as u64).to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Records of the runs made by one engine, oldest first.
#[derive(Debug, Default)]
pub struct RunLedger {
    records: Vec<RunRecord>,
}

impl RunLedger {
    pub fn new() -> Self {
        RunLedger { records: Vec::new() }
    }

    /// Appends a record for a finished run.
    pub fn record(&mut self, request: &MeshRequest, mesh: &Mesh, backend: &str) -> Result<&RunRecord, EngineError> {
        let previous_record_hash = match self.records.last() {
            Some(r) => Some(r.record_hash()?),
            None => None,
        };
        self.records.push(RunRecord {
            timestamp: Utc::now(),
            backend: backend.to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            request_hash: request_hash(request)?,
            mesh_fingerprint: mesh_fingerprint(mesh),
            node_count: mesh.node_count(),
            element_count: mesh.element_count(),
            previous_record_hash,
        });
        self.records
            .last()
            .ok_or_else(|| EngineError::ProvenanceFailed("ledger is empty after append".to_string()))
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// Checks every link; returns the index of the first broken record as an error.
    pub fn verify(&self) -> Result<(), EngineError> {
        for (i, pair) in self.records.windows(2).enumerate() {
            let expected = pair[0].record_hash()?;
            if pair[1].previous_record_hash.as_deref() != Some(expected.as_str()) {
                return Err(EngineError::ProvenanceFailed(format!("record {} does not link to record {}", i + 1, i)));
            }
        }
        match self.records.first() {
            Some(first) if first.previous_record_hash.is_some() => {
                Err(EngineError::ProvenanceFailed("first record links to a missing predecessor".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(&self.records)
            .map_err(|e| EngineError::ProvenanceFailed(format!("failed to serialize ledger: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let records = serde_json::from_str(json)
            .map_err(|e| EngineError::ProvenanceFailed(format!("failed to deserialize ledger: {}", e)))?;
        Ok(RunLedger { records })
    }

    /// Removes and returns all records, leaving the ledger empty.
    pub fn drain_records(&mut self) -> Vec<RunRecord> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ElementType;
    use crate::{Domain, ElementBlock, ElementFamily, MeshKind};
    use ndarray::array;
    use std::collections::BTreeMap;

    fn triangle_mesh(x: f64) -> Mesh {
        Mesh {
            nodes: array![[0.0, 0.0], [x, 0.0], [0.0, 1.0]],
            elements: vec![ElementBlock {
                element_type: ElementType::Triangle,
                connectivity: array![[0, 1, 2]],
            }],
            boundary_regions: BTreeMap::new(),
        }
    }

    fn request() -> MeshRequest {
        MeshRequest::new(
            Domain::Rectangle { width: 1.0, height: 1.0, nx: 2, ny: 2 },
            MeshKind::Structured,
            ElementFamily::Triangle,
        )
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        assert_eq!(mesh_fingerprint(&triangle_mesh(1.0)), mesh_fingerprint(&triangle_mesh(1.0)));
        assert_ne!(mesh_fingerprint(&triangle_mesh(1.0)), mesh_fingerprint(&triangle_mesh(2.0)));

        let mut reordered = triangle_mesh(1.0);
        reordered.elements[0].connectivity = array![[1, 2, 0]];
        assert_ne!(mesh_fingerprint(&reordered), mesh_fingerprint(&triangle_mesh(1.0)));
    }

    #[test]
    fn test_ledger_links_records() {
        let mut ledger = RunLedger::new();
        let first = ledger.record(&request(), &triangle_mesh(1.0), "builtin").unwrap().clone();
        assert!(first.previous_record_hash.is_none());
        assert_eq!(first.node_count, 3);
        assert_eq!(first.element_count, 1);

        ledger.record(&request(), &triangle_mesh(2.0), "builtin").unwrap();
        let second = &ledger.records()[1];
        assert_eq!(second.previous_record_hash, Some(first.record_hash().unwrap()));
        assert_eq!(second.request_hash, first.request_hash);
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let mut ledger = RunLedger::new();
        for x in [1.0, 2.0, 3.0] {
            ledger.record(&request(), &triangle_mesh(x), "builtin").unwrap();
        }
        let mut records = ledger.drain_records();
        records[1].node_count = 99;
        let tampered = RunLedger { records };
        assert!(matches!(tampered.verify(), Err(EngineError::ProvenanceFailed(_))));
    }

    #[test]
    fn test_ledger_serialization() {
        let mut ledger = RunLedger::new();
        ledger.record(&request(), &triangle_mesh(1.0), "builtin").unwrap();
        ledger.record(&request(), &triangle_mesh(1.0), "gmsh-cli").unwrap();

        let json = ledger.to_json().unwrap();
        let restored = RunLedger::from_json(&json).unwrap();
        assert_eq!(restored.records(), ledger.records());
        assert!(restored.verify().is_ok());
    }
}
