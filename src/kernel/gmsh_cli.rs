// src/kernel/gmsh_cli.rs

//! Drives the external `gmsh` executable.
//!
//! Kernel calls are recorded into a [`Topology`] plus a list of mesh commands.
//! When nodes or elements are first requested, the session is rendered as a
//! `.geo` script, run with `gmsh <script> -` in a private temporary directory,
//! and the resulting MSH 4.1 file is parsed with [`mshio`]. A run that outlives
//! the kernel's time limit is killed.

use super::topology::Topology;
use super::{
    Arrangement, ElementType, EntityId, GeometryKernel, Grading, KernelError, RawElementBlock, RawNodes, Tag,
};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const SCRIPT_NAME: &str = "model.geo";
const OUTPUT_NAME: &str = "model.msh";
const LOG_NAME: &str = "gmsh.log";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Nodes and element blocks read back from a `.msh` file.
#[derive(Clone, Debug, Default)]
pub struct ParsedMesh {
    pub nodes: RawNodes,
    pub blocks: Vec<RawElementBlock>,
}

struct ScriptSession {
    model: String,
    topology: Topology,
    mesh_commands: Vec<String>,
    workdir: tempfile::TempDir,
    parsed: Option<ParsedMesh>,
}

/// Kernel backed by the `gmsh` command-line program.
pub struct GmshCliKernel {
    executable: PathBuf,
    time_limit: Option<Duration>,
    session: Option<ScriptSession>,
}

impl GmshCliKernel {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        GmshCliKernel {
            executable: executable.into(),
            time_limit: None,
            session: None,
        }
    }

    /// Kills any gmsh run that takes longer than `limit`.
    pub fn with_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn session(&mut self) -> Result<&mut ScriptSession, KernelError> {
        self.session.as_mut().ok_or(KernelError::SessionNotInitialized)
    }

    fn topology_mut(&mut self) -> Result<&mut Topology, KernelError> {
        let session = self.session()?;
        session.parsed = None;
        Ok(&mut session.topology)
    }

    /// Runs gmsh if the recorded session changed since the last run.
    fn ensure_mesh(&mut self) -> Result<&ParsedMesh, KernelError> {
        let executable = self.executable.clone();
        let time_limit = self.time_limit;
        let session = self.session()?;
        if session.parsed.is_none() {
            session.parsed = Some(if session.mesh_commands.is_empty() {
                ParsedMesh::default()
            } else {
                run_gmsh(&executable, time_limit, session)?
            });
        }
        session.parsed.as_ref().ok_or(KernelError::SessionNotInitialized)
    }
}

/// Renders the recorded session as a `.geo` script that saves its mesh to `output`.
pub fn render_script(model: &str, topology: &Topology, mesh_commands: &[String], output: &Path) -> String {
    let mut geo = String::new();
    let list = |tags: &[Tag]| tags.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ");

    let _ = writeln!(geo, "// model: {}", model);
    let _ = writeln!(geo, "Mesh.MshFileVersion = 4.1;");
    for (i, p) in topology.points.iter().enumerate() {
        let _ = writeln!(geo, "Point({}) = {{{}, {}, {}}};", i + 1, p[0], p[1], p[2]);
    }
    for (i, l) in topology.lines.iter().enumerate() {
        let _ = writeln!(geo, "Line({}) = {{{}, {}}};", i + 1, l.start, l.end);
    }
    for (i, cl) in topology.curve_loops.iter().enumerate() {
        let _ = writeln!(geo, "Curve Loop({}) = {{{}}};", i + 1, list(cl));
    }
    for (i, cl) in topology.surfaces.iter().enumerate() {
        let _ = writeln!(geo, "Plane Surface({}) = {{{}}};", i + 1, cl);
    }
    for (i, sl) in topology.surface_loops.iter().enumerate() {
        let _ = writeln!(geo, "Surface Loop({}) = {{{}}};", i + 1, list(sl));
    }
    for (i, sl) in topology.volumes.iter().enumerate() {
        let _ = writeln!(geo, "Volume({}) = {{{}}};", i + 1, sl);
    }
    for (curve, c) in &topology.transfinite_curves {
        let _ = writeln!(
            geo,
            "Transfinite Curve {{{}}} = {} Using Progression {};",
            curve,
            c.nodes,
            c.grading.ratio()
        );
    }
    for (surface, arrangement) in &topology.transfinite_surfaces {
        let _ = writeln!(geo, "Transfinite Surface {{{}}} {};", surface, arrangement.geo_keyword());
    }
    for volume in &topology.transfinite_volumes {
        let _ = writeln!(geo, "Transfinite Volume {{{}}};", volume);
    }
    for command in mesh_commands {
        let _ = writeln!(geo, "{}", command);
    }
    let _ = writeln!(geo, "Save \"{}\";", output.display());
    geo
}

fn wait_with_limit(child: &mut Child, limit: Option<Duration>) -> Result<ExitStatus, KernelError> {
    let Some(limit) = limit else {
        return Ok(child.wait()?);
    };
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            log::warn!("killing gmsh after {:?}", limit);
            let _ = child.kill();
            let _ = child.wait();
            return Err(KernelError::TimedOut(limit));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn run_gmsh(
    executable: &Path,
    time_limit: Option<Duration>,
    session: &ScriptSession,
) -> Result<ParsedMesh, KernelError> {
    let script_path = session.workdir.path().join(SCRIPT_NAME);
    let output_path = session.workdir.path().join(OUTPUT_NAME);
    let log_path = session.workdir.path().join(LOG_NAME);
    let script = render_script(&session.model, &session.topology, &session.mesh_commands, &output_path);
    fs::write(&script_path, script.as_bytes())?;

    // Output goes to a file so a chatty gmsh never blocks on a full pipe.
    let log_file = fs::File::create(&log_path)?;
    let mut command = Command::new(executable);
    command
        .arg(&script_path)
        .arg("-")
        .arg("-nopopup")
        .current_dir(session.workdir.path())
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file);
    log::debug!("running gmsh: {:?}", command);

    let mut child = command.spawn()?;
    let status = wait_with_limit(&mut child, time_limit)?;
    if !status.success() {
        let output = fs::read(&log_path).unwrap_or_default();
        return Err(KernelError::GmshFailed(format!(
            "{}\nOutput: {}",
            status,
            String::from_utf8_lossy(&output)
        )));
    }

    let bytes = fs::read(&output_path)?;
    parse_msh(&bytes)
}

/// Node tags of one block, in file order.
///
/// Contiguous sections carry no per-node tags: they run from the section's
/// `min_node_tag` in file order. Sparse sections map each tag to its position
/// in the block.
fn block_node_tags(
    block: &mshio::mshfile::NodeBlock<u64, i32, f64>,
    first_tag: usize,
) -> Result<Vec<usize>, KernelError> {
    let Some(sparse) = &block.node_tags else {
        return Ok((first_tag..first_tag + block.nodes.len()).collect());
    };
    let mut tags = vec![0; block.nodes.len()];
    for (&tag, &position) in sparse {
        match tags.get_mut(position) {
            Some(slot) => *slot = tag as usize,
            None => return Err(KernelError::Parse(format!("node tag {} points past its block", tag))),
        }
    }
    if tags.contains(&0) {
        return Err(KernelError::Parse(format!(
            "node block of entity ({}, {}) has untagged nodes",
            block.entity_dim, block.entity_tag
        )));
    }
    Ok(tags)
}

/// Reads nodes and elements from MSH 4.1 bytes, keeping the file's node and element tags.
pub fn parse_msh(bytes: &[u8]) -> Result<ParsedMesh, KernelError> {
    let msh = mshio::parse_msh_bytes(bytes).map_err(|e| KernelError::Parse(format!("{}", e)))?;
    let mut parsed = ParsedMesh::default();

    if let Some(nodes) = msh.data.nodes {
        let mut next_tag = nodes.min_node_tag as usize;
        for block in &nodes.node_blocks {
            let entity = EntityId::new(block.entity_dim, block.entity_tag);
            parsed.nodes.tags.extend(block_node_tags(block, next_tag)?);
            next_tag += block.nodes.len();
            for node in &block.nodes {
                parsed.nodes.coords.extend_from_slice(&[node.x, node.y, node.z]);
                parsed.nodes.entities.push(entity);
            }
        }
    }

    if let Some(elements) = msh.data.elements {
        for block in &elements.element_blocks {
            let code = block.element_type.clone() as i32;
            let Some(element_type) = ElementType::from_gmsh_code(code) else {
                log::warn!("skipping {} elements of unsupported gmsh type {}", block.elements.len(), code);
                continue;
            };
            let index = match parsed.blocks.iter().position(|b| b.element_type == element_type) {
                Some(i) => i,
                None => {
                    parsed.blocks.push(RawElementBlock {
                        element_type,
                        element_tags: Vec::new(),
                        node_tags: Vec::new(),
                    });
                    parsed.blocks.len() - 1
                }
            };
            let target = &mut parsed.blocks[index];
            for el in &block.elements {
                target.element_tags.push(el.element_tag as usize);
                target.node_tags.extend(el.nodes.iter().map(|n| *n as usize));
            }
        }
    }

    Ok(parsed)
}

impl GeometryKernel for GmshCliKernel {
    fn name(&self) -> &'static str {
        "gmsh-cli"
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }

    fn initialize(&mut self, model: &str) -> Result<(), KernelError> {
        if self.session.is_some() {
            return Err(KernelError::SessionAlreadyActive);
        }
        let workdir = tempfile::Builder::new().prefix("mesh-engine-").tempdir()?;
        self.session = Some(ScriptSession {
            model: model.to_string(),
            topology: Topology::new(),
            mesh_commands: Vec::new(),
            workdir,
            parsed: None,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), KernelError> {
        let session = self.session.take().ok_or(KernelError::SessionNotInitialized)?;
        session.workdir.close()?;
        Ok(())
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
        if !(0..=3).contains(&dim) {
            return Err(KernelError::Unsupported(format!("mesh dimension {}", dim)));
        }
        let session = self.session()?;
        session.mesh_commands.push(format!("Mesh {};", dim));
        session.parsed = None;
        Ok(())
    }

    fn recombine(&mut self) -> Result<(), KernelError> {
        let session = self.session()?;
        session.mesh_commands.push("RecombineMesh;".to_string());
        session.parsed = None;
        Ok(())
    }

    fn get_nodes(&mut self) -> Result<RawNodes, KernelError> {
        Ok(self.ensure_mesh()?.nodes.clone())
    }

    fn get_elements(&mut self, dim: i32) -> Result<Vec<RawElementBlock>, KernelError> {
        Ok(self
            .ensure_mesh()?
            .blocks
            .iter()
            .filter(|b| b.element_type.dim() == dim)
            .cloned()
            .collect())
    }

    fn get_entity_nodes(&mut self, entity: EntityId, include_boundary: bool) -> Result<Vec<usize>, KernelError> {
        let closure = self.session()?.topology.closure(entity)?;
        let entities: BTreeSet<EntityId> = if include_boundary { closure } else { BTreeSet::from([entity]) };
        let mesh = self.ensure_mesh()?;
        Ok(mesh
            .nodes
            .tags
            .iter()
            .zip(&mesh.nodes.entities)
            .filter(|(_, e)| entities.contains(e))
            .map(|(t, _)| *t)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshing::extract::{element_blocks, NodeIndex};

    const TWO_TRIANGLES_MSH: &str = "$MeshFormat
4.1 0 8
$EndMeshFormat
$Nodes
2 4 1 4
0 1 0 1
1
0 0 0
2 1 0 3
2
3
4
1 0 0
1 1 0
0 1 0
$EndNodes
$Elements
1 2 1 2
2 1 2 2
1 1 2 3
2 1 3 4
$EndElements
";

    const OFFSET_TAGS_MSH: &str = "$MeshFormat
4.1 0 8
$EndMeshFormat
$Nodes
1 3 2 4
2 1 0 3
2
3
4
0 0 0
1 0 0
0 1 0
$EndNodes
$Elements
1 1 7 7
2 1 2 1
7 2 3 4
$EndElements
";

    const SPARSE_TAGS_MSH: &str = "$MeshFormat
4.1 0 8
$EndMeshFormat
$Nodes
2 3 10 30
0 5 0 1
10
0 0 0
2 1 0 2
30
20
0 1 0
1 0 0
$EndNodes
$Elements
1 1 1 1
2 1 2 1
1 10 20 30
$EndElements
";

    #[cfg(unix)]
    fn stand_in_gmsh(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("gmsh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn connectivity(parsed: &ParsedMesh) -> Vec<usize> {
        let index = NodeIndex::new(&parsed.nodes.tags).unwrap();
        let blocks = element_blocks(&parsed.blocks, &index).unwrap();
        blocks[0].connectivity.iter().copied().collect()
    }

    fn square_session(kernel: &mut GmshCliKernel) {
        kernel.initialize("square").unwrap();
        let p: Vec<Tag> = [[0.0, 0.0], [2.0, 0.0], [2.0, 1.0], [0.0, 1.0]]
            .iter()
            .map(|c| kernel.add_point(c[0], c[1], 0.0).unwrap())
            .collect();
        let l: Vec<Tag> = (0..4).map(|i| kernel.add_line(p[i], p[(i + 1) % 4]).unwrap()).collect();
        let cl = kernel.add_curve_loop(&l).unwrap();
        let s = kernel.add_plane_surface(cl).unwrap();
        kernel.set_transfinite_curve(l[0], 5, Grading::Uniform).unwrap();
        kernel.set_transfinite_curve(l[1], 3, Grading::Progression(1.2)).unwrap();
        kernel.set_transfinite_curve(l[2], 5, Grading::Uniform).unwrap();
        kernel.set_transfinite_curve(l[3], 3, Grading::Progression(1.2).reversed()).unwrap();
        kernel.set_transfinite_surface(s, Arrangement::Right).unwrap();
    }

    #[test]
    fn script_contains_geometry_and_constraints() {
        let mut kernel = GmshCliKernel::new("gmsh");
        square_session(&mut kernel);
        kernel.generate(2).unwrap();
        kernel.recombine().unwrap();
        let session = kernel.session.as_ref().unwrap();
        let script = render_script("square", &session.topology, &session.mesh_commands, Path::new("out.msh"));

        assert!(script.contains("Mesh.MshFileVersion = 4.1;"));
        assert!(script.contains("Point(2) = {2, 0, 0};"));
        assert!(script.contains("Line(4) = {4, 1};"));
        assert!(script.contains("Curve Loop(1) = {1, 2, 3, 4};"));
        assert!(script.contains("Plane Surface(1) = {1};"));
        assert!(script.contains("Transfinite Curve {1} = 5 Using Progression 1;"));
        assert!(script.contains("Transfinite Curve {2} = 3 Using Progression 1.2;"));
        assert!(script.contains("Transfinite Surface {1} Right;"));
        let mesh_at = script.find("Mesh 2;").unwrap();
        let recombine_at = script.find("RecombineMesh;").unwrap();
        let save_at = script.find("Save \"out.msh\";").unwrap();
        assert!(mesh_at < recombine_at && recombine_at < save_at);
    }

    #[test]
    fn parses_nodes_and_elements_from_msh() {
        let parsed = parse_msh(TWO_TRIANGLES_MSH.as_bytes()).unwrap();
        assert_eq!(parsed.nodes.tags, vec![1, 2, 3, 4]);
        assert_eq!(parsed.nodes.coords[3..6], [1.0, 0.0, 0.0]);
        assert_eq!(parsed.nodes.entities[0], EntityId::new(0, 1));
        assert_eq!(parsed.nodes.entities[3], EntityId::new(2, 1));

        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].element_type, ElementType::Triangle);
        assert_eq!(parsed.blocks[0].node_tags, vec![1, 2, 3, 1, 3, 4]);
        assert_eq!(parsed.blocks[0].element_tags, vec![1, 2]);
    }

    #[test]
    fn node_tags_start_at_the_section_minimum() {
        let parsed = parse_msh(OFFSET_TAGS_MSH.as_bytes()).unwrap();
        assert_eq!(parsed.nodes.tags, vec![2, 3, 4]);
        assert_eq!(parsed.blocks[0].element_tags, vec![7]);
        assert_eq!(connectivity(&parsed), vec![0, 1, 2]);
    }

    #[test]
    fn sparse_node_tags_are_kept_per_block() {
        let parsed = parse_msh(SPARSE_TAGS_MSH.as_bytes()).unwrap();
        assert_eq!(parsed.nodes.tags, vec![10, 30, 20]);
        assert_eq!(parsed.nodes.entities[0], EntityId::new(0, 5));
        assert_eq!(parsed.nodes.coords[3..6], [0.0, 1.0, 0.0]);
        assert_eq!(connectivity(&parsed), vec![0, 2, 1]);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(parse_msh(b"not a mesh"), Err(KernelError::Parse(_))));
    }

    #[test]
    fn nothing_is_run_before_generation() {
        let mut kernel = GmshCliKernel::new("/nonexistent/gmsh");
        square_session(&mut kernel);
        assert!(kernel.get_nodes().unwrap().is_empty());
        kernel.finalize().unwrap();
    }

    #[test]
    fn missing_executable_is_an_io_error() {
        let mut kernel = GmshCliKernel::new("/nonexistent/gmsh");
        square_session(&mut kernel);
        kernel.generate(2).unwrap();
        assert!(matches!(kernel.get_nodes(), Err(KernelError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn hanging_gmsh_is_killed_at_the_time_limit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = stand_in_gmsh(dir.path(), "exec sleep 30");
        let mut kernel = GmshCliKernel::new(exe).with_time_limit(Some(Duration::from_millis(200)));
        square_session(&mut kernel);
        kernel.generate(2).unwrap();

        let started = Instant::now();
        assert!(matches!(kernel.get_nodes(), Err(KernelError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        kernel.finalize().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn failing_gmsh_reports_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = stand_in_gmsh(dir.path(), "echo 'Error: no surface' >&2; exit 1");
        let mut kernel = GmshCliKernel::new(exe).with_time_limit(Some(Duration::from_secs(10)));
        square_session(&mut kernel);
        kernel.generate(2).unwrap();
        match kernel.get_nodes() {
            Err(KernelError::GmshFailed(message)) => assert!(message.contains("Error: no surface")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn calls_without_session_fail() {
        let mut kernel = GmshCliKernel::new("gmsh");
        assert!(matches!(kernel.add_point(0.0, 0.0, 0.0), Err(KernelError::SessionNotInitialized)));
        assert!(matches!(kernel.recombine(), Err(KernelError::SessionNotInitialized)));
    }

    #[test]
    fn meshes_with_real_gmsh_when_available() {
        // Only runs where a gmsh binary is provided.
        let Ok(exe) = std::env::var("GMSH_EXECUTABLE") else {
            return;
        };
        let mut kernel = GmshCliKernel::new(exe);
        square_session(&mut kernel);
        kernel.generate(2).unwrap();
        let nodes = kernel.get_nodes().unwrap();
        assert_eq!(nodes.len(), 5 * 3);
        let triangles = kernel.get_elements(2).unwrap();
        assert_eq!(triangles[0].node_tags.len(), 3 * 2 * 4 * 2);
        kernel.finalize().unwrap();
    }
}
