// src/config/mod.rs

//! Engine configuration: which kernel meshes, and how workers are isolated.

use crate::kernel::{BuiltinKernel, GeometryKernel, GmshCliKernel};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "MESH_ENGINE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: KernelBackend,

    #[serde(default)]
    pub isolation: IsolationConfig,
}

/// The kernel a worker constructs for each request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelBackend {
    #[default]
    Builtin,
    GmshCli {
        #[serde(default = "default_gmsh_executable")]
        executable: PathBuf,
    },
}

fn default_gmsh_executable() -> PathBuf {
    PathBuf::from("gmsh")
}

impl KernelBackend {
    pub fn name(&self) -> &'static str {
        match self {
            KernelBackend::Builtin => "builtin",
            KernelBackend::GmshCli { .. } => "gmsh-cli",
        }
    }

    /// A fresh kernel with no active session. External programs it runs are
    /// killed once they exceed `time_limit`.
    pub fn instantiate(&self, time_limit: Option<Duration>) -> Box<dyn GeometryKernel + Send> {
        match self {
            KernelBackend::Builtin => Box::new(BuiltinKernel::new()),
            KernelBackend::GmshCli { executable } => {
                Box::new(GmshCliKernel::new(executable.clone()).with_time_limit(time_limit))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// One named thread per request, with a fresh kernel value.
    #[default]
    Thread,
    /// One `mesh-worker` process per request.
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default)]
    pub mode: IsolationMode,

    /// Wall-clock limit for one worker [ms]
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra attempts after a worker crash or timeout.
    #[serde(default)]
    pub retries: u32,

    /// Worker executable for process mode. Defaults to `mesh-worker` next to the current executable.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    #[serde(default)]
    pub worker_args: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mode: IsolationMode::default(),
            timeout_ms: default_timeout_ms(),
            retries: 0,
            worker_program: None,
            worker_args: Vec::new(),
        }
    }
}

impl IsolationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: KernelBackend::default(),
            isolation: IsolationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&content)
    }

    /// Loads the file named by `MESH_ENGINE_CONFIG`, or the defaults when it is unset.
    pub fn from_env() -> Result<Self, EngineError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                log::info!("loading configuration from {}", Path::new(&path).display());
                Self::from_json_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.isolation.timeout_ms == 0 {
            return Err(EngineError::Config("isolation.timeout_ms must be positive".into()));
        }
        if let KernelBackend::GmshCli { executable } = &self.backend {
            if executable.as_os_str().is_empty() {
                return Err(EngineError::Config("gmsh executable path is empty".into()));
            }
        }
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| EngineError::Config(format!("cannot write {}: {}", path.as_ref().display(), e)))
    }
}
