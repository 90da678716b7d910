use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read build graph: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse build graph: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid mount declaration '{0}', expected '<host>:<container>'")]
    InvalidMount(String),
    #[error("exposed port of service '{0}' must not be 0")]
    ZeroExposedPort(String),
}

/// Compiled build graph, as far as the lifecycle engine needs it.
///
/// The compiler that produces this lives elsewhere; the engine only reads
/// the fields below. Every field defaults so that a partial graph (for
/// instance one recovered from an older image label) still loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildGraph {
    pub syntax_version: Option<String>,
    pub mounts: Vec<MountDecl>,
    pub jupyter: Option<JupyterConfig>,
    pub rstudio: Option<RStudioConfig>,
    pub exposed_ports: Vec<ExposeItem>,
    pub num_gpus: Option<i64>,
    pub cuda: Option<String>,
    pub cudnn: Option<String>,
    pub apt_packages: Vec<String>,
    pub pypi_commands: Vec<String>,
    pub r_packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDecl {
    pub source: String,
    pub destination: String,
}

impl MountDecl {
    /// Parse `<host>:<container>`. Both sides must be non-empty and neither
    /// may contain another colon.
    pub fn parse(spec: &str) -> Result<Self, GraphError> {
        match spec.split_once(':') {
            Some((src, dst)) if !src.is_empty() && !dst.is_empty() && !dst.contains(':') => {
                Ok(Self {
                    source: src.to_owned(),
                    destination: dst.to_owned(),
                })
            }
            _ => Err(GraphError::InvalidMount(spec.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JupyterConfig {
    pub token: String,
    /// Host port; 0 picks a free one.
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RStudioConfig {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeItem {
    pub envd_port: u16,
    /// Host port; 0 picks a free one.
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listening_addr: Option<String>,
}

impl BuildGraph {
    /// A graph declares GPU use through a CUDA base or an explicit count.
    pub fn gpu_enabled(&self) -> bool {
        self.cuda.is_some() || self.num_gpus.is_some_and(|n| n != 0)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if let Some(item) = self.exposed_ports.iter().find(|e| e.envd_port == 0) {
            return Err(GraphError::ZeroExposedPort(item.service_name.clone()));
        }
        Ok(())
    }

    pub fn from_json_str(input: &str) -> Result<Self, GraphError> {
        let graph: Self = serde_json::from_str(input)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}
