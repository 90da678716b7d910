//! Label vocabulary and codec.
//!
//! Container and image labels are the only state that survives between
//! invocations, so this module is a serialization boundary. Every container
//! the engine creates carries `LABEL_VERSION`; decoding accepts a missing
//! version (written before versioning existed) as version 1 and refuses any
//! version newer than this build understands.

use crate::config::LOCALHOST;
use crate::graph::BuildGraph;
use crate::model::{Dependency, Manifest};
use std::collections::BTreeMap;
use thiserror::Error;

pub const LABEL_NAME: &str = "ai.tensorchord.envd.name";
pub const LABEL_VENDOR: &str = "ai.tensorchord.envd.vendor";
pub const LABEL_GPU: &str = "ai.tensorchord.envd.gpu";
pub const LABEL_SSH_PORT: &str = "ai.tensorchord.envd.ssh.port";
pub const LABEL_JUPYTER_ADDR: &str = "ai.tensorchord.envd.jupyter.address";
pub const LABEL_RSTUDIO_ADDR: &str = "ai.tensorchord.envd.rstudio.server.address";
pub const LABEL_APT: &str = "ai.tensorchord.envd.apt.packages";
pub const LABEL_PYPI: &str = "ai.tensorchord.envd.pypi.commands";
pub const LABEL_R: &str = "ai.tensorchord.envd.r.packages";
pub const LABEL_CUDA: &str = "ai.tensorchord.envd.gpu.cuda";
pub const LABEL_CUDNN: &str = "ai.tensorchord.envd.gpu.cudnn";
pub const LABEL_BUILD_CONTEXT: &str = "ai.tensorchord.envd.build.context";
pub const LABEL_SYNTAX_VERSION: &str = "ai.tensorchord.envd.syntax.version";
pub const LABEL_GRAPH: &str = "ai.tensorchord.envd.graph.general";
pub const LABEL_VERSION: &str = "ai.tensorchord.envd.labels.version";

pub const VENDOR_ENVD: &str = "envd";
pub const CURRENT_LABEL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("missing label '{0}'")]
    Missing(&'static str),
    #[error("invalid value for label '{key}': '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("label schema version {0} is newer than supported version {max}", max = CURRENT_LABEL_VERSION)]
    UnsupportedVersion(u32),
    #[error("malformed JSON in label '{key}': {source}")]
    Json {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime-facing metadata of one environment, as written on its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentLabels {
    pub name: String,
    pub ssh_port: u16,
    pub gpu: bool,
    pub jupyter_addr: Option<String>,
    pub rstudio_addr: Option<String>,
}

impl EnvironmentLabels {
    /// Metadata for a container about to be created. Service addresses are
    /// only recorded for services the graph declares.
    pub fn for_start(
        name: &str,
        graph: &BuildGraph,
        gpu: bool,
        ssh_port: u16,
        jupyter_port: Option<u16>,
        rstudio_port: Option<u16>,
    ) -> Self {
        let addr = |port: u16| format!("http://{LOCALHOST}:{port}");
        Self {
            name: name.to_owned(),
            ssh_port,
            gpu,
            jupyter_addr: graph.jupyter.as_ref().and(jupyter_port).map(addr),
            rstudio_addr: graph.rstudio.as_ref().and(rstudio_port).map(addr),
        }
    }

    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_owned(), self.name.clone());
        labels.insert(LABEL_VENDOR.to_owned(), VENDOR_ENVD.to_owned());
        labels.insert(LABEL_SSH_PORT.to_owned(), self.ssh_port.to_string());
        labels.insert(LABEL_VERSION.to_owned(), CURRENT_LABEL_VERSION.to_string());
        if self.gpu {
            labels.insert(LABEL_GPU.to_owned(), "true".to_owned());
        }
        if let Some(addr) = &self.jupyter_addr {
            labels.insert(LABEL_JUPYTER_ADDR.to_owned(), addr.clone());
        }
        if let Some(addr) = &self.rstudio_addr {
            labels.insert(LABEL_RSTUDIO_ADDR.to_owned(), addr.clone());
        }
        labels
    }

    pub fn decode(labels: &BTreeMap<String, String>) -> Result<Self, LabelError> {
        check_version(labels)?;
        let name = labels
            .get(LABEL_NAME)
            .ok_or(LabelError::Missing(LABEL_NAME))?
            .clone();
        let raw_port = labels
            .get(LABEL_SSH_PORT)
            .ok_or(LabelError::Missing(LABEL_SSH_PORT))?;
        let ssh_port = raw_port.parse().map_err(|_| LabelError::Invalid {
            key: LABEL_SSH_PORT,
            value: raw_port.clone(),
        })?;
        Ok(Self {
            name,
            ssh_port,
            gpu: labels.get(LABEL_GPU).is_some_and(|v| v == "true"),
            jupyter_addr: labels.get(LABEL_JUPYTER_ADDR).cloned(),
            rstudio_addr: labels.get(LABEL_RSTUDIO_ADDR).cloned(),
        })
    }
}

/// Container labels for a new environment.
pub fn encode_container_labels(
    name: &str,
    graph: &BuildGraph,
    gpu: bool,
    ssh_port: u16,
    jupyter_port: Option<u16>,
    rstudio_port: Option<u16>,
) -> BTreeMap<String, String> {
    EnvironmentLabels::for_start(name, graph, gpu, ssh_port, jupyter_port, rstudio_port).encode()
}

pub fn decode_environment_labels(
    labels: &BTreeMap<String, String>,
) -> Result<EnvironmentLabels, LabelError> {
    EnvironmentLabels::decode(labels)
}

fn check_version(labels: &BTreeMap<String, String>) -> Result<(), LabelError> {
    let Some(raw) = labels.get(LABEL_VERSION) else {
        return Ok(());
    };
    let version: u32 = raw.parse().map_err(|_| LabelError::Invalid {
        key: LABEL_VERSION,
        value: raw.clone(),
    })?;
    if version > CURRENT_LABEL_VERSION {
        return Err(LabelError::UnsupportedVersion(version));
    }
    Ok(())
}

/// Whether the object was created by envd.
pub fn is_envd_owned(labels: &BTreeMap<String, String>) -> bool {
    labels.get(LABEL_VENDOR).is_some_and(|v| v == VENDOR_ENVD)
}

/// Image labels recording what a build graph produced.
pub fn encode_image_labels(
    graph: &BuildGraph,
    build_context: &str,
) -> Result<BTreeMap<String, String>, LabelError> {
    let json = |key: &'static str, list: &[String]| {
        serde_json::to_string(list).map_err(|source| LabelError::Json { key, source })
    };

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_VENDOR.to_owned(), VENDOR_ENVD.to_owned());
    labels.insert(LABEL_VERSION.to_owned(), CURRENT_LABEL_VERSION.to_string());
    labels.insert(LABEL_BUILD_CONTEXT.to_owned(), build_context.to_owned());
    if graph.gpu_enabled() {
        labels.insert(LABEL_GPU.to_owned(), "true".to_owned());
    }
    if let Some(cuda) = &graph.cuda {
        labels.insert(LABEL_CUDA.to_owned(), cuda.clone());
    }
    if let Some(cudnn) = &graph.cudnn {
        labels.insert(LABEL_CUDNN.to_owned(), cudnn.clone());
    }
    if let Some(ver) = &graph.syntax_version {
        labels.insert(LABEL_SYNTAX_VERSION.to_owned(), ver.clone());
    }
    labels.insert(LABEL_APT.to_owned(), json(LABEL_APT, &graph.apt_packages)?);
    labels.insert(LABEL_PYPI.to_owned(), json(LABEL_PYPI, &graph.pypi_commands)?);
    labels.insert(LABEL_R.to_owned(), json(LABEL_R, &graph.r_packages)?);
    let serialized =
        serde_json::to_string(graph).map_err(|source| LabelError::Json {
            key: LABEL_GRAPH,
            source,
        })?;
    labels.insert(LABEL_GRAPH.to_owned(), serialized);
    Ok(labels)
}

/// Recover the build graph an image was produced from, if it recorded one.
pub fn graph_from_labels(
    labels: &BTreeMap<String, String>,
) -> Result<Option<BuildGraph>, LabelError> {
    check_version(labels)?;
    labels
        .get(LABEL_GRAPH)
        .map(|raw| {
            serde_json::from_str(raw).map_err(|source| LabelError::Json {
                key: LABEL_GRAPH,
                source,
            })
        })
        .transpose()
}

pub fn manifest_from_labels(labels: &BTreeMap<String, String>) -> Result<Manifest, LabelError> {
    check_version(labels)?;
    Ok(Manifest {
        gpu: labels.get(LABEL_GPU).is_some_and(|v| v == "true"),
        cuda: labels.get(LABEL_CUDA).cloned(),
        cudnn: labels.get(LABEL_CUDNN).cloned(),
        build_context: labels.get(LABEL_BUILD_CONTEXT).cloned(),
        dependency: dependency_from_labels(labels)?,
    })
}

pub fn dependency_from_labels(
    labels: &BTreeMap<String, String>,
) -> Result<Dependency, LabelError> {
    let list = |key: &'static str| -> Result<Vec<String>, LabelError> {
        match labels.get(key) {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|source| LabelError::Json { key, source })
            }
            None => Ok(Vec::new()),
        }
    };

    Ok(Dependency {
        apt_packages: list(LABEL_APT)?,
        pypi_packages: pypi_packages(&list(LABEL_PYPI)?),
        r_packages: list(LABEL_R)?,
    })
}

/// Drop install flags and the argument following each flag, keeping the
/// package names (`["-i", "mirror", "numpy"]` yields `["numpy"]`).
fn pypi_packages(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .enumerate()
        .filter(|(i, tok)| !tok.starts_with('-') && (*i == 0 || !tokens[i - 1].starts_with('-')))
        .map(|(_, tok)| tok.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{JupyterConfig, RStudioConfig};

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn roundtrip_without_gpu_or_services() {
        let labels = encode_container_labels("demo", &BuildGraph::default(), false, 40022, None, None);
        assert!(!labels.contains_key(LABEL_GPU));
        assert_eq!(labels[LABEL_VENDOR], VENDOR_ENVD);
        assert_eq!(labels[LABEL_VERSION], "1");

        let decoded = decode_environment_labels(&labels).unwrap();
        assert_eq!(decoded.name, "demo");
        assert_eq!(decoded.ssh_port, 40022);
        assert!(!decoded.gpu);
        assert!(decoded.jupyter_addr.is_none());
        assert!(decoded.rstudio_addr.is_none());
    }

    #[test]
    fn roundtrip_with_services() {
        let graph = BuildGraph {
            jupyter: Some(JupyterConfig::default()),
            rstudio: Some(RStudioConfig::default()),
            ..BuildGraph::default()
        };
        let meta = EnvironmentLabels::for_start("demo", &graph, true, 2200, Some(8888), Some(38787));
        assert_eq!(meta.jupyter_addr.as_deref(), Some("http://127.0.0.1:8888"));
        let decoded = EnvironmentLabels::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn service_port_without_declared_service_is_not_recorded() {
        let meta =
            EnvironmentLabels::for_start("demo", &BuildGraph::default(), false, 2200, Some(9), None);
        assert!(meta.jupyter_addr.is_none());
    }

    #[test]
    fn missing_version_reads_as_v1() {
        let mut labels = encode_container_labels("old", &BuildGraph::default(), false, 2222, None, None);
        labels.remove(LABEL_VERSION);
        assert_eq!(decode_environment_labels(&labels).unwrap().name, "old");
    }

    #[test]
    fn newer_version_rejected() {
        let mut labels = encode_container_labels("new", &BuildGraph::default(), false, 2222, None, None);
        labels.insert(LABEL_VERSION.to_owned(), "2".to_owned());
        let err = decode_environment_labels(&labels).unwrap_err();
        assert!(matches!(err, LabelError::UnsupportedVersion(2)));
        assert_eq!(
            err.to_string(),
            "label schema version 2 is newer than supported version 1"
        );
    }

    #[test]
    fn missing_name_and_bad_port_rejected() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_SSH_PORT.to_owned(), "2222".to_owned());
        assert!(matches!(
            decode_environment_labels(&labels),
            Err(LabelError::Missing(LABEL_NAME))
        ));

        labels.insert(LABEL_NAME.to_owned(), "x".to_owned());
        labels.insert(LABEL_SSH_PORT.to_owned(), "ssh".to_owned());
        assert!(matches!(
            decode_environment_labels(&labels),
            Err(LabelError::Invalid { key: LABEL_SSH_PORT, .. })
        ));
    }

    #[test]
    fn image_labels_carry_manifest_and_graph() {
        let graph = BuildGraph {
            cuda: Some("11.6".to_owned()),
            cudnn: Some("8".to_owned()),
            apt_packages: strings(&["git", "vim"]),
            pypi_commands: strings(&["-i", "https://mirror", "numpy", "--pre", "torch", "tqdm"]),
            r_packages: strings(&["ggplot2"]),
            ..BuildGraph::default()
        };
        let labels = encode_image_labels(&graph, "/src/demo").unwrap();
        assert!(is_envd_owned(&labels));

        let manifest = manifest_from_labels(&labels).unwrap();
        assert!(manifest.gpu);
        assert_eq!(manifest.cuda.as_deref(), Some("11.6"));
        assert_eq!(manifest.build_context.as_deref(), Some("/src/demo"));
        assert_eq!(manifest.dependency.apt_packages, strings(&["git", "vim"]));
        assert_eq!(manifest.dependency.pypi_packages, strings(&["numpy", "tqdm"]));
        assert_eq!(manifest.dependency.r_packages, strings(&["ggplot2"]));

        assert_eq!(graph_from_labels(&labels).unwrap(), Some(graph));
    }

    #[test]
    fn absent_dependency_labels_are_empty() {
        let dep = dependency_from_labels(&BTreeMap::new()).unwrap();
        assert!(dep.is_empty());
        assert_eq!(graph_from_labels(&BTreeMap::new()).unwrap(), None);
    }

    #[test]
    fn malformed_package_list_rejected() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APT.to_owned(), "git,vim".to_owned());
        assert!(matches!(
            dependency_from_labels(&labels),
            Err(LabelError::Json { key: LABEL_APT, .. })
        ));
    }

    #[test]
    fn foreign_objects_are_not_owned() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_VENDOR.to_owned(), "someone-else".to_owned());
        assert!(!is_envd_owned(&labels));
    }
}
