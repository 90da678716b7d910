use crate::RuntimeError;
use chrono::{DateTime, Utc};
use envd_schema::{ContainerId, DeviceRequest, EnvStatus, ImageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// One host binding of a container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: u16,
}

impl PortMapping {
    pub fn tcp(container_port: u16, host_ip: &str, host_port: u16) -> Self {
        Self {
            container_port,
            protocol: "tcp".to_owned(),
            host_ip: host_ip.to_owned(),
            host_port,
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub port_bindings: Vec<PortMapping>,
    pub mounts: Vec<BindMount>,
    pub restart_policy: String,
    pub shm_size_bytes: Option<u64>,
    pub device_requests: Vec<DeviceRequest>,
    pub cpus: Option<String>,
    pub cpuset: Option<String>,
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub status: EnvStatus,
    pub labels: BTreeMap<String, String>,
    pub port_bindings: Vec<PortMapping>,
    pub ip_address: String,
}

impl ContainerDetails {
    pub fn is_running(&self) -> bool {
        self.status == EnvStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDetails {
    pub id: ImageId,
    pub repo_tags: Vec<String>,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

/// Daemon summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub server_version: String,
    pub operating_system: String,
    pub kernel_version: String,
    pub default_runtime: String,
    pub ncpu: u64,
    pub mem_total: u64,
    /// Registered OCI runtimes, name to binary path.
    pub runtimes: HashMap<String, String>,
}

/// Synchronous view of a container runtime daemon.
///
/// Lookups by name return `RuntimeError::NotFound` when the daemon has no
/// such object. List filters take a single `key=value` label.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn info(&self) -> Result<RuntimeInfo, RuntimeError>;

    fn inspect_container(&self, name: &str) -> Result<ContainerDetails, RuntimeError>;

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    fn pause_container(&self, name: &str) -> Result<(), RuntimeError>;

    fn unpause_container(&self, name: &str) -> Result<(), RuntimeError>;

    fn kill_container(&self, name: &str) -> Result<(), RuntimeError>;

    fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerDetails>, RuntimeError>;

    fn inspect_image(&self, reference: &str) -> Result<ImageDetails, RuntimeError>;

    fn list_images(&self, label: &str) -> Result<Vec<ImageDetails>, RuntimeError>;

    fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;
}

/// `docker_bin` overrides the Docker binary path.
pub fn select_runtime(
    name: &str,
    docker_bin: Option<&str>,
) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "docker" => Ok(Box::new(match docker_bin {
            Some(bin) => crate::docker::DockerRuntime::with_binary(bin),
            None => crate::docker::DockerRuntime::new(),
        })),
        "mock" => Ok(Box::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::Unavailable(other.to_owned())),
    }
}
