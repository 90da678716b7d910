use crate::config::LOCALHOST;
use crate::device::{default_device_requests, parse_gpu_spec, DeviceRequest, DeviceSpecError};
use crate::graph::BuildGraph;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Home directory of the in-container user.
pub const ENVD_HOME: &str = "/home/envd";

/// Container names longer than this are truncated.
pub const MAX_ENV_NAME_LEN: usize = 30;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("environment name must not be empty")]
    EmptyName,
    #[error("build context must not be empty")]
    EmptyBuildContext,
    #[error("--cpus and --cpu-set cannot be used together")]
    CpuConflict,
    #[error("cannot create a legal environment name from '{0}'")]
    IllegalName(String),
    #[error("invalid GPU request: {0}")]
    Gpu(#[from] DeviceSpecError),
}

/// GPU allocation asked for by the caller, before it is turned into
/// device requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuRequest {
    #[default]
    None,
    /// Number of devices; -1 means all of them.
    Count(i64),
    /// Raw `--gpus` style specification.
    Spec(String),
}

impl GpuRequest {
    pub fn is_enabled(&self) -> bool {
        match self {
            GpuRequest::None => false,
            GpuRequest::Count(n) => *n != 0,
            GpuRequest::Spec(s) => !s.trim().is_empty(),
        }
    }

    pub fn device_requests(&self) -> Result<Vec<DeviceRequest>, DeviceSpecError> {
        match self {
            GpuRequest::Count(n) if *n != 0 => Ok(default_device_requests(*n)),
            GpuRequest::Spec(s) if !s.trim().is_empty() => parse_gpu_spec(s),
            _ => Ok(Vec::new()),
        }
    }

    /// Number of devices requested, for control planes that only take a
    /// count. -1 means all.
    pub fn gpu_count(&self) -> Result<i64, DeviceSpecError> {
        let mut total = 0;
        for req in self.device_requests()? {
            if req.count < 0 {
                return Ok(-1);
            }
            total += if req.device_ids.is_empty() {
                req.count
            } else {
                req.device_ids.len() as i64
            };
        }
        Ok(total)
    }
}

/// Pick the GPU request from the ways a user can ask for one.
///
/// A spec string beats an explicit count, which beats the graph's declared
/// count; a graph that only declares a CUDA base gets every GPU. An explicit
/// count of zero and `no_gpu` both disable GPU use.
pub fn resolve_gpu_request(
    cli_spec: Option<&str>,
    cli_count: Option<i64>,
    graph: Option<&BuildGraph>,
    no_gpu: bool,
) -> GpuRequest {
    if no_gpu {
        return GpuRequest::None;
    }
    if let Some(spec) = cli_spec.map(str::trim).filter(|s| !s.is_empty()) {
        return GpuRequest::Spec(spec.to_owned());
    }
    if let Some(n) = cli_count {
        return if n == 0 {
            GpuRequest::None
        } else {
            GpuRequest::Count(n)
        };
    }
    match graph {
        Some(g) => match g.num_gpus {
            Some(n) if n != 0 => GpuRequest::Count(n),
            _ if g.gpu_enabled() => GpuRequest::Count(-1),
            _ => GpuRequest::None,
        },
        None => GpuRequest::None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerSource {
    /// Compiled graph; when absent the engine recovers it from the image.
    pub graph: Option<BuildGraph>,
    /// Extra `<host>:<container>` bind mounts.
    pub mount_options: Vec<String>,
}

/// Control plane the environment is created on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSource {
    Docker(DockerSource),
    Server,
}

impl Default for EngineSource {
    fn default() -> Self {
        EngineSource::Docker(DockerSource::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub image: Option<String>,
    pub environment_name: String,
    pub build_context: String,
    pub gpu: GpuRequest,
    pub num_cpu: Option<String>,
    pub cpu_set: Option<String>,
    pub num_mem: Option<String>,
    /// Shared memory in MiB; 0 keeps the runtime default.
    pub shm_size: u32,
    /// SSH host port; 0 picks a free one.
    pub ssh_port: u16,
    pub sshd_host: String,
    pub timeout: Duration,
    pub forced: bool,
    pub source: EngineSource,
}

impl StartOptions {
    pub fn new(name: &str, build_context: &str) -> Self {
        Self {
            image: None,
            environment_name: name.to_owned(),
            build_context: build_context.to_owned(),
            gpu: GpuRequest::None,
            num_cpu: None,
            cpu_set: None,
            num_mem: None,
            shm_size: 0,
            ssh_port: 0,
            sshd_host: LOCALHOST.to_owned(),
            timeout: DEFAULT_START_TIMEOUT,
            forced: false,
            source: EngineSource::default(),
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.environment_name.trim().is_empty() {
            return Err(OptionsError::EmptyName);
        }
        if self.build_context.trim().is_empty() {
            return Err(OptionsError::EmptyBuildContext);
        }
        if self.num_cpu.is_some() && self.cpu_set.is_some() {
            return Err(OptionsError::CpuConflict);
        }
        self.gpu.device_requests()?;
        Ok(())
    }

    /// In-container working directory, also where the build context is
    /// mounted.
    pub fn workdir(&self) -> String {
        workdir_for(&self.build_context)
    }
}

/// A service port exposed by a started environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    pub ssh_port: u16,
    pub address: String,
    pub name: String,
    pub ports: Vec<ServicePort>,
}

pub fn workdir_for(build_context: &str) -> String {
    let base = Path::new(build_context)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() {
        ENVD_HOME.to_owned()
    } else {
        format!("{ENVD_HOME}/{base}")
    }
}

/// Derive a legal container name from a directory's base name.
///
/// Keeps every run of characters that starts alphanumeric and continues with
/// alphanumerics, `_`, `.` or `-`, joins the runs, and truncates the result.
pub fn env_name_from_dir(dir: &Path) -> Result<String, OptionsError> {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut name = String::new();
    let mut in_run = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
            in_run = true;
        } else if in_run && matches!(c, '_' | '.' | '-') {
            name.push(c);
        } else {
            in_run = false;
        }
    }

    if name.is_empty() {
        return Err(OptionsError::IllegalName(base));
    }
    name.truncate(MAX_ENV_NAME_LEN);
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_spec_overrides_declared_count() {
        let graph = BuildGraph {
            num_gpus: Some(2),
            ..BuildGraph::default()
        };
        let req = resolve_gpu_request(Some("device=1"), None, Some(&graph), false);
        assert_eq!(req, GpuRequest::Spec("device=1".to_owned()));
        let reqs = req.device_requests().unwrap();
        assert_eq!(reqs[0].device_ids, vec!["1".to_owned()]);
        assert_eq!(reqs[0].count, 0);
    }

    #[test]
    fn gpu_resolution_order() {
        let graph = BuildGraph {
            num_gpus: Some(2),
            ..BuildGraph::default()
        };
        assert_eq!(
            resolve_gpu_request(None, Some(1), Some(&graph), false),
            GpuRequest::Count(1)
        );
        assert_eq!(
            resolve_gpu_request(None, None, Some(&graph), false),
            GpuRequest::Count(2)
        );
        assert_eq!(
            resolve_gpu_request(Some("all"), Some(1), Some(&graph), true),
            GpuRequest::None
        );
        assert_eq!(
            resolve_gpu_request(None, Some(0), Some(&graph), false),
            GpuRequest::None
        );
    }

    #[test]
    fn cuda_base_alone_requests_all_gpus() {
        let graph = BuildGraph {
            cuda: Some("11.6".to_owned()),
            ..BuildGraph::default()
        };
        assert_eq!(
            resolve_gpu_request(None, None, Some(&graph), false),
            GpuRequest::Count(-1)
        );
        assert_eq!(
            resolve_gpu_request(None, None, Some(&BuildGraph::default()), false),
            GpuRequest::None
        );
    }

    #[test]
    fn gpu_count_from_spec() {
        assert_eq!(GpuRequest::Spec("\"device=0,1\"".to_owned()).gpu_count().unwrap(), 2);
        assert_eq!(GpuRequest::Spec("all".to_owned()).gpu_count().unwrap(), -1);
        assert_eq!(GpuRequest::Count(3).gpu_count().unwrap(), 3);
        assert_eq!(GpuRequest::None.gpu_count().unwrap(), 0);
    }

    #[test]
    fn validate_rejects_cpu_conflict() {
        let mut opts = StartOptions::new("demo", "/src/demo");
        assert!(opts.validate().is_ok());
        opts.num_cpu = Some("2".to_owned());
        opts.cpu_set = Some("0-1".to_owned());
        assert_eq!(opts.validate(), Err(OptionsError::CpuConflict));
    }

    #[test]
    fn validate_rejects_bad_gpu_spec() {
        let mut opts = StartOptions::new("demo", "/src/demo");
        opts.gpu = GpuRequest::Spec("count=lots".to_owned());
        assert!(matches!(opts.validate(), Err(OptionsError::Gpu(_))));
    }

    #[test]
    fn workdir_uses_context_basename() {
        assert_eq!(workdir_for("/home/alice/projects/mnist"), "/home/envd/mnist");
        assert_eq!(workdir_for("/home/alice/mnist/"), "/home/envd/mnist");
        assert_eq!(StartOptions::new("x", "/src/demo").workdir(), "/home/envd/demo");
    }

    #[test]
    fn env_name_normalization() {
        assert_eq!(env_name_from_dir(Path::new("/src/mnist")).unwrap(), "mnist");
        assert_eq!(env_name_from_dir(Path::new("/src/my project")).unwrap(), "myproject");
        assert_eq!(env_name_from_dir(Path::new("/src/_x-y.z")).unwrap(), "x-y.z");
        assert_eq!(env_name_from_dir(Path::new("/src/a@-b")).unwrap(), "ab");
        assert!(env_name_from_dir(Path::new("/src/@@@")).is_err());

        let long = "a".repeat(40);
        let name = env_name_from_dir(&Path::new("/src").join(long)).unwrap();
        assert_eq!(name.len(), 30);
    }
}
