use crate::engine::{EngineSettings, EnvironmentEngine};
use crate::plan::{compose_mounts, plan_ports};
use crate::wait::poll_until;
use crate::{inventory, CancelToken, CoreError};
use envd_runtime::{get_free_port, ContainerRuntime, ContainerSpec, RuntimeError, RuntimeInfo};
use envd_schema::{
    encode_container_labels, graph_from_labels, BuildGraph, Dependency, EngineSource,
    Environment, Image, PortBinding, RunnerType, StartOptions, StartResult,
};
use std::time::Duration;

const RESTART_POLICY: &str = "always";

/// Engine for environments on a local container runtime.
pub struct LocalEngine {
    runtime: Box<dyn ContainerRuntime>,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl LocalEngine {
    pub fn new(runtime: Box<dyn ContainerRuntime>, settings: &EngineSettings) -> Self {
        Self {
            runtime,
            poll_interval: settings.poll_interval,
            cancel: settings.cancel.clone(),
        }
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Graph recorded on `image` by the build, or an empty one for images
    /// built without it.
    fn graph_from_image(&self, image: &str) -> Result<BuildGraph, CoreError> {
        let details = self.runtime.inspect_image(image).map_err(|e| {
            if e.is_not_found() {
                CoreError::ImageNotFound(image.to_owned())
            } else {
                e.into()
            }
        })?;
        match graph_from_labels(&details.labels)? {
            Some(graph) => Ok(graph),
            None => {
                tracing::warn!(image = %image, "image carries no build graph, starting without services");
                Ok(BuildGraph::default())
            }
        }
    }

    fn not_found(name: &str, e: RuntimeError) -> CoreError {
        if e.is_not_found() {
            CoreError::EnvNotFound(name.to_owned())
        } else {
            e.into()
        }
    }
}

impl EnvironmentEngine for LocalEngine {
    fn runner(&self) -> RunnerType {
        RunnerType::Docker
    }

    fn exists(&self, name: &str) -> Result<bool, CoreError> {
        match self.runtime.inspect_container(name) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_running(&self, name: &str) -> Result<bool, CoreError> {
        match self.runtime.inspect_container(name) {
            Ok(details) => Ok(details.is_running()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clean_if_exists(&self, name: &str, force: bool) -> Result<(), CoreError> {
        let details = match self.runtime.inspect_container(name) {
            Ok(d) => d,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !force && details.status.is_live() {
            return Err(CoreError::StillRunning(name.to_owned()));
        }
        tracing::debug!(env = %name, status = %details.status, force, "removing existing environment");
        self.runtime.remove_container(name, force)?;
        Ok(())
    }

    fn start(&self, options: &StartOptions) -> Result<StartResult, CoreError> {
        options.validate()?;
        let EngineSource::Docker(source) = &options.source else {
            return Err(CoreError::InvalidOptions(
                "the docker runner needs docker start options".to_owned(),
            ));
        };
        let Some(image) = options.image.as_deref().filter(|i| !i.is_empty()) else {
            return Err(CoreError::InvalidOptions(
                "an image is required to start an environment".to_owned(),
            ));
        };
        let name = options.environment_name.as_str();
        tracing::debug!(
            env = %name,
            image = %image,
            build_context = %options.build_context,
            gpu = ?options.gpu,
            "starting environment"
        );

        let graph = match &source.graph {
            Some(g) => g.clone(),
            None => self.graph_from_image(image)?,
        };
        graph.validate()?;

        let devices = options.gpu.device_requests()?;
        if !devices.is_empty() && !self.gpu_enabled()? {
            return Err(CoreError::GpuUnavailable);
        }

        let ssh_port = if options.ssh_port == 0 {
            get_free_port()?
        } else {
            options.ssh_port
        };

        self.clean_if_exists(name, options.forced)?;

        let mounts = compose_mounts(&source.mount_options, &graph, &options.build_context)?;
        let plan = plan_ports(&graph, &options.sshd_host, ssh_port, get_free_port)?;
        let labels = encode_container_labels(
            name,
            &graph,
            !devices.is_empty(),
            ssh_port,
            plan.jupyter_port,
            plan.rstudio_port,
        );

        let spec = ContainerSpec {
            name: name.to_owned(),
            image: image.to_owned(),
            working_dir: options.workdir(),
            labels,
            exposed_ports: plan.exposed,
            port_bindings: plan.bindings,
            mounts,
            restart_policy: RESTART_POLICY.to_owned(),
            shm_size_bytes: (options.shm_size > 0)
                .then(|| u64::from(options.shm_size) * 1024 * 1024),
            device_requests: devices,
            cpus: options.num_cpu.clone(),
            cpuset: options.cpu_set.clone(),
            memory: options.num_mem.clone(),
        };

        let id = self.runtime.create_container(&spec)?;
        tracing::debug!(env = %name, id = %id.short(), "container created");

        self.runtime.start_container(name).map_err(|e| match e {
            RuntimeError::PortAllocated(msg) => CoreError::PortAllocated(msg),
            other => other.into(),
        })?;

        self.wait_until_running(name, options.timeout)?;
        let details = self.runtime.inspect_container(name)?;
        tracing::info!(env = %name, ssh_port, "environment is running");

        Ok(StartResult {
            ssh_port,
            address: details.ip_address,
            name: name.to_owned(),
            ports: plan.services,
        })
    }

    fn wait_until_running(&self, name: &str, timeout: Duration) -> Result<(), CoreError> {
        poll_until(
            name,
            timeout,
            self.poll_interval,
            &self.cancel,
            || self.is_running(name),
            || match self.runtime.inspect_container(name) {
                Ok(d) => d.status.to_string(),
                Err(e) => format!("unknown ({e})"),
            },
        )
    }

    fn pause(&self, name: &str) -> Result<Option<String>, CoreError> {
        match self.runtime.pause_container(name) {
            Ok(()) => {
                tracing::info!(env = %name, "environment paused");
                Ok(Some(name.to_owned()))
            }
            Err(RuntimeError::AlreadyPaused(_)) => {
                tracing::debug!(env = %name, "environment is already paused");
                Ok(None)
            }
            Err(e) => Err(Self::not_found(name, e)),
        }
    }

    fn resume(&self, name: &str) -> Result<Option<String>, CoreError> {
        match self.runtime.unpause_container(name) {
            Ok(()) => {
                tracing::info!(env = %name, "environment resumed");
                Ok(Some(name.to_owned()))
            }
            Err(RuntimeError::NotPaused(_)) => {
                tracing::debug!(env = %name, "environment is not paused");
                Ok(None)
            }
            Err(e) => Err(Self::not_found(name, e)),
        }
    }

    fn destroy(&self, name: &str) -> Result<Option<String>, CoreError> {
        let details = match self.runtime.inspect_container(name) {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                tracing::debug!(env = %name, "nothing to destroy");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match self.runtime.kill_container(name) {
            Ok(()) | Err(RuntimeError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.runtime.remove_container(name, false)?;

        match self.runtime.remove_image(&details.image) {
            Ok(()) => tracing::debug!(image = %details.image, "image removed"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(RuntimeError::Conflict(msg)) => {
                tracing::warn!(image = %details.image, "image kept: {msg}");
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(env = %name, "environment destroyed");
        Ok(Some(name.to_owned()))
    }

    fn gpu_enabled(&self) -> Result<bool, CoreError> {
        let info = self.runtime.info()?;
        tracing::debug!(runtimes = ?info.runtimes, kernel = %info.kernel_version, "runtime info");
        if info.runtimes.get("nvidia").is_some_and(|path| !path.is_empty()) {
            return Ok(true);
        }
        if info.kernel_version.ends_with("WSL2") {
            tracing::warn!(
                "cannot detect GPU support of the runtime on WSL2, continuing as if it were present"
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn info(&self) -> Result<RuntimeInfo, CoreError> {
        Ok(self.runtime.info()?)
    }

    fn list_environments(&self) -> Result<Vec<Environment>, CoreError> {
        inventory::list_environments(self.runtime())
    }

    fn get_environment(&self, name: &str) -> Result<Environment, CoreError> {
        inventory::get_environment(self.runtime(), name)
    }

    fn list_images(&self) -> Result<Vec<Image>, CoreError> {
        inventory::list_images(self.runtime())
    }

    fn get_image(&self, name: &str) -> Result<Image, CoreError> {
        inventory::get_image(self.runtime(), name)
    }

    fn get_image_graph(&self, name: &str) -> Result<Option<BuildGraph>, CoreError> {
        inventory::get_image_graph(self.runtime(), name)
    }

    fn list_image_dependency(&self, name: &str) -> Result<Dependency, CoreError> {
        inventory::list_image_dependency(self.runtime(), name)
    }

    fn list_env_dependency(&self, name: &str) -> Result<Dependency, CoreError> {
        inventory::list_env_dependency(self.runtime(), name)
    }

    fn list_env_port_bindings(&self, name: &str) -> Result<Vec<PortBinding>, CoreError> {
        inventory::list_env_port_bindings(self.runtime(), name)
    }
}
