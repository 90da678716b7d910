use crate::local::LocalEngine;
use crate::server::ServerEngine;
use crate::wait::DEFAULT_POLL_INTERVAL;
use crate::{CancelToken, CoreError};
use envd_runtime::{select_runtime, RuntimeInfo};
use envd_schema::{
    BuildGraph, Context, Dependency, Environment, Image, PortBinding, RunnerType, StartOptions, StartResult,
};
use std::time::Duration;

/// Lifecycle and inventory operations on environments of one control plane.
///
/// Implementations hold no per-environment state; every call re-derives
/// what it needs from the control plane. Idempotent operations return
/// `Ok(None)` when there was nothing to do and `Ok(Some(name))` otherwise.
pub trait EnvironmentEngine: Send + Sync {
    /// Runner this engine talks to, as named in contexts.
    fn runner(&self) -> RunnerType;

    fn exists(&self, name: &str) -> Result<bool, CoreError>;

    fn is_running(&self, name: &str) -> Result<bool, CoreError>;

    /// Remove `name` if it exists. Without `force` a running environment is
    /// left alone and reported as `StillRunning`.
    fn clean_if_exists(&self, name: &str, force: bool) -> Result<(), CoreError>;

    fn start(&self, options: &StartOptions) -> Result<StartResult, CoreError>;

    fn wait_until_running(&self, name: &str, timeout: Duration) -> Result<(), CoreError>;

    fn pause(&self, name: &str) -> Result<Option<String>, CoreError>;

    fn resume(&self, name: &str) -> Result<Option<String>, CoreError>;

    fn destroy(&self, name: &str) -> Result<Option<String>, CoreError>;

    fn gpu_enabled(&self) -> Result<bool, CoreError>;

    fn info(&self) -> Result<RuntimeInfo, CoreError>;

    fn list_environments(&self) -> Result<Vec<Environment>, CoreError>;

    fn get_environment(&self, name: &str) -> Result<Environment, CoreError>;

    fn list_images(&self) -> Result<Vec<Image>, CoreError>;

    fn get_image(&self, name: &str) -> Result<Image, CoreError>;

    /// Build graph an image was produced from, if it recorded one.
    fn get_image_graph(&self, name: &str) -> Result<Option<BuildGraph>, CoreError>;

    fn list_image_dependency(&self, name: &str) -> Result<Dependency, CoreError>;

    fn list_env_dependency(&self, name: &str) -> Result<Dependency, CoreError>;

    fn list_env_port_bindings(&self, name: &str) -> Result<Vec<PortBinding>, CoreError>;
}

/// Knobs shared by every engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Docker binary for the local runner; `docker` on `PATH` when unset.
    pub docker_bin: Option<String>,
    pub poll_interval: Duration,
    pub cancel: CancelToken,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            docker_bin: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancelToken::new(),
        }
    }
}

/// Build the engine for a context.
///
/// `runtime_override` replaces the container runtime of a Docker context,
/// e.g. `mock` for dry runs. It is rejected for envd-server contexts.
pub fn new_engine(
    context: &Context,
    runtime_override: Option<&str>,
    settings: EngineSettings,
) -> Result<Box<dyn EnvironmentEngine>, CoreError> {
    tracing::debug!(context = %context.name, runner = %context.runner, "selecting engine");
    match context.runner {
        RunnerType::Docker => {
            let runtime = select_runtime(
                runtime_override.unwrap_or("docker"),
                settings.docker_bin.as_deref(),
            )?;
            Ok(Box::new(LocalEngine::new(runtime, &settings)))
        }
        RunnerType::EnvdServer => {
            if let Some(rt) = runtime_override {
                return Err(CoreError::InvalidOptions(format!(
                    "runtime '{rt}' cannot be used with an envd-server context"
                )));
            }
            Ok(Box::new(ServerEngine::from_context(context, &settings)?))
        }
    }
}
