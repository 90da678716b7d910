use crate::engine::{EngineSettings, EnvironmentEngine};
use crate::wait::poll_until;
use crate::{CancelToken, CoreError};
use chrono::DateTime;
use envd_runtime::RuntimeInfo;
use envd_schema::label::{LABEL_JUPYTER_ADDR, LABEL_RSTUDIO_ADDR};
use envd_schema::{
    graph_from_labels, manifest_from_labels, BuildGraph, Context, Dependency, EngineSource,
    EnvStatus, Environment, Image, ImageId, PortBinding, RunnerType, ServicePort, StartOptions,
    StartResult, SSH_PORT_IN_CONTAINER,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

const RUNNER: &str = "envd-server";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ServerEnvironment {
    name: String,
    labels: BTreeMap<String, String>,
    spec: EnvironmentSpec,
    status: EnvironmentStatus,
    #[serde(rename = "resource")]
    resources: ResourceSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct EnvironmentSpec {
    image: String,
    ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct EnvironmentStatus {
    phase: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ResourceSpec {
    cpu: String,
    memory: String,
    gpu: String,
    shm: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    environment: ServerEnvironment,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ImageMeta {
    name: String,
    digest: String,
    created: i64,
    size: i64,
    labels: BTreeMap<String, String>,
}

/// Map a server phase onto the local status vocabulary.
fn phase_status(phase: &str) -> EnvStatus {
    match phase {
        "Running" => EnvStatus::Running,
        "Pending" => EnvStatus::Created,
        "Succeeded" | "Failed" => EnvStatus::Exited,
        _ => EnvStatus::Dead,
    }
}

fn environment_from_server(env: &ServerEnvironment) -> Result<Environment, CoreError> {
    Ok(Environment {
        name: env.name.clone(),
        image: env.spec.image.clone(),
        status: phase_status(&env.status.phase),
        ssh_port: SSH_PORT_IN_CONTAINER,
        jupyter_addr: env.labels.get(LABEL_JUPYTER_ADDR).cloned(),
        rstudio_addr: env.labels.get(LABEL_RSTUDIO_ADDR).cloned(),
        manifest: manifest_from_labels(&env.labels)?,
    })
}

fn image_from_meta(meta: &ImageMeta) -> Result<Image, CoreError> {
    Ok(Image {
        reference: meta.name.clone(),
        id: ImageId::new(meta.digest.clone()),
        tags: vec![meta.name.clone()],
        size: meta.size.max(0) as u64,
        created: DateTime::from_timestamp(meta.created, 0),
        manifest: manifest_from_labels(&meta.labels)?,
    })
}

/// Engine for environments managed by an envd-server.
///
/// Talks to the server's REST API under `/api/v1/users/<login>/`:
/// - `GET    environments`        list environments
/// - `POST   environments`        create an environment
/// - `GET    environments/<name>` describe one
/// - `DELETE environments/<name>` remove one
/// - `GET    images`, `GET images/<name>`
pub struct ServerEngine {
    base_url: String,
    login_name: String,
    token: Option<String>,
    agent: ureq::Agent,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl ServerEngine {
    pub fn new(
        address: &str,
        login_name: &str,
        token: Option<String>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            base_url: address.trim_end_matches('/').to_owned(),
            login_name: login_name.to_owned(),
            token,
            agent: ureq::Agent::new_with_defaults(),
            poll_interval: settings.poll_interval,
            cancel: settings.cancel.clone(),
        }
    }

    pub fn from_context(context: &Context, settings: &EngineSettings) -> Result<Self, CoreError> {
        let address = context.runner_address.as_deref().ok_or_else(|| {
            CoreError::InvalidOptions(format!("context '{}' has no runner address", context.name))
        })?;
        let login = context.login_name.as_deref().ok_or_else(|| {
            CoreError::InvalidOptions(format!(
                "context '{}' has no login name, run `envd login` first",
                context.name
            ))
        })?;
        Ok(Self::new(address, login, context.jwt_token.clone(), settings))
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/users/{}/{path}",
            self.base_url, self.login_name
        )
    }

    fn http_error(url: &str, e: ureq::Error) -> CoreError {
        match e {
            ureq::Error::StatusCode(status) => CoreError::Http {
                status,
                message: url.to_owned(),
            },
            other => CoreError::Transport(other.to_string()),
        }
    }

    fn read_body(url: &str, resp: ureq::http::Response<ureq::Body>) -> Result<Vec<u8>, CoreError> {
        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| CoreError::Transport(format!("{url}: {e}")))?;
        Ok(body)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CoreError> {
        tracing::debug!("GET {url}");
        let mut req = self.agent.get(url);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.call().map_err(|e| Self::http_error(url, e))?;
        Ok(serde_json::from_slice(&Self::read_body(url, resp)?)?)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, CoreError> {
        let data = serde_json::to_vec(body)?;
        tracing::debug!("POST {url} ({} bytes)", data.len());
        let mut req = self
            .agent
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(ref token) = self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req
            .send(&data[..])
            .map_err(|e| Self::http_error(url, e))?;
        Ok(serde_json::from_slice(&Self::read_body(url, resp)?)?)
    }

    fn delete(&self, url: &str) -> Result<(), CoreError> {
        tracing::debug!("DELETE {url}");
        let mut req = self.agent.delete(url);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        req.call().map_err(|e| Self::http_error(url, e))?;
        Ok(())
    }

    /// `None` when the server does not know the environment.
    fn fetch_environment(&self, name: &str) -> Result<Option<ServerEnvironment>, CoreError> {
        match self.get_json(&self.url(&format!("environments/{name}"))) {
            Ok(env) => Ok(Some(env)),
            Err(CoreError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn fetch_image(&self, name: &str) -> Result<ImageMeta, CoreError> {
        match self.get_json::<ImageMeta>(&self.url(&format!("images/{name}"))) {
            Ok(meta) => Ok(meta),
            Err(CoreError::Http { status: 404, .. }) => {
                Err(CoreError::ImageNotFound(name.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    fn unsupported(operation: &'static str) -> CoreError {
        CoreError::Unsupported {
            runner: RUNNER,
            operation,
        }
    }
}

impl EnvironmentEngine for ServerEngine {
    fn runner(&self) -> RunnerType {
        RunnerType::EnvdServer
    }

    fn exists(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.fetch_environment(name)?.is_some())
    }

    fn is_running(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self
            .fetch_environment(name)?
            .is_some_and(|env| env.status.phase == "Running"))
    }

    /// The server has no notion of a forced removal, so `force` is ignored.
    fn clean_if_exists(&self, name: &str, _force: bool) -> Result<(), CoreError> {
        if self.exists(name)? {
            self.delete(&self.url(&format!("environments/{name}")))?;
        }
        Ok(())
    }

    fn start(&self, options: &StartOptions) -> Result<StartResult, CoreError> {
        options.validate()?;
        if !matches!(options.source, EngineSource::Server) {
            return Err(CoreError::InvalidOptions(
                "the envd-server runner needs server start options".to_owned(),
            ));
        }
        let image = options.image.clone().unwrap_or_default();
        if image.is_empty() {
            return Err(CoreError::InvalidOptions(
                "an image is required to start an environment".to_owned(),
            ));
        }

        let request = ServerEnvironment {
            name: options.environment_name.clone(),
            spec: EnvironmentSpec {
                image,
                ports: Vec::new(),
            },
            resources: ResourceSpec {
                cpu: options.num_cpu.clone().unwrap_or_default(),
                memory: options.num_mem.clone().unwrap_or_default(),
                gpu: options.gpu.gpu_count()?.to_string(),
                shm: format!("{}Mi", options.shm_size),
            },
            ..ServerEnvironment::default()
        };
        tracing::debug!(env = %request.name, resources = ?request.resources, "creating remote environment");

        let resp: CreateResponse = self.post_json(&self.url("environments"), &request)?;
        for warning in &resp.warnings {
            tracing::warn!(env = %resp.environment.name, "{warning}");
        }
        let created = resp.environment;

        self.wait_until_running(&created.name, options.timeout)?;
        tracing::info!(env = %created.name, "remote environment is running");

        Ok(StartResult {
            ssh_port: SSH_PORT_IN_CONTAINER,
            address: String::new(),
            name: created.name,
            ports: created.spec.ports,
        })
    }

    fn wait_until_running(&self, name: &str, timeout: Duration) -> Result<(), CoreError> {
        poll_until(
            name,
            timeout,
            self.poll_interval,
            &self.cancel,
            || self.is_running(name),
            || match self.fetch_environment(name) {
                Ok(Some(env)) if !env.status.phase.is_empty() => env.status.phase,
                Ok(Some(_)) => "unknown".to_owned(),
                Ok(None) => EnvStatus::NotCreated.to_string(),
                Err(e) => format!("unknown ({e})"),
            },
        )
    }

    fn pause(&self, _name: &str) -> Result<Option<String>, CoreError> {
        Err(Self::unsupported("pause"))
    }

    fn resume(&self, _name: &str) -> Result<Option<String>, CoreError> {
        Err(Self::unsupported("resume"))
    }

    fn destroy(&self, name: &str) -> Result<Option<String>, CoreError> {
        match self.delete(&self.url(&format!("environments/{name}"))) {
            Ok(()) => {
                tracing::info!(env = %name, "remote environment destroyed");
                Ok(Some(name.to_owned()))
            }
            Err(CoreError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn gpu_enabled(&self) -> Result<bool, CoreError> {
        Err(Self::unsupported("GPU detection"))
    }

    fn info(&self) -> Result<RuntimeInfo, CoreError> {
        Err(Self::unsupported("info"))
    }

    fn list_environments(&self) -> Result<Vec<Environment>, CoreError> {
        let list: ItemList<ServerEnvironment> = self.get_json(&self.url("environments"))?;
        let mut envs = Vec::with_capacity(list.items.len());
        for item in &list.items {
            match environment_from_server(item) {
                Ok(env) => envs.push(env),
                Err(e) => tracing::warn!(env = %item.name, "skipping environment: {e}"),
            }
        }
        Ok(envs)
    }

    fn get_environment(&self, name: &str) -> Result<Environment, CoreError> {
        let env = self
            .fetch_environment(name)?
            .ok_or_else(|| CoreError::EnvNotFound(name.to_owned()))?;
        environment_from_server(&env)
    }

    fn list_images(&self) -> Result<Vec<Image>, CoreError> {
        let list: ItemList<ImageMeta> = self.get_json(&self.url("images"))?;
        let mut images = Vec::with_capacity(list.items.len());
        for meta in &list.items {
            match image_from_meta(meta) {
                Ok(img) => images.push(img),
                Err(e) => tracing::warn!(image = %meta.name, "skipping image: {e}"),
            }
        }
        Ok(images)
    }

    fn get_image(&self, name: &str) -> Result<Image, CoreError> {
        image_from_meta(&self.fetch_image(name)?)
    }

    fn get_image_graph(&self, name: &str) -> Result<Option<BuildGraph>, CoreError> {
        Ok(graph_from_labels(&self.fetch_image(name)?.labels)?)
    }

    fn list_image_dependency(&self, name: &str) -> Result<Dependency, CoreError> {
        Ok(self.get_image(name)?.manifest.dependency)
    }

    fn list_env_dependency(&self, name: &str) -> Result<Dependency, CoreError> {
        tracing::debug!(env = %name, "getting dependencies");
        Ok(self.get_environment(name)?.manifest.dependency)
    }

    /// Remote environments are reached through the server's SSH gateway,
    /// so only the SSH binding exists.
    fn list_env_port_bindings(&self, name: &str) -> Result<Vec<PortBinding>, CoreError> {
        if !self.exists(name)? {
            return Err(CoreError::EnvNotFound(name.to_owned()));
        }
        Ok(vec![PortBinding {
            name: "ssh".to_owned(),
            port: SSH_PORT_IN_CONTAINER,
            protocol: "TCP".to_owned(),
            host_ip: "localhost".to_owned(),
            host_port: SSH_PORT_IN_CONTAINER,
        }])
    }
}
