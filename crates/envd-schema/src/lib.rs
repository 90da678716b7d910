//! Data model and codecs for envd environments.
//!
//! This crate defines the schema layer: the compiled build graph view the
//! engine consumes (`BuildGraph`), the container label vocabulary and its
//! codec (`EnvironmentLabels`, `encode_image_labels`), GPU device request
//! parsing (`parse_gpu_spec`), start options and results, the environment
//! status state machine, and context configuration.

pub mod config;
pub mod device;
pub mod graph;
pub mod label;
pub mod lifecycle;
pub mod model;
pub mod options;
pub mod types;

pub use config::{
    ConfigError, Context, ContextConfig, RunnerType, JUPYTER_PORT_IN_CONTAINER, LOCALHOST,
    RSTUDIO_PORT_IN_CONTAINER, SSH_PORT_IN_CONTAINER,
};
pub use device::{
    default_device_requests, parse_gpu_spec, DeviceRequest, DeviceSpecError,
    DEFAULT_GPU_CAPABILITIES, DEFAULT_GPU_DRIVER,
};
pub use graph::{BuildGraph, ExposeItem, GraphError, JupyterConfig, MountDecl, RStudioConfig};
pub use label::{
    decode_environment_labels, dependency_from_labels, encode_container_labels,
    encode_image_labels, graph_from_labels, is_envd_owned, manifest_from_labels,
    EnvironmentLabels, LabelError,
};
pub use lifecycle::{validate_transition, EnvStatus, TransitionError};
pub use model::{Dependency, Environment, Image, Manifest, PortBinding};
pub use options::{
    env_name_from_dir, resolve_gpu_request, workdir_for, DockerSource, EngineSource, GpuRequest,
    OptionsError, ServicePort, StartOptions, StartResult,
};
pub use types::{ContainerId, ImageId};
