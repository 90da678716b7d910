//! Lifecycle engine for envd environments.
//!
//! This crate turns a compiled build graph plus `StartOptions` into a running,
//! addressable environment and reverses it on pause, resume and destroy. The
//! `EnvironmentEngine` trait has two implementations: `LocalEngine`, which
//! drives a local container runtime, and `ServerEngine`, which talks to an
//! envd-server over HTTP. Readiness is a bounded poll that honours a
//! `CancelToken`; inventory queries rebuild environment and image views from
//! runtime listings and labels on every call.

pub mod cancel;
pub mod engine;
pub mod inventory;
pub mod local;
pub mod plan;
pub mod server;
pub mod wait;

pub use cancel::{install_signal_handler, CancelToken};
pub use engine::{new_engine, EngineSettings, EnvironmentEngine};
pub use local::LocalEngine;
pub use server::ServerEngine;

use envd_runtime::RuntimeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("invalid options: {0}")]
    Options(#[from] envd_schema::OptionsError),
    #[error("label error: {0}")]
    Label(#[from] envd_schema::LabelError),
    #[error("build graph error: {0}")]
    Graph(#[from] envd_schema::GraphError),
    #[error("invalid GPU request: {0}")]
    Device(#[from] envd_schema::DeviceSpecError),
    #[error("config error: {0}")]
    Config(#[from] envd_schema::ConfigError),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("environment '{0}' is still running, destroy it first or start with --force")]
    StillRunning(String),
    #[error("port is already allocated in the host: {0}")]
    PortAllocated(String),
    #[error("GPU is required but the nvidia container runtime is not installed")]
    GpuUnavailable,
    #[error("timeout {timeout:?}: environment '{name}' did not start (last state: {last_state})")]
    Timeout {
        name: String,
        timeout: Duration,
        last_state: String,
    },
    #[error("cancelled while waiting for environment '{0}'")]
    Cancelled(String),
    #[error("{operation} is not supported by the {runner} runner")]
    Unsupported {
        runner: &'static str,
        operation: &'static str,
    },
    #[error("envd-server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("envd-server request failed: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a `CoreError`, used to pick exit codes and
/// decide whether a failure is worth retrying by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ResourceExhausted,
    Timeout,
    Unsupported,
    Invalid,
    Transport,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::EnvNotFound(_) | CoreError::ImageNotFound(_) => ErrorKind::NotFound,
            CoreError::Http { status: 404, .. } => ErrorKind::NotFound,
            CoreError::Http { status: 409, .. } | CoreError::StillRunning(_) => ErrorKind::Conflict,
            CoreError::PortAllocated(_) | CoreError::GpuUnavailable => {
                ErrorKind::ResourceExhausted
            }
            CoreError::Timeout { .. } | CoreError::Cancelled(_) => ErrorKind::Timeout,
            CoreError::Unsupported { .. } => ErrorKind::Unsupported,
            CoreError::Options(_)
            | CoreError::Label(_)
            | CoreError::Graph(_)
            | CoreError::Device(_)
            | CoreError::Config(_)
            | CoreError::InvalidOptions(_) => ErrorKind::Invalid,
            CoreError::Runtime(e) => match e {
                RuntimeError::NotFound(_) => ErrorKind::NotFound,
                RuntimeError::AlreadyPaused(_)
                | RuntimeError::NotPaused(_)
                | RuntimeError::NotRunning(_)
                | RuntimeError::Conflict(_)
                | RuntimeError::Transition(_) => ErrorKind::Conflict,
                RuntimeError::PortAllocated(_) => ErrorKind::ResourceExhausted,
                RuntimeError::Io(_)
                | RuntimeError::Unavailable(_)
                | RuntimeError::ExecFailed(_)
                | RuntimeError::Parse(_) => ErrorKind::Transport,
            },
            CoreError::Http { .. }
            | CoreError::Transport(_)
            | CoreError::Io(_)
            | CoreError::Serialization(_) => ErrorKind::Transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            CoreError::EnvNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::Runtime(RuntimeError::NotFound("x".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::StillRunning("x".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CoreError::Runtime(RuntimeError::PortAllocated("x".into())).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            CoreError::Cancelled("x".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CoreError::Unsupported {
                runner: "envd-server",
                operation: "pause"
            }
            .kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            CoreError::Http {
                status: 404,
                message: String::new()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::Http {
                status: 500,
                message: String::new()
            }
            .kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            CoreError::InvalidOptions("bad mount".into()).kind(),
            ErrorKind::Invalid
        );
    }
}
