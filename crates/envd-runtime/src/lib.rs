//! Container runtime layer for envd environments.
//!
//! This crate implements the narrow, synchronous `ContainerRuntime` trait the
//! lifecycle engine drives: a Docker CLI backend that shells out to the
//! `docker` binary and classifies its failures, an in-memory backend that
//! enforces the environment state machine for tests, and the free host port
//! allocator.

pub mod backend;
pub mod docker;
pub mod mock;
pub mod port;

pub use backend::{
    select_runtime, BindMount, ContainerDetails, ContainerRuntime, ContainerSpec, ImageDetails,
    PortMapping, RuntimeInfo,
};
pub use docker::DockerRuntime;
pub use mock::MockRuntime;
pub use port::get_free_port;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available on this system")]
    Unavailable(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("container '{0}' is already paused")]
    AlreadyPaused(String),
    #[error("container '{0}' is not paused")]
    NotPaused(String),
    #[error("container '{0}' is not running")]
    NotRunning(String),
    #[error("port is already allocated: {0}")]
    PortAllocated(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("failed to parse runtime output: {0}")]
    Parse(String),
    #[error(transparent)]
    Transition(#[from] envd_schema::TransitionError),
}

impl RuntimeError {
    /// Map a failed runtime command's stderr onto the error it describes.
    pub fn classify(target: &str, stderr: &str) -> Self {
        let msg = stderr.trim();
        if msg.contains("No such container")
            || msg.contains("No such object")
            || msg.contains("No such image")
        {
            RuntimeError::NotFound(target.to_owned())
        } else if msg.contains("is already paused") {
            RuntimeError::AlreadyPaused(target.to_owned())
        } else if msg.contains("is not paused") {
            RuntimeError::NotPaused(target.to_owned())
        } else if msg.contains("is not running") {
            RuntimeError::NotRunning(target.to_owned())
        } else if msg.contains("port is already allocated") {
            RuntimeError::PortAllocated(msg.to_owned())
        } else if msg.contains("is already in use")
            || msg.contains("cannot remove a running container")
            || msg.contains("unable to remove")
        {
            RuntimeError::Conflict(msg.to_owned())
        } else {
            RuntimeError::ExecFailed(msg.to_owned())
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}
