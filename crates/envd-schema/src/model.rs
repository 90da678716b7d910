//! Read-side views reconstructed from runtime listings and labels.

use crate::lifecycle::EnvStatus;
use crate::types::ImageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Package lists an image was built with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub apt_packages: Vec<String>,
    pub pypi_packages: Vec<String>,
    pub r_packages: Vec<String>,
}

impl Dependency {
    pub fn is_empty(&self) -> bool {
        self.apt_packages.is_empty() && self.pypi_packages.is_empty() && self.r_packages.is_empty()
    }
}

/// Build-time facts recorded in image labels and inherited by containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub gpu: bool,
    pub cuda: Option<String>,
    pub cudnn: Option<String>,
    pub build_context: Option<String>,
    pub dependency: Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub image: String,
    pub status: EnvStatus,
    pub ssh_port: u16,
    pub jupyter_addr: Option<String>,
    pub rstudio_addr: Option<String>,
    #[serde(flatten)]
    pub manifest: Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// First tag, or `<none>` for an untagged image.
    pub reference: String,
    pub id: ImageId,
    pub tags: Vec<String>,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub manifest: Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: u16,
}
