//! Read-side projections over a container runtime.
//!
//! Nothing here is cached. Every call lists or inspects the runtime and
//! decodes labels again, so views always reflect the daemon's current state.

use crate::CoreError;
use envd_runtime::{ContainerDetails, ContainerRuntime, ImageDetails};
use envd_schema::label::{LABEL_VENDOR, VENDOR_ENVD};
use envd_schema::{
    decode_environment_labels, graph_from_labels, is_envd_owned, manifest_from_labels,
    BuildGraph, Dependency, Environment, Image, PortBinding, JUPYTER_PORT_IN_CONTAINER,
    RSTUDIO_PORT_IN_CONTAINER, SSH_PORT_IN_CONTAINER,
};
use std::collections::BTreeMap;

fn vendor_filter() -> String {
    format!("{LABEL_VENDOR}={VENDOR_ENVD}")
}

pub fn environment_from_container(details: &ContainerDetails) -> Result<Environment, CoreError> {
    let labels = decode_environment_labels(&details.labels)?;
    Ok(Environment {
        name: details.name.clone(),
        image: details.image.clone(),
        status: details.status,
        ssh_port: labels.ssh_port,
        jupyter_addr: labels.jupyter_addr,
        rstudio_addr: labels.rstudio_addr,
        manifest: manifest_from_labels(&details.labels)?,
    })
}

pub fn image_from_details(details: &ImageDetails) -> Result<Image, CoreError> {
    Ok(Image {
        reference: details
            .repo_tags
            .first()
            .cloned()
            .unwrap_or_else(|| "<none>".to_owned()),
        id: details.id.clone(),
        tags: details.repo_tags.clone(),
        size: details.size,
        created: details.created,
        manifest: manifest_from_labels(&details.labels)?,
    })
}

/// All envd environments. Containers whose labels cannot be decoded are
/// skipped with a warning so one broken object does not hide the rest.
pub fn list_environments(rt: &dyn ContainerRuntime) -> Result<Vec<Environment>, CoreError> {
    let containers = rt.list_containers(&vendor_filter())?;
    let mut envs = Vec::with_capacity(containers.len());
    for c in &containers {
        match environment_from_container(c) {
            Ok(env) => envs.push(env),
            Err(e) => tracing::warn!(env = %c.name, "skipping environment: {e}"),
        }
    }
    Ok(envs)
}

fn inspect_environment(
    rt: &dyn ContainerRuntime,
    name: &str,
) -> Result<ContainerDetails, CoreError> {
    let details = rt.inspect_container(name).map_err(|e| {
        if e.is_not_found() {
            CoreError::EnvNotFound(name.to_owned())
        } else {
            e.into()
        }
    })?;
    if !is_envd_owned(&details.labels) {
        return Err(CoreError::EnvNotFound(name.to_owned()));
    }
    Ok(details)
}

pub fn get_environment(rt: &dyn ContainerRuntime, name: &str) -> Result<Environment, CoreError> {
    environment_from_container(&inspect_environment(rt, name)?)
}

/// All envd images, skipping undecodable ones like `list_environments`.
pub fn list_images(rt: &dyn ContainerRuntime) -> Result<Vec<Image>, CoreError> {
    let images = rt.list_images(&vendor_filter())?;
    let mut out = Vec::with_capacity(images.len());
    for img in &images {
        match image_from_details(img) {
            Ok(image) => out.push(image),
            Err(e) => tracing::warn!(image = %img.id.short(), "skipping image: {e}"),
        }
    }
    Ok(out)
}

/// `name:tag` as given, `name` becomes `name:latest`.
pub fn normalize_reference(name: &str) -> String {
    if name.contains('@') {
        return name.to_owned();
    }
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        name.to_owned()
    } else {
        format!("{name}:latest")
    }
}

fn find_image(rt: &dyn ContainerRuntime, name: &str) -> Result<ImageDetails, CoreError> {
    let reference = normalize_reference(name);
    let images = rt.list_images(&vendor_filter())?;
    images
        .into_iter()
        .find(|img| {
            img.repo_tags.iter().any(|t| *t == reference || t == name)
                || img.id == *name
                || img.id.short() == name
        })
        .ok_or_else(|| CoreError::ImageNotFound(name.to_owned()))
}

/// Look up an envd image by tag or id.
pub fn get_image(rt: &dyn ContainerRuntime, name: &str) -> Result<Image, CoreError> {
    image_from_details(&find_image(rt, name)?)
}

/// Build graph recorded on an envd image, `None` for images built without one.
pub fn get_image_graph(
    rt: &dyn ContainerRuntime,
    name: &str,
) -> Result<Option<BuildGraph>, CoreError> {
    Ok(graph_from_labels(&find_image(rt, name)?.labels)?)
}

pub fn list_image_dependency(
    rt: &dyn ContainerRuntime,
    name: &str,
) -> Result<Dependency, CoreError> {
    Ok(get_image(rt, name)?.manifest.dependency)
}

pub fn list_env_dependency(
    rt: &dyn ContainerRuntime,
    name: &str,
) -> Result<Dependency, CoreError> {
    tracing::debug!(env = %name, "getting dependencies");
    Ok(get_environment(rt, name)?.manifest.dependency)
}

/// Host bindings of an environment's ports, named after the service that
/// listens on them.
pub fn list_env_port_bindings(
    rt: &dyn ContainerRuntime,
    name: &str,
) -> Result<Vec<PortBinding>, CoreError> {
    tracing::debug!(env = %name, "getting port bindings");
    let details = inspect_environment(rt, name)?;

    let mut names: BTreeMap<u16, String> = BTreeMap::from([
        (SSH_PORT_IN_CONTAINER, "ssh".to_owned()),
        (JUPYTER_PORT_IN_CONTAINER, "jupyter".to_owned()),
        (RSTUDIO_PORT_IN_CONTAINER, "rstudio".to_owned()),
    ]);
    if let Some(graph) = graph_from_labels(&details.labels)? {
        for item in graph.exposed_ports {
            if !item.service_name.is_empty() {
                names.insert(item.envd_port, item.service_name);
            }
        }
    }

    Ok(details
        .port_bindings
        .iter()
        .map(|b| PortBinding {
            name: names
                .get(&b.container_port)
                .cloned()
                .unwrap_or_else(|| format!("port-{}", b.container_port)),
            port: b.container_port,
            protocol: b.protocol.clone(),
            host_ip: b.host_ip.clone(),
            host_port: b.host_port,
        })
        .collect())
}
