//! Host-side resource planning for a new environment: bind mounts and
//! port bindings.

use crate::CoreError;
use envd_runtime::{BindMount, PortMapping};
use envd_schema::{
    workdir_for, BuildGraph, MountDecl, ServicePort, JUPYTER_PORT_IN_CONTAINER, LOCALHOST,
    RSTUDIO_PORT_IN_CONTAINER, SSH_PORT_IN_CONTAINER,
};
use std::collections::BTreeMap;

/// Bind mounts in the order the container receives them: user mount
/// options, then the graph's declared mounts, then the build context on the
/// working directory.
pub fn compose_mounts(
    mount_options: &[String],
    graph: &BuildGraph,
    build_context: &str,
) -> Result<Vec<BindMount>, CoreError> {
    let mut mounts = Vec::with_capacity(mount_options.len() + graph.mounts.len() + 1);

    for option in mount_options {
        let decl = MountDecl::parse(option).map_err(|_| {
            CoreError::InvalidOptions(format!(
                "invalid mount option '{option}', expected '<host>:<container>'"
            ))
        })?;
        tracing::debug!(source = %decl.source, target = %decl.destination, "adding mount option");
        mounts.push(BindMount {
            source: decl.source,
            target: decl.destination,
            read_only: false,
        });
    }

    for m in &graph.mounts {
        tracing::debug!(source = %m.source, target = %m.destination, "adding declared mount");
        mounts.push(BindMount {
            source: m.source.clone(),
            target: m.destination.clone(),
            read_only: false,
        });
    }

    let workdir = workdir_for(build_context);
    tracing::debug!(source = %build_context, target = %workdir, "mounting build context");
    mounts.push(BindMount {
        source: build_context.to_owned(),
        target: workdir,
        read_only: false,
    });
    Ok(mounts)
}

/// Port layout of a new environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPlan {
    /// One binding per container port, sorted by container port.
    pub bindings: Vec<PortMapping>,
    /// Container ports the image does not necessarily expose itself.
    pub exposed: Vec<u16>,
    pub jupyter_port: Option<u16>,
    pub rstudio_port: Option<u16>,
    /// Host ports by service name, ssh first.
    pub services: Vec<ServicePort>,
}

/// Assign host ports for SSH and every service the graph declares.
///
/// `alloc` hands out a free host port whenever the graph pins none. Among
/// exposures a later binding of the same container port replaces an earlier
/// one, but none may take the SSH port or the port of an enabled Jupyter or
/// RStudio service.
pub fn plan_ports<F>(
    graph: &BuildGraph,
    sshd_host: &str,
    ssh_port: u16,
    mut alloc: F,
) -> Result<PortPlan, CoreError>
where
    F: FnMut() -> std::io::Result<u16>,
{
    let mut reserved = vec![(SSH_PORT_IN_CONTAINER, "ssh")];
    if graph.jupyter.is_some() {
        reserved.push((JUPYTER_PORT_IN_CONTAINER, "jupyter"));
    }
    if graph.rstudio.is_some() {
        reserved.push((RSTUDIO_PORT_IN_CONTAINER, "rstudio"));
    }
    for item in &graph.exposed_ports {
        if let Some((_, owner)) = reserved.iter().find(|(p, _)| *p == item.envd_port) {
            return Err(CoreError::InvalidOptions(format!(
                "exposed port {} is reserved for {owner}",
                item.envd_port
            )));
        }
    }

    let mut bindings: BTreeMap<u16, PortMapping> = BTreeMap::new();
    let mut exposed = Vec::new();
    let mut services = vec![ServicePort {
        name: "ssh".to_owned(),
        port: ssh_port,
    }];
    bindings.insert(
        SSH_PORT_IN_CONTAINER,
        PortMapping::tcp(SSH_PORT_IN_CONTAINER, sshd_host, ssh_port),
    );

    let mut bind = |name: String, container_port: u16, host_ip: &str, host_port: u16| {
        bindings.insert(
            container_port,
            PortMapping::tcp(container_port, host_ip, host_port),
        );
        if !exposed.contains(&container_port) {
            exposed.push(container_port);
        }
        services.push(ServicePort {
            name,
            port: host_port,
        });
    };

    let mut jupyter_port = None;
    if let Some(jupyter) = &graph.jupyter {
        let port = if jupyter.port == 0 { alloc()? } else { jupyter.port };
        bind("jupyter".to_owned(), JUPYTER_PORT_IN_CONTAINER, LOCALHOST, port);
        jupyter_port = Some(port);
    }

    let mut rstudio_port = None;
    if graph.rstudio.is_some() {
        let port = alloc()?;
        bind("rstudio".to_owned(), RSTUDIO_PORT_IN_CONTAINER, LOCALHOST, port);
        rstudio_port = Some(port);
    }

    for item in &graph.exposed_ports {
        let port = if item.host_port == 0 {
            alloc()?
        } else {
            item.host_port
        };
        let name = if item.service_name.is_empty() {
            format!("port-{}", item.envd_port)
        } else {
            item.service_name.clone()
        };
        let addr = item.listening_addr.as_deref().unwrap_or(LOCALHOST);
        bind(name, item.envd_port, addr, port);
    }

    Ok(PortPlan {
        bindings: bindings.into_values().collect(),
        exposed,
        jupyter_port,
        rstudio_port,
        services,
    })
}
