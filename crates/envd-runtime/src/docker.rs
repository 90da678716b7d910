use crate::backend::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ImageDetails, PortMapping, RuntimeInfo,
};
use crate::RuntimeError;
use chrono::{DateTime, Utc};
use envd_schema::{ContainerId, EnvStatus, ImageId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::process::{Command, Output, Stdio};
use tracing::debug;

const DEFAULT_DOCKER_BIN: &str = "docker";

/// Drives the Docker daemon through the `docker` CLI.
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self {
            binary: DEFAULT_DOCKER_BIN.to_owned(),
        }
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn output(&self, args: &[String]) -> Result<Output, RuntimeError> {
        debug!(bin = %self.binary, args = ?args, "docker");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("{}: {e}", self.binary))
                } else {
                    RuntimeError::Io(e)
                }
            })
    }

    /// Run a command, classifying a non-zero exit by its stderr.
    fn run(&self, target: &str, args: &[String]) -> Result<String, RuntimeError> {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(RuntimeError::classify(
                target,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn ids(&self, args: &[String]) -> Result<Vec<String>, RuntimeError> {
        let stdout = self.run("", args)?;
        let mut ids: Vec<String> = Vec::new();
        for id in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_owned());
            }
        }
        Ok(ids)
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let stdout = self.run("", &args(["info", "--format", "{{json .}}"]))?;
        let value: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| RuntimeError::Parse(format!("docker info: {e}")))?;
        Ok(parse_info(&value))
    }

    fn inspect_container(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let stdout = self.run(name, &args(["container", "inspect", name]))?;
        parse_container_list(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let stdout = self.run(&spec.name, &create_args(spec))?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(RuntimeError::Parse(
                "docker create printed no container id".to_owned(),
            ));
        }
        Ok(ContainerId::new(id))
    }

    fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(name, &args(["start", name])).map(drop)
    }

    fn pause_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(name, &args(["pause", name])).map(drop)
    }

    fn unpause_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(name, &args(["unpause", name])).map(drop)
    }

    fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(name, &args(["kill", "--signal", "KILL", name]))
            .map(drop)
    }

    fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let mut cmd = args(["rm"]);
        if force {
            cmd.push("--force".to_owned());
        }
        cmd.push(name.to_owned());
        self.run(name, &cmd).map(drop)
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerDetails>, RuntimeError> {
        let filter = format!("label={label}");
        let ids = self.ids(&args(["ps", "--all", "--quiet", "--no-trunc", "--filter", &filter]))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["container", "inspect"]);
        cmd.extend(ids);
        parse_container_list(&self.run("", &cmd)?)
    }

    fn inspect_image(&self, reference: &str) -> Result<ImageDetails, RuntimeError> {
        let stdout = self.run(reference, &args(["image", "inspect", reference]))?;
        parse_image_list(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound(reference.to_owned()))
    }

    fn list_images(&self, label: &str) -> Result<Vec<ImageDetails>, RuntimeError> {
        let filter = format!("label={label}");
        let ids = self.ids(&args(["images", "--quiet", "--no-trunc", "--filter", &filter]))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["image", "inspect"]);
        cmd.extend(ids);
        parse_image_list(&self.run("", &cmd)?)
    }

    fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.run(reference, &args(["rmi", reference])).map(drop)
    }
}

/// Arguments for `docker create`, image last.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut a = args(["create", "--name", &spec.name]);
    let mut push = |flag: &str, value: String| {
        a.push(flag.to_owned());
        a.push(value);
    };

    if !spec.working_dir.is_empty() {
        push("--workdir", spec.working_dir.clone());
    }
    if !spec.restart_policy.is_empty() {
        push("--restart", spec.restart_policy.clone());
    }
    for (k, v) in &spec.labels {
        push("--label", format!("{k}={v}"));
    }
    for port in &spec.exposed_ports {
        push("--expose", format!("{port}/tcp"));
    }
    for p in &spec.port_bindings {
        let host = if p.host_ip.is_empty() {
            p.host_port.to_string()
        } else {
            format!("{}:{}", p.host_ip, p.host_port)
        };
        push("--publish", format!("{host}:{}/{}", p.container_port, p.protocol));
    }
    for m in &spec.mounts {
        let mut value = format!("type=bind,source={},target={}", m.source, m.target);
        if m.read_only {
            value.push_str(",readonly");
        }
        push("--mount", value);
    }
    if let Some(bytes) = spec.shm_size_bytes {
        push("--shm-size", format!("{bytes}b"));
    }
    for req in &spec.device_requests {
        push("--gpus", req.to_cli_value());
    }
    if let Some(cpus) = &spec.cpus {
        push("--cpus", cpus.clone());
    }
    if let Some(cpuset) = &spec.cpuset {
        push("--cpuset-cpus", cpuset.clone());
    }
    if let Some(memory) = &spec.memory {
        push("--memory", memory.clone());
    }

    a.push(spec.image.clone());
    a
}

fn str_field<'a>(v: &'a Value, path: &[&str]) -> &'a str {
    path.iter()
        .try_fold(v, |cur, key| cur.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn string_map(v: Option<&Value>) -> BTreeMap<String, String> {
    v.and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn json_array(stdout: &str, what: &str) -> Result<Vec<Value>, RuntimeError> {
    serde_json::from_str(stdout.trim())
        .map_err(|e| RuntimeError::Parse(format!("{what} inspect: {e}")))
}

/// Parse `docker container inspect` output.
pub fn parse_container_list(stdout: &str) -> Result<Vec<ContainerDetails>, RuntimeError> {
    json_array(stdout, "container")?
        .iter()
        .map(parse_container)
        .collect()
}

fn parse_container(v: &Value) -> Result<ContainerDetails, RuntimeError> {
    let raw_status = str_field(v, &["State", "Status"]);
    let status = raw_status
        .parse::<EnvStatus>()
        .map_err(|e| RuntimeError::Parse(e.to_string()))?;

    // When a port has several bindings the last one wins.
    let mut port_bindings = Vec::new();
    if let Some(map) = v
        .get("HostConfig")
        .and_then(|h| h.get("PortBindings"))
        .and_then(Value::as_object)
    {
        for (key, bindings) in map {
            let Some(last) = bindings.as_array().and_then(|b| b.last()) else {
                continue;
            };
            let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let Ok(container_port) = port.parse() else {
                continue;
            };
            port_bindings.push(PortMapping {
                container_port,
                protocol: proto.to_owned(),
                host_ip: str_field(last, &["HostIp"]).to_owned(),
                host_port: str_field(last, &["HostPort"]).parse().unwrap_or(0),
            });
        }
    }
    port_bindings.sort_by_key(|p| p.container_port);

    Ok(ContainerDetails {
        id: ContainerId::new(str_field(v, &["Id"])),
        name: str_field(v, &["Name"]).trim_start_matches('/').to_owned(),
        image: str_field(v, &["Config", "Image"]).to_owned(),
        status,
        labels: string_map(v.get("Config").and_then(|c| c.get("Labels"))),
        port_bindings,
        ip_address: str_field(v, &["NetworkSettings", "IPAddress"]).to_owned(),
    })
}

/// Parse `docker image inspect` output.
pub fn parse_image_list(stdout: &str) -> Result<Vec<ImageDetails>, RuntimeError> {
    Ok(json_array(stdout, "image")?
        .iter()
        .map(|v| ImageDetails {
            id: ImageId::new(str_field(v, &["Id"])),
            repo_tags: v
                .get("RepoTags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            size: v.get("Size").and_then(Value::as_u64).unwrap_or(0),
            created: DateTime::parse_from_rfc3339(str_field(v, &["Created"]))
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            labels: string_map(v.get("Config").and_then(|c| c.get("Labels"))),
        })
        .collect())
}

fn parse_info(v: &Value) -> RuntimeInfo {
    let runtimes: HashMap<String, String> = v
        .get("Runtimes")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(name, rt)| (name.clone(), str_field(rt, &["path"]).to_owned()))
                .collect()
        })
        .unwrap_or_default();

    RuntimeInfo {
        name: "docker".to_owned(),
        server_version: str_field(v, &["ServerVersion"]).to_owned(),
        operating_system: str_field(v, &["OperatingSystem"]).to_owned(),
        kernel_version: str_field(v, &["KernelVersion"]).to_owned(),
        default_runtime: str_field(v, &["DefaultRuntime"]).to_owned(),
        ncpu: v.get("NCPU").and_then(Value::as_u64).unwrap_or(0),
        mem_total: v.get("MemTotal").and_then(Value::as_u64).unwrap_or(0),
        runtimes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BindMount;
    use envd_schema::default_device_requests;

    const CONTAINER_JSON: &str = r#"[{
        "Id": "4f66ad9a0b2e",
        "Name": "/mnist",
        "State": {"Status": "running", "Running": true, "Paused": false},
        "Config": {
            "Image": "mnist:dev",
            "Labels": {"ai.tensorchord.envd.name": "mnist", "ai.tensorchord.envd.ssh.port": "40022"}
        },
        "HostConfig": {
            "PortBindings": {
                "2222/tcp": [{"HostIp": "127.0.0.1", "HostPort": "40022"}],
                "8888/tcp": [
                    {"HostIp": "0.0.0.0", "HostPort": "18888"},
                    {"HostIp": "127.0.0.1", "HostPort": "28888"}
                ]
            }
        },
        "NetworkSettings": {"IPAddress": "172.17.0.2"}
    }]"#;

    #[test]
    fn parse_inspected_container() {
        let list = parse_container_list(CONTAINER_JSON).unwrap();
        assert_eq!(list.len(), 1);
        let c = &list[0];
        assert_eq!(c.name, "mnist");
        assert_eq!(c.image, "mnist:dev");
        assert_eq!(c.status, EnvStatus::Running);
        assert!(c.is_running());
        assert_eq!(c.ip_address, "172.17.0.2");
        assert_eq!(c.labels["ai.tensorchord.envd.ssh.port"], "40022");
    }

    #[test]
    fn last_port_binding_wins() {
        let c = &parse_container_list(CONTAINER_JSON).unwrap()[0];
        assert_eq!(
            c.port_bindings,
            vec![
                PortMapping::tcp(2222, "127.0.0.1", 40022),
                PortMapping::tcp(8888, "127.0.0.1", 28888),
            ]
        );
    }

    #[test]
    fn unknown_state_is_a_parse_error() {
        let json = r#"[{"Id": "x", "Name": "/x", "State": {"Status": "hibernating"}}]"#;
        assert!(matches!(
            parse_container_list(json),
            Err(RuntimeError::Parse(_))
        ));
    }

    #[test]
    fn parse_inspected_image() {
        let json = r#"[{
            "Id": "sha256:0123456789abcdef",
            "RepoTags": ["mnist:dev", "mnist:latest"],
            "Size": 1048576,
            "Created": "2024-03-01T12:30:00.123456789Z",
            "Config": {"Labels": {"ai.tensorchord.envd.vendor": "envd"}}
        }, {
            "Id": "sha256:fedcba",
            "RepoTags": [],
            "Size": 10,
            "Created": "",
            "Config": {"Labels": null}
        }]"#;
        let images = parse_image_list(json).unwrap();
        assert_eq!(images[0].repo_tags, vec!["mnist:dev", "mnist:latest"]);
        assert_eq!(images[0].size, 1_048_576);
        assert!(images[0].created.is_some());
        assert_eq!(images[0].labels["ai.tensorchord.envd.vendor"], "envd");
        assert!(images[1].created.is_none());
        assert!(images[1].labels.is_empty());
    }

    #[test]
    fn parse_daemon_info() {
        let json: Value = serde_json::from_str(
            r#"{
                "ServerVersion": "24.0.7",
                "KernelVersion": "5.15.0-microsoft-standard-WSL2",
                "OperatingSystem": "Docker Desktop",
                "DefaultRuntime": "runc",
                "NCPU": 8,
                "MemTotal": 16000000000,
                "Runtimes": {"nvidia": {"path": "nvidia-container-runtime"}, "runc": {"path": "runc"}}
            }"#,
        )
        .unwrap();
        let info = parse_info(&json);
        assert_eq!(info.runtimes["nvidia"], "nvidia-container-runtime");
        assert_eq!(info.ncpu, 8);
        assert!(info.kernel_version.contains("WSL2"));
    }

    #[test]
    fn create_args_cover_spec() {
        let mut labels = BTreeMap::new();
        labels.insert("ai.tensorchord.envd.name".to_owned(), "mnist".to_owned());
        let spec = ContainerSpec {
            name: "mnist".to_owned(),
            image: "mnist:dev".to_owned(),
            working_dir: "/home/envd/mnist".to_owned(),
            labels,
            exposed_ports: vec![8888],
            port_bindings: vec![PortMapping::tcp(2222, "127.0.0.1", 40022)],
            mounts: vec![BindMount {
                source: "/src/mnist".to_owned(),
                target: "/home/envd/mnist".to_owned(),
                read_only: false,
            }],
            restart_policy: "always".to_owned(),
            shm_size_bytes: Some(64 * 1024 * 1024),
            device_requests: default_device_requests(2),
            cpus: Some("2".to_owned()),
            cpuset: None,
            memory: Some("4g".to_owned()),
        };
        let a = create_args(&spec);
        let joined = a.join(" ");
        assert!(joined.starts_with("create --name mnist --workdir /home/envd/mnist --restart always"));
        assert!(joined.contains("--label ai.tensorchord.envd.name=mnist"));
        assert!(joined.contains("--expose 8888/tcp"));
        assert!(joined.contains("--publish 127.0.0.1:40022:2222/tcp"));
        assert!(joined.contains("--mount type=bind,source=/src/mnist,target=/home/envd/mnist"));
        assert!(joined.contains("--shm-size 67108864b"));
        assert!(joined.contains("--gpus count=2,driver=nvidia,"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--memory 4g"));
        assert!(!joined.contains("--cpuset-cpus"));
        assert_eq!(a.last().map(String::as_str), Some("mnist:dev"));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let rt = DockerRuntime::with_binary("/nonexistent/envd-test-docker");
        assert!(matches!(
            rt.inspect_container("demo"),
            Err(RuntimeError::Unavailable(_))
        ));
    }
}
