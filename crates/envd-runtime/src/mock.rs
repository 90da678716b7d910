use crate::backend::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ImageDetails, PortMapping, RuntimeInfo,
};
use crate::RuntimeError;
use chrono::Utc;
use envd_schema::{validate_transition, ContainerId, EnvStatus, ImageId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

struct MockContainer {
    details: ContainerDetails,
    spec: ContainerSpec,
    /// Inspections left before a started container reports running.
    /// `None` means it never does.
    pending: Option<u32>,
}

struct MockState {
    containers: HashMap<String, MockContainer>,
    images: BTreeMap<String, ImageDetails>,
    occupied_ports: HashSet<u16>,
    runtimes: HashMap<String, String>,
    kernel_version: String,
    start_delay: Option<u32>,
    next_id: u64,
}

/// In-memory container runtime.
///
/// Enforces the environment state machine on every transition and records
/// each created spec. Clones share state, so a test can keep a handle while
/// the engine owns another.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                containers: HashMap::new(),
                images: BTreeMap::new(),
                occupied_ports: HashSet::new(),
                runtimes: HashMap::from([("runc".to_owned(), "runc".to_owned())]),
                kernel_version: "6.1.0-mock".to_owned(),
                start_delay: Some(0),
                next_id: 1,
            })),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    /// Started containers report running only after `polls` inspections.
    #[must_use]
    pub fn with_start_delay(self, polls: u32) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.start_delay = Some(polls);
        }
        self
    }

    /// Started containers never reach running.
    #[must_use]
    pub fn never_running(self) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.start_delay = None;
        }
        self
    }

    /// Register an OCI runtime, e.g. `nvidia`.
    #[must_use]
    pub fn with_oci_runtime(self, name: &str, path: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.runtimes.insert(name.to_owned(), path.to_owned());
        }
        self
    }

    #[must_use]
    pub fn with_kernel_version(self, version: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            version.clone_into(&mut s.kernel_version);
        }
        self
    }

    /// Mark a host port as taken by something outside the runtime.
    pub fn occupy_port(&self, port: u16) {
        if let Ok(mut s) = self.state.lock() {
            s.occupied_ports.insert(port);
        }
    }

    pub fn add_image(&self, reference: &str, labels: BTreeMap<String, String>) {
        if let Ok(mut s) = self.state.lock() {
            let id = ImageId::new(format!("sha256:{:064x}", s.next_id));
            s.next_id += 1;
            s.images.insert(
                reference.to_owned(),
                ImageDetails {
                    id,
                    repo_tags: vec![reference.to_owned()],
                    size: 1024 * 1024,
                    created: Some(Utc::now()),
                    labels,
                },
            );
        }
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state
            .lock()
            .is_ok_and(|s| s.images.contains_key(reference))
    }

    /// Spec the named container was created from.
    pub fn created_spec(&self, name: &str) -> Option<ContainerSpec> {
        let s = self.state.lock().ok()?;
        s.containers.get(name).map(|c| c.spec.clone())
    }

    /// Apply a runtime-side transition, e.g. the process exiting.
    pub fn set_status(&self, name: &str, to: EnvStatus) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        let c = find_mut(&mut s, name)?;
        validate_transition(c.details.status, to)?;
        c.details.status = to;
        Ok(())
    }
}

fn find_mut<'a>(s: &'a mut MockState, name: &str) -> Result<&'a mut MockContainer, RuntimeError> {
    let key = s
        .containers
        .iter()
        .find(|(n, c)| *n == name || c.details.id == *name)
        .map(|(n, _)| n.clone())
        .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))?;
    s.containers
        .get_mut(&key)
        .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))
}

fn label_matches(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((k, v)) => labels.get(k).is_some_and(|val| val == v),
        None => filter.is_empty() || labels.contains_key(filter),
    }
}

fn ports_in_use(s: &MockState, except: &str) -> HashSet<u16> {
    let mut used = s.occupied_ports.clone();
    for (name, c) in &s.containers {
        if name != except && c.details.status.is_live() {
            used.extend(c.details.port_bindings.iter().map(|p| p.host_port));
        }
    }
    used
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let s = self.lock()?;
        Ok(RuntimeInfo {
            name: "mock".to_owned(),
            server_version: "0.0.0-mock".to_owned(),
            operating_system: "mock".to_owned(),
            kernel_version: s.kernel_version.clone(),
            default_runtime: "runc".to_owned(),
            ncpu: 4,
            mem_total: 8 * 1024 * 1024 * 1024,
            runtimes: s.runtimes.clone(),
        })
    }

    fn inspect_container(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let mut s = self.lock()?;
        let c = find_mut(&mut s, name)?;
        if c.details.status == EnvStatus::Created {
            match c.pending {
                Some(0) => c.details.status = EnvStatus::Running,
                Some(n) => c.pending = Some(n - 1),
                None => {}
            }
        }
        Ok(c.details.clone())
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let mut s = self.lock()?;
        if s.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "the container name \"/{}\" is already in use",
                spec.name
            )));
        }
        validate_transition(EnvStatus::NotCreated, EnvStatus::Created)?;

        // Containers inherit the image's labels; their own take precedence.
        let mut labels = s
            .images
            .get(&spec.image)
            .map(|img| img.labels.clone())
            .unwrap_or_default();
        labels.extend(spec.labels.clone());

        let id = ContainerId::new(format!("{:064x}", s.next_id));
        s.next_id += 1;
        let details = ContainerDetails {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: EnvStatus::Created,
            labels,
            port_bindings: spec.port_bindings.clone(),
            ip_address: String::new(),
        };
        s.containers.insert(
            spec.name.clone(),
            MockContainer {
                details,
                spec: spec.clone(),
                pending: None,
            },
        );
        Ok(id)
    }

    fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        let delay = s.start_delay;
        let key = find_mut(&mut s, name)?.details.name.clone();
        let used = ports_in_use(&s, &key);
        let c = find_mut(&mut s, &key)?;
        if c.details.status == EnvStatus::Running {
            return Ok(());
        }
        if let Some(p) = c
            .details
            .port_bindings
            .iter()
            .find(|p: &&PortMapping| used.contains(&p.host_port))
        {
            return Err(RuntimeError::PortAllocated(format!(
                "Bind for {}:{} failed: port is already allocated",
                p.host_ip, p.host_port
            )));
        }
        "172.17.0.2".clone_into(&mut c.details.ip_address);
        match delay {
            Some(0) => {
                validate_transition(c.details.status, EnvStatus::Running)?;
                c.details.status = EnvStatus::Running;
            }
            other => c.pending = other,
        }
        Ok(())
    }

    fn pause_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        let c = find_mut(&mut s, name)?;
        match c.details.status {
            EnvStatus::Paused => Err(RuntimeError::AlreadyPaused(name.to_owned())),
            EnvStatus::Running => {
                validate_transition(EnvStatus::Running, EnvStatus::Paused)?;
                c.details.status = EnvStatus::Paused;
                Ok(())
            }
            _ => Err(RuntimeError::NotRunning(name.to_owned())),
        }
    }

    fn unpause_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        let c = find_mut(&mut s, name)?;
        if c.details.status != EnvStatus::Paused {
            return Err(RuntimeError::NotPaused(name.to_owned()));
        }
        validate_transition(EnvStatus::Paused, EnvStatus::Running)?;
        c.details.status = EnvStatus::Running;
        Ok(())
    }

    fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        let c = find_mut(&mut s, name)?;
        if !c.details.status.is_live() {
            return Err(RuntimeError::NotRunning(name.to_owned()));
        }
        validate_transition(c.details.status, EnvStatus::Exited)?;
        c.details.status = EnvStatus::Exited;
        Ok(())
    }

    fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        let c = find_mut(&mut s, name)?;
        if c.details.status.is_live() && !force {
            return Err(RuntimeError::Conflict(format!(
                "You cannot remove a running container {}",
                c.details.id
            )));
        }
        validate_transition(c.details.status, EnvStatus::Removing)?;
        c.details.status = EnvStatus::Removing;
        validate_transition(EnvStatus::Removing, EnvStatus::NotCreated)?;
        let key = c.details.name.clone();
        s.containers.remove(&key);
        Ok(())
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerDetails>, RuntimeError> {
        let s = self.lock()?;
        let mut list: Vec<ContainerDetails> = s
            .containers
            .values()
            .filter(|c| label_matches(&c.details.labels, label))
            .map(|c| c.details.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    fn inspect_image(&self, reference: &str) -> Result<ImageDetails, RuntimeError> {
        let s = self.lock()?;
        s.images
            .get(reference)
            .or_else(|| s.images.values().find(|i| i.id == *reference))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(reference.to_owned()))
    }

    fn list_images(&self, label: &str) -> Result<Vec<ImageDetails>, RuntimeError> {
        let s = self.lock()?;
        Ok(s.images
            .values()
            .filter(|i| label_matches(&i.labels, label))
            .cloned()
            .collect())
    }

    fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        if !s.images.contains_key(reference) {
            return Err(RuntimeError::NotFound(reference.to_owned()));
        }
        if s.containers.values().any(|c| c.details.image == reference) {
            return Err(RuntimeError::Conflict(format!(
                "unable to remove repository reference \"{reference}\": container is using its referenced image"
            )));
        }
        s.images.remove(reference);
        Ok(())
    }
}
