use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SSH_PORT_IN_CONTAINER: u16 = 2222;
pub const JUPYTER_PORT_IN_CONTAINER: u16 = 8888;
pub const RSTUDIO_PORT_IN_CONTAINER: u16 = 8787;
pub const LOCALHOST: &str = "127.0.0.1";

pub const DEFAULT_CONTEXT: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse context config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize context config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("context '{0}' not found")]
    UnknownContext(String),
    #[error("context '{0}' already exists")]
    DuplicateContext(String),
    #[error("HOME not set")]
    NoHome,
}

/// Which control plane runs environments for a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerType {
    #[default]
    #[serde(rename = "docker")]
    Docker,
    #[serde(rename = "envd-server")]
    EnvdServer,
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerType::Docker => write!(f, "docker"),
            RunnerType::EnvdServer => write!(f, "envd-server"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    #[serde(default)]
    pub runner: RunnerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
}

impl Context {
    pub fn docker(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            runner: RunnerType::Docker,
            runner_address: None,
            login_name: None,
            jwt_token: None,
        }
    }

    /// Host used to reach environments of this context over SSH.
    pub fn ssh_hostname(&self) -> String {
        let Some(addr) = &self.runner_address else {
            return "localhost".to_owned();
        };
        let rest = addr.split_once("://").map_or(addr.as_str(), |(_, r)| r);
        let host = rest.split(['/', ':']).next().unwrap_or(rest);
        if host.is_empty() {
            "localhost".to_owned()
        } else {
            host.to_owned()
        }
    }
}

/// Contexts known to this user, stored as `~/.config/envd/contexts.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    pub current: String,
    #[serde(default, rename = "context")]
    pub contexts: Vec<Context>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            current: DEFAULT_CONTEXT.to_owned(),
            contexts: vec![Context::docker(DEFAULT_CONTEXT)],
        }
    }
}

impl ContextConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
        Ok(PathBuf::from(home).join(".config/envd/contexts.toml"))
    }

    /// Load from `path`; a missing file yields the built-in default context.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&content)?;
        config.current_context()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::default_path()?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let content = toml::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
        Ok(())
    }

    pub fn current_context(&self) -> Result<&Context, ConfigError> {
        self.get(&self.current)
    }

    pub fn get(&self, name: &str) -> Result<&Context, ConfigError> {
        self.contexts
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::UnknownContext(name.to_owned()))
    }

    pub fn add(&mut self, context: Context) -> Result<(), ConfigError> {
        if self.contexts.iter().any(|c| c.name == context.name) {
            return Err(ConfigError::DuplicateContext(context.name));
        }
        self.contexts.push(context);
        Ok(())
    }

    pub fn use_context(&mut self, name: &str) -> Result<(), ConfigError> {
        self.get(name)?;
        name.clone_into(&mut self.current);
        Ok(())
    }
}
