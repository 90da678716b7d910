use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Observed state of an environment. Mirrors the container runtime's own
/// state vocabulary; `NotCreated` stands for "the runtime has no such object".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EnvStatus {
    NotCreated,
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl EnvStatus {
    /// Whether the runtime reports the process as alive. A paused container
    /// is still alive; its processes are frozen, not stopped.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            EnvStatus::Running | EnvStatus::Paused | EnvStatus::Restarting
        )
    }

    pub fn can_transition_to(self, to: EnvStatus) -> bool {
        validate_transition(self, to).is_ok()
    }
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvStatus::NotCreated => write!(f, "not-created"),
            EnvStatus::Created => write!(f, "created"),
            EnvStatus::Running => write!(f, "running"),
            EnvStatus::Paused => write!(f, "paused"),
            EnvStatus::Restarting => write!(f, "restarting"),
            EnvStatus::Removing => write!(f, "removing"),
            EnvStatus::Exited => write!(f, "exited"),
            EnvStatus::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown environment status: '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for EnvStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "not-created" => Ok(EnvStatus::NotCreated),
            "created" => Ok(EnvStatus::Created),
            "running" => Ok(EnvStatus::Running),
            "paused" => Ok(EnvStatus::Paused),
            "restarting" => Ok(EnvStatus::Restarting),
            "removing" => Ok(EnvStatus::Removing),
            "exited" => Ok(EnvStatus::Exited),
            "dead" => Ok(EnvStatus::Dead),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid state transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: EnvStatus,
    pub to: EnvStatus,
}

/// Check a state change against the environment state machine.
///
/// `NotCreated -> Created -> Running <-> Paused`, live states go through
/// `Removing` back to `NotCreated`, and the runtime may move any created or
/// live object to `Exited` or `Dead` on its own.
pub fn validate_transition(from: EnvStatus, to: EnvStatus) -> Result<(), TransitionError> {
    use EnvStatus::{Created, Dead, Exited, NotCreated, Paused, Removing, Restarting, Running};

    let valid = matches!(
        (from, to),
        (NotCreated, Created)
            | (Created | Exited | Restarting | Paused, Running)
            | (Running, Paused | Restarting)
            | (
                Created | Running | Paused | Restarting | Exited | Dead,
                Removing
            )
            | (Removing, NotCreated)
            | (NotCreated | Created | Running | Paused | Restarting, Exited | Dead)
    );

    if valid {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}
