use crate::compose::ConfigurationSet;
use crate::engine::Engine;
use crate::error::SimdockError;
use crate::runner::CommandRunner;
use serde::Serialize;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    NotExists,
    Stopped,
    Running,
}

impl ContainerStatus {
    pub fn from_state(name: &str, state: Option<&str>) -> Result<Self, SimdockError> {
        match state.map(str::trim) {
            None => Ok(Self::NotExists),
            Some("created") | Some("exited") => Ok(Self::Stopped),
            Some("running") => Ok(Self::Running),
            Some(other) => Err(SimdockError::UnknownContainerState {
                name: name.to_string(),
                state: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotExists => "not-exists",
            Self::Stopped => "stopped",
            Self::Running => "running",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub name: String,
    pub status: ContainerStatus,
}

/// The engine's state string as reported, for commands that only inspect,
/// stop or remove and so must work whatever state a container is in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerObservation {
    pub name: String,
    pub state: Option<String>,
}

impl ContainerObservation {
    pub fn exists(&self) -> bool {
        self.state.is_some()
    }

    /// States in which the container still holds its processes.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state.as_deref(),
            Some("running") | Some("restarting") | Some("paused")
        )
    }

    pub fn state_label(&self) -> &str {
        self.state.as_deref().unwrap_or("not-exists")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleAction {
    CreateAndRun,
    StartAndAttach,
    AttachOnly,
}

pub fn select_action(status: ContainerStatus) -> LifecycleAction {
    match status {
        ContainerStatus::NotExists => LifecycleAction::CreateAndRun,
        ContainerStatus::Stopped => LifecycleAction::StartAndAttach,
        ContainerStatus::Running => LifecycleAction::AttachOnly,
    }
}

pub fn sidecar_name(primary: &str, service: &str) -> String {
    format!("{primary}-{service}")
}

#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub config: &'a ConfigurationSet,
    pub command: &'a [String],
    pub shell: &'a str,
    pub tty: bool,
    pub detach: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub container: String,
    pub previous_status: ContainerStatus,
    pub action: LifecycleAction,
}

pub struct LifecycleManager<'e, 'r, R: CommandRunner> {
    engine: &'e Engine<'r, R>,
}

impl<'e, 'r, R: CommandRunner> LifecycleManager<'e, 'r, R> {
    pub fn new(engine: &'e Engine<'r, R>) -> Self {
        Self { engine }
    }

    /// Always asks the engine; nothing about containers is remembered between calls.
    pub fn record(&self, name: &str) -> Result<ContainerRecord, SimdockError> {
        let observed = self.observe(name)?;
        Ok(ContainerRecord {
            status: ContainerStatus::from_state(name, observed.state.as_deref())?,
            name: observed.name,
        })
    }

    pub fn observe(&self, name: &str) -> Result<ContainerObservation, SimdockError> {
        let state = self.engine.inspect_state(name)?;
        Ok(ContainerObservation {
            name: name.to_string(),
            state: state.map(|state| state.trim().to_string()),
        })
    }

    pub fn converge(&self, launch: &LaunchSpec<'_>) -> Result<LifecycleReport, SimdockError> {
        let record = self.record(launch.name)?;
        let action = select_action(record.status);
        info!(container = launch.name, status = %record.status, ?action, "converging container");
        match action {
            LifecycleAction::CreateAndRun => {
                self.engine
                    .run_container(run_args(launch), launch.detach)?;
            }
            LifecycleAction::StartAndAttach => {
                self.engine.start(launch.name)?;
                if !launch.detach {
                    self.attach(launch.name, launch.tty, launch.shell)?;
                }
            }
            LifecycleAction::AttachOnly => {
                if !launch.detach {
                    self.attach(launch.name, launch.tty, launch.shell)?;
                }
            }
        }
        Ok(LifecycleReport {
            container: launch.name.to_string(),
            previous_status: record.status,
            action,
        })
    }

    /// Sidecars never attach: create detached, start if stopped, leave running ones alone.
    pub fn converge_sidecar(
        &self,
        name: &str,
        image: &str,
        config: &ConfigurationSet,
        command: &[String],
    ) -> Result<LifecycleReport, SimdockError> {
        let record = self.record(name)?;
        let action = select_action(record.status);
        match action {
            LifecycleAction::CreateAndRun => {
                let launch = LaunchSpec {
                    name,
                    image,
                    config,
                    command,
                    shell: "",
                    tty: false,
                    detach: true,
                };
                self.engine.run_container(run_args(&launch), true)?;
            }
            LifecycleAction::StartAndAttach => self.engine.start(name)?,
            LifecycleAction::AttachOnly => {}
        }
        info!(sidecar = name, status = %record.status, ?action, "sidecar converged");
        Ok(LifecycleReport {
            container: name.to_string(),
            previous_status: record.status,
            action,
        })
    }

    pub fn attach(&self, name: &str, tty: bool, shell: &str) -> Result<(), SimdockError> {
        self.engine.exec(name, tty, &[shell.to_string()])
    }

    pub fn stop_if_active(&self, name: &str) -> Result<ContainerObservation, SimdockError> {
        let observed = self.observe(name)?;
        if observed.is_active() {
            self.engine.stop(name)?;
            info!(container = name, state = observed.state_label(), "stopped");
        }
        Ok(observed)
    }

    /// `rm -f` handles every state, so only absence is skipped.
    pub fn remove_if_present(&self, name: &str) -> Result<ContainerObservation, SimdockError> {
        let observed = self.observe(name)?;
        if observed.exists() {
            self.engine.remove(name)?;
            info!(container = name, state = observed.state_label(), "removed");
        }
        Ok(observed)
    }
}

pub fn run_args(launch: &LaunchSpec<'_>) -> Vec<String> {
    let mode = if launch.detach {
        "-d"
    } else if launch.tty {
        "-it"
    } else {
        "-i"
    };
    let mut args = vec![
        mode.to_string(),
        "--name".to_string(),
        launch.name.to_string(),
    ];
    args.extend(launch.config.to_run_args());
    args.push(launch.image.to_string());
    args.extend(launch.command.iter().cloned());
    args
}
