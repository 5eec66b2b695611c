use crate::capability::{CapabilitySnapshot, GpuKind, HostIdentity, OsKind};
use crate::config::{Config, Profile, ServiceConfig};
use crate::error::{Degradation, SimdockError};
use crate::runner::CommandRunner;
use crate::workspace::WorkspaceDirectory;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

pub const ENV_HOST_UID: &str = "SIMDOCK_HOST_UID";
pub const ENV_HOST_GID: &str = "SIMDOCK_HOST_GID";
pub const ENV_ACCOUNT: &str = "SIMDOCK_ACCOUNT";
pub const ENV_WORKSPACE: &str = "SIMDOCK_WORKSPACE";
pub const ENV_RELAX_DEVICES: &str = "SIMDOCK_RELAX_DEVICES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Flag,
    Network,
    Env,
    Volume,
    Device,
    Port,
}

/// Container launch options grouped by category.
///
/// List categories only ever grow and never hold the same fragment twice. Env
/// is keyed by variable name, so setting a name again replaces its value in
/// place. `network` is the only single-valued category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigurationSet {
    flags: Vec<String>,
    network: Option<String>,
    env: Vec<(String, String)>,
    volumes: Vec<String>,
    devices: Vec<String>,
    ports: Vec<String>,
}

fn push_unique(list: &mut Vec<String>, fragment: String) {
    if !list.iter().any(|existing| *existing == fragment) {
        list.push(fragment);
    }
}

impl ConfigurationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_flag(&mut self, flag: impl Into<String>) -> &mut Self {
        push_unique(&mut self.flags, flag.into());
        self
    }

    pub fn set_network(&mut self, mode: impl Into<String>) -> &mut Self {
        let mode = mode.into();
        if let Some(previous) = self.network.as_deref() {
            if previous != mode {
                debug!(previous, replacement = %mode, "network mode overridden");
            }
        }
        self.network = Some(mode);
        self
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    pub fn add_volume(&mut self, entry: impl Into<String>) -> &mut Self {
        push_unique(&mut self.volumes, entry.into());
        self
    }

    pub fn add_device(&mut self, entry: impl Into<String>) -> &mut Self {
        push_unique(&mut self.devices, entry.into());
        self
    }

    pub fn add_port(&mut self, entry: impl Into<String>) -> &mut Self {
        push_unique(&mut self.ports, entry.into());
        self
    }

    pub fn merge(&mut self, other: &ConfigurationSet) -> &mut Self {
        for flag in &other.flags {
            self.add_flag(flag.clone());
        }
        if let Some(network) = &other.network {
            self.set_network(network.clone());
        }
        for (key, value) in &other.env {
            self.set_env(key.clone(), value.clone());
        }
        for volume in &other.volumes {
            self.add_volume(volume.clone());
        }
        for device in &other.devices {
            self.add_device(device.clone());
        }
        for port in &other.ports {
            self.add_port(port.clone());
        }
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn fragments(&self, category: Category) -> Vec<String> {
        match category {
            Category::Flag => self.flags.clone(),
            Category::Network => self.network.iter().cloned().collect(),
            Category::Env => self
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
            Category::Volume => self.volumes.clone(),
            Category::Device => self.devices.clone(),
            Category::Port => self.ports.clone(),
        }
    }

    pub fn contains(&self, category: Category, fragment: &str) -> bool {
        self.fragments(category).iter().any(|item| item == fragment)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn to_run_args(&self) -> Vec<String> {
        let mut args = self.flags.clone();
        if let Some(network) = &self.network {
            args.push(format!("--network={network}"));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for device in &self.devices {
            args.push("--device".to_string());
            args.push(device.clone());
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccelerationMode {
    NvidiaWsl,
    Nvidia,
    DirectRendering,
    CpuOnly,
}

impl fmt::Display for AccelerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NvidiaWsl => "nvidia-wsl",
            Self::Nvidia => "nvidia",
            Self::DirectRendering => "direct-rendering",
            Self::CpuOnly => "cpu-only",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ProvisionStep {
    RelaxDevice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OsMatch {
    Only(OsKind),
    Any,
}

impl OsMatch {
    fn matches(self, os: OsKind) -> bool {
        match self {
            Self::Only(kind) => kind == os,
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleFragment {
    Flag(&'static str),
    Env(&'static str, &'static str),
    Volume(&'static str),
    Device(&'static str),
    GpuRuntime,
    Provision(&'static str),
}

#[derive(Debug)]
struct GpuRule {
    os: OsMatch,
    gpu: GpuKind,
    mode: AccelerationMode,
    fragments: &'static [RuleFragment],
}

const GPU_RULES: &[GpuRule] = &[
    GpuRule {
        os: OsMatch::Only(OsKind::Wsl),
        gpu: GpuKind::Nvidia,
        mode: AccelerationMode::NvidiaWsl,
        fragments: &[
            RuleFragment::Flag("--gpus=all"),
            RuleFragment::Env("NVIDIA_VISIBLE_DEVICES", "all"),
            RuleFragment::Env("NVIDIA_DRIVER_CAPABILITIES", "all"),
            RuleFragment::Env("LD_LIBRARY_PATH", "/usr/lib/wsl/lib"),
            RuleFragment::Device("/dev/dxg"),
            RuleFragment::Volume("/usr/lib/wsl:/usr/lib/wsl:ro"),
            RuleFragment::Provision("/dev/dxg"),
        ],
    },
    GpuRule {
        os: OsMatch::Any,
        gpu: GpuKind::Nvidia,
        mode: AccelerationMode::Nvidia,
        fragments: &[
            RuleFragment::GpuRuntime,
            RuleFragment::Env("NVIDIA_VISIBLE_DEVICES", "all"),
            RuleFragment::Env("NVIDIA_DRIVER_CAPABILITIES", "all"),
        ],
    },
    GpuRule {
        os: OsMatch::Any,
        gpu: GpuKind::Generic,
        mode: AccelerationMode::DirectRendering,
        fragments: &[RuleFragment::Volume("/dev/dri:/dev/dri")],
    },
    GpuRule {
        os: OsMatch::Any,
        gpu: GpuKind::None,
        mode: AccelerationMode::CpuOnly,
        fragments: &[],
    },
];

fn gpu_rule(os: OsKind, gpu: GpuKind) -> &'static GpuRule {
    GPU_RULES
        .iter()
        .find(|rule| rule.gpu == gpu && rule.os.matches(os))
        .unwrap_or(&GPU_RULES[GPU_RULES.len() - 1])
}

/// Everything the operator (config, profiles, flags, host env) contributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserOverrides {
    pub no_gpu: bool,
    pub identity: HostIdentity,
    pub account: String,
    pub workspace: WorkspaceDirectory,
    pub restart_policy: String,
    pub ports: Vec<String>,
    pub relax_devices: bool,
    pub middleware: String,
    pub toolkit_version: String,
    pub credentials: Option<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub profiles: Vec<(String, Profile)>,
}

impl UserOverrides {
    pub fn from_config(
        cfg: &Config,
        profile_names: &[String],
        no_gpu: bool,
        identity: HostIdentity,
        workspace: WorkspaceDirectory,
        credentials: Option<(String, String)>,
    ) -> Result<Self, SimdockError> {
        let mut profiles = Vec::new();
        for name in profile_names {
            profiles.push((name.clone(), cfg.profile(name)?.clone()));
        }
        Ok(Self {
            no_gpu,
            identity,
            account: cfg.container.account.clone(),
            workspace,
            restart_policy: cfg.container.restart_policy.clone(),
            ports: cfg.ports.clone(),
            relax_devices: cfg.permissions.relax_devices,
            middleware: cfg.simulation.middleware.clone(),
            toolkit_version: cfg.simulation.toolkit_version.clone(),
            credentials,
            env: cfg.env.clone(),
            profiles,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Composition {
    pub config: ConfigurationSet,
    pub provisioning: Vec<ProvisionStep>,
    pub acceleration: AccelerationMode,
    pub degradations: Vec<Degradation>,
}

pub fn compose(
    snapshot: &CapabilitySnapshot,
    overrides: &UserOverrides,
    display: &ConfigurationSet,
) -> Composition {
    let mut config = base_fragments(overrides);
    let mut provisioning = Vec::new();
    let mut degradations = Vec::new();

    let gpu = if overrides.no_gpu {
        GpuKind::None
    } else {
        snapshot.gpu_kind
    };
    let rule = gpu_rule(snapshot.os_kind, gpu);
    for fragment in rule.fragments {
        match *fragment {
            RuleFragment::Flag(flag) => {
                config.add_flag(flag);
            }
            RuleFragment::Env(key, value) => {
                config.set_env(key, value);
            }
            RuleFragment::Volume(mount) => {
                config.add_volume(mount);
            }
            RuleFragment::Device(node) => {
                config.add_device(node);
            }
            RuleFragment::GpuRuntime => {
                config.add_flag(gpu_runtime_flag(snapshot, &mut degradations));
            }
            RuleFragment::Provision(path) => {
                let step = ProvisionStep::RelaxDevice(path.to_string());
                if !provisioning.contains(&step) {
                    provisioning.push(step);
                }
            }
        }
    }

    config.merge(display);
    for (key, value) in &overrides.env {
        config.set_env(key.clone(), value.clone());
    }
    for (_, profile) in &overrides.profiles {
        config.merge(&profile_fragments(profile));
    }

    Composition {
        config,
        provisioning,
        acceleration: rule.mode,
        degradations,
    }
}

fn base_fragments(overrides: &UserOverrides) -> ConfigurationSet {
    let mut config = ConfigurationSet::new();
    config
        .add_flag("--privileged")
        .add_flag(format!("--restart={}", overrides.restart_policy))
        .set_network("host")
        .add_volume(overrides.workspace.volume_spec());
    for port in &overrides.ports {
        config.add_port(port.clone());
    }
    config
        .set_env(ENV_HOST_UID, overrides.identity.uid.to_string())
        .set_env(ENV_HOST_GID, overrides.identity.gid.to_string())
        .set_env(ENV_ACCOUNT, overrides.account.clone())
        .set_env(ENV_WORKSPACE, overrides.workspace.mount_point.clone())
        .set_env(
            ENV_RELAX_DEVICES,
            if overrides.relax_devices { "1" } else { "0" },
        );
    if !overrides.middleware.trim().is_empty() {
        config.set_env("RMW_IMPLEMENTATION", overrides.middleware.clone());
    }
    if !overrides.toolkit_version.trim().is_empty() {
        config.set_env("GZ_VERSION", overrides.toolkit_version.clone());
    }
    if let Some((user, token)) = &overrides.credentials {
        config
            .set_env("GIT_USER", user.clone())
            .set_env("GIT_TOKEN", token.clone());
    }
    config
}

fn gpu_runtime_flag(snapshot: &CapabilitySnapshot, degradations: &mut Vec<Degradation>) -> String {
    let native = snapshot
        .engine_version
        .map(|version| version.supports_native_gpu())
        .unwrap_or(false);
    if native {
        return "--gpus=all".to_string();
    }
    if snapshot.legacy_gpu_runtime {
        return "--runtime=nvidia".to_string();
    }
    degradations.push(Degradation::CapabilityDetection(
        "engine reports no native GPU support and no legacy nvidia runtime is installed; trying --gpus=all anyway"
            .to_string(),
    ));
    "--gpus=all".to_string()
}

fn profile_fragments(profile: &Profile) -> ConfigurationSet {
    let mut config = ConfigurationSet::new();
    for flag in &profile.flags {
        config.add_flag(flag.clone());
    }
    if let Some(network) = &profile.network {
        config.set_network(network.clone());
    }
    for (key, value) in &profile.env {
        config.set_env(key.clone(), value.clone());
    }
    for volume in &profile.volumes {
        config.add_volume(volume.clone());
    }
    for device in &profile.devices {
        config.add_device(device.clone());
    }
    for port in &profile.ports {
        config.add_port(port.clone());
    }
    config
}

pub fn sidecar_configuration(service: &ServiceConfig, restart_policy: &str) -> ConfigurationSet {
    let mut config = ConfigurationSet::new();
    if service.privileged {
        config.add_flag("--privileged");
    }
    config
        .add_flag(format!("--restart={restart_policy}"))
        .set_network("host");
    for (key, value) in &service.env {
        config.set_env(key.clone(), value.clone());
    }
    for volume in &service.volumes {
        config.add_volume(volume.clone());
    }
    for device in &service.devices {
        config.add_device(device.clone());
    }
    config
}

/// Host-side preparation requested by the rule table; failures only warn.
pub fn provision<R: CommandRunner>(runner: &R, steps: &[ProvisionStep]) -> Vec<Degradation> {
    let mut degradations = Vec::new();
    for step in steps {
        match step {
            ProvisionStep::RelaxDevice(path) => {
                let args = vec!["a+rw".to_string(), path.clone()];
                let failure = match runner.run("chmod", &args, None, true) {
                    Ok(output) if output.success() => None,
                    Ok(output) => Some(output.stderr_text()),
                    Err(err) => Some(err.to_string()),
                };
                if let Some(reason) = failure {
                    degradations.push(Degradation::PermissionAdjustment(format!(
                        "could not relax permissions on {path}: {reason}"
                    )));
                }
            }
        }
    }
    degradations
}
