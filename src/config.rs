use crate::error::SimdockError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub engine: EngineConfig,
    pub container: ContainerConfig,
    pub build: BuildConfig,
    pub workspace: WorkspaceConfig,
    pub display: DisplayConfig,
    pub simulation: SimulationConfig,
    pub credentials: CredentialsConfig,
    pub permissions: PermissionsConfig,
    pub ports: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub profiles: BTreeMap<String, Profile>,
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub binary: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub account: String,
    pub command: Vec<String>,
    pub shell: String,
    pub restart_policy: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub dockerfile: String,
    pub context: String,
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub root: String,
    pub mount_point: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    pub auth_token_path: String,
    pub virtual_display: bool,
    pub virtual_display_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub middleware: String,
    pub toolkit_version: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    pub user_env: String,
    pub token_env: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionsConfig {
    pub relax_devices: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub devices: Vec<String>,
    pub ports: Vec<String>,
    pub flags: Vec<String>,
    pub network: Option<String>,
    pub services: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub devices: Vec<String>,
    pub privileged: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            engine: EngineConfig::default(),
            container: ContainerConfig::default(),
            build: BuildConfig::default(),
            workspace: WorkspaceConfig::default(),
            display: DisplayConfig::default(),
            simulation: SimulationConfig::default(),
            credentials: CredentialsConfig::default(),
            permissions: PermissionsConfig::default(),
            ports: default_ports(),
            env: BTreeMap::new(),
            profiles: BTreeMap::new(),
            services: BTreeMap::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "simdock".to_string(),
            image: "simdock:latest".to_string(),
            account: "dev".to_string(),
            command: Vec::new(),
            shell: "bash".to_string(),
            restart_policy: "unless-stopped".to_string(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            context: ".".to_string(),
            args: BTreeMap::new(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: "~".to_string(),
            mount_point: "/workspace".to_string(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            auth_token_path: "/tmp/.simdock.xauth".to_string(),
            virtual_display: true,
            virtual_display_id: ":99".to_string(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            middleware: "rmw_cyclonedds_cpp".to_string(),
            toolkit_version: "harmonic".to_string(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            user_env: "GIT_USER".to_string(),
            token_env: "GIT_TOKEN".to_string(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            relax_devices: true,
        }
    }
}

// MAVLink ground/offboard/onboard links, the XRCE-DDS agent and the simulator bridge.
fn default_ports() -> Vec<String> {
    [
        "14550:14550/udp",
        "14540:14540/udp",
        "14580:14580/udp",
        "18570:18570/udp",
        "8888:8888/udp",
        "4560:4560/tcp",
    ]
    .iter()
    .map(|port| (*port).to_string())
    .collect()
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("SIMDOCK_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("simdock");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("SIMDOCK_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join("config.yaml")
}

pub fn expand_path(input: &str) -> PathBuf {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

pub fn read_config_from_str(content: &str) -> Result<Config, SimdockError> {
    let cfg: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(content)?
    };
    if cfg.version != CONFIG_VERSION {
        return Err(SimdockError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

/// A missing config file means built-in defaults.
pub fn load_config(path: &Path) -> Result<Config, SimdockError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content).map_err(|err| match err {
        SimdockError::Yaml(inner) => SimdockError::Config(format!(
            "config is invalid ({}): {inner}",
            path.display()
        )),
        other => other,
    })
}

pub fn is_valid_container_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
}

/// Same shape `useradd` accepts by default. Dots would hide the sudoers entry
/// and colons would break the `chpasswd` line.
pub fn is_valid_account_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        && name.len() <= 32
}

pub fn validate_config(cfg: &Config) -> Result<(), SimdockError> {
    if cfg.engine.binary.trim().is_empty() {
        return Err(SimdockError::Config(
            "engine.binary must be non-empty".to_string(),
        ));
    }
    if !is_valid_container_name(&cfg.container.name) {
        return Err(SimdockError::Config(format!(
            "container.name '{}' must match [A-Za-z0-9][A-Za-z0-9_.-]*",
            cfg.container.name
        )));
    }
    if cfg.container.image.trim().is_empty() {
        return Err(SimdockError::Config(
            "container.image must be non-empty".to_string(),
        ));
    }
    if !is_valid_account_name(&cfg.container.account) {
        return Err(SimdockError::Config(format!(
            "container.account '{}' must match [a-z_][a-z0-9_-]* (at most 32 characters)",
            cfg.container.account
        )));
    }
    if cfg.container.shell.trim().is_empty() {
        return Err(SimdockError::Config(
            "container.shell must be non-empty".to_string(),
        ));
    }
    if !cfg.workspace.mount_point.starts_with('/') {
        return Err(SimdockError::Config(format!(
            "workspace.mount_point must be an absolute container path (got '{}')",
            cfg.workspace.mount_point
        )));
    }
    if cfg.ports.iter().any(|port| port.trim().is_empty()) {
        return Err(SimdockError::Config(
            "ports must not contain empty entries".to_string(),
        ));
    }
    for (name, service) in &cfg.services {
        if !is_valid_container_name(name) {
            return Err(SimdockError::Config(format!(
                "services.{name} is not a valid service name"
            )));
        }
        if service.image.trim().is_empty() {
            return Err(SimdockError::Config(format!(
                "services.{name}.image must be non-empty"
            )));
        }
    }
    for (name, profile) in &cfg.profiles {
        for service in &profile.services {
            if !cfg.services.contains_key(service) {
                return Err(SimdockError::Config(format!(
                    "profiles.{name}.services references unknown service '{service}'"
                )));
            }
        }
        if let Some(network) = &profile.network {
            if network.trim().is_empty() {
                return Err(SimdockError::Config(format!(
                    "profiles.{name}.network must be non-empty when set"
                )));
            }
        }
    }
    Ok(())
}

impl Config {
    pub fn profile(&self, name: &str) -> Result<&Profile, SimdockError> {
        self.profiles.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
            SimdockError::Config(format!(
                "unknown profile '{name}' (configured: {})",
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })
    }

    /// Requested sidecars in first-seen order: `--with-*` flags, then profile services.
    pub fn resolve_services(
        &self,
        requested: &[String],
        profiles: &[String],
    ) -> Result<Vec<(String, ServiceConfig)>, SimdockError> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        };
        for name in requested {
            push(name);
        }
        for profile in profiles {
            for name in &self.profile(profile)?.services {
                push(name);
            }
        }
        names
            .into_iter()
            .map(|name| {
                let service = self.services.get(&name).cloned().ok_or_else(|| {
                    SimdockError::Config(format!(
                        "unknown service '{name}'; declare it under `services:` in the config"
                    ))
                })?;
                Ok((name, service))
            })
            .collect()
    }
}
