use crate::error::Degradation;
use crate::runner::{CommandRunner, HostProbe};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::debug;

const WSL_ENV_MARKERS: [&str; 2] = ["WSL_DISTRO_NAME", "WSL_INTEROP"];
const WSL_KERNEL_MARKERS: [&str; 2] = ["microsoft", "wsl"];
const WSL_MOUNT_POINTS: [&str; 2] = ["/mnt/wslg", "/run/WSL"];
const KERNEL_VERSION_PATH: &str = "/proc/version";
const GPU_QUERY_TOOL: &str = "nvidia-smi";
const DRI_DEVICE_DIR: &str = "/dev/dri";
const LEGACY_GPU_RUNTIMES: [&str; 2] = ["nvidia-container-runtime", "nvidia-docker"];
const NATIVE_GPU_MIN_ENGINE: EngineVersion = EngineVersion {
    major: 19,
    minor: 3,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Linux,
    Wsl,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuKind {
    Nvidia,
    Generic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl EngineVersion {
    /// Lenient: `24.0.7`, `20.10.17+dfsg1` and `v25.0` all parse.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches('v');
        let mut values = Vec::new();
        for part in trimmed.split('.').take(3) {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            values.push(digits.parse::<u64>().ok()?);
        }
        if values.is_empty() {
            return None;
        }
        values.resize(3, 0);
        Some(Self {
            major: values[0],
            minor: values[1],
            patch: values[2],
        })
    }

    pub fn supports_native_gpu(&self) -> bool {
        *self >= NATIVE_GPU_MIN_ENGINE
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for EngineVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilitySnapshot {
    pub os_kind: OsKind,
    pub gpu_kind: GpuKind,
    pub engine_version: Option<EngineVersion>,
    pub legacy_gpu_runtime: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub snapshot: CapabilitySnapshot,
    pub degradations: Vec<Degradation>,
}

pub struct CapabilityDetector<'a, P: HostProbe, R: CommandRunner> {
    probe: &'a P,
    runner: &'a R,
    engine_binary: &'a str,
}

impl<'a, P: HostProbe, R: CommandRunner> CapabilityDetector<'a, P, R> {
    pub fn new(probe: &'a P, runner: &'a R, engine_binary: &'a str) -> Self {
        Self {
            probe,
            runner,
            engine_binary,
        }
    }

    pub fn detect(&self) -> Detection {
        let mut degradations = Vec::new();
        let os_kind = self.detect_os(&mut degradations);
        let gpu_kind = self.detect_gpu(&mut degradations);
        let engine_version = self.detect_engine_version(&mut degradations);
        let legacy_gpu_runtime = LEGACY_GPU_RUNTIMES
            .iter()
            .any(|tool| self.runner.is_available(tool));
        let snapshot = CapabilitySnapshot {
            os_kind,
            gpu_kind,
            engine_version,
            legacy_gpu_runtime,
        };
        debug!(?snapshot, "capability snapshot computed");
        Detection {
            snapshot,
            degradations,
        }
    }

    fn detect_os(&self, degradations: &mut Vec<Degradation>) -> OsKind {
        if WSL_ENV_MARKERS
            .iter()
            .any(|name| self.probe.env_var(name).is_some())
        {
            return OsKind::Wsl;
        }
        let kernel = self.probe.read_to_string(Path::new(KERNEL_VERSION_PATH));
        if let Some(kernel) = kernel.as_deref() {
            let lower = kernel.to_lowercase();
            if WSL_KERNEL_MARKERS.iter().any(|marker| lower.contains(marker)) {
                return OsKind::Wsl;
            }
        }
        if WSL_MOUNT_POINTS
            .iter()
            .any(|path| self.probe.path_exists(Path::new(path)))
        {
            return OsKind::Wsl;
        }
        if kernel.is_some() {
            return OsKind::Linux;
        }
        degradations.push(Degradation::CapabilityDetection(format!(
            "unable to read {KERNEL_VERSION_PATH}; host OS flavor is unknown"
        )));
        OsKind::Unknown
    }

    fn detect_gpu(&self, degradations: &mut Vec<Degradation>) -> GpuKind {
        if self.runner.is_available(GPU_QUERY_TOOL) {
            let query = self
                .runner
                .capture(GPU_QUERY_TOOL, &["--query-gpu=name", "--format=csv,noheader"]);
            return match query {
                Ok(output) if output.success() && !output.stdout_text().is_empty() => {
                    GpuKind::Nvidia
                }
                Ok(output) => {
                    degradations.push(Degradation::CapabilityDetection(format!(
                        "{GPU_QUERY_TOOL} is installed but returned no GPU (status {}): {}; continuing without GPU acceleration",
                        output.status_code,
                        output.stderr_text()
                    )));
                    GpuKind::None
                }
                Err(err) => {
                    degradations.push(Degradation::CapabilityDetection(format!(
                        "{GPU_QUERY_TOOL} is installed but could not be run: {err}; continuing without GPU acceleration"
                    )));
                    GpuKind::None
                }
            };
        }
        if self.probe.dir_has_entries(Path::new(DRI_DEVICE_DIR)) {
            return GpuKind::Generic;
        }
        GpuKind::None
    }

    fn detect_engine_version(&self, degradations: &mut Vec<Degradation>) -> Option<EngineVersion> {
        let output = self
            .runner
            .capture(self.engine_binary, &["version", "--format", "{{.Server.Version}}"]);
        let parsed = output
            .ok()
            .filter(|output| output.success())
            .and_then(|output| EngineVersion::parse(&output.stdout_text()));
        if parsed.is_none() {
            degradations.push(Degradation::CapabilityDetection(format!(
                "could not read the {} server version",
                self.engine_binary
            )));
        }
        parsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl HostIdentity {
    /// The invoking user, looking through sudo when the launcher runs elevated.
    pub fn current<P: HostProbe, R: CommandRunner>(probe: &P, runner: &R) -> Self {
        let sudo_uid = probe
            .env_var("SUDO_UID")
            .and_then(|value| value.trim().parse::<u32>().ok());
        let sudo_gid = probe
            .env_var("SUDO_GID")
            .and_then(|value| value.trim().parse::<u32>().ok());
        Self {
            uid: sudo_uid.unwrap_or_else(|| id_value(runner, "-u")),
            gid: sudo_gid.unwrap_or_else(|| id_value(runner, "-g")),
        }
    }
}

fn id_value<R: CommandRunner>(runner: &R, flag: &str) -> u32 {
    runner
        .capture("id", &[flag])
        .ok()
        .filter(|output| output.success())
        .and_then(|output| output.stdout_text().parse::<u32>().ok())
        .unwrap_or(0)
}
