use crate::capability::OsKind;
use crate::compose::ConfigurationSet;
use crate::config::{expand_path, DisplayConfig};
use crate::error::Degradation;
use crate::runner::{CommandRunner, HostProbe};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";
const WSLG_DIR: &str = "/mnt/wslg";
const WSL_GPU_DEVICE: &str = "/dev/dxg";
const VIRTUAL_DISPLAY_SERVER: &str = "Xvfb";
const CONTAINER_PULSE_DIR: &str = "/run/host-pulse";
// Family field of an `xauth nlist` record; ffff matches any host.
const WILDCARD_FAMILY: &str = "ffff";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualDisplay {
    pub id: String,
    /// False when a server from an earlier run already owned the socket.
    pub started: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayOutcome {
    pub fragments: ConfigurationSet,
    pub token: Option<PathBuf>,
    pub degradations: Vec<Degradation>,
    pub virtual_display: Option<VirtualDisplay>,
}

impl DisplayOutcome {
    fn empty() -> Self {
        Self {
            fragments: ConfigurationSet::new(),
            token: None,
            degradations: Vec::new(),
            virtual_display: None,
        }
    }
}

pub struct DisplayBridge<'a, P: HostProbe, R: CommandRunner> {
    probe: &'a P,
    runner: &'a R,
    settings: &'a DisplayConfig,
}

impl<'a, P: HostProbe, R: CommandRunner> DisplayBridge<'a, P, R> {
    pub fn new(probe: &'a P, runner: &'a R, settings: &'a DisplayConfig) -> Self {
        Self {
            probe,
            runner,
            settings,
        }
    }

    pub fn token_path(&self) -> PathBuf {
        expand_path(&self.settings.auth_token_path)
    }

    pub fn prepare(&self, os_kind: OsKind) -> DisplayOutcome {
        match os_kind {
            OsKind::Wsl => self.prepare_wsl(),
            OsKind::Linux | OsKind::Unknown => self.prepare_native(),
        }
    }

    // WSLg serves X11, Wayland and audio itself, so no auth token is involved.
    fn prepare_wsl(&self) -> DisplayOutcome {
        let mut outcome = DisplayOutcome::empty();
        let display = self
            .probe
            .env_var("DISPLAY")
            .unwrap_or_else(|| ":0".to_string());
        let wayland = self
            .probe
            .env_var("WAYLAND_DISPLAY")
            .unwrap_or_else(|| "wayland-0".to_string());
        outcome
            .fragments
            .add_volume(format!("{X11_SOCKET_DIR}:{X11_SOCKET_DIR}"))
            .add_volume(format!("{WSLG_DIR}:{WSLG_DIR}"))
            .set_env("DISPLAY", display)
            .set_env("WAYLAND_DISPLAY", wayland)
            .set_env("XDG_RUNTIME_DIR", format!("{WSLG_DIR}/runtime-dir"))
            .set_env("PULSE_SERVER", format!("unix:{WSLG_DIR}/PulseServer"));
        if self.probe.path_exists(Path::new(WSL_GPU_DEVICE)) {
            outcome.fragments.add_device(WSL_GPU_DEVICE);
        }
        outcome
    }

    fn prepare_native(&self) -> DisplayOutcome {
        let mut outcome = DisplayOutcome::empty();
        let display = match self.resolve_display(&mut outcome) {
            Some(display) => display,
            None => return outcome,
        };

        let token = self.token_path();
        if self.ensure_token(&display, &token, &mut outcome.degradations) {
            outcome.token = Some(token);
        }
        // A server we just started runs with `-ac` and may not be listening yet.
        let fresh = outcome
            .virtual_display
            .as_ref()
            .map_or(false, |virtual_display| virtual_display.started);
        self.relax_access_control(&display, fresh, &mut outcome.degradations);

        outcome
            .fragments
            .add_volume(format!("{X11_SOCKET_DIR}:{X11_SOCKET_DIR}:rw"));
        if let Some(token) = &outcome.token {
            let token = token.display().to_string();
            outcome
                .fragments
                .add_volume(format!("{token}:{token}"))
                .set_env("XAUTHORITY", token);
        }
        outcome
            .fragments
            .set_env("DISPLAY", display)
            .set_env("QT_X11_NO_MITSHM", "1");

        if let Some(runtime_dir) = self.probe.env_var("XDG_RUNTIME_DIR") {
            let pulse_dir = Path::new(&runtime_dir).join("pulse");
            if self.probe.path_exists(&pulse_dir.join("native")) {
                outcome
                    .fragments
                    .add_volume(format!("{}:{CONTAINER_PULSE_DIR}", pulse_dir.display()))
                    .set_env("PULSE_SERVER", format!("unix:{CONTAINER_PULSE_DIR}/native"));
            }
        }
        outcome
    }

    fn resolve_display(&self, outcome: &mut DisplayOutcome) -> Option<String> {
        if let Some(display) = self.probe.env_var("DISPLAY") {
            return Some(display);
        }
        if !self.settings.virtual_display {
            outcome.degradations.push(Degradation::DisplayAuthSetup(
                "DISPLAY is not set and the virtual display is disabled; GUI forwarding is off"
                    .to_string(),
            ));
            return None;
        }
        if !self.runner.is_available(VIRTUAL_DISPLAY_SERVER) {
            outcome.degradations.push(Degradation::DisplayAuthSetup(format!(
                "DISPLAY is not set and {VIRTUAL_DISPLAY_SERVER} is not installed; GUI forwarding is off"
            )));
            return None;
        }
        let id = self.settings.virtual_display_id.clone();
        if let Some(socket) = x11_socket_path(&id) {
            if self.probe.path_exists(&socket) {
                info!(display = %id, "reusing running virtual display");
                outcome.virtual_display = Some(VirtualDisplay {
                    id: id.clone(),
                    started: false,
                });
                return Some(id);
            }
        }
        let args = virtual_display_args(&id);
        if let Err(err) = self.runner.spawn_detached(VIRTUAL_DISPLAY_SERVER, &args) {
            outcome.degradations.push(Degradation::DisplayAuthSetup(format!(
                "failed to start {VIRTUAL_DISPLAY_SERVER} on {id}: {err}"
            )));
            return None;
        }
        info!(display = %id, "started virtual display");
        outcome.virtual_display = Some(VirtualDisplay {
            id: id.clone(),
            started: true,
        });
        Some(id)
    }

    fn ensure_token(&self, display: &str, token: &Path, degradations: &mut Vec<Degradation>) -> bool {
        if self.probe.path_exists(token) {
            debug!(path = %token.display(), "reusing display auth token");
            return true;
        }
        if !self.runner.is_available("xauth") {
            degradations.push(Degradation::DisplayAuthSetup(
                "xauth is not installed; forwarding without XAUTHORITY".to_string(),
            ));
            return false;
        }
        let listing = match self.runner.capture("xauth", &["nlist", display]) {
            Ok(output) if output.success() => output.stdout_text(),
            Ok(output) => {
                degradations.push(Degradation::DisplayAuthSetup(format!(
                    "xauth nlist {display} failed: {}",
                    output.stderr_text()
                )));
                return false;
            }
            Err(err) => {
                degradations.push(Degradation::DisplayAuthSetup(format!(
                    "xauth nlist {display} failed: {err}"
                )));
                return false;
            }
        };
        let records = wildcard_records(&listing);
        if records.is_empty() {
            degradations.push(Degradation::DisplayAuthSetup(format!(
                "no X authority records for {display}; forwarding without XAUTHORITY"
            )));
            return false;
        }

        let token_arg = token.display().to_string();
        let merge_args = vec![
            "-f".to_string(),
            token_arg.clone(),
            "nmerge".to_string(),
            "-".to_string(),
        ];
        let stdin = records.join("\n") + "\n";
        match self
            .runner
            .run("xauth", &merge_args, Some(stdin.as_bytes()), true)
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                degradations.push(Degradation::DisplayAuthSetup(format!(
                    "xauth nmerge into {token_arg} failed: {}",
                    output.stderr_text()
                )));
                return false;
            }
            Err(err) => {
                degradations.push(Degradation::DisplayAuthSetup(format!(
                    "xauth nmerge into {token_arg} failed: {err}"
                )));
                return false;
            }
        }

        let chmod_args = vec!["0644".to_string(), token_arg.clone()];
        let readable = self
            .runner
            .run("chmod", &chmod_args, None, true)
            .map(|output| output.success())
            .unwrap_or(false);
        if !readable {
            degradations.push(Degradation::PermissionAdjustment(format!(
                "could not make {token_arg} world-readable"
            )));
        }
        info!(path = %token_arg, "created display auth token");
        true
    }

    fn relax_access_control(
        &self,
        display: &str,
        fresh_virtual_display: bool,
        degradations: &mut Vec<Degradation>,
    ) {
        let args = vec!["+local:".to_string()];
        let env = vec![("DISPLAY".to_string(), display.to_string())];
        let failure = match self.runner.capture_with_env("xhost", &args, &env) {
            Ok(output) if output.success() => None,
            Ok(output) => Some(output.stderr_text()),
            Err(err) => Some(err.to_string()),
        };
        match failure {
            None => {}
            Some(reason) if fresh_virtual_display => {
                let display_name = display;
                debug!(display = %display_name, %reason, "xhost failed on a starting virtual display");
            }
            Some(reason) => degradations.push(Degradation::DisplayAuthSetup(format!(
                "xhost +local: on {display} failed: {reason}"
            ))),
        }
    }
}

pub fn virtual_display_args(id: &str) -> Vec<String> {
    [id, "-screen", "0", "1920x1080x24", "-nolisten", "tcp", "-ac"]
        .iter()
        .map(|arg| (*arg).to_string())
        .collect()
}

/// `:99` and `:99.0` both listen on `/tmp/.X11-unix/X99`.
pub fn x11_socket_path(display: &str) -> Option<PathBuf> {
    let number = display.strip_prefix(':')?.split('.').next()?;
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(Path::new(X11_SOCKET_DIR).join(format!("X{number}")))
}

/// Rewrites the family field of every `xauth nlist` record so the cookie
/// matches whatever hostname the container reports.
pub fn wildcard_records(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| line.len() > WILDCARD_FAMILY.len())
        .filter_map(|line| {
            line.get(WILDCARD_FAMILY.len()..)
                .map(|rest| format!("{WILDCARD_FAMILY}{rest}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::Category;
    use crate::runner::testing::{fail, ok, FakeProbe, MockRunner};

    const RECORD: &str =
        "0100 000a 776f726b73746174696f6e 0001 30 0012 4d49542d4d414749432d434f4f4b49452d31 0010 0123456789abcdef0123456789abcdef";

    fn settings() -> DisplayConfig {
        DisplayConfig::default()
    }

    #[test]
    fn existing_token_is_reused_without_xauth() {
        let mut probe = FakeProbe::native_linux();
        probe.set_env("DISPLAY", ":1").add_path("/tmp/.simdock.xauth");
        let runner = MockRunner::with_programs(&["xauth", "xhost"]);
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert!(runner.calls_to("xauth").is_empty());
        assert!(runner.calls_to("chmod").is_empty());
        assert_eq!(outcome.token, Some(PathBuf::from("/tmp/.simdock.xauth")));
        assert_eq!(
            outcome.fragments.env_value("XAUTHORITY"),
            Some("/tmp/.simdock.xauth")
        );
        assert_eq!(outcome.fragments.env_value("DISPLAY"), Some(":1"));
        assert_eq!(runner.lines(), vec!["xhost +local:"]);
        assert_eq!(
            runner.calls_to("xhost")[0].env,
            vec![("DISPLAY".to_string(), ":1".to_string())]
        );
        assert!(outcome.degradations.is_empty());
    }

    #[test]
    fn new_token_is_merged_with_wildcard_family() {
        let mut probe = FakeProbe::native_linux();
        probe.set_env("DISPLAY", ":0");
        let runner = MockRunner::with_programs(&["xauth", "xhost", "chmod"]);
        runner.respond("xauth nlist", ok(&format!("{RECORD}\n")));
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);

        let xauth = runner.calls_to("xauth");
        assert_eq!(xauth.len(), 2);
        assert_eq!(xauth[0].line(), "xauth nlist :0");
        assert_eq!(xauth[1].line(), "xauth -f /tmp/.simdock.xauth nmerge -");
        let merged = String::from_utf8(xauth[1].stdin.clone().unwrap()).unwrap();
        assert!(merged.starts_with("ffff 000a"));
        assert_eq!(
            runner.calls_to("chmod")[0].line(),
            "chmod 0644 /tmp/.simdock.xauth"
        );
        assert!(outcome.token.is_some());
        assert!(outcome.degradations.is_empty());
    }

    #[test]
    fn missing_xauth_degrades_and_drops_xauthority() {
        let mut probe = FakeProbe::native_linux();
        probe.set_env("DISPLAY", ":0");
        let runner = MockRunner::with_programs(&["xhost"]);
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert_eq!(outcome.token, None);
        assert_eq!(outcome.fragments.env_value("XAUTHORITY"), None);
        assert!(outcome
            .fragments
            .contains(Category::Volume, "/tmp/.X11-unix:/tmp/.X11-unix:rw"));
        assert_eq!(outcome.fragments.env_value("QT_X11_NO_MITSHM"), Some("1"));
        assert_eq!(outcome.degradations.len(), 1);
    }

    #[test]
    fn empty_record_list_is_a_degradation() {
        let mut probe = FakeProbe::native_linux();
        probe.set_env("DISPLAY", ":0");
        let runner = MockRunner::with_programs(&["xauth", "xhost"]);
        runner.respond("xauth nlist", ok(""));
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert_eq!(outcome.token, None);
        assert_eq!(runner.calls_to("xauth").len(), 1);
        assert!(matches!(
            &outcome.degradations[..],
            [Degradation::DisplayAuthSetup(msg)] if msg.contains("no X authority records")
        ));
    }

    #[test]
    fn xhost_failure_is_reported_but_forwarding_continues() {
        let mut probe = FakeProbe::native_linux();
        probe.set_env("DISPLAY", ":0").add_path("/tmp/.simdock.xauth");
        let runner = MockRunner::with_programs(&["xhost"]);
        runner.respond("xhost", fail(1, "unable to open display"));
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert_eq!(outcome.degradations.len(), 1);
        assert_eq!(outcome.fragments.env_value("DISPLAY"), Some(":0"));
    }

    #[test]
    fn headless_host_spawns_virtual_display() {
        let mut probe = FakeProbe::native_linux();
        probe.add_path("/tmp/.simdock.xauth");
        let runner = MockRunner::with_programs(&["Xvfb", "xhost"]);
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        let spawned = runner.calls_to("Xvfb");
        assert_eq!(spawned.len(), 1);
        assert!(spawned[0].detached);
        assert_eq!(
            spawned[0].line(),
            "Xvfb :99 -screen 0 1920x1080x24 -nolisten tcp -ac"
        );
        assert_eq!(
            outcome.virtual_display,
            Some(VirtualDisplay {
                id: ":99".to_string(),
                started: true
            })
        );
        assert_eq!(outcome.fragments.env_value("DISPLAY"), Some(":99"));
    }

    #[test]
    fn access_control_targets_the_virtual_display() {
        let mut probe = FakeProbe::native_linux();
        probe.add_path("/tmp/.simdock.xauth");
        let runner = MockRunner::with_programs(&["Xvfb", "xhost"]);
        let cfg = settings();
        DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        let xhost = runner.calls_to("xhost");
        assert_eq!(xhost.len(), 1);
        assert_eq!(xhost[0].line(), "xhost +local:");
        assert_eq!(
            xhost[0].env,
            vec![("DISPLAY".to_string(), ":99".to_string())]
        );
    }

    #[test]
    fn xhost_race_with_a_starting_virtual_display_is_not_a_warning() {
        let mut probe = FakeProbe::native_linux();
        probe.add_path("/tmp/.simdock.xauth");
        let runner = MockRunner::with_programs(&["Xvfb", "xhost"]);
        runner.respond("xhost", fail(1, "unable to open display \":99\""));
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert!(outcome.degradations.is_empty());
        assert_eq!(outcome.fragments.env_value("DISPLAY"), Some(":99"));
    }

    #[test]
    fn live_virtual_display_is_reused_without_spawning() {
        let mut probe = FakeProbe::native_linux();
        probe
            .add_path("/tmp/.simdock.xauth")
            .add_path("/tmp/.X11-unix/X99");
        let runner = MockRunner::with_programs(&["Xvfb", "xhost"]);
        runner.respond("xhost", fail(1, "unable to open display"));
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert!(runner.calls_to("Xvfb").is_empty());
        assert_eq!(
            outcome.virtual_display,
            Some(VirtualDisplay {
                id: ":99".to_string(),
                started: false
            })
        );
        assert_eq!(runner.calls_to("xhost")[0].env[0].1, ":99");
        // The reused server should already be listening, so a failure counts.
        assert_eq!(outcome.degradations.len(), 1);
    }

    #[test]
    fn socket_path_follows_display_number() {
        assert_eq!(
            x11_socket_path(":99"),
            Some(PathBuf::from("/tmp/.X11-unix/X99"))
        );
        assert_eq!(
            x11_socket_path(":1.0"),
            Some(PathBuf::from("/tmp/.X11-unix/X1"))
        );
        assert_eq!(x11_socket_path("host:0"), None);
        assert_eq!(x11_socket_path(":"), None);
    }

    #[test]
    fn headless_host_without_virtual_display_has_no_fragments() {
        let probe = FakeProbe::native_linux();
        let runner = MockRunner::with_programs(&["xhost", "xauth"]);
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Unknown);
        assert!(outcome.fragments.is_empty());
        assert!(runner.calls().is_empty());
        assert_eq!(outcome.degradations.len(), 1);
    }

    #[test]
    fn host_pulse_socket_is_forwarded() {
        let mut probe = FakeProbe::native_linux();
        probe
            .set_env("DISPLAY", ":0")
            .set_env("XDG_RUNTIME_DIR", "/run/user/1000")
            .add_path("/tmp/.simdock.xauth")
            .add_path("/run/user/1000/pulse/native");
        let runner = MockRunner::with_programs(&["xhost"]);
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Linux);
        assert!(outcome
            .fragments
            .contains(Category::Volume, "/run/user/1000/pulse:/run/host-pulse"));
        assert_eq!(
            outcome.fragments.env_value("PULSE_SERVER"),
            Some("unix:/run/host-pulse/native")
        );
    }

    #[test]
    fn wsl_uses_wslg_without_auth() {
        let mut probe = FakeProbe::wsl();
        probe.set_env("DISPLAY", ":0");
        let runner = MockRunner::with_programs(&["xauth", "xhost"]);
        let cfg = settings();
        let outcome = DisplayBridge::new(&probe, &runner, &cfg).prepare(OsKind::Wsl);
        assert!(runner.calls().is_empty());
        assert_eq!(outcome.token, None);
        assert_eq!(outcome.fragments.env_value("XAUTHORITY"), None);
        assert_eq!(
            outcome.fragments.env_value("WAYLAND_DISPLAY"),
            Some("wayland-0")
        );
        assert_eq!(
            outcome.fragments.env_value("XDG_RUNTIME_DIR"),
            Some("/mnt/wslg/runtime-dir")
        );
        assert!(outcome.fragments.contains(Category::Volume, "/mnt/wslg:/mnt/wslg"));
        assert!(outcome.fragments.contains(Category::Device, "/dev/dxg"));
    }

    #[test]
    fn wildcard_rewrite_touches_only_the_family() {
        let rewritten = wildcard_records(&format!("{RECORD}\n\n  \n"));
        assert_eq!(rewritten.len(), 1);
        assert_eq!(&rewritten[0][4..], &RECORD[4..]);
        assert!(rewritten[0].starts_with("ffff"));
    }
}
