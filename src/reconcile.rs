use crate::capability::HostIdentity;
use crate::compose::{ENV_ACCOUNT, ENV_HOST_GID, ENV_HOST_UID, ENV_RELAX_DEVICES, ENV_WORKSPACE};
use crate::config::is_valid_account_name;
use crate::error::Degradation;
use crate::runner::{render_command_line, CommandRunner, HostProbe};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_ACCOUNT: &str = "dev";
pub const DEFAULT_WORKSPACE: &str = "/workspace";
pub const DEFAULT_COMMAND: &str = "bash";
pub const SUDOERS_DIR: &str = "/etc/sudoers.d";

// Serial adapters, GPU render nodes, audio and input devices.
pub const HARDWARE_GROUPS: [&str; 7] = [
    "dialout", "plugdev", "video", "audio", "render", "input", "tty",
];

const HANDOFF_SCRIPT: &str = "source ~/.bashrc; exec \"$@\"";
const HANDOFF_ARGV0: &str = "simdock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileInputs {
    pub identity: Option<HostIdentity>,
    pub account: String,
    pub workspace: PathBuf,
    pub relax_devices: bool,
}

impl ReconcileInputs {
    /// The identity counts as supplied only when the UID parses; a missing GID follows the UID.
    pub fn from_probe<P: HostProbe>(probe: &P) -> Self {
        let uid = probe
            .env_var(ENV_HOST_UID)
            .and_then(|value| value.trim().parse::<u32>().ok());
        let gid = probe
            .env_var(ENV_HOST_GID)
            .and_then(|value| value.trim().parse::<u32>().ok());
        let identity = uid.map(|uid| HostIdentity {
            uid,
            gid: gid.unwrap_or(uid),
        });
        let relax_devices = probe
            .env_var(ENV_RELAX_DEVICES)
            .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            identity,
            account: account_from(probe.env_var(ENV_ACCOUNT)),
            workspace: PathBuf::from(
                probe
                    .env_var(ENV_WORKSPACE)
                    .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
            ),
            relax_devices,
        }
    }
}

fn account_from(value: Option<String>) -> String {
    match value {
        Some(account) if is_valid_account_name(&account) => account,
        Some(account) => {
            warn!(%account, fallback = DEFAULT_ACCOUNT, "ignoring unusable account name");
            DEFAULT_ACCOUNT.to_string()
        }
        None => DEFAULT_ACCOUNT.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountState {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl AccountState {
    pub fn identity(&self) -> HostIdentity {
        HostIdentity {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Parses one `getent passwd` line: `name:x:uid:gid:gecos:home:shell`.
pub fn parse_passwd_entry(line: &str) -> Option<AccountState> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(AccountState {
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: PathBuf::from(fields[5]),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IdentityAction {
    ChangeUid { uid: u32 },
    ChangeGid { gid: u32 },
    CreateAccount { uid: u32, gid: u32 },
    SetPassword,
    GrantSudo,
}

pub fn plan_identity(desired: HostIdentity, current: Option<&AccountState>) -> Vec<IdentityAction> {
    match current {
        Some(state) => {
            let mut actions = Vec::new();
            if state.gid != desired.gid {
                actions.push(IdentityAction::ChangeGid { gid: desired.gid });
            }
            if state.uid != desired.uid {
                actions.push(IdentityAction::ChangeUid { uid: desired.uid });
            }
            actions
        }
        None => vec![
            IdentityAction::CreateAccount {
                uid: desired.uid,
                gid: desired.gid,
            },
            IdentityAction::SetPassword,
            IdentityAction::GrantSudo,
        ],
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessState {
    pub memberships: BTreeSet<String>,
    pub available_groups: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AccessAction {
    ChownTree { path: PathBuf, uid: u32, gid: u32 },
    JoinGroup { group: String },
    RelaxDevice { path: PathBuf },
}

pub fn plan_access(
    resolved: HostIdentity,
    current: &AccessState,
    paths: &[PathBuf],
    devices: &[PathBuf],
) -> Vec<AccessAction> {
    let mut actions: Vec<AccessAction> = Vec::new();
    let mut seen_paths = BTreeSet::new();
    for path in paths {
        if seen_paths.insert(path.clone()) {
            actions.push(AccessAction::ChownTree {
                path: path.clone(),
                uid: resolved.uid,
                gid: resolved.gid,
            });
        }
    }
    for group in HARDWARE_GROUPS {
        if current.available_groups.contains(group) && !current.memberships.contains(group) {
            actions.push(AccessAction::JoinGroup {
                group: group.to_string(),
            });
        }
    }
    let mut seen_devices = BTreeSet::new();
    for device in devices {
        if seen_devices.insert(device.clone()) {
            actions.push(AccessAction::RelaxDevice {
                path: device.clone(),
            });
        }
    }
    actions
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub account: String,
    pub resolved: Option<HostIdentity>,
    pub home: Option<PathBuf>,
    pub identity_actions: Vec<IdentityAction>,
    pub access_actions: Vec<AccessAction>,
    pub degradations: Vec<Degradation>,
}

pub struct Reconciler<'a, P: HostProbe, R: CommandRunner> {
    probe: &'a P,
    runner: &'a R,
    sudoers_dir: PathBuf,
}

impl<'a, P: HostProbe, R: CommandRunner> Reconciler<'a, P, R> {
    pub fn new(probe: &'a P, runner: &'a R) -> Self {
        Self {
            probe,
            runner,
            sudoers_dir: PathBuf::from(SUDOERS_DIR),
        }
    }

    pub fn with_sudoers_dir(mut self, dir: PathBuf) -> Self {
        self.sudoers_dir = dir;
        self
    }

    pub fn reconcile(&self, inputs: &ReconcileInputs) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome {
            account: inputs.account.clone(),
            resolved: None,
            home: None,
            identity_actions: Vec::new(),
            access_actions: Vec::new(),
            degradations: Vec::new(),
        };
        let desired = match inputs.identity {
            Some(identity) => identity,
            None => {
                debug!("no host identity supplied; leaving accounts untouched");
                return outcome;
            }
        };

        let current = self.account_state(&inputs.account);
        outcome.identity_actions = plan_identity(desired, current.as_ref());
        let resolved = self.apply_identity(
            &inputs.account,
            desired,
            current.as_ref(),
            &outcome.identity_actions,
            &mut outcome.degradations,
        );
        let resolved = match resolved {
            Some(identity) => identity,
            None => return outcome,
        };
        outcome.resolved = Some(resolved);

        let home = self
            .account_state(&inputs.account)
            .map(|state| state.home)
            .unwrap_or_else(|| PathBuf::from(format!("/home/{}", inputs.account)));
        outcome.home = Some(home.clone());

        let paths: Vec<PathBuf> = [home, inputs.workspace.clone()]
            .into_iter()
            .filter(|path| self.probe.path_exists(path))
            .collect();
        let devices = if inputs.relax_devices {
            self.device_nodes()
        } else {
            Vec::new()
        };
        let access = self.access_state(&inputs.account);
        outcome.access_actions = plan_access(resolved, &access, &paths, &devices);
        self.apply_access(&inputs.account, &outcome.access_actions, &mut outcome.degradations);

        info!(
            account = %inputs.account,
            uid = resolved.uid,
            gid = resolved.gid,
            identity_changes = outcome.identity_actions.len(),
            access_changes = outcome.access_actions.len(),
            "service account reconciled"
        );
        outcome
    }

    pub fn account_state(&self, account: &str) -> Option<AccountState> {
        self.runner
            .capture("getent", &["passwd", account])
            .ok()
            .filter(|output| output.success())
            .and_then(|output| parse_passwd_entry(&output.stdout_text()))
    }

    pub fn access_state(&self, account: &str) -> AccessState {
        let memberships = self
            .runner
            .capture("id", &["-nG", account])
            .ok()
            .filter(|output| output.success())
            .map(|output| {
                output
                    .stdout_text()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let available_groups = HARDWARE_GROUPS
            .iter()
            .filter(|group| {
                self.runner
                    .capture("getent", &["group", group])
                    .map(|output| output.success())
                    .unwrap_or(false)
            })
            .map(|group| (*group).to_string())
            .collect();
        AccessState {
            memberships,
            available_groups,
        }
    }

    pub fn device_nodes(&self) -> Vec<PathBuf> {
        let mut nodes: Vec<PathBuf> = self.probe.list_dir(Path::new("/dev/dri"));
        nodes.extend(
            self.probe
                .list_dir(Path::new("/dev"))
                .into_iter()
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with("nvidia"))
                        .unwrap_or(false)
                }),
        );
        let dxg = Path::new("/dev/dxg");
        if self.probe.path_exists(dxg) {
            nodes.push(dxg.to_path_buf());
        }
        nodes.extend(
            self.probe
                .list_dir(Path::new("/dev/input"))
                .into_iter()
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| !name.starts_with("by-"))
                        .unwrap_or(false)
                }),
        );
        nodes
    }

    fn apply_identity(
        &self,
        account: &str,
        desired: HostIdentity,
        current: Option<&AccountState>,
        actions: &[IdentityAction],
        degradations: &mut Vec<Degradation>,
    ) -> Option<HostIdentity> {
        let mut resolved = current.map(AccountState::identity);
        for action in actions {
            let result = match action {
                IdentityAction::ChangeGid { gid } => self
                    .step("groupmod", &["-o", "-g", &gid.to_string(), account], None)
                    .map(|()| {
                        if let Some(identity) = resolved.as_mut() {
                            identity.gid = *gid;
                        }
                    }),
                IdentityAction::ChangeUid { uid } => self
                    .step("usermod", &["-o", "-u", &uid.to_string(), account], None)
                    .map(|()| {
                        if let Some(identity) = resolved.as_mut() {
                            identity.uid = *uid;
                        }
                    }),
                IdentityAction::CreateAccount { uid, gid } => self
                    .step("groupadd", &["-f", "-o", "-g", &gid.to_string(), account], None)
                    .and_then(|()| {
                        self.step(
                            "useradd",
                            &[
                                "-o",
                                "-m",
                                "-u",
                                &uid.to_string(),
                                "-g",
                                &gid.to_string(),
                                "-s",
                                "/bin/bash",
                                account,
                            ],
                            None,
                        )
                    })
                    .map(|()| resolved = Some(desired)),
                IdentityAction::SetPassword => {
                    let line = format!("{account}:{account}\n");
                    self.step("chpasswd", &[], Some(line.as_bytes()))
                }
                IdentityAction::GrantSudo => self.grant_sudo(account),
            };
            if let Err(reason) = result {
                degradations.push(Degradation::PermissionAdjustment(format!(
                    "{action:?} for '{account}' failed: {reason}"
                )));
                if matches!(action, IdentityAction::CreateAccount { .. }) {
                    return None;
                }
            }
        }
        resolved
    }

    fn apply_access(&self, account: &str, actions: &[AccessAction], degradations: &mut Vec<Degradation>) {
        for action in actions {
            let result = match action {
                AccessAction::ChownTree { path, uid, gid } => self.step(
                    "chown",
                    &["-R", &format!("{uid}:{gid}"), &path.display().to_string()],
                    None,
                ),
                AccessAction::JoinGroup { group } => {
                    self.step("usermod", &["-aG", group, account], None)
                }
                AccessAction::RelaxDevice { path } => {
                    self.step("chmod", &["a+rw", &path.display().to_string()], None)
                }
            };
            if let Err(reason) = result {
                degradations.push(Degradation::PermissionAdjustment(format!(
                    "{action:?} failed: {reason}"
                )));
            }
        }
    }

    fn step(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<(), String> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_string()).collect();
        let command = render_command_line(program, &args);
        debug!(%command, "reconcile step");
        match self.runner.run(program, &args, stdin, true) {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(format!(
                "`{command}` exited with status {}: {}",
                output.status_code,
                output.stderr_text()
            )),
            Err(err) => Err(format!("`{command}`: {err}")),
        }
    }

    fn grant_sudo(&self, account: &str) -> Result<(), String> {
        let path = self.sudoers_dir.join(sudoers_file_name(account));
        write_sudoers_entry(&path, account).map_err(|err| format!("{}: {err}", path.display()))
    }
}

/// sudo skips `sudoers.d` entries whose names contain `.` or end in `~`.
pub fn sudoers_file_name(account: &str) -> String {
    account
        .trim_end_matches('~')
        .chars()
        .map(|c| if c == '.' { '_' } else { c })
        .collect()
}

// Written beside the target and renamed so sudo never reads a partial or
// loosely permissioned file.
fn write_sudoers_entry(path: &Path, account: &str) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string());
    let tmp_path = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o440)
        .open(&tmp_path)?;
    writeln!(file, "{account} ALL=(ALL) NOPASSWD:ALL")?;
    file.sync_all()?;
    drop(file);
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o440))?;
    fs::rename(&tmp_path, path)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handoff {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Handoff {
    /// Replaces the current process; only returns on failure.
    pub fn exec(&self) -> io::Error {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.exec()
    }
}

pub fn handoff_command(
    outcome: &ReconcileOutcome,
    sudo_available: bool,
    command: &[String],
) -> Handoff {
    let command: Vec<String> = if command.is_empty() {
        vec![DEFAULT_COMMAND.to_string()]
    } else {
        command.to_vec()
    };
    if outcome.resolved.is_none() {
        return Handoff {
            program: command[0].clone(),
            args: command[1..].to_vec(),
            env: Vec::new(),
        };
    }

    let account = outcome.account.clone();
    let (program, mut args, env) = if sudo_available {
        (
            "sudo".to_string(),
            vec![
                "-E".to_string(),
                "-H".to_string(),
                "-u".to_string(),
                account,
                "--".to_string(),
            ],
            Vec::new(),
        )
    } else {
        let mut env = vec![("USER".to_string(), account.clone())];
        if let Some(home) = &outcome.home {
            env.push(("HOME".to_string(), home.display().to_string()));
        }
        (
            "runuser".to_string(),
            vec!["-u".to_string(), account, "--".to_string()],
            env,
        )
    };
    args.extend([
        "bash".to_string(),
        "-c".to_string(),
        HANDOFF_SCRIPT.to_string(),
        HANDOFF_ARGV0.to_string(),
    ]);
    args.extend(command);
    Handoff { program, args, env }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{fail, ok, FakeProbe, MockRunner};
    use tempfile::tempdir;

    const TOOLS: [&str; 10] = [
        "getent", "id", "groupmod", "usermod", "groupadd", "useradd", "chpasswd", "chown",
        "chmod", "sudo",
    ];

    fn identity(uid: u32, gid: u32) -> HostIdentity {
        HostIdentity { uid, gid }
    }

    fn existing(uid: u32, gid: u32) -> AccountState {
        AccountState {
            uid,
            gid,
            home: PathBuf::from("/home/dev"),
        }
    }

    fn inputs(identity: Option<HostIdentity>) -> ReconcileInputs {
        ReconcileInputs {
            identity,
            account: "dev".to_string(),
            workspace: PathBuf::from("/workspace"),
            relax_devices: false,
        }
    }

    #[test]
    fn inputs_come_from_environment() {
        let mut probe = FakeProbe::default();
        probe
            .set_env("SIMDOCK_HOST_UID", "1500")
            .set_env("SIMDOCK_ACCOUNT", "pilot")
            .set_env("SIMDOCK_RELAX_DEVICES", "1");
        let parsed = ReconcileInputs::from_probe(&probe);
        assert_eq!(parsed.identity, Some(identity(1500, 1500)));
        assert_eq!(parsed.account, "pilot");
        assert_eq!(parsed.workspace, PathBuf::from("/workspace"));
        assert!(parsed.relax_devices);

        let mut probe = FakeProbe::default();
        probe.set_env("SIMDOCK_HOST_UID", "not-a-number");
        let parsed = ReconcileInputs::from_probe(&probe);
        assert_eq!(parsed.identity, None);
        assert_eq!(parsed.account, "dev");
        assert!(!parsed.relax_devices);
    }

    #[test]
    fn passwd_entries_parse() {
        let state = parse_passwd_entry("dev:x:1000:1000:Dev,,,:/home/dev:/bin/bash\n").unwrap();
        assert_eq!(state, existing(1000, 1000));
        assert_eq!(parse_passwd_entry("garbage"), None);
    }

    #[test]
    fn matching_identity_needs_no_changes() {
        assert!(plan_identity(identity(1500, 1500), Some(&existing(1500, 1500))).is_empty());
    }

    #[test]
    fn differing_identity_changes_only_what_differs() {
        assert_eq!(
            plan_identity(identity(1500, 1000), Some(&existing(1000, 1000))),
            vec![IdentityAction::ChangeUid { uid: 1500 }]
        );
        assert_eq!(
            plan_identity(identity(1500, 1500), Some(&existing(1000, 1000))),
            vec![
                IdentityAction::ChangeGid { gid: 1500 },
                IdentityAction::ChangeUid { uid: 1500 }
            ]
        );
    }

    #[test]
    fn missing_account_is_created_with_password_and_sudo() {
        assert_eq!(
            plan_identity(identity(1500, 1500), None),
            vec![
                IdentityAction::CreateAccount {
                    uid: 1500,
                    gid: 1500
                },
                IdentityAction::SetPassword,
                IdentityAction::GrantSudo
            ]
        );
    }

    #[test]
    fn access_plan_skips_absent_groups_and_existing_memberships() {
        let state = AccessState {
            memberships: ["dev", "video"].iter().map(|g| g.to_string()).collect(),
            available_groups: ["video", "dialout", "render"]
                .iter()
                .map(|g| g.to_string())
                .collect(),
        };
        let actions = plan_access(
            identity(1500, 1500),
            &state,
            &[PathBuf::from("/home/dev"), PathBuf::from("/workspace")],
            &[PathBuf::from("/dev/dri/card0"), PathBuf::from("/dev/dri/card0")],
        );
        assert_eq!(
            actions,
            vec![
                AccessAction::ChownTree {
                    path: PathBuf::from("/home/dev"),
                    uid: 1500,
                    gid: 1500
                },
                AccessAction::ChownTree {
                    path: PathBuf::from("/workspace"),
                    uid: 1500,
                    gid: 1500
                },
                AccessAction::JoinGroup {
                    group: "dialout".to_string()
                },
                AccessAction::JoinGroup {
                    group: "render".to_string()
                },
                AccessAction::RelaxDevice {
                    path: PathBuf::from("/dev/dri/card0")
                },
            ]
        );
    }

    #[test]
    fn reconcile_chowns_home_and_workspace_to_host_identity() {
        let mut probe = FakeProbe::default();
        probe.add_path("/home/dev").add_path("/workspace");
        let runner = MockRunner::with_programs(&TOOLS);
        runner.respond(
            "getent passwd dev",
            ok("dev:x:1000:1000::/home/dev:/bin/bash\n"),
        );
        runner.respond("id -nG dev", ok("dev sudo\n"));
        runner.respond("getent group", fail(2, ""));
        let outcome = Reconciler::new(&probe, &runner).reconcile(&inputs(Some(identity(1500, 1500))));

        assert_eq!(outcome.resolved, Some(identity(1500, 1500)));
        assert!(outcome.degradations.is_empty());
        let chowns: Vec<String> = runner.calls_to("chown").iter().map(|c| c.line()).collect();
        assert_eq!(
            chowns,
            vec![
                "chown -R 1500:1500 /home/dev",
                "chown -R 1500:1500 /workspace"
            ]
        );
        assert!(runner.lines().contains(&"groupmod -o -g 1500 dev".to_string()));
        assert!(runner.lines().contains(&"usermod -o -u 1500 dev".to_string()));
    }

    #[test]
    fn rerun_with_matching_identity_changes_no_accounts() {
        let mut probe = FakeProbe::default();
        probe.add_path("/home/dev");
        let runner = MockRunner::with_programs(&TOOLS);
        runner.respond(
            "getent passwd dev",
            ok("dev:x:1500:1500::/home/dev:/bin/bash\n"),
        );
        runner.respond("id -nG dev", ok("dev video dialout\n"));
        runner.respond("getent group", fail(2, ""));
        runner.respond("getent group video", ok("video:x:44:dev\n"));
        runner.respond("getent group dialout", ok("dialout:x:20:dev\n"));
        let outcome = Reconciler::new(&probe, &runner).reconcile(&inputs(Some(identity(1500, 1500))));
        assert!(outcome.identity_actions.is_empty());
        assert!(runner.calls_to("usermod").is_empty());
        assert!(runner.calls_to("groupmod").is_empty());
        assert_eq!(runner.calls_to("chown").len(), 1);
    }

    #[test]
    fn failed_uid_change_keeps_previous_identity() {
        let probe = FakeProbe::default();
        let runner = MockRunner::with_programs(&TOOLS);
        runner.respond(
            "getent passwd dev",
            ok("dev:x:1000:1000::/home/dev:/bin/bash\n"),
        );
        runner.respond("usermod -o -u", fail(8, "usermod: user dev is currently used by process 1"));
        let outcome = Reconciler::new(&probe, &runner).reconcile(&inputs(Some(identity(1500, 1000))));
        assert_eq!(outcome.resolved, Some(identity(1000, 1000)));
        assert_eq!(outcome.degradations.len(), 1);
    }

    #[test]
    fn missing_account_is_created_and_granted_sudo() {
        let dir = tempdir().unwrap();
        let probe = FakeProbe::default();
        let runner = MockRunner::with_programs(&TOOLS);
        runner.respond("getent passwd dev", fail(2, ""));
        let outcome = Reconciler::new(&probe, &runner)
            .with_sudoers_dir(dir.path().to_path_buf())
            .reconcile(&inputs(Some(identity(1500, 1500))));
        assert_eq!(outcome.resolved, Some(identity(1500, 1500)));
        assert_eq!(outcome.home, Some(PathBuf::from("/home/dev")));
        assert!(runner
            .lines()
            .contains(&"useradd -o -m -u 1500 -g 1500 -s /bin/bash dev".to_string()));
        let chpasswd = runner.calls_to("chpasswd");
        assert_eq!(chpasswd[0].stdin.as_deref(), Some(&b"dev:dev\n"[..]));
        let sudoers = dir.path().join("dev");
        assert_eq!(
            fs::read_to_string(&sudoers).unwrap(),
            "dev ALL=(ALL) NOPASSWD:ALL\n"
        );
        assert_eq!(
            fs::metadata(&sudoers).unwrap().permissions().mode() & 0o777,
            0o440
        );
    }

    #[test]
    fn sudoers_entry_is_installed_whole_with_final_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(sudoers_file_name("dev"));
        fs::write(&path, "stale\n").unwrap();
        write_sudoers_entry(&path, "dev").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "dev ALL=(ALL) NOPASSWD:ALL\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o440);
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn sudoers_file_names_avoid_ignored_patterns() {
        assert_eq!(sudoers_file_name("dev"), "dev");
        assert_eq!(sudoers_file_name("dev.user"), "dev_user");
        assert_eq!(sudoers_file_name("dev~"), "dev");
    }

    #[test]
    fn unusable_account_from_environment_falls_back_to_default() {
        let mut probe = FakeProbe::default();
        probe.set_env("SIMDOCK_ACCOUNT", "dev:ops");
        assert_eq!(ReconcileInputs::from_probe(&probe).account, DEFAULT_ACCOUNT);
        probe.set_env("SIMDOCK_ACCOUNT", "dev.user");
        assert_eq!(ReconcileInputs::from_probe(&probe).account, DEFAULT_ACCOUNT);
    }

    #[test]
    fn failed_account_creation_leaves_no_identity() {
        let probe = FakeProbe::default();
        let runner = MockRunner::with_programs(&TOOLS);
        runner.respond("getent passwd dev", fail(2, ""));
        runner.respond("useradd", fail(1, "useradd: cannot lock /etc/passwd"));
        let outcome = Reconciler::new(&probe, &runner).reconcile(&inputs(Some(identity(1500, 1500))));
        assert_eq!(outcome.resolved, None);
        assert!(runner.calls_to("chpasswd").is_empty());
        assert_eq!(outcome.degradations.len(), 1);
    }

    #[test]
    fn device_relaxation_covers_gpu_and_input_nodes() {
        let mut probe = FakeProbe::wsl();
        probe
            .add_path("/dev/dri/card0")
            .add_path("/dev/dri/renderD128")
            .add_path("/dev/nvidia0")
            .add_path("/dev/null")
            .add_path("/dev/input/event0")
            .add_path("/dev/input/by-id");
        let runner = MockRunner::with_programs(&[]);
        let nodes = Reconciler::new(&probe, &runner).device_nodes();
        assert_eq!(
            nodes,
            vec![
                PathBuf::from("/dev/dri/card0"),
                PathBuf::from("/dev/dri/renderD128"),
                PathBuf::from("/dev/nvidia0"),
                PathBuf::from("/dev/dxg"),
                PathBuf::from("/dev/input/event0"),
            ]
        );
    }

    #[test]
    fn permission_failures_are_warnings() {
        let mut probe = FakeProbe::default();
        probe.add_path("/workspace").add_path("/dev/dxg");
        let runner = MockRunner::with_programs(&TOOLS);
        runner.respond(
            "getent passwd dev",
            ok("dev:x:1500:1500::/home/dev:/bin/bash\n"),
        );
        runner.respond("getent group", fail(2, ""));
        runner.respond("chmod", fail(1, "Operation not permitted"));
        let mut wanted = inputs(Some(identity(1500, 1500)));
        wanted.relax_devices = true;
        let outcome = Reconciler::new(&probe, &runner).reconcile(&wanted);
        assert_eq!(outcome.resolved, Some(identity(1500, 1500)));
        assert!(matches!(
            &outcome.degradations[..],
            [Degradation::PermissionAdjustment(msg)] if msg.contains("/dev/dxg")
        ));
    }

    #[test]
    fn handoff_without_identity_runs_command_directly() {
        let probe = FakeProbe::default();
        let runner = MockRunner::with_programs(&TOOLS);
        let outcome = Reconciler::new(&probe, &runner).reconcile(&inputs(None));
        assert!(runner.calls().is_empty());
        let handoff = handoff_command(&outcome, true, &["echo".to_string(), "hi".to_string()]);
        assert_eq!(handoff.program, "echo");
        assert_eq!(handoff.args, vec!["hi"]);
        let handoff = handoff_command(&outcome, true, &[]);
        assert_eq!(handoff.program, "bash");
    }

    #[test]
    fn handoff_switches_to_account_with_shell_init() {
        let outcome = ReconcileOutcome {
            account: "dev".to_string(),
            resolved: Some(identity(1500, 1500)),
            home: Some(PathBuf::from("/home/dev")),
            identity_actions: Vec::new(),
            access_actions: Vec::new(),
            degradations: Vec::new(),
        };
        let handoff = handoff_command(&outcome, true, &[]);
        assert_eq!(handoff.program, "sudo");
        assert_eq!(
            handoff.args,
            vec![
                "-E",
                "-H",
                "-u",
                "dev",
                "--",
                "bash",
                "-c",
                "source ~/.bashrc; exec \"$@\"",
                "simdock",
                "bash"
            ]
        );
        let fallback = handoff_command(&outcome, false, &["ros2".to_string()]);
        assert_eq!(fallback.program, "runuser");
        assert_eq!(&fallback.args[..3], &["-u", "dev", "--"]);
        assert_eq!(fallback.args.last().map(String::as_str), Some("ros2"));
        assert!(fallback
            .env
            .contains(&("HOME".to_string(), "/home/dev".to_string())));
    }
}
