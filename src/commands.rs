use crate::capability::{CapabilityDetector, HostIdentity};
use crate::cli::{Cli, Commands};
use crate::compose::{compose, provision, sidecar_configuration, UserOverrides};
use crate::config::{expand_path, is_valid_container_name, load_config, resolve_config_path, Config, ServiceConfig};
use crate::display::DisplayBridge;
use crate::engine::Engine;
use crate::error::{report_all, Degradation, ProcessErrorDetails, SimdockError};
use crate::lifecycle::{sidecar_name, ContainerStatus, LaunchSpec, LifecycleManager};
use crate::runner::{CommandRunner, HostProbe};
use crate::workspace::WorkspaceDirectory;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct JsonResult<T: Serialize> {
    pub ok: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
pub struct Context {
    pub config_path: PathBuf,
    pub json: bool,
    pub profiles: Vec<String>,
    pub services: Vec<String>,
    pub no_gpu: bool,
    pub name: Option<String>,
    pub interactive: bool,
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            config_path: resolve_config_path(cli.config.as_ref()),
            json: cli.json,
            profiles: cli.profiles.clone(),
            services: cli.with.clone(),
            no_gpu: cli.no_gpu,
            name: cli.name.clone(),
            interactive: io::stdin().is_terminal() && io::stdout().is_terminal(),
        }
    }
}

struct Session {
    cfg: Config,
    name: String,
    workspace: WorkspaceDirectory,
}

impl Session {
    fn load(ctx: &Context) -> Result<Self, SimdockError> {
        let cfg = load_config(&ctx.config_path)?;
        let name = ctx
            .name
            .clone()
            .unwrap_or_else(|| cfg.container.name.clone());
        if !is_valid_container_name(&name) {
            return Err(SimdockError::Config(format!(
                "container name '{name}' must match [A-Za-z0-9][A-Za-z0-9_.-]*"
            )));
        }
        for profile in &ctx.profiles {
            cfg.profile(profile)?;
        }
        let workspace = WorkspaceDirectory::for_container(
            &expand_path(&cfg.workspace.root),
            &name,
            &cfg.workspace.mount_point,
        );
        Ok(Self {
            cfg,
            name,
            workspace,
        })
    }

    // Every configured sidecar, whether or not this invocation asked for it.
    fn all_sidecars(&self) -> Vec<String> {
        self.cfg
            .services
            .keys()
            .map(|service| sidecar_name(&self.name, service))
            .collect()
    }
}

pub fn dispatch<P: HostProbe, R: CommandRunner>(
    ctx: &Context,
    command: Commands,
    probe: &P,
    runner: &R,
) -> Result<(), SimdockError> {
    match command {
        Commands::Up { detach } => handle_up(ctx, detach, probe, runner),
        Commands::Down => handle_down(ctx, runner),
        Commands::Restart { detach } => handle_restart(ctx, detach, probe, runner),
        Commands::Logs {
            service,
            follow,
            tail,
        } => handle_logs(ctx, service, follow, tail, runner),
        Commands::Shell { shell } => handle_shell(ctx, shell, runner),
        Commands::Build { no_cache, pull } => handle_build(ctx, no_cache, pull, runner),
        Commands::Status => handle_status(ctx, probe, runner),
        Commands::Clean {
            purge_workspace,
            yes,
        } => handle_clean(ctx, purge_workspace, yes, runner),
    }
}

fn handle_up<P: HostProbe, R: CommandRunner>(
    ctx: &Context,
    detach: bool,
    probe: &P,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let services = session.cfg.resolve_services(&ctx.services, &ctx.profiles)?;

    let mut degradations: Vec<Degradation> = Vec::new();
    let detection = CapabilityDetector::new(probe, runner, engine.binary()).detect();
    report_all(&detection.degradations);
    degradations.extend(detection.degradations);
    let snapshot = detection.snapshot;

    session.workspace.ensure()?;

    let display = DisplayBridge::new(probe, runner, &session.cfg.display).prepare(snapshot.os_kind);
    report_all(&display.degradations);
    degradations.extend(display.degradations);

    let identity = HostIdentity::current(probe, runner);
    let credentials = host_credentials(&session.cfg, probe);
    let overrides = UserOverrides::from_config(
        &session.cfg,
        &ctx.profiles,
        ctx.no_gpu,
        identity,
        session.workspace.clone(),
        credentials,
    )?;
    let composition = compose(&snapshot, &overrides, &display.fragments);
    report_all(&composition.degradations);
    degradations.extend(composition.degradations.iter().cloned());

    let provisioned = provision(runner, &composition.provisioning);
    report_all(&provisioned);
    degradations.extend(provisioned);

    let manager = LifecycleManager::new(&engine);
    let mut sidecars = Vec::new();
    for (service, service_cfg) in &services {
        sidecars.push(start_sidecar(&manager, &session, service, service_cfg)?);
    }

    let launch = LaunchSpec {
        name: &session.name,
        image: &session.cfg.container.image,
        config: &composition.config,
        command: &session.cfg.container.command,
        shell: &session.cfg.container.shell,
        tty: ctx.interactive,
        detach,
    };
    let report = manager.converge(&launch)?;

    output(
        ctx,
        json!({
            "action": "up",
            "container": report.container,
            "previous_status": report.previous_status,
            "lifecycle": report.action,
            "acceleration": composition.acceleration,
            "snapshot": snapshot,
            "workspace": session.workspace.host_path,
            "virtual_display": display.virtual_display,
            "sidecars": sidecars,
            "degradations": degradations,
        }),
        format!(
            "{} ({}, {}) workspace {}",
            session.name,
            report.previous_status,
            composition.acceleration,
            session.workspace.host_path.display()
        ),
    )
}

fn start_sidecar<R: CommandRunner>(
    manager: &LifecycleManager<'_, '_, R>,
    session: &Session,
    service: &str,
    service_cfg: &ServiceConfig,
) -> Result<serde_json::Value, SimdockError> {
    let name = sidecar_name(&session.name, service);
    let config = sidecar_configuration(service_cfg, &session.cfg.container.restart_policy);
    let report = manager.converge_sidecar(&name, &service_cfg.image, &config, &service_cfg.command)?;
    Ok(json!({
        "service": service,
        "container": report.container,
        "previous_status": report.previous_status,
        "lifecycle": report.action,
    }))
}

fn host_credentials<P: HostProbe>(cfg: &Config, probe: &P) -> Option<(String, String)> {
    let user = probe.env_var(&cfg.credentials.user_env)?;
    let token = probe.env_var(&cfg.credentials.token_env)?;
    Some((user, token))
}

fn handle_down<R: CommandRunner>(ctx: &Context, runner: &R) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let manager = LifecycleManager::new(&engine);
    let mut stopped = Vec::new();
    let mut names = vec![session.name.clone()];
    names.extend(session.all_sidecars());
    for name in &names {
        let observed = manager.stop_if_active(name)?;
        if observed.is_active() {
            stopped.push(observed.name);
        }
    }
    output(
        ctx,
        json!({ "action": "down", "stopped": stopped }),
        if stopped.is_empty() {
            "nothing was running".to_string()
        } else {
            format!("stopped {}", stopped.join(", "))
        },
    )
}

fn handle_restart<P: HostProbe, R: CommandRunner>(
    ctx: &Context,
    detach: bool,
    probe: &P,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let manager = LifecycleManager::new(&engine);
    let record = manager.record(&session.name)?;
    if record.status == ContainerStatus::NotExists {
        info!(container = %session.name, "container missing; running the full launch");
        return handle_up(ctx, detach, probe, runner);
    }
    engine.restart(&session.name)?;
    if !detach {
        manager.attach(&session.name, ctx.interactive, &session.cfg.container.shell)?;
    }
    output(
        ctx,
        json!({
            "action": "restart",
            "container": session.name,
            "previous_status": record.status,
        }),
        format!("restarted {}", session.name),
    )
}

fn handle_logs<R: CommandRunner>(
    ctx: &Context,
    service: Option<String>,
    follow: bool,
    tail: Option<u32>,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let container = match service {
        Some(service) => {
            if !session.cfg.services.contains_key(&service) {
                return Err(SimdockError::Config(format!(
                    "unknown service '{service}'; declare it under `services:` in the config"
                )));
            }
            sidecar_name(&session.name, &service)
        }
        None => session.name.clone(),
    };
    if !LifecycleManager::new(&engine).observe(&container)?.exists() {
        return Err(SimdockError::ContainerMissing(container));
    }
    engine.logs(&container, follow, tail)
}

fn handle_shell<R: CommandRunner>(
    ctx: &Context,
    shell: Option<String>,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let manager = LifecycleManager::new(&engine);
    let shell = shell.unwrap_or_else(|| session.cfg.container.shell.clone());
    match manager.record(&session.name)?.status {
        ContainerStatus::NotExists => Err(SimdockError::ContainerMissing(session.name)),
        ContainerStatus::Stopped => {
            engine.start(&session.name)?;
            manager.attach(&session.name, ctx.interactive, &shell)
        }
        ContainerStatus::Running => manager.attach(&session.name, ctx.interactive, &shell),
    }
}

pub fn build_args(cfg: &Config, no_cache: bool, pull: bool) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        cfg.container.image.clone(),
        "-f".to_string(),
        expand_path(&cfg.build.dockerfile).display().to_string(),
    ];
    for (key, value) in &cfg.build.args {
        args.push("--build-arg".to_string());
        args.push(format!("{key}={value}"));
    }
    if no_cache {
        args.push("--no-cache".to_string());
    }
    if pull {
        args.push("--pull".to_string());
    }
    args.push(expand_path(&cfg.build.context).display().to_string());
    args
}

fn handle_build<R: CommandRunner>(
    ctx: &Context,
    no_cache: bool,
    pull: bool,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    engine.build(build_args(&session.cfg, no_cache, pull))?;
    output(
        ctx,
        json!({ "action": "build", "image": session.cfg.container.image }),
        format!("built {}", session.cfg.container.image),
    )
}

fn handle_status<P: HostProbe, R: CommandRunner>(
    ctx: &Context,
    probe: &P,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let detection = CapabilityDetector::new(probe, runner, engine.binary()).detect();
    report_all(&detection.degradations);
    let manager = LifecycleManager::new(&engine);
    let container = manager.observe(&session.name)?;
    let mut sidecars = Vec::new();
    for name in session.all_sidecars() {
        sidecars.push(manager.observe(&name)?);
    }
    let mut summary = format!(
        "{}: {}\nos: {:?} gpu: {:?}\nworkspace: {}",
        container.name,
        container.state_label(),
        detection.snapshot.os_kind,
        detection.snapshot.gpu_kind,
        session.workspace.host_path.display()
    );
    for sidecar in &sidecars {
        summary.push_str(&format!("\n{}: {}", sidecar.name, sidecar.state_label()));
    }
    output(
        ctx,
        json!({
            "action": "status",
            "snapshot": detection.snapshot,
            "container": container,
            "sidecars": sidecars,
            "workspace": session.workspace.host_path,
            "workspace_exists": session.workspace.host_path.is_dir(),
            "degradations": detection.degradations,
        }),
        summary,
    )
}

fn handle_clean<R: CommandRunner>(
    ctx: &Context,
    purge_workspace: bool,
    yes: bool,
    runner: &R,
) -> Result<(), SimdockError> {
    let session = Session::load(ctx)?;
    let engine = Engine::new(runner, &session.cfg.engine.binary);
    engine.ensure_available()?;
    let manager = LifecycleManager::new(&engine);

    let mut removed = Vec::new();
    let mut names = vec![session.name.clone()];
    names.extend(session.all_sidecars());
    for name in &names {
        let observed = manager.remove_if_present(name)?;
        if observed.exists() {
            removed.push(observed.name);
        }
    }

    let token = expand_path(&session.cfg.display.auth_token_path);
    let token_removed = if token.exists() {
        fs::remove_file(&token)?;
        true
    } else {
        false
    };

    let workspace_purged = if purge_workspace && session.workspace.host_path.exists() {
        if confirm_purge(ctx, &session.workspace, yes)? {
            fs::remove_dir_all(&session.workspace.host_path)?;
            info!(path = %session.workspace.host_path.display(), "workspace purged");
            true
        } else {
            false
        }
    } else {
        false
    };

    output(
        ctx,
        json!({
            "action": "clean",
            "removed": removed,
            "token_removed": token_removed,
            "workspace_purged": workspace_purged,
            "workspace": session.workspace.host_path,
        }),
        format!(
            "removed {} container(s){}{}",
            removed.len(),
            if token_removed { ", display token" } else { "" },
            if workspace_purged { ", workspace" } else { "" }
        ),
    )
}

fn confirm_purge(ctx: &Context, workspace: &WorkspaceDirectory, yes: bool) -> Result<bool, SimdockError> {
    if yes {
        return Ok(true);
    }
    if !ctx.interactive || ctx.json {
        return Err(SimdockError::Config(
            "--purge-workspace requires --yes when not running interactively".to_string(),
        ));
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Delete {} and everything in it?",
            workspace.host_path.display()
        ))
        .default(false)
        .interact()?;
    Ok(confirmed)
}

pub fn output(ctx: &Context, payload: serde_json::Value, summary: String) -> Result<(), SimdockError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else if !summary.is_empty() {
        println!("{summary}");
    }
    Ok(())
}

pub fn print_json<T: Serialize>(payload: &T) -> Result<(), SimdockError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{text}");
    Ok(())
}

pub fn report_error(json_mode: bool, err: &SimdockError) {
    if json_mode {
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            error_details: err.details(),
        };
        if print_json(&payload).is_ok() {
            return;
        }
    }
    eprintln!("{err}");
}
