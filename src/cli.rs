use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "simdock",
    version,
    about = "Launch a GPU-aware robotics simulation container"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "profile", global = true, value_name = "NAME")]
    pub profiles: Vec<String>,
    #[arg(long, global = true)]
    pub no_gpu: bool,
    /// Sidecar service to bring up with the container; `--with-<service>` also works.
    #[arg(long = "with", global = true, value_name = "SERVICE")]
    pub with: Vec<String>,
    #[arg(long, global = true, value_name = "CONTAINER")]
    pub name: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Up {
        #[arg(long, default_value_t = false)]
        detach: bool,
    },
    Down,
    Restart {
        #[arg(long, default_value_t = false)]
        detach: bool,
    },
    Logs {
        service: Option<String>,
        #[arg(long, short = 'f')]
        follow: bool,
        #[arg(long)]
        tail: Option<u32>,
    },
    Shell {
        #[arg(long)]
        shell: Option<String>,
    },
    Build {
        #[arg(long)]
        no_cache: bool,
        #[arg(long)]
        pull: bool,
    },
    Status,
    Clean {
        #[arg(long)]
        purge_workspace: bool,
        #[arg(long)]
        yes: bool,
    },
}

/// Rewrites `--with-<service>` into `--with <service>` so clap sees a plain repeatable option.
/// Everything after a bare `--` is left alone.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut normalized = Vec::new();
    let mut passthrough = false;
    for arg in args {
        if passthrough {
            normalized.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            normalized.push(arg);
            continue;
        }
        match arg.strip_prefix("--with-") {
            Some(service) if !service.is_empty() => {
                normalized.push("--with".to_string());
                normalized.push(service.to_string());
            }
            _ => normalized.push(arg),
        }
    }
    normalized
}
