use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Every external program simdock touches goes through this seam.
pub trait CommandRunner {
    fn is_available(&self, program: &str) -> bool;

    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;

    /// Captured run with extra environment entries layered over the inherited ones.
    fn capture_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, io::Error>;

    fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), io::Error>;

    fn capture(&self, program: &str, args: &[&str]) -> Result<CommandOutput, io::Error> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_string()).collect();
        self.run(program, &args, None, true)
    }
}

pub struct RealRunner;

impl CommandRunner for RealRunner {
    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        run_command(cmd, stdin, capture_output)
    }

    fn capture_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())));
        run_command(cmd, None, true)
    }

    fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), io::Error> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_child| ())
    }
}

fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    capture_output: bool,
) -> Result<CommandOutput, io::Error> {
    if let Some(input) = stdin {
        cmd.stdin(Stdio::piped());
        if capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        return Ok(CommandOutput {
            status_code: exit_code(&output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    if capture_output {
        let output = cmd.output()?;
        Ok(CommandOutput {
            status_code: exit_code(&output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    } else {
        let status = cmd.status()?;
        Ok(CommandOutput {
            status_code: exit_code(&status),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or(if status.success() { 0 } else { 1 })
}

/// Renders an invocation for logs and error messages, single-quoting any
/// argument a POSIX shell would split or expand.
pub fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%{}".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Read-only view of the host used by detection and the display bridge.
pub trait HostProbe {
    fn env_var(&self, name: &str) -> Option<String>;
    fn read_to_string(&self, path: &Path) -> Option<String>;
    fn path_exists(&self, path: &Path) -> bool;
    fn dir_has_entries(&self, path: &Path) -> bool;
    fn list_dir(&self, path: &Path) -> Vec<PathBuf>;
}

pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn env_var(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|value| !value.trim().is_empty())
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn dir_has_entries(&self, path: &Path) -> bool {
        fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    fn list_dir(&self, path: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)
            .map(|entries| entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| (*part).to_string()).collect()
    }

    #[test]
    fn plain_arguments_render_unquoted() {
        assert_eq!(
            render_command_line("docker", &strings(&["container", "inspect", "--format", "{{.State.Status}}", "dev1"])),
            "docker container inspect --format {{.State.Status}} dev1"
        );
        assert_eq!(
            render_command_line("chown", &strings(&["-R", "1500:1500", "/home/dev"])),
            "chown -R 1500:1500 /home/dev"
        );
    }

    #[test]
    fn shell_sensitive_arguments_are_single_quoted() {
        assert_eq!(
            render_command_line("bash", &strings(&["-c", "echo hi", ""])),
            "bash -c 'echo hi' ''"
        );
        assert_eq!(
            render_command_line("sh", &strings(&["-c", "echo 'x' $HOME"])),
            "sh -c 'echo '\\''x'\\'' $HOME'"
        );
    }
}
