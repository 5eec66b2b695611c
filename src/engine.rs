use crate::error::{ProcessErrorDetails, SimdockError};
use crate::runner::{render_command_line, CommandOutput, CommandRunner};
use std::io;
use tracing::{debug, info};

// `docker run`/`podman run` exit with 125 when the engine itself fails.
const ENGINE_FAILURE_STATUS: i32 = 125;

pub struct Engine<'a, R: CommandRunner> {
    runner: &'a R,
    binary: String,
}

impl<'a, R: CommandRunner> Engine<'a, R> {
    pub fn new(runner: &'a R, binary: &str) -> Self {
        Self {
            runner,
            binary: binary.to_string(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Checked before anything else touches the host.
    pub fn ensure_available(&self) -> Result<(), SimdockError> {
        if !self.runner.is_available(&self.binary) {
            return Err(SimdockError::EngineUnavailable(format!(
                "`{}` was not found on PATH",
                self.binary
            )));
        }
        let args = vec![
            "info".to_string(),
            "--format".to_string(),
            "{{.ServerVersion}}".to_string(),
        ];
        let output = self.runner.run(&self.binary, &args, None, true).map_err(|err| {
            SimdockError::EngineUnavailable(format!("failed to run `{}`: {err}", self.binary))
        })?;
        if !output.success() {
            let stderr = output.stderr_text();
            return Err(SimdockError::EngineUnavailable(if stderr.is_empty() {
                format!("`{} info` exited with status {}", self.binary, output.status_code)
            } else {
                format!("`{} info` failed: {stderr}", self.binary)
            }));
        }
        Ok(())
    }

    pub fn render_command(&self, args: &[String]) -> String {
        render_command_line(&self.binary, args)
    }

    fn invoke(&self, args: &[String], capture_output: bool, command: &str) -> Result<CommandOutput, SimdockError> {
        self.runner
            .run(&self.binary, args, None, capture_output)
            .map_err(|err| SimdockError::ProcessDetailed {
                message: format!("failed to run command `{command}`: {err}"),
                details: spawn_error_details(&err, command, &self.binary),
            })
    }

    pub fn execute(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, SimdockError> {
        let command = self.render_command(args);
        debug!(%command, "engine invocation");
        let output = self.invoke(args, capture_output, &command)?;
        if output.success() {
            return Ok(output);
        }
        Err(failure_error(command, &output))
    }

    /// Runs a session on the user's terminal. Its exit status belongs to the
    /// session, except 125 which the engine reserves for its own failures.
    pub fn session(&self, args: &[String]) -> Result<i32, SimdockError> {
        let command = self.render_command(args);
        debug!(%command, "engine session");
        let output = self.invoke(args, false, &command)?;
        if output.status_code == ENGINE_FAILURE_STATUS {
            return Err(failure_error(command, &output));
        }
        if !output.success() {
            info!(status = output.status_code, %command, "session ended with non-zero status");
        }
        Ok(output.status_code)
    }

    /// `None` when the engine has no container with this name.
    pub fn inspect_state(&self, name: &str) -> Result<Option<String>, SimdockError> {
        let args = strings(&["container", "inspect", "--format", "{{.State.Status}}", name]);
        let command = self.render_command(&args);
        let output = self.invoke(&args, true, &command)?;
        if output.success() {
            return Ok(Some(output.stdout_text()));
        }
        let stderr = output.stderr_text().to_lowercase();
        if stderr.contains("no such container") || stderr.contains("no such object") {
            return Ok(None);
        }
        Err(failure_error(command, &output))
    }

    /// Detached runs are checked like any engine call; attached ones are sessions.
    pub fn run_container(&self, args: Vec<String>, detached: bool) -> Result<(), SimdockError> {
        let mut full = vec!["run".to_string()];
        full.extend(args);
        if detached {
            self.execute(&full, true).map(|_| ())
        } else {
            self.session(&full).map(|_| ())
        }
    }

    pub fn start(&self, name: &str) -> Result<(), SimdockError> {
        self.execute(&strings(&["start", name]), true).map(|_| ())
    }

    pub fn exec(&self, name: &str, tty: bool, command: &[String]) -> Result<(), SimdockError> {
        let mut args = vec![
            "exec".to_string(),
            if tty { "-it" } else { "-i" }.to_string(),
            name.to_string(),
        ];
        args.extend(command.iter().cloned());
        self.session(&args).map(|_| ())
    }

    pub fn stop(&self, name: &str) -> Result<(), SimdockError> {
        self.execute(&strings(&["stop", name]), true).map(|_| ())
    }

    pub fn restart(&self, name: &str) -> Result<(), SimdockError> {
        self.execute(&strings(&["restart", name]), true).map(|_| ())
    }

    pub fn remove(&self, name: &str) -> Result<(), SimdockError> {
        self.execute(&strings(&["rm", "-f", name]), true).map(|_| ())
    }

    pub fn logs(&self, name: &str, follow: bool, tail: Option<u32>) -> Result<(), SimdockError> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("--follow".to_string());
        }
        if let Some(tail) = tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        args.push(name.to_string());
        self.execute(&args, false).map(|_| ())
    }

    pub fn build(&self, args: Vec<String>) -> Result<(), SimdockError> {
        let mut full = vec!["build".to_string()];
        full.extend(args);
        self.execute(&full, false).map(|_| ())
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_string()).collect()
}

fn failure_error(command: String, output: &CommandOutput) -> SimdockError {
    let stderr = output.stderr_text();
    let (error_code, hint) = classify_engine_failure(&stderr);
    let mut message = format!(
        "command failed with status {} while running `{command}`",
        output.status_code
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(hint_message) = &hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    SimdockError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
        },
    }
}

fn spawn_error_details(err: &io::Error, command: &str, binary: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "engine_not_found".to_string(),
            hint: Some(format!("Install the container engine and ensure `{binary}` is on your PATH.")),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_engine_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "engine_daemon_unreachable".to_string(),
            Some("The engine daemon is unreachable. Start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("permission denied while trying to connect") {
        return (
            "engine_socket_permission".to_string(),
            Some("Your user cannot reach the engine socket. Join the `docker` group or rerun with sudo.".to_string()),
        );
    }

    if lower.contains("could not select device driver")
        || lower.contains("unknown or invalid runtime name: nvidia")
        || lower.contains("nvidia-container-cli")
    {
        return (
            "engine_gpu_unavailable".to_string(),
            Some(
                "The engine cannot pass the GPU through. Install the NVIDIA Container Toolkit or rerun with --no-gpu."
                    .to_string(),
            ),
        );
    }

    if lower.contains("port is already allocated")
        || lower.contains("bind: address already in use")
        || lower.contains("address already in use")
    {
        return (
            "engine_port_conflict".to_string(),
            Some(
                "A required host port is already in use. Free the conflicting port or adjust `ports` in the config."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "engine_name_conflict".to_string(),
            Some("A container with this name already exists. Run `simdock clean` or pick another --name.".to_string()),
        );
    }

    if lower.contains("unable to find image") || lower.contains("manifest unknown") {
        return (
            "engine_image_missing".to_string(),
            Some("The image is not available locally. Run `simdock build` first.".to_string()),
        );
    }

    if lower.contains("denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return (
            "engine_registry_auth".to_string(),
            Some("Authenticate with the registry (`docker login`) for private images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{fail, ok, MockRunner};

    #[test]
    fn missing_binary_is_engine_unavailable() {
        let runner = MockRunner::with_programs(&[]);
        let err = Engine::new(&runner, "docker")
            .ensure_available()
            .expect_err("unavailable");
        assert!(matches!(err, SimdockError::EngineUnavailable(_)));
        assert!(err.to_string().contains("docker"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn unreachable_daemon_is_engine_unavailable() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond(
            "docker info",
            fail(1, "Cannot connect to the Docker daemon at unix:///var/run/docker.sock."),
        );
        let err = Engine::new(&runner, "docker")
            .ensure_available()
            .expect_err("unavailable");
        assert!(matches!(err, SimdockError::EngineUnavailable(_)));
        assert_eq!(
            err.details().map(|details| details.error_code),
            Some("engine_unavailable".to_string())
        );
    }

    #[test]
    fn failures_are_classified_with_hints() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond(
            "docker start",
            fail(1, "Error response from daemon: driver failed programming external connectivity: Bind for 0.0.0.0:14550 failed: port is already allocated"),
        );
        let err = Engine::new(&runner, "docker")
            .start("dev1")
            .expect_err("port conflict");
        let details = err.details().expect("details");
        assert_eq!(details.error_code, "engine_port_conflict");
        assert_eq!(details.command.as_deref(), Some("docker start dev1"));
        assert!(err.to_string().contains("Hint:"));
    }

    #[test]
    fn gpu_driver_failure_suggests_no_gpu() {
        let (code, hint) = classify_engine_failure(
            "docker: Error response from daemon: could not select device driver \"\" with capabilities: [[gpu]].",
        );
        assert_eq!(code, "engine_gpu_unavailable");
        assert!(hint.unwrap().contains("--no-gpu"));
    }

    #[test]
    fn inspect_maps_missing_container_to_none() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond(
            "docker container inspect",
            fail(1, "Error: No such container: dev1"),
        );
        let engine = Engine::new(&runner, "docker");
        assert_eq!(engine.inspect_state("dev1").unwrap(), None);
        runner.respond("docker container inspect", ok("running\n"));
        assert_eq!(
            engine.inspect_state("dev1").unwrap(),
            Some("running".to_string())
        );
    }

    #[test]
    fn inspect_propagates_other_failures() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond(
            "docker container inspect",
            fail(1, "permission denied while trying to connect to the Docker daemon socket"),
        );
        let err = Engine::new(&runner, "docker")
            .inspect_state("dev1")
            .expect_err("denied");
        assert_eq!(err.details().unwrap().error_code, "engine_socket_permission");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn render_quotes_whitespace() {
        let runner = MockRunner::with_programs(&["podman"]);
        let engine = Engine::new(&runner, "podman");
        let rendered = engine.render_command(&strings(&["exec", "dev1", "bash", "-c", "echo hi"]));
        assert_eq!(rendered, "podman exec dev1 bash -c 'echo hi'");
    }

    #[test]
    fn logs_renders_follow_and_tail() {
        let runner = MockRunner::with_programs(&["docker"]);
        Engine::new(&runner, "docker")
            .logs("dev1", true, Some(50))
            .unwrap();
        assert_eq!(runner.lines(), vec!["docker logs --follow --tail 50 dev1"]);
        assert!(!runner.calls()[0].capture_output);
    }

    #[test]
    fn shell_exit_status_ends_the_session_quietly() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond("docker exec", fail(1, ""));
        let engine = Engine::new(&runner, "docker");
        engine
            .exec("dev1", true, &strings(&["bash"]))
            .expect("non-zero shell status is not an engine failure");
        assert_eq!(engine.session(&strings(&["exec", "-it", "dev1", "bash"])).unwrap(), 1);
        assert!(runner.calls().iter().all(|call| !call.capture_output));
    }

    #[test]
    fn attached_run_fails_only_on_engine_status() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond("docker run", fail(130, ""));
        let engine = Engine::new(&runner, "docker");
        engine
            .run_container(strings(&["-it", "--name", "dev1", "simdock:latest"]), false)
            .expect("interrupted session");

        runner.respond("docker run", fail(125, ""));
        let err = engine
            .run_container(strings(&["-it", "--name", "dev1", "simdock:latest"]), false)
            .expect_err("engine failure");
        assert!(matches!(err, SimdockError::ProcessDetailed { .. }));
        assert!(err.to_string().contains("status 125"));
    }

    #[test]
    fn detached_run_failure_is_classified() {
        let runner = MockRunner::with_programs(&["docker"]);
        runner.respond(
            "docker run",
            fail(125, "docker: Error response from daemon: Conflict. The container name \"/dev1\" is already in use by container \"4f2a\"."),
        );
        let err = Engine::new(&runner, "docker")
            .run_container(strings(&["-d", "--name", "dev1", "simdock:latest"]), true)
            .expect_err("conflict");
        assert_eq!(err.details().unwrap().error_code, "engine_name_conflict");
    }
}
