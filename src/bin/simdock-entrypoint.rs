use simdock::error::report_all;
use simdock::reconcile::{handoff_command, ReconcileInputs, Reconciler};
use simdock::runner::{CommandRunner, RealRunner, SystemProbe};
use std::env;
use std::process::ExitCode;
use tracing::error;

// Runs as root inside the container, then replaces itself with the session command.
fn main() -> ExitCode {
    simdock::init_tracing();
    let command: Vec<String> = env::args().skip(1).collect();
    let probe = SystemProbe;
    let runner = RealRunner;

    let inputs = ReconcileInputs::from_probe(&probe);
    let outcome = Reconciler::new(&probe, &runner).reconcile(&inputs);
    report_all(&outcome.degradations);

    let handoff = handoff_command(&outcome, runner.is_available("sudo"), &command);
    let err = handoff.exec();
    error!(program = %handoff.program, "handoff failed: {err}");
    ExitCode::from(127)
}
