use crate::process::Captured;
use regen_core::RunOutcome;

/// Fatal signatures, scanned top to bottom with first match winning.
/// These mark environment problems, not fixture problems, so a match is
/// never eligible for escalation.
pub const FATAL_SIGNATURES: [&str; 4] = [
    // container runtime unavailable
    "docker.errors.DockerException",
    // transient-retry budget exhausted inside the harness
    "tenacity.RetryError",
    // sandbox shell connection dropped
    "pexpect.exceptions.EOF",
    // auxiliary server port collision
    "Address already in use",
];

/// Pure classification of one harness invocation. Case-sensitive
/// substring match over the merged output; exit code zero short-circuits
/// to `Passed` without scanning.
pub fn classify(captured: &Captured) -> RunOutcome {
    if captured.exit_ok() {
        return RunOutcome::Passed;
    }
    let output = captured.combined();
    for signature in FATAL_SIGNATURES {
        if output.contains(signature) {
            return RunOutcome::InfraFatal;
        }
    }
    RunOutcome::Failed
}
