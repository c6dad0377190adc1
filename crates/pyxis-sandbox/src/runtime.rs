//! Container runtime detection and podman machine management.

use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::SandboxError;

/// Wall-clock budget for a single runtime CLI invocation.
const RUNTIME_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Stderr prefixes podman emits while pulling an image. These are routine
/// chatter and are stripped from captured output.
const PODMAN_PULL_PREFIXES: &[&str] = &[
    "Resolved \"",
    "Trying to pull",
    "Getting image source signatures",
    "Copying blob",
    "Copying config",
    "Extracting",
    "Writing manifest",
    "Storing signatures",
];

/// Pick the first runtime candidate for which `available` holds.
fn pick_runtime<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    available: impl Fn(&str) -> bool,
) -> Option<String> {
    candidates
        .into_iter()
        .find(|candidate| !candidate.is_empty() && available(candidate))
        .map(String::from)
}

/// Return the first available container runtime.
///
/// Order: the explicit preference (typically `PYXIS_RUNTIME`), then
/// `podman`, then `docker`.
#[must_use]
pub fn detect_runtime(preferred: Option<&str>) -> Option<String> {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(runtime) = preferred {
        candidates.push(runtime);
    }
    candidates.extend(["podman", "docker"]);
    pick_runtime(candidates, |candidate| which::which(candidate).is_ok())
}

/// Whether a runtime binary belongs to the podman family.
pub(crate) fn is_podman(runtime: &str) -> bool {
    std::path::Path::new(runtime)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(runtime)
        .to_ascii_lowercase()
        .contains("podman")
}

/// Run a runtime CLI command and return `(exit_code, stdout, stderr)`.
///
/// stdin is detached so the child cannot inherit the MCP transport pipe.
pub(crate) async fn run_runtime_command(runtime: &str, args: &[&str]) -> (i32, String, String) {
    let mut cmd = tokio::process::Command::new(runtime);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = tokio::time::timeout(RUNTIME_COMMAND_TIMEOUT, cmd.output()).await;
    match output {
        Ok(Ok(output)) => (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Ok(Err(error)) => {
            error!(runtime, ?args, %error, "Runtime command failed to run");
            (-1, String::new(), error.to_string())
        },
        Err(_) => {
            error!(runtime, ?args, "Runtime command timed out");
            (
                -1,
                String::new(),
                format!("timeout waiting for {runtime} {}", args.join(" ")),
            )
        },
    }
}

/// Ensure the podman user-space VM is running, starting (and once,
/// initializing) it when necessary. Non-podman runtimes need no
/// preparation.
///
/// # Errors
///
/// Returns a [`SandboxError::Failed`] carrying the failing step's output
/// after three unsuccessful attempts.
pub(crate) async fn ensure_runtime_ready(runtime: &str) -> Result<(), SandboxError> {
    if !is_podman(runtime) {
        return Ok(());
    }

    for _ in 0..3 {
        let (code, stdout, stderr) =
            run_runtime_command(runtime, &["info", "--format", "{{json .}}"]).await;
        if code == 0 {
            return Ok(());
        }

        let combined = format!("{stdout}\n{stderr}").to_lowercase();
        let needs_machine = [
            "cannot connect to podman",
            "podman machine",
            "run the podman machine",
            "socket: connect",
        ]
        .iter()
        .any(|phrase| combined.contains(phrase));

        if !needs_machine {
            return Err(SandboxError::Failed {
                message: "container runtime is unavailable".to_string(),
                stdout,
                stderr,
            });
        }

        let (start_code, start_stdout, start_stderr) =
            run_runtime_command(runtime, &["machine", "start"]).await;
        if start_code == 0 {
            continue;
        }

        let start_combined = format!("{start_stdout}\n{start_stderr}").to_lowercase();
        if start_combined.contains("does not exist") || start_combined.contains("no such machine") {
            let (init_code, init_stdout, init_stderr) =
                run_runtime_command(runtime, &["machine", "init"]).await;
            if init_code != 0 {
                return Err(SandboxError::Failed {
                    message: "failed to initialize podman machine".to_string(),
                    stdout: init_stdout,
                    stderr: init_stderr,
                });
            }
            continue;
        }

        return Err(SandboxError::Failed {
            message: "failed to start podman machine".to_string(),
            stdout: start_stdout,
            stderr: start_stderr,
        });
    }

    Err(SandboxError::Failed {
        message: "unable to prepare podman runtime".to_string(),
        stdout: String::new(),
        stderr: "repeated podman machine start attempts failed".to_string(),
    })
}

/// Stop the podman machine; a no-op for other runtimes. "Already stopped"
/// responses count as success.
pub(crate) async fn stop_runtime_vm(runtime: &str) {
    if !is_podman(runtime) {
        return;
    }

    let (code, stdout, stderr) = run_runtime_command(runtime, &["machine", "stop"]).await;
    if code != 0 {
        let combined = format!("{stdout}\n{stderr}").to_lowercase();
        if combined.contains("already stopped") || combined.contains("is not running") {
            return;
        }
        warn!(stderr = %stderr.trim(), "Failed to stop podman machine");
    } else {
        debug!("Podman machine stopped");
    }
}

/// Strip podman image-pull chatter from captured stderr so successful runs
/// stay quiet.
pub(crate) fn filter_pull_chatter(runtime: &str, text: &str) -> String {
    if text.is_empty() || !is_podman(runtime) {
        return text.to_string();
    }

    text.lines()
        .filter(|line| {
            let stripped = line.trim();
            stripped.is_empty()
                || !PODMAN_PULL_PREFIXES
                    .iter()
                    .any(|prefix| stripped.starts_with(prefix))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_runtime_prefers_earlier_candidates() {
        let picked = pick_runtime(["custom", "podman", "docker"], |name| name != "custom");
        assert_eq!(picked.as_deref(), Some("podman"));

        let explicit = pick_runtime(["custom", "podman"], |_| true);
        assert_eq!(explicit.as_deref(), Some("custom"));

        let none = pick_runtime(["podman", "docker"], |_| false);
        assert!(none.is_none());
    }

    #[test]
    fn podman_detection_uses_basename() {
        assert!(is_podman("podman"));
        assert!(is_podman("/opt/homebrew/bin/podman"));
        assert!(is_podman("podman-remote"));
        assert!(!is_podman("/usr/bin/docker"));
    }

    #[test]
    fn pull_chatter_is_stripped_for_podman() {
        let text = "Trying to pull docker.io/library/python:3.14-slim...\n\
                    Copying blob abc123\n\
                    actual error: something broke";
        let filtered = filter_pull_chatter("podman", text);
        assert_eq!(filtered, "actual error: something broke");
    }

    #[test]
    fn pull_chatter_kept_for_docker() {
        let text = "Trying to pull something";
        assert_eq!(filter_pull_chatter("docker", text), text);
    }
}
