//! The long-lived interpreter container.
//!
//! One container process hosts the interpreter across executions;
//! interpreter globals persist between calls. A timed-out execution
//! destroys the whole container, and the next execution starts a fresh
//! one. When the idle timeout elapses with no new executions, the
//! container (and, for podman, the machine VM) is shut down.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pyxis_core::BridgeSettings;

use crate::entrypoint::{BOOTSTRAP_FILENAME, IPC_MOUNT_TARGET, render_bootstrap};
use crate::error::SandboxError;
use crate::runtime;
use crate::wire::{HostFrame, ParsedLine, SandboxFrame, UpcallHandler, parse_line};

/// Execution outcome captured from the sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the interpreter completed the execution normally.
    pub success: bool,
    /// Interpreter exit code; `0` unless the interpreter terminated.
    pub exit_code: i32,
    /// Concatenated stdout frames, in emission order.
    pub stdout: String,
    /// Concatenated stderr frames plus any raw container stderr.
    pub stderr: String,
}

/// Per-invocation launch parameters: the IPC host directory, extra volume
/// mounts, and extra container environment.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Host directory mounted at `/ipc` (holds the bootstrap).
    pub host_dir: PathBuf,
    /// `host:container[:opts]` volume specs.
    pub mounts: Vec<String>,
    /// Extra `--env` pairs.
    pub env: Vec<(String, String)>,
}

struct SandboxProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_buf: Arc<std::sync::Mutex<String>>,
    stderr_task: JoinHandle<()>,
}

enum LoopEnd {
    Done,
    DeliveryFailed,
    Exited,
}

/// Supervisor for the rootless interpreter container.
pub struct ContainerSandbox {
    runtime: Option<String>,
    image: String,
    memory_limit: String,
    pids_limit: u32,
    cpu_limit: Option<String>,
    container_user: String,
    runtime_idle_timeout: u64,
    process: Arc<Mutex<Option<SandboxProcess>>>,
    exec_lock: Mutex<()>,
    runtime_lock: Mutex<()>,
    shared_paths: Mutex<HashSet<PathBuf>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerSandbox {
    /// Create a sandbox, autodetecting the container runtime.
    #[must_use]
    pub fn new(settings: &BridgeSettings) -> Self {
        let runtime = runtime::detect_runtime(settings.runtime.as_deref());
        Self::with_runtime(settings, runtime)
    }

    /// Create a sandbox with an explicit runtime (useful for testing).
    #[must_use]
    pub fn with_runtime(settings: &BridgeSettings, runtime: Option<String>) -> Self {
        Self {
            runtime,
            image: settings.image.clone(),
            memory_limit: settings.memory_limit.clone(),
            pids_limit: settings.pids_limit,
            cpu_limit: settings.cpu_limit.clone(),
            container_user: settings.container_user.clone(),
            runtime_idle_timeout: settings.runtime_idle_timeout,
            process: Arc::new(Mutex::new(None)),
            exec_lock: Mutex::new(()),
            runtime_lock: Mutex::new(()),
            shared_paths: Mutex::new(HashSet::new()),
            idle_timer: Mutex::new(None),
        }
    }

    /// The detected runtime binary, if any.
    #[must_use]
    pub fn runtime(&self) -> Option<&str> {
        self.runtime.as_deref()
    }

    /// The locked-down base `run` invocation, before mounts, extra env,
    /// image, and entry point.
    fn base_cmd(&self) -> Result<Vec<String>, SandboxError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or(SandboxError::RuntimeUnavailable)?;

        let mut cmd: Vec<String> = [
            runtime.as_str(),
            "run",
            "--rm",
            "--interactive",
            "--network",
            "none",
            "--read-only",
            "--pids-limit",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        cmd.push(self.pids_limit.to_string());
        cmd.push("--memory".to_string());
        cmd.push(self.memory_limit.clone());
        for flag in [
            "--tmpfs",
            "/tmp:rw,noexec,nosuid,nodev,size=64m",
            "--tmpfs",
            "/workspace:rw,noexec,nosuid,nodev,size=128m",
            "--workdir",
            "/workspace",
            "--env",
            "HOME=/workspace",
            "--env",
            "PYTHONUNBUFFERED=1",
            "--env",
            "PYTHONIOENCODING=utf-8",
            "--env",
            "PYTHONDONTWRITEBYTECODE=1",
            "--security-opt",
            "no-new-privileges",
            "--cap-drop",
            "ALL",
            "--user",
        ] {
            cmd.push(flag.to_string());
        }
        cmd.push(self.container_user.clone());
        if let Some(cpus) = &self.cpu_limit {
            cmd.push("--cpus".to_string());
            cmd.push(cpus.clone());
        }
        Ok(cmd)
    }

    /// The full container command line for a launch spec.
    fn build_command(&self, spec: &LaunchSpec) -> Result<Vec<String>, SandboxError> {
        let mut cmd = self.base_cmd()?;
        for mount in &spec.mounts {
            cmd.push("--volume".to_string());
            cmd.push(mount.clone());
        }
        for (key, value) in &spec.env {
            cmd.push("--env".to_string());
            cmd.push(format!("{key}={value}"));
        }
        cmd.push(self.image.clone());
        cmd.push("python3".to_string());
        cmd.push("-u".to_string());
        cmd.push(format!("{IPC_MOUNT_TARGET}/{BOOTSTRAP_FILENAME}"));
        Ok(cmd)
    }

    async fn spawn_container(&self, spec: &LaunchSpec) -> Result<SandboxProcess, SandboxError> {
        tokio::fs::create_dir_all(&spec.host_dir).await?;
        tokio::fs::write(spec.host_dir.join(BOOTSTRAP_FILENAME), render_bootstrap()).await?;

        let cmd = self.build_command(spec)?;
        info!(image = %self.image, runtime = cmd[0].as_str(), "Launching sandbox container");
        debug!(?cmd, "Sandbox command line");

        let mut child = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| SandboxError::failed(format!("failed to launch sandbox: {error}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::failed("sandbox stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::failed("sandbox stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::failed("sandbox stderr unavailable"))?;

        let stderr_buf = Arc::new(std::sync::Mutex::new(String::new()));
        let stderr_sink = Arc::clone(&stderr_buf);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = match stderr_sink.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                buf.push_str(&line);
                buf.push('\n');
            }
        });

        Ok(SandboxProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_buf,
            stderr_task,
        })
    }

    async fn take_or_spawn(&self, spec: &LaunchSpec) -> Result<SandboxProcess, SandboxError> {
        let existing = self.process.lock().await.take();
        if let Some(mut proc) = existing {
            match proc.child.try_wait() {
                Ok(None) => return Ok(proc),
                _ => {
                    debug!("Sandbox process has exited; starting a fresh container");
                    proc.stderr_task.abort();
                },
            }
        }
        self.spawn_container(spec).await
    }

    /// Execute code in the sandbox, streaming output and dispatching
    /// upcalls until the terminal frame arrives or the timeout expires.
    ///
    /// Executions are serialized: at most one runs at a time. The
    /// container is reused across executions while it stays alive.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::Timeout`] when `execution_done` does not arrive in
    ///   time; the container is destroyed and buffered output is attached
    /// - [`SandboxError::Failed`] for runtime or I/O failures
    pub async fn execute(
        &self,
        code: &str,
        timeout_secs: u64,
        spec: &LaunchSpec,
        handler: &dyn UpcallHandler,
    ) -> Result<ExecutionResult, SandboxError> {
        let _exec = self.exec_lock.lock().await;
        self.cancel_idle_timer().await;

        {
            let _probe = self.runtime_lock.lock().await;
            if let Some(rt) = &self.runtime {
                runtime::ensure_runtime_ready(rt).await?;
            }
        }

        let mut proc = self.take_or_spawn(spec).await?;

        let request = HostFrame::Execute {
            code: code.to_string(),
        };
        let mut line = serde_json::to_vec(&request)
            .map_err(|error| SandboxError::failed(format!("failed to encode request: {error}")))?;
        line.push(b'\n');
        if let Err(error) = proc.stdin.write_all(&line).await {
            return Err(SandboxError::failed(format!(
                "failed to send code to sandbox: {error}"
            )));
        }
        let _ = proc.stdin.flush().await;

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        let read_loop = async {
            loop {
                let Some(line) = proc.stdout.next_line().await? else {
                    return Ok::<LoopEnd, std::io::Error>(LoopEnd::Exited);
                };
                match parse_line(&line) {
                    ParsedLine::Frame(SandboxFrame::Stdout { data }) => stdout_buf.push_str(&data),
                    ParsedLine::Frame(SandboxFrame::Stderr { data }) => stderr_buf.push_str(&data),
                    ParsedLine::Frame(SandboxFrame::ExecutionDone) => return Ok(LoopEnd::Done),
                    ParsedLine::Frame(SandboxFrame::RpcRequest { id, payload }) => {
                        debug!(id, "Upcall received");
                        let response = handler.handle(payload).await;
                        let success = response
                            .get("success")
                            .and_then(Value::as_bool)
                            .unwrap_or(true);
                        let error = if success {
                            None
                        } else {
                            Some(
                                response
                                    .get("error")
                                    .and_then(Value::as_str)
                                    .unwrap_or("RPC error")
                                    .to_string(),
                            )
                        };
                        let reply = HostFrame::RpcResponse {
                            id,
                            success,
                            payload: response,
                            error,
                        };
                        let mut bytes = match serde_json::to_vec(&reply) {
                            Ok(bytes) => bytes,
                            Err(error) => {
                                stderr_buf.push_str(&format!(
                                    "Failed to encode upcall response: {error}\n"
                                ));
                                continue;
                            },
                        };
                        bytes.push(b'\n');
                        if proc.stdin.write_all(&bytes).await.is_err()
                            || proc.stdin.flush().await.is_err()
                        {
                            stderr_buf.push_str("Failed to deliver upcall response\n");
                            return Ok(LoopEnd::DeliveryFailed);
                        }
                    },
                    ParsedLine::Unrecognized(value) => {
                        stderr_buf.push_str(&value.to_string());
                        stderr_buf.push('\n');
                    },
                    ParsedLine::Invalid => {
                        stderr_buf.push_str(&line);
                        stderr_buf.push('\n');
                    },
                }
            }
        };

        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), read_loop).await;

        match outcome {
            Err(_elapsed) => {
                warn!(timeout_secs, "Execution timed out; destroying sandbox container");
                let _ = proc.child.start_kill();
                let _ = proc.child.wait().await;
                proc.stderr_task.abort();
                self.append_runtime_stderr(&proc, &mut stderr_buf);
                Err(SandboxError::Timeout {
                    timeout_secs,
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                })
            },
            Ok(Err(error)) => {
                let _ = proc.child.start_kill();
                let _ = proc.child.wait().await;
                proc.stderr_task.abort();
                self.append_runtime_stderr(&proc, &mut stderr_buf);
                Err(SandboxError::Failed {
                    message: format!("sandbox I/O failure: {error}"),
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                })
            },
            Ok(Ok(LoopEnd::Done | LoopEnd::DeliveryFailed)) => {
                self.append_runtime_stderr(&proc, &mut stderr_buf);
                *self.process.lock().await = Some(proc);
                self.arm_idle_timer().await;
                Ok(ExecutionResult {
                    success: true,
                    exit_code: 0,
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                })
            },
            Ok(Ok(LoopEnd::Exited)) => {
                let exit_code = proc
                    .child
                    .wait()
                    .await
                    .ok()
                    .and_then(|status| status.code())
                    .unwrap_or(-1);
                proc.stderr_task.abort();
                self.append_runtime_stderr(&proc, &mut stderr_buf);
                self.arm_idle_timer().await;
                Ok(ExecutionResult {
                    success: false,
                    exit_code,
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                })
            },
        }
    }

    /// Fold the container's raw stderr (drained in the background) into
    /// the execution's stderr, minus image-pull chatter.
    fn append_runtime_stderr(&self, proc: &SandboxProcess, stderr_buf: &mut String) {
        let drained = {
            let mut guard = match proc.stderr_buf.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        let filtered = match &self.runtime {
            Some(rt) => runtime::filter_pull_chatter(rt, &drained),
            None => drained,
        };
        if !filtered.is_empty() {
            stderr_buf.push_str(&filtered);
            if !filtered.ends_with('\n') {
                stderr_buf.push('\n');
            }
        }
    }

    /// Register a host directory for sharing with the runtime VM.
    /// Idempotent: each path is configured at most once per process.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or resolved.
    pub async fn ensure_shared_directory(&self, path: &Path) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(path).await?;
        let resolved = tokio::fs::canonicalize(path).await?;

        let mut shared = self.shared_paths.lock().await;
        if shared.contains(&resolved) {
            return Ok(());
        }

        let mut ok = true;
        if let Some(rt) = &self.runtime {
            if runtime::is_podman(rt) {
                ok = ensure_podman_volume_shared(rt, &resolved).await;
            }
        }
        if ok {
            shared.insert(resolved);
        }
        Ok(())
    }

    async fn arm_idle_timer(&self) {
        if self.runtime_idle_timeout == 0 {
            return;
        }
        self.cancel_idle_timer().await;

        let delay = Duration::from_secs(self.runtime_idle_timeout);
        let process = Arc::clone(&self.process);
        let runtime = self.runtime.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Sandbox idle timeout reached; shutting down runtime");
            stop_container(&process).await;
            if let Some(rt) = runtime {
                runtime::stop_runtime_vm(&rt).await;
            }
        });
        *self.idle_timer.lock().await = Some(handle);
    }

    async fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().await.take() {
            handle.abort();
        }
    }

    /// Stop the container and, for podman, the machine VM.
    pub async fn shutdown(&self) {
        self.cancel_idle_timer().await;
        stop_container(&self.process).await;
        if let Some(rt) = &self.runtime {
            runtime::stop_runtime_vm(rt).await;
        }
    }
}

impl std::fmt::Debug for ContainerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSandbox")
            .field("runtime", &self.runtime)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

async fn stop_container(process: &Mutex<Option<SandboxProcess>>) {
    if let Some(mut proc) = process.lock().await.take() {
        let _ = proc.child.start_kill();
        let _ = proc.child.wait().await;
        proc.stderr_task.abort();
    }
}

async fn ensure_podman_volume_shared(runtime: &str, path: &Path) -> bool {
    let share_spec = format!("{}:{}", path.display(), path.display());
    let (code, stdout, stderr) = runtime::run_runtime_command(
        runtime,
        &["machine", "set", "--rootful", "--volume", &share_spec],
    )
    .await;
    if code == 0 {
        return true;
    }

    let lower = stderr.to_lowercase();
    if lower.contains("already exists") || lower.contains("would overwrite") {
        return true;
    }

    if lower.contains("unknown flag: --volume") || lower.contains("unrecognized option '--volume'")
    {
        // Newer podman machines mount home paths automatically; accept the
        // path when the VM can already see it.
        let probe = format!("test -d '{}'", path.display());
        let (probe_code, _, _) =
            runtime::run_runtime_command(runtime, &["machine", "ssh", &probe]).await;
        if probe_code == 0 {
            info!(path = %path.display(), "Podman VM already exposes path; skipping --volume");
            return true;
        }
    }

    debug!(
        path = %path.display(),
        code,
        stderr = %stderr.trim(),
        stdout = %stdout.trim(),
        "Failed to configure podman shared volume"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(runtime: Option<&str>) -> ContainerSandbox {
        let settings = BridgeSettings::default();
        ContainerSandbox::with_runtime(&settings, runtime.map(String::from))
    }

    #[test]
    fn base_cmd_requires_a_runtime() {
        let result = sandbox(None).base_cmd();
        assert!(matches!(result, Err(SandboxError::RuntimeUnavailable)));
    }

    #[test]
    fn base_cmd_locks_the_container_down() {
        let cmd = sandbox(Some("podman")).base_cmd().unwrap();
        let text = cmd.join(" ");
        assert!(text.starts_with("podman run --rm --interactive"));
        for flag in [
            "--network none",
            "--read-only",
            "--pids-limit 128",
            "--memory 512m",
            "--security-opt no-new-privileges",
            "--cap-drop ALL",
            "--user 65534:65534",
            "--env PYTHONUNBUFFERED=1",
            "--env PYTHONIOENCODING=utf-8",
        ] {
            assert!(text.contains(flag), "missing flag: {flag}");
        }
        // No cpu limit configured by default.
        assert!(!text.contains("--cpus"));
    }

    #[test]
    fn cpu_limit_is_appended_when_configured() {
        let settings = BridgeSettings {
            cpu_limit: Some("1.5".to_string()),
            ..BridgeSettings::default()
        };
        let sandbox = ContainerSandbox::with_runtime(&settings, Some("docker".to_string()));
        let text = sandbox.base_cmd().unwrap().join(" ");
        assert!(text.contains("--cpus 1.5"));
    }

    #[test]
    fn build_command_appends_mounts_env_image_and_entrypoint() {
        let spec = LaunchSpec {
            host_dir: PathBuf::from("/tmp/ipc"),
            mounts: vec!["/tmp/ipc:/ipc:rw".to_string(), "/home/u/MCPs/user_tools:/projects:rw".to_string()],
            env: vec![("PYXIS_AVAILABLE_SERVERS".to_string(), "[]".to_string())],
        };
        let cmd = sandbox(Some("podman")).build_command(&spec).unwrap();
        let text = cmd.join(" ");
        assert!(text.contains("--volume /tmp/ipc:/ipc:rw"));
        assert!(text.contains("--volume /home/u/MCPs/user_tools:/projects:rw"));
        assert!(text.contains("--env PYXIS_AVAILABLE_SERVERS=[]"));
        assert!(text.ends_with("python:3.14-slim python3 -u /ipc/entrypoint.py"));
    }
}
