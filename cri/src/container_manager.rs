//! Container lifecycle.
//!
//! State machine per container: Created → Running → {Exited | Unknown}.
//! A container is launched inside its sandbox's VM under a small shell
//! wrapper that backgrounds the command, prints the PID, and writes the
//! exit code to a file when the command finishes. Liveness is probed
//! with `kill -0`; stop escalates TERM → KILL and then harvests the
//! exit-code file. An unreadable exit code yields state Unknown, never
//! a fabricated zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kina_backend::{ExecOutput, ImageReference, VmBackend};
use kina_core::config::BackendConfig;
use kina_core::error::{Result, ShimError};

use crate::container::{Container, ContainerState, ContainerStore, ProcessHandle};
use crate::cri_api::ContainerConfig;
use crate::locks::OpLocks;
use crate::policy;
use crate::sandbox::{PodSandbox, SandboxState, SandboxStore};
use crate::task;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// In-VM directory holding per-container runtime files.
const RUNTIME_DIR: &str = "/run/kina";

pub struct ContainerManager {
    sandboxes: Arc<SandboxStore>,
    store: Arc<ContainerStore>,
    backend: Arc<dyn VmBackend>,
    locks: Arc<OpLocks>,
    config: BackendConfig,
}

impl ContainerManager {
    pub fn new(
        sandboxes: Arc<SandboxStore>,
        store: Arc<ContainerStore>,
        backend: Arc<dyn VmBackend>,
        locks: Arc<OpLocks>,
        config: BackendConfig,
    ) -> Self {
        Self {
            sandboxes,
            store,
            backend,
            locks,
            config,
        }
    }

    /// Record a new container in state Created, resolving (and if
    /// necessary pulling) its image. The process is not started yet.
    pub async fn create(&self, sandbox_id: &str, config: &ContainerConfig) -> Result<String> {
        let metadata = config.metadata.as_ref().ok_or_else(|| {
            ShimError::InvalidArgument("container metadata required".to_string())
        })?;
        let image = config
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ShimError::InvalidArgument("container image required".to_string())
            })?;
        if config.command.is_empty() {
            return Err(ShimError::InvalidArgument(
                "container command required".to_string(),
            ));
        }

        // Lock the sandbox so two concurrent creates cannot both pass
        // the occupancy check.
        let _guard = self.locks.hold(sandbox_id).await;

        let sandbox = self
            .sandboxes
            .get(sandbox_id)
            .await
            .ok_or_else(|| ShimError::sandbox_not_found(sandbox_id))?;
        if sandbox.state != SandboxState::Ready {
            return Err(ShimError::FailedPrecondition(format!(
                "sandbox {} is not ready",
                sandbox_id
            )));
        }

        policy::admit_container(sandbox_id, self.store.count_for_sandbox(sandbox_id).await)?;

        let canonical = ImageReference::parse(&image)?.canonical();
        let backend = self.backend.clone();
        let pull_ref = canonical.clone();
        let info = task::shield(async move {
            if let Some(info) = backend.image_status(&pull_ref).await? {
                return Ok(info);
            }
            tracing::info!(image = %pull_ref, "Image absent, pulling");
            backend.pull_image(&pull_ref).await
        })
        .await?;

        let id = uuid::Uuid::new_v4().to_string();
        let container = Container {
            id: id.clone(),
            sandbox_id: sandbox_id.to_string(),
            name: metadata.name.clone(),
            attempt: metadata.attempt,
            image_ref: info.reference,
            command: config.command.clone(),
            args: config.args.clone(),
            envs: config
                .envs
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect(),
            working_dir: config.working_dir.clone(),
            state: ContainerState::Created,
            created_at: now_ns(),
            started_at: 0,
            finished_at: 0,
            exit_code: None,
            process: None,
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            log_path: config.log_path.clone(),
        };
        self.store.add(container).await;

        tracing::info!(
            container_id = %id,
            sandbox_id = %sandbox_id,
            name = %metadata.name,
            "Container created"
        );
        Ok(id)
    }

    /// Launch the container's process inside the sandbox VM. The record
    /// moves to Running only once the backend confirms the process is
    /// alive; a command that exits immediately is recorded as Exited.
    pub async fn start(&self, id: &str) -> Result<()> {
        let _guard = self.locks.hold(id).await;
        let container = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ShimError::container_not_found(id))?;

        match container.state {
            ContainerState::Created => {}
            // Kubelet retries freely; a second start of a running
            // container is a no-op.
            ContainerState::Running => return Ok(()),
            ContainerState::Exited | ContainerState::Unknown => {
                return Err(ShimError::FailedPrecondition(format!(
                    "container {} has already finished",
                    id
                )));
            }
        }

        let sandbox = self
            .sandboxes
            .get(&container.sandbox_id)
            .await
            .ok_or_else(|| ShimError::sandbox_not_found(&container.sandbox_id))?;
        if sandbox.state != SandboxState::Ready {
            return Err(ShimError::FailedPrecondition(format!(
                "sandbox {} is not ready",
                sandbox.id
            )));
        }

        let handle = ProcessHandle {
            pid: 0,
            rc_path: format!("{}/{}.rc", RUNTIME_DIR, id),
            log_path: format!("{}/{}.log", RUNTIME_DIR, id),
        };
        let script = launch_script(&container, &handle.rc_path, &handle.log_path);

        let backend = self.backend.clone();
        let unit_id = sandbox.backend_id.clone();
        let rc_path = handle.rc_path.clone();
        let (pid, alive, exit_code) = task::shield(async move {
            let out = backend
                .exec(
                    &unit_id,
                    &["/bin/sh".to_string(), "-c".to_string(), script],
                )
                .await?;
            if out.exit_code != 0 {
                return Err(ShimError::Internal(format!(
                    "container launch failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }
            let pid: u32 = String::from_utf8_lossy(&out.stdout)
                .trim()
                .parse()
                .map_err(|_| {
                    ShimError::Internal("launcher did not report a pid".to_string())
                })?;

            let alive = process_alive(&*backend, &unit_id, pid).await?;
            let exit_code = if alive {
                None
            } else {
                harvest_exit_code(&*backend, &unit_id, &rc_path).await
            };
            Ok((pid, alive, exit_code))
        })
        .await?;

        let now = now_ns();
        self.store
            .update(id, |c| {
                c.started_at = now;
                if alive {
                    c.state = ContainerState::Running;
                    c.process = Some(ProcessHandle { pid, ..handle });
                } else {
                    c.finished_at = now;
                    match exit_code {
                        Some(code) => {
                            c.state = ContainerState::Exited;
                            c.exit_code = Some(code);
                        }
                        None => c.state = ContainerState::Unknown,
                    }
                }
            })
            .await;

        tracing::info!(container_id = %id, pid = pid, alive = alive, "Container started");
        Ok(())
    }

    /// Graceful-then-forced stop: TERM, poll up to `timeout_secs`, KILL,
    /// then harvest the exit code. A no-op on already-finished
    /// containers, preserving the recorded exit code.
    pub async fn stop(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let _guard = self.locks.hold(id).await;
        let container = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ShimError::container_not_found(id))?;

        match container.state {
            ContainerState::Exited | ContainerState::Unknown => return Ok(()),
            ContainerState::Created => {
                let now = now_ns();
                self.store
                    .update(id, |c| {
                        c.state = ContainerState::Exited;
                        c.finished_at = now;
                    })
                    .await;
                return Ok(());
            }
            ContainerState::Running => {}
        }

        let sandbox = self.sandboxes.get(&container.sandbox_id).await;
        let vm_ready = sandbox
            .as_ref()
            .map_or(false, |sb| sb.state == SandboxState::Ready);
        let handle = container.process.clone();

        let exit_code = match (vm_ready, handle, sandbox) {
            (true, Some(handle), Some(sandbox)) => {
                let backend = self.backend.clone();
                let unit_id = sandbox.backend_id.clone();
                let grace = if timeout_secs > 0 {
                    Duration::from_secs(timeout_secs as u64)
                } else {
                    Duration::from_secs(DEFAULT_STOP_GRACE_SECS)
                };
                task::shield(async move {
                    stop_process(&*backend, &unit_id, &handle, grace).await
                })
                .await?
            }
            // VM gone out from under the container; its fate is
            // unknowable.
            _ => None,
        };

        let now = now_ns();
        self.store
            .update(id, |c| {
                c.finished_at = now;
                c.process = None;
                match exit_code {
                    Some(code) => {
                        c.state = ContainerState::Exited;
                        c.exit_code = Some(code);
                    }
                    None => c.state = ContainerState::Unknown,
                }
            })
            .await;

        tracing::info!(container_id = %id, exit_code = ?exit_code, "Container stopped");
        Ok(())
    }

    /// Delete the record. Requires the process to be finished; the
    /// sandbox's VM is untouched. Unknown IDs succeed (retry semantics).
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.locks.hold(id).await;
        let Some(container) = self.store.get(id).await else {
            return Ok(());
        };

        if container.state == ContainerState::Running {
            // The process may have exited since we last looked.
            if self.probe_running(&container).await? {
                return Err(ShimError::FailedPrecondition(format!(
                    "container {} is still running",
                    id
                )));
            }
        }

        self.store.remove(id).await;
        self.locks.forget(id);
        tracing::info!(container_id = %id, "Container removed");
        Ok(())
    }

    /// Record projection plus a liveness probe for Running containers;
    /// a process found dead is harvested before the response is built.
    pub async fn status(&self, id: &str) -> Result<Container> {
        let container = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ShimError::container_not_found(id))?;

        if container.state == ContainerState::Running && !self.probe_running(&container).await? {
            let exit_code = self.harvest(&container).await;
            let now = now_ns();
            self.store
                .update(id, |c| {
                    c.finished_at = now;
                    c.process = None;
                    match exit_code {
                        Some(code) => {
                            c.state = ContainerState::Exited;
                            c.exit_code = Some(code);
                        }
                        None => c.state = ContainerState::Unknown,
                    }
                })
                .await;
        }

        self.store
            .get(id)
            .await
            .ok_or_else(|| ShimError::container_not_found(id))
    }

    /// Pure store query; no backend calls.
    pub async fn list(
        &self,
        sandbox_filter: Option<&str>,
        label_filter: Option<&std::collections::HashMap<String, String>>,
    ) -> Vec<Container> {
        self.store.list(sandbox_filter, label_filter).await
    }

    /// Run a command synchronously inside the container's VM.
    pub async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        timeout_secs: i64,
    ) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(ShimError::InvalidArgument("empty exec command".to_string()));
        }
        let container = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ShimError::container_not_found(id))?;
        if container.state != ContainerState::Running {
            return Err(ShimError::FailedPrecondition(format!(
                "container {} is not running",
                id
            )));
        }
        let sandbox = self.sandbox_for(&container).await?;

        let timeout = if timeout_secs > 0 {
            Duration::from_secs(timeout_secs as u64)
        } else {
            self.config.exec_timeout
        };
        match tokio::time::timeout(timeout, self.backend.exec(&sandbox.backend_id, cmd)).await {
            Ok(result) => result,
            Err(_) => Err(ShimError::Timeout(format!(
                "exec in container {} exceeded {:?}",
                id, timeout
            ))),
        }
    }

    /// Resolve a container's Ready sandbox, for exec and streaming.
    pub async fn sandbox_for(&self, container: &Container) -> Result<PodSandbox> {
        let sandbox = self
            .sandboxes
            .get(&container.sandbox_id)
            .await
            .ok_or_else(|| ShimError::sandbox_not_found(&container.sandbox_id))?;
        if sandbox.state != SandboxState::Ready {
            return Err(ShimError::FailedPrecondition(format!(
                "sandbox {} is not ready",
                sandbox.id
            )));
        }
        Ok(sandbox)
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        self.store.get(id).await
    }

    /// Whether the recorded process is still alive. A missing or
    /// stopped VM means the process is gone.
    async fn probe_running(&self, container: &Container) -> Result<bool> {
        let Some(sandbox) = self.sandboxes.get(&container.sandbox_id).await else {
            return Ok(false);
        };
        if sandbox.state != SandboxState::Ready {
            return Ok(false);
        }
        let Some(handle) = &container.process else {
            return Ok(false);
        };
        match process_alive(&*self.backend, &sandbox.backend_id, handle.pid).await {
            Ok(alive) => Ok(alive),
            Err(ShimError::BackendUnavailable(msg)) => Err(ShimError::BackendUnavailable(msg)),
            Err(_) => Ok(false),
        }
    }

    async fn harvest(&self, container: &Container) -> Option<i32> {
        let sandbox = self.sandboxes.get(&container.sandbox_id).await?;
        let handle = container.process.as_ref()?;
        harvest_exit_code(&*self.backend, &sandbox.backend_id, &handle.rc_path).await
    }
}

/// TERM, poll, KILL, harvest. Returns the exit code when readable.
pub(crate) async fn stop_process(
    backend: &dyn VmBackend,
    unit_id: &str,
    handle: &ProcessHandle,
    grace: Duration,
) -> Result<Option<i32>> {
    let pid = handle.pid.to_string();
    let term = vec!["kill".to_string(), "-TERM".to_string(), pid.clone()];
    match backend.exec(unit_id, &term).await {
        Ok(_) => {}
        Err(e @ ShimError::BackendUnavailable(_)) => return Err(e),
        // VM itself is gone; the exit code is unknowable.
        Err(_) => return Ok(None),
    }

    let deadline = Instant::now() + grace;
    loop {
        match process_alive(backend, unit_id, handle.pid).await {
            Ok(false) => break,
            Ok(true) => {}
            Err(e @ ShimError::BackendUnavailable(_)) => return Err(e),
            Err(_) => return Ok(None),
        }
        if Instant::now() >= deadline {
            let kill = vec!["kill".to_string(), "-KILL".to_string(), pid.clone()];
            let _ = backend.exec(unit_id, &kill).await;
            break;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    Ok(harvest_exit_code(backend, unit_id, &handle.rc_path).await)
}

async fn process_alive(backend: &dyn VmBackend, unit_id: &str, pid: u32) -> Result<bool> {
    let probe = vec!["kill".to_string(), "-0".to_string(), pid.to_string()];
    let out = backend.exec(unit_id, &probe).await?;
    Ok(out.exit_code == 0)
}

/// Read the exit-code file the wrapper writes. None when the file is
/// missing or unparseable.
async fn harvest_exit_code(
    backend: &dyn VmBackend,
    unit_id: &str,
    rc_path: &str,
) -> Option<i32> {
    let cat = vec!["cat".to_string(), rc_path.to_string()];
    match backend.exec(unit_id, &cat).await {
        Ok(out) if out.exit_code == 0 => {
            String::from_utf8_lossy(&out.stdout).trim().parse().ok()
        }
        _ => None,
    }
}

/// Shell wrapper that backgrounds the command, reports its PID, and
/// records the exit code on completion.
fn launch_script(container: &Container, rc_path: &str, log_path: &str) -> String {
    let mut inner = String::new();
    if !container.working_dir.is_empty() {
        inner.push_str("cd ");
        inner.push_str(&shell_quote(&container.working_dir));
        inner.push_str(" && ");
    }
    for (key, value) in &container.envs {
        inner.push_str("export ");
        inner.push_str(key);
        inner.push('=');
        inner.push_str(&shell_quote(value));
        inner.push_str("; ");
    }
    let cmdline = container
        .command
        .iter()
        .chain(container.args.iter())
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    inner.push_str(&cmdline);

    format!(
        "mkdir -p {dir} && ( {inner} ; echo $? > {rc} ) > {log} 2>&1 & echo $!",
        dir = RUNTIME_DIR,
        inner = inner,
        rc = rc_path,
        log = log_path,
    )
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_container(command: &[&str], args: &[&str]) -> Container {
        Container {
            id: "c-1".to_string(),
            sandbox_id: "sb-1".to_string(),
            name: "main".to_string(),
            attempt: 0,
            image_ref: "docker.io/library/alpine:latest".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            args: args.iter().map(|s| s.to_string()).collect(),
            envs: vec![],
            working_dir: String::new(),
            state: ContainerState::Created,
            created_at: 0,
            started_at: 0,
            finished_at: 0,
            exit_code: None,
            process: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            log_path: String::new(),
        }
    }

    #[test]
    fn test_launch_script_shape() {
        let container = test_container(&["sleep"], &["30"]);
        let script = launch_script(&container, "/run/kina/c-1.rc", "/run/kina/c-1.log");
        assert!(script.contains("( sleep 30 ; echo $? > /run/kina/c-1.rc )"));
        assert!(script.contains("> /run/kina/c-1.log 2>&1 & echo $!"));
        assert!(script.starts_with("mkdir -p /run/kina"));
    }

    #[test]
    fn test_launch_script_env_and_workdir() {
        let mut container = test_container(&["env"], &[]);
        container.working_dir = "/srv/app".to_string();
        container
            .envs
            .push(("GREETING".to_string(), "hello world".to_string()));
        let script = launch_script(&container, "/run/kina/c-1.rc", "/run/kina/c-1.log");
        assert!(script.contains("cd /srv/app && "));
        assert!(script.contains("export GREETING='hello world'; env"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("sleep"), "sleep");
        assert_eq!(shell_quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
