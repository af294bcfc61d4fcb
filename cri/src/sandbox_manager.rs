//! Pod sandbox lifecycle.
//!
//! State machine per sandbox: (none) → Ready → NotReady → (removed).
//! RunPodSandbox boots one VM and waits for it to report an address;
//! any failure after partial creation tears the unit down before the
//! error is returned, so no VM is ever orphaned.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kina_backend::{UnitState, VmBackend};
use kina_core::config::SandboxConfig;
use kina_core::error::{Result, ShimError};

use crate::config_mapper;
use crate::container::{ContainerState, ContainerStore};
use crate::cri_api::PodSandboxConfig;
use crate::locks::OpLocks;
use crate::sandbox::{PodSandbox, SandboxState, SandboxStore};
use crate::task;

const ADDRESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct SandboxManager {
    store: Arc<SandboxStore>,
    containers: Arc<ContainerStore>,
    backend: Arc<dyn VmBackend>,
    locks: Arc<OpLocks>,
    config: SandboxConfig,
}

impl SandboxManager {
    pub fn new(
        store: Arc<SandboxStore>,
        containers: Arc<ContainerStore>,
        backend: Arc<dyn VmBackend>,
        locks: Arc<OpLocks>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            store,
            containers,
            backend,
            locks,
            config,
        }
    }

    /// Create and boot the sandbox VM, returning the new sandbox ID.
    pub async fn run(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String> {
        let metadata = config
            .metadata
            .as_ref()
            .ok_or_else(|| ShimError::InvalidArgument("sandbox metadata required".to_string()))?;
        if metadata.name.is_empty() || metadata.namespace.is_empty() {
            return Err(ShimError::InvalidArgument(
                "sandbox metadata requires name and namespace".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let sandbox = PodSandbox {
            id: id.clone(),
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
            uid: metadata.uid.clone(),
            attempt: metadata.attempt,
            backend_id: id.clone(),
            state: SandboxState::Ready,
            created_at: now_ns(),
            network_address: None,
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            log_directory: config.log_directory.clone(),
            runtime_handler: runtime_handler.to_string(),
        };

        // Reserve the pod identity before any backend work, so a
        // concurrent duplicate RunPodSandbox fails instead of booting a
        // second VM.
        let key = sandbox.metadata_key();
        self.store.reserve(&key).await?;

        let spec = match config_mapper::sandbox_unit_spec(&sandbox, config, &self.config) {
            Ok(spec) => spec,
            Err(e) => {
                self.store.release(&key).await;
                return Err(e);
            }
        };

        let _guard = self.locks.hold(&id).await;

        let backend = self.backend.clone();
        let unit_id = id.clone();
        let ready_timeout = self.config.ready_timeout;
        let result = task::shield(async move {
            backend.create(&spec).await?;
            let booted = async {
                backend.start(&unit_id).await?;
                wait_for_address(&*backend, &unit_id, ready_timeout).await
            }
            .await;
            match booted {
                Ok(address) => Ok(address),
                Err(e) => {
                    teardown_unit(&*backend, &unit_id).await;
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(address) => {
                tracing::info!(
                    sandbox_id = %id,
                    name = %sandbox.name,
                    namespace = %sandbox.namespace,
                    address = %address,
                    "Sandbox ready"
                );
                let mut sandbox = sandbox;
                sandbox.network_address = Some(address);
                self.store.add(sandbox).await;
                Ok(id)
            }
            Err(e) => {
                self.store.release(&key).await;
                Err(e)
            }
        }
    }

    /// Stop the sandbox VM, gracefully stopping its container first so a
    /// real exit code is harvested before the VM goes away. Idempotent;
    /// unknown IDs succeed.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let _guard = self.locks.hold(id).await;
        let Some(sandbox) = self.store.get(id).await else {
            return Ok(());
        };

        // Hold each owned container's lock too (sandbox lock always
        // taken first) so a concurrent Start/StopContainer on the same
        // ID cannot interleave with the rewrite below, then re-read the
        // states under the locks.
        let owned: Vec<String> = self
            .containers
            .list(Some(id), None)
            .await
            .into_iter()
            .map(|c| c.id)
            .collect();
        let mut container_guards = Vec::with_capacity(owned.len());
        for cid in &owned {
            container_guards.push(self.locks.hold(cid).await);
        }

        let mut running = Vec::new();
        let mut created = Vec::new();
        for cid in &owned {
            match self.containers.get(cid).await {
                Some(c) if c.state == ContainerState::Running => {
                    running.push((c.id, c.process));
                }
                Some(c) if c.state == ContainerState::Created => created.push(c.id),
                _ => {}
            }
        }

        let backend = self.backend.clone();
        let unit_id = sandbox.backend_id.clone();
        let grace = self.config.stop_grace;
        let vm_running = sandbox.state == SandboxState::Ready;
        let codes = task::shield(async move {
            let mut codes = Vec::new();
            for (cid, handle) in running {
                let code = match (&handle, vm_running) {
                    (Some(handle), true) => {
                        crate::container_manager::stop_process(&*backend, &unit_id, handle, grace)
                            .await?
                    }
                    // No process handle or a dead VM; the code is
                    // unknowable.
                    _ => None,
                };
                codes.push((cid, code));
            }
            backend.stop(&unit_id, grace).await?;
            Ok::<_, ShimError>(codes)
        })
        .await?;

        let now = now_ns();
        for (cid, code) in codes {
            self.containers
                .update(&cid, |c| {
                    c.finished_at = now;
                    c.process = None;
                    match code {
                        Some(code) => {
                            c.state = ContainerState::Exited;
                            c.exit_code = Some(code);
                        }
                        None => c.state = ContainerState::Unknown,
                    }
                })
                .await;
        }
        for cid in created {
            self.containers
                .update(&cid, |c| {
                    c.state = ContainerState::Exited;
                    c.finished_at = now;
                })
                .await;
        }

        self.store.update_state(id, SandboxState::NotReady).await;
        Ok(())
    }

    /// Remove the sandbox VM and every record it owns. Idempotent.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.locks.hold(id).await;
        let Some(sandbox) = self.store.get(id).await else {
            return Ok(());
        };

        let backend = self.backend.clone();
        let unit_id = sandbox.backend_id.clone();
        task::shield(async move {
            // Forced removal: the unit may still be running.
            let _ = backend.stop(&unit_id, Duration::from_secs(1)).await;
            backend.remove(&unit_id).await
        })
        .await?;

        let dropped = self.containers.remove_by_sandbox(id).await;
        self.store.remove(id).await;
        self.locks.forget(id);
        tracing::info!(sandbox_id = %id, containers = dropped, "Sandbox removed");
        Ok(())
    }

    /// Record projection plus a live inspect to catch drift: a unit that
    /// died outside the shim's knowledge demotes the record to NotReady.
    pub async fn status(&self, id: &str) -> Result<PodSandbox> {
        let sandbox = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ShimError::sandbox_not_found(id))?;

        if sandbox.state == SandboxState::Ready {
            match self.backend.inspect(&sandbox.backend_id).await {
                Ok(status) if status.state == UnitState::Running => {}
                Ok(_) | Err(ShimError::NotFound { .. }) => {
                    tracing::warn!(sandbox_id = %id, "Sandbox unit no longer running, demoting");
                    self.store.update_state(id, SandboxState::NotReady).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.store
            .get(id)
            .await
            .ok_or_else(|| ShimError::sandbox_not_found(id))
    }

    /// Pure store query; no backend calls.
    pub async fn list(
        &self,
        label_filter: Option<&std::collections::HashMap<String, String>>,
    ) -> Vec<PodSandbox> {
        self.store.list(label_filter).await
    }

    pub async fn get(&self, id: &str) -> Option<PodSandbox> {
        self.store.get(id).await
    }
}

/// Poll until the unit is running with an address, or time out. A unit
/// that stops while we wait fails fast.
async fn wait_for_address(
    backend: &dyn VmBackend,
    unit_id: &str,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = backend.inspect(unit_id).await?;
        match status.state {
            UnitState::Running => {
                if let Some(address) = status.network_address {
                    if !address.is_empty() {
                        return Ok(address);
                    }
                }
            }
            UnitState::Stopped => {
                return Err(ShimError::Internal(format!(
                    "unit {} stopped during sandbox startup",
                    unit_id
                )));
            }
            UnitState::Unknown => {}
        }
        if Instant::now() >= deadline {
            return Err(ShimError::Timeout(format!(
                "unit {} did not report a network address within {:?}",
                unit_id, timeout
            )));
        }
        tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
    }
}

/// Best-effort teardown of a partially created unit.
async fn teardown_unit(backend: &dyn VmBackend, unit_id: &str) {
    if let Err(e) = backend.stop(unit_id, Duration::from_secs(1)).await {
        tracing::warn!(unit_id = %unit_id, error = %e, "Teardown stop failed");
    }
    if let Err(e) = backend.remove(unit_id).await {
        tracing::warn!(unit_id = %unit_id, error = %e, "Teardown remove failed");
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use kina_backend::mock::MockBackend;

    use super::*;
    use crate::cri_api::PodSandboxMetadata;

    fn manager() -> (SandboxManager, Arc<MockBackend>, Arc<ContainerStore>) {
        let backend = Arc::new(MockBackend::new());
        let containers = Arc::new(ContainerStore::new());
        let manager = SandboxManager::new(
            Arc::new(SandboxStore::new()),
            containers.clone(),
            backend.clone(),
            Arc::new(OpLocks::new()),
            SandboxConfig {
                ready_timeout: Duration::from_secs(2),
                ..SandboxConfig::default()
            },
        );
        (manager, backend, containers)
    }

    fn pod_config(name: &str) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: name.to_string(),
                uid: format!("uid-{}", name),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            hostname: String::new(),
            log_directory: "/var/log/pods".to_string(),
            dns_config: None,
            port_mappings: vec![],
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_run_creates_ready_sandbox_with_address() {
        let (manager, backend, _) = manager();
        let id = manager.run(&pod_config("web"), "").await.unwrap();

        let sandbox = manager.status(&id).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::Ready);
        assert!(sandbox.network_address.is_some());
        assert!(backend.has_unit(&id));

        // Unit labels round-trip the pod identity.
        let labels = backend.unit_labels(&id).unwrap();
        assert_eq!(
            labels.get(config_mapper::LABEL_POD_NAME).map(String::as_str),
            Some("web")
        );
    }

    #[tokio::test]
    async fn test_duplicate_run_fails_with_already_exists() {
        let (manager, backend, _) = manager();
        manager.run(&pod_config("web"), "").await.unwrap();
        let err = manager.run(&pod_config("web"), "").await.unwrap_err();
        assert!(matches!(err, ShimError::AlreadyExists { .. }));
        assert_eq!(backend.unit_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_boot_leaves_no_unit_and_frees_name() {
        let (manager, backend, _) = manager();
        backend.set_fail_start(true);
        assert!(manager.run(&pod_config("web"), "").await.is_err());
        assert_eq!(backend.unit_count(), 0);

        backend.set_fail_start(false);
        manager.run(&pod_config("web"), "").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_metadata_rejected() {
        let (manager, _, _) = manager();
        let mut config = pod_config("web");
        config.metadata = None;
        let err = manager.run(&config, "").await.unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_demotes() {
        let (manager, _, _) = manager();
        let id = manager.run(&pod_config("web"), "").await.unwrap();

        manager.stop(&id).await.unwrap();
        assert_eq!(
            manager.status(&id).await.unwrap().state,
            SandboxState::NotReady
        );
        manager.stop(&id).await.unwrap();
        manager.stop("no-such-sandbox").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_twice_never_errors() {
        let (manager, backend, _) = manager();
        let id = manager.run(&pod_config("web"), "").await.unwrap();

        manager.remove(&id).await.unwrap();
        assert!(!backend.has_unit(&id));
        manager.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_detects_vanished_unit() {
        let (manager, backend, _) = manager();
        let id = manager.run(&pod_config("web"), "").await.unwrap();

        backend.vanish_unit(&id);
        let sandbox = manager.status(&id).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::NotReady);
    }

    fn created_container(id: &str, sandbox_id: &str) -> crate::container::Container {
        crate::container::Container {
            id: id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            name: "main".to_string(),
            attempt: 0,
            image_ref: "docker.io/library/alpine:latest".to_string(),
            command: vec!["sleep".to_string()],
            args: vec![],
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

    #[tokio::test]
    async fn test_stop_waits_for_container_operation() {
        let backend = Arc::new(MockBackend::new());
        let containers = Arc::new(ContainerStore::new());
        let locks = Arc::new(OpLocks::new());
        let manager = Arc::new(SandboxManager::new(
            Arc::new(SandboxStore::new()),
            containers.clone(),
            backend.clone(),
            locks.clone(),
            SandboxConfig {
                ready_timeout: Duration::from_secs(2),
                ..SandboxConfig::default()
            },
        ));
        let id = manager.run(&pod_config("web"), "").await.unwrap();
        containers.add(created_container("c-1", &id)).await;

        // While someone operates on the container, sandbox stop must
        // queue behind its lock instead of rewriting the record.
        let held = locks.hold("c-1").await;
        let mgr = manager.clone();
        let sid = id.clone();
        let task = tokio::spawn(async move { mgr.stop(&sid).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        drop(held);
        task.await.unwrap().unwrap();
        assert_eq!(
            manager.status(&id).await.unwrap().state,
            SandboxState::NotReady
        );
        let container = containers.get("c-1").await.unwrap();
        assert_eq!(container.state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_status_unknown_id() {
        let (manager, _, _) = manager();
        let err = manager.status("nope").await.unwrap_err();
        assert!(matches!(err, ShimError::NotFound { .. }));
    }
}
