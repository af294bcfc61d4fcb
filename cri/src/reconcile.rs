//! Startup reconciliation.
//!
//! The store is purely in-memory, so after a shim restart sandbox
//! records are rebuilt from the labels the backend reports on its
//! units. Container records are not durable this way (processes inside
//! a VM leave no backend-visible trace); kubelet recreates them through
//! its normal CRI reconciliation.

use kina_backend::VmBackend;
use kina_core::error::Result;

use crate::config_mapper;
use crate::sandbox::SandboxStore;

/// Rebuild sandbox records from the backend's unit listing. Returns the
/// number of adopted sandboxes. Units without shim labels are logged
/// and left alone.
pub async fn reconcile(backend: &dyn VmBackend, sandboxes: &SandboxStore) -> Result<usize> {
    let units = backend.list_units().await?;
    let mut adopted = 0;

    for unit in units {
        match config_mapper::sandbox_from_unit(&unit) {
            Some(sandbox) => {
                tracing::info!(
                    sandbox_id = %sandbox.id,
                    name = %sandbox.name,
                    namespace = %sandbox.namespace,
                    state = ?sandbox.state,
                    "Adopted sandbox from backend"
                );
                sandboxes.adopt(sandbox).await;
                adopted += 1;
            }
            None => {
                tracing::warn!(unit_id = %unit.id, "Ignoring backend unit without shim labels");
            }
        }
    }

    Ok(adopted)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use kina_backend::mock::MockBackend;
    use kina_backend::{UnitSpec, VmBackend};
    use kina_core::config::SandboxConfig;

    use super::*;
    use crate::container::ContainerStore;
    use crate::cri_api::{PodSandboxConfig, PodSandboxMetadata};
    use crate::locks::OpLocks;
    use crate::sandbox::SandboxState;
    use crate::sandbox_manager::SandboxManager;

    #[tokio::test]
    async fn test_reconcile_rebuilds_sandboxes() {
        let backend = Arc::new(MockBackend::new());

        // First shim lifetime: create a sandbox, then forget all state.
        let manager = SandboxManager::new(
            Arc::new(SandboxStore::new()),
            Arc::new(ContainerStore::new()),
            backend.clone(),
            Arc::new(OpLocks::new()),
            SandboxConfig {
                ready_timeout: Duration::from_secs(2),
                ..SandboxConfig::default()
            },
        );
        let config = PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: "web".to_string(),
                uid: "uid-1".to_string(),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            hostname: String::new(),
            log_directory: "/var/log/pods/web".to_string(),
            dns_config: None,
            port_mappings: vec![],
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            annotations: HashMap::new(),
        };
        let id = manager.run(&config, "kina").await.unwrap();

        // Second lifetime: fresh store, rebuilt from the backend.
        let fresh = SandboxStore::new();
        let adopted = reconcile(&*backend, &fresh).await.unwrap();
        assert_eq!(adopted, 1);

        let sandbox = fresh.get(&id).await.unwrap();
        assert_eq!(sandbox.name, "web");
        assert_eq!(sandbox.namespace, "default");
        assert_eq!(sandbox.state, SandboxState::Ready);
        assert!(sandbox.network_address.is_some());
        assert_eq!(sandbox.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(sandbox.runtime_handler, "kina");

        // The adopted identity blocks a duplicate RunPodSandbox.
        assert!(fresh.reserve(&sandbox.metadata_key()).await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_skips_unlabeled_units() {
        let backend = MockBackend::new();
        backend
            .create(&UnitSpec {
                name: "hand-rolled-vm".to_string(),
                image: "alpine".to_string(),
                ..UnitSpec::default()
            })
            .await
            .unwrap();

        let store = SandboxStore::new();
        let adopted = reconcile(&backend, &store).await.unwrap();
        assert_eq!(adopted, 0);
        assert!(store.list(None).await.is_empty());
    }
}
