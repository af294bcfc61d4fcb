//! Pod sandbox records and their store.
//!
//! Each sandbox owns exactly one backend unit (a dedicated VM) for its
//! entire lifetime; the unit is named after the sandbox ID so records can
//! be rebuilt from backend labels alone after a restart.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use kina_core::error::{Result, ShimError};

/// Sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// VM is running; containers may be created and started.
    Ready,
    /// VM is stopped or gone.
    NotReady,
}

/// A pod sandbox backed by one VM.
#[derive(Debug, Clone)]
pub struct PodSandbox {
    /// Shim-generated identifier, opaque to the backend.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Pod UID.
    pub uid: String,
    /// Sandbox attempt counter from kubelet.
    pub attempt: u32,
    /// Backend unit the sandbox owns. Never swapped once set.
    pub backend_id: String,
    /// Current state.
    pub state: SandboxState,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    /// Address assigned by the backend network stack.
    pub network_address: Option<String>,
    /// Pod labels, opaque pass-through.
    pub labels: HashMap<String, String>,
    /// Pod annotations, opaque pass-through.
    pub annotations: HashMap<String, String>,
    /// Log directory path from the sandbox config.
    pub log_directory: String,
    /// Runtime handler name.
    pub runtime_handler: String,
}

impl PodSandbox {
    /// Uniqueness key for duplicate-create detection.
    pub fn metadata_key(&self) -> String {
        metadata_key(&self.namespace, &self.name, &self.uid, self.attempt)
    }
}

pub fn metadata_key(namespace: &str, name: &str, uid: &str, attempt: u32) -> String {
    format!("{}/{}/{}/{}", namespace, name, uid, attempt)
}

#[derive(Default)]
struct Inner {
    sandboxes: HashMap<String, PodSandbox>,
    /// Metadata keys of live records plus in-flight creations, so two
    /// concurrent RunPodSandbox calls for the same pod cannot both
    /// reach the backend.
    reserved: HashSet<String>,
}

/// In-memory store for pod sandboxes.
pub struct SandboxStore {
    inner: RwLock<Inner>,
}

impl SandboxStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Reserve a metadata key before any backend work happens. Fails
    /// with AlreadyExists if the same pod is live or mid-creation.
    pub async fn reserve(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.reserved.insert(key.to_string()) {
            return Err(ShimError::AlreadyExists {
                kind: "sandbox",
                id: key.to_string(),
            });
        }
        Ok(())
    }

    /// Release a reservation after a failed creation.
    pub async fn release(&self, key: &str) {
        self.inner.write().await.reserved.remove(key);
    }

    /// Commit a record whose metadata key was reserved earlier.
    pub async fn add(&self, sandbox: PodSandbox) {
        let mut inner = self.inner.write().await;
        inner.sandboxes.insert(sandbox.id.clone(), sandbox);
    }

    /// Insert a record rebuilt from backend state, reserving its key.
    pub async fn adopt(&self, sandbox: PodSandbox) {
        let mut inner = self.inner.write().await;
        inner.reserved.insert(sandbox.metadata_key());
        inner.sandboxes.insert(sandbox.id.clone(), sandbox);
    }

    pub async fn get(&self, id: &str) -> Option<PodSandbox> {
        self.inner.read().await.sandboxes.get(id).cloned()
    }

    /// Remove a record and free its metadata key.
    pub async fn remove(&self, id: &str) -> Option<PodSandbox> {
        let mut inner = self.inner.write().await;
        let removed = inner.sandboxes.remove(id);
        if let Some(sandbox) = &removed {
            let key = sandbox.metadata_key();
            inner.reserved.remove(&key);
        }
        removed
    }

    /// List sandboxes, optionally filtered by labels.
    pub async fn list(&self, label_filter: Option<&HashMap<String, String>>) -> Vec<PodSandbox> {
        let inner = self.inner.read().await;
        inner
            .sandboxes
            .values()
            .filter(|sb| {
                label_filter.map_or(true, |filter| {
                    filter
                        .iter()
                        .all(|(k, v)| sb.labels.get(k).map_or(false, |sv| sv == v))
                })
            })
            .cloned()
            .collect()
    }

    pub async fn update_state(&self, id: &str, state: SandboxState) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(sb) = inner.sandboxes.get_mut(id) {
            sb.state = state;
            true
        } else {
            false
        }
    }
}

impl Default for SandboxStore {
    fn default() -> Self {
        Self::new()
    }
}
