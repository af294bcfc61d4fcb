//! Container records and their store.
//!
//! A container is a supervised process inside its sandbox's VM, tracked
//! by PID plus an exit-code file the launch wrapper writes when the
//! process finishes.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    /// Process fate is unknowable, e.g. the VM became unreachable or the
    /// exit-code file was unreadable. Never silently mapped to exit 0.
    Unknown,
}

/// How a running container's process is tracked within the sandbox VM.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// PID of the wrapper subshell inside the VM.
    pub pid: u32,
    /// In-VM path of the exit-code file.
    pub rc_path: String,
    /// In-VM path of the captured stdout/stderr log.
    pub log_path: String,
}

/// A container within a pod sandbox.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    /// Owning sandbox.
    pub sandbox_id: String,
    pub name: String,
    pub attempt: u32,
    /// Resolved image reference (canonical form).
    pub image_ref: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub working_dir: String,
    pub state: ContainerState,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
    /// Observed exit code; only ever set when the state is Exited.
    pub exit_code: Option<i32>,
    /// Present while the process is (believed) running.
    pub process: Option<ProcessHandle>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Log path relative to the sandbox log directory, from the config.
    pub log_path: String,
}

/// In-memory store for containers.
pub struct ContainerStore {
    containers: RwLock<HashMap<String, Container>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, container: Container) {
        let mut store = self.containers.write().await;
        store.insert(container.id.clone(), container);
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        self.containers.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Container> {
        self.containers.write().await.remove(id)
    }

    /// Apply a mutation to a record, returning false when absent.
    pub async fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Container),
    {
        let mut store = self.containers.write().await;
        match store.get_mut(id) {
            Some(container) => {
                f(container);
                true
            }
            None => false,
        }
    }

    /// List containers, optionally filtered by sandbox and labels.
    pub async fn list(
        &self,
        sandbox_filter: Option<&str>,
        label_filter: Option<&HashMap<String, String>>,
    ) -> Vec<Container> {
        let store = self.containers.read().await;
        store
            .values()
            .filter(|c| sandbox_filter.map_or(true, |sid| c.sandbox_id == sid))
            .filter(|c| {
                label_filter.map_or(true, |filter| {
                    filter
                        .iter()
                        .all(|(k, v)| c.labels.get(k).map_or(false, |cv| cv == v))
                })
            })
            .cloned()
            .collect()
    }

    /// Number of containers owned by a sandbox, for the one-container
    /// occupancy check.
    pub async fn count_for_sandbox(&self, sandbox_id: &str) -> usize {
        let store = self.containers.read().await;
        store
            .values()
            .filter(|c| c.sandbox_id == sandbox_id)
            .count()
    }

    /// Drop all records owned by a sandbox.
    pub async fn remove_by_sandbox(&self, sandbox_id: &str) -> usize {
        let mut store = self.containers.write().await;
        let before = store.len();
        store.retain(|_, c| c.sandbox_id != sandbox_id);
        before - store.len()
    }
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}
