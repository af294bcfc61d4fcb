//! The backend capability set consumed by the CRI shim.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use kina_core::error::Result;

/// Specification for creating a backend unit (one VM).
#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    /// Unit name; the shim names units after the owning sandbox ID so
    /// state can be rebuilt from backend queries alone.
    pub name: String,
    /// Image reference to boot from.
    pub image: String,
    /// Entrypoint override. Empty means the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Labels attached to the unit; round-tripped through `list_units`.
    pub labels: HashMap<String, String>,
    /// VM hostname.
    pub hostname: String,
    /// Virtual CPU count. None means the backend default.
    pub vcpus: Option<u32>,
    /// Memory in MiB. None means the backend default.
    pub memory_mb: Option<u32>,
}

/// Coarse unit state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Stopped,
    Unknown,
}

/// Read-only status snapshot of a unit.
#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub state: UnitState,
    /// Address assigned by the backend's network stack; not chosen by
    /// the shim. None until the VM has finished bringing up networking.
    pub network_address: Option<String>,
    /// Exit code of the unit's init process, when the backend knows it.
    pub exit_code: Option<i32>,
}

/// One entry of a backend unit listing.
#[derive(Debug, Clone)]
pub struct UnitSummary {
    pub id: String,
    pub state: UnitState,
    pub network_address: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Captured output of a synchronous exec inside a unit.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Basic information about an image held by the backend.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Reference as known to the backend, e.g. `docker.io/library/alpine:latest`.
    pub reference: String,
    /// Content digest, e.g. `sha256:abc...`. Empty when unknown.
    pub digest: String,
    pub size_bytes: u64,
}

/// Capability set over the virtualization backend.
///
/// Every method may block on external I/O and carries a bounded timeout
/// internal to the implementation. Implementations do not serialize
/// conflicting operations on the same unit; the callers' per-ID locks do.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Create a unit from a spec. Returns the backend unit ID.
    async fn create(&self, spec: &UnitSpec) -> Result<String>;

    /// Boot a created unit.
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop a unit, allowing `grace` before the backend escalates.
    /// Stopping an already-stopped unit is a no-op.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Remove a unit. Removing an absent unit is a no-op.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Run a command synchronously inside a running unit.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Fetch current status. Safe to call at polling frequency.
    async fn inspect(&self, id: &str) -> Result<UnitStatus>;

    /// List all units known to the backend, with labels.
    async fn list_units(&self) -> Result<Vec<UnitSummary>>;

    /// Pull an image and return what the backend now knows about it.
    async fn pull_image(&self, reference: &str) -> Result<ImageInfo>;

    /// List all locally present images.
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Status of a single image; None when not present locally.
    async fn image_status(&self, reference: &str) -> Result<Option<ImageInfo>>;

    /// Remove an image. Removing an absent image is a no-op.
    async fn remove_image(&self, reference: &str) -> Result<()>;
}
