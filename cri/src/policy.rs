//! Multi-container admission policy.
//!
//! Each sandbox is one VM, and a VM has exactly one network identity.
//! Kubernetes guarantees that containers of the same pod reach each
//! other over localhost, which a second VM cannot honor, so a second
//! container is rejected loudly instead of being given its own VM.
//! Callers that want multi-container pods must merge the specs into a
//! single image before scheduling; the shim never performs that merge.

use kina_core::error::{Result, ShimError};

/// Decide whether a new container may be created in a sandbox that
/// currently owns `occupants` containers.
pub fn admit_container(sandbox_id: &str, occupants: usize) -> Result<()> {
    if occupants == 0 {
        return Ok(());
    }
    Err(ShimError::Unsupported(format!(
        "sandbox {} already has a container; this runtime backs each pod \
         with a single VM and cannot add a second container sharing its \
         network identity. Merge the containers into one image, or split \
         them into separate pods",
        sandbox_id
    )))
}
