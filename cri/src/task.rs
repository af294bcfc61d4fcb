//! Cancellation shielding for backend mutations.
//!
//! gRPC cancellation drops the RPC future mid-await. A backend mutation
//! abandoned half-way risks an orphaned VM, so mutation sequences run in
//! a spawned task that keeps driving to completion even when the RPC
//! future awaiting it is dropped. Cancellation suppresses the response,
//! not the side effect.

use std::future::Future;

/// Run a future on its own task and await the result.
pub async fn shield<F>(fut: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(value) => value,
        // The spawned task is never aborted, so a join error is a panic.
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}
