//! Kina CRI - Kubernetes Container Runtime Interface implementation.
//!
//! Maps CRI concepts onto a VM-per-container backend:
//! - Pod Sandbox → one dedicated VM (the pod's network identity)
//! - Container → supervised process inside the sandbox's VM
//!
//! A pod therefore holds at most one container; requests for a second
//! container are rejected rather than silently given a VM of their own,
//! which would break the shared-localhost guarantee of the Pod API.

pub mod config_mapper;
pub mod container;
pub mod container_manager;
pub mod error;
pub mod image_service;
pub mod images;
pub mod locks;
pub mod policy;
pub mod reconcile;
pub mod runtime_service;
pub mod sandbox;
pub mod sandbox_manager;
pub mod server;
pub mod streaming;
pub mod task;

/// Generated CRI v1 protobuf types.
pub mod cri_api {
    tonic::include_proto!("runtime.v1");
}
