//! CRI RuntimeService implementation.
//!
//! Thin gRPC layer: requests are validated, handed to the sandbox and
//! container managers, and their results mapped back into CRI messages.
//! All state transitions live in the managers; this module only
//! translates.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use kina_backend::VmBackend;
use kina_core::error::ShimError;

use crate::container::{Container, ContainerState};
use crate::container_manager::ContainerManager;
use crate::cri_api;
use crate::cri_api::runtime_service_server::RuntimeService;
use crate::error::shim_error_to_status;
use crate::sandbox::{PodSandbox, SandboxState};
use crate::sandbox_manager::SandboxManager;
use crate::streaming::{StreamingHandle, StreamingSession};

/// CRI API version implemented by this runtime.
const API_VERSION: &str = "0.1.0";

pub struct KinaRuntimeService {
    sandbox_manager: Arc<SandboxManager>,
    container_manager: Arc<ContainerManager>,
    backend: Arc<dyn VmBackend>,
    streaming: StreamingHandle,
}

impl KinaRuntimeService {
    pub fn new(
        sandbox_manager: Arc<SandboxManager>,
        container_manager: Arc<ContainerManager>,
        backend: Arc<dyn VmBackend>,
        streaming: StreamingHandle,
    ) -> Self {
        Self {
            sandbox_manager,
            container_manager,
            backend,
            streaming,
        }
    }

    async fn running_container(&self, id: &str) -> Result<(Container, PodSandbox), Status> {
        let container = self
            .container_manager
            .get(id)
            .await
            .ok_or_else(|| shim_error_to_status(ShimError::container_not_found(id)))?;
        if container.state != ContainerState::Running {
            return Err(Status::failed_precondition(format!(
                "container {} is not running",
                id
            )));
        }
        let sandbox = self
            .container_manager
            .sandbox_for(&container)
            .await
            .map_err(shim_error_to_status)?;
        Ok((container, sandbox))
    }
}

fn sandbox_state_to_cri(state: SandboxState) -> cri_api::PodSandboxState {
    match state {
        SandboxState::Ready => cri_api::PodSandboxState::SandboxReady,
        SandboxState::NotReady => cri_api::PodSandboxState::SandboxNotready,
    }
}

fn container_state_to_cri(state: ContainerState) -> cri_api::ContainerState {
    match state {
        ContainerState::Created => cri_api::ContainerState::ContainerCreated,
        ContainerState::Running => cri_api::ContainerState::ContainerRunning,
        ContainerState::Exited => cri_api::ContainerState::ContainerExited,
        ContainerState::Unknown => cri_api::ContainerState::ContainerUnknown,
    }
}

fn sandbox_metadata(sandbox: &PodSandbox) -> cri_api::PodSandboxMetadata {
    cri_api::PodSandboxMetadata {
        name: sandbox.name.clone(),
        uid: sandbox.uid.clone(),
        namespace: sandbox.namespace.clone(),
        attempt: sandbox.attempt,
    }
}

fn sandbox_to_status(sandbox: &PodSandbox) -> cri_api::PodSandboxStatus {
    cri_api::PodSandboxStatus {
        id: sandbox.id.clone(),
        metadata: Some(sandbox_metadata(sandbox)),
        state: sandbox_state_to_cri(sandbox.state) as i32,
        created_at: sandbox.created_at,
        network: Some(cri_api::PodSandboxNetworkStatus {
            ip: sandbox.network_address.clone().unwrap_or_default(),
            additional_ips: vec![],
        }),
        labels: sandbox.labels.clone(),
        annotations: sandbox.annotations.clone(),
        runtime_handler: sandbox.runtime_handler.clone(),
    }
}

fn sandbox_to_item(sandbox: &PodSandbox) -> cri_api::PodSandbox {
    cri_api::PodSandbox {
        id: sandbox.id.clone(),
        metadata: Some(sandbox_metadata(sandbox)),
        state: sandbox_state_to_cri(sandbox.state) as i32,
        created_at: sandbox.created_at,
        labels: sandbox.labels.clone(),
        annotations: sandbox.annotations.clone(),
        runtime_handler: sandbox.runtime_handler.clone(),
    }
}

fn container_metadata(container: &Container) -> cri_api::ContainerMetadata {
    cri_api::ContainerMetadata {
        name: container.name.clone(),
        attempt: container.attempt,
    }
}

fn container_to_item(container: &Container) -> cri_api::Container {
    cri_api::Container {
        id: container.id.clone(),
        pod_sandbox_id: container.sandbox_id.clone(),
        metadata: Some(container_metadata(container)),
        image: Some(cri_api::ImageSpec {
            image: container.image_ref.clone(),
            annotations: Default::default(),
        }),
        image_ref: container.image_ref.clone(),
        state: container_state_to_cri(container.state) as i32,
        created_at: container.created_at,
        labels: container.labels.clone(),
        annotations: container.annotations.clone(),
    }
}

fn container_to_status(container: &Container) -> cri_api::ContainerStatus {
    cri_api::ContainerStatus {
        id: container.id.clone(),
        metadata: Some(container_metadata(container)),
        state: container_state_to_cri(container.state) as i32,
        created_at: container.created_at,
        started_at: container.started_at,
        finished_at: container.finished_at,
        exit_code: container.exit_code.unwrap_or(0),
        image: Some(cri_api::ImageSpec {
            image: container.image_ref.clone(),
            annotations: Default::default(),
        }),
        image_ref: container.image_ref.clone(),
        reason: String::new(),
        message: String::new(),
        labels: container.labels.clone(),
        annotations: container.annotations.clone(),
        mounts: vec![],
        log_path: container.log_path.clone(),
    }
}

#[tonic::async_trait]
impl RuntimeService for KinaRuntimeService {
    async fn version(
        &self,
        _request: Request<cri_api::VersionRequest>,
    ) -> Result<Response<cri_api::VersionResponse>, Status> {
        Ok(Response::new(cri_api::VersionResponse {
            version: API_VERSION.to_string(),
            runtime_name: kina_core::RUNTIME_NAME.to_string(),
            runtime_version: kina_core::VERSION.to_string(),
            runtime_api_version: "v1".to_string(),
        }))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<cri_api::RunPodSandboxRequest>,
    ) -> Result<Response<cri_api::RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("sandbox config required"))?;

        tracing::info!(
            name = %config.metadata.as_ref().map(|m| m.name.as_str()).unwrap_or(""),
            namespace = %config.metadata.as_ref().map(|m| m.namespace.as_str()).unwrap_or(""),
            "RunPodSandbox"
        );

        let id = self
            .sandbox_manager
            .run(&config, &req.runtime_handler)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(cri_api::RunPodSandboxResponse {
            pod_sandbox_id: id,
        }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<cri_api::StopPodSandboxRequest>,
    ) -> Result<Response<cri_api::StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(sandbox_id = %req.pod_sandbox_id, "StopPodSandbox");

        self.sandbox_manager
            .stop(&req.pod_sandbox_id)
            .await
            .map_err(shim_error_to_status)?;
        Ok(Response::new(cri_api::StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<cri_api::RemovePodSandboxRequest>,
    ) -> Result<Response<cri_api::RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(sandbox_id = %req.pod_sandbox_id, "RemovePodSandbox");

        self.sandbox_manager
            .remove(&req.pod_sandbox_id)
            .await
            .map_err(shim_error_to_status)?;
        Ok(Response::new(cri_api::RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<cri_api::PodSandboxStatusRequest>,
    ) -> Result<Response<cri_api::PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();
        let sandbox = self
            .sandbox_manager
            .status(&req.pod_sandbox_id)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(cri_api::PodSandboxStatusResponse {
            status: Some(sandbox_to_status(&sandbox)),
            info: Default::default(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<cri_api::ListPodSandboxRequest>,
    ) -> Result<Response<cri_api::ListPodSandboxResponse>, Status> {
        let filter = request.into_inner().filter;

        let label_selector = filter
            .as_ref()
            .filter(|f| !f.label_selector.is_empty())
            .map(|f| f.label_selector.clone());
        let mut sandboxes = self
            .sandbox_manager
            .list(label_selector.as_ref())
            .await;

        if let Some(filter) = filter {
            if !filter.id.is_empty() {
                sandboxes.retain(|sb| sb.id == filter.id);
            }
            if let Some(state) = filter.state {
                sandboxes
                    .retain(|sb| sandbox_state_to_cri(sb.state) as i32 == state.state);
            }
        }

        let items = sandboxes.iter().map(sandbox_to_item).collect();
        Ok(Response::new(cri_api::ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<cri_api::CreateContainerRequest>,
    ) -> Result<Response<cri_api::CreateContainerResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("container config required"))?;

        tracing::info!(
            sandbox_id = %req.pod_sandbox_id,
            name = %config.metadata.as_ref().map(|m| m.name.as_str()).unwrap_or(""),
            "CreateContainer"
        );

        let id = self
            .container_manager
            .create(&req.pod_sandbox_id, &config)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(cri_api::CreateContainerResponse {
            container_id: id,
        }))
    }

    async fn start_container(
        &self,
        request: Request<cri_api::StartContainerRequest>,
    ) -> Result<Response<cri_api::StartContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, "StartContainer");

        self.container_manager
            .start(&req.container_id)
            .await
            .map_err(shim_error_to_status)?;
        Ok(Response::new(cri_api::StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<cri_api::StopContainerRequest>,
    ) -> Result<Response<cri_api::StopContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(
            container_id = %req.container_id,
            timeout = req.timeout,
            "StopContainer"
        );

        self.container_manager
            .stop(&req.container_id, req.timeout)
            .await
            .map_err(shim_error_to_status)?;
        Ok(Response::new(cri_api::StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<cri_api::RemoveContainerRequest>,
    ) -> Result<Response<cri_api::RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, "RemoveContainer");

        self.container_manager
            .remove(&req.container_id)
            .await
            .map_err(shim_error_to_status)?;
        Ok(Response::new(cri_api::RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<cri_api::ListContainersRequest>,
    ) -> Result<Response<cri_api::ListContainersResponse>, Status> {
        let filter = request.into_inner().filter;

        let sandbox_id = filter
            .as_ref()
            .map(|f| f.pod_sandbox_id.as_str())
            .filter(|s| !s.is_empty());
        let label_selector = filter
            .as_ref()
            .filter(|f| !f.label_selector.is_empty())
            .map(|f| f.label_selector.clone());
        let mut containers = self
            .container_manager
            .list(sandbox_id, label_selector.as_ref())
            .await;

        if let Some(filter) = filter {
            if !filter.id.is_empty() {
                containers.retain(|c| c.id == filter.id);
            }
            if let Some(state) = filter.state {
                containers
                    .retain(|c| container_state_to_cri(c.state) as i32 == state.state);
            }
        }

        let containers = containers.iter().map(container_to_item).collect();
        Ok(Response::new(cri_api::ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<cri_api::ContainerStatusRequest>,
    ) -> Result<Response<cri_api::ContainerStatusResponse>, Status> {
        let req = request.into_inner();
        let container = self
            .container_manager
            .status(&req.container_id)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(cri_api::ContainerStatusResponse {
            status: Some(container_to_status(&container)),
            info: Default::default(),
        }))
    }

    async fn update_container_resources(
        &self,
        _request: Request<cri_api::UpdateContainerResourcesRequest>,
    ) -> Result<Response<cri_api::UpdateContainerResourcesResponse>, Status> {
        // VM sizing is fixed at sandbox creation.
        Err(Status::unimplemented(
            "UpdateContainerResources is not supported",
        ))
    }

    async fn reopen_container_log(
        &self,
        _request: Request<cri_api::ReopenContainerLogRequest>,
    ) -> Result<Response<cri_api::ReopenContainerLogResponse>, Status> {
        Err(Status::unimplemented("ReopenContainerLog is not supported"))
    }

    async fn exec_sync(
        &self,
        request: Request<cri_api::ExecSyncRequest>,
    ) -> Result<Response<cri_api::ExecSyncResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, cmd = ?req.cmd, "ExecSync");

        let output = self
            .container_manager
            .exec_sync(&req.container_id, &req.cmd, req.timeout)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(cri_api::ExecSyncResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }))
    }

    async fn exec(
        &self,
        request: Request<cri_api::ExecRequest>,
    ) -> Result<Response<cri_api::ExecResponse>, Status> {
        let req = request.into_inner();
        if req.cmd.is_empty() {
            return Err(Status::invalid_argument("exec command required"));
        }
        let (_, sandbox) = self.running_container(&req.container_id).await?;

        tracing::info!(container_id = %req.container_id, cmd = ?req.cmd, "Exec");
        let url = self
            .streaming
            .register(StreamingSession::exec(sandbox.backend_id, req.cmd))
            .await;
        Ok(Response::new(cri_api::ExecResponse { url }))
    }

    async fn attach(
        &self,
        request: Request<cri_api::AttachRequest>,
    ) -> Result<Response<cri_api::AttachResponse>, Status> {
        let req = request.into_inner();
        let (container, sandbox) = self.running_container(&req.container_id).await?;
        let handle = container.process.ok_or_else(|| {
            Status::failed_precondition(format!(
                "container {} has no running process",
                req.container_id
            ))
        })?;

        tracing::info!(container_id = %req.container_id, "Attach");
        let url = self
            .streaming
            .register(StreamingSession::attach(
                sandbox.backend_id,
                handle.log_path,
            ))
            .await;
        Ok(Response::new(cri_api::AttachResponse { url }))
    }

    async fn port_forward(
        &self,
        request: Request<cri_api::PortForwardRequest>,
    ) -> Result<Response<cri_api::PortForwardResponse>, Status> {
        let req = request.into_inner();
        let sandbox = self
            .sandbox_manager
            .get(&req.pod_sandbox_id)
            .await
            .ok_or_else(|| {
                shim_error_to_status(ShimError::sandbox_not_found(&req.pod_sandbox_id))
            })?;
        if sandbox.state != SandboxState::Ready {
            return Err(Status::failed_precondition(format!(
                "sandbox {} is not ready",
                req.pod_sandbox_id
            )));
        }
        let address = sandbox.network_address.ok_or_else(|| {
            Status::failed_precondition(format!(
                "sandbox {} has no network address",
                req.pod_sandbox_id
            ))
        })?;

        tracing::info!(sandbox_id = %req.pod_sandbox_id, ports = ?req.port, "PortForward");
        let url = self
            .streaming
            .register(StreamingSession::port_forward(address, req.port))
            .await;
        Ok(Response::new(cri_api::PortForwardResponse { url }))
    }

    async fn status(
        &self,
        _request: Request<cri_api::StatusRequest>,
    ) -> Result<Response<cri_api::StatusResponse>, Status> {
        // The backend daemon is the single dependency: both runtime and
        // network readiness follow its reachability.
        let backend_ok = self.backend.list_units().await.is_ok();
        let (reason, message) = if backend_ok {
            (String::new(), String::new())
        } else {
            (
                "BackendUnreachable".to_string(),
                "VM backend is not responding".to_string(),
            )
        };

        let conditions = vec![
            cri_api::RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: backend_ok,
                reason: reason.clone(),
                message: message.clone(),
            },
            cri_api::RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: backend_ok,
                reason,
                message,
            },
        ];

        Ok(Response::new(cri_api::StatusResponse {
            status: Some(cri_api::RuntimeStatus { conditions }),
            info: Default::default(),
        }))
    }

    async fn update_runtime_config(
        &self,
        request: Request<cri_api::UpdateRuntimeConfigRequest>,
    ) -> Result<Response<cri_api::UpdateRuntimeConfigResponse>, Status> {
        // The backend manages pod addressing itself; the kubelet's CIDR
        // is acknowledged and ignored.
        let cidr = request
            .into_inner()
            .runtime_config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .unwrap_or_default();
        tracing::info!(pod_cidr = %cidr, "UpdateRuntimeConfig (ignored)");
        Ok(Response::new(cri_api::UpdateRuntimeConfigResponse {}))
    }
}
