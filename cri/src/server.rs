//! gRPC server over a Unix domain socket.

use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use kina_backend::VmBackend;
use kina_core::config::ShimConfig;
use kina_core::error::{Result, ShimError};

use crate::container::ContainerStore;
use crate::container_manager::ContainerManager;
use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::image_service::KinaImageService;
use crate::images::ImageStore;
use crate::locks::OpLocks;
use crate::reconcile;
use crate::runtime_service::KinaRuntimeService;
use crate::sandbox::SandboxStore;
use crate::sandbox_manager::SandboxManager;
use crate::streaming::StreamingServer;

pub struct CriServer {
    config: ShimConfig,
    backend: Arc<dyn VmBackend>,
}

impl CriServer {
    pub fn new(config: ShimConfig, backend: Arc<dyn VmBackend>) -> Self {
        Self { config, backend }
    }

    /// Bind the socket and serve until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        let socket_path = &self.config.socket_path;
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let sandboxes = Arc::new(SandboxStore::new());
        let containers = Arc::new(ContainerStore::new());
        let images = Arc::new(ImageStore::new());
        let locks = Arc::new(OpLocks::new());

        // Re-adopt VMs from a previous shim lifetime before serving.
        match reconcile::reconcile(&*self.backend, &sandboxes).await {
            Ok(adopted) if adopted > 0 => {
                tracing::info!(adopted = adopted, "Reconciled sandboxes from backend");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation failed, starting with empty state");
            }
        }

        let streaming_addr = self.config.streaming_addr.parse().map_err(|e| {
            ShimError::InvalidArgument(format!(
                "invalid streaming address {}: {}",
                self.config.streaming_addr, e
            ))
        })?;
        let streaming = StreamingServer::new(streaming_addr, self.backend.clone());
        let streaming_handle = streaming.handle();
        tokio::spawn(async move {
            if let Err(e) = streaming.serve().await {
                tracing::error!(error = %e, "Streaming server exited");
            }
        });

        let sandbox_manager = Arc::new(SandboxManager::new(
            sandboxes.clone(),
            containers.clone(),
            self.backend.clone(),
            locks.clone(),
            self.config.sandbox.clone(),
        ));
        let container_manager = Arc::new(ContainerManager::new(
            sandboxes,
            containers,
            self.backend.clone(),
            locks,
            self.config.backend.clone(),
        ));

        let runtime = KinaRuntimeService::new(
            sandbox_manager,
            container_manager,
            self.backend.clone(),
            streaming_handle,
        );
        let image = KinaImageService::new(self.backend.clone(), images);

        let listener = UnixListener::bind(socket_path)?;
        tracing::info!(socket = %socket_path.display(), "CRI server listening");

        Server::builder()
            .add_service(RuntimeServiceServer::new(runtime))
            .add_service(ImageServiceServer::new(image))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .map_err(|e| ShimError::Internal(format!("gRPC server failed: {}", e)))?;

        Ok(())
    }
}
