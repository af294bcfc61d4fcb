//! CRI ImageService implementation.
//!
//! The backend owns image storage; every listing refreshes the shim's
//! cached view so kubelet always sees what the backend actually holds.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use kina_backend::{ImageInfo, ImageReference, VmBackend};
use kina_core::error::ShimError;

use crate::cri_api;
use crate::cri_api::image_service_server::ImageService;
use crate::error::shim_error_to_status;
use crate::images::{ImageLocalState, ImageRecord, ImageStore};
use crate::task;

/// Mountpoint reported for image storage. The backend does not expose
/// its real location, so a stable placeholder is used.
const IMAGE_FS_MOUNTPOINT: &str = "/var/lib/kina/images";

pub struct KinaImageService {
    backend: Arc<dyn VmBackend>,
    images: Arc<ImageStore>,
}

impl KinaImageService {
    pub fn new(backend: Arc<dyn VmBackend>, images: Arc<ImageStore>) -> Self {
        Self { backend, images }
    }
}

fn parse_image_spec(spec: Option<&cri_api::ImageSpec>) -> Result<ImageReference, Status> {
    let spec = spec.ok_or_else(|| Status::invalid_argument("image spec required"))?;
    if spec.image.is_empty() {
        return Err(Status::invalid_argument("image reference required"));
    }
    ImageReference::parse(&spec.image).map_err(shim_error_to_status)
}

fn info_to_record(info: &ImageInfo) -> ImageRecord {
    ImageRecord {
        reference: info.reference.clone(),
        digest: info.digest.clone(),
        size_bytes: info.size_bytes,
        local_state: ImageLocalState::Present,
    }
}

fn record_to_cri(record: &ImageRecord) -> cri_api::Image {
    let repo_digests = if record.digest.is_empty() {
        vec![]
    } else {
        // reference@digest, with any tag dropped as digests pin content.
        let base = record
            .reference
            .rsplit_once(':')
            .filter(|(_, tag)| !tag.contains('/'))
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| record.reference.clone());
        vec![format!("{}@{}", base, record.digest)]
    };

    cri_api::Image {
        id: if record.digest.is_empty() {
            record.reference.clone()
        } else {
            record.digest.clone()
        },
        repo_tags: vec![record.reference.clone()],
        repo_digests,
        size: record.size_bytes,
        uid: None,
        username: String::new(),
        spec: Some(cri_api::ImageSpec {
            image: record.reference.clone(),
            annotations: Default::default(),
        }),
        pinned: false,
    }
}

#[tonic::async_trait]
impl ImageService for KinaImageService {
    async fn list_images(
        &self,
        request: Request<cri_api::ListImagesRequest>,
    ) -> Result<Response<cri_api::ListImagesResponse>, Status> {
        let filter = request.into_inner().filter;

        let infos = self
            .backend
            .list_images()
            .await
            .map_err(shim_error_to_status)?;
        self.images
            .refresh(infos.iter().map(info_to_record).collect())
            .await;

        let wanted = match filter.and_then(|f| f.image).filter(|s| !s.image.is_empty()) {
            Some(spec) => Some(ImageReference::parse(&spec.image).map_err(shim_error_to_status)?),
            None => None,
        };

        let images = infos
            .iter()
            .filter(|info| wanted.as_ref().map_or(true, |r| r.matches(info)))
            .map(|info| record_to_cri(&info_to_record(info)))
            .collect();
        Ok(Response::new(cri_api::ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<cri_api::ImageStatusRequest>,
    ) -> Result<Response<cri_api::ImageStatusResponse>, Status> {
        let req = request.into_inner();
        let reference = parse_image_spec(req.image.as_ref())?;
        let canonical = reference.canonical();

        let info = self
            .backend
            .image_status(&canonical)
            .await
            .map_err(shim_error_to_status)?;

        // Absent images are an empty response, not an error.
        let image = info.map(|info| record_to_cri(&info_to_record(&info)));
        Ok(Response::new(cri_api::ImageStatusResponse {
            image,
            info: Default::default(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<cri_api::PullImageRequest>,
    ) -> Result<Response<cri_api::PullImageResponse>, Status> {
        let req = request.into_inner();
        let reference = parse_image_spec(req.image.as_ref())?;
        let canonical = reference.canonical();

        tracing::info!(image = %canonical, "PullImage");

        if !self.images.begin_pull(&canonical).await {
            return Err(shim_error_to_status(ShimError::AlreadyExists {
                kind: "image pull",
                id: canonical,
            }));
        }

        let backend = self.backend.clone();
        let pull_ref = canonical.clone();
        let result =
            task::shield(async move { backend.pull_image(&pull_ref).await }).await;

        match result {
            Ok(info) => {
                self.images
                    .finish_pull(&canonical, Some(info_to_record(&info)))
                    .await;
                let image_ref = if info.digest.is_empty() {
                    info.reference
                } else {
                    info.digest
                };
                Ok(Response::new(cri_api::PullImageResponse { image_ref }))
            }
            Err(e) => {
                self.images.finish_pull(&canonical, None).await;
                Err(shim_error_to_status(e))
            }
        }
    }

    async fn remove_image(
        &self,
        request: Request<cri_api::RemoveImageRequest>,
    ) -> Result<Response<cri_api::RemoveImageResponse>, Status> {
        let req = request.into_inner();
        let reference = parse_image_spec(req.image.as_ref())?;
        let canonical = reference.canonical();

        tracing::info!(image = %canonical, "RemoveImage");

        // Idempotent: removing an absent image succeeds.
        match self.backend.remove_image(&canonical).await {
            Ok(()) | Err(ShimError::NotFound { .. }) => {}
            Err(e) => return Err(shim_error_to_status(e)),
        }
        self.images.remove(&canonical).await;
        Ok(Response::new(cri_api::RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<cri_api::ImageFsInfoRequest>,
    ) -> Result<Response<cri_api::ImageFsInfoResponse>, Status> {
        let infos = self
            .backend
            .list_images()
            .await
            .map_err(shim_error_to_status)?;
        let used: u64 = infos.iter().map(|i| i.size_bytes).sum();

        Ok(Response::new(cri_api::ImageFsInfoResponse {
            image_filesystems: vec![cri_api::FilesystemUsage {
                timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
                fs_id: Some(cri_api::FilesystemIdentifier {
                    mountpoint: IMAGE_FS_MOUNTPOINT.to_string(),
                }),
                used_bytes: Some(cri_api::UInt64Value { value: used }),
                inodes_used: None,
            }],
        }))
    }
}

#[cfg(test)]
mod tests {
    use kina_backend::mock::MockBackend;
    use tonic::Code;

    use super::*;

    fn service(backend: Arc<MockBackend>) -> KinaImageService {
        KinaImageService::new(backend, Arc::new(ImageStore::new()))
    }

    #[tokio::test]
    async fn test_pull_then_status_and_list() {
        let backend = Arc::new(MockBackend::new());
        let svc = service(backend);

        let spec = cri_api::ImageSpec {
            image: "alpine".to_string(),
            annotations: Default::default(),
        };
        let resp = svc
            .pull_image(Request::new(cri_api::PullImageRequest {
                image: Some(spec.clone()),
                auth: None,
                sandbox_config: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.image_ref.is_empty());

        let status = svc
            .image_status(Request::new(cri_api::ImageStatusRequest {
                image: Some(spec.clone()),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner();
        let image = status.image.unwrap();
        // Bare names canonicalize before reaching the backend.
        assert_eq!(image.repo_tags, vec!["docker.io/library/alpine:latest"]);

        let list = svc
            .list_images(Request::new(cri_api::ListImagesRequest { filter: None }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(list.images.len(), 1);
    }

    #[tokio::test]
    async fn test_list_images_filter() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_image("docker.io/library/alpine:latest");
        backend.seed_image("docker.io/library/nginx:1.25");
        let svc = service(backend);

        let filtered = |image: &str| cri_api::ListImagesRequest {
            filter: Some(cri_api::ImageFilter {
                image: Some(cri_api::ImageSpec {
                    image: image.to_string(),
                    annotations: Default::default(),
                }),
            }),
        };

        let list = svc
            .list_images(Request::new(filtered("nginx:1.25")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(list.images.len(), 1);
        assert_eq!(
            list.images[0].repo_tags,
            vec!["docker.io/library/nginx:1.25"]
        );

        // A filter whose spec carries an empty name matches everything.
        let list = svc
            .list_images(Request::new(filtered("")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(list.images.len(), 2);
    }

    #[tokio::test]
    async fn test_status_of_absent_image_is_empty() {
        let backend = Arc::new(MockBackend::new());
        let svc = service(backend);

        let resp = svc
            .image_status(Request::new(cri_api::ImageStatusRequest {
                image: Some(cri_api::ImageSpec {
                    image: "ghcr.io/kina/absent:v9".to_string(),
                    annotations: Default::default(),
                }),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.image.is_none());
    }

    #[tokio::test]
    async fn test_missing_image_spec_rejected() {
        let backend = Arc::new(MockBackend::new());
        let svc = service(backend);

        let err = svc
            .image_status(Request::new(cri_api::ImageStatusRequest {
                image: None,
                verbose: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_remove_absent_image_succeeds() {
        let backend = Arc::new(MockBackend::new());
        let svc = service(backend);

        svc.remove_image(Request::new(cri_api::RemoveImageRequest {
            image: Some(cri_api::ImageSpec {
                image: "alpine".to_string(),
                annotations: Default::default(),
            }),
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_image_fs_info_sums_sizes() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_image("docker.io/library/alpine:latest");
        backend.seed_image("docker.io/library/nginx:1.25");
        let svc = service(backend.clone());

        let total: u64 = backend
            .list_images()
            .await
            .unwrap()
            .iter()
            .map(|i| i.size_bytes)
            .sum();
        let resp = svc
            .image_fs_info(Request::new(cri_api::ImageFsInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        let fs = &resp.image_filesystems[0];
        assert_eq!(fs.used_bytes.as_ref().unwrap().value, total);
        assert!(total > 0);
        assert_eq!(
            fs.fs_id.as_ref().unwrap().mountpoint,
            IMAGE_FS_MOUNTPOINT
        );
    }
}
