//! Image records and their store.
//!
//! The backend owns image storage; this store is the shim's view of it,
//! tracking in-flight pulls and caching what the backend last reported.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

/// Local presence of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLocalState {
    Present,
    Pulling,
}

/// An image known to the shim, keyed by canonical reference.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Canonical reference, e.g. `docker.io/library/alpine:latest`.
    pub reference: String,
    pub digest: String,
    pub size_bytes: u64,
    pub local_state: ImageLocalState,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, ImageRecord>,
    pulling: HashSet<String>,
}

/// In-memory store for image records.
pub struct ImageStore {
    inner: RwLock<Inner>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Mark a pull in flight. Returns false when a pull for the same
    /// reference is already running.
    pub async fn begin_pull(&self, reference: &str) -> bool {
        self.inner.write().await.pulling.insert(reference.to_string())
    }

    /// Clear the in-flight marker; on success, record the image.
    pub async fn finish_pull(&self, reference: &str, record: Option<ImageRecord>) {
        let mut inner = self.inner.write().await;
        inner.pulling.remove(reference);
        if let Some(record) = record {
            inner.records.insert(record.reference.clone(), record);
        }
    }

    pub async fn get(&self, reference: &str) -> Option<ImageRecord> {
        let inner = self.inner.read().await;
        if inner.pulling.contains(reference) {
            return Some(ImageRecord {
                reference: reference.to_string(),
                digest: String::new(),
                size_bytes: 0,
                local_state: ImageLocalState::Pulling,
            });
        }
        inner.records.get(reference).cloned()
    }

    pub async fn remove(&self, reference: &str) {
        self.inner.write().await.records.remove(reference);
    }

    pub async fn list(&self) -> Vec<ImageRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }

    /// Replace the cached view with what the backend reports.
    pub async fn refresh(&self, records: Vec<ImageRecord>) {
        let mut inner = self.inner.write().await;
        inner.records = records
            .into_iter()
            .map(|r| (r.reference.clone(), r))
            .collect();
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(reference: &str) -> ImageRecord {
        ImageRecord {
            reference: reference.to_string(),
            digest: "sha256:abc".to_string(),
            size_bytes: 100,
            local_state: ImageLocalState::Present,
        }
    }

    #[tokio::test]
    async fn test_pull_tracking() {
        let store = ImageStore::new();
        assert!(store.begin_pull("docker.io/library/alpine:latest").await);
        // A second concurrent pull of the same reference is rejected.
        assert!(!store.begin_pull("docker.io/library/alpine:latest").await);

        let pulling = store.get("docker.io/library/alpine:latest").await.unwrap();
        assert_eq!(pulling.local_state, ImageLocalState::Pulling);

        store
            .finish_pull(
                "docker.io/library/alpine:latest",
                Some(present("docker.io/library/alpine:latest")),
            )
            .await;
        let got = store.get("docker.io/library/alpine:latest").await.unwrap();
        assert_eq!(got.local_state, ImageLocalState::Present);
        assert!(store.begin_pull("docker.io/library/alpine:latest").await);
    }

    #[tokio::test]
    async fn test_failed_pull_leaves_image_absent() {
        let store = ImageStore::new();
        assert!(store.begin_pull("docker.io/library/nginx:1.25").await);
        store.finish_pull("docker.io/library/nginx:1.25", None).await;
        assert!(store.get("docker.io/library/nginx:1.25").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_replaces_view() {
        let store = ImageStore::new();
        store
            .finish_pull("a", Some(present("docker.io/library/a:latest")))
            .await;
        store
            .refresh(vec![present("docker.io/library/b:latest")])
            .await;

        let refs: Vec<_> = store.list().await.into_iter().map(|r| r.reference).collect();
        assert_eq!(refs, vec!["docker.io/library/b:latest"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = ImageStore::new();
        store
            .finish_pull("a", Some(present("docker.io/library/a:latest")))
            .await;
        store.remove("docker.io/library/a:latest").await;
        assert!(store.get("docker.io/library/a:latest").await.is_none());
    }
}
