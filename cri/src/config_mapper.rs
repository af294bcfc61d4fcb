//! Map Kubernetes CRI configs to backend unit specs, and back.
//!
//! The unit carries `io.kina.*` labels holding everything needed to
//! rebuild a sandbox record from a bare `list_units` call after a shim
//! restart. Pod labels and annotations round-trip under dedicated
//! prefixes.
//!
//! Kina-specific annotations on the pod:
//! - `kina.dev/sandbox-image` → image the sandbox VM boots from
//! - `kina.dev/vcpus`, `kina.dev/memory-mb` → VM sizing

use std::collections::HashMap;

use kina_backend::{UnitSpec, UnitState, UnitSummary};
use kina_core::config::SandboxConfig;
use kina_core::error::{Result, ShimError};

use crate::cri_api::PodSandboxConfig;
use crate::sandbox::{PodSandbox, SandboxState};

pub const LABEL_SANDBOX_ID: &str = "io.kina.sandbox-id";
pub const LABEL_POD_NAME: &str = "io.kina.pod-name";
pub const LABEL_POD_NAMESPACE: &str = "io.kina.pod-namespace";
pub const LABEL_POD_UID: &str = "io.kina.pod-uid";
pub const LABEL_POD_ATTEMPT: &str = "io.kina.pod-attempt";
pub const LABEL_CREATED_AT: &str = "io.kina.created-at";
pub const LABEL_RUNTIME_HANDLER: &str = "io.kina.runtime-handler";
pub const LABEL_LOG_DIRECTORY: &str = "io.kina.log-directory";
pub const LABEL_POD_LABEL_PREFIX: &str = "io.kina.podlabel.";
pub const LABEL_POD_ANNOTATION_PREFIX: &str = "io.kina.podann.";

const ANN_SANDBOX_IMAGE: &str = "kina.dev/sandbox-image";
const ANN_VCPUS: &str = "kina.dev/vcpus";
const ANN_MEMORY_MB: &str = "kina.dev/memory-mb";

/// Init process of the sandbox VM: an idle supervisor loop. Container
/// processes are launched next to it via exec.
const SUPERVISOR_COMMAND: &[&str] = &["/bin/sh", "-c", "while true; do sleep 2147483; done"];

/// Build the backend unit spec for a new sandbox.
pub fn sandbox_unit_spec(
    sandbox: &PodSandbox,
    config: &PodSandboxConfig,
    defaults: &SandboxConfig,
) -> Result<UnitSpec> {
    let annotations = &config.annotations;

    let image = annotations
        .get(ANN_SANDBOX_IMAGE)
        .cloned()
        .unwrap_or_else(|| defaults.image.clone());
    if image.is_empty() {
        return Err(ShimError::InvalidArgument(
            "sandbox image must not be empty".to_string(),
        ));
    }

    let vcpus = parse_annotation_u32(annotations, ANN_VCPUS)?;
    let memory_mb = parse_annotation_u32(annotations, ANN_MEMORY_MB)?;

    let hostname = if config.hostname.is_empty() {
        sandbox.name.clone()
    } else {
        config.hostname.clone()
    };

    Ok(UnitSpec {
        name: sandbox.id.clone(),
        image,
        command: SUPERVISOR_COMMAND.iter().map(|s| s.to_string()).collect(),
        env: Vec::new(),
        labels: sandbox_labels(sandbox),
        hostname,
        vcpus,
        memory_mb,
    })
}

/// Labels that make the sandbox record reconstructible from the unit.
fn sandbox_labels(sandbox: &PodSandbox) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox.id.clone());
    labels.insert(LABEL_POD_NAME.to_string(), sandbox.name.clone());
    labels.insert(LABEL_POD_NAMESPACE.to_string(), sandbox.namespace.clone());
    labels.insert(LABEL_POD_UID.to_string(), sandbox.uid.clone());
    labels.insert(LABEL_POD_ATTEMPT.to_string(), sandbox.attempt.to_string());
    labels.insert(
        LABEL_CREATED_AT.to_string(),
        sandbox.created_at.to_string(),
    );
    labels.insert(
        LABEL_RUNTIME_HANDLER.to_string(),
        sandbox.runtime_handler.clone(),
    );
    labels.insert(
        LABEL_LOG_DIRECTORY.to_string(),
        sandbox.log_directory.clone(),
    );
    for (k, v) in &sandbox.labels {
        labels.insert(format!("{}{}", LABEL_POD_LABEL_PREFIX, k), v.clone());
    }
    for (k, v) in &sandbox.annotations {
        labels.insert(format!("{}{}", LABEL_POD_ANNOTATION_PREFIX, k), v.clone());
    }
    labels
}

/// Rebuild a sandbox record from a backend unit listing. Returns None
/// when the unit carries no shim labels (not ours to manage).
pub fn sandbox_from_unit(unit: &UnitSummary) -> Option<PodSandbox> {
    let id = unit.labels.get(LABEL_SANDBOX_ID)?.clone();

    let get = |key: &str| unit.labels.get(key).cloned().unwrap_or_default();
    let mut labels = HashMap::new();
    let mut annotations = HashMap::new();
    for (k, v) in &unit.labels {
        if let Some(name) = k.strip_prefix(LABEL_POD_LABEL_PREFIX) {
            labels.insert(name.to_string(), v.clone());
        } else if let Some(name) = k.strip_prefix(LABEL_POD_ANNOTATION_PREFIX) {
            annotations.insert(name.to_string(), v.clone());
        }
    }

    Some(PodSandbox {
        id,
        name: get(LABEL_POD_NAME),
        namespace: get(LABEL_POD_NAMESPACE),
        uid: get(LABEL_POD_UID),
        attempt: get(LABEL_POD_ATTEMPT).parse().unwrap_or(0),
        backend_id: unit.id.clone(),
        state: match unit.state {
            UnitState::Running => SandboxState::Ready,
            _ => SandboxState::NotReady,
        },
        created_at: get(LABEL_CREATED_AT).parse().unwrap_or(0),
        network_address: unit.network_address.clone(),
        labels,
        annotations,
        log_directory: get(LABEL_LOG_DIRECTORY),
        runtime_handler: get(LABEL_RUNTIME_HANDLER),
    })
}

fn parse_annotation_u32(
    annotations: &HashMap<String, String>,
    key: &str,
) -> Result<Option<u32>> {
    match annotations.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
            ShimError::InvalidArgument(format!("annotation {} is not a number: {}", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri_api::PodSandboxMetadata;

    fn test_sandbox() -> PodSandbox {
        PodSandbox {
            id: "sb-1".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
            uid: "uid-1".to_string(),
            attempt: 2,
            backend_id: "sb-1".to_string(),
            state: SandboxState::Ready,
            created_at: 1_700_000_000_000_000_000,
            network_address: None,
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            annotations: HashMap::from([("team".to_string(), "infra".to_string())]),
            log_directory: "/var/log/pods/web".to_string(),
            runtime_handler: "kina".to_string(),
        }
    }

    fn make_config(annotations: HashMap<String, String>) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: "web".to_string(),
                uid: "uid-1".to_string(),
                namespace: "default".to_string(),
                attempt: 2,
            }),
            hostname: String::new(),
            log_directory: "/var/log/pods/web".to_string(),
            dns_config: None,
            port_mappings: vec![],
            labels: HashMap::new(),
            annotations,
        }
    }

    #[test]
    fn test_unit_spec_defaults() {
        let spec =
            sandbox_unit_spec(&test_sandbox(), &make_config(HashMap::new()), &SandboxConfig::default())
                .unwrap();
        assert_eq!(spec.name, "sb-1");
        assert_eq!(spec.image, "docker.io/library/alpine:latest");
        assert_eq!(spec.hostname, "web");
        assert!(spec.vcpus.is_none());
        assert_eq!(spec.command[0], "/bin/sh");
    }

    #[test]
    fn test_unit_spec_annotation_overrides() {
        let annotations = HashMap::from([
            (ANN_SANDBOX_IMAGE.to_string(), "ghcr.io/kina/base:v1".to_string()),
            (ANN_VCPUS.to_string(), "4".to_string()),
            (ANN_MEMORY_MB.to_string(), "2048".to_string()),
        ]);
        let spec =
            sandbox_unit_spec(&test_sandbox(), &make_config(annotations), &SandboxConfig::default())
                .unwrap();
        assert_eq!(spec.image, "ghcr.io/kina/base:v1");
        assert_eq!(spec.vcpus, Some(4));
        assert_eq!(spec.memory_mb, Some(2048));
    }

    #[test]
    fn test_unit_spec_rejects_bad_vcpus() {
        let annotations = HashMap::from([(ANN_VCPUS.to_string(), "many".to_string())]);
        let err = sandbox_unit_spec(
            &test_sandbox(),
            &make_config(annotations),
            &SandboxConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)));
    }

    #[test]
    fn test_sandbox_round_trips_through_labels() {
        let original = test_sandbox();
        let unit = UnitSummary {
            id: "sb-1".to_string(),
            state: UnitState::Running,
            network_address: Some("192.168.64.5".to_string()),
            labels: sandbox_labels(&original),
        };

        let rebuilt = sandbox_from_unit(&unit).unwrap();
        assert_eq!(rebuilt.id, original.id);
        assert_eq!(rebuilt.name, original.name);
        assert_eq!(rebuilt.namespace, original.namespace);
        assert_eq!(rebuilt.uid, original.uid);
        assert_eq!(rebuilt.attempt, original.attempt);
        assert_eq!(rebuilt.created_at, original.created_at);
        assert_eq!(rebuilt.state, SandboxState::Ready);
        assert_eq!(rebuilt.network_address.as_deref(), Some("192.168.64.5"));
        assert_eq!(rebuilt.labels, original.labels);
        assert_eq!(rebuilt.annotations, original.annotations);
        assert_eq!(rebuilt.runtime_handler, original.runtime_handler);
    }

    #[test]
    fn test_stopped_unit_rebuilds_as_not_ready() {
        let mut unit = UnitSummary {
            id: "sb-1".to_string(),
            state: UnitState::Stopped,
            network_address: None,
            labels: sandbox_labels(&test_sandbox()),
        };
        unit.labels
            .insert(LABEL_SANDBOX_ID.to_string(), "sb-1".to_string());
        let rebuilt = sandbox_from_unit(&unit).unwrap();
        assert_eq!(rebuilt.state, SandboxState::NotReady);
    }

    #[test]
    fn test_unlabeled_unit_is_ignored() {
        let unit = UnitSummary {
            id: "someone-elses-vm".to_string(),
            state: UnitState::Running,
            network_address: None,
            labels: HashMap::new(),
        };
        assert!(sandbox_from_unit(&unit).is_none());
    }
}
