//! Apple Container CLI adapter.
//!
//! Drives the `container` binary as a subprocess. Each unit is a full VM;
//! the CLI assigns it an IP on its own network, reported through
//! `container list --format json`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use kina_core::config::BackendConfig;
use kina_core::error::{Result, ShimError};

use crate::adapter::{
    ExecOutput, ImageInfo, UnitSpec, UnitState, UnitStatus, UnitSummary, VmBackend,
};
use crate::reference::ImageReference;

/// Well-known install locations probed before falling back to PATH lookup.
const CLI_CANDIDATE_PATHS: &[&str] = &[
    "/usr/local/bin/container",
    "/opt/homebrew/bin/container",
    "/usr/local/bin/apple-container",
    "/opt/homebrew/bin/apple-container",
];

/// Binary names searched on PATH.
const CLI_CANDIDATE_NAMES: &[&str] = &["container", "apple-container"];

/// Backoff before the single retry of a transient read failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Subprocess-based backend adapter over the Apple Container CLI.
pub struct ContainerCli {
    cli_path: PathBuf,
    op_timeout: Duration,
    exec_timeout: Duration,
}

impl ContainerCli {
    /// Create an adapter from backend configuration, autodetecting the
    /// CLI binary when no explicit path is configured.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let cli_path = match &config.cli_path {
            Some(path) => path.clone(),
            None => Self::detect_cli_path()?,
        };
        Ok(Self {
            cli_path,
            op_timeout: config.op_timeout,
            exec_timeout: config.exec_timeout,
        })
    }

    /// Probe well-known install paths, then PATH.
    fn detect_cli_path() -> Result<PathBuf> {
        for path in CLI_CANDIDATE_PATHS {
            if Path::new(path).exists() {
                tracing::info!(path = %path, "Found backend CLI");
                return Ok(PathBuf::from(path));
            }
        }

        for name in CLI_CANDIDATE_NAMES {
            if let Ok(output) = std::process::Command::new("which").arg(name).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        tracing::info!(path = %path, "Found backend CLI on PATH");
                        return Ok(PathBuf::from(path));
                    }
                }
            }
        }

        Err(ShimError::BackendUnavailable(
            "backend CLI not found; install Apple Container or configure its path".to_string(),
        ))
    }

    /// Run the CLI with a bounded timeout. Non-zero exit is returned as
    /// the raw output so callers can classify stderr.
    async fn run(&self, args: &[String], timeout: Duration) -> Result<std::process::Output> {
        tracing::debug!(cli = %self.cli_path.display(), ?args, "backend CLI call");

        let child = Command::new(&self.cli_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ShimError::BackendUnavailable(format!(
                "failed to invoke backend CLI: {}",
                e
            ))),
            Err(_) => Err(ShimError::Timeout(format!(
                "backend call exceeded {:?}: {}",
                timeout,
                args.first().map(String::as_str).unwrap_or("")
            ))),
        }
    }

    /// Run and require success, classifying a failure from stderr.
    async fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.run(args, self.op_timeout).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(classify_failure(
                args,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Variant for read-only calls: one retry with a short backoff on
    /// transient failures before surfacing the error.
    async fn run_checked_retry(&self, args: &[String]) -> Result<String> {
        match self.run_checked(args).await {
            Err(e @ (ShimError::BackendUnavailable(_) | ShimError::Timeout(_))) => {
                tracing::debug!(error = %e, "transient backend failure, retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.run_checked(args).await
            }
            other => other,
        }
    }

    async fn find_unit(&self, id: &str) -> Result<Option<UnitSummary>> {
        let stdout = self.run_checked_retry(&list_units_args()).await?;
        let units = parse_units(&stdout)?;
        Ok(units.into_iter().find(|u| u.id == id))
    }
}

#[async_trait]
impl VmBackend for ContainerCli {
    async fn create(&self, spec: &UnitSpec) -> Result<String> {
        if spec.image.is_empty() {
            return Err(ShimError::InvalidSpec("unit image is required".to_string()));
        }
        self.run_checked(&create_args(spec)).await?;
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run_checked(&vec!["start".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.as_secs().max(1).to_string(),
            id.to_string(),
        ];
        match self.run_checked(&args).await {
            Ok(_) => Ok(()),
            // Stopping an already-stopped or already-gone unit is a no-op.
            Err(ShimError::NotFound { .. }) => Ok(()),
            Err(e) if is_already_stopped(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let args = vec!["delete".to_string(), id.to_string()];
        match self.run_checked(&args).await {
            Ok(_) => Ok(()),
            Err(ShimError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(ShimError::InvalidArgument("empty exec command".to_string()));
        }
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(cmd.iter().cloned());

        let output = self.run(&args, self.exec_timeout).await?;
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn inspect(&self, id: &str) -> Result<UnitStatus> {
        match self.find_unit(id).await? {
            Some(unit) => Ok(UnitStatus {
                state: unit.state,
                network_address: unit.network_address,
                exit_code: None,
            }),
            None => Err(ShimError::NotFound {
                kind: "unit",
                id: id.to_string(),
            }),
        }
    }

    async fn list_units(&self) -> Result<Vec<UnitSummary>> {
        let stdout = self.run_checked_retry(&list_units_args()).await?;
        parse_units(&stdout)
    }

    async fn pull_image(&self, reference: &str) -> Result<ImageInfo> {
        let args = vec![
            "image".to_string(),
            "pull".to_string(),
            reference.to_string(),
        ];
        self.run_checked(&args).await?;
        self.image_status(reference)
            .await?
            .ok_or_else(|| ShimError::Internal(format!("image missing after pull: {}", reference)))
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let args = vec![
            "image".to_string(),
            "list".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run_checked_retry(&args).await?;
        parse_images(&stdout)
    }

    async fn image_status(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let wanted = ImageReference::parse(reference)?;
        let images = self.list_images().await?;
        Ok(images.into_iter().find(|img| wanted.matches(img)))
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        let args = vec![
            "image".to_string(),
            "rm".to_string(),
            reference.to_string(),
        ];
        match self.run_checked(&args).await {
            Ok(_) => Ok(()),
            Err(ShimError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn list_units_args() -> Vec<String> {
    vec![
        "list".to_string(),
        "--all".to_string(),
        "--format".to_string(),
        "json".to_string(),
    ]
}

/// Build `container create` arguments from a unit spec.
fn create_args(spec: &UnitSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    if !spec.hostname.is_empty() {
        args.push("--hostname".to_string());
        args.push(spec.hostname.clone());
    }
    if let Some(vcpus) = spec.vcpus {
        args.push("--cpus".to_string());
        args.push(vcpus.to_string());
    }
    if let Some(memory_mb) = spec.memory_mb {
        args.push("--memory".to_string());
        args.push(format!("{}M", memory_mb));
    }
    let mut labels: Vec<_> = spec.labels.iter().collect();
    labels.sort();
    for (k, v) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", k, v));
    }
    for (k, v) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", k, v));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Classify a non-zero CLI exit from its stderr text.
fn classify_failure(args: &[String], stderr: &str) -> ShimError {
    let verb = args.first().map(String::as_str).unwrap_or("");
    let lower = stderr.to_lowercase();
    if lower.contains("not found") || lower.contains("no such") {
        ShimError::NotFound {
            kind: "unit",
            id: args.last().cloned().unwrap_or_default(),
        }
    } else if lower.contains("already exists") {
        ShimError::AlreadyExists {
            kind: "unit",
            id: args.last().cloned().unwrap_or_default(),
        }
    } else if lower.contains("connection refused")
        || lower.contains("daemon")
        || lower.contains("xpc")
    {
        ShimError::BackendUnavailable(format!("{}: {}", verb, stderr.trim()))
    } else if lower.contains("invalid") || lower.contains("unsupported") {
        ShimError::InvalidSpec(format!("{}: {}", verb, stderr.trim()))
    } else {
        ShimError::Internal(format!("backend {} failed: {}", verb, stderr.trim()))
    }
}

fn is_already_stopped(err: &ShimError) -> bool {
    match err {
        ShimError::Internal(msg) => {
            let lower = msg.to_lowercase();
            lower.contains("not running") || lower.contains("already stopped")
        }
        _ => false,
    }
}

/// Parse `container list --format json` output.
///
/// Shape: an array of objects with `configuration.id`,
/// `configuration.labels`, `status`, and `networks[].address` (the address
/// carries a CIDR suffix).
fn parse_units(stdout: &str) -> Result<Vec<UnitSummary>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<serde_json::Value> = serde_json::from_str(stdout)
        .map_err(|e| ShimError::Internal(format!("unparseable unit list: {}", e)))?;

    let mut units = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(id) = entry
            .pointer("/configuration/id")
            .and_then(|v| v.as_str())
        else {
            continue;
        };

        let labels = entry
            .pointer("/configuration/labels")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let state = match entry.get("status").and_then(|v| v.as_str()) {
            Some("running") => UnitState::Running,
            Some("stopped") | Some("exited") | Some("created") => UnitState::Stopped,
            _ => UnitState::Unknown,
        };

        let network_address = entry
            .pointer("/networks/0/address")
            .and_then(|v| v.as_str())
            .map(strip_cidr);

        units.push(UnitSummary {
            id: id.to_string(),
            state,
            network_address,
            labels,
        });
    }
    Ok(units)
}

/// Parse `container image list --format json` output.
fn parse_images(stdout: &str) -> Result<Vec<ImageInfo>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<serde_json::Value> = serde_json::from_str(stdout)
        .map_err(|e| ShimError::Internal(format!("unparseable image list: {}", e)))?;

    let mut images = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(reference) = entry
            .get("reference")
            .or_else(|| entry.get("name"))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        images.push(ImageInfo {
            reference: reference.to_string(),
            digest: entry
                .get("digest")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            size_bytes: entry.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
        });
    }
    Ok(images)
}

/// Addresses come back as `192.168.64.3/24`; callers want the bare IP.
fn strip_cidr(address: &str) -> String {
    address.split('/').next().unwrap_or(address).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UnitSpec {
        UnitSpec {
            name: "sb-1".to_string(),
            image: "docker.io/library/alpine:latest".to_string(),
            command: vec!["/sbin/init".to_string()],
            env: vec![("KINA_SANDBOX".to_string(), "sb-1".to_string())],
            labels: [("io.kina.sandbox-id".to_string(), "sb-1".to_string())]
                .into_iter()
                .collect(),
            hostname: "test-pod".to_string(),
            vcpus: Some(2),
            memory_mb: Some(1024),
        }
    }

    #[test]
    fn test_create_args_shape() {
        let args = create_args(&spec());
        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w == ["--name", "sb-1"]));
        assert!(args.windows(2).any(|w| w == ["--hostname", "test-pod"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "2"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "1024M"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--label", "io.kina.sandbox-id=sb-1"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--env", "KINA_SANDBOX=sb-1"]));
        // Image precedes the entrypoint override.
        let image_pos = args
            .iter()
            .position(|a| a == "docker.io/library/alpine:latest")
            .unwrap();
        assert_eq!(args[image_pos + 1], "/sbin/init");
    }

    #[test]
    fn test_create_args_omits_unset_resources() {
        let mut s = spec();
        s.vcpus = None;
        s.memory_mb = None;
        s.hostname = String::new();
        let args = create_args(&s);
        assert!(!args.contains(&"--cpus".to_string()));
        assert!(!args.contains(&"--memory".to_string()));
        assert!(!args.contains(&"--hostname".to_string()));
    }

    #[test]
    fn test_parse_units() {
        let json = r#"[
            {
                "configuration": {
                    "id": "sb-1",
                    "labels": {"io.kina.sandbox-id": "sb-1", "io.kina.pod-name": "web"}
                },
                "status": "running",
                "networks": [{"address": "192.168.64.3/24"}]
            },
            {
                "configuration": {"id": "sb-2", "labels": {}},
                "status": "stopped",
                "networks": []
            }
        ]"#;
        let units = parse_units(json).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "sb-1");
        assert_eq!(units[0].state, UnitState::Running);
        assert_eq!(units[0].network_address.as_deref(), Some("192.168.64.3"));
        assert_eq!(
            units[0].labels.get("io.kina.pod-name").map(String::as_str),
            Some("web")
        );
        assert_eq!(units[1].state, UnitState::Stopped);
        assert!(units[1].network_address.is_none());
    }

    #[test]
    fn test_parse_units_empty_output() {
        assert!(parse_units("").unwrap().is_empty());
        assert!(parse_units("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_units_skips_malformed_entries() {
        let json = r#"[{"status": "running"}, {"configuration": {"id": "ok"}, "status": "running"}]"#;
        let units = parse_units(json).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "ok");
    }

    #[test]
    fn test_parse_images() {
        let json = r#"[
            {"reference": "docker.io/library/alpine:latest", "digest": "sha256:abc", "size": 3210240},
            {"name": "ghcr.io/org/app:v1", "digest": "sha256:def"}
        ]"#;
        let images = parse_images(json).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].digest, "sha256:abc");
        assert_eq!(images[0].size_bytes, 3210240);
        assert_eq!(images[1].reference, "ghcr.io/org/app:v1");
        assert_eq!(images[1].size_bytes, 0);
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify_failure(
            &["delete".to_string(), "sb-9".to_string()],
            "Error: container sb-9 not found",
        );
        assert!(matches!(err, ShimError::NotFound { .. }));
    }

    #[test]
    fn test_classify_already_exists() {
        let err = classify_failure(
            &["create".to_string(), "sb-1".to_string()],
            "Error: container with name sb-1 already exists",
        );
        assert!(matches!(err, ShimError::AlreadyExists { .. }));
    }

    #[test]
    fn test_classify_unavailable() {
        let err = classify_failure(
            &["list".to_string()],
            "Error: XPC connection to container daemon failed",
        );
        assert!(matches!(err, ShimError::BackendUnavailable(_)));
    }

    #[test]
    fn test_classify_invalid_spec() {
        let err = classify_failure(
            &["create".to_string()],
            "Error: invalid value for --memory",
        );
        assert!(matches!(err, ShimError::InvalidSpec(_)));
    }

    #[test]
    fn test_strip_cidr() {
        assert_eq!(strip_cidr("192.168.64.3/24"), "192.168.64.3");
        assert_eq!(strip_cidr("192.168.64.3"), "192.168.64.3");
    }

    #[test]
    fn test_is_already_stopped() {
        assert!(is_already_stopped(&ShimError::Internal(
            "backend stop failed: container is not running".to_string()
        )));
        assert!(!is_already_stopped(&ShimError::Internal(
            "backend stop failed: disk full".to_string()
        )));
    }
}
