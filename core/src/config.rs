use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shim configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimConfig {
    /// Unix domain socket the CRI server listens on.
    pub socket_path: PathBuf,

    /// TCP address of the exec/attach/port-forward streaming listener.
    pub streaming_addr: String,

    /// Backend adapter settings.
    pub backend: BackendConfig,

    /// Sandbox lifecycle settings.
    pub sandbox: SandboxConfig,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/kina/kina-cri.sock"),
            streaming_addr: "127.0.0.1:10260".to_string(),
            backend: BackendConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Backend adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Path to the backend CLI binary. None means autodetect.
    pub cli_path: Option<PathBuf>,

    /// Upper bound for a single backend call. Distinct from the caller's
    /// request deadline so the shim can answer with a timeout error rather
    /// than hang on a wedged backend.
    #[serde(with = "duration_secs")]
    pub op_timeout: Duration,

    /// Upper bound for a synchronous exec inside a unit.
    #[serde(with = "duration_secs")]
    pub exec_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cli_path: None,
            op_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(60),
        }
    }
}

/// Sandbox lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Image the sandbox VM boots from. Container processes run inside
    /// this VM, so the image must carry a POSIX shell. Overridable per
    /// pod via annotation.
    pub image: String,

    /// How long RunPodSandbox waits for the unit to report a network
    /// address before tearing the unit down and failing.
    #[serde(with = "duration_secs")]
    pub ready_timeout: Duration,

    /// Grace period for stopping a unit before escalating to a kill.
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/library/alpine:latest".to_string(),
            ready_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Serialize Durations as whole seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShimConfig::default();
        assert_eq!(
            config.socket_path,
            PathBuf::from("/var/run/kina/kina-cri.sock")
        );
        assert!(config.backend.cli_path.is_none());
        assert_eq!(config.sandbox.ready_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_round_trip() {
        let config = ShimConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ShimConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.socket_path, config.socket_path);
        assert_eq!(parsed.backend.op_timeout, config.backend.op_timeout);
        assert_eq!(parsed.sandbox.stop_grace, config.sandbox.stop_grace);
    }

    #[test]
    fn test_durations_serialized_as_seconds() {
        let config = BackendConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["op_timeout"], 30);
        assert_eq!(json["exec_timeout"], 60);
    }
}
