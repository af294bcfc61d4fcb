//! In-memory backend used by lifecycle and service tests.
//!
//! Emulates enough of the real backend to exercise the managers above the
//! [`VmBackend`] seam: a unit table with assigned addresses, an image
//! store, and a small fake process table that understands the shell
//! commands the container manager runs inside units (background spawn,
//! `kill`, `cat` of an exit-code file).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use kina_core::error::{Result, ShimError};

use crate::adapter::{
    ExecOutput, ImageInfo, UnitSpec, UnitState, UnitStatus, UnitSummary, VmBackend,
};
use crate::reference::ImageReference;

#[derive(Debug, Clone)]
struct MockProcess {
    alive: bool,
    /// Path of the exit-code file the spawn script named, if any.
    rc_path: Option<String>,
}

#[derive(Debug, Clone)]
struct MockUnit {
    spec: UnitSpec,
    state: UnitState,
    network_address: Option<String>,
    processes: HashMap<u32, MockProcess>,
    /// Fake in-VM filesystem, holding exit-code files.
    files: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct MockState {
    units: HashMap<String, MockUnit>,
    images: HashMap<String, ImageInfo>,
    next_address: u8,
    next_pid: u32,
    unavailable: bool,
    fail_create: bool,
    fail_start: bool,
    exec_log: Vec<(String, Vec<String>)>,
}

/// Backend double backed by plain in-memory tables.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_address: 2,
                next_pid: 100,
                ..MockState::default()
            }),
        }
    }

    /// Fail every call with `BackendUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Fail the next and all following `create` calls.
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Fail the next and all following `start` calls.
    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    pub fn has_unit(&self, id: &str) -> bool {
        self.state.lock().unwrap().units.contains_key(id)
    }

    pub fn unit_labels(&self, id: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .units
            .get(id)
            .map(|u| u.spec.labels.clone())
    }

    /// All commands run through `exec`, for assertions.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().exec_log.clone()
    }

    /// Mark a spawned process as exited with `code`, writing its
    /// exit-code file the way the real wrapper script would.
    pub fn finish_process(&self, unit_id: &str, pid: u32, code: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(unit) = state.units.get_mut(unit_id) {
            if let Some(proc) = unit.processes.get_mut(&pid) {
                proc.alive = false;
                if let Some(path) = proc.rc_path.clone() {
                    unit.files.insert(path, code.to_string());
                }
            }
        }
    }

    /// Drop a unit without going through stop/remove, simulating the
    /// backend losing it out from under the shim.
    pub fn vanish_unit(&self, id: &str) {
        self.state.lock().unwrap().units.remove(id);
    }

    /// Register an image without pulling.
    pub fn seed_image(&self, reference: &str) {
        let info = image_info_for(reference);
        self.state
            .lock()
            .unwrap()
            .images
            .insert(info.reference.clone(), info);
    }

    fn check_available(state: &MockState) -> Result<()> {
        if state.unavailable {
            Err(ShimError::BackendUnavailable("mock offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn image_info_for(reference: &str) -> ImageInfo {
    let canonical = ImageReference::parse(reference)
        .map(|r| r.canonical())
        .unwrap_or_else(|_| reference.to_string());
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    ImageInfo {
        reference: canonical,
        digest: format!("sha256:{:016x}", hasher.finish()),
        size_bytes: 4_194_304,
    }
}

/// Pull the `/run/...<something>.rc` path out of a spawn script.
fn extract_rc_path(script: &str) -> Option<String> {
    let end = script.find(".rc")? + ".rc".len();
    let start = script[..end].rfind("/run/")?;
    Some(script[start..end].to_string())
}

fn output(code: i32, stdout: &str, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code: code,
    }
}

#[async_trait]
impl VmBackend for MockBackend {
    async fn create(&self, spec: &UnitSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        if state.fail_create {
            return Err(ShimError::Internal("mock create failure".to_string()));
        }
        if state.units.contains_key(&spec.name) {
            return Err(ShimError::AlreadyExists {
                kind: "unit",
                id: spec.name.clone(),
            });
        }
        state.units.insert(
            spec.name.clone(),
            MockUnit {
                spec: spec.clone(),
                state: UnitState::Stopped,
                network_address: None,
                processes: HashMap::new(),
                files: HashMap::new(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        if state.fail_start {
            return Err(ShimError::Internal("mock start failure".to_string()));
        }
        let address = format!("192.168.64.{}", state.next_address);
        state.next_address += 1;
        let unit = state.units.get_mut(id).ok_or_else(|| ShimError::NotFound {
            kind: "unit",
            id: id.to_string(),
        })?;
        unit.state = UnitState::Running;
        unit.network_address = Some(address);
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        if let Some(unit) = state.units.get_mut(id) {
            unit.state = UnitState::Stopped;
            for proc in unit.processes.values_mut() {
                proc.alive = false;
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.units.remove(id);
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.exec_log.push((id.to_string(), cmd.to_vec()));

        let next_pid = state.next_pid;
        let unit = state.units.get_mut(id).ok_or_else(|| ShimError::NotFound {
            kind: "unit",
            id: id.to_string(),
        })?;
        if unit.state != UnitState::Running {
            return Err(ShimError::Internal(format!("unit {} is not running", id)));
        }

        let first = cmd.first().map(String::as_str).unwrap_or("");
        match first {
            // Spawn script: `/bin/sh -c "... & echo $!"`.
            "/bin/sh" | "sh" if cmd.get(1).map(String::as_str) == Some("-c") => {
                let script = cmd.get(2).cloned().unwrap_or_default();
                if script.contains("& echo $!") {
                    let pid = next_pid;
                    state.next_pid += 1;
                    let unit = state.units.get_mut(id).unwrap();
                    unit.processes.insert(
                        pid,
                        MockProcess {
                            alive: true,
                            rc_path: extract_rc_path(&script),
                        },
                    );
                    Ok(output(0, &format!("{}\n", pid), ""))
                } else {
                    Ok(output(0, "", ""))
                }
            }
            "kill" => {
                let signal = cmd.get(1).map(String::as_str).unwrap_or("");
                let pid: u32 = cmd
                    .get(2)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                let Some(proc) = unit.processes.get_mut(&pid) else {
                    return Ok(output(1, "", "kill: no such process\n"));
                };
                match signal {
                    "-0" => {
                        if proc.alive {
                            Ok(output(0, "", ""))
                        } else {
                            Ok(output(1, "", "kill: no such process\n"))
                        }
                    }
                    "-TERM" | "-15" => {
                        proc.alive = false;
                        if let Some(path) = proc.rc_path.clone() {
                            unit.files.insert(path, "0".to_string());
                        }
                        Ok(output(0, "", ""))
                    }
                    "-KILL" | "-9" => {
                        proc.alive = false;
                        if let Some(path) = proc.rc_path.clone() {
                            unit.files.insert(path, "137".to_string());
                        }
                        Ok(output(0, "", ""))
                    }
                    _ => Ok(output(0, "", "")),
                }
            }
            "cat" => {
                let path = cmd.get(1).map(String::as_str).unwrap_or("");
                match unit.files.get(path) {
                    Some(content) => Ok(output(0, content, "")),
                    None => Ok(output(1, "", "cat: No such file or directory\n")),
                }
            }
            "echo" => Ok(output(0, &format!("{}\n", cmd[1..].join(" ")), "")),
            "mkdir" => Ok(output(0, "", "")),
            _ => Ok(output(0, "", "")),
        }
    }

    async fn inspect(&self, id: &str) -> Result<UnitStatus> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        let unit = state.units.get(id).ok_or_else(|| ShimError::NotFound {
            kind: "unit",
            id: id.to_string(),
        })?;
        Ok(UnitStatus {
            state: unit.state,
            network_address: unit.network_address.clone(),
            exit_code: None,
        })
    }

    async fn list_units(&self) -> Result<Vec<UnitSummary>> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        let mut units: Vec<_> = state
            .units
            .values()
            .map(|u| UnitSummary {
                id: u.spec.name.clone(),
                state: u.state,
                network_address: u.network_address.clone(),
                labels: u.spec.labels.clone(),
            })
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }

    async fn pull_image(&self, reference: &str) -> Result<ImageInfo> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        let info = image_info_for(reference);
        state.images.insert(info.reference.clone(), info.clone());
        Ok(info)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        let mut images: Vec<_> = state.images.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(images)
    }

    async fn image_status(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let wanted = ImageReference::parse(reference)?;
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state
            .images
            .values()
            .find(|img| wanted.matches(img))
            .cloned())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        let wanted = ImageReference::parse(reference)?;
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.images.retain(|_, img| !wanted.matches(img));
        Ok(())
    }
}
