//! Shared vocabulary for VM lifecycle state.
//!
//! The persisted record in `state.json` is the primary source of truth.
//! Artifact presence and the hypervisor pid are only consulted to reconcile
//! a record that no longer matches what is on disk (crash, manual deletion).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::VemuError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Seed disk and/or differential disk missing.
    Unprepared,
    /// Both artifacts exist; the hypervisor is not running.
    Prepared,
    /// The hypervisor was launched and its pid is alive.
    Running,
}

impl VmState {
    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Unprepared => "unprepared",
            VmState::Prepared => "prepared",
            VmState::Running => "running",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = VemuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprepared" => Ok(VmState::Unprepared),
            "prepared" => Ok(VmState::Prepared),
            "running" => Ok(VmState::Running),
            other => Err(VemuError::State {
                message: format!("unknown state '{other}'"),
            }),
        }
    }
}

#[derive(Debug, facet::Facet)]
struct StateRecord {
    state: String,
}

/// Read the persisted record. Missing or unreadable records yield `None`.
pub fn read_record(path: &Path) -> Option<VmState> {
    let contents = std::fs::read_to_string(path).ok()?;
    let record: StateRecord = match facet_json::from_str(&contents) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable state record");
            return None;
        }
    };
    record.state.parse().ok()
}

pub fn write_record(path: &Path, state: VmState) -> Result<(), VemuError> {
    let record = StateRecord {
        state: state.as_str().to_string(),
    };
    let json = facet_json::to_string(&record).map_err(|e| VemuError::State {
        message: format!("serializing state record: {e}"),
    })?;
    std::fs::write(path, format!("{json}\n")).map_err(|e| VemuError::Io {
        context: format!("writing state record {}", path.display()),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), %state, "state record written");
    Ok(())
}

/// What the filesystem and process table say right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub seed_disk: bool,
    pub diffdisk: bool,
    pub hypervisor_alive: bool,
}

impl Observed {
    fn artifacts(self) -> bool {
        self.seed_disk && self.diffdisk
    }
}

/// Combine the recorded state with observations.
///
/// A record is trusted unless the observations contradict it; contradictions
/// move the state down, never up. Without a record the state is derived from
/// observations alone.
pub fn reconcile(recorded: Option<VmState>, observed: Observed) -> VmState {
    match recorded {
        Some(_) if !observed.artifacts() => VmState::Unprepared,
        Some(VmState::Running) if observed.hypervisor_alive => VmState::Running,
        Some(VmState::Running) | Some(VmState::Prepared) => VmState::Prepared,
        Some(VmState::Unprepared) => VmState::Unprepared,
        None if !observed.artifacts() => VmState::Unprepared,
        None if observed.hypervisor_alive => VmState::Running,
        None => VmState::Prepared,
    }
}

/// Whether the pid in `pid_file` names a live process.
pub fn pid_alive(pid_file: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(pid_file) else {
        return false;
    };
    match contents.trim().parse::<u32>() {
        Ok(pid) => Path::new("/proc").join(pid.to_string()).exists(),
        Err(_) => false,
    }
}
