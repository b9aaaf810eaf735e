//! Per-sandbox state.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    isolation::{DriverHandle, DriverKind},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle state of a sandbox as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Being provisioned.
    Creating,

    /// Accepting work.
    Running,

    /// Frozen.
    Paused,

    /// Halted.
    Stopped,

    /// Terminal; the workspace no longer exists.
    Destroyed,
}

/// Where preview traffic for one port should be dialed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    /// Host to dial.
    pub host: String,

    /// Port to dial.
    pub port: u16,

    /// `http` or `https`.
    pub scheme: String,

    /// The driver serving this upstream.
    pub driver_kind: DriverKind,
}

/// Status of a background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    /// The job's command is still running.
    Running,

    /// The command finished on its own.
    Exited {
        /// The command's exit status.
        exit_code: i32,
    },

    /// The command could not be run.
    Failed {
        /// What went wrong.
        message: String,
    },

    /// The job was stopped by request.
    Stopped,
}

/// One background job inside a sandbox.
pub struct BackgroundJob {
    /// Unique per sandbox.
    pub job_id: String,

    /// The command the job runs.
    pub command: Vec<String>,

    /// When the job started.
    pub started_at: DateTime<Utc>,

    /// Last observed status.
    pub status: Arc<parking_lot::Mutex<JobStatus>>,

    /// Cancelling terminates the job's child promptly.
    pub cancel: CancellationToken,
}

/// All mutable and immutable state of one sandbox.
///
/// The short mutex guards state transitions and registry writes only; driver
/// and backend I/O never run under it. The write gate serializes snapshot
/// creation against exec and file writers: writers hold it shared, snapshot
/// `create` holds it exclusively.
pub struct Sandbox {
    /// Globally unique identifier.
    pub sandbox_id: String,

    /// Owner; never changes.
    pub user_id: String,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// The sandbox's private workspace.
    pub workspace_root: PathBuf,

    /// The driver binding.
    pub handle: DriverHandle,

    state: parking_lot::Mutex<SandboxState>,

    /// Port registry; readers take a lock-free snapshot, writers swap.
    ports: ArcSwap<HashMap<u16, UpstreamDescriptor>>,

    jobs: parking_lot::Mutex<HashMap<String, Arc<BackgroundJob>>>,

    deadline: parking_lot::Mutex<Instant>,

    /// Serializes exec/file writers against snapshot creation.
    pub(crate) write_gate: tokio::sync::RwLock<()>,

    /// Fallback replica handles per promoted port.
    pub(crate) fallbacks: tokio::sync::Mutex<HashMap<u16, DriverHandle>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// Creates sandbox state in `Creating`.
    pub fn new(
        sandbox_id: String,
        user_id: String,
        workspace_root: PathBuf,
        handle: DriverHandle,
        keepalive_ttl: Duration,
    ) -> Self {
        Self {
            sandbox_id,
            user_id,
            created_at: Utc::now(),
            workspace_root,
            handle,
            state: parking_lot::Mutex::new(SandboxState::Creating),
            ports: ArcSwap::from_pointee(HashMap::new()),
            jobs: parking_lot::Mutex::new(HashMap::new()),
            deadline: parking_lot::Mutex::new(Instant::now() + keepalive_ttl),
            write_gate: tokio::sync::RwLock::new(()),
            fallbacks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SandboxState {
        *self.state.lock()
    }

    /// Moves to a new lifecycle state.
    pub fn set_state(&self, state: SandboxState) {
        *self.state.lock() = state;
    }

    /// Fails unless the sandbox accepts work.
    pub fn require_running(&self) -> CubicleResult<()> {
        let state = self.state();
        if state == SandboxState::Running {
            Ok(())
        } else {
            Err(CubicleError::PreconditionFailed(format!(
                "sandbox {} is {:?}, not running",
                self.sandbox_id, state
            )))
        }
    }

    /// A lock-free snapshot of the port registry.
    pub fn ports(&self) -> Arc<HashMap<u16, UpstreamDescriptor>> {
        self.ports.load_full()
    }

    /// Installs or overwrites one port's upstream.
    pub fn register_port(&self, port: u16, upstream: UpstreamDescriptor) {
        let mut next = (*self.ports.load_full()).clone();
        next.insert(port, upstream);
        self.ports.store(Arc::new(next));
    }

    /// Clears the whole port registry.
    pub fn release_ports(&self) {
        self.ports.store(Arc::new(HashMap::new()));
    }

    /// Registers a background job.
    pub fn add_job(&self, job: Arc<BackgroundJob>) {
        self.jobs.lock().insert(job.job_id.clone(), job);
    }

    /// Looks up a background job.
    pub fn job(&self, job_id: &str) -> Option<Arc<BackgroundJob>> {
        self.jobs.lock().get(job_id).cloned()
    }

    /// All background jobs.
    pub fn jobs(&self) -> Vec<Arc<BackgroundJob>> {
        self.jobs.lock().values().cloned().collect()
    }

    /// Whether any background job is still running.
    pub fn has_running_jobs(&self) -> bool {
        self.jobs
            .lock()
            .values()
            .any(|job| *job.status.lock() == JobStatus::Running)
    }

    /// Extends the keepalive deadline.
    pub fn extend_deadline(&self, ttl: Duration) {
        *self.deadline.lock() = Instant::now() + ttl;
    }

    /// Whether the keepalive deadline has passed.
    pub fn past_deadline(&self, now: Instant) -> bool {
        now > *self.deadline.lock()
    }
}

impl UpstreamDescriptor {
    /// An upstream on the local host.
    pub fn local(port: u16, driver_kind: DriverKind) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            scheme: "http".to_string(),
            driver_kind,
        }
    }

    /// The base URL of this upstream, no trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Validates the descriptor's fields.
    pub fn validate(&self) -> CubicleResult<()> {
        if self.port == 0 {
            return Err(CubicleError::InvalidArgument(
                "upstream port must be in [1, 65535]".to_string(),
            ));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(CubicleError::InvalidArgument(format!(
                "unsupported upstream scheme: {}",
                self.scheme
            )));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new(
            "sbx_a".to_string(),
            "u_a".to_string(),
            PathBuf::from("/tmp/ws"),
            DriverHandle {
                sandbox_id: "sbx_a".to_string(),
                kind: DriverKind::Process,
            },
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_port_registry_is_injective_per_port() {
        let sandbox = sandbox();
        sandbox.register_port(3000, UpstreamDescriptor::local(3000, DriverKind::Process));
        sandbox.register_port(3000, UpstreamDescriptor::local(4000, DriverKind::Container));

        let ports = sandbox.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports.get(&3000).unwrap().port, 4000);
    }

    #[test]
    fn test_deadline_extension() {
        let sandbox = sandbox();
        assert!(!sandbox.past_deadline(Instant::now()));
        assert!(sandbox.past_deadline(Instant::now() + Duration::from_secs(120)));
        sandbox.extend_deadline(Duration::from_secs(600));
        assert!(!sandbox.past_deadline(Instant::now() + Duration::from_secs(120)));
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(UpstreamDescriptor::local(3000, DriverKind::Process)
            .validate()
            .is_ok());
        assert!(UpstreamDescriptor {
            host: "127.0.0.1".into(),
            port: 0,
            scheme: "http".into(),
            driver_kind: DriverKind::Process,
        }
        .validate()
        .is_err());
        assert!(UpstreamDescriptor {
            host: "127.0.0.1".into(),
            port: 80,
            scheme: "gopher".into(),
            driver_kind: DriverKind::Process,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_require_running_gates_states() {
        let sandbox = sandbox();
        assert!(sandbox.require_running().is_err());
        sandbox.set_state(SandboxState::Running);
        assert!(sandbox.require_running().is_ok());
        sandbox.set_state(SandboxState::Stopped);
        assert!(sandbox.require_running().is_err());
    }
}
