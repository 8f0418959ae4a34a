// src/core.rs
//
// =============================================================================
// RAILYARD: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The shared vocabulary between the master, the worker agent and the
// wrapper: Job, Node, and the small enums that describe where a job is in
// its lifecycle and why it stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// 1. ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "queued" => JobStatus::Queued,
            "assigned" => JobStatus::Assigned,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "canceled" => JobStatus::Canceled,
            _ => return None,
        })
    }

    /// Is `self -> next` a legal transition? The one non-monotonic edge is
    /// reclamation: Assigned/Running back to Queued when a node goes stale
    /// mid-job.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Assigned)
                | (Queued, Canceled)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Queued)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Production,
    Test,
    Benchmark,
    Debug,
}

impl Default for Classification {
    fn default() -> Self {
        Classification::Production
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePreference {
    Auto,
    Ffmpeg,
    Gstreamer,
}

impl Default for EnginePreference {
    fn default() -> Self {
        EnginePreference::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Live,
    Batch,
    Default,
}

impl Default for Queue {
    fn default() -> Self {
        Queue::Default
    }
}

impl Queue {
    /// Lower sorts first: live is always drained ahead of batch/default.
    pub fn rank(self) -> i32 {
        match self {
            Queue::Live => 0,
            Queue::Default => 1,
            Queue::Batch => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn rank(self) -> i32 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Why a job or wrapper run stopped. The platform-fault column decides
/// whether a failure counts against the platform SLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UserError,
    InputError,
    CapabilityMismatch,
    NetworkError,
    RuntimeError,
    ResourceError,
    PlatformError,
    Timeout,
}

impl FailureReason {
    /// true if this failure is the platform's fault (counts against SLA).
    pub fn is_platform_fault(self) -> bool {
        matches!(
            self,
            FailureReason::ResourceError | FailureReason::PlatformError | FailureReason::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Laptop,
    Desktop,
    Server,
    Hpc,
}

// ============================================================================
// 2. JOB
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub engine_used: String,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
    pub platform_sla_compliant: bool,
    pub platform_sla_reason: Option<String>,
    pub error: Option<String>,
}

/// Minimal hardware requirements a job may declare; a node must satisfy
/// all present fields to be eligible for the job. Everything defaults to
/// "no requirement" so most jobs carry an empty, always-satisfied value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareRequirements {
    #[serde(default)]
    pub min_ram_mb: Option<u64>,
    #[serde(default)]
    pub min_cpu_threads: Option<usize>,
    #[serde(default)]
    pub requires_gpu: bool,
}

impl HardwareRequirements {
    pub fn satisfied_by(&self, hw: &HardwareDescriptor) -> bool {
        if let Some(min_ram) = self.min_ram_mb {
            if hw.ram_mb < min_ram {
                return false;
            }
        }
        if let Some(min_threads) = self.min_cpu_threads {
            if hw.cpu_threads < min_threads {
                return false;
            }
        }
        if self.requires_gpu && hw.gpu_count == 0 {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub scenario: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub engine: EnginePreference,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requirements: HardwareRequirements,
    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    pub node_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub failure_reason: Option<FailureReason>,
    pub result: Option<JobResult>,
}

fn default_max_retries() -> u32 {
    3
}

impl Job {
    pub fn new(
        scenario: String,
        params: Value,
        classification: Classification,
        engine: EnginePreference,
        queue: Queue,
        priority: Priority,
        requirements: HardwareRequirements,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scenario,
            params,
            classification,
            engine,
            queue,
            priority,
            requirements,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            node_id: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            result: None,
        }
    }

    /// Content fingerprint: the same (scenario, params, engine) submitted
    /// twice hashes identically. Used for idempotency-key style
    /// de-duplication at the submission boundary.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.scenario.as_bytes());
        hasher.update(self.params.to_string().as_bytes());
        hasher.update(format!("{:?}", self.engine).as_bytes());
        hex_string(&hasher.finalize())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// 3. NODE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    pub cpu_threads: usize,
    pub cpu_model: String,
    pub ram_mb: u64,
    pub gpu_type: Option<String>,
    pub gpu_count: usize,
    pub node_class: NodeClass,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Engine binaries this node can run (e.g. `["ffmpeg", "gstreamer"]`).
    #[serde(default)]
    pub engines: Vec<String>,
}

impl HardwareDescriptor {
    pub fn supports_engine(&self, engine: &str) -> bool {
        self.engines.iter().any(|e| e.eq_ignore_ascii_case(engine))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub address: String,
    pub hardware: HardwareDescriptor,
    pub status: NodeStatus,
    pub current_job_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn new(address: String, hardware: HardwareDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            address,
            hardware,
            status: NodeStatus::Available,
            current_job_id: None,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

// ============================================================================
// 4. WRAPPER RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperMode {
    Run,
    Attach,
}

/// Emitted exactly once, at termination, by the workload wrapper. Immutable
/// once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperResult {
    pub job_id: Uuid,
    pub pid: u32,
    pub mode: WrapperMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub platform_sla_compliant: bool,
    pub platform_sla_reason: Option<String>,
    pub failure_reason: Option<FailureReason>,
    /// Set when the wait loop exited because a `CancellationToken` fired
    /// rather than because the workload finished or timed out on its own.
    pub canceled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_match_spec() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Assigned));
        assert!(JobStatus::Assigned.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn platform_fault_taxonomy() {
        assert!(FailureReason::Timeout.is_platform_fault());
        assert!(FailureReason::ResourceError.is_platform_fault());
        assert!(FailureReason::PlatformError.is_platform_fault());
        assert!(!FailureReason::UserError.is_platform_fault());
        assert!(!FailureReason::NetworkError.is_platform_fault());
    }

    #[test]
    fn fingerprint_is_stable_across_ids() {
        let j1 = Job::new(
            "transcode".into(),
            serde_json::json!({"src": "a.mp4"}),
            Classification::Production,
            EnginePreference::Auto,
            Queue::Default,
            Priority::Normal,
            HardwareRequirements::default(),
            3,
        );
        let mut j2 = j1.clone();
        j2.id = Uuid::new_v4();
        assert_eq!(j1.fingerprint(), j2.fingerprint());
    }
}
