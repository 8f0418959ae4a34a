// src/agent.rs
//
// =============================================================================
// RAILYARD: WORKER AGENT
// =============================================================================
//
// Generalizes the prior generation's local-scheduler: an atomically
// bounded set of execution slots, a poll loop that claims work, and an independent
// heartbeat loop. The node identity is held behind a single
// `Arc<RwLock<Option<Uuid>>>` handle threaded explicitly into both loops
// rather than read from module-level state, so re-registration after a
// dropped node id is visible to both without any loop owning the other.

use crate::client::MasterClient;
use crate::core::{
    EnginePreference, FailureReason, HardwareDescriptor, Job, JobResult, JobStatus, Queue,
};
use crate::error::AgentError;
use crate::wrapper::{Governance, RunSpec, Wrapper, PROCESSING_TIME_TARGET};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How often the cancellation watcher re-polls job status while a job is
/// executing.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: String,
    pub hardware: HardwareDescriptor,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub heartbeat_failure_limit: u32,
    pub grace_period: Duration,
    pub work_root: PathBuf,
}

pub struct WorkerAgent {
    client: MasterClient,
    config: AgentConfig,
    node_id: Arc<RwLock<Option<Uuid>>>,
    active_slots: Arc<AtomicUsize>,
}

impl WorkerAgent {
    pub fn new(client: MasterClient, config: AgentConfig) -> Self {
        Self {
            client,
            config,
            node_id: Arc::new(RwLock::new(None)),
            active_slots: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn register(&self) -> Result<Uuid, AgentError> {
        let id = self.client.register_node(&self.config.address, &self.config.hardware).await?;
        *self.node_id.write().await = Some(id);
        log::info!("registered with master as node {id}");
        Ok(id)
    }

    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) -> Result<(), AgentError> {
        self.register().await?;

        let poll = self.poll_loop(cancel.clone());
        let heartbeat = self.heartbeat_loop(cancel.clone());
        tokio::join!(poll, heartbeat);
        Ok(())
    }

    async fn poll_loop(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("poll loop shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let free_slots = self.config.max_concurrent_jobs - self.active_slots.load(Ordering::SeqCst);
            if free_slots == 0 {
                continue;
            }

            let Some(node_id) = *self.node_id.read().await else {
                continue;
            };

            match self.client.next_job(node_id, free_slots).await {
                Ok(Some(job)) => {
                    backoff = Duration::from_secs(1);
                    self.spawn_execution_slot(job);
                }
                Ok(None) => {
                    backoff = Duration::from_secs(1);
                }
                Err(AgentError::UnknownNode) => {
                    log::warn!("master no longer recognizes this node, re-registering");
                    *self.node_id.write().await = None;
                    if let Err(e) = self.register().await {
                        log::error!("re-registration failed: {e}");
                    }
                }
                Err(e) => {
                    log::warn!("poll failed: {e}, backing off {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn heartbeat_loop(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("heartbeat loop shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let Some(node_id) = *self.node_id.read().await else {
                continue;
            };

            match self.client.heartbeat(node_id).await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    log::warn!("heartbeat failed ({consecutive_failures}/{}): {e}", self.config.heartbeat_failure_limit);
                    if consecutive_failures >= self.config.heartbeat_failure_limit {
                        log::error!("heartbeat failure streak exceeded, dropping node identity");
                        *self.node_id.write().await = None;
                        consecutive_failures = 0;
                    }
                }
            }
        }
    }

    fn spawn_execution_slot(&self, job: Job) {
        let client = self.client.clone();
        let active_slots = self.active_slots.clone();
        let grace_period = self.config.grace_period;
        let work_root = self.config.work_root.clone();
        let hardware = self.config.hardware.clone();

        active_slots.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let job_id = job.id;
            let cancel = CancellationToken::new();
            let watcher = tokio::spawn(watch_for_cancellation(client.clone(), job_id, cancel.clone()));

            let outcome = execute_job(&job, &work_root, grace_period, &hardware, cancel).await;
            watcher.abort();
            active_slots.fetch_sub(1, Ordering::SeqCst);

            // A canceled job's terminal state is already `Canceled` in the
            // store — re-posting a result would be an illegal transition.
            if let Some((status, failure_reason, result)) = outcome {
                if let Err(e) = client.submit_result(job_id, status, failure_reason, result).await {
                    log::error!("failed to upload result for job {job_id}: {e}");
                }
            }
        });
    }
}

/// Polls the master for this job's status while it runs and fires `cancel`
/// the moment the master reports it `Canceled`. Aborted by the caller once
/// the job finishes on its own, so this never outlives the execution slot.
async fn watch_for_cancellation(client: MasterClient, job_id: Uuid, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        match client.job_status(job_id).await {
            Ok(job) if job.status == JobStatus::Canceled => {
                log::info!("job {job_id} canceled by master, forwarding to wrapper");
                cancel.cancel();
                return;
            }
            Ok(_) => {}
            Err(e) => log::debug!("cancellation poll for job {job_id} failed: {e}"),
        }
    }
}

/// Selects a concrete engine binary and builds/executes the wrapper run,
/// then classifies the outcome into (status, failure_reason, result).
/// Returns `None` when the job was canceled mid-run: the master already
/// holds the terminal `Canceled` status, so there is no result to upload.
async fn execute_job(
    job: &Job,
    work_root: &std::path::Path,
    grace_period: Duration,
    hardware: &HardwareDescriptor,
    cancel: CancellationToken,
) -> Option<(JobStatus, Option<FailureReason>, Option<JobResult>)> {
    let engine = select_engine(job, hardware);
    let work_dir = work_root.join(format!("job_{}", job.id));
    if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
        return Some((
            JobStatus::Failed,
            Some(FailureReason::PlatformError),
            Some(failure_result(&engine, format!("workspace setup failed: {e}"))),
        ));
    }

    let (program, args) = build_command(&engine, job, hardware);
    let spec = RunSpec {
        job_id: job.id,
        program,
        args,
        work_dir: work_dir.clone(),
        governance: Governance::default(),
        grace_period,
        created_at: job.created_at,
        assigned_at: job.assigned_at.unwrap_or(job.created_at),
    };

    let wrapper_result = Wrapper::run(spec, Some(PROCESSING_TIME_TARGET), cancel).await;
    let _ = tokio::fs::remove_dir_all(&work_dir).await;

    match wrapper_result {
        Ok(wr) if wr.canceled => None,
        Ok(wr) if wr.exit_code == Some(0) => Some((
            JobStatus::Completed,
            None,
            Some(JobResult {
                engine_used: engine,
                metrics: HashMap::new(),
                platform_sla_compliant: wr.platform_sla_compliant,
                platform_sla_reason: wr.platform_sla_reason,
                error: None,
            }),
        )),
        Ok(wr) => {
            let reason = wr.failure_reason.unwrap_or(FailureReason::RuntimeError);
            Some((
                JobStatus::Failed,
                Some(reason),
                Some(JobResult {
                    engine_used: engine,
                    metrics: HashMap::new(),
                    platform_sla_compliant: wr.platform_sla_compliant,
                    platform_sla_reason: wr.platform_sla_reason,
                    error: Some(format!("exit code {:?}", wr.exit_code)),
                }),
            ))
        }
        Err(e) => Some((
            JobStatus::Failed,
            Some(FailureReason::PlatformError),
            Some(failure_result(&engine, e.to_string())),
        )),
    }
}

fn failure_result(engine: &str, error: String) -> JobResult {
    JobResult {
        engine_used: engine.to_string(),
        metrics: HashMap::new(),
        platform_sla_compliant: false,
        platform_sla_reason: Some("PlatformError".to_string()),
        error: Some(error),
    }
}

/// Engine selection order: explicit preference wins (falling back to
/// ffmpeg if the node can't actually run the requested engine — the
/// `gstreamer` fallback the store's eligibility predicate already assumed);
/// otherwise live/RTMP output prefers the streaming-capable engine, file
/// output prefers the file engine, and GPU presence is handled separately
/// as a command-line flag rather than a third engine binary.
fn select_engine(job: &Job, hardware: &HardwareDescriptor) -> String {
    match job.engine {
        EnginePreference::Ffmpeg => "ffmpeg".to_string(),
        EnginePreference::Gstreamer => {
            if hardware.supports_engine("gstreamer") {
                "gstreamer".to_string()
            } else {
                "ffmpeg".to_string()
            }
        }
        EnginePreference::Auto => {
            let prefers_streaming = job.queue == Queue::Live || output_is_rtmp(job);
            if prefers_streaming && hardware.supports_engine("gstreamer") {
                "gstreamer".to_string()
            } else {
                "ffmpeg".to_string()
            }
        }
    }
}

fn output_is_rtmp(job: &Job) -> bool {
    job.params
        .get("output")
        .and_then(|v| v.as_str())
        .map(|s| s.starts_with("rtmp://"))
        .unwrap_or(false)
}

fn build_command(engine: &str, job: &Job, hardware: &HardwareDescriptor) -> (String, Vec<String>) {
    let params = &job.params;
    let input = params.get("input").and_then(|v| v.as_str()).unwrap_or("input");
    let output = params.get("output").and_then(|v| v.as_str()).unwrap_or("output");

    match engine {
        "gstreamer" => (
            "gst-launch-1.0".to_string(),
            vec!["filesrc".to_string(), format!("location={input}"), "!".to_string(), "filesink".to_string(), format!("location={output}")],
        ),
        _ => {
            let mut args = vec!["-y".to_string()];
            if hardware.gpu_count > 0 {
                // GPU-available prefers the hardware-accelerated decode/encode
                // path; ffmpeg picks the concrete accelerator at runtime.
                args.push("-hwaccel".to_string());
                args.push("auto".to_string());
            }
            args.push("-i".to_string());
            args.push(input.to_string());
            args.push(output.to_string());
            ("ffmpeg".to_string(), args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Classification, HardwareRequirements, NodeClass, Priority};

    fn hw(engines: &[&str]) -> HardwareDescriptor {
        HardwareDescriptor {
            cpu_threads: 8,
            cpu_model: "test-cpu".into(),
            ram_mb: 16384,
            gpu_type: None,
            gpu_count: 0,
            node_class: NodeClass::Desktop,
            tags: vec![],
            engines: engines.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn job(engine: EnginePreference, queue: Queue, output: &str) -> Job {
        Job::new(
            "transcode".into(),
            serde_json::json!({"output": output}),
            Classification::Production,
            engine,
            queue,
            Priority::Normal,
            HardwareRequirements::default(),
            3,
        )
    }

    #[test]
    fn auto_engine_prefers_streaming_for_live_queue() {
        let j = job(EnginePreference::Auto, Queue::Live, "a.mkv");
        assert_eq!(select_engine(&j, &hw(&["ffmpeg", "gstreamer"])), "gstreamer");
    }

    #[test]
    fn auto_engine_prefers_streaming_for_rtmp_output() {
        let j = job(EnginePreference::Auto, Queue::Batch, "rtmp://live.example.com/ingest");
        assert_eq!(select_engine(&j, &hw(&["ffmpeg", "gstreamer"])), "gstreamer");
    }

    #[test]
    fn auto_engine_prefers_file_engine_for_file_output() {
        let j = job(EnginePreference::Auto, Queue::Batch, "a.mkv");
        assert_eq!(select_engine(&j, &hw(&["ffmpeg", "gstreamer"])), "ffmpeg");
    }

    #[test]
    fn auto_engine_falls_back_to_ffmpeg_when_node_lacks_gstreamer() {
        let j = job(EnginePreference::Auto, Queue::Live, "a.mkv");
        assert_eq!(select_engine(&j, &hw(&["ffmpeg"])), "ffmpeg");
    }

    #[test]
    fn explicit_preference_is_never_overridden() {
        let j = job(EnginePreference::Ffmpeg, Queue::Live, "a.mkv");
        assert_eq!(select_engine(&j, &hw(&["ffmpeg", "gstreamer"])), "ffmpeg");
    }

    #[test]
    fn explicit_gstreamer_falls_back_to_ffmpeg_without_node_support() {
        let j = job(EnginePreference::Gstreamer, Queue::Live, "a.mkv");
        assert_eq!(select_engine(&j, &hw(&["ffmpeg"])), "ffmpeg");
    }

    #[test]
    fn gpu_presence_adds_hwaccel_flag_to_ffmpeg_command() {
        let j = job(EnginePreference::Ffmpeg, Queue::Batch, "a.mkv");
        let mut gpu_hw = hw(&["ffmpeg"]);
        gpu_hw.gpu_count = 1;
        let (program, args) = build_command("ffmpeg", &j, &gpu_hw);
        assert_eq!(program, "ffmpeg");
        assert!(args.windows(2).any(|w| w == ["-hwaccel".to_string(), "auto".to_string()]));
    }
}
