// src/wrapper.rs
//
// =============================================================================
// RAILYARD: WORKLOAD WRAPPER
// =============================================================================
//
// A non-owning process governance layer. `run` spawns the workload in its
// own process group so that signalling the wrapper never reaches the
// workload; `attach` governs an already-running PID passively and only
// ever probes it for liveness, never signals it. Resource governance
// (cores, memory, nice, OOM score) is applied best-effort: a failure to
// set one knob is logged and does not abort the workload, the same
// posture the prior sandbox code took with its env-var isolation.

use crate::core::{FailureReason, WrapperMode, WrapperResult};
use crate::error::WrapperError;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default ceiling used for platform-SLA queue-delay accounting.
pub const QUEUE_DELAY_TARGET: Duration = Duration::from_secs(30);
/// Default ceiling used for platform-SLA processing-time accounting; the
/// agent also uses this as the wrapper's hard wall-clock timeout.
pub const PROCESSING_TIME_TARGET: Duration = Duration::from_secs(600);

/// Governance knobs applied to a spawned or attached workload. Every field
/// is optional and every application is best-effort.
#[derive(Debug, Clone, Default)]
pub struct Governance {
    pub cpu_cores: Option<Vec<usize>>,
    pub memory_limit_mb: Option<u64>,
    pub nice: Option<i32>,
    pub oom_score_adj: Option<i32>,
    pub io_weight: Option<u32>,
}

impl Governance {
    /// Applies env-derived isolation hints to the command before spawn
    /// (the part of governance that must be set up pre-fork).
    fn apply_to_command(&self, cmd: &mut Command) {
        if let Some(cores) = &self.cpu_cores {
            let thread_count = cores.len().to_string();
            cmd.env("OMP_NUM_THREADS", &thread_count);
            cmd.env("RAYON_NUM_THREADS", &thread_count);
            let core_list = cores
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            cmd.env("RAILYARD_PINNED_CORES", core_list);
        }
    }

    /// Applies the knobs that only make sense once the PID exists (nice,
    /// OOM score). Each failure is logged, not propagated: governance is
    /// advisory, not a precondition for running the workload. Memory is
    /// handled separately, pre-fork, since `setrlimit` only ever affects
    /// the calling process — see `apply_rlimits_pre_exec`.
    fn apply_to_pid(&self, pid: i32) {
        if let Some(nice) = self.nice {
            unsafe {
                if libc::setpriority(libc::PRIO_PROCESS, pid as u32, nice) != 0 {
                    log::warn!("failed to set nice value {nice} for pid {pid}");
                }
            }
        }

        if let Some(adj) = self.oom_score_adj {
            let path = format!("/proc/{pid}/oom_score_adj");
            if let Err(e) = std::fs::write(&path, adj.to_string()) {
                log::warn!("failed to set oom_score_adj for pid {pid}: {e}");
            }
        }

        if let Some(weight) = self.io_weight {
            log::debug!("io weight {weight} requested for pid {pid} (best-effort, no ionice wrapper on this host assumed)");
        }
    }

    /// Applied inside the child, between fork and exec: a memory rlimit
    /// set here governs only the child, since `setrlimit` has no "target
    /// pid" form in POSIX.
    fn apply_rlimits_pre_exec(&self) -> std::io::Result<()> {
        if let Some(mb) = self.memory_limit_mb {
            let bytes = (mb * 1024 * 1024) as libc::rlim_t;
            let limit = libc::rlimit { rlim_cur: bytes, rlim_max: bytes };
            let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

pub struct RunSpec {
    pub job_id: Uuid,
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: std::path::PathBuf,
    pub governance: Governance,
    pub grace_period: Duration,
    /// Job timestamps, carried through for platform-SLA queue-delay
    /// accounting at termination.
    pub created_at: DateTime<Utc>,
    pub assigned_at: DateTime<Utc>,
}

pub struct Wrapper;

impl Wrapper {
    /// Spawns the workload as the leader of a brand-new process group, so
    /// that nothing sent to the wrapper (including a signal that kills the
    /// wrapper outright) is ever delivered to the child.
    pub async fn run(
        spec: RunSpec,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<WrapperResult, WrapperError> {
        let start_time = Utc::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        spec.governance.apply_to_command(&mut cmd);

        let governance_for_child = spec.governance.clone();
        unsafe {
            cmd.pre_exec(move || {
                // setsid() makes the child the leader of a new session and
                // process group; a SIGTERM delivered to the wrapper's own
                // group never reaches it.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                governance_for_child.apply_rlimits_pre_exec()?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(WrapperError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        spec.governance.apply_to_pid(pid as i32);

        log::info!("job {} wrapper spawned pid {pid} in new process group", spec.job_id);

        let wait_result = match timeout {
            Some(t) => Self::wait_with_control(&mut child, t, spec.grace_period, pid, &cancel).await,
            None => Self::wait_cancellable(&mut child, spec.grace_period, pid, &cancel).await,
        };

        let end_time = Utc::now();
        let duration_ms = (end_time - start_time).num_milliseconds();

        let (exit_code, failure_reason, canceled) = match wait_result {
            Ok((Some(status), canceled)) => (status.code(), None, canceled),
            Ok((None, canceled)) if canceled => (None, None, true),
            Ok((None, _)) => (None, Some(FailureReason::Timeout), false),
            Err(e) => {
                log::error!("job {} wrapper wait failed: {e}", spec.job_id);
                (None, Some(FailureReason::RuntimeError), false)
            }
        };

        let queue_delay_ok = (spec.assigned_at - spec.created_at).num_milliseconds()
            <= QUEUE_DELAY_TARGET.as_millis() as i64;
        let processing_ok = duration_ms <= PROCESSING_TIME_TARGET.as_millis() as i64;
        let failure_ok = failure_reason.map(|r| !r.is_platform_fault()).unwrap_or(true);
        let platform_sla_compliant = queue_delay_ok && processing_ok && failure_ok;

        let platform_sla_reason = if canceled {
            None
        } else if platform_sla_compliant {
            Some("completed_within_limits".to_string())
        } else if !queue_delay_ok {
            Some("queue_delay_exceeded".to_string())
        } else if !processing_ok {
            Some("processing_time_exceeded".to_string())
        } else {
            failure_reason.map(|r| format!("{r:?}"))
        };

        Ok(WrapperResult {
            job_id: spec.job_id,
            pid,
            mode: WrapperMode::Run,
            start_time,
            end_time,
            duration_ms,
            exit_code,
            platform_sla_compliant,
            platform_sla_reason,
            failure_reason,
            canceled,
        })
    }

    /// Waits for the child, escalating from SIGTERM to SIGKILL if it
    /// outlives `timeout` or if `cancel` fires first, with `grace_period`
    /// between the two signals. Returns `(None, _)` if the child still
    /// hadn't exited after the escalation completed, and `(_, true)` if the
    /// cancellation token (rather than the timeout) triggered the signal.
    async fn wait_with_control(
        child: &mut Child,
        timeout: Duration,
        grace_period: Duration,
        pid: u32,
        cancel: &CancellationToken,
    ) -> std::io::Result<(Option<std::process::ExitStatus>, bool)> {
        tokio::select! {
            status = child.wait() => return status.map(|s| (Some(s), false)),
            _ = tokio::time::sleep(timeout) => {
                log::warn!("pid {pid} exceeded its time budget, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                let status = Self::finish_after_signal(child, grace_period, pid).await?;
                Ok((status, false))
            }
            _ = cancel.cancelled() => {
                log::info!("pid {pid} canceled, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                let status = Self::finish_after_signal(child, grace_period, pid).await?;
                Ok((status, true))
            }
        }
    }

    /// Same escalation as `wait_with_control` but with no wall-clock
    /// timeout — only cancellation can trigger the SIGTERM/SIGKILL path.
    async fn wait_cancellable(
        child: &mut Child,
        grace_period: Duration,
        pid: u32,
        cancel: &CancellationToken,
    ) -> std::io::Result<(Option<std::process::ExitStatus>, bool)> {
        tokio::select! {
            status = child.wait() => status.map(|s| (Some(s), false)),
            _ = cancel.cancelled() => {
                log::info!("pid {pid} canceled, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                let status = Self::finish_after_signal(child, grace_period, pid).await?;
                Ok((status, true))
            }
        }
    }

    /// Waits out `grace_period` after a SIGTERM, escalating to SIGKILL if
    /// the workload ignores it.
    async fn finish_after_signal(
        child: &mut Child,
        grace_period: Duration,
        pid: u32,
    ) -> std::io::Result<Option<std::process::ExitStatus>> {
        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                log::warn!("pid {pid} ignored SIGTERM, sending SIGKILL");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                // Give the kernel a moment to reap it, then stop waiting —
                // the caller records this as a timeout/cancellation regardless.
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                Ok(None)
            }
        }
    }

    /// Governs an already-running PID without ever owning it: liveness is
    /// polled via an existence probe (`kill(pid, 0)`), never a real signal.
    /// If the wrapper itself is killed before the target exits, no result
    /// is ever emitted — this is the documented asymmetry between run and
    /// attach mode.
    pub async fn attach(
        job_id: Uuid,
        pid: i32,
        governance: Governance,
        poll_interval: Duration,
    ) -> Result<WrapperResult, WrapperError> {
        let start_time = Utc::now();
        if !process_exists(pid) {
            return Err(WrapperError::NoSuchProcess(pid));
        }
        governance.apply_to_pid(pid);

        loop {
            tokio::time::sleep(poll_interval).await;
            if !process_exists(pid) {
                break;
            }
        }

        let end_time = Utc::now();
        Ok(WrapperResult {
            job_id,
            pid: pid as u32,
            mode: WrapperMode::Attach,
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            // Attach mode cannot observe an exit code: we only know the
            // process is gone, not how it left.
            exit_code: None,
            platform_sla_compliant: true,
            platform_sla_reason: None,
            failure_reason: None,
            canceled: false,
        })
    }
}

fn process_exists(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: Vec<String>, grace_period: Duration) -> RunSpec {
        let now = Utc::now();
        RunSpec {
            job_id: Uuid::new_v4(),
            program: program.into(),
            args,
            work_dir: std::env::temp_dir(),
            governance: Governance::default(),
            grace_period,
            created_at: now,
            assigned_at: now,
        }
    }

    #[tokio::test]
    async fn run_completes_and_reports_exit_code() {
        let spec = spec("true", vec![], Duration::from_secs(2));
        let result = Wrapper::run(spec, Some(Duration::from_secs(5)), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.platform_sla_compliant);
        assert_eq!(result.platform_sla_reason.as_deref(), Some("completed_within_limits"));
        assert!(!result.canceled);
    }

    #[tokio::test]
    async fn run_times_out_and_is_not_platform_sla_compliant() {
        let spec = spec("sleep", vec!["30".into()], Duration::from_millis(200));
        let result = Wrapper::run(spec, Some(Duration::from_millis(200)), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.failure_reason, Some(FailureReason::Timeout));
        assert!(!result.platform_sla_compliant);
        assert!(!result.canceled);
    }

    #[tokio::test]
    async fn run_is_canceled_before_the_workload_finishes_on_its_own() {
        let spec = spec("sleep", vec!["30".into()], Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let cancel_for_trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_for_trigger.cancel();
        });

        let result = Wrapper::run(spec, Some(Duration::from_secs(30)), cancel).await.unwrap();
        assert!(result.canceled);
        assert_eq!(result.platform_sla_reason, None);
    }

    #[tokio::test]
    async fn attach_to_nonexistent_pid_errors() {
        // A PID essentially guaranteed not to exist.
        let err = Wrapper::attach(Uuid::new_v4(), 999_999, Governance::default(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, WrapperError::NoSuchProcess(_)));
    }
}
