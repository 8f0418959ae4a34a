// src/client.rs
//
// =============================================================================
// RAILYARD: MASTER-FACING HTTP CLIENT
// =============================================================================
//
// Shared by the worker agent and `railyardctl`. Every outbound call goes
// through `retrying_send`, which applies the same exponential backoff
// policy (1s initial, x2, cap 30s, 3 attempts) to any request closure —
// the pattern mirrors a synchronous heartbeat-retry loop from elsewhere in
// this codebase's lineage, just rebuilt on `reqwest`/`tokio` instead of
// `ureq`/`thread::sleep`.

use crate::core::{HardwareDescriptor, Job, JobResult, JobStatus, Node};
use crate::error::AgentError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct MasterClient {
    http: Client,
    base_url: String,
    auth_token: String,
}

impl MasterClient {
    pub fn new(base_url: String, auth_token: String) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self { http, base_url, auth_token }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Runs `attempt` up to `MAX_ATTEMPTS` times with exponential backoff,
    /// only retrying on transport failures and 5xx responses. A 4xx is
    /// treated as non-retryable — the caller asked the wrong question, not
    /// the network misbehaving.
    async fn retrying_send<T, F, Fut>(&self, mut attempt: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RetryOutcome>>,
    {
        let mut backoff = INITIAL_BACKOFF;
        for try_num in 1..=MAX_ATTEMPTS {
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(RetryOutcome::Fatal(e)) => return Err(e),
                Err(RetryOutcome::Retryable(e)) => {
                    if try_num == MAX_ATTEMPTS {
                        return Err(e);
                    }
                    log::warn!("transient error talking to master (attempt {try_num}): {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        unreachable!("loop always returns within MAX_ATTEMPTS iterations")
    }

    pub async fn register_node(&self, address: &str, hardware: &HardwareDescriptor) -> Result<Uuid, AgentError> {
        #[derive(Serialize)]
        struct Req<'a> {
            address: &'a str,
            hardware: &'a HardwareDescriptor,
        }
        #[derive(Deserialize)]
        struct Resp {
            node_id: Uuid,
        }

        self.retrying_send(|| async {
            let resp = self
                .http
                .post(self.url("/nodes"))
                .bearer_auth(&self.auth_token)
                .json(&Req { address, hardware })
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;

            classify_response(resp)
                .await?
                .json::<Resp>()
                .await
                .map(|r| r.node_id)
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }

    pub async fn heartbeat(&self, node_id: Uuid) -> Result<(), AgentError> {
        self.retrying_send(|| async {
            let resp = self
                .http
                .post(self.url(&format!("/nodes/{node_id}/heartbeat")))
                .bearer_auth(&self.auth_token)
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Err(RetryOutcome::Fatal(AgentError::UnknownNode));
            }
            classify_response(resp).await.map(|_| ())
        })
        .await
    }

    pub async fn next_job(&self, node_id: Uuid, free_slots: usize) -> Result<Option<Job>, AgentError> {
        #[derive(Serialize)]
        struct Req {
            node_id: Uuid,
            free_slots: usize,
        }

        self.retrying_send(|| async {
            let resp = self
                .http
                .post(self.url("/jobs/next"))
                .bearer_auth(&self.auth_token)
                .json(&Req { node_id, free_slots })
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;

            if resp.status() == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let resp = classify_response(resp).await?;
            resp.json::<Job>()
                .await
                .map(Some)
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }

    pub async fn submit_result(
        &self,
        job_id: Uuid,
        status: JobStatus,
        failure_reason: Option<crate::core::FailureReason>,
        result: Option<JobResult>,
    ) -> Result<(), AgentError> {
        #[derive(Serialize)]
        struct Req {
            status: String,
            failure_reason: Option<crate::core::FailureReason>,
            result: Option<JobResult>,
        }

        self.retrying_send(|| async {
            let resp = self
                .http
                .post(self.url(&format!("/jobs/{job_id}/result")))
                .bearer_auth(&self.auth_token)
                .json(&Req {
                    status: status.as_str().to_string(),
                    failure_reason,
                    result: result.clone(),
                })
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;
            classify_response(resp).await.map(|_| ())
        })
        .await
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<Job, AgentError> {
        self.retrying_send(|| async {
            let resp = self
                .http
                .get(self.url(&format!("/jobs/{job_id}")))
                .bearer_auth(&self.auth_token)
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;
            let resp = classify_response(resp).await?;
            resp.json::<Job>()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }

    // --- Management CLI surface ---

    pub async fn submit_job(&self, body: serde_json::Value) -> Result<Uuid, AgentError> {
        #[derive(Deserialize)]
        struct Resp {
            job_id: Uuid,
        }
        self.retrying_send(|| async {
            let resp = self
                .http
                .post(self.url("/jobs"))
                .bearer_auth(&self.auth_token)
                .json(&body)
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;
            let resp = classify_response(resp).await?;
            resp.json::<Resp>()
                .await
                .map(|r| r.job_id)
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, AgentError> {
        self.retrying_send(|| async {
            let resp = self
                .http
                .get(self.url("/jobs"))
                .bearer_auth(&self.auth_token)
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;
            let resp = classify_response(resp).await?;
            resp.json::<Vec<Job>>()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, AgentError> {
        self.retrying_send(|| async {
            let resp = self
                .http
                .post(self.url(&format!("/jobs/{job_id}/cancel")))
                .bearer_auth(&self.auth_token)
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;
            let resp = classify_response(resp).await?;
            resp.json::<Job>()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, AgentError> {
        self.retrying_send(|| async {
            let resp = self
                .http
                .get(self.url("/nodes"))
                .bearer_auth(&self.auth_token)
                .send()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))?;
            let resp = classify_response(resp).await?;
            resp.json::<Vec<Node>>()
                .await
                .map_err(|e| RetryOutcome::Retryable(AgentError::Transport(e)))
        })
        .await
    }
}

enum RetryOutcome {
    Retryable(AgentError),
    Fatal(AgentError),
}

async fn classify_response(resp: reqwest::Response) -> Result<reqwest::Response, RetryOutcome> {
    let status = resp.status();
    if status.is_success() || status == StatusCode::NO_CONTENT {
        return Ok(resp);
    }
    if status.is_server_error() {
        return Err(RetryOutcome::Retryable(AgentError::RegistrationRejected(format!(
            "master returned {status}"
        ))));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RetryOutcome::Fatal(AgentError::RegistrationRejected(format!(
        "master returned {status}: {body}"
    ))))
}
