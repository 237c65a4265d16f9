//! REST client for the remote batch service.
//!
//! Only two calls are needed: create a job bound to a pool, and add a
//! collection of tasks to it. The service answers each collection with a
//! per-task status, so a single request can partially succeed.

use std::sync::Arc;

use async_trait::async_trait;
use chirps_cog_config::BatchConfig;
use chirps_cog_pipeline_models::TaskId;
use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialError, CredentialProvider};

/// Content type the batch service expects on write requests.
const CONTENT_TYPE: &str = "application/json; odata=minimalmetadata";

/// Errors from talking to the batch service.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// No bearer token could be obtained.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The request did not complete.
    #[error("Batch request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A request body could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The service answered with a non-success status.
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        /// What was being attempted.
        operation: String,
        /// Response status code.
        status: u16,
        /// Response body, for diagnosis.
        body: String,
    },
}

/// One task to add to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Task id, unique within the job.
    pub id: TaskId,
    /// Command the node runs.
    pub command_line: String,
    /// Environment variables set for the command.
    pub environment: Vec<(String, String)>,
}

/// A task the service refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTask {
    /// Task that was refused.
    pub task_id: TaskId,
    /// Provider error code.
    pub code: String,
    /// Provider error message.
    pub message: String,
}

/// Per-task result of a collection submission.
pub type TaskOutcome = Result<TaskId, RejectedTask>;

/// The remote batch service.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Creates an empty job.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError`] if the job cannot be created.
    async fn create_job(&self, job_id: &str) -> Result<(), BatchError>;

    /// Adds `tasks` to `job_id`, returning one outcome per task in input
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError`] if the request as a whole fails.
    async fn submit_tasks(
        &self,
        job_id: &str,
        tasks: &[TaskSpec],
    ) -> Result<Vec<TaskOutcome>, BatchError>;
}

/// Azure-Batch-style REST client.
pub struct BatchServiceClient {
    client: reqwest::Client,
    account_url: String,
    pool_id: String,
    api_version: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl BatchServiceClient {
    /// Creates a client for the account and pool in `config`.
    #[must_use]
    pub fn new(config: &BatchConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_url: config.account_url.trim_end_matches('/').to_string(),
            pool_id: config.pool_id.clone(),
            api_version: config.api_version.clone(),
            credentials,
        }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        operation: &str,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, BatchError> {
        let token = self.credentials.bearer_token().await?;
        let url = format!("{}/{path}", self.account_url);

        let response = self
            .client
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BatchError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobBody<'a> {
    id: &'a str,
    pool_info: PoolInfo<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PoolInfo<'a> {
    pool_id: &'a str,
}

#[derive(Serialize)]
struct TaskCollectionBody<'a> {
    value: Vec<TaskBody<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskBody<'a> {
    id: &'a str,
    command_line: &'a str,
    environment_settings: Vec<EnvironmentSetting<'a>>,
}

#[derive(Serialize)]
struct EnvironmentSetting<'a> {
    name: &'a str,
    value: &'a str,
}

impl<'a> From<&'a TaskSpec> for TaskBody<'a> {
    fn from(spec: &'a TaskSpec) -> Self {
        Self {
            id: spec.id.as_str(),
            command_line: &spec.command_line,
            environment_settings: spec
                .environment
                .iter()
                .map(|(name, value)| EnvironmentSetting { name, value })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskCollectionResponse {
    #[serde(default)]
    value: Vec<TaskAddResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskAddResult {
    status: String,
    task_id: String,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<ErrorMessage>,
}

/// The service sends messages either as plain strings or as
/// `{"lang": ..., "value": ...}` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorMessage {
    Text(String),
    Localized { value: String },
}

impl ErrorMessage {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) | Self::Localized { value: s } => s,
        }
    }
}

/// Maps the service's per-task results back onto `tasks` in input order.
///
/// Tasks missing from the response are reported as rejected.
fn collect_outcomes(tasks: &[TaskSpec], response: TaskCollectionResponse) -> Vec<TaskOutcome> {
    let mut results: std::collections::BTreeMap<String, TaskAddResult> = response
        .value
        .into_iter()
        .map(|r| (r.task_id.clone(), r))
        .collect();

    tasks
        .iter()
        .map(|spec| match results.remove(spec.id.as_str()) {
            Some(result) if result.status.eq_ignore_ascii_case("success") => {
                Ok(spec.id.clone())
            }
            Some(result) => {
                let (code, message) = result.error.map_or_else(
                    || ("Unknown".to_string(), format!("status {}", result.status)),
                    |e| {
                        (
                            e.code.unwrap_or_else(|| "Unknown".to_string()),
                            e.message.map(ErrorMessage::into_string).unwrap_or_default(),
                        )
                    },
                );
                Err(RejectedTask {
                    task_id: spec.id.clone(),
                    code,
                    message,
                })
            }
            None => Err(RejectedTask {
                task_id: spec.id.clone(),
                code: "MissingResult".to_string(),
                message: "Task was absent from the service response".to_string(),
            }),
        })
        .collect()
}

#[async_trait]
impl TaskSubmitter for BatchServiceClient {
    async fn create_job(&self, job_id: &str) -> Result<(), BatchError> {
        log::info!("Creating job {job_id} on pool {}", self.pool_id);
        self.post(
            "Create job",
            "jobs",
            &JobBody {
                id: job_id,
                pool_info: PoolInfo {
                    pool_id: &self.pool_id,
                },
            },
        )
        .await?;
        Ok(())
    }

    async fn submit_tasks(
        &self,
        job_id: &str,
        tasks: &[TaskSpec],
    ) -> Result<Vec<TaskOutcome>, BatchError> {
        let body = TaskCollectionBody {
            value: tasks.iter().map(TaskBody::from).collect(),
        };
        let response = self
            .post(
                "Add task collection",
                &format!("jobs/{job_id}/addtaskcollection"),
                &body,
            )
            .await?;

        let parsed: TaskCollectionResponse = response.json().await?;
        Ok(collect_outcomes(tasks, parsed))
    }
}
