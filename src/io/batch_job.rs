//! Remote batch job submission and bounded polling
//!
//! A job moves `created -> queued -> running -> finished | error | canceled`.
//! [`JobPoller`] drives that state machine with a fixed poll interval and an upper
//! bound on the total wait, so a stuck backend never blocks the caller forever.

use crate::types::{CancelToken, ScaError, ScaResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep while waiting between status polls
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Finished,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn parse(raw: &str) -> ScaResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "created" => Ok(JobStatus::Created),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(ScaError::InvalidFormat(format!("Unknown job status '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error | JobStatus::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// What to run remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub process_graph: Value,
}

impl JobDescription {
    pub fn new(title: impl Into<String>, process_graph: Value) -> Self {
        Self { title: title.into(), description: None, process_graph }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Surface the first failure
    Fail,
    /// Submit a fresh job after a failure, up to `max_attempts` submissions in total
    Resubmit { max_attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub poll_interval: Duration,
    /// Upper bound on the total time spent waiting, across resubmissions
    pub max_wait: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(2 * 60 * 60),
            failure_policy: FailurePolicy::Fail,
        }
    }
}

pub trait JobBackend {
    /// Register a job, returning its id
    fn create(&self, job: &JobDescription) -> ScaResult<String>;

    fn start(&self, job_id: &str) -> ScaResult<()>;

    fn status(&self, job_id: &str) -> ScaResult<JobStatus>;

    /// Human readable reason of a failed job
    fn error_message(&self, _job_id: &str) -> ScaResult<String> {
        Ok("no error details available".to_string())
    }

    fn cancel(&self, job_id: &str) -> ScaResult<()>;

    /// Download every result asset into `target_dir`
    fn download_results(&self, job_id: &str, target_dir: &Path) -> ScaResult<Vec<PathBuf>>;
}

/// Successful run of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    /// Number of submissions, 1 unless the failure policy resubmitted
    pub attempts: u32,
    pub waited: Duration,
}

/// Default location for downloaded results
pub fn default_download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("snowcube")
        .join("results")
}

pub struct JobPoller {
    config: PollConfig,
}

impl JobPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    fn cancel_remote<B: JobBackend + ?Sized>(backend: &B, job_id: &str) {
        if let Err(e) = backend.cancel(job_id) {
            log::warn!("Failed to cancel job {}: {}", job_id, e);
        }
    }

    /// Sleep for `duration` in short slices, returning early once `cancel` is set
    fn sleep_unless_canceled(duration: Duration, cancel: &CancelToken) {
        let deadline = Instant::now() + duration;
        while !cancel.is_canceled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(CANCEL_CHECK_INTERVAL.min(deadline - now));
        }
    }

    /// Submit `job` and wait for a terminal state.
    ///
    /// Returns `JobTimeout` (after canceling the job remotely) once `max_wait` has
    /// elapsed, `JobFailed` for error or remotely canceled jobs, and `Canceled`
    /// when `cancel` is triggered.
    pub fn run<B: JobBackend + ?Sized>(
        &self,
        backend: &B,
        job: &JobDescription,
        cancel: &CancelToken,
    ) -> ScaResult<JobOutcome> {
        let started = Instant::now();
        let max_attempts = match self.config.failure_policy {
            FailurePolicy::Fail => 1,
            FailurePolicy::Resubmit { max_attempts } => max_attempts.max(1),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;
            let job_id = backend.create(job)?;
            if let Err(e) = backend.start(&job_id) {
                log::warn!("Starting job {} failed: {}", job_id, e);
                Self::cancel_remote(backend, &job_id);
                return Err(e);
            }
            log::info!("Started batch job {} '{}' (attempt {}/{})", job_id, job.title, attempt, max_attempts);

            let mut last_status = JobStatus::Created;
            let failure = loop {
                if cancel.is_canceled() {
                    log::warn!("Canceling batch job {} on request", job_id);
                    Self::cancel_remote(backend, &job_id);
                    return Err(ScaError::Canceled);
                }

                let status = match backend.status(&job_id) {
                    Ok(status) => status,
                    Err(e) => {
                        log::warn!("Status of job {} unavailable: {}; canceling", job_id, e);
                        Self::cancel_remote(backend, &job_id);
                        return Err(e);
                    }
                };
                if status != last_status {
                    log::info!("Job {} is {}", job_id, status);
                    last_status = status;
                }

                match status {
                    JobStatus::Finished => {
                        return Ok(JobOutcome { job_id, attempts: attempt, waited: started.elapsed() });
                    }
                    JobStatus::Error => {
                        let message = backend
                            .error_message(&job_id)
                            .unwrap_or_else(|e| format!("error details unavailable: {}", e));
                        break ScaError::JobFailed { job_id: job_id.clone(), status: status.to_string(), message };
                    }
                    JobStatus::Canceled => {
                        return Err(ScaError::JobFailed {
                            job_id,
                            status: status.to_string(),
                            message: "job was canceled by the backend".to_string(),
                        });
                    }
                    JobStatus::Created | JobStatus::Queued | JobStatus::Running => {}
                }

                let waited = started.elapsed();
                if waited >= self.config.max_wait {
                    log::warn!("Job {} still {} after {:?}; canceling", job_id, status, waited);
                    Self::cancel_remote(backend, &job_id);
                    return Err(ScaError::JobTimeout { job_id, waited });
                }
                Self::sleep_unless_canceled(self.config.poll_interval.min(self.config.max_wait - waited), cancel);
            };

            if attempt >= max_attempts {
                return Err(failure);
            }
            log::warn!("{}; resubmitting", failure);
        }
    }

    /// [`run`](Self::run) then download every result asset into `target_dir`
    pub fn run_and_download<B: JobBackend + ?Sized>(
        &self,
        backend: &B,
        job: &JobDescription,
        target_dir: &Path,
        cancel: &CancelToken,
    ) -> ScaResult<(JobOutcome, Vec<PathBuf>)> {
        let outcome = self.run(backend, job, cancel)?;
        std::fs::create_dir_all(target_dir)?;
        let files = backend.download_results(&outcome.job_id, target_dir)?;
        log::info!("Downloaded {} result file(s) to {}", files.len(), target_dir.display());
        Ok((outcome, files))
    }
}

/// Minimal client for the openEO batch job endpoints
pub struct OpenEoBackend {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::blocking::Client,
}

fn http_error(context: &str, e: reqwest::Error) -> ScaError {
    ScaError::Http(format!("{}: {}", context, e))
}

fn check_status(response: reqwest::blocking::Response, context: &str) -> ScaResult<reqwest::blocking::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(ScaError::Http(format!("{} failed with status {}: {}", context, status, body)))
    }
}

/// Job id from the `OpenEO-Identifier` header value or the last segment of `Location`
fn job_id_from_headers(identifier: Option<&str>, location: Option<&str>) -> Option<String> {
    identifier
        .map(str::to_string)
        .or_else(|| location.and_then(|l| l.trim_end_matches('/').rsplit('/').next()).map(str::to_string))
        .filter(|id| !id.is_empty())
}

/// `(file name, href)` of every asset in a results document
fn result_assets(document: &Value) -> ScaResult<Vec<(String, String)>> {
    let assets = document
        .get("assets")
        .and_then(Value::as_object)
        .ok_or_else(|| ScaError::InvalidFormat("Results document has no assets".to_string()))?;
    assets
        .iter()
        .map(|(name, asset)| {
            let href = asset
                .get("href")
                .and_then(Value::as_str)
                .ok_or_else(|| ScaError::InvalidFormat(format!("Asset '{}' has no href", name)))?;
            let file_name = Path::new(name)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .ok_or_else(|| ScaError::InvalidFormat(format!("Invalid asset name '{}'", name)))?;
            Ok((file_name, href.to_string()))
        })
        .collect()
}

/// Concatenated messages of an openEO logs document
fn log_messages(document: &Value) -> String {
    let messages: Vec<&str> = document
        .get("logs")
        .and_then(Value::as_array)
        .map(|logs| logs.iter().filter_map(|l| l.get("message").and_then(Value::as_str)).collect())
        .unwrap_or_default();
    if messages.is_empty() {
        "no error details available".to_string()
    } else {
        messages.join("; ")
    }
}

impl OpenEoBackend {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> ScaResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| http_error("Failed to create HTTP client", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn get_json(&self, path: &str) -> ScaResult<Value> {
        let response = self
            .authorized(self.client.get(self.url(path)))
            .send()
            .map_err(|e| http_error(&format!("GET {}", path), e))?;
        check_status(response, &format!("GET {}", path))?
            .json::<Value>()
            .map_err(|e| http_error(&format!("Decoding {}", path), e))
    }
}

impl JobBackend for OpenEoBackend {
    fn create(&self, job: &JobDescription) -> ScaResult<String> {
        let body = json!({
            "title": job.title,
            "description": job.description,
            "process": { "process_graph": job.process_graph },
        });
        let response = self
            .authorized(self.client.post(self.url("jobs")))
            .json(&body)
            .send()
            .map_err(|e| http_error("POST jobs", e))?;
        let response = check_status(response, "POST jobs")?;

        let header = |name: &str| response.headers().get(name).and_then(|v| v.to_str().ok());
        let job_id = job_id_from_headers(header("OpenEO-Identifier"), header("Location"))
            .ok_or_else(|| ScaError::InvalidFormat("Job creation returned no job id".to_string()))?;
        log::debug!("Created job {}", job_id);
        Ok(job_id)
    }

    fn start(&self, job_id: &str) -> ScaResult<()> {
        let path = format!("jobs/{}/results", job_id);
        let response = self
            .authorized(self.client.post(self.url(&path)))
            .send()
            .map_err(|e| http_error(&format!("POST {}", path), e))?;
        check_status(response, &format!("POST {}", path))?;
        Ok(())
    }

    fn status(&self, job_id: &str) -> ScaResult<JobStatus> {
        let document = self.get_json(&format!("jobs/{}", job_id))?;
        let raw = document
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ScaError::InvalidFormat(format!("Job {} document has no status", job_id)))?;
        JobStatus::parse(raw)
    }

    fn error_message(&self, job_id: &str) -> ScaResult<String> {
        let document = self.get_json(&format!("jobs/{}/logs?level=error", job_id))?;
        Ok(log_messages(&document))
    }

    fn cancel(&self, job_id: &str) -> ScaResult<()> {
        let path = format!("jobs/{}/results", job_id);
        let response = self
            .authorized(self.client.delete(self.url(&path)))
            .send()
            .map_err(|e| http_error(&format!("DELETE {}", path), e))?;
        check_status(response, &format!("DELETE {}", path))?;
        Ok(())
    }

    fn download_results(&self, job_id: &str, target_dir: &Path) -> ScaResult<Vec<PathBuf>> {
        let document = self.get_json(&format!("jobs/{}/results", job_id))?;
        let mut files = Vec::new();
        for (name, href) in result_assets(&document)? {
            log::debug!("Downloading asset {} from {}", name, href);
            let response = self
                .authorized(self.client.get(&href))
                .send()
                .map_err(|e| http_error(&format!("GET {}", href), e))?;
            let bytes = check_status(response, &format!("GET {}", href))?
                .bytes()
                .map_err(|e| http_error(&format!("Reading {}", href), e))?;

            // written next to the target so the final rename stays on one filesystem
            let mut tmp = tempfile::NamedTempFile::new_in(target_dir)?;
            tmp.write_all(&bytes)?;
            let path = target_dir.join(&name);
            tmp.persist(&path).map_err(|e| ScaError::Io(e.error))?;
            files.push(path);
        }
        Ok(files)
    }
}
