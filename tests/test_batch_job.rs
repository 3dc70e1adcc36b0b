use serde_json::json;
use snowcube::io::{FailurePolicy, JobBackend, JobDescription, JobPoller, JobStatus, PollConfig};
use snowcube::types::{CancelToken, ScaError, ScaResult};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Backend replaying one scripted status sequence per submitted job
#[derive(Default)]
struct ScriptedBackend {
    scripts: Mutex<VecDeque<VecDeque<JobStatus>>>,
    current: Mutex<VecDeque<JobStatus>>,
    created: Mutex<Vec<String>>,
    canceled: Mutex<Vec<String>>,
    cancel_on_running: Option<CancelToken>,
    status_unreachable: bool,
}

impl ScriptedBackend {
    fn new(scripts: Vec<Vec<JobStatus>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().map(VecDeque::from).collect()),
            ..Default::default()
        }
    }
}

impl JobBackend for ScriptedBackend {
    fn create(&self, _job: &JobDescription) -> ScaResult<String> {
        let mut created = self.created.lock().unwrap();
        let id = format!("job-{}", created.len() + 1);
        created.push(id.clone());
        *self.current.lock().unwrap() = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(id)
    }

    fn start(&self, _job_id: &str) -> ScaResult<()> {
        Ok(())
    }

    fn status(&self, job_id: &str) -> ScaResult<JobStatus> {
        if self.status_unreachable {
            return Err(ScaError::Http(format!("GET /jobs/{}: connection reset", job_id)));
        }
        let mut current = self.current.lock().unwrap();
        // the last scripted status repeats
        let next = if current.len() > 1 { current.pop_front() } else { current.front().copied() };
        let status = next.unwrap_or(JobStatus::Running);
        if status == JobStatus::Running {
            if let Some(token) = &self.cancel_on_running {
                token.cancel();
            }
        }
        Ok(status)
    }

    fn error_message(&self, job_id: &str) -> ScaResult<String> {
        Ok(format!("{} ran out of memory", job_id))
    }

    fn cancel(&self, job_id: &str) -> ScaResult<()> {
        self.canceled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    fn download_results(&self, job_id: &str, target_dir: &Path) -> ScaResult<Vec<PathBuf>> {
        let path = target_dir.join(format!("{}.json", job_id));
        std::fs::write(&path, r#"{"2018-02-03T00:00:00Z": [[100, 20, 30]]}"#)?;
        Ok(vec![path])
    }
}

fn fast_config(policy: FailurePolicy) -> PollConfig {
    PollConfig {
        poll_interval: Duration::from_millis(1),
        max_wait: Duration::from_secs(5),
        failure_policy: policy,
    }
}

fn job() -> JobDescription {
    JobDescription::new("snow cover", json!({ "load": { "process_id": "load_collection" } }))
}

#[test]
fn test_job_runs_to_completion() {
    let _ = env_logger::builder().is_test(true).try_init();

    let backend = ScriptedBackend::new(vec![vec![JobStatus::Queued, JobStatus::Running, JobStatus::Finished]]);
    let outcome = JobPoller::new(fast_config(FailurePolicy::Fail))
        .run(&backend, &job(), &CancelToken::new())
        .unwrap();

    assert_eq!(outcome.job_id, "job-1");
    assert_eq!(outcome.attempts, 1);
    assert!(backend.canceled.lock().unwrap().is_empty());
}

#[test]
fn test_error_state_surfaces_job_failed() {
    let backend = ScriptedBackend::new(vec![vec![JobStatus::Running, JobStatus::Error]]);
    let err = JobPoller::new(fast_config(FailurePolicy::Fail))
        .run(&backend, &job(), &CancelToken::new())
        .unwrap_err();

    match err {
        ScaError::JobFailed { job_id, status, message } => {
            assert_eq!(job_id, "job-1");
            assert_eq!(status, "error");
            assert!(message.contains("out of memory"));
        }
        other => panic!("Expected JobFailed, got {:?}", other),
    }
}

#[test]
fn test_failed_job_is_resubmitted() {
    let backend = ScriptedBackend::new(vec![
        vec![JobStatus::Queued, JobStatus::Error],
        vec![JobStatus::Running, JobStatus::Finished],
    ]);
    let outcome = JobPoller::new(fast_config(FailurePolicy::Resubmit { max_attempts: 3 }))
        .run(&backend, &job(), &CancelToken::new())
        .unwrap();

    assert_eq!(outcome.job_id, "job-2");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(backend.created.lock().unwrap().len(), 2);
}

#[test]
fn test_resubmission_gives_up_after_max_attempts() {
    let backend = ScriptedBackend::new(vec![vec![JobStatus::Error], vec![JobStatus::Error], vec![JobStatus::Finished]]);
    let err = JobPoller::new(fast_config(FailurePolicy::Resubmit { max_attempts: 2 }))
        .run(&backend, &job(), &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, ScaError::JobFailed { ref job_id, .. } if job_id == "job-2"));
}

#[test]
fn test_remote_cancel_is_a_failure() {
    let backend = ScriptedBackend::new(vec![vec![JobStatus::Running, JobStatus::Canceled]]);
    let err = JobPoller::new(fast_config(FailurePolicy::Resubmit { max_attempts: 3 }))
        .run(&backend, &job(), &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, ScaError::JobFailed { ref status, .. } if status == "canceled"));
    assert_eq!(backend.created.lock().unwrap().len(), 1);
}

#[test]
fn test_stuck_job_times_out_and_is_canceled() {
    let _ = env_logger::builder().is_test(true).try_init();

    let backend = ScriptedBackend::new(vec![vec![JobStatus::Queued]]);
    let config = PollConfig {
        poll_interval: Duration::from_millis(5),
        max_wait: Duration::from_millis(30),
        failure_policy: FailurePolicy::Fail,
    };
    let err = JobPoller::new(config).run(&backend, &job(), &CancelToken::new()).unwrap_err();

    match err {
        ScaError::JobTimeout { job_id, waited } => {
            assert_eq!(job_id, "job-1");
            assert!(waited >= Duration::from_millis(30));
        }
        other => panic!("Expected JobTimeout, got {:?}", other),
    }
    assert_eq!(*backend.canceled.lock().unwrap(), vec!["job-1".to_string()]);
}

#[test]
fn test_cancel_token_stops_polling() {
    let token = CancelToken::new();
    let backend = ScriptedBackend {
        cancel_on_running: Some(token.clone()),
        ..ScriptedBackend::new(vec![vec![JobStatus::Running]])
    };
    let err = JobPoller::new(fast_config(FailurePolicy::Fail)).run(&backend, &job(), &token).unwrap_err();

    assert!(matches!(err, ScaError::Canceled));
    assert_eq!(*backend.canceled.lock().unwrap(), vec!["job-1".to_string()]);
}

#[test]
fn test_canceled_before_submission() {
    let token = CancelToken::new();
    token.cancel();
    let backend = ScriptedBackend::new(vec![vec![JobStatus::Finished]]);
    let err = JobPoller::new(fast_config(FailurePolicy::Fail)).run(&backend, &job(), &token).unwrap_err();

    assert!(matches!(err, ScaError::Canceled));
    assert!(backend.created.lock().unwrap().is_empty());
}

#[test]
fn test_run_and_download() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("results");
    let backend = ScriptedBackend::new(vec![vec![JobStatus::Finished]]);

    let (outcome, files) = JobPoller::new(fast_config(FailurePolicy::Fail))
        .run_and_download(&backend, &job(), &target, &CancelToken::new())
        .unwrap();

    assert_eq!(outcome.attempts, 1);
    assert_eq!(files, vec![target.join("job-1.json")]);
    assert!(files[0].exists());
}

#[test]
fn test_status_error_cancels_remote_job() {
    let backend = ScriptedBackend { status_unreachable: true, ..ScriptedBackend::new(vec![vec![JobStatus::Running]]) };
    let err = JobPoller::new(fast_config(FailurePolicy::Resubmit { max_attempts: 3 }))
        .run(&backend, &job(), &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, ScaError::Http(_)));
    assert_eq!(*backend.canceled.lock().unwrap(), vec!["job-1".to_string()]);
    assert_eq!(backend.created.lock().unwrap().len(), 1);
}

#[test]
fn test_cancel_interrupts_long_poll_interval() {
    let _ = env_logger::builder().is_test(true).try_init();

    let token = CancelToken::new();
    let backend = ScriptedBackend::new(vec![vec![JobStatus::Running]]);
    let config = PollConfig {
        poll_interval: Duration::from_secs(60),
        max_wait: Duration::from_secs(120),
        failure_policy: FailurePolicy::Fail,
    };

    let trigger = token.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let started = Instant::now();
    let err = JobPoller::new(config).run(&backend, &job(), &token).unwrap_err();
    canceller.join().unwrap();

    println!("Canceled after {:?}", started.elapsed());
    assert!(matches!(err, ScaError::Canceled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(*backend.canceled.lock().unwrap(), vec!["job-1".to_string()]);
}
