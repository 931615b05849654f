//! End-to-end jobs on the local computer with the direct scheduler
//!
//! The `arithmetic.add` plugin writes `aiida.in`, the script runs `add.sh` in
//! the background and the orchestrator polls for its exit status file.

mod common;

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use common::{fixture_with, local_fixture, wait_for_state};
use jobstage::{Backends, FailureKind, InputValue, JobError, JobState};

// ============================================================================
// Successful runs
// ============================================================================

#[test]
fn test_add_two_integers() {
    let fixture = local_fixture();
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(2), InputValue::Int(3)))
        .unwrap();
    let job_id = handle.job_id().to_string();

    let outcome = handle.wait().unwrap();
    assert_eq!(outcome.job_id, job_id);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.remote_id.is_some());

    let out = outcome
        .retrieved
        .iter()
        .find(|f| f.name == "aiida.out")
        .expect("aiida.out retrieved");
    assert_eq!(std::fs::read_to_string(&out.path).unwrap().trim(), "5");
    assert_eq!(out.sha256.as_deref().map(str::len), Some(64));

    let record = fixture.engine.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::Completed);
    let states: Vec<JobState> = record.history.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            JobState::Built,
            JobState::Staged,
            JobState::Submitted,
            JobState::Polling,
            JobState::Retrieved,
            JobState::Completed,
        ]
    );
    assert!(record.history.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn test_add_floats() {
    let fixture = local_fixture();
    let outcome = fixture
        .engine
        .submit(fixture.add_request(InputValue::Float(1.5), InputValue::Int(2)))
        .unwrap()
        .wait()
        .unwrap();
    let out = &outcome.retrieved[0];
    assert_eq!(std::fs::read_to_string(&out.path).unwrap().trim(), "3.5");
}

#[test]
fn test_job_directory_is_sharded_under_workdir() {
    let fixture = local_fixture();
    let mut request = fixture.add_request(InputValue::Int(1), InputValue::Int(1));
    request.job_id = "abcdef-0001".to_string();
    fixture.engine.submit(request).unwrap().wait().unwrap();

    let record = fixture.engine.status("abcdef-0001").unwrap();
    let expected = fixture.workdir().join("ab").join("cd").join("ef-0001");
    assert_eq!(record.remote_workdir.as_deref(), Some(expected.as_path()));
    assert!(expected.join("aiida.in").is_file());
    assert!(expected.join("_jobstage_submit.sh").is_file());
}

#[test]
fn test_duplicate_job_id_rejected() {
    let fixture = local_fixture();
    let mut request = fixture.add_request(InputValue::Int(1), InputValue::Int(1));
    request.job_id = "dup-job-id".to_string();
    fixture.engine.submit(request.clone()).unwrap().wait().unwrap();

    let err = fixture.engine.submit(request).unwrap_err();
    assert!(matches!(err, JobError::AlreadyExists(ref id) if id == "dup-job-id"));
    assert_eq!(err.failure_kind(), FailureKind::Configuration);
}

// ============================================================================
// Failed runs
// ============================================================================

#[test]
fn test_nonzero_exit_fails_after_retrieval() {
    let fixture = fixture_with(Backends::builtin(), "direct", "#!/bin/sh\necho partial\nexit 3\n");
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(2), InputValue::Int(3)))
        .unwrap();
    let job_id = handle.job_id().to_string();

    let failure = handle.wait().unwrap_err();
    assert_eq!(failure.failure_kind(), FailureKind::NonZeroExit);
    assert_eq!(failure.exit_code, Some(3));
    assert!(matches!(failure.error, JobError::NonZeroExit { exit_code: 3, .. }));
    assert!(failure.retrieved.iter().any(|f| f.name == "aiida.out"));

    let record = fixture.engine.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    let cause = record.failure.unwrap();
    assert_eq!(cause.kind, FailureKind::NonZeroExit);
    assert_eq!(cause.state, JobState::Retrieved);
}

#[test]
fn test_resume_of_finished_job_returns_stored_result() {
    let fixture = local_fixture();
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(4), InputValue::Int(4)))
        .unwrap();
    let job_id = handle.job_id().to_string();
    assert_eq!(
        wait_for_state(&handle, JobState::Completed, Duration::from_secs(30)),
        JobState::Completed
    );
    let first = handle.wait().unwrap();

    let again = fixture.engine.resume(&job_id).unwrap().wait().unwrap();
    assert_eq!(again, first);
}

fn alive(pid: &str) -> bool {
    Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn read_pid(path: &Path, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(pid) = std::fs::read_to_string(path) {
            let pid = pid.trim().to_string();
            if !pid.is_empty() {
                return Some(pid);
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}

#[test]
fn test_cancel_kills_the_code_process() {
    let pids = tempfile::TempDir::new().unwrap();
    let pid_file = pids.path().join("code.pid");
    let script = format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display());
    let fixture = fixture_with(Backends::builtin(), "direct", &script);
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(1), InputValue::Int(1)))
        .unwrap();

    let pid = read_pid(&pid_file, Duration::from_secs(30)).unwrap();
    assert!(alive(&pid));
    assert_eq!(
        wait_for_state(&handle, JobState::Polling, Duration::from_secs(30)),
        JobState::Polling
    );
    handle.cancel();
    let failure = handle.wait().unwrap_err();
    assert_eq!(failure.failure_kind(), FailureKind::Cancelled);

    // The code runs as a child of the job script, in its process group
    let deadline = Instant::now() + Duration::from_secs(10);
    while alive(&pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!alive(&pid), "code process {} survived cancellation", pid);
}
