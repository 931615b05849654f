//! Polling behaviour against a scheduler with scripted answers
//!
//! The scripted scheduler runs the job script synchronously on submit, so
//! the outputs exist by the time any status is reported.

mod common;

use std::time::Duration;

use common::{scripted_fixture, wait_for_state, ScriptedScheduler};
use jobstage::{FailureKind, InputValue, JobError, JobState, JobStatus};

#[test]
fn test_unknown_then_done_completes() {
    let scheduler = ScriptedScheduler::new(
        vec![JobStatus::Unknown, JobStatus::Unknown, JobStatus::Unknown],
        JobStatus::Done { exit_code: 0 },
    );
    let fixture = scripted_fixture(&scheduler);
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(2), InputValue::Int(3)))
        .unwrap();
    let job_id = handle.job_id().to_string();

    let outcome = handle.wait().unwrap();
    assert_eq!(outcome.remote_id.as_deref(), Some("scripted-1"));
    assert_eq!(scheduler.submits(), 1);
    assert_eq!(scheduler.polls(), 4);

    let record = fixture.engine.status(&job_id).unwrap();
    let states: Vec<JobState> = record.history.iter().map(|t| t.state).collect();
    let polling = states.iter().position(|s| *s == JobState::Polling).unwrap();
    let retrieved = states.iter().position(|s| *s == JobState::Retrieved).unwrap();
    assert!(polling < retrieved);
    assert_eq!(record.last_status, Some(JobStatus::Done { exit_code: 0 }));
}

#[test]
fn test_queued_and_running_reset_unknown_count() {
    // Four unknowns, a running, four more: never five in a row
    let mut statuses = vec![JobStatus::Unknown; 4];
    statuses.push(JobStatus::Running);
    statuses.extend(vec![JobStatus::Unknown; 4]);
    statuses.push(JobStatus::Queued);
    let scheduler = ScriptedScheduler::new(statuses, JobStatus::Done { exit_code: 0 });
    let fixture = scripted_fixture(&scheduler);

    let outcome = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(1), InputValue::Int(1)))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(scheduler.polls(), 11);
}

#[test]
fn test_too_many_unknowns_is_job_lost() {
    let scheduler = ScriptedScheduler::new(Vec::new(), JobStatus::Unknown);
    let fixture = scripted_fixture(&scheduler);
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(2), InputValue::Int(3)))
        .unwrap();
    let job_id = handle.job_id().to_string();

    let failure = handle.wait().unwrap_err();
    assert_eq!(failure.failure_kind(), FailureKind::JobLost);
    assert!(matches!(
        failure.error,
        JobError::JobLost { remote_id: Some(ref id), .. } if id == "scripted-1"
    ));
    assert_eq!(scheduler.polls(), 5);
    assert_eq!(scheduler.submits(), 1);
    assert!(failure.retrieved.is_empty());

    let record = fixture.engine.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure.unwrap().state, JobState::Polling);
}

#[test]
fn test_scheduler_failure() {
    let scheduler = ScriptedScheduler::new(
        vec![JobStatus::Queued],
        JobStatus::Failed {
            reason: "node failure".into(),
        },
    );
    let fixture = scripted_fixture(&scheduler);
    let failure = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(2), InputValue::Int(3)))
        .unwrap()
        .wait()
        .unwrap_err();

    assert_eq!(failure.failure_kind(), FailureKind::SchedulerFailed);
    assert!(failure.error.to_string().contains("node failure"));
    // Outputs are still fetched for inspection
    assert!(failure.retrieved.iter().any(|f| f.name == "aiida.out"));
}

#[test]
fn test_cancel_while_polling() {
    let scheduler = ScriptedScheduler::new(Vec::new(), JobStatus::Running);
    let fixture = scripted_fixture(&scheduler);
    let handle = fixture
        .engine
        .submit(fixture.add_request(InputValue::Int(2), InputValue::Int(3)))
        .unwrap();
    let job_id = handle.job_id().to_string();

    assert_eq!(
        wait_for_state(&handle, JobState::Polling, Duration::from_secs(10)),
        JobState::Polling
    );
    handle.cancel();
    let failure = handle.wait().unwrap_err();

    assert_eq!(failure.failure_kind(), FailureKind::Cancelled);
    assert_eq!(failure.error.exit_code(), 80);
    assert_eq!(scheduler.cancels(), 1);
    assert_eq!(scheduler.submits(), 1);

    let record = fixture.engine.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    let cause = record.failure.unwrap();
    assert_eq!(cause.kind, FailureKind::Cancelled);
    assert_eq!(cause.remote_id.as_deref(), Some("scripted-1"));
}
