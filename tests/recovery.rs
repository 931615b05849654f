//! Restarting from persisted job records
//!
//! A job that reached the scheduler is polled again and never resubmitted; a
//! job interrupted while being submitted is reported lost.

mod common;

use std::fs;

use common::{scripted_fixture, Fixture, ScriptedScheduler, COMPUTER, USER};
use jobstage::calcjob::RetrieveEntry;
use jobstage::scheduler::RemoteJob;
use jobstage::state::{FileJobStore, JobStore};
use jobstage::{FailureKind, JobError, JobRunState, JobState, JobStatus};

fn store(fixture: &Fixture) -> FileJobStore {
    FileJobStore::new(fixture.state_dir())
}

fn staged_record(job_id: &str) -> JobRunState {
    let mut record = JobRunState::new(
        job_id,
        "arithmetic.add",
        COMPUTER,
        USER,
        vec![RetrieveEntry::required("aiida.out")],
    );
    record.transition(JobState::Staged).unwrap();
    record
}

/// A record left behind in POLLING, with its outputs already on disk
fn polling_record(fixture: &Fixture, job_id: &str, remote_id: &str) -> JobRunState {
    let workdir = fixture.workdir().join(job_id);
    fs::create_dir_all(&workdir).unwrap();
    fs::write(workdir.join("aiida.out"), "7\n").unwrap();

    let mut record = staged_record(job_id);
    record.mark_submission_started();
    record.set_remote_job(&RemoteJob {
        id: remote_id.to_string(),
        working_directory: workdir,
    });
    record.transition(JobState::Submitted).unwrap();
    record.transition(JobState::Polling).unwrap();
    record
}

// ============================================================================
// Resume
// ============================================================================

#[test]
fn test_resume_polls_without_resubmitting() {
    let scheduler = ScriptedScheduler::new(vec![JobStatus::Running], JobStatus::Done { exit_code: 0 });
    let fixture = scripted_fixture(&scheduler);
    store(&fixture)
        .save(&polling_record(&fixture, "resumed-job", "scripted-9"))
        .unwrap();

    let outcome = fixture.engine.resume("resumed-job").unwrap().wait().unwrap();
    assert_eq!(scheduler.submits(), 0);
    assert_eq!(scheduler.polls(), 2);
    assert_eq!(outcome.remote_id.as_deref(), Some("scripted-9"));
    assert_eq!(fs::read_to_string(&outcome.retrieved[0].path).unwrap(), "7\n");

    let record = fixture.engine.status("resumed-job").unwrap();
    assert_eq!(record.state, JobState::Completed);
}

#[test]
fn test_interrupted_submission_is_job_lost() {
    let scheduler = ScriptedScheduler::new(Vec::new(), JobStatus::Done { exit_code: 0 });
    let fixture = scripted_fixture(&scheduler);
    let mut record = staged_record("crashed-job");
    record.mark_submission_started();
    store(&fixture).save(&record).unwrap();

    let failure = fixture.engine.resume("crashed-job").unwrap().wait().unwrap_err();
    assert_eq!(failure.failure_kind(), FailureKind::JobLost);
    assert!(matches!(failure.error, JobError::JobLost { remote_id: None, .. }));
    assert_eq!(scheduler.submits(), 0);
    assert_eq!(scheduler.polls(), 0);

    let record = fixture.engine.status("crashed-job").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure.unwrap().kind, FailureKind::JobLost);
}

#[test]
fn test_unsubmitted_record_is_not_resumable() {
    let scheduler = ScriptedScheduler::new(Vec::new(), JobStatus::Done { exit_code: 0 });
    let fixture = scripted_fixture(&scheduler);
    store(&fixture).save(&staged_record("idle-job")).unwrap();

    let failure = fixture.engine.resume("idle-job").unwrap().wait().unwrap_err();
    assert!(matches!(failure.error, JobError::NotResumable { .. }));
    assert_eq!(failure.failure_kind(), FailureKind::Configuration);
    assert_eq!(scheduler.submits(), 0);
}

// ============================================================================
// Detached cancellation
// ============================================================================

#[test]
fn test_cancel_detached_polling_job() {
    let scheduler = ScriptedScheduler::new(Vec::new(), JobStatus::Running);
    let fixture = scripted_fixture(&scheduler);
    store(&fixture)
        .save(&polling_record(&fixture, "remote-job", "scripted-4"))
        .unwrap();

    let record = fixture.engine.cancel_detached("remote-job").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(scheduler.cancels(), 1);
    let cause = record.failure.unwrap();
    assert_eq!(cause.kind, FailureKind::Cancelled);
    assert_eq!(cause.state, JobState::Polling);

    // Cancelling again leaves the terminal record alone
    let again = fixture.engine.cancel_detached("remote-job").unwrap();
    assert_eq!(again.state, JobState::Failed);
    assert_eq!(scheduler.cancels(), 1);
}

#[test]
fn test_cancel_detached_staged_job_skips_scheduler() {
    let scheduler = ScriptedScheduler::new(Vec::new(), JobStatus::Running);
    let fixture = scripted_fixture(&scheduler);
    store(&fixture).save(&staged_record("staged-job")).unwrap();

    let record = fixture.engine.cancel_detached("staged-job").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure.unwrap().kind, FailureKind::Cancelled);
    assert_eq!(scheduler.cancels(), 0);
}
