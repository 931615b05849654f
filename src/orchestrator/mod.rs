//! Submission Orchestrator
//!
//! Drives one job through its lifecycle:
//! 1. Stage: open a session, create the job directory, upload local copies,
//!    then perform remote copies
//! 2. Submit once; the remote id is persisted before polling starts
//! 3. Poll with growing intervals until the scheduler reports a terminal status
//! 4. Retrieve outputs into the local store
//! 5. Finalize from the captured status
//!
//! Every state change is persisted before the next step. Each phase opens
//! its own session and closes it before returning.

mod backoff;
mod cancel;
mod error;

pub use backoff::Backoff;
use backoff::RetryError;
pub use cancel::CancellationToken;
pub use error::{FailureKind, JobError, JobFailure, JobOutcome, RetrievalError, StagingError};

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::authinfo::AuthInfo;
use crate::calcjob::PreparedJob;
use crate::computer::{job_directory, Computer};
use crate::config::{PollPolicy, RetryPolicy};
use crate::scheduler::{JobScript, JobStatus, RemoteJob, Scheduler, SchedulerError};
use crate::state::{JobRunState, JobState, JobStateError, JobStore, RetrievedFile};
use crate::transport::{Session, Transport, TransportError};

/// The resolved target of one job
#[derive(Clone)]
pub struct JobContext {
    pub computer: Computer,
    /// Snapshot taken when the job was submitted
    pub auth: AuthInfo,
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("computer", &self.computer.name)
            .field("user", &self.auth.user)
            .field("transport", &self.transport.name())
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}

/// Runs one job; owned by the job's thread
pub struct Orchestrator {
    ctx: JobContext,
    store: Arc<dyn JobStore>,
    polling: PollPolicy,
    retry: RetryPolicy,
    cancel: CancellationToken,
    record: Arc<Mutex<JobRunState>>,
}

impl Orchestrator {
    pub fn new(
        ctx: JobContext,
        store: Arc<dyn JobStore>,
        polling: PollPolicy,
        retry: RetryPolicy,
        record: JobRunState,
    ) -> Self {
        Self {
            ctx,
            store,
            polling,
            retry,
            cancel: CancellationToken::new(),
            record: Arc::new(Mutex::new(record)),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live view of the job record, shared with handles
    pub fn record(&self) -> Arc<Mutex<JobRunState>> {
        Arc::clone(&self.record)
    }

    fn lock(&self) -> MutexGuard<'_, JobRunState> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_id(&self) -> String {
        self.lock().job_id.clone()
    }

    /// Apply a change to the record and persist it
    fn update<R>(
        &self,
        change: impl FnOnce(&mut JobRunState) -> Result<R, JobStateError>,
    ) -> Result<R, JobError> {
        let mut record = self.lock();
        let value = change(&mut *record)?;
        self.store.save(&*record)?;
        Ok(value)
    }

    fn transition(&self, state: JobState) -> Result<(), JobError> {
        let job_id = self.update(|r| r.transition(state).map(|_| r.job_id.clone()))?;
        tracing::info!(job_id = %job_id, state = ?state, "job state changed");
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled {
                state: self.lock().state,
            });
        }
        Ok(())
    }

    /// Retry a transport operation. A cancellation during the wait between
    /// attempts is reported as such; other errors go through `wrap`.
    fn with_retry<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, TransportError>,
        wrap: impl FnOnce(TransportError) -> JobError,
    ) -> Result<T, JobError> {
        backoff::retry(&self.retry, &self.cancel, what, TransportError::is_transient, op).map_err(
            |e| match e {
                RetryError::Cancelled => JobError::Cancelled {
                    state: self.lock().state,
                },
                RetryError::Failed(source) => wrap(source),
            },
        )
    }

    fn open_session(&self) -> Result<Session, JobError> {
        let ctx = &self.ctx;
        self.with_retry(
            "open session",
            || Session::open(ctx.transport.as_ref(), &ctx.computer, &ctx.auth),
            |source| JobError::Connection {
                computer: ctx.computer.name.clone(),
                source,
            },
        )
    }

    /// Stage, submit, poll, retrieve and finalize a freshly built job
    pub fn run(self, prepared: PreparedJob, script: JobScript) -> Result<JobOutcome, JobFailure> {
        let result = self.stage(prepared).and_then(|workdir| {
            let job = self.submit(&script, &workdir)?;
            self.poll_and_finish(&job)
        });
        self.finish(result)
    }

    /// Continue a job from its persisted record. A job that reached the
    /// scheduler is polled again, never resubmitted.
    pub fn resume(self) -> Result<JobOutcome, JobFailure> {
        let record = self.lock().clone();
        tracing::info!(job_id = %record.job_id, state = ?record.state, "resuming job");
        let result = match record.state {
            JobState::Completed | JobState::Failed => Ok(()),
            JobState::Submitted | JobState::Polling => match record.remote_job() {
                Some(job) => self.poll_and_finish(&job),
                None => Err(JobError::NotResumable {
                    job_id: record.job_id.clone(),
                    reason: "record has no remote job".to_string(),
                }),
            },
            JobState::Retrieved => match &record.last_status {
                Some(status) => self.finalize(status, record.remote_id.as_deref().unwrap_or("")),
                None => Err(JobError::NotResumable {
                    job_id: record.job_id.clone(),
                    reason: "no scheduler status was recorded".to_string(),
                }),
            },
            JobState::Built | JobState::Staged if record.submission_started_at.is_some() => {
                Err(JobError::JobLost {
                    remote_id: None,
                    reason: "interrupted during submission; the job may be running unrecorded"
                        .to_string(),
                })
            }
            JobState::Built | JobState::Staged => Err(JobError::NotResumable {
                job_id: record.job_id.clone(),
                reason: "never submitted and its staging area is gone".to_string(),
            }),
        };
        self.finish(result)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %prepared.job_id))]
    fn stage(&self, prepared: PreparedJob) -> Result<PathBuf, JobError> {
        self.check_cancelled()?;
        let session = self.open_session()?;
        let workdir = job_directory(session.root(), &prepared.job_id);
        let staging_err = |path: &Path, source| -> JobError {
            StagingError::Transfer {
                path: path.to_path_buf(),
                source,
            }
            .into()
        };

        self.with_retry("mkdir", || session.mkdir(&workdir), |e| staging_err(&workdir, e))?;
        self.update(|r| {
            r.remote_workdir = Some(workdir.clone());
            Ok(())
        })?;

        for copy in prepared.plan.local_copy() {
            self.check_cancelled()?;
            let destination = workdir.join(&copy.destination);
            self.with_retry(
                "upload",
                || session.put(&copy.source, &destination),
                |e| staging_err(&copy.source, e),
            )?;
        }
        for copy in prepared.plan.remote_copy() {
            self.check_cancelled()?;
            if copy.computer != self.ctx.computer.name {
                return Err(StagingError::CrossComputer {
                    source_computer: copy.computer.clone(),
                    computer: self.ctx.computer.name.clone(),
                }
                .into());
            }
            let destination = workdir.join(&copy.destination);
            self.with_retry(
                "remote copy",
                || session.copy(&copy.source, &destination),
                |e| staging_err(&copy.source, e),
            )?;
        }
        tracing::debug!(
            job_id = %prepared.job_id,
            path = %workdir.display(),
            uploads = prepared.plan.local_copy().len(),
            remote_copies = prepared.plan.remote_copy().len(),
            "job directory populated"
        );
        drop(session);

        if let Err(e) = prepared.staging.close() {
            tracing::warn!(job_id = %prepared.job_id, error = %e, "failed to remove staging area");
        }
        self.transition(JobState::Staged)?;
        Ok(workdir)
    }

    fn submit(&self, script: &JobScript, workdir: &Path) -> Result<RemoteJob, JobError> {
        self.check_cancelled()?;
        let session = self.open_session()?;
        self.update(|r| {
            r.mark_submission_started();
            Ok(())
        })?;

        let id = self
            .ctx
            .scheduler
            .submit(&*session, script, workdir)
            .map_err(JobError::Submission)?;
        drop(session);

        let job = RemoteJob {
            id,
            working_directory: workdir.to_path_buf(),
        };
        self.update(|r| {
            r.set_remote_job(&job);
            r.transition(JobState::Submitted)
        })?;
        tracing::info!(
            job_id = %self.job_id(),
            remote_id = %job.id,
            scheduler = self.ctx.scheduler.name(),
            "job submitted"
        );
        Ok(job)
    }

    fn poll_and_finish(&self, job: &RemoteJob) -> Result<(), JobError> {
        let status = self.poll_until_terminal(job)?;
        if let Err(e) = self.retrieve(job) {
            let cancelled = matches!(e, JobError::Cancelled { .. });
            if !cancelled && status != (JobStatus::Done { exit_code: 0 }) {
                tracing::warn!(remote_id = %job.id, error = %e, "retrieval failed for an unsuccessful job");
            } else {
                return Err(e);
            }
        }
        self.finalize(&status, &job.id)
    }

    fn poll_once(&self, job: &RemoteJob) -> Result<JobStatus, SchedulerError> {
        let session = Session::open(self.ctx.transport.as_ref(), &self.ctx.computer, &self.ctx.auth)?;
        self.ctx.scheduler.poll(&*session, job)
    }

    /// Poll until Done or Failed. Unknown is tolerated up to the configured
    /// number of consecutive polls, as are poll errors.
    fn poll_until_terminal(&self, job: &RemoteJob) -> Result<JobStatus, JobError> {
        if self.lock().state == JobState::Submitted {
            self.transition(JobState::Polling)?;
        }
        let mut delays = Backoff::new(&self.polling);
        let mut unknown = 0u32;
        let mut errors = 0u32;

        loop {
            if self.cancel.wait(delays.next_delay()) {
                self.cancel_remote(job);
                return Err(JobError::Cancelled {
                    state: self.lock().state,
                });
            }

            let status = match self.poll_once(job) {
                Ok(status) => {
                    errors = 0;
                    status
                }
                Err(e) => {
                    errors += 1;
                    tracing::warn!(remote_id = %job.id, attempt = errors, error = %e, "poll failed");
                    if errors >= self.polling.max_poll_errors {
                        return Err(JobError::Poll {
                            remote_id: job.id.clone(),
                            source: e,
                        });
                    }
                    continue;
                }
            };

            if self.update(|r| Ok(r.observe(&status)))? {
                tracing::info!(remote_id = %job.id, status = ?status, "job status changed");
            }
            match status {
                JobStatus::Unknown => {
                    unknown += 1;
                    if unknown >= self.polling.max_unknown_polls {
                        return Err(JobError::JobLost {
                            remote_id: Some(job.id.clone()),
                            reason: format!("scheduler could not locate it for {} consecutive polls", unknown),
                        });
                    }
                }
                status if status.is_terminal() => return Ok(status),
                _ => unknown = 0,
            }
        }
    }

    fn cancel_remote(&self, job: &RemoteJob) {
        tracing::info!(remote_id = %job.id, "cancelling job");
        let result = Session::open(self.ctx.transport.as_ref(), &self.ctx.computer, &self.ctx.auth)
            .map_err(SchedulerError::from)
            .and_then(|session| self.ctx.scheduler.cancel(&*session, job));
        if let Err(e) = result {
            tracing::warn!(remote_id = %job.id, error = %e, "scheduler cancel failed");
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(remote_id = %job.id))]
    fn retrieve(&self, job: &RemoteJob) -> Result<(), JobError> {
        let (job_id, entries) = {
            let record = self.lock();
            (record.job_id.clone(), record.retrieve.clone())
        };
        let session = self.open_session()?;
        let local_root = self.store.retrieved_dir(&job_id);
        fs::create_dir_all(&local_root).map_err(|source| RetrievalError::Local {
            path: local_root.clone(),
            source,
        })?;

        let mut retrieved = Vec::with_capacity(entries.len());
        for entry in &entries {
            let remote = job.working_directory.join(&entry.remote);
            let transfer_err = |source| -> JobError {
                RetrievalError::Transfer {
                    path: entry.remote.clone(),
                    source,
                }
                .into()
            };
            let present = self.with_retry("exists", || session.exists(&remote), transfer_err)?;
            if !present {
                if entry.required {
                    return Err(RetrievalError::Missing {
                        path: entry.remote.clone(),
                    }
                    .into());
                }
                tracing::debug!(job_id = %job_id, path = %entry.remote, "optional output absent");
                continue;
            }

            let local = local_root.join(entry.local_name());
            self.with_retry("download", || session.get(&remote, &local), transfer_err)?;
            let sha256 = if local.is_file() {
                Some(file_digest(&local).map_err(|source| RetrievalError::Local {
                    path: local.clone(),
                    source,
                })?)
            } else {
                None
            };
            retrieved.push(RetrievedFile {
                name: entry.local_name(),
                path: local,
                sha256,
            });
        }
        drop(session);

        tracing::info!(job_id = %job_id, files = retrieved.len(), "outputs retrieved");
        self.update(|r| {
            r.retrieved = retrieved;
            r.transition(JobState::Retrieved)
        })
    }

    fn finalize(&self, status: &JobStatus, remote_id: &str) -> Result<(), JobError> {
        match status {
            JobStatus::Done { exit_code: 0 } => self.transition(JobState::Completed),
            JobStatus::Done { exit_code } => Err(JobError::NonZeroExit {
                remote_id: remote_id.to_string(),
                exit_code: *exit_code,
            }),
            JobStatus::Failed { reason } => Err(JobError::SchedulerFailed {
                remote_id: remote_id.to_string(),
                reason: reason.clone(),
            }),
            other => Err(JobError::NotResumable {
                job_id: self.job_id(),
                reason: format!("finalized with non-terminal status {:?}", other),
            }),
        }
    }

    /// Record the outcome; any error fails the job if it is not terminal yet
    fn finish(&self, result: Result<(), JobError>) -> Result<JobOutcome, JobFailure> {
        let mut record = self.lock();
        let error = match result {
            Ok(()) => match (&record.state, record.failure.clone()) {
                (JobState::Failed, Some(failure)) => JobError::Recorded(failure),
                (JobState::Completed, _) => {
                    return Ok(JobOutcome {
                        job_id: record.job_id.clone(),
                        remote_id: record.remote_id.clone(),
                        exit_code: record.exit_code.unwrap_or(0),
                        retrieved: record.retrieved.clone(),
                    })
                }
                (state, _) => JobError::NotResumable {
                    job_id: record.job_id.clone(),
                    reason: format!("stopped in non-terminal state {:?}", state),
                },
            },
            Err(error) => error,
        };

        if !record.is_terminal() {
            match record.fail(error.failure_kind(), error.to_string()) {
                Ok(()) => {
                    if let Err(e) = self.store.save(&record) {
                        tracing::error!(job_id = %record.job_id, error = %e, "failed to persist job failure");
                    }
                }
                Err(e) => tracing::error!(job_id = %record.job_id, error = %e, "failed to mark job failed"),
            }
            tracing::error!(
                job_id = %record.job_id,
                remote_id = record.remote_id.as_deref().unwrap_or("-"),
                kind = ?error.failure_kind(),
                error = %error,
                "job failed"
            );
        }

        Err(JobFailure {
            job_id: record.job_id.clone(),
            remote_id: record.remote_id.clone(),
            exit_code: record.exit_code,
            retrieved: record.retrieved.clone(),
            error,
        })
    }
}

fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(fs::read(path)?);
    Ok(hex::encode(hasher.finalize()))
}
