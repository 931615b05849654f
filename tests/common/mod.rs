//! Shared fixtures for the integration tests
//!
//! Every fixture lives in its own temp directory: the computer's workdir, the
//! engine's state directory, the local staging area and the `add.sh` code.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobstage::calcjob::CODE_LINK;
use jobstage::config::{PollPolicy, RetryPolicy};
use jobstage::scheduler::{JobScript, RemoteJob, SchedulerError, SUBMIT_SCRIPT_NAME};
use jobstage::transport::{CommandOutput, LocalTransport, TransportError, TransportSession};
use jobstage::{
    AuthInfo, Backends, Code, Computer, CredentialSchema, Engine, EngineConfig, InputValue,
    JobHandle, JobRequest, JobState, JobStatus, PluginRegistry, Scheduler, Transport,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const COMPUTER: &str = "localhost";
pub const USER: &str = "tester";

/// Adds the two numbers of the file passed after `-in`
pub const ADD_SCRIPT: &str = "#!/bin/sh\nawk '{ print $1 + $2 }' \"$2\"\n";

pub struct Fixture {
    pub dir: TempDir,
    pub engine: Engine,
    pub code: Uuid,
}

impl Fixture {
    pub fn workdir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// `arithmetic.add` request for x + y with the fixture's code
    pub fn add_request(&self, x: InputValue, y: InputValue) -> JobRequest {
        let mut inputs = BTreeMap::new();
        inputs.insert(CODE_LINK.to_string(), InputValue::Code(self.code));
        inputs.insert("x".to_string(), x);
        inputs.insert("y".to_string(), y);
        JobRequest::new("arithmetic.add", COMPUTER, USER, inputs)
    }
}

/// Fast polling and retries so the tests finish in milliseconds
pub fn fast_config(root: &Path) -> EngineConfig {
    EngineConfig {
        state_dir: root.join("state"),
        staging_dir: Some(root.join("staging")),
        polling: PollPolicy {
            min_interval_ms: 10,
            max_interval_ms: 50,
            multiplier: 1.5,
            max_unknown_polls: 5,
            max_poll_errors: 3,
        },
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        },
    }
}

pub fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// Engine with a local computer driven by the given scheduler tag, and
/// `script` registered as its code
pub fn fixture_with(backends: Backends, scheduler: &str, script: &str) -> Fixture {
    fixture_on(backends, "local", scheduler, script, |_| {})
}

/// Like [`fixture_with`], over any transport tag and with `tweak` applied to
/// the fast configuration
pub fn fixture_on(
    backends: Backends,
    transport: &str,
    scheduler: &str,
    script: &str,
    tweak: impl FnOnce(&mut EngineConfig),
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let bin = dir.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let executable = bin.join("add.sh");
    write_executable(&executable, script);

    let mut config = fast_config(dir.path());
    tweak(&mut config);
    let mut engine = Engine::new(config, backends, PluginRegistry::builtin()).unwrap();
    let workdir = dir.path().join("work");
    engine
        .register_computer(Computer::new(
            COMPUTER,
            "localhost",
            workdir.to_string_lossy(),
            transport,
            scheduler,
        ))
        .unwrap();
    engine.configure(COMPUTER, USER, BTreeMap::new()).unwrap();
    let code = engine
        .register_code(Code::new("add", COMPUTER, executable))
        .unwrap();

    Fixture { dir, engine, code }
}

/// Local computer running jobs as background processes
pub fn local_fixture() -> Fixture {
    fixture_with(Backends::builtin(), "direct", ADD_SCRIPT)
}

/// Local computer whose scheduler replays `scheduler`'s scripted statuses
pub fn scripted_fixture(scheduler: &Arc<ScriptedScheduler>) -> Fixture {
    let mut backends = Backends::builtin();
    backends.register_scheduler(Arc::clone(scheduler) as Arc<dyn Scheduler>);
    fixture_with(backends, "scripted", ADD_SCRIPT)
}

/// Computer reached through a [`FaultyTransport`], scheduled by `scheduler`
pub fn faulty_fixture(
    transport: &Arc<FaultyTransport>,
    scheduler: &Arc<ScriptedScheduler>,
    tweak: impl FnOnce(&mut EngineConfig),
) -> Fixture {
    let mut backends = Backends::builtin();
    backends.register_transport(Arc::clone(transport) as Arc<dyn Transport>);
    backends.register_scheduler(Arc::clone(scheduler) as Arc<dyn Scheduler>);
    fixture_on(backends, "faulty", "scripted", ADD_SCRIPT, tweak)
}

/// Poll the handle until the job reaches `state` or a terminal state
pub fn wait_for_state(handle: &JobHandle, state: JobState, timeout: Duration) -> JobState {
    let deadline = Instant::now() + timeout;
    loop {
        let current = handle.status().state;
        if current == state || current.is_terminal() || Instant::now() >= deadline {
            return current;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Scripted scheduler
// ============================================================================

/// Scheduler that runs the script synchronously on submit, then reports a
/// scripted sequence of statuses. Once the script is exhausted every poll
/// returns `then`.
pub struct ScriptedScheduler {
    statuses: Mutex<VecDeque<JobStatus>>,
    then: JobStatus,
    /// Only write the submit script; the job never produces outputs
    dry: bool,
    pub submits: AtomicUsize,
    pub polls: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl ScriptedScheduler {
    pub fn new(statuses: Vec<JobStatus>, then: JobStatus) -> Arc<Self> {
        Self::build(statuses, then, false)
    }

    /// Reports `statuses` without ever running the script
    pub fn dry(statuses: Vec<JobStatus>, then: JobStatus) -> Arc<Self> {
        Self::build(statuses, then, true)
    }

    fn build(statuses: Vec<JobStatus>, then: JobStatus, dry: bool) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.into()),
            then,
            dry,
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Scheduler for ScriptedScheduler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn directives(&self, _script: &JobScript) -> Vec<String> {
        vec!["# scripted".to_string()]
    }

    fn submit(
        &self,
        session: &dyn TransportSession,
        script: &JobScript,
        working_directory: &Path,
    ) -> Result<String, SchedulerError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        session.write_file(
            &working_directory.join(SUBMIT_SCRIPT_NAME),
            self.render(script)?.as_bytes(),
        )?;
        if self.dry {
            return Ok(format!("scripted-{}", n));
        }
        let output = session.exec(&format!("/bin/bash {}", SUBMIT_SCRIPT_NAME), working_directory)?;
        if !output.success() {
            return Err(SchedulerError::Submission(output.stderr));
        }
        Ok(format!("scripted-{}", n))
    }

    fn poll(&self, _session: &dyn TransportSession, _job: &RemoteJob) -> Result<JobStatus, SchedulerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.then.clone()))
    }

    fn cancel(&self, _session: &dyn TransportSession, _job: &RemoteJob) -> Result<(), SchedulerError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Faulty transport
// ============================================================================

/// Failure budget and call counters shared by a [`FaultyTransport`] and
/// every session it opens
#[derive(Debug, Default)]
pub struct Faults {
    /// Uploads that fail before one is let through; `usize::MAX` never recovers
    pub put_failures: AtomicUsize,
    pub get_failures: AtomicUsize,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
    /// Sessions opened and not yet closed
    pub open_sessions: AtomicUsize,
}

impl Faults {
    fn take(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Local transport whose transfers fail on demand with a connection error
pub struct FaultyTransport {
    inner: LocalTransport,
    pub faults: Arc<Faults>,
}

impl FaultyTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalTransport::new(),
            faults: Arc::new(Faults::default()),
        })
    }

    pub fn fail_puts(&self, count: usize) {
        self.faults.put_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, count: usize) {
        self.faults.get_failures.store(count, Ordering::SeqCst);
    }

    pub fn puts(&self) -> usize {
        self.faults.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.faults.gets.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.faults.open_sessions.load(Ordering::SeqCst)
    }
}

impl Transport for FaultyTransport {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn auth_schema(&self) -> &CredentialSchema {
        self.inner.auth_schema()
    }

    fn open(
        &self,
        computer: &Computer,
        auth: &AuthInfo,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let inner = self.inner.open(computer, auth)?;
        self.faults.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FaultySession {
            inner,
            faults: Arc::clone(&self.faults),
            counted: true,
        }))
    }
}

struct FaultySession {
    inner: Box<dyn TransportSession>,
    faults: Arc<Faults>,
    counted: bool,
}

impl FaultySession {
    fn refused(&self, path: &Path) -> TransportError {
        TransportError::Connection {
            target: path.display().to_string(),
            reason: "connection reset by peer".to_string(),
        }
    }
}

impl TransportSession for FaultySession {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.counted {
            self.counted = false;
            self.faults.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.close()
    }

    fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        self.inner.exists(path)
    }

    fn is_file(&self, path: &Path) -> Result<bool, TransportError> {
        self.inner.is_file(path)
    }

    fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        self.faults.puts.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.put_failures) {
            return Err(self.refused(remote));
        }
        self.inner.put(local, remote)
    }

    fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        self.faults.gets.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.get_failures) {
            return Err(self.refused(remote));
        }
        self.inner.get(remote, local)
    }

    fn mkdir(&self, path: &Path) -> Result<(), TransportError> {
        self.inner.mkdir(path)
    }

    fn remove(&self, path: &Path) -> Result<(), TransportError> {
        self.inner.remove(path)
    }

    fn copy(&self, source: &Path, destination: &Path) -> Result<(), TransportError> {
        self.inner.copy(source, destination)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        self.inner.write_file(path, contents)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        self.inner.read_file(path)
    }

    fn exec(&self, command: &str, cwd: &Path) -> Result<CommandOutput, TransportError> {
        self.inner.exec(command, cwd)
    }
}
