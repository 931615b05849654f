//! Transport and scheduler plugins keyed by their type tags

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::scheduler::{DirectScheduler, PbsProScheduler, Scheduler, SlurmScheduler};
use crate::transport::{LocalTransport, SshTransport, Transport};

/// Backends a computer's `transport` and `scheduler` tags resolve against
#[derive(Clone, Default)]
pub struct Backends {
    transports: BTreeMap<String, Arc<dyn Transport>>,
    schedulers: BTreeMap<String, Arc<dyn Scheduler>>,
}

impl Backends {
    /// No backends; callers register their own
    pub fn empty() -> Self {
        Self::default()
    }

    /// local + ssh transports, direct + slurm + pbspro schedulers
    pub fn builtin() -> Self {
        let mut backends = Self::empty();
        backends.register_transport(Arc::new(LocalTransport::new()));
        backends.register_transport(Arc::new(SshTransport::new()));
        backends.register_scheduler(Arc::new(DirectScheduler::new()));
        backends.register_scheduler(Arc::new(SlurmScheduler::new()));
        backends.register_scheduler(Arc::new(PbsProScheduler::new()));
        backends
    }

    pub fn register_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.name().to_string(), transport);
    }

    pub fn register_scheduler(&mut self, scheduler: Arc<dyn Scheduler>) {
        self.schedulers.insert(scheduler.name().to_string(), scheduler);
    }

    pub fn transport(&self, tag: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(tag).cloned()
    }

    pub fn scheduler(&self, tag: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.get(tag).cloned()
    }

    pub fn transport_names(&self) -> impl Iterator<Item = &str> {
        self.transports.keys().map(String::as_str)
    }

    pub fn scheduler_names(&self) -> impl Iterator<Item = &str> {
        self.schedulers.keys().map(String::as_str)
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("schedulers", &self.schedulers.keys().collect::<Vec<_>>())
            .finish()
    }
}
