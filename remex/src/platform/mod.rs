// This module contains the `LocalHosts` platform.
pub mod local;

// Re-exports.
pub use local::LocalHosts;

use crate::config::Config;
use crate::worker::Worker;
use color_eyre::eyre::Report;
use futures::future::LocalBoxFuture;

/// An installable environment on one host, yielding its workers.
///
/// Bringing the environment up (container install over SSH, VM boot) is a
/// provisioning concern handled by the platform before the service's
/// workers exist.
#[derive(Debug)]
pub struct Service {
    workers: Vec<Worker>,
}

impl Service {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }
}

/// A provisioning collaborator: local hosts, a cloud fleet, anything that
/// can bring up services and tear them down again.
///
/// Provisioning itself (launching VMs, installing containers over SSH) is
/// outside this crate; implementations wrap those mechanisms and expose
/// ready workers.
pub trait Platform {
    /// Brings up this platform's services and connects their workers.
    fn prepare_services<'a>(
        &'a mut self,
        config: &'a Config,
    ) -> LocalBoxFuture<'a, Result<(), Report>>;

    fn services(&self) -> &[Service];

    /// Tears the platform down, terminating its workers.
    fn clean(&mut self) -> LocalBoxFuture<'_, Result<(), Report>>;
}
