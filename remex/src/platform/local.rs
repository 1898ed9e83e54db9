use super::{Platform, Service};
use crate::config::Config;
use crate::worker::Worker;
use crate::info;
use color_eyre::eyre::Report;
use futures::future::{FutureExt, LocalBoxFuture};
use std::net::SocketAddr;

/// Platform over hosts that already run an agent: one service per address.
#[derive(Debug)]
pub struct LocalHosts {
    addrs: Vec<SocketAddr>,
    parallel_task_limit: Option<usize>,
    services: Vec<Service>,
}

impl LocalHosts {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            parallel_task_limit: None,
            services: Vec::new(),
        }
    }

    /// Caps each worker instead of using the agent host's CPU count.
    pub fn with_task_limit(mut self, limit: usize) -> Self {
        self.parallel_task_limit = Some(limit);
        self
    }
}

impl Platform for LocalHosts {
    fn prepare_services<'a>(
        &'a mut self,
        config: &'a Config,
    ) -> LocalBoxFuture<'a, Result<(), Report>> {
        async move {
            for addr in self.addrs.clone() {
                let worker =
                    Worker::connect(addr, self.parallel_task_limit, *config)
                        .await?;
                info!(
                    "[platform] worker at {} ready with capacity {}",
                    addr,
                    worker.capacity()
                );
                self.services.push(Service::new(vec![worker]));
            }
            Ok(())
        }
        .boxed_local()
    }

    fn services(&self) -> &[Service] {
        &self.services
    }

    fn clean(&mut self) -> LocalBoxFuture<'_, Result<(), Report>> {
        async move {
            for service in &self.services {
                for worker in service.workers() {
                    worker.clean();
                }
            }
            self.services.clear();
            Ok(())
        }
        .boxed_local()
    }
}
