//! Session supervisor
//!
//! Owns exactly one overlay session generation at a time. Each generation
//! runs the status listener, one proxy listener per configured port and,
//! when a DNS suffix is configured, the health monitor, all under one
//! cancellation token. When the monitor trips, the generation is torn down
//! and rebuilt from scratch after a cooldown. Any other ending stops the
//! supervisor.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::gate::AccessPolicy;
use crate::health::{HealthMonitor, MonitorOutcome};
use crate::overlay::{Overlay, OverlaySession};
use crate::procinfo::{system_table, ProcessTable};
use crate::proxy::ProxyListener;
use crate::status::{NodeName, StatusListener};

/// How a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEnd {
    /// The health monitor cancelled the generation
    HealthTripped,
    /// The process-wide shutdown token fired
    Shutdown,
    /// Every task exited on its own
    Exited,
}

enum TaskExit {
    Listener(u16, Result<()>),
    Monitor(MonitorOutcome),
}

pub struct Supervisor {
    config: Arc<ProxyConfig>,
    overlay: Arc<dyn Overlay>,
    table: Arc<dyn ProcessTable>,
}

impl Supervisor {
    pub fn new(config: ProxyConfig, overlay: Arc<dyn Overlay>) -> Self {
        Self {
            config: Arc::new(config),
            overlay,
            table: system_table(),
        }
    }

    /// Use a specific process table for the status page
    pub fn with_process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.table = table;
        self
    }

    /// Run generations until one ends for a reason other than a health trip.
    ///
    /// Configuration is validated once up front. A session that cannot be
    /// established is returned as an error and not retried.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let mut generation: u64 = 0;
        loop {
            generation += 1;

            match self.run_generation(generation, &shutdown).await? {
                GenerationEnd::HealthTripped if !shutdown.is_cancelled() => {
                    info!(
                        "Restarting session due to DNS failure (generation {}, retrying in {:?})",
                        generation, self.config.restart_delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Shutdown requested during restart delay");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(self.config.restart_delay) => {}
                    }
                }
                end => {
                    info!("Shutting down normally ({:?})", end);
                    return Ok(());
                }
            }
        }
    }

    /// Build, run and tear down one generation
    pub async fn run_generation(
        &self,
        generation: u64,
        shutdown: &CancellationToken,
    ) -> Result<GenerationEnd> {
        let config = &self.config;

        let session = self
            .overlay
            .connect(&config.hostname, &config.auth_key)
            .await?;
        info!(
            "Session generation {} up as {} ({} port(s))",
            generation,
            config.hostname,
            config.ports.len()
        );
        if config.listener.policy == AccessPolicy::SelfOnly {
            info!("Self-only mode enabled - will determine identity from first request");
        }

        let cancel = shutdown.child_token();
        let mut tasks = self.spawn_tasks(session.clone(), &cancel);

        let mut tripped = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskExit::Monitor(outcome)) => {
                    tripped |= outcome == MonitorOutcome::Tripped;
                }
                Ok(TaskExit::Listener(port, Err(e))) => {
                    error!("Error serving port {}: {}", port, e);
                }
                Ok(TaskExit::Listener(_, Ok(()))) => {}
                Err(e) => {
                    warn!("Generation {} task failed: {}", generation, e);
                }
            }
        }

        session.close().await;
        cancel.cancel();
        info!("Session generation {} torn down", generation);

        Ok(if tripped {
            GenerationEnd::HealthTripped
        } else if shutdown.is_cancelled() {
            GenerationEnd::Shutdown
        } else {
            GenerationEnd::Exited
        })
    }

    fn spawn_tasks(
        &self,
        session: Arc<dyn OverlaySession>,
        cancel: &CancellationToken,
    ) -> JoinSet<TaskExit> {
        let config = &self.config;
        let mut tasks = JoinSet::new();

        let node = NodeName {
            hostname: config.hostname.clone(),
            dns_suffix: config.dns_suffix.clone(),
        };
        let status = StatusListener::new(
            config.status_port,
            node,
            session.clone(),
            self.table.clone(),
            &config.listener,
        );
        let status_port = config.status_port;
        let token = cancel.clone();
        tasks.spawn(async move { TaskExit::Listener(status_port, status.serve(token).await) });

        for port in config.ports.iter() {
            let listener = ProxyListener::new(port, session.clone(), &config.listener);
            let token = cancel.clone();
            tasks.spawn(async move { TaskExit::Listener(port, listener.serve(token).await) });
        }

        if config.health_enabled() {
            let suffix = config.dns_suffix.as_deref().unwrap_or_default();
            let monitor =
                HealthMonitor::new(session, &config.hostname, suffix, config.health.clone());
            let token = cancel.clone();
            tasks.spawn(async move { TaskExit::Monitor(monitor.run(token).await) });
        }

        tasks
    }
}
