//! Self-resolution health monitor
//!
//! Periodically resolves `<hostname>.<suffix>` through the overlay's name
//! service. A run of consecutive failures reaching the threshold cancels the
//! session generation so the supervisor can rebuild it. A tripped monitor
//! never recovers; the next generation gets a new one.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;
use crate::overlay::OverlaySession;

/// Health check parameters
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between checks
    pub interval: Duration,
    /// Upper bound for a single lookup
    pub check_timeout: Duration,
    /// Consecutive failures that trip the monitor
    pub failure_threshold: u32,
    /// Log a liveness line every this many successful checks
    pub log_every: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            log_every: 10,
        }
    }
}

/// Where the monitor stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded(u32),
    Tripped,
}

/// Why the monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The failure threshold was reached and the generation was cancelled
    Tripped,
    /// The generation was cancelled by someone else
    Stopped,
}

/// Counters driving the monitor's state machine
#[derive(Debug, Clone)]
pub struct HealthState {
    threshold: u32,
    consecutive_failures: u32,
    successful_checks: u64,
}

impl HealthState {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            successful_checks: 0,
        }
    }

    pub fn status(&self) -> HealthStatus {
        match self.consecutive_failures {
            0 => HealthStatus::Healthy,
            n if n >= self.threshold => HealthStatus::Tripped,
            n => HealthStatus::Degraded(n),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn successful_checks(&self) -> u64 {
        self.successful_checks
    }

    /// Record a successful lookup. Returns true if this ended a degraded run.
    ///
    /// A tripped state is terminal and ignores further results.
    pub fn record_success(&mut self) -> bool {
        if self.status() == HealthStatus::Tripped {
            return false;
        }
        let recovered = self.consecutive_failures > 0;
        self.consecutive_failures = 0;
        self.successful_checks += 1;
        recovered
    }

    /// Record a failed lookup and return the new status
    pub fn record_failure(&mut self) -> HealthStatus {
        if self.status() != HealthStatus::Tripped {
            self.consecutive_failures += 1;
        }
        self.status()
    }
}

/// Periodic DNS self-check for one session generation
pub struct HealthMonitor {
    session: Arc<dyn OverlaySession>,
    fqdn: String,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        session: Arc<dyn OverlaySession>,
        hostname: &str,
        suffix: &str,
        config: HealthConfig,
    ) -> Self {
        Self {
            session,
            fqdn: format!("{}.{}", hostname, suffix.trim_matches('.')),
            config,
        }
    }

    /// Name being checked
    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// Tick until cancelled or tripped. On tripping, `cancel` is cancelled
    /// exactly once before returning.
    pub async fn run(self, cancel: CancellationToken) -> MonitorOutcome {
        info!(
            "Starting DNS health monitoring for {} (checking every {:?})",
            self.fqdn, self.config.interval
        );

        let mut state = HealthState::new(self.config.failure_threshold);
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return MonitorOutcome::Stopped,
                _ = ticker.tick() => {}
            }

            match self.check().await {
                Ok(addrs) => {
                    if state.record_success() {
                        info!("DNS check recovered: {} resolves to {}", self.fqdn, addrs);
                    }
                    if self.config.log_every > 0
                        && state.successful_checks() % self.config.log_every == 0
                    {
                        info!(
                            "DNS health check: {} resolves to {} ({} checks)",
                            self.fqdn,
                            addrs,
                            state.successful_checks()
                        );
                    }
                }
                Err(e) => {
                    let status = state.record_failure();
                    warn!(
                        "DNS check failed ({}/{}): {}",
                        state.consecutive_failures(),
                        self.config.failure_threshold,
                        e
                    );
                    if status == HealthStatus::Tripped {
                        warn!(
                            "DNS has failed {} consecutive times, triggering restart",
                            state.consecutive_failures()
                        );
                        cancel.cancel();
                        return MonitorOutcome::Tripped;
                    }
                }
            }
        }
    }

    /// One lookup under its own timeout, independent of the generation token
    async fn check(&self) -> Result<String, Error> {
        let lookup =
            tokio::time::timeout(self.config.check_timeout, self.session.resolve(&self.fqdn));

        let addrs = match lookup.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::HealthCheck {
                    hostname: self.fqdn.clone(),
                    reason: format!("timed out after {:?}", self.config.check_timeout),
                })
            }
        };

        if addrs.is_empty() {
            return Err(Error::HealthCheck {
                hostname: self.fqdn.clone(),
                reason: "no addresses".to_string(),
            });
        }

        Ok(addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;

    /// Resolver scripted with a queue of outcomes; succeeds once the queue is empty
    struct ScriptedResolver {
        script: Mutex<VecDeque<bool>>,
        observed: Mutex<Vec<bool>>,
        token: CancellationToken,
        hang: bool,
    }

    impl ScriptedResolver {
        fn new(script: &[bool], token: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                observed: Mutex::new(Vec::new()),
                token,
                hang: false,
            })
        }

        fn hanging(token: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                observed: Mutex::new(Vec::new()),
                token,
                hang: true,
            })
        }

        fn calls(&self) -> usize {
            self.observed.lock().len()
        }
    }

    #[async_trait]
    impl OverlaySession for ScriptedResolver {
        async fn listen(&self, _port: u16) -> io::Result<TcpListener> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no listeners"))
        }

        async fn whois(&self, _peer: SocketAddr) -> Option<String> {
            None
        }

        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            // Record whether the generation was already cancelled when asked.
            self.observed.lock().push(self.token.is_cancelled());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let ok = self.script.lock().pop_front().unwrap_or(true);
            if ok {
                Ok(vec![IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1))])
            } else {
                Err(Error::HealthCheck {
                    hostname: host.to_string(),
                    reason: "NXDOMAIN".to_string(),
                })
            }
        }

        async fn close(&self) {}
    }

    fn fast_config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(10),
            check_timeout: Duration::from_millis(50),
            failure_threshold: 3,
            log_every: 10,
        }
    }

    #[test]
    fn test_state_machine() {
        let mut state = HealthState::new(3);
        assert_eq!(state.status(), HealthStatus::Healthy);

        assert_eq!(state.record_failure(), HealthStatus::Degraded(1));
        assert_eq!(state.record_failure(), HealthStatus::Degraded(2));
        assert!(state.record_success());
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert_eq!(state.successful_checks(), 1);

        assert_eq!(state.record_failure(), HealthStatus::Degraded(1));
        assert_eq!(state.record_failure(), HealthStatus::Degraded(2));
        assert_eq!(state.record_failure(), HealthStatus::Tripped);

        // Tripped is terminal
        assert!(!state.record_success());
        assert_eq!(state.status(), HealthStatus::Tripped);
        assert_eq!(state.record_failure(), HealthStatus::Tripped);
    }

    #[test]
    fn test_success_without_failures_is_not_recovery() {
        let mut state = HealthState::new(3);
        assert!(!state.record_success());
        assert_eq!(state.successful_checks(), 1);
    }

    #[test]
    fn test_fqdn_joins_suffix() {
        let token = CancellationToken::new();
        let monitor = HealthMonitor::new(
            ScriptedResolver::new(&[], token),
            "devbox",
            ".example.ts.net.",
            fast_config(),
        );
        assert_eq!(monitor.fqdn(), "devbox.example.ts.net");
    }

    #[tokio::test]
    async fn test_trips_after_threshold() {
        let token = CancellationToken::new();
        let resolver = ScriptedResolver::new(&[false, false, false], token.clone());
        let monitor =
            HealthMonitor::new(resolver.clone(), "devbox", "example.ts.net", fast_config());

        let outcome = tokio::time::timeout(Duration::from_secs(5), monitor.run(token.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Tripped);
        assert!(token.is_cancelled());
        // Cancellation came after the third lookup, not before.
        assert_eq!(*resolver.observed.lock(), vec![false, false, false]);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let token = CancellationToken::new();
        let resolver =
            ScriptedResolver::new(&[false, false, true, false, false], token.clone());
        let monitor =
            HealthMonitor::new(resolver.clone(), "devbox", "example.ts.net", fast_config());

        let handle = tokio::spawn(monitor.run(token.clone()));

        while resolver.calls() < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!token.is_cancelled());

        token.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, MonitorOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let token = CancellationToken::new();
        let resolver = ScriptedResolver::hanging(token.clone());
        let monitor =
            HealthMonitor::new(resolver.clone(), "devbox", "example.ts.net", fast_config());

        let outcome = tokio::time::timeout(Duration::from_secs(5), monitor.run(token.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Tripped);
        assert_eq!(resolver.calls(), 3);
    }

    #[tokio::test]
    async fn test_stops_on_outer_cancel() {
        let token = CancellationToken::new();
        let resolver = ScriptedResolver::new(&[], token.clone());
        let config = HealthConfig {
            interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let monitor = HealthMonitor::new(resolver.clone(), "devbox", "example.ts.net", config);

        token.cancel();
        assert_eq!(monitor.run(token).await, MonitorOutcome::Stopped);
        assert_eq!(resolver.calls(), 0);
    }
}
