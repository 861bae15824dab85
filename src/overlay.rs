//! Overlay network provider
//!
//! The proxy never talks to the mesh network directly. It asks an [`Overlay`]
//! for a session and then uses four primitives on that session: listen inside
//! the overlay, ask who a peer is, resolve a name through the overlay's DNS,
//! and close. None of these retry; retries belong to the supervisor.
//!
//! [`InterfaceOverlay`] is the provider shipped with the binary. It assumes the
//! host has already joined the overlay (the mesh daemon owns the interface)
//! and binds listeners on that interface's address.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Error, Result};

/// Source of overlay sessions
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Join the overlay as `hostname`
    async fn connect(&self, hostname: &str, auth_key: &str) -> Result<Arc<dyn OverlaySession>>;
}

/// One authenticated overlay session
#[async_trait]
pub trait OverlaySession: Send + Sync {
    /// Bind a TCP listener on `port` inside the overlay
    async fn listen(&self, port: u16) -> io::Result<TcpListener>;

    /// Login name of the peer at `peer`, if the overlay knows it
    async fn whois(&self, peer: SocketAddr) -> Option<String>;

    /// Resolve `host` through the overlay's name service
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// Tear the session down
    async fn close(&self);
}

/// Provider bound to a local overlay interface
#[derive(Debug, Clone)]
pub struct InterfaceOverlay {
    bind_addr: IpAddr,
    dns_server: SocketAddr,
    directory: HashMap<IpAddr, String>,
}

impl InterfaceOverlay {
    pub fn new(bind_addr: IpAddr, dns_server: SocketAddr) -> Self {
        Self {
            bind_addr,
            dns_server,
            directory: HashMap::new(),
        }
    }

    /// Static peer directory used to answer `whois`
    pub fn with_directory(mut self, directory: HashMap<IpAddr, String>) -> Self {
        self.directory = directory;
        self
    }
}

#[async_trait]
impl Overlay for InterfaceOverlay {
    async fn connect(&self, hostname: &str, auth_key: &str) -> Result<Arc<dyn OverlaySession>> {
        if hostname.is_empty() {
            return Err(Error::NetworkSession {
                hostname: hostname.to_string(),
                reason: "empty node name".to_string(),
            });
        }
        if auth_key.trim().is_empty() {
            return Err(Error::NetworkSession {
                hostname: hostname.to_string(),
                reason: "empty auth key".to_string(),
            });
        }

        let servers = NameServerConfigGroup::from_ips_clear(
            &[self.dns_server.ip()],
            self.dns_server.port(),
            true,
        );
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 1;
        // Every health check must reach the server.
        opts.cache_size = 0;
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], servers), opts);

        debug!(
            "Overlay session for {} on {} (dns {})",
            hostname, self.bind_addr, self.dns_server
        );

        Ok(Arc::new(InterfaceSession {
            bind_addr: self.bind_addr,
            directory: self.directory.clone(),
            resolver,
            closed: AtomicBool::new(false),
        }))
    }
}

struct InterfaceSession {
    bind_addr: IpAddr,
    directory: HashMap<IpAddr, String>,
    resolver: TokioAsyncResolver,
    closed: AtomicBool,
}

#[async_trait]
impl OverlaySession for InterfaceSession {
    async fn listen(&self, port: u16) -> io::Result<TcpListener> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "overlay session is closed",
            ));
        }
        let listener = TcpListener::bind(SocketAddr::new(self.bind_addr, port)).await?;
        debug!("Overlay listener bound on {}", listener.local_addr()?);
        Ok(listener)
    }

    async fn whois(&self, peer: SocketAddr) -> Option<String> {
        let found = self.directory.get(&peer.ip()).cloned();
        debug!("whois {} -> {:?}", peer, found);
        found
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::HealthCheck {
                hostname: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup.iter().collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!("Overlay session on {} closed", self.bind_addr);
    }
}
