//! Portgate - a self-healing, identity-gated multi-port reverse proxy
//!
//! Exposes a set of local HTTP ports on a private overlay network:
//! - One listener per port, forwarding to `localhost:<port>`
//! - Trust-on-first-use access control per listener
//! - A status page listing the host's listening ports
//! - DNS self-checks that rebuild the whole overlay session when the node's
//!   own name stops resolving

pub mod config;
pub mod error;
pub mod gate;
pub mod health;
pub mod listener;
pub mod overlay;
pub mod ports;
pub mod procinfo;
pub mod proxy;
pub mod status;
pub mod supervisor;

pub use config::{Args, ProxyConfig};
pub use error::{Error, Result};
pub use gate::{AccessPolicy, Decision, IdentityFallback, IdentityGate};
pub use health::{HealthConfig, HealthMonitor, MonitorOutcome};
pub use listener::ListenerOptions;
pub use overlay::{InterfaceOverlay, Overlay, OverlaySession};
pub use ports::{PortSpec, PortSpecError};
pub use proxy::ProxyListener;
pub use status::StatusListener;
pub use supervisor::{GenerationEnd, Supervisor};
