//! Command-line configuration
//!
//! Flags map onto a [`ProxyConfig`], the static configuration that survives
//! session restarts. Everything else is rebuilt per generation.

use clap::{ArgAction, Parser};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gate::{AccessPolicy, IdentityFallback};
use crate::health::HealthConfig;
use crate::listener::ListenerOptions;
use crate::overlay::InterfaceOverlay;
use crate::ports::{self, PortSpec};
use crate::status::DEFAULT_STATUS_PORT;

/// Static configuration for the supervisor
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub hostname: String,
    pub auth_key: String,
    pub ports: PortSpec,
    pub listener: ListenerOptions,
    pub status_port: u16,
    /// Enables health monitoring when set and non-empty
    pub dns_suffix: Option<String>,
    pub health: HealthConfig,
    /// Cooldown between a health-triggered teardown and the next session
    pub restart_delay: Duration,
}

impl ProxyConfig {
    pub fn new(hostname: impl Into<String>, auth_key: impl Into<String>, ports: PortSpec) -> Self {
        Self {
            hostname: hostname.into(),
            auth_key: auth_key.into(),
            ports,
            listener: ListenerOptions::default(),
            status_port: DEFAULT_STATUS_PORT,
            dns_suffix: None,
            health: HealthConfig::default(),
            restart_delay: Duration::from_secs(5),
        }
    }

    /// Check the preconditions the supervisor relies on
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Config("node name is required".to_string()));
        }
        if self.auth_key.trim().is_empty() {
            return Err(Error::Config("auth key is required (TS_AUTHKEY)".to_string()));
        }
        if self.ports.is_empty() {
            return Err(Error::Config("at least one port is required".to_string()));
        }
        if self.health.failure_threshold == 0 {
            return Err(Error::Config("failure threshold must be at least 1".to_string()));
        }
        if self.health.interval.is_zero() {
            return Err(Error::Config("check interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn health_enabled(&self) -> bool {
        self.dns_suffix.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Portgate - expose local HTTP ports on an overlay network, owner only
#[derive(Parser, Debug)]
#[command(name = "portgate")]
#[command(author = "Portgate Contributors")]
#[command(version)]
#[command(about = "Expose local HTTP ports on an overlay network, owner only")]
#[command(after_help = "Usage: TS_AUTHKEY=<key> portgate --name <name> --ports <ports>")]
pub struct Args {
    /// Overlay node name
    #[arg(long)]
    pub name: String,

    /// Ports, ranges, or both (e.g. '8000,8001', '8000-8005', '8000,8010-8015')
    #[arg(long)]
    pub ports: String,

    /// Only allow requests from the first identity that connects to each port
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub allow_self_only: bool,

    /// MagicDNS suffix used for health checking (e.g. 'example.ts.net')
    #[arg(long, default_value = "")]
    pub magic_dns_suffix: String,

    /// Interval between DNS health checks
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub check_interval: Duration,

    /// Upper bound for a single DNS health check
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub check_timeout: Duration,

    /// Consecutive failed checks that trigger a session restart
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub failure_threshold: u32,

    /// Cooldown before rebuilding a session after a health-triggered restart
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub restart_delay: Duration,

    /// Time in-flight requests get to finish when a session shuts down
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub grace_period: Duration,

    /// Port serving the status page
    #[arg(long, default_value_t = DEFAULT_STATUS_PORT)]
    pub status_port: u16,

    /// Identity for callers the overlay cannot name: remote-addr or reject
    #[arg(long, default_value = "remote-addr")]
    pub identity_fallback: IdentityFallback,

    /// Address of the overlay interface to bind listeners on
    #[arg(long, env = "PORTGATE_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Overlay DNS server used for health checks
    #[arg(long, env = "PORTGATE_DNS_SERVER", default_value = "100.100.100.100:53")]
    pub dns_server: SocketAddr,

    /// Known peer, as IP=login (repeatable)
    #[arg(long = "identity", value_parser = parse_identity_entry)]
    pub identities: Vec<(IpAddr, String)>,

    /// Overlay auth key
    #[arg(long, env = "TS_AUTHKEY", hide_env_values = true, hide = true)]
    pub auth_key: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Turn flags into the supervisor's configuration
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let ports = ports::parse(&self.ports)?;

        let mut config = ProxyConfig::new(self.name.clone(), self.auth_key.clone(), ports);
        config.listener = ListenerOptions {
            policy: AccessPolicy::from_self_only(self.allow_self_only),
            fallback: self.identity_fallback,
            grace_period: self.grace_period,
        };
        config.status_port = self.status_port;
        config.dns_suffix =
            Some(self.magic_dns_suffix.trim().to_string()).filter(|s| !s.is_empty());
        config.health = HealthConfig {
            interval: self.check_interval,
            check_timeout: self.check_timeout,
            failure_threshold: self.failure_threshold,
            ..HealthConfig::default()
        };
        config.restart_delay = self.restart_delay;

        config.validate()?;
        Ok(config)
    }

    /// Overlay provider described by the flags
    pub fn overlay(&self) -> InterfaceOverlay {
        let directory: HashMap<IpAddr, String> = self.identities.iter().cloned().collect();
        InterfaceOverlay::new(self.bind_addr, self.dns_server).with_directory(directory)
    }
}

/// Parse a duration such as `30s`, `500ms`, `5m` or `1h`. A bare number is seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {:?} in {:?}", other, s)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {:?}: {}", s, e))
}

fn parse_identity_entry(s: &str) -> std::result::Result<(IpAddr, String), String> {
    let (ip, login) = s
        .split_once('=')
        .ok_or_else(|| format!("expected IP=login, got {:?}", s))?;
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|e| format!("invalid IP in {:?}: {}", s, e))?;
    let login = login.trim();
    if login.is_empty() {
        return Err(format!("empty login in {:?}", s));
    }
    Ok((ip, login.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "portgate",
            "--name",
            "devbox",
            "--ports",
            "8000,8010-8012",
            "--auth-key",
            "tskey-test",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_parse_identity_entry() {
        assert_eq!(
            parse_identity_entry("100.64.0.7=alice@example.com").unwrap(),
            ("100.64.0.7".parse().unwrap(), "alice@example.com".to_string())
        );
        assert!(parse_identity_entry("100.64.0.7").is_err());
        assert!(parse_identity_entry("nope=alice").is_err());
        assert!(parse_identity_entry("100.64.0.7=").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = args(&[]).to_config().unwrap();
        assert_eq!(config.hostname, "devbox");
        assert_eq!(config.ports.as_slice(), &[8000, 8010, 8011, 8012]);
        assert_eq!(config.listener.policy, AccessPolicy::SelfOnly);
        assert_eq!(config.listener.fallback, IdentityFallback::RemoteAddr);
        assert_eq!(config.status_port, 80);
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert_eq!(config.health.check_timeout, Duration::from_secs(10));
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.restart_delay, Duration::from_secs(5));
        assert!(!config.health_enabled());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = args(&[
            "--allow-self-only=false",
            "--magic-dns-suffix",
            "example.ts.net",
            "--check-interval",
            "1m",
            "--identity-fallback",
            "reject",
        ])
        .to_config()
        .unwrap();

        assert_eq!(config.listener.policy, AccessPolicy::Open);
        assert_eq!(config.listener.fallback, IdentityFallback::Reject);
        assert_eq!(config.dns_suffix.as_deref(), Some("example.ts.net"));
        assert_eq!(config.health.interval, Duration::from_secs(60));
        assert!(config.health_enabled());
    }

    #[test]
    fn test_bare_self_only_flag_means_true() {
        let config = args(&["--allow-self-only", "--status-port", "8080"])
            .to_config()
            .unwrap();
        assert_eq!(config.listener.policy, AccessPolicy::SelfOnly);
        assert_eq!(config.status_port, 8080);

        let config = args(&["--allow-self-only", "false"]).to_config().unwrap();
        assert_eq!(config.listener.policy, AccessPolicy::Open);
    }

    #[test]
    fn test_missing_required_flags() {
        assert!(Args::try_parse_from(["portgate", "--ports", "8000", "--auth-key", "k"]).is_err());
        assert!(Args::try_parse_from(["portgate", "--name", "devbox", "--auth-key", "k"]).is_err());
    }

    #[test]
    fn test_bad_port_spec_is_parse_error() {
        let mut args = args(&[]);
        args.ports = "8000-xyz".to_string();
        assert!(matches!(args.to_config(), Err(Error::PortSpec(_))));
    }

    #[test]
    fn test_validate_rejects_blank_auth_key() {
        let config = ProxyConfig::new("devbox", " ", ports::parse("8000").unwrap());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_overlay_directory_from_identities() {
        let args = args(&["--identity", "100.64.0.7=alice@example.com"]);
        assert_eq!(args.identities.len(), 1);
        let _overlay = args.overlay();
    }
}
