//! Trust-on-first-use access control
//!
//! Every listener owns one [`IdentityGate`]. In self-only mode the first
//! identity the gate sees becomes its owner for the rest of the session
//! generation; everyone else is refused. A restart builds new gates, so the
//! latch is re-armed.

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::overlay::OverlaySession;

/// Deployment-wide access policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Latch onto the first caller and refuse all others
    SelfOnly,
    /// Let everyone through, never latch
    Open,
}

impl AccessPolicy {
    pub fn from_self_only(allow_self_only: bool) -> Self {
        if allow_self_only {
            AccessPolicy::SelfOnly
        } else {
            AccessPolicy::Open
        }
    }
}

/// What to do when the overlay cannot name the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityFallback {
    /// Use the caller's IP address as its identity
    #[default]
    RemoteAddr,
    /// Refuse callers the overlay cannot identify
    Reject,
}

impl FromStr for IdentityFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remote-addr" | "remote_addr" | "addr" => Ok(IdentityFallback::RemoteAddr),
            "reject" | "deny" => Ok(IdentityFallback::Reject),
            other => Err(format!(
                "unknown identity fallback {:?} (expected remote-addr or reject)",
                other
            )),
        }
    }
}

impl fmt::Display for IdentityFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityFallback::RemoteAddr => f.write_str("remote-addr"),
            IdentityFallback::Reject => f.write_str("reject"),
        }
    }
}

/// Outcome of evaluating a caller against a gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The caller matches the latched identity, or the gate is open
    Allowed,
    /// The caller was the first one and now owns the gate
    Latched,
    /// The gate belongs to someone else
    Denied { expected: String },
}

/// Per-listener identity latch
#[derive(Debug)]
pub struct IdentityGate {
    policy: AccessPolicy,
    locked: Mutex<Option<String>>,
}

impl IdentityGate {
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            policy,
            locked: Mutex::new(None),
        }
    }

    /// Evaluate a caller. The compare-and-latch happens under one lock, so
    /// concurrent first callers agree on a single owner.
    pub fn evaluate(&self, candidate: &str) -> Decision {
        if self.policy == AccessPolicy::Open {
            return Decision::Allowed;
        }

        let mut locked = self.locked.lock();
        match locked.as_deref() {
            None => {
                *locked = Some(candidate.to_string());
                Decision::Latched
            }
            Some(owner) if owner == candidate => Decision::Allowed,
            Some(owner) => Decision::Denied {
                expected: owner.to_string(),
            },
        }
    }

    /// The identity this gate has latched onto, if any
    pub fn locked_identity(&self) -> Option<String> {
        self.locked.lock().clone()
    }
}

/// Work out who is calling.
///
/// Returns the overlay login name when the provider knows the peer. Otherwise
/// the fallback decides: the peer IP (without its ephemeral source port) or
/// `None`, meaning the caller must be refused.
pub async fn resolve_identity(
    session: &dyn OverlaySession,
    peer: SocketAddr,
    fallback: IdentityFallback,
) -> Option<String> {
    match session.whois(peer).await {
        Some(login) if !login.is_empty() => Some(login),
        _ => match fallback {
            IdentityFallback::RemoteAddr => Some(peer.ip().to_string()),
            IdentityFallback::Reject => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_first_caller_latches() {
        let gate = IdentityGate::new(AccessPolicy::SelfOnly);
        assert_eq!(gate.locked_identity(), None);

        assert_eq!(gate.evaluate("alice"), Decision::Latched);
        assert_eq!(gate.locked_identity().as_deref(), Some("alice"));
        assert_eq!(gate.evaluate("alice"), Decision::Allowed);
        assert_eq!(
            gate.evaluate("bob"),
            Decision::Denied {
                expected: "alice".to_string()
            }
        );
        assert_eq!(gate.locked_identity().as_deref(), Some("alice"));
    }

    #[test]
    fn test_open_gate_never_latches() {
        let gate = IdentityGate::new(AccessPolicy::Open);
        for who in ["alice", "bob", "100.64.0.7"] {
            assert_eq!(gate.evaluate(who), Decision::Allowed);
        }
        assert_eq!(gate.locked_identity(), None);
    }

    #[test]
    fn test_concurrent_first_callers_agree() {
        for _ in 0..50 {
            let gate = Arc::new(IdentityGate::new(AccessPolicy::SelfOnly));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let gate = gate.clone();
                    std::thread::spawn(move || {
                        let me = format!("user{}", i);
                        (me.clone(), gate.evaluate(&me))
                    })
                })
                .collect();

            let results: Vec<(String, Decision)> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners: Vec<&String> = results
                .iter()
                .filter(|(_, d)| *d == Decision::Latched)
                .map(|(who, _)| who)
                .collect();
            assert_eq!(winners.len(), 1);

            let owner = gate.locked_identity().unwrap();
            assert_eq!(&owner, winners[0]);

            let expected: HashSet<&String> = results
                .iter()
                .filter_map(|(_, d)| match d {
                    Decision::Denied { expected } => Some(expected),
                    _ => None,
                })
                .collect();
            assert!(expected.iter().all(|e| **e == owner));
        }
    }

    #[test]
    fn test_fallback_from_str() {
        assert_eq!(
            "remote-addr".parse::<IdentityFallback>().unwrap(),
            IdentityFallback::RemoteAddr
        );
        assert_eq!(
            "Reject".parse::<IdentityFallback>().unwrap(),
            IdentityFallback::Reject
        );
        assert!("maybe".parse::<IdentityFallback>().is_err());
    }

    #[test]
    fn test_policy_from_flag() {
        assert_eq!(AccessPolicy::from_self_only(true), AccessPolicy::SelfOnly);
        assert_eq!(AccessPolicy::from_self_only(false), AccessPolicy::Open);
    }
}
