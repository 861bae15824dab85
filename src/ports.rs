//! Port specification parsing
//!
//! A specification is a comma-separated list of single ports and inclusive
//! ranges, e.g. `8000,8010-8015,8020`. Whitespace around tokens and around the
//! range dash is ignored. Duplicates are dropped; the first occurrence keeps
//! its position.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a port specification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortSpecError {
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("invalid port range format: {0:?}")]
    InvalidRange(String),

    #[error("invalid start port in range {0:?}")]
    InvalidRangeStart(String),

    #[error("invalid end port in range {0:?}")]
    InvalidRangeEnd(String),

    #[error("range {0:?} starts after it ends")]
    ReversedRange(String),

    #[error("port 0 cannot be proxied")]
    ZeroPort,
}

/// Ordered, duplicate-free list of local ports to expose
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    ports: Vec<u16>,
}

impl PortSpec {
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().copied()
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.ports
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, port) in self.ports.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for PortSpec {
    type Err = PortSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a textual port specification
pub fn parse(spec: &str) -> Result<PortSpec, PortSpecError> {
    let mut ports = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |port: u16| {
        if seen.insert(port) {
            ports.push(port);
        }
    };

    for token in spec.split(',') {
        let token = token.trim();

        if token.contains('-') {
            let bounds: Vec<&str> = token.split('-').collect();
            if bounds.len() != 2 {
                return Err(PortSpecError::InvalidRange(token.to_string()));
            }

            let start = parse_port(bounds[0])
                .map_err(|_| PortSpecError::InvalidRangeStart(token.to_string()))?;
            let end = parse_port(bounds[1])
                .map_err(|_| PortSpecError::InvalidRangeEnd(token.to_string()))?;

            if start > end {
                return Err(PortSpecError::ReversedRange(token.to_string()));
            }
            if start == 0 {
                return Err(PortSpecError::ZeroPort);
            }

            for port in start..=end {
                push(port);
            }
        } else {
            let port = parse_port(token)?;
            if port == 0 {
                return Err(PortSpecError::ZeroPort);
            }
            push(port);
        }
    }

    Ok(PortSpec { ports })
}

fn parse_port(s: &str) -> Result<u16, PortSpecError> {
    let s = s.trim();
    s.parse::<u16>()
        .map_err(|_| PortSpecError::InvalidPort(s.to_string()))
}
