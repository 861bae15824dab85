//! Listening-port introspection for the status page
//!
//! On Linux the kernel's socket tables in `/proc/net/tcp` and `/proc/net/tcp6`
//! list every listening socket with its inode. The owning process is found by
//! scanning `/proc/<pid>/fd/*` for a `socket:[<inode>]` link. All of this is
//! best effort: unreadable entries are skipped, unknown owners left blank.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// TCP state code for LISTEN in the proc socket tables
const TCP_LISTEN: &str = "0A";

#[derive(Debug, Error)]
pub enum ProcInfoError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One row of the status table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningPort {
    pub port: u16,
    pub process: String,
    pub pid: String,
    pub command: String,
}

/// Source of listening-port information
pub trait ProcessTable: Send + Sync {
    fn listening_ports(&self) -> Result<Vec<ListeningPort>, ProcInfoError>;
}

/// Linux `/proc` scanner
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: String,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Scanner rooted somewhere other than `/proc`
    pub fn with_root(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    fn owner_of(&self, inode: u64) -> (String, String, String) {
        let needle = format!("socket:[{}]", inode);

        let Ok(entries) = fs::read_dir(&self.root) else {
            return ("unknown".to_string(), String::new(), String::new());
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit())) else {
                continue;
            };

            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .map(|target| target.as_os_str() == needle.as_str())
                    .unwrap_or(false)
            });
            if !owns {
                continue;
            }

            let process = match fs::read_to_string(entry.path().join("comm")) {
                Ok(comm) => comm.trim().to_string(),
                Err(_) => return ("unknown".to_string(), pid.to_string(), String::new()),
            };
            let command = fs::read(entry.path().join("cmdline"))
                .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " ").trim().to_string())
                .unwrap_or_default();

            return (process, pid.to_string(), command);
        }

        ("unknown".to_string(), String::new(), String::new())
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn listening_ports(&self) -> Result<Vec<ListeningPort>, ProcInfoError> {
        let mut seen = HashSet::new();
        let mut ports = Vec::new();

        for table in ["net/tcp", "net/tcp6"] {
            let path = format!("{}/{}", self.root, table);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if table == "net/tcp" => {
                    return Err(ProcInfoError::Read { path, source: e });
                }
                Err(e) => {
                    trace!("Skipping {}: {}", path, e);
                    continue;
                }
            };

            for (port, inode) in parse_listen_sockets(&content) {
                if seen.insert(port) {
                    let (process, pid, command) = self.owner_of(inode);
                    ports.push(ListeningPort {
                        port,
                        process,
                        pid,
                        command,
                    });
                }
            }
        }

        ports.sort_by_key(|p| p.port);
        Ok(ports)
    }
}

/// Stand-in for platforms without `/proc`
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl ProcessTable for Unsupported {
    fn listening_ports(&self) -> Result<Vec<ListeningPort>, ProcInfoError> {
        Ok(Vec::new())
    }
}

/// Pick the best table for this host
pub fn system_table() -> Arc<dyn ProcessTable> {
    if cfg!(target_os = "linux") && Path::new("/proc/net/tcp").exists() {
        Arc::new(ProcFs::new())
    } else {
        Arc::new(Unsupported)
    }
}

/// Extract `(port, inode)` pairs for sockets in LISTEN state.
///
/// Rows look like
/// `0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000 1000 0 12345 ...`;
/// malformed rows are skipped.
fn parse_listen_sockets(content: &str) -> Vec<(u16, u64)> {
    let mut sockets = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != TCP_LISTEN {
            continue;
        }

        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };

        sockets.push((port, inode));
    }

    sockets
}
