// src/sys/net.rs

use crate::error::{MoleError, Result};
use crate::sys::traits::PortProbe;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Reads the kernel socket tables. Every socket counts, whatever its state,
/// since any bound local port is off limits.
pub struct ProcNetProbe {
    tables: Vec<PathBuf>,
}

impl ProcNetProbe {
    pub fn new() -> Self {
        Self::with_tables(vec![
            PathBuf::from("/proc/net/tcp"),
            PathBuf::from("/proc/net/tcp6"),
        ])
    }

    pub fn with_tables(tables: Vec<PathBuf>) -> Self {
        Self { tables }
    }
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortProbe for ProcNetProbe {
    async fn bound_ports(&self) -> Result<BTreeSet<u16>> {
        let mut ports = BTreeSet::new();
        let mut readable = 0;

        for table in &self.tables {
            match fs::read_to_string(table).await {
                Ok(contents) => {
                    readable += 1;
                    ports.extend(parse_socket_table(&contents));
                }
                // IPv6 may be disabled on the host
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(MoleError::io(table, e)),
            }
        }

        if readable == 0 {
            let first = self.tables.first().cloned().unwrap_or_default();
            return Err(MoleError::io(
                first,
                std::io::Error::new(ErrorKind::NotFound, "no TCP socket table available"),
            ));
        }

        debug!(count = ports.len(), "live TCP ports");
        Ok(ports)
    }
}

/// `sl local_address rem_address st ...`, local_address is `HEXIP:HEXPORT`.
fn parse_socket_table(contents: &str) -> impl Iterator<Item = u16> + '_ {
    contents.lines().skip(1).filter_map(|line| {
        let local = line.split_whitespace().nth(1)?;
        let (_, port) = local.rsplit_once(':')?;
        u16::from_str_radix(port, 16).ok()
    })
}
