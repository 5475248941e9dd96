// src/ports.rs

//! First-fit TCP port reservation.
//!
//! Reservations only ever grow. Once a port has been written to the
//! reservation document it is never handed out again, even after the owning
//! project is deleted.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::sys::atomic::write_atomic;
use crate::sys::traits::PortProbe;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReservedPorts {
    ports: Vec<u16>,
}

pub struct PortAllocator<'a> {
    document: PathBuf,
    base: u16,
    probe: &'a dyn PortProbe,
}

impl<'a> PortAllocator<'a> {
    pub fn new(config: &MoleConfig, probe: &'a dyn PortProbe) -> Self {
        Self {
            document: config.reserved_ports_path(),
            base: config.port_base,
            probe,
        }
    }

    /// Three ports that are neither live on the host nor previously reserved,
    /// persisted before they are returned.
    pub async fn reserve_three(&self) -> Result<[u16; 3]> {
        let live = self.probe.bound_ports().await?;
        let mut reserved = self.reserved().await?;

        let mut found = Vec::with_capacity(3);
        let mut next = Some(self.base);
        while found.len() < 3 {
            let candidate = next.ok_or(MoleError::PortsExhausted { base: self.base })?;
            if !live.contains(&candidate) && !reserved.contains(&candidate) {
                reserved.insert(candidate);
                found.push(candidate);
            }
            next = candidate.checked_add(1);
        }

        self.persist(&reserved).await?;

        let ports = [found[0], found[1], found[2]];
        info!(?ports, "reserved ports");
        Ok(ports)
    }

    /// The persisted reservation set.
    pub async fn reserved(&self) -> Result<BTreeSet<u16>> {
        let raw = match fs::read(&self.document).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(MoleError::io(&self.document, e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeSet::new());
        }

        let doc: ReservedPorts =
            serde_json::from_slice(&raw).map_err(|source| MoleError::Corrupt {
                path: self.document.clone(),
                source,
            })?;
        Ok(doc.ports.into_iter().collect())
    }

    /// Ports currently in use on the host, ascending.
    pub async fn report(&self) -> Result<Vec<u16>> {
        Ok(self.probe.bound_ports().await?.into_iter().collect())
    }

    async fn persist(&self, reserved: &BTreeSet<u16>) -> Result<()> {
        // BTreeSet iterates ascending, which keeps the document sorted
        let doc = ReservedPorts {
            ports: reserved.iter().copied().collect(),
        };
        let body = serde_json::to_vec(&doc).map_err(|source| MoleError::Corrupt {
            path: self.document.clone(),
            source,
        })?;
        write_atomic(&self.document, body).await
    }
}
