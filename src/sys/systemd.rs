// src/sys/systemd.rs

use crate::error::{MoleError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Marker carried by every unit mole links into the service manager.
pub const OWNED_UNIT_MARKER: &str = "mole";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub description: String,
}

/// Each call is one request over a fresh connection: nothing is pooled and
/// nothing is retried. Manager-side failures come back verbatim.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn enable(&self, unit: &str) -> Result<()>;
    async fn disable(&self, unit: &str) -> Result<()>;
    async fn start(&self, unit: &str) -> Result<()>;
    async fn stop(&self, unit: &str) -> Result<()>;
    async fn reload(&self, unit: &str) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
    async fn daemon_reload(&self) -> Result<()>;
    /// Units whose name contains `filter`.
    async fn list_units(&self, filter: &str) -> Result<Vec<UnitStatus>>;
}

/// Talks to the per-user systemd instance through `systemctl --user`.
pub struct SystemctlManager {
    program: String,
}

impl SystemctlManager {
    pub fn new() -> Self {
        Self::with_program("systemctl")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn request(&self, verb: &'static str, args: &[&str], unit: &str) -> Result<String> {
        debug!(verb, unit, "service manager request");

        let output = Command::new(&self.program)
            .arg("--user")
            .args(args)
            .output()
            .await
            .map_err(|e| MoleError::Connection {
                message: format!("failed to spawn {}: {}", self.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            if stderr.contains("Failed to connect to bus") {
                return Err(MoleError::Connection { message: stderr });
            }
            return Err(MoleError::Service {
                verb,
                unit: unit.to_string(),
                message: stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn unit_request(&self, verb: &'static str, extra: &[&str], unit: &str) -> Result<()> {
        let mut args = vec![verb];
        args.extend_from_slice(extra);
        args.push(unit);
        self.request(verb, &args, unit).await?;
        info!(verb, unit, "service request accepted");
        Ok(())
    }
}

impl Default for SystemctlManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceManager for SystemctlManager {
    async fn enable(&self, unit: &str) -> Result<()> {
        self.unit_request("enable", &["--force"], unit).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.unit_request("disable", &[], unit).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.unit_request("start", &[], unit).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.unit_request("stop", &[], unit).await
    }

    async fn reload(&self, unit: &str) -> Result<()> {
        self.unit_request("reload", &[], unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.unit_request("restart", &[], unit).await
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.request("daemon-reload", &["daemon-reload"], "").await?;
        info!("service manager reloaded unit files");
        Ok(())
    }

    async fn list_units(&self, filter: &str) -> Result<Vec<UnitStatus>> {
        let stdout = self
            .request(
                "list-units",
                &["list-units", "--all", "--plain", "--no-legend", "--no-pager"],
                "",
            )
            .await?;
        Ok(parse_unit_listing(&stdout)
            .into_iter()
            .filter(|u| u.name.contains(filter))
            .collect())
    }
}

/// `UNIT LOAD ACTIVE SUB DESCRIPTION...` rows from `list-units --plain`.
fn parse_unit_listing(stdout: &str) -> Vec<UnitStatus> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?.to_string();
            let load_state = cols.next()?.to_string();
            let active_state = cols.next()?.to_string();
            let sub_state = cols.next()?.to_string();
            let description = cols.collect::<Vec<_>>().join(" ");
            Some(UnitStatus {
                name,
                load_state,
                active_state,
                sub_state,
                description,
            })
        })
        .collect()
}
