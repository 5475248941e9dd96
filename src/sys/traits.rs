// src/sys/traits.rs

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::error::Result;

// ==============================================================================
// 1. Source Control
// ==============================================================================

#[async_trait]
pub trait GitManager: Send + Sync {
    /// Shallow clone of `branch` into `target_dir`.
    async fn clone_repo(&self, repo_url: &str, branch: &str, target_dir: &Path) -> Result<()>;

    /// Shallow fast-forward pull of `branch` inside an existing checkout.
    async fn pull(&self, branch: &str, working_dir: &Path) -> Result<()>;
}

// ==============================================================================
// 2. Script Execution (combined output capture)
// ==============================================================================

/// Output of a finished subprocess: stdout and stderr interleaved in arrival
/// order, byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRun {
    pub code: Option<i32>,
    pub output: Vec<u8>,
}

impl CapturedRun {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runs `script` with `working_dir` as cwd. Blocks until the script exits;
    /// there is no timeout. A non-zero exit is reported in `CapturedRun`, not
    /// as an error.
    async fn run_script(
        &self,
        script: &Path,
        working_dir: &Path,
        env_vars: &HashMap<String, String>,
    ) -> Result<CapturedRun>;
}

// ==============================================================================
// 3. Container Orchestration
// ==============================================================================

#[async_trait]
pub trait ComposeManager: Send + Sync {
    /// Stops everything described by `descriptor` (resolved inside `working_dir`).
    async fn down(&self, descriptor: &Path, working_dir: &Path) -> Result<CapturedRun>;
}

// ==============================================================================
// 4. Host Network Inspection
// ==============================================================================

#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Local ports of every TCP socket on the host, queried fresh on each call.
    async fn bound_ports(&self) -> Result<BTreeSet<u16>>;
}
