// src/sys/compose.rs

use crate::error::Result;
use crate::sys::build::capture_combined;
use crate::sys::traits::{CapturedRun, ComposeManager};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

pub struct PodmanComposeManager {
    program: String, // Injected via MoleConfig::compose_bin
}

impl PodmanComposeManager {
    pub fn new(program: String) -> Self {
        Self { program }
    }
}

#[async_trait]
impl ComposeManager for PodmanComposeManager {
    async fn down(&self, descriptor: &Path, working_dir: &Path) -> Result<CapturedRun> {
        let mut command = Command::new(&self.program);
        command
            .arg("-f")
            .arg(descriptor)
            .arg("down")
            .current_dir(working_dir);

        debug!(program = %self.program, descriptor = %descriptor.display(), "compose down");
        capture_combined(command, &self.program).await
    }
}
