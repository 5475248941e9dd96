// src/sys/build.rs

use crate::error::{MoleError, Result};
use crate::sys::traits::{CapturedRun, ScriptRunner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Runs a command to completion, merging stdout and stderr into one buffer
/// in the order chunks arrive. Both pipes are drained into a single channel
/// so neither can fill up and stall the child.
pub async fn capture_combined(mut command: Command, program: &str) -> Result<CapturedRun> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| MoleError::io(program, e))?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward(stderr, tx.clone()));
    }
    drop(tx);

    let mut output = Vec::new();
    while let Some(chunk) = rx.recv().await {
        output.extend_from_slice(&chunk);
    }

    let status = child.wait().await.map_err(|e| MoleError::io(program, e))?;
    debug!(program, code = ?status.code(), bytes = output.len(), "process finished");

    Ok(CapturedRun {
        code: status.code(),
        output,
    })
}

async fn forward<R: AsyncRead + Unpin>(mut pipe: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

pub struct BashScriptRunner;

#[async_trait]
impl ScriptRunner for BashScriptRunner {
    async fn run_script(
        &self,
        script: &Path,
        working_dir: &Path,
        env_vars: &HashMap<String, String>,
    ) -> Result<CapturedRun> {
        let mut command = Command::new("bash");
        command.arg(script).current_dir(working_dir).envs(env_vars);

        debug!(script = %script.display(), cwd = %working_dir.display(), "running deployment script");
        capture_combined(command, "bash").await
    }
}
