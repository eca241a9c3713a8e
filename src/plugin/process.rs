//! Collectors running as external executables.
//!
//! Protocol (arguments in, JSON on stdout out):
//! - `<exe> capabilities` prints a [`Capabilities`] object
//! - `<exe> investigate <kind> <depth> <target>` prints the result value
//!
//! A non-zero exit status is a failure, reported with the process's stderr.
//! Children are killed when the call is dropped, so the controller's timeout
//! and cancellation reach the process as well.

use crate::model::TargetKind;
use crate::traits::{Capabilities, Collector, CollectorError};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt kept in an error message.
const STDERR_EXCERPT: usize = 512;

#[derive(Debug, Clone)]
pub struct ProcessCollector {
    name: String,
    program: PathBuf,
    capabilities: Capabilities,
}

impl ProcessCollector {
    /// Asks `program` for its capabilities and builds the collector.
    ///
    /// # Errors
    ///
    /// Fails if the program cannot be started, exits non-zero, prints
    /// something other than a capabilities object, or takes longer than
    /// `handshake_timeout`.
    pub async fn handshake(
        name: &str,
        program: PathBuf,
        handshake_timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let stdout = tokio::time::timeout(handshake_timeout, run(&program, &["capabilities"]))
            .await
            .map_err(|_| {
                CollectorError::Failed(format!(
                    "no capabilities reply within {}s",
                    handshake_timeout.as_secs_f64()
                ))
            })??;

        let capabilities: Capabilities = serde_json::from_slice(&stdout).map_err(|e| {
            CollectorError::Failed(format!("capabilities reply is not valid JSON: {}", e))
        })?;

        debug!(plugin = name, program = %program.display(), "Plugin handshake complete");
        Ok(Self {
            name: name.to_string(),
            program,
            capabilities,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

async fn run(program: &Path, args: &[&str]) -> Result<Vec<u8>, CollectorError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CollectorError::Failed(format!("cannot run {}: {}", program.display(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        return Err(CollectorError::Failed(format!(
            "{} ({})",
            output.status,
            if excerpt.is_empty() { "no stderr" } else { excerpt.as_str() }
        )));
    }
    Ok(output.stdout)
}

#[async_trait]
impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn investigate(
        &self,
        target: &str,
        kind: TargetKind,
        depth: u8,
    ) -> Result<Value, CollectorError> {
        let depth = depth.to_string();
        let stdout = run(&self.program, &["investigate", kind.as_str(), &depth, target]).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&stdout)
            .map_err(|e| CollectorError::Failed(format!("output is not valid JSON: {}", e)))
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }
}
