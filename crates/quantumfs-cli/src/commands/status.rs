//! Status command - report a workspace's current root and nonce
//!
//! Sends a `status` command over a mounted instance's `/api` file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use super::{api_path, parse_workspace_ref, send_command};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Workspace to query, as typespace/namespace/workspace.
    pub workspace: String,

    /// Path to the mounted instance's `/api` file; defaults to
    /// `mount.mount_point/api` from the config file.
    #[arg(long)]
    pub api: Option<PathBuf>,
}

impl StatusCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let (t, n, w) = parse_workspace_ref(&self.workspace).context("parsing workspace")?;

        let command = json!({
            "command": "status",
            "workspace": {"typespace": t, "namespace": n, "workspace": w},
        });

        let response = send_command(&api_path(&self.api), &command)?;
        if matches!(format, OutputFormat::Json) {
            formatter.print_json(&response);
            return Ok(());
        }

        if let Some(err) = response.get("error").and_then(|v| v.as_str()) {
            formatter.error(err);
            return Ok(());
        }

        formatter.success(&format!("status for {}", self.workspace));
        formatter.info(&format!(
            "root_key: {}",
            response.get("root_key").and_then(|v| v.as_str()).unwrap_or("?")
        ));
        formatter.info(&format!(
            "nonce:    {}",
            response.get("nonce").and_then(|v| v.as_u64()).map(|n| n.to_string()).unwrap_or_else(|| "?".to_string())
        ));
        Ok(())
    }
}
