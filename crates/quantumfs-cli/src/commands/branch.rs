//! Branch command - create a new workspace from an existing one's state
//!
//! Sends a `branch` command over a mounted instance's `/api` file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use super::{api_path, parse_workspace_ref, send_command};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct BranchCommand {
    /// Source workspace, as typespace/namespace/workspace.
    pub src: String,

    /// New workspace to create, as typespace/namespace/workspace.
    pub dst: String,

    /// Path to the mounted instance's `/api` file; defaults to
    /// `mount.mount_point/api` from the config file.
    #[arg(long)]
    pub api: Option<PathBuf>,
}

impl BranchCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let (st, sn, sw) = parse_workspace_ref(&self.src).context("parsing source workspace")?;
        let (dt, dn, dw) = parse_workspace_ref(&self.dst).context("parsing destination workspace")?;

        let command = json!({
            "command": "branch",
            "src": {"typespace": st, "namespace": sn, "workspace": sw},
            "dst": {"typespace": dt, "namespace": dn, "workspace": dw},
        });

        let response = send_command(&api_path(&self.api), &command)?;
        if matches!(format, OutputFormat::Json) {
            formatter.print_json(&response);
            return Ok(());
        }

        if let Some(err) = response.get("error").and_then(|v| v.as_str()) {
            formatter.error(err);
        } else {
            formatter.success(&format!("branched {} -> {}", self.src, self.dst));
        }
        Ok(())
    }
}
