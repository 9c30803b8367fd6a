//! Merge command - three-way merge one workspace's changes into another
//!
//! Sends a `merge` command over a mounted instance's `/api` file. The
//! ancestor (`--base`) must be named explicitly: there is no lineage graph
//! to derive a common ancestor from automatically.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use super::{api_path, parse_workspace_ref, send_command};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct MergeCommand {
    /// Common ancestor workspace, as typespace/namespace/workspace.
    #[arg(long)]
    pub base: String,

    /// Local workspace to advance with the merge result.
    pub local: String,

    /// Remote workspace whose changes are merged in.
    pub remote: String,

    /// Path to the mounted instance's `/api` file; defaults to
    /// `mount.mount_point/api` from the config file.
    #[arg(long)]
    pub api: Option<PathBuf>,
}

impl MergeCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let (bt, bn, bw) = parse_workspace_ref(&self.base).context("parsing base workspace")?;
        let (lt, ln, lw) = parse_workspace_ref(&self.local).context("parsing local workspace")?;
        let (rt, rn, rw) = parse_workspace_ref(&self.remote).context("parsing remote workspace")?;

        let command = json!({
            "command": "merge",
            "base": {"typespace": bt, "namespace": bn, "workspace": bw},
            "local": {"typespace": lt, "namespace": ln, "workspace": lw},
            "remote": {"typespace": rt, "namespace": rn, "workspace": rw},
        });

        let response = send_command(&api_path(&self.api), &command)?;
        if matches!(format, OutputFormat::Json) {
            formatter.print_json(&response);
            return Ok(());
        }

        if let Some(err) = response.get("error").and_then(|v| v.as_str()) {
            formatter.error(err);
        } else {
            let root_key = response.get("root_key").and_then(|v| v.as_str()).unwrap_or("?");
            formatter.success(&format!("merged {} into {}, root {}", self.remote, self.local, root_key));
            if response.get("panicked").and_then(|v| v.as_bool()).unwrap_or(false) {
                formatter.warn("merge traversal panicked partway through; result is a best-effort recovery");
            }
        }
        Ok(())
    }
}
