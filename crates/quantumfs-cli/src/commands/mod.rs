pub mod branch;
pub mod completions;
pub mod merge;
pub mod status;

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quantumfs_core::config::Config;
use serde::Serialize;
use serde_json::Value;

/// Resolves the `/api` control file inside a mounted workspace: either the
/// path the caller passed explicitly, or `mount.mount_point/api` from the
/// config file.
pub fn api_path(explicit: &Option<PathBuf>) -> PathBuf {
    match explicit {
        Some(p) => p.clone(),
        None => {
            let config = Config::load_or_default(&Config::default_path());
            Path::new(&config.mount.mount_point).join("api")
        }
    }
}

/// Writes one JSON command to the `/api` file and reads back the response.
/// The file behaves like a request/response pipe: a single write dispatches
/// the command synchronously, and the following read returns its result.
pub fn send_command(api: &Path, command: &impl Serialize) -> Result<Value> {
    let payload = serde_json::to_vec(command).context("encoding command")?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(api)
        .with_context(|| format!("opening {}", api.display()))?;
    file.write_all(&payload).context("writing command to /api")?;

    let mut response = Vec::new();
    file.read_to_end(&mut response).context("reading response from /api")?;
    serde_json::from_slice(&response).context("decoding response from /api")
}

/// Splits a `typespace/namespace/workspace` triple; each component must be
/// non-empty.
pub fn parse_workspace_ref(s: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = s.split('/').collect();
    let (typespace, namespace, workspace) = match parts.as_slice() {
        [t, n, w] => (*t, *n, *w),
        _ => anyhow::bail!("expected typespace/namespace/workspace, got '{s}'"),
    };
    if typespace.is_empty() || namespace.is_empty() || workspace.is_empty() {
        anyhow::bail!("typespace/namespace/workspace components must be non-empty");
    }
    Ok((typespace.to_string(), namespace.to_string(), workspace.to_string()))
}
