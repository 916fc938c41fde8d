//! Two-file permission handshake with the agent's permission hook.
//!
//! The hook writes `<cfg>/permission-request-<id>.json`; the bridge surfaces
//! the request out-of-band and answers by writing
//! `<cfg>/permission-response-<id>` containing the literal action. The hook
//! polls for the response file and exits 0 on approve, 2 on deny.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transcript::reader::digest_lines;

const REQUEST_PREFIX: &str = "permission-request-";
const REQUEST_SUFFIX: &str = ".json";
const RESPONSE_PREFIX: &str = "permission-response-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAction {
    Approve,
    Deny,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Approve => "approve",
            PermissionAction::Deny => "deny",
        }
    }
}

/// What the hook wrote, plus a best-effort command preview.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    /// Last tool_use command from the transcript, when resolvable.
    pub tool_command: Option<String>,
    pub file_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestFile {
    request_id: String,
    tool_name: String,
    #[serde(default)]
    tool_input: serde_json::Value,
    #[serde(default)]
    transcript_path: Option<PathBuf>,
}

/// Keeps the directory watcher alive while held.
pub struct PermissionWatchHandle {
    _watcher: Option<RecommendedWatcher>,
}

#[derive(Clone)]
pub struct PermissionBridge {
    cfg_dir: PathBuf,
}

impl PermissionBridge {
    pub fn new(cfg_dir: PathBuf) -> Self {
        Self { cfg_dir }
    }

    /// Watch for request files. Pre-existing requests are delivered first so
    /// a hook that fired before the bridge started is not lost.
    pub async fn watch(
        &self,
    ) -> (PermissionWatchHandle, mpsc::UnboundedReceiver<PermissionRequest>)
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (path_tx, mut path_rx) = mpsc::channel::<PathBuf>(64);

        tokio::fs::create_dir_all(&self.cfg_dir).await.ok();

        // Initial scan.
        if let Ok(mut entries) = tokio::fs::read_dir(&self.cfg_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if is_request_file(&path) {
                    let _ = path_tx.send(path).await;
                }
            }
        }

        let watcher = RecommendedWatcher::new(
            {
                let path_tx = path_tx.clone();
                move |res: Result<Event, notify::Error>| {
                    let Ok(event) = res else { return };
                    for path in event.paths {
                        if is_request_file(&path) {
                            let _ = path_tx.try_send(path);
                        }
                    }
                }
            },
            NotifyConfig::default(),
        )
        .and_then(|mut w| {
            w.watch(&self.cfg_dir, RecursiveMode::NonRecursive)?;
            Ok(w)
        });

        let watcher = match watcher {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(dir = ?self.cfg_dir, error = %e, "Permission directory watch failed");
                None
            }
        };

        tokio::spawn(async move {
            let mut seen: HashSet<PathBuf> = HashSet::new();
            while let Some(path) = path_rx.recv().await {
                if !seen.insert(path.clone()) {
                    continue;
                }
                match read_request(&path).await {
                    Ok(request) => {
                        info!(
                            request_id = %request.request_id,
                            tool = %request.tool_name,
                            "Permission request"
                        );
                        if out_tx.send(request).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // The hook will time out on its own.
                        debug!(path = ?path, error = %e, "Skipping unreadable permission request");
                    }
                }
            }
        });

        (PermissionWatchHandle { _watcher: watcher }, out_rx)
    }

    /// Write the response file the hook is polling for.
    pub async fn respond(&self, request_id: &str, action: PermissionAction) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cfg_dir)
            .await
            .with_context(|| format!("creating {:?}", self.cfg_dir))?;
        let path = self
            .cfg_dir
            .join(format!("{}{}", RESPONSE_PREFIX, request_id));
        tokio::fs::write(&path, action.as_str())
            .await
            .with_context(|| format!("writing {:?}", path))?;
        info!(request_id = %request_id, action = action.as_str(), "Permission response written");
        Ok(path)
    }
}

fn is_request_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| name.starts_with(REQUEST_PREFIX) && name.ends_with(REQUEST_SUFFIX))
        .unwrap_or(false)
}

async fn read_request(path: &Path) -> Result<PermissionRequest> {
    let content = tokio::fs::read_to_string(path).await?;
    let file: RequestFile = serde_json::from_str(&content)?;

    // Preview failure leaves the command undefined; the request still goes out.
    let tool_command = match &file.transcript_path {
        Some(transcript) => match tokio::fs::read_to_string(transcript).await {
            Ok(content) => {
                let digest = digest_lines(content.lines(), "");
                digest
                    .tool_calls
                    .last()
                    .and_then(|call| call.input.get("command"))
                    .and_then(|c| c.as_str())
                    .map(|c| c.to_string())
            }
            Err(_) => None,
        },
        None => None,
    };

    Ok(PermissionRequest {
        request_id: file.request_id,
        tool_name: file.tool_name,
        tool_input: file.tool_input,
        tool_command,
        file_path: path.to_path_buf(),
    })
}
