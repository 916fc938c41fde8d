//! Locate the tmux pane running Claude Code for a given cwd.
//!
//! Pane enumeration and process inspection both shell out (`tmux`, `ps`) via
//! argv spawning. Selection itself is a pure function over the parsed
//! snapshots so ties are broken deterministically.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::inject::KEYSTROKE_DELAY;

/// Format template for pane enumeration, space-delimited.
const PANE_FORMAT: &str = "#{pane_id} #{pane_pid} #{pane_current_command} #{pane_current_path}";

/// Max length of a sanitised tmux window name.
const WINDOW_NAME_MAX: usize = 30;

/// Claude Code advertises its version as the process title.
static SEMVER_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: String,
    pub shell_pid: u32,
    pub command: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    NoTmux,
    NoClaudePane,
    Ambiguous,
}

impl NotFoundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotFoundReason::NoTmux => "no_tmux",
            NotFoundReason::NoClaudePane => "no_claude_pane",
            NotFoundReason::Ambiguous => "ambiguous",
        }
    }

    /// Human text for the chat surface.
    pub fn describe(&self) -> &'static str {
        match self {
            NotFoundReason::NoTmux => "tmux is not running",
            NotFoundReason::NoClaudePane => "no Claude Code pane found",
            NotFoundReason::Ambiguous => "several Claude Code panes match and none could be told apart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneLookup {
    Found { pane_id: String },
    NotFound { reason: NotFoundReason },
}

/// Is this pane's current command recognisable as the agent?
pub fn is_claude_command(command: &str) -> bool {
    command.contains("claude") || SEMVER_TITLE.is_match(command.trim())
}

/// Parse one line of `tmux list-panes` output. Trailing tokens past the
/// command are rejoined into the cwd so paths with spaces survive.
pub fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() < 4 {
        return None;
    }
    Some(PaneInfo {
        pane_id: tokens[0].to_string(),
        shell_pid: tokens[1].parse().ok()?,
        command: tokens[2].to_string(),
        cwd: tokens[3..].join(" "),
    })
}

/// Deterministic pane selection given a start-time oracle for tie-breaking.
///
/// Precedence: unique exact cwd match, unique strict-parent match, then the
/// freshest agent spawn among whichever tier has candidates. A lone candidate
/// with no cwd relation still wins; multiple unrelated candidates with no
/// usable start times are ambiguous.
pub fn select_pane<'a, F>(
    candidates: &'a [PaneInfo],
    target_cwd: &str,
    start_time: F,
) -> Result<&'a PaneInfo, NotFoundReason>
where
    F: Fn(&PaneInfo) -> i64,
{
    if candidates.is_empty() {
        return Err(NotFoundReason::NoClaudePane);
    }

    let exact: Vec<&PaneInfo> = candidates.iter().filter(|p| p.cwd == target_cwd).collect();
    if exact.len() == 1 {
        return Ok(exact[0]);
    }

    let parents: Vec<&PaneInfo> = candidates
        .iter()
        .filter(|p| is_strict_parent(&p.cwd, target_cwd))
        .collect();
    if exact.is_empty() && parents.len() == 1 {
        return Ok(parents[0]);
    }

    let pool: Vec<&PaneInfo> = if !exact.is_empty() {
        exact
    } else if !parents.is_empty() {
        parents
    } else if candidates.len() == 1 {
        return Ok(&candidates[0]);
    } else {
        // Multiple panes, none related to the target cwd. A stale pane the
        // user quit from leaves the shell alive; the freshest spawn is the
        // one they mean - but with no start times at all there is nothing to
        // tell them apart.
        let fresh: Vec<&PaneInfo> = candidates.iter().collect();
        if fresh.iter().all(|p| start_time(p) == 0) {
            return Err(NotFoundReason::Ambiguous);
        }
        fresh
    };

    // Most recent agent start wins; equal times fall back to pane order.
    let mut best: Option<(&PaneInfo, i64)> = None;
    for pane in pool {
        let started = start_time(pane);
        match best {
            Some((_, top)) if top >= started => {}
            _ => best = Some((pane, started)),
        }
    }
    best.map(|(pane, _)| pane).ok_or(NotFoundReason::NoClaudePane)
}

fn is_strict_parent(parent: &str, child: &str) -> bool {
    parent != child && child.starts_with(&format!("{}/", parent.trim_end_matches('/')))
}

// ============ Process snapshot (tie-break oracle) ============

#[derive(Debug, Clone)]
pub struct PsEntry {
    pub pid: u32,
    pub ppid: u32,
    pub elapsed_secs: u64,
    pub command: String,
}

/// A point-in-time `ps` listing used to find the agent child of each pane
/// shell and compare spawn recency.
#[derive(Debug, Default)]
pub struct ProcessSnapshot {
    entries: Vec<PsEntry>,
}

impl ProcessSnapshot {
    pub fn from_entries(entries: Vec<PsEntry>) -> Self {
        Self { entries }
    }

    /// Epoch start time of the freshest agent child under `shell_pid`,
    /// 0 when no such child or no start time is known.
    pub fn newest_claude_child_start(&self, shell_pid: u32, now_epoch: i64) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.ppid == shell_pid && is_claude_command(&e.command))
            .map(|e| now_epoch - e.elapsed_secs as i64)
            .max()
            .unwrap_or(0)
    }
}

/// Parse `ps` etime format: `[[dd-]hh:]mm:ss`.
pub fn parse_etime_secs(etime: &str) -> Option<u64> {
    let etime = etime.trim();
    let (days, rest) = match etime.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, etime),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    let (hours, mins, secs) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        [m, s] => (0, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        _ => return None,
    };
    Some(days * 86_400 + hours * 3_600 + mins * 60 + secs)
}

pub fn parse_ps_line(line: &str) -> Option<PsEntry> {
    let mut tokens = line.split_whitespace();
    let pid = tokens.next()?.parse().ok()?;
    let ppid = tokens.next()?.parse().ok()?;
    let elapsed_secs = parse_etime_secs(tokens.next()?)?;
    let command = tokens.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    Some(PsEntry {
        pid,
        ppid,
        elapsed_secs,
        command,
    })
}

// ============ Locator ============

pub struct PaneLocator;

impl PaneLocator {
    pub fn new() -> Self {
        Self
    }

    /// Enumerate all panes. Returns empty when tmux is absent or errors.
    pub async fn list_panes(&self) -> Vec<PaneInfo> {
        let output = Command::new("tmux")
            .args(["list-panes", "-a", "-F", PANE_FORMAT])
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            _ => return Vec::new(),
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_pane_line)
            .collect()
    }

    /// Find the pane running the agent at `target_cwd`.
    pub async fn find(&self, target_cwd: &str) -> PaneLookup {
        let panes = self.list_panes().await;
        if panes.is_empty() {
            return PaneLookup::NotFound {
                reason: NotFoundReason::NoTmux,
            };
        }

        let candidates: Vec<PaneInfo> = panes
            .into_iter()
            .filter(|p| is_claude_command(&p.command))
            .collect();
        if candidates.is_empty() {
            return PaneLookup::NotFound {
                reason: NotFoundReason::NoClaudePane,
            };
        }

        let snapshot = self.process_snapshot().await;
        let now_epoch = chrono::Utc::now().timestamp();
        let mut starts: HashMap<String, i64> = HashMap::new();
        for pane in &candidates {
            starts.insert(
                pane.pane_id.clone(),
                snapshot.newest_claude_child_start(pane.shell_pid, now_epoch),
            );
        }

        match select_pane(&candidates, target_cwd, |p| {
            starts.get(&p.pane_id).copied().unwrap_or(0)
        }) {
            Ok(pane) => {
                debug!(pane_id = %pane.pane_id, cwd = %pane.cwd, "Pane located");
                PaneLookup::Found {
                    pane_id: pane.pane_id.clone(),
                }
            }
            Err(reason) => PaneLookup::NotFound { reason },
        }
    }

    async fn process_snapshot(&self) -> ProcessSnapshot {
        let output = Command::new("ps")
            .args(["-axo", "pid=,ppid=,etime=,command="])
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            _ => return ProcessSnapshot::default(),
        };

        ProcessSnapshot::from_entries(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(parse_ps_line)
                .collect(),
        )
    }

    /// Create a new window at `cwd` and launch the agent in it. Text and
    /// submit are sent as two separate commands with a small delay, otherwise
    /// the submit fires before the text registers.
    pub async fn launch(
        &self,
        cwd: &str,
        project_name: &str,
        skip_permissions: bool,
    ) -> Result<String> {
        if !Path::new(cwd).is_dir() {
            bail!("cwd does not exist: {}", cwd);
        }
        let window = sanitize_window_name(project_name);
        let output = Command::new("tmux")
            .args([
                "new-window", "-P", "-F", "#{pane_id}", "-n", &window, "-c", cwd,
            ])
            .output()
            .await
            .context("spawning tmux new-window")?;
        if !output.status.success() {
            bail!(
                "tmux new-window failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let pane_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if pane_id.is_empty() {
            bail!("tmux new-window returned no pane id");
        }

        let launch_cmd = if skip_permissions {
            "claude -c --dangerously-skip-permissions"
        } else {
            "claude -c"
        };
        super::inject::send_literal(&pane_id, launch_cmd).await?;
        tokio::time::sleep(KEYSTROKE_DELAY).await;
        super::inject::send_named_key(&pane_id, "Enter").await?;

        info!(pane_id = %pane_id, window = %window, cwd = %cwd, "Launched agent pane");
        Ok(pane_id)
    }

    /// Kill the window containing a pane. Best effort.
    pub async fn kill_window(&self, pane_id: &str) {
        let result = Command::new("tmux")
            .args(["kill-window", "-t", pane_id])
            .output()
            .await;
        if let Err(e) = result {
            warn!(pane_id = %pane_id, error = %e, "kill-window failed");
        }
    }
}

impl Default for PaneLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sanitise a project name into a tmux window name.
pub fn sanitize_window_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.chars().take(WINDOW_NAME_MAX).collect()
}

/// Allow a brief wait for a freshly launched pane to show up in listings.
pub async fn wait_for_pane(locator: &PaneLocator, cwd: &str, attempts: u32) -> bool {
    for _ in 0..attempts {
        if matches!(locator.find(cwd).await, PaneLookup::Found { .. }) {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}
