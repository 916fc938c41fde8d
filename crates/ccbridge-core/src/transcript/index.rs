//! Session index over Claude Code's on-disk projects tree.
//!
//! Each project directory is the session cwd with every character outside
//! `[A-Za-z0-9_-]` replaced by `-`; each session is one `<sessionId>.jsonl`
//! file inside it. The index never writes into the tree; the only bridge-side
//! state is the two-line attached-session marker.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, warn};

use super::reader::{digest_lines, file_size};
use super::types::{AttachedSession, Baseline, SessionOverview, TRANSCRIPT_EXT};
use crate::config::BridgePaths;

pub struct SessionIndex {
    projects_root: PathBuf,
    attached_marker: PathBuf,
    fallback_cwd: String,
}

impl SessionIndex {
    pub fn new(paths: &BridgePaths) -> Self {
        let fallback_cwd = dirs::home_dir()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        Self {
            projects_root: paths.projects_root().to_path_buf(),
            attached_marker: paths.attached_marker(),
            fallback_cwd,
        }
    }

    /// Encode a cwd into its project directory name. Bijective over real
    /// paths in the sense Claude Code uses: every character outside the
    /// alphanumeric/underscore/hyphen set becomes `-`.
    pub fn encode_cwd(cwd: &str) -> String {
        cwd.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// Human project name from an encoded directory name: drop the leading
    /// hyphen, treat each remaining `-` as a path separator, take the last
    /// non-empty segment.
    pub fn decode_project_name(dir_name: &str) -> String {
        dir_name
            .trim_start_matches('-')
            .split('-')
            .filter(|s| !s.is_empty())
            .last()
            .unwrap_or(dir_name)
            .to_string()
    }

    /// List sessions across all projects, newest first. At most one entry per
    /// project directory: the newest transcript by mtime.
    pub async fn list_sessions(&self, limit: usize) -> Vec<SessionOverview> {
        let mut entries = match fs::read_dir(&self.projects_root).await {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut sessions = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some((session_id, file_path, mtime)) = newest_transcript(&dir).await else {
                continue;
            };

            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let project_name = Self::decode_project_name(&dir_name);

            let (cwd, last_message) = match fs::read_to_string(&file_path).await {
                Ok(content) => {
                    let digest = digest_lines(content.lines(), &self.fallback_cwd);
                    (digest.cwd, digest.last_message)
                }
                Err(_) => (self.fallback_cwd.clone(), None),
            };

            sessions.push(SessionOverview {
                session_id,
                cwd,
                project_name,
                last_message,
                mtime: DateTime::<Utc>::from(mtime),
            });
        }

        sessions.sort_by(|a, b| b.mtime.cmp(&a.mtime));
        sessions.truncate(limit);
        sessions
    }

    /// Resolve the current session file for a cwd: always the newest `.jsonl`
    /// by mtime. Files holding only metadata are never skipped - a freshly
    /// cleared session is empty and must still win (that is the
    /// post-compaction rotation case).
    pub async fn latest_session_file_for_cwd(&self, cwd: &str) -> Option<(String, PathBuf)> {
        let dir = self.projects_root.join(Self::encode_cwd(cwd));
        let (session_id, file_path, _) = newest_transcript(&dir).await?;
        Some((session_id, file_path))
    }

    /// Probe every project directory for `<sessionId>.jsonl`.
    pub async fn session_file_path(&self, session_id: &str) -> Option<PathBuf> {
        let mut entries = fs::read_dir(&self.projects_root).await.ok()?;
        let file_name = format!("{}.{}", session_id, TRANSCRIPT_EXT);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let candidate = entry.path().join(&file_name);
            if fs::metadata(&candidate).await.is_ok() {
                return Some(candidate);
            }
        }
        None
    }

    /// Capture `{filePath, sessionId, size}` for the session active in a cwd.
    /// Taken immediately before injection so the watcher sees only the
    /// post-injection tail.
    pub async fn snapshot_baseline(&self, cwd: &str) -> Option<Baseline> {
        let (session_id, file_path) = self.latest_session_file_for_cwd(cwd).await?;
        let size = file_size(&file_path).await;
        debug!(session_id = %session_id, size, "Baseline captured");
        Some(Baseline {
            file_path,
            session_id,
            size,
        })
    }

    // ============ Attached marker ============

    /// Read the marker. Missing file or missing sessionId line yields `None`;
    /// a missing cwd line substitutes the operator's home.
    pub async fn attached_session(&self) -> Option<AttachedSession> {
        let content = fs::read_to_string(&self.attached_marker).await.ok()?;
        let mut lines = content.lines();
        let session_id = lines.next()?.trim().to_string();
        if session_id.is_empty() {
            return None;
        }
        let cwd = match lines.next() {
            Some(line) if !line.trim().is_empty() => line.trim().to_string(),
            _ => self.fallback_cwd.clone(),
        };
        Some(AttachedSession { session_id, cwd })
    }

    /// Whole-file replacement; readers tolerate transient malformed content.
    pub async fn write_attached(&self, session_id: &str, cwd: &str) -> Result<()> {
        if let Some(parent) = self.attached_marker.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        fs::write(&self.attached_marker, format!("{}\n{}", session_id, cwd))
            .await
            .with_context(|| format!("writing attached marker {:?}", self.attached_marker))
    }

    pub async fn remove_attached(&self) {
        if let Err(e) = fs::remove_file(&self.attached_marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove attached marker");
            }
        }
    }
}

/// Newest `.jsonl` in a directory by mtime: `(sessionId, path, mtime)`.
async fn newest_transcript(dir: &Path) -> Option<(String, PathBuf, SystemTime)> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(String, PathBuf, SystemTime)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map(|e| e != TRANSCRIPT_EXT).unwrap_or(true) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(mtime) = metadata.modified() else {
            continue;
        };
        let session_id = match path.file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => continue,
        };
        match &newest {
            Some((_, _, best)) if *best >= mtime => {}
            _ => newest = Some((session_id, path, mtime)),
        }
    }

    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn index_for(root: &Path) -> SessionIndex {
        let paths = BridgePaths::new(root.join("cfg"), root.join("projects"));
        SessionIndex::new(&paths)
    }

    fn write_session(root: &Path, encoded: &str, session_id: &str, content: &str) -> PathBuf {
        let dir = root.join("projects").join(encoded);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", session_id));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_encode_cwd() {
        assert_eq!(SessionIndex::encode_cwd("/home/op/repo"), "-home-op-repo");
        assert_eq!(SessionIndex::encode_cwd("/a/b.c"), "-a-b-c");
        assert_eq!(SessionIndex::encode_cwd("/with space"), "-with-space");
    }

    #[test]
    fn test_decode_project_name() {
        assert_eq!(SessionIndex::decode_project_name("-home-op-repo"), "repo");
        assert_eq!(SessionIndex::decode_project_name("-tmp-p"), "p");
        assert_eq!(SessionIndex::decode_project_name("plain"), "plain");
    }

    #[tokio::test]
    async fn test_list_sessions_one_entry_per_project() {
        let dir = tempdir().unwrap();
        let index = index_for(dir.path());

        write_session(
            dir.path(),
            "-work-alpha",
            "old",
            r#"{"type":"assistant","cwd":"/work/alpha","message":{"content":[{"type":"text","text":"first"}]}}"#,
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_session(
            dir.path(),
            "-work-alpha",
            "new",
            r#"{"type":"assistant","cwd":"/work/alpha","message":{"content":[{"type":"text","text":"second"}]}}"#,
        );
        write_session(
            dir.path(),
            "-work-beta",
            "solo",
            r#"{"type":"assistant","cwd":"/work/beta","message":{"content":[{"type":"text","text":"beta msg"}]}}"#,
        );

        let sessions = index.list_sessions(10).await;
        assert_eq!(sessions.len(), 2);
        let alpha = sessions
            .iter()
            .find(|s| s.project_name == "alpha")
            .unwrap();
        assert_eq!(alpha.session_id, "new");
        assert_eq!(alpha.cwd, "/work/alpha");
        assert_eq!(alpha.last_message.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_latest_session_never_skips_metadata_only_files() {
        let dir = tempdir().unwrap();
        let index = index_for(dir.path());

        write_session(
            dir.path(),
            "-work-alpha",
            "old",
            r#"{"type":"assistant","cwd":"/work/alpha","message":{"content":[{"type":"text","text":"hello"}]}}"#,
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
        // Freshly cleared session: only a snapshot record.
        write_session(
            dir.path(),
            "-work-alpha",
            "fresh",
            r#"{"type":"file-history-snapshot","snapshot":{}}"#,
        );

        let (session_id, path) = index
            .latest_session_file_for_cwd("/work/alpha")
            .await
            .unwrap();
        assert_eq!(session_id, "fresh");
        assert!(path.ends_with("fresh.jsonl"));
    }

    #[tokio::test]
    async fn test_snapshot_baseline_size() {
        let dir = tempdir().unwrap();
        let index = index_for(dir.path());
        let path = write_session(dir.path(), "-work-alpha", "s1", "line one\n");

        let baseline = index.snapshot_baseline("/work/alpha").await.unwrap();
        assert_eq!(baseline.session_id, "s1");
        assert_eq!(baseline.file_path, path);
        assert_eq!(baseline.size, 9);
    }

    #[tokio::test]
    async fn test_attached_marker_roundtrip() {
        let dir = tempdir().unwrap();
        let index = index_for(dir.path());

        assert!(index.attached_session().await.is_none());

        index.write_attached("sess-1", "/work/alpha").await.unwrap();
        let attached = index.attached_session().await.unwrap();
        assert_eq!(attached.session_id, "sess-1");
        assert_eq!(attached.cwd, "/work/alpha");

        index.remove_attached().await;
        assert!(index.attached_session().await.is_none());
    }

    #[tokio::test]
    async fn test_attached_marker_missing_cwd_falls_back_to_home() {
        let dir = tempdir().unwrap();
        let index = index_for(dir.path());
        std::fs::create_dir_all(dir.path().join("cfg")).unwrap();
        std::fs::write(dir.path().join("cfg/attached"), "sess-2").unwrap();

        let attached = index.attached_session().await.unwrap();
        assert_eq!(attached.session_id, "sess-2");
        assert!(!attached.cwd.is_empty());
    }

    #[tokio::test]
    async fn test_session_file_path_probe() {
        let dir = tempdir().unwrap();
        let index = index_for(dir.path());
        let path = write_session(dir.path(), "-work-beta", "findme", "{}\n");

        assert_eq!(index.session_file_path("findme").await.unwrap(), path);
        assert!(index.session_file_path("nope").await.is_none());
    }
}
