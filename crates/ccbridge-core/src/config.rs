//! Bridge configuration and on-disk layout.
//!
//! All persisted state lives under a single config directory (default
//! `~/.ccbridge`, override with `CCBRIDGE_HOME`). Claude Code's transcripts
//! are read from its projects tree (default `~/.claude/projects`, override
//! with `CCBRIDGE_PROJECTS_ROOT`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Resolved filesystem layout for the bridge.
#[derive(Debug, Clone)]
pub struct BridgePaths {
    home: PathBuf,
    projects_root: PathBuf,
}

impl BridgePaths {
    pub fn new(home: PathBuf, projects_root: PathBuf) -> Self {
        Self {
            home,
            projects_root,
        }
    }

    /// Resolve from environment, falling back to the defaults.
    pub fn from_env() -> Self {
        let home = std::env::var("CCBRIDGE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".ccbridge"))
                    .unwrap_or_else(|| PathBuf::from(".ccbridge"))
            });
        let projects_root = std::env::var("CCBRIDGE_PROJECTS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".claude").join("projects"))
                    .unwrap_or_else(|| PathBuf::from(".claude/projects"))
            });
        Self {
            home,
            projects_root,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Two-line `sessionId\ncwd` marker naming the attached session.
    pub fn attached_marker(&self) -> PathBuf {
        self.home.join("attached")
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.json")
    }

    /// Presence flag: voice-transcript polishing is off while this exists.
    pub fn polish_voice_off(&self) -> PathBuf {
        self.home.join("polish-voice-off")
    }

    /// Last-seen chat id, for startup and out-of-band notices.
    pub fn chat_id_file(&self) -> PathBuf {
        self.home.join("chat-id")
    }

    /// Staging directory for images downloaded from the chat client.
    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }
}

/// Optional operator configuration, read from `<cfg>/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_chat_id: Option<i64>,
}

impl BridgeConfig {
    /// Load the config file; a missing or malformed file yields defaults.
    pub fn load(paths: &BridgePaths) -> Self {
        let path = paths.config_file();
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Malformed config.json, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_config_yields_defaults() {
        let dir = tempdir().unwrap();
        let paths = BridgePaths::new(dir.path().to_path_buf(), dir.path().join("projects"));
        let config = BridgeConfig::load(&paths);
        assert!(config.repos_folder.is_none());
        assert!(config.allowed_chat_id.is_none());
    }

    #[test]
    fn test_load_config_camel_case() {
        let dir = tempdir().unwrap();
        let paths = BridgePaths::new(dir.path().to_path_buf(), dir.path().join("projects"));
        std::fs::write(
            paths.config_file(),
            r#"{"reposFolder": "/home/op/repos", "allowedChatId": 4242}"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&paths);
        assert_eq!(config.repos_folder.as_deref(), Some(Path::new("/home/op/repos")));
        assert_eq!(config.allowed_chat_id, Some(4242));
    }

    #[test]
    fn test_load_malformed_config_yields_defaults() {
        let dir = tempdir().unwrap();
        let paths = BridgePaths::new(dir.path().to_path_buf(), dir.path().join("projects"));
        std::fs::write(paths.config_file(), "{not json").unwrap();
        let config = BridgeConfig::load(&paths);
        assert!(config.allowed_chat_id.is_none());
    }
}
