//! Local state file (`state.toml`) next to the config.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::Theme;
use std::path::{Path, PathBuf};
use tasklist_sync::Preferences;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LocalState {
    #[serde(default)]
    selected_list: Option<Uuid>,
    #[serde(default)]
    theme: Theme,
}

pub struct FilePreferences {
    path: PathBuf,
    state: LocalState,
}

impl FilePreferences {
    pub fn default_path() -> Result<PathBuf> {
        Ok(Config::config_dir()?.join("state.toml"))
    }

    /// Read the state file; a missing or unreadable file gives defaults
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
                LocalState::default()
            }),
            Err(_) => LocalState::default(),
        };
        Self { path, state }
    }

    fn save(&self) {
        let result = toml::to_string_pretty(&self.state)
            .map_err(anyhow::Error::from)
            .and_then(|content| std::fs::write(&self.path, content).map_err(Into::into));
        if let Err(e) = result {
            tracing::warn!("Failed to save {}: {}", self.path.display(), e);
        }
    }
}

impl Preferences for FilePreferences {
    fn selected_list(&self) -> Option<Uuid> {
        self.state.selected_list
    }

    fn set_selected_list(&mut self, list_id: Option<Uuid>) {
        if self.state.selected_list != list_id {
            self.state.selected_list = list_id;
            self.save();
        }
    }

    fn theme(&self) -> Theme {
        self.state.theme
    }

    fn set_theme(&mut self, theme: Theme) {
        self.state.theme = theme;
        self.save();
    }
}
