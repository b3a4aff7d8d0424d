use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::SidebarTab;
use crate::zoom::ZoomLevel;

pub const CONFIG_FILE_NAME: &str = "config.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("net", "pageview", "pageview")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub zoom: ZoomConfig,
    pub sidebar: SidebarConfig,
    pub search: SearchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoomConfig {
    pub initial: i64,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            initial: i64::from(ZoomLevel::DEFAULT.percent()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidebarConfig {
    pub open: bool,
    pub tab: SidebarTab,
}

impl Default for SidebarConfig {
    fn default() -> Self {
        Self {
            open: true,
            tab: SidebarTab::Contents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Pages whose text is extracted at the same time during a search.
    pub max_concurrent_pages: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pages: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl ViewerConfig {
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to parse config file {:?}", path))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn initial_zoom(&self) -> ZoomLevel {
        ZoomLevel::from_percent(self.zoom.initial).unwrap_or_else(|err| {
            warn!(%err, "ignoring configured initial zoom");
            ZoomLevel::DEFAULT
        })
    }

    pub fn max_concurrent_pages(&self) -> usize {
        self.search.max_concurrent_pages.max(1)
    }
}
