use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use git_mirror_cache::SyncOptions;
use serde::Deserialize;

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for git-mirror-cache
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// SQLite file holding the mirrored objects
    #[serde(default = "defaults::cache_path")]
    pub cache_path: PathBuf,
    /// Partial-clone filter requested from remotes that support it; `null`
    /// fetches everything
    #[serde(default = "defaults::filter")]
    pub filter: Option<String>,
    /// Refs to mirror: exact names, or prefixes ending in `/`
    #[serde(default = "defaults::ref_prefixes")]
    pub ref_prefixes: Vec<String>,
    /// Index annotated tags as well as commits
    #[serde(default = "defaults::index_tags")]
    pub index_tags: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_path: defaults::cache_path(),
            filter: defaults::filter(),
            ref_prefixes: defaults::ref_prefixes(),
            index_tags: defaults::index_tags(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from the config file (if any) and environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => expand_tilde(path),
            None => Self::config_file_path()?,
        };
        tracing::debug!("loading git-mirror-cache config from {:?}", config_path);
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else if path.is_some() {
            anyhow::bail!("config file not found at {:?}", config_path);
        } else {
            Self::default()
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `GIT_MIRROR_CACHE_*` overrides, looked up through `var`
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("GIT_MIRROR_CACHE_PATH") {
            self.cache_path = expand_tilde(&PathBuf::from(path));
        }

        if let Some(filter) = var("GIT_MIRROR_CACHE_FILTER") {
            self.filter = match filter.trim() {
                "" | "none" => None,
                spec => Some(spec.to_string()),
            };
        }

        if let Some(refs) = var("GIT_MIRROR_CACHE_REFS") {
            let prefixes: Vec<String> = refs
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if prefixes.is_empty() {
                anyhow::bail!("GIT_MIRROR_CACHE_REFS must name at least one ref or prefix");
            }
            self.ref_prefixes = prefixes;
        }
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: CacheConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.cache_path = expand_tilde(&config.cache_path);
        Ok(config)
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/git-mirror-cache/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    /// Cache file path, creating its parent directory if necessary
    pub fn ensure_cache_path(&self) -> Result<PathBuf> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory: {:?}", parent))?;
        }
        Ok(self.cache_path.clone())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            ref_prefixes: self.ref_prefixes.clone(),
            filter: self.filter.clone(),
            index_tags: self.index_tags,
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    use git_mirror_cache::{DEFAULT_FILTER, DEFAULT_REF_PREFIXES};

    pub(crate) fn cache_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("git-mirror-cache")
            .join("cache.db")
    }

    pub(crate) fn filter() -> Option<String> {
        Some(DEFAULT_FILTER.to_string())
    }

    pub(crate) fn ref_prefixes() -> Vec<String> {
        DEFAULT_REF_PREFIXES.iter().map(|p| p.to_string()).collect()
    }

    pub(crate) fn index_tags() -> bool {
        true
    }
}
