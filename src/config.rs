use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bounded::DEFAULT_CONCURRENCY;
use crate::error::{IoResultExt, Result};
use crate::path::PathFilter;
use crate::remote::github::DEFAULT_API_URL;
use crate::remote::RepoId;

/// engine configuration stored in treesync.toml
///
/// credentials never live here; they are handed to the remote store directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// root of the remote REST api
    pub api_url: String,
    /// `owner/name` of the repository to sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// tracked file class, by extension; empty tracks every file
    pub extensions: Vec<String>,
    /// optional glob restriction on tracked paths
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    /// in-flight remote fetches per comparison or commit
    pub concurrency: usize,
    /// upper bound for a single remote call
    pub request_timeout_secs: u64,
    /// blob cache and session state
    pub cache_dir: PathBuf,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            repository: None,
            extensions: vec!["xml".to_string()],
            include: vec![],
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout_secs: 30,
            cache_dir: PathBuf::from(".treesync"),
            user_agent: concat!("treesync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// load config from file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// filter selecting the tracked paths
    pub fn path_filter(&self) -> Result<PathFilter> {
        PathFilter::new(&self.extensions).with_patterns(&self.include)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// configured repository, if any
    pub fn repo_id(&self) -> Result<Option<RepoId>> {
        self.repository.as_deref().map(RepoId::parse).transpose()
    }
}
