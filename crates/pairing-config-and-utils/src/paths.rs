//! Where the pairing tool keeps its files.

use crate::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// Directory created under the user's home when nothing else is given.
const BASE_DIR_NAME: &str = ".channel-pairing";

/// Environment variable that relocates the base directory.
pub const BASE_DIR_ENV: &str = "PAIRING_HOME";

const CONFIG_FILE_NAME: &str = "config.json";

/// Filesystem layout rooted at one base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    /// Paths rooted at `~/.channel-pairing`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir().ok_or(CoreError::NoHomeDir)?;
        Ok(Self::with_base_dir(home.join(BASE_DIR_NAME)))
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Pick the base directory: an explicit one wins, then `PAIRING_HOME`,
    /// then the home default.
    pub fn resolve(explicit: Option<PathBuf>) -> CoreResult<Self> {
        Self::resolve_with(explicit, |name| std::env::var_os(name).map(PathBuf::from))
    }

    fn resolve_with<F>(explicit: Option<PathBuf>, lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        match explicit.or_else(|| lookup(BASE_DIR_ENV).filter(|p| !p.as_os_str().is_empty())) {
            Some(base_dir) => Ok(Self::with_base_dir(base_dir)),
            None => Self::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/config.json`
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }

    /// Create the base directory if it is missing.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}
