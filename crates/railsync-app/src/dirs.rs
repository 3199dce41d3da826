//! Where the node keeps its files.
//!
//! Configuration lives in the platform config directory, the dispatcher's
//! player roster in the data directory, and log files next to the config.

use std::io;
use std::path::{Path, PathBuf};

/// Errors resolving or creating the node's directories.
#[derive(Debug, thiserror::Error)]
pub enum DirsError {
    #[error("could not determine OS configuration directory")]
    NoConfigDir,
    #[error("could not create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// OS-specific directory paths for railsync.
#[derive(Debug, Clone)]
pub struct AppDirs {
    /// `config.ron`.
    pub config_dir: PathBuf,
    /// Saved dispatcher roster.
    pub data_dir: PathBuf,
    /// Log files.
    pub log_dir: PathBuf,
}

const APP_NAME: &str = "railsync";
const ROSTER_FILE: &str = "roster.bin";

impl AppDirs {
    /// Resolve platform directories without creating them. `config_override`
    /// replaces the config directory (from `--config`).
    pub fn resolve(config_override: Option<&Path>) -> Result<Self, DirsError> {
        let config_base = ::dirs::config_dir().ok_or(DirsError::NoConfigDir)?;
        let app_config = config_base.join(APP_NAME);
        let data_dir = ::dirs::data_dir()
            .map(|dir| dir.join(APP_NAME))
            .unwrap_or_else(|| app_config.join("data"));

        Ok(Self {
            config_dir: config_override
                .map(Path::to_path_buf)
                .unwrap_or_else(|| app_config.clone()),
            data_dir,
            log_dir: app_config.join("logs"),
        })
    }

    /// Directories rooted under `root`, for tests.
    pub fn with_root(root: &Path) -> Self {
        let app_dir = root.join(APP_NAME);
        Self {
            config_dir: app_dir.join("config"),
            data_dir: app_dir.join("data"),
            log_dir: app_dir.join("logs"),
        }
    }

    pub fn create_all(&self) -> Result<(), DirsError> {
        for dir in [&self.config_dir, &self.data_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|source| DirsError::Create {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn roster_path(&self) -> PathBuf {
        self.data_dir.join(ROSTER_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root_layout() {
        let root = Path::new("/tmp/railsync-test");
        let dirs = AppDirs::with_root(root);
        assert_eq!(dirs.config_dir, root.join("railsync/config"));
        assert_eq!(dirs.data_dir, root.join("railsync/data"));
        assert_eq!(dirs.log_dir, root.join("railsync/logs"));
        assert_eq!(dirs.roster_path(), root.join("railsync/data/roster.bin"));
    }

    #[test]
    fn test_create_all_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = AppDirs::with_root(tmp.path());
        dirs.create_all().unwrap();
        assert!(dirs.config_dir.is_dir());
        assert!(dirs.data_dir.is_dir());
        assert!(dirs.log_dir.is_dir());
    }

    #[test]
    fn test_config_override_wins() {
        let custom = Path::new("/srv/railsync");
        if let Ok(dirs) = AppDirs::resolve(Some(custom)) {
            assert_eq!(dirs.config_dir, custom);
        }
    }
}
