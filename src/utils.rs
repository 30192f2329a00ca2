//! Utility functions for directory management and system integration
//!
//! Follows the XDG Base Directory specification:
//!
//! - Config: `~/.config/meshwall/` - `config.json`
//! - State: `~/.local/state/meshwall/` - audit log, default log file
//!
//! When run as root from cron or systemd these resolve under `/root`.

use crate::core::error::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "meshwall", "meshwall")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

pub fn ensure_state_dir() -> std::io::Result<()> {
    let Some(dir) = get_state_dir() else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new()
            .mode(0o700) // User read/write/execute only
            .recursive(true)
            .create(dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }

    Ok(())
}

/// This host's name as the kernel reports it.
pub fn local_hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::NotFound(format!("cannot determine hostname: {e}")))?;

    name.into_string()
        .map_err(|_| Error::NotFound("hostname is not valid UTF-8".to_string()))
}
