//! Configuration paths and shared-file permissions
//!
//! Files handed to other containers through bind mounts are read by whatever
//! user the consuming image declares, so they are made world-readable.

use std::io;
use std::path::{Path, PathBuf};

/// Name used for the configuration directory
const APP_NAME: &str = "kind-perf-harness";

/// Mode for files bind-mounted read-only into other containers
pub const SHARED_FILE_MODE: u32 = 0o644;

/// Mode for directories a non-root container writes into
pub const SHARED_DIR_MODE: u32 = 0o777;

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/kind-perf-harness/`
/// - macOS: `~/Library/Application Support/kind-perf-harness/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Set explicit permission bits on a file or directory
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Make a file readable by any container user
pub fn share_file(path: &Path) -> io::Result<()> {
    set_mode(path, SHARED_FILE_MODE)
}

/// Make a directory writable by any container user
pub fn share_dir(path: &Path) -> io::Result<()> {
    set_mode(path, SHARED_DIR_MODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_toml() {
        if let Some(path) = config_path() {
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_share_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let file = tempfile::NamedTempFile::new().unwrap();
        share_file(file.path()).unwrap();
        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o004, 0o004);
    }
}
