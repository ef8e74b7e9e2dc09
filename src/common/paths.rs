//! Cross-platform pipe names and configuration paths
//!
//! Unix/macOS: Uses a Unix domain socket at $XDG_RUNTIME_DIR or /tmp
//! Windows: Uses the named pipe \\.\pipe\dxrt_service_ipc

use std::io;
use std::path::{Path, PathBuf};

/// Name used for the service pipe and the config/log directories
const SERVICE_NAME: &str = "dxrt-ipc";

/// Well-known Windows pipe name (the interprocess crate adds `\\.\pipe\`)
#[cfg(windows)]
const WINDOWS_PIPE_NAME: &str = "dxrt_service_ipc";

/// Get the socket path for the pipe backend
///
/// Platform-specific:
/// - Unix: `$XDG_RUNTIME_DIR/dxrt-ipc/service.sock` or `/tmp/dxrt-ipc-<uid>/service.sock`
/// - Windows: Named pipe name (handled by interprocess crate)
#[cfg(unix)]
pub fn socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join(SERVICE_NAME)
            .join("service.sock");
    }

    // Fallback to /tmp with uid for security
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", SERVICE_NAME, uid)).join("service.sock")
}

#[cfg(windows)]
pub fn socket_path() -> PathBuf {
    PathBuf::from(WINDOWS_PIPE_NAME)
}

/// Default pipe name as a string for the interprocess crate
#[cfg(unix)]
pub fn pipe_name() -> String {
    socket_path().to_string_lossy().into_owned()
}

#[cfg(windows)]
pub fn pipe_name() -> String {
    WINDOWS_PIPE_NAME.to_string()
}

/// Ensure the directory holding a socket exists with owner-only permissions
#[cfg(unix)]
pub fn ensure_socket_dir(socket: &Path) -> io::Result<()> {
    let dir = socket.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket path")
    })?;

    if !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

#[cfg(windows)]
pub fn ensure_socket_dir(_socket: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove a stale socket file left behind by a previous service instance
#[cfg(unix)]
pub fn remove_socket(socket: &Path) -> io::Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(windows)]
pub fn remove_socket(_socket: &Path) -> io::Result<()> {
    // Named pipes are automatically cleaned up on Windows
    Ok(())
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/dxrt-ipc/`
/// - macOS: `~/Library/Application Support/dxrt-ipc/`
/// - Windows: `%APPDATA%\dxrt-ipc\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", SERVICE_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", SERVICE_NAME)
        .map(|dirs| dirs.data_dir().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_name_is_valid() {
        assert!(!pipe_name().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_missing_socket_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_socket(&dir.path().join("absent.sock")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_socket_dir_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nested").join("service.sock");
        ensure_socket_dir(&socket).unwrap();
        assert!(socket.parent().unwrap().is_dir());
    }
}
