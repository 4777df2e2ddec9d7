// Daemon binary discovery
// Shared by the launcher (to spawn sessions) and tests

use std::path::PathBuf;

/// File name of the daemon binary on this platform
pub fn daemon_binary_name() -> &'static str {
    if cfg!(windows) {
        "agent-dash-daemon.exe"
    } else {
        "agent-dash-daemon"
    }
}

/// Platform-specific fallback locations to search for installed binaries
pub fn fallback_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();

    #[cfg(target_os = "macos")]
    {
        locations.push(PathBuf::from("/opt/homebrew/bin"));
        locations.push(PathBuf::from("/usr/local/bin"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            locations.push(local_app_data.join("Programs/agent-dash"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        locations.push(PathBuf::from("/usr/bin"));
        locations.push(PathBuf::from("/usr/local/bin"));
    }

    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".local/bin"));
        locations.push(home.join(".cargo/bin"));
    }

    locations
}

/// Try to find the daemon binary in the fallback locations
pub fn find_daemon_binary() -> Option<PathBuf> {
    fallback_locations()
        .into_iter()
        .map(|dir| dir.join(daemon_binary_name()))
        .find(|candidate| candidate.is_file())
}

/// Resolve the `agent-dash-daemon` binary path for the current process.
///
/// Resolution order:
/// 1) Next to `current_exe()` (installed together / cargo target dir)
/// 2) The parent of `current_exe()`'s dir (cargo puts test binaries in `deps/`)
/// 3) Platform fallback locations
pub fn resolve_daemon_path() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        for dir in exe.ancestors().skip(1).take(2) {
            let candidate = dir.join(daemon_binary_name());
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    find_daemon_binary()
}
