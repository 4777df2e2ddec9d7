//! Detached daemon launching and process-group supervision.
//!
//! A daemon is started in its own session/process group with no inherited
//! stdio, so it survives the launcher and can be torn down together with the
//! agent CLI it spawns by signalling the whole group.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::error::SpawnError;
use crate::session::config::{Config, STREAM_URL_ENV};
use crate::session::protocol::SpawnConfig;

/// Launches agent daemons as detached OS processes.
#[derive(Debug, Clone)]
pub struct DaemonSpawner {
    program: PathBuf,
    /// Arguments placed before `--config=<json>` (e.g. a script for an interpreter)
    leading_args: Vec<OsString>,
}

impl DaemonSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Spawner for the installed `agent-dash-daemon` binary
    pub fn from_config(config: &Config) -> Result<Self, SpawnError> {
        config.daemon_path().map(Self::new).ok_or_else(|| {
            SpawnError::InvalidConfig(
                "could not find agent-dash-daemon; set AGENT_DASH_DAEMON_PATH".into(),
            )
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Launch a daemon for `config` and return its pid.
    ///
    /// The child runs in `config.working_dir` with the launcher's environment
    /// plus the stream URL override. It is never waited on by the caller; a
    /// background thread reaps it so an exited daemon does not linger as a
    /// zombie and fool [`DaemonSpawner::is_running`].
    pub fn spawn(&self, config: &SpawnConfig) -> Result<u32, SpawnError> {
        config.validate()?;
        let config_arg = config
            .to_arg()
            .map_err(|e| SpawnError::InvalidConfig(format!("unserializable config: {}", e)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(config_arg)
            .current_dir(&config.working_dir)
            .env(STREAM_URL_ENV, &config.stream_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);

        let child = command.spawn().map_err(|source| SpawnError::SpawnFailed {
            session_id: config.session_id.clone(),
            source,
        })?;
        let pid = child.id();

        tracing::info!(
            session_id = %config.session_id,
            pid,
            program = %self.program.display(),
            "spawned detached daemon"
        );

        disown(child, &config.session_id);
        Ok(pid)
    }

    /// Zero-signal liveness probe. Alive-but-wedged still counts as running.
    pub fn is_running(pid: u32) -> bool {
        probe(pid)
    }

    /// Send SIGTERM to the daemon's whole process group.
    ///
    /// Returns `false` (and logs) when the signal could not be delivered,
    /// typically because the group already exited. Never escalates to SIGKILL.
    pub fn kill(pid: u32) -> bool {
        terminate(pid)
    }
}

/// Target passed to `kill(2)`: the negated pid addresses the process group.
#[cfg(unix)]
pub fn signal_target(pid: u32) -> Option<i32> {
    match i32::try_from(pid) {
        Ok(pid) if pid > 1 => Some(-pid),
        _ => None,
    }
}

#[cfg(not(unix))]
pub fn signal_target(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // New session: pgid == pid, and no controlling terminal to deliver SIGHUP
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

fn disown(mut child: Child, session_id: &str) {
    let pid = child.id();
    let session_id = session_id.to_string();
    let reaper = std::thread::Builder::new()
        .name(format!("daemon-reaper-{}", pid))
        .spawn(move || match child.wait() {
            Ok(status) => {
                tracing::debug!(%session_id, pid, %status, "daemon exited");
            }
            Err(e) => {
                tracing::warn!(%session_id, pid, error = %e, "failed to reap daemon");
            }
        });

    if let Err(e) = reaper {
        tracing::warn!(pid, error = %e, "could not start reaper thread; daemon left unreaped");
    }
}

#[cfg(unix)]
fn probe(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    let Some(target) = signal_target(pid) else {
        tracing::warn!(pid, "refusing to signal invalid pid");
        return false;
    };

    if unsafe { libc::kill(target, libc::SIGTERM) } == 0 {
        tracing::info!(pid, "sent SIGTERM to daemon process group");
        true
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(pid, error = %err, "failed to signal daemon process group");
        false
    }
}

#[cfg(windows)]
fn probe(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/NH", "/FO", "CSV", "/FI", &format!("PID eq {}", pid)])
        .output()
        .map(|out| tasklist_lists_pid(&String::from_utf8_lossy(&out.stdout), pid))
        .unwrap_or(false)
}

/// Whether CSV `tasklist` output has a row whose PID column is exactly `pid`
#[cfg(any(windows, test))]
fn tasklist_lists_pid(output: &str, pid: u32) -> bool {
    let pid = pid.to_string();
    output.lines().any(|line| {
        line.split(',')
            .nth(1)
            .map(|column| column.trim().trim_matches('"') == pid)
            .unwrap_or(false)
    })
}

#[cfg(windows)]
fn terminate(pid: u32) -> bool {
    // No process groups to signal; target the pid itself
    match Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::warn!(pid, %status, "taskkill failed");
            false
        }
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to run taskkill");
            false
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn probe(_pid: u32) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
fn terminate(pid: u32) -> bool {
    tracing::warn!(pid, "process termination unsupported on this platform");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::AgentType;
    use tempfile::TempDir;

    fn config_for(dir: &Path) -> SpawnConfig {
        SpawnConfig::new(
            "spawn-test",
            AgentType::Claude,
            "hello",
            dir,
            "http://127.0.0.1:1",
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_targets_process_group() {
        assert_eq!(signal_target(4242), Some(-4242));
        assert_eq!(signal_target(0), None);
        assert_eq!(signal_target(1), None);
        assert_eq!(signal_target(u32::MAX), None);
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let temp_dir = TempDir::new().unwrap();
        let spawner = DaemonSpawner::new(temp_dir.path().join("no-such-daemon"));

        let err = spawner.spawn(&config_for(temp_dir.path())).unwrap_err();
        match err {
            SpawnError::SpawnFailed { session_id, source } => {
                assert_eq!(session_id, "spawn-test");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("Expected SpawnFailed, got: {:?}", other),
        }
    }

    #[test]
    fn test_spawn_rejects_invalid_config_before_launch() {
        let spawner = DaemonSpawner::new("/bin/true");
        let mut config = config_for(Path::new("/tmp"));
        config.working_dir = PathBuf::from("relative");
        assert!(matches!(
            spawner.spawn(&config),
            Err(SpawnError::InvalidConfig(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_rejects_nonsense_pids() {
        assert!(!DaemonSpawner::is_running(0));
        assert!(!DaemonSpawner::is_running(u32::MAX));
        assert!(DaemonSpawner::is_running(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_of_unknown_group_returns_false() {
        // pid_max on Linux is at most 2^22, so this group cannot exist
        assert!(!DaemonSpawner::kill(0x7fff_fff0));
    }

    #[test]
    fn test_tasklist_pid_must_match_whole_column() {
        let output = concat!(
            "\"sleep.exe\",\"41234\",\"Console\",\"1\",\"1,234 K\"\r\n",
            "\"agent.exe\",\"12340\",\"Console\",\"1\",\"5,000 K\"\r\n",
        );
        assert!(!tasklist_lists_pid(output, 1234));
        assert!(tasklist_lists_pid(output, 12340));
        assert!(!tasklist_lists_pid("INFO: No tasks are running which match the specified criteria.", 1234));
    }
}
