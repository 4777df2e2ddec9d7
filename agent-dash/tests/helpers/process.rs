use std::thread;
use std::time::{Duration, Instant};

const INITIAL_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 500;

/// Kills a whole process group when dropped, so a failing test leaves no
/// detached daemons (or their children) behind.
pub struct ProcessGroupGuard {
    pgid: u32,
}

impl ProcessGroupGuard {
    pub fn new(pgid: u32) -> Self {
        Self { pgid }
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(-(self.pgid as i32), libc::SIGKILL);
        }
    }
}

/// Wait for a process to exit, used by tests to ensure no orphans remain.
pub fn wait_for_process_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);

    while is_process_running(pid) && start.elapsed() < timeout {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }

    !is_process_running(pid)
}

/// Liveness as a test cares about it: an exited-but-unreaped zombie is dead.
///
/// Grandchildren of a killed daemon get reparented to whatever reaps orphans
/// in the current environment (which may never do so inside a container).
#[cfg(target_os = "linux")]
pub fn is_process_running(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Format: "pid (comm) state ..."; comm may contain spaces or parens
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(true, |state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_process_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}
