//! Child-process control for flow runs.

use std::process::ExitStatus;
use std::time::Duration;

/// Errors from signalling a flow-run process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The process no longer exists; its run can be marked cancelled.
    #[error("unable to kill process {pid}: the process was not found")]
    NotFound { pid: u32 },

    #[error("sending signal {signal} to process {pid} failed")]
    Signal { pid: u32, signal: i32 },

    #[error("process control is not supported on this platform")]
    Unsupported,
}

/// Outcome of one flow-run child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRunnerResult {
    /// The OS pid, stringified.
    pub identifier: String,
    pub status_code: i32,
}

impl ProcessRunnerResult {
    pub fn succeeded(&self) -> bool {
        self.status_code == 0
    }
}

/// Terminate a process gracefully, then forcefully.
///
/// Sends SIGTERM, probes liveness with `kill(pid, 0)` every
/// `max(grace_seconds / 10, 1)` seconds, and escalates to SIGKILL once
/// `grace_seconds` elapse. A pid that is already gone reports
/// [`ProcessError::NotFound`] so callers can mark the run cancelled.
#[cfg(unix)]
pub async fn kill_process(pid: u32, grace_seconds: u64) -> Result<(), ProcessError> {
    // SAFETY: kill(2) with a pid we obtained from a spawned child; the
    // worst outcome of a stale pid is a failed or misdirected signal,
    // which errno reports.
    let sent = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if sent != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            return Err(ProcessError::NotFound { pid });
        }
        return Err(ProcessError::Signal {
            pid,
            signal: libc::SIGTERM,
        });
    }

    // Throttle liveness probes to keep the syscall rate low.
    let check_interval = Duration::from_secs((grace_seconds / 10).max(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(grace_seconds);

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(check_interval).await;

        // SAFETY: signal 0 performs existence and permission checks only.
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        if !alive {
            return Ok(());
        }
    }

    // Grace period expired without the process exiting.
    // SAFETY: see above; a failure here means the process exited between
    // the last probe and now, which is the outcome we wanted anyway.
    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    Ok(())
}

#[cfg(not(unix))]
pub async fn kill_process(_pid: u32, _grace_seconds: u64) -> Result<(), ProcessError> {
    Err(ProcessError::Unsupported)
}

/// Normalize an exit status to one integer: the exit code, or the negated
/// signal number for signal-terminated processes.
pub fn exit_status_code(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(windows)]
const STATUS_CONTROL_C_EXIT: i32 = 0xC000013Au32 as i32;

/// Operator guidance for well-known exit codes.
pub fn exit_code_help(status_code: i32) -> Option<&'static str> {
    match status_code {
        -9 => Some(
            "This indicates that the process exited due to a SIGKILL signal. Typically, this is \
             either caused by manual cancellation or high memory usage causing the operating \
             system to terminate the process.",
        ),
        -15 => Some(
            "This indicates that the process exited due to a SIGTERM signal. Typically, this is \
             caused by manual cancellation.",
        ),
        247 => Some("This indicates that the process was terminated due to high memory usage."),
        #[cfg(windows)]
        STATUS_CONTROL_C_EXIT => Some(
            "Process was terminated due to a Ctrl+C or Ctrl+Break signal. Typically, this is \
             caused by manual cancellation.",
        ),
        _ => None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn spawn_sleeper() -> tokio::process::Child {
        tokio::process::Command::new("sleep")
            .arg("3600")
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sleep")
    }

    #[tokio::test]
    async fn kill_terminates_a_live_process() {
        let mut child = spawn_sleeper().await;
        let pid = child.id().unwrap();

        kill_process(pid, 5).await.unwrap();

        let status = child.wait().await.unwrap();
        assert_eq!(exit_status_code(&status), -libc::SIGTERM);
    }

    #[tokio::test]
    async fn kill_reports_missing_process() {
        let mut child = spawn_sleeper().await;
        let pid = child.id().unwrap();
        child.kill().await.unwrap();
        child.wait().await.unwrap();

        let result = kill_process(pid, 5).await;
        assert!(matches!(result, Err(ProcessError::NotFound { .. })));
    }

    #[test]
    fn help_messages_cover_signal_exits() {
        assert!(exit_code_help(-9).is_some());
        assert!(exit_code_help(-15).is_some());
        assert!(exit_code_help(247).is_some());
        assert!(exit_code_help(0).is_none());
        assert!(exit_code_help(1).is_none());
    }
}
