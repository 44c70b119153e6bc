//! Platform-specific termination of a plugin child process.
//!
//! - **Linux/macOS**: sends SIGTERM, waits up to the grace period, then SIGKILL
//! - **Windows**: kills immediately

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            debug!("Sending SIGTERM to plugin process {}", pid);
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                        debug!("Plugin process {} terminated gracefully", pid);
                        return status;
                    }
                    debug!("Plugin process {} still running, sending SIGKILL", pid);
                }
                Err(nix::errno::Errno::ESRCH) => return child.wait().await,
                Err(e) => debug!("Failed to send SIGTERM to {}: {}", pid, e),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    debug!("Killing plugin process {:?}", child.id());
    child.kill().await?;
    child.wait().await
}
