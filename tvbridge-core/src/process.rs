//! Child-process plumbing shared by the recorded transcode engine and the
//! live stream worker: the launcher seam tests hook into, and graceful
//! termination with a bounded grace window.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::warn;

/// Seam for spawning the external transcoder. The system implementation
/// runs the configured binary; tests substitute something cheaper.
pub trait TranscodeLauncher: Send + Sync {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child>;
}

#[derive(Debug, Default)]
pub struct FfmpegLauncher;

impl TranscodeLauncher for FfmpegLauncher {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Ask the child to exit, escalating after the grace window. SIGTERM lets
/// the transcoder flush its playlist; the hard kill is the backstop.
pub async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(error = %err, "error waiting for transcoder exit"),
        Err(_) => {
            warn!("transcoder ignored termination signal, killing");
            let _ = child.kill().await;
        }
    }
}
