//! Process helpers for engines that drive an external tool.
//!
//! Child processes are spawned without a console window on Windows, controlled
//! through commands written to their standard input, and reaped with a bounded
//! wait so a stuck tool cannot hold a capture job forever.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// First line of `<program> -version`, if the program can be executed.
pub fn probe_version(program: impl AsRef<OsStr>) -> Option<String> {
    std_command(program)
        .arg("-version")
        .output()
        .ok()
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        })
        .filter(|line| !line.is_empty())
}

#[cfg(feature = "tokio")]
pub use self::control::{WaitOutcome, send_command, tokio_command, wait_or_kill};

#[cfg(feature = "tokio")]
mod control {
    use std::ffi::OsStr;
    use std::io;
    use std::process::ExitStatus;
    use std::time::Duration;

    use tokio::io::{AsyncWrite, AsyncWriteExt};
    use tokio::process::Child;

    use super::NoWindowExt;

    impl NoWindowExt for tokio::process::Command {
        fn no_window(&mut self) {
            #[cfg(windows)]
            {
                use std::os::windows::process::CommandExt;
                self.as_std_mut().creation_flags(super::CREATE_NO_WINDOW);
            }
        }
    }

    /// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
    ///
    /// On Unix the child gets its own process group, so a terminal Ctrl-C
    /// reaches only the parent and the child is stopped through its control
    /// channel instead.
    pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.no_window();
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }

    /// Write a control command (e.g. ffmpeg's `q\n`) to a child's stdin and flush it.
    pub async fn send_command<W>(stdin: &mut W, command: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stdin.write_all(command).await?;
        stdin.flush().await
    }

    /// How a bounded wait on a child process ended.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WaitOutcome {
        /// The process exited on its own within the timeout.
        Exited(ExitStatus),
        /// The timeout elapsed and the process was killed.
        Killed(ExitStatus),
    }

    impl WaitOutcome {
        /// Exit status regardless of how the process ended.
        pub fn status(&self) -> ExitStatus {
            match self {
                Self::Exited(status) | Self::Killed(status) => *status,
            }
        }

        /// True only when the process exited by itself with code 0.
        pub fn is_clean(&self) -> bool {
            matches!(self, Self::Exited(status) if status.success())
        }
    }

    /// Wait for `child` to exit, killing it once `timeout` elapses.
    pub async fn wait_or_kill(child: &mut Child, timeout: Duration) -> io::Result<WaitOutcome> {
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map(WaitOutcome::Exited),
            Err(_) => {
                child.kill().await?;
                child.wait().await.map(WaitOutcome::Killed)
            }
        }
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn wait_reports_exit_code() {
        let mut child = tokio_command("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let outcome = wait_or_kill(&mut child, Duration::from_secs(5)).await.unwrap();

        assert!(matches!(outcome, WaitOutcome::Exited(_)));
        assert_eq!(outcome.status().code(), Some(3));
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn wait_kills_after_timeout() {
        let mut child = tokio_command("sleep").arg("10").spawn().unwrap();
        let outcome = wait_or_kill(&mut child, Duration::from_millis(50)).await.unwrap();

        assert!(matches!(outcome, WaitOutcome::Killed(_)));
        assert!(!outcome.is_clean());
    }

    /// Process group id from `/proc/<pid>/stat`.
    #[cfg(target_os = "linux")]
    fn pgrp(pid: &str) -> u32 {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        // Fields after the parenthesised command name: state, ppid, pgrp.
        let rest = &stat[stat.rfind(')').unwrap() + 1..];
        rest.split_whitespace().nth(2).unwrap().parse().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn child_leaves_terminal_process_group() {
        let mut child = tokio_command("sleep").arg("5").spawn().unwrap();
        let pid = child.id().unwrap();

        let child_group = pgrp(&pid.to_string());
        let own_group = pgrp("self");
        child.kill().await.unwrap();

        assert_eq!(child_group, pid);
        assert_ne!(child_group, own_group);
    }

    #[tokio::test]
    async fn interrupt_reaches_child_through_its_own_group() {
        let mut child = tokio_command("sh")
            .args(["-c", "trap 'exit 255' INT; echo ready; while :; do sleep 0.05; done"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let mut ready = [0u8; 6];
        child.stdout.take().unwrap().read_exact(&mut ready).await.unwrap();

        // A group with the child's pid only exists when the child leads it.
        let status = tokio_command("kill")
            .args(["-s", "INT", "--", &format!("-{pid}")])
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let outcome = wait_or_kill(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.status().code(), Some(255));
    }

    #[tokio::test]
    async fn command_reaches_child_stdin() {
        let mut child = tokio_command("sh")
            .args(["-c", "read line; echo \"got:$line\""])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let mut stdin = child.stdin.take().unwrap();
        send_command(&mut stdin, b"q\n").await.unwrap();
        drop(stdin);

        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
        let outcome = wait_or_kill(&mut child, Duration::from_secs(5)).await.unwrap();

        assert_eq!(out.trim(), "got:q");
        assert!(outcome.is_clean());
    }
}
