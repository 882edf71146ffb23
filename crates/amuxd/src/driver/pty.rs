//! Direct pseudoterminal backend.
//!
//! Forks the agent as a child of the supervisor with the PTY master owned
//! by this process. A blocking reader thread polls the master and pushes
//! output into the supervisor's channel; child exit is reported the same
//! way, with the real exit code.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use amux_core::SessionId;

use super::{DriverError, DriverEvent};

/// Poll granularity for the reader thread.
const READ_POLL_MS: u16 = 100;

/// A child agent process attached to a supervisor-owned PTY.
pub struct PtySession {
    master: OwnedFd,
    child: Pid,
}

impl PtySession {
    /// Spawns the agent in a fresh PTY with the given dimensions, working
    /// directory, and (already scrubbed) environment.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
        env: &[(String, String)],
    ) -> Result<Self, DriverError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let pty = openpty(Some(&winsize), None)
            .map_err(|e| DriverError::Spawn {
                reason: format!("openpty: {e}"),
            })?;

        // Safety: standard fork-then-exec; the child only calls
        // async-signal-safe operations before execvpe.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);

                let _ = unistd::setsid();
                unsafe {
                    libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0);
                }

                let _ = unistd::dup2(pty.slave.as_raw_fd(), libc::STDIN_FILENO);
                let _ = unistd::dup2(pty.slave.as_raw_fd(), libc::STDOUT_FILENO);
                let _ = unistd::dup2(pty.slave.as_raw_fd(), libc::STDERR_FILENO);
                drop(pty.slave);

                let _ = unistd::chdir(cwd);

                // Exec failures exit 127, mirroring shell convention.
                fn exec_failure() -> ! {
                    std::process::exit(127)
                }

                let Ok(c_command) = CString::new(command) else {
                    exec_failure()
                };
                let mut c_args = vec![c_command.clone()];
                for arg in args {
                    match CString::new(arg.as_str()) {
                        Ok(a) => c_args.push(a),
                        Err(_) => exec_failure(),
                    }
                }
                let mut c_env = Vec::with_capacity(env.len() + 1);
                for (key, value) in env {
                    match CString::new(format!("{key}={value}")) {
                        Ok(kv) => c_env.push(kv),
                        Err(_) => exec_failure(),
                    }
                }
                if let Ok(term) = CString::new("TERM=xterm-256color") {
                    if !env.iter().any(|(k, _)| k == "TERM") {
                        c_env.push(term);
                    }
                }

                let _ = unistd::execvpe(&c_command, &c_args, &c_env);
                exec_failure()
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);

                // Non-blocking master for the poll-driven reader.
                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| DriverError::Spawn {
                        reason: format!("fcntl F_GETFL: {e}"),
                    })?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| DriverError::Spawn {
                    reason: format!("fcntl F_SETFL: {e}"),
                })?;

                Ok(Self {
                    master: pty.master,
                    child,
                })
            }
            Err(e) => Err(DriverError::Spawn {
                reason: format!("fork: {e}"),
            }),
        }
    }

    /// The agent's process id.
    pub fn pid(&self) -> u32 {
        self.child.as_raw() as u32
    }

    /// Duplicates the master for use off the supervisor task (writes run
    /// on blocking helper threads).
    pub fn writer(&self) -> Result<PtyWriter, DriverError> {
        Ok(PtyWriter {
            fd: dup_fd(self.master.as_raw_fd())?,
        })
    }

    /// Propagates new dimensions to the PTY. Returns whether the kernel
    /// accepted the resize.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        let ws = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws)
        };
        rc == 0
    }

    /// Terminates the child. Natural exit and kill are reported through
    /// the same reader-thread exit event.
    pub fn terminate(&self) {
        if let Err(e) = signal::kill(self.child, Signal::SIGTERM) {
            debug!(pid = self.pid(), error = %e, "SIGTERM failed (already gone?)");
        }
    }

    /// Spawns the blocking reader thread. Output chunks and the final exit
    /// notification are pushed into `tx` in production order.
    pub fn spawn_reader(
        &self,
        session_id: SessionId,
        tx: mpsc::Sender<DriverEvent>,
    ) -> Result<(), DriverError> {
        let master = dup_fd(self.master.as_raw_fd())?;
        let child = self.child;

        std::thread::Builder::new()
            .name(format!("pty-read-{session_id}"))
            .spawn(move || read_loop(master, child, session_id, tx))
            .map_err(|e| DriverError::Command {
                reason: format!("reader thread: {e}"),
            })?;

        Ok(())
    }
}

/// Duplicates a descriptor into an owned handle.
fn dup_fd(fd: std::os::fd::RawFd) -> Result<OwnedFd, DriverError> {
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(DriverError::Command {
            reason: format!("dup: {}", std::io::Error::last_os_error()),
        });
    }
    // Safety: dup returned a fresh, owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

/// Write half of a PTY, safe to move onto a blocking task.
pub struct PtyWriter {
    fd: OwnedFd,
}

impl PtyWriter {
    /// Writes all bytes, retrying briefly on a full kernel buffer.
    pub fn write_all(&self, data: &[u8]) -> Result<(), DriverError> {
        let mut written = 0;
        while written < data.len() {
            match unistd::write(self.fd.as_fd(), &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    return Err(DriverError::Command {
                        reason: format!("pty write: {e}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Blocking read loop: poll the master, push output, report exit.
fn read_loop(
    master: OwnedFd,
    child: Pid,
    session_id: SessionId,
    tx: mpsc::Sender<DriverEvent>,
) {
    let mut buf = [0u8; 65536];

    loop {
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(READ_POLL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(%session_id, error = %e, "pty poll failed");
                break;
            }
        }

        match unistd::read(master.as_raw_fd(), &mut buf) {
            Ok(0) => break, // EOF: child closed the slave
            Ok(n) => {
                let event = DriverEvent::Output {
                    session_id: session_id.clone(),
                    bytes: buf[..n].to_vec(),
                };
                if tx.blocking_send(event).is_err() {
                    return; // supervisor gone
                }
            }
            Err(nix::errno::Errno::EAGAIN) => continue,
            // EIO on the master means the child exited.
            Err(nix::errno::Errno::EIO) => break,
            Err(e) => {
                warn!(%session_id, error = %e, "pty read failed");
                break;
            }
        }
    }

    let exit_code = wait_for_exit(child);
    debug!(%session_id, ?exit_code, "pty child exited");
    let _ = tx.blocking_send(DriverEvent::Exited {
        session_id,
        exit_code,
    });
}

/// Reaps the child and maps its status to an exit code (negative for
/// signal termination).
fn wait_for_exit(child: Pid) -> Option<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Some(-(sig as i32)),
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => return None, // already reaped
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env() -> Vec<(String, String)> {
        vec![("PATH".to_string(), "/usr/bin:/bin".to_string())]
    }

    #[tokio::test]
    async fn spawn_streams_output_and_exit() {
        let session = PtySession::spawn(
            "/bin/echo",
            &["hello pty".to_string()],
            &PathBuf::from("/tmp"),
            80,
            24,
            &env(),
        )
        .expect("spawn failed");

        let (tx, mut rx) = mpsc::channel(64);
        session
            .spawn_reader(SessionId::new("ab12cd34"), tx)
            .unwrap();

        let mut output = Vec::new();
        let mut exit_code = None;
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for pty events")
        {
            match event {
                DriverEvent::Output { bytes, .. } => output.extend(bytes),
                DriverEvent::Exited { exit_code: code, .. } => {
                    exit_code = code;
                    break;
                }
            }
        }

        assert!(String::from_utf8_lossy(&output).contains("hello pty"));
        assert_eq!(exit_code, Some(0));
    }

    #[tokio::test]
    async fn write_reaches_the_child() {
        let session = PtySession::spawn(
            "/bin/cat",
            &[],
            &PathBuf::from("/tmp"),
            80,
            24,
            &env(),
        )
        .expect("spawn failed");

        let (tx, mut rx) = mpsc::channel(64);
        session
            .spawn_reader(SessionId::new("ab12cd34"), tx)
            .unwrap();

        let writer = session.writer().unwrap();
        writer.write_all(b"ping\r").unwrap();

        let mut echoed = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for echo")
                .expect("channel closed");
            if let DriverEvent::Output { bytes, .. } = event {
                echoed.extend(bytes);
                if String::from_utf8_lossy(&echoed).contains("ping") {
                    break;
                }
            }
        }

        session.terminate();
    }

    #[tokio::test]
    async fn terminate_reports_signal_exit() {
        let session = PtySession::spawn(
            "/bin/cat",
            &[],
            &PathBuf::from("/tmp"),
            80,
            24,
            &env(),
        )
        .expect("spawn failed");

        let (tx, mut rx) = mpsc::channel(64);
        session
            .spawn_reader(SessionId::new("ab12cd34"), tx)
            .unwrap();

        session.terminate();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for exit")
                .expect("channel closed");
            if let DriverEvent::Exited { exit_code, .. } = event {
                // SIGTERM termination surfaces as a negative code.
                assert_eq!(exit_code, Some(-(Signal::SIGTERM as i32)));
                break;
            }
        }
    }

    #[test]
    fn resize_is_accepted() {
        let session = PtySession::spawn(
            "/bin/cat",
            &[],
            &PathBuf::from("/tmp"),
            80,
            24,
            &env(),
        )
        .expect("spawn failed");
        assert!(session.resize(120, 40));
        session.terminate();
        let _ = wait_for_exit(session.child);
    }
}
