//! Platform split for process signaling.
//!
//! Everything OS-specific about supervised children lives behind
//! [`Platform`]: process-group creation at spawn, the graceful termination
//! signal, forced group kill, and a cheap liveness check. The supervisor
//! itself never branches on the OS.

use std::io;
use tokio::process::Command;

pub trait Platform {
    /// Arrange for the child to lead its own process group (or job object),
    /// so the whole tree can be signaled as a unit.
    fn prepare(cmd: &mut Command);

    /// Platform-appropriate graceful termination of the child's group.
    fn signal_graceful(pid: u32) -> io::Result<()>;

    /// Forced kill of the whole group.
    fn kill_group(pid: u32) -> io::Result<()>;

    /// Cheap liveness probe.
    fn alive(pid: u32) -> bool;
}

#[cfg(unix)]
pub use unix::UnixPlatform as ActivePlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform as ActivePlatform;

#[cfg(unix)]
mod unix {
    use super::Platform;
    use std::io;
    use tokio::process::Command;

    pub struct UnixPlatform;

    impl Platform for UnixPlatform {
        fn prepare(cmd: &mut Command) {
            // New session → new process group, led by the child.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        fn signal_graceful(pid: u32) -> io::Result<()> {
            signal_group(pid, libc::SIGTERM)
        }

        fn kill_group(pid: u32) -> io::Result<()> {
            signal_group(pid, libc::SIGKILL)
        }

        fn alive(pid: u32) -> bool {
            // POSIX: signal 0 probes existence without delivering anything.
            unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
        }
    }

    fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
        // Negative PID addresses the whole process group.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::Platform;
    use std::io;
    use tokio::process::Command;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub struct WindowsPlatform;

    impl Platform for WindowsPlatform {
        fn prepare(cmd: &mut Command) {
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        fn signal_graceful(pid: u32) -> io::Result<()> {
            // Closest equivalent to SIGTERM: ask the tree to close.
            taskkill(pid, false)
        }

        fn kill_group(pid: u32) -> io::Result<()> {
            taskkill(pid, true)
        }

        fn alive(pid: u32) -> bool {
            // No cheap probe without extra win32 plumbing; exits are caught
            // by the supervisor's wait on the child handle.
            let _ = pid;
            true
        }
    }

    fn taskkill(pid: u32, force: bool) -> io::Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.arg("/T").arg("/PID").arg(pid.to_string());
        if force {
            cmd.arg("/F");
        }
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn alive_detects_own_process() {
        assert!(ActivePlatform::alive(std::process::id()));
    }

    #[test]
    fn alive_rejects_unlikely_pid() {
        // PID max on Linux defaults to 4194304; this one is far beyond it.
        assert!(!ActivePlatform::alive(999_999_999));
    }
}
