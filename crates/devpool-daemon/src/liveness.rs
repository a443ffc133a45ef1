//! Client process liveness checks
//!
//! Lease owners are identified by pid. A probe answers whether that pid is
//! still alive at the moment of the call; it is not a fence.

/// Point-in-time process liveness check
pub trait ProcessProbe: Send + Sync {
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_process_alive(&self, pid: u32) -> bool {
        let pid_t: libc::pid_t = match pid.try_into() {
            Ok(0) | Err(_) => return false,
            Ok(pid_t) => pid_t,
        };

        // Signal 0 performs the permission and existence checks only
        if unsafe { libc::kill(pid_t, 0) } == 0 {
            return true;
        }

        // EPERM: the process exists but belongs to another user
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(windows)]
    fn is_process_alive(&self, pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{}\"", pid)))
            .unwrap_or(false)
    }
}
