//! Process-group helpers for reliable child cleanup.
//!
//! Every sandboxed child starts its own session (`detach_from_tty` in
//! `pre_exec`), so its pid doubles as the process-group id and a single
//! `killpg` reaches the whole tree. On Linux the child also gets
//! `PR_SET_PDEATHSIG` so it does not outlive the engine.

use std::io;

/// Signal to send when terminating a process group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGINT - interrupt (Ctrl+C equivalent)
    Int,
    /// SIGTERM - allows graceful shutdown
    #[default]
    Term,
    /// SIGKILL - immediate termination
    Kill,
}

impl KillSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            KillSignal::Int => "SIGINT",
            KillSignal::Term => "SIGTERM",
            KillSignal::Kill => "SIGKILL",
        }
    }

    /// Raw signal number, as reported in wait statuses.
    #[cfg(unix)]
    pub fn number(self) -> i32 {
        self.as_nix() as i32
    }

    #[cfg(not(unix))]
    pub fn number(self) -> i32 {
        match self {
            KillSignal::Int => 2,
            KillSignal::Term => 15,
            KillSignal::Kill => 9,
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            KillSignal::Int => Signal::SIGINT,
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// How a staged termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process had exited before any signal was sent.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// SIGKILL was needed.
    Forced,
}

impl TerminationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationOutcome::AlreadyExited => "already_exited",
            TerminationOutcome::Graceful => "graceful",
            TerminationOutcome::Forced => "forced",
        }
    }
}

/// Ensure the child receives SIGTERM when the original parent dies.
///
/// Runs in `pre_exec`; `parent_pid` is captured before spawn so a parent that
/// exits between fork and exec is still noticed.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }

    Ok(())
}

/// No-op on non-Linux platforms.
#[cfg(not(target_os = "linux"))]
pub fn set_parent_death_signal(_parent_pid: i32) -> io::Result<()> {
    Ok(())
}

/// Start a new session so the child leads its own process group and has no
/// controlling terminal.
#[cfg(unix)]
pub fn detach_from_tty() -> io::Result<()> {
    let result = unsafe { libc::setsid() };
    if result == -1 {
        let err = io::Error::last_os_error();
        // EPERM means we're already a session leader, fall back to setpgid
        if err.raw_os_error() == Some(libc::EPERM) {
            return set_process_group();
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn detach_from_tty() -> io::Result<()> {
    Ok(())
}

/// Put the calling process into its own process group.
#[cfg(unix)]
pub fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn set_process_group() -> io::Result<()> {
    Ok(())
}

/// Send `signal` to the process group led by `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: KillSignal) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("pid {pgid} out of range"),
        ));
    };
    if raw <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {raw}"),
        ));
    }

    match killpg(Pid::from_raw(raw), signal.as_nix()) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _signal: KillSignal) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups require a unix host",
    ))
}

/// Whether any member of the process group led by `pgid` is still alive.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    raw > 1 && killpg(Pid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_signal_defaults_to_term() {
        assert_eq!(KillSignal::default(), KillSignal::Term);
        assert_eq!(KillSignal::Kill.as_str(), "SIGKILL");
    }

    #[cfg(unix)]
    #[test]
    fn signal_numbers_match_libc() {
        assert_eq!(KillSignal::Term.number(), libc::SIGTERM);
        assert_eq!(KillSignal::Kill.number(), libc::SIGKILL);
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_missing_group_reports_absence() -> io::Result<()> {
        assert!(!signal_group(2_000_000_000, KillSignal::Term)?);
        assert!(!group_alive(2_000_000_000));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn init_group_is_never_signalled() {
        assert!(signal_group(1, KillSignal::Kill).is_err());
        assert!(signal_group(0, KillSignal::Kill).is_err());
    }

    #[test]
    fn termination_outcome_labels() {
        assert_eq!(TerminationOutcome::Forced.as_str(), "forced");
        assert_eq!(TerminationOutcome::AlreadyExited.as_str(), "already_exited");
    }
}
