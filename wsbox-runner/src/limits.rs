use std::io;
use std::time::Duration;

/// Per-launch resource limits. `None` leaves the inherited limit in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// RLIMIT_CPU, in seconds of CPU time.
    pub cpu_time_secs: Option<u64>,
    /// Upper bound on wall-clock time, enforced by the caller's timer.
    pub wall_time: Option<Duration>,
    /// RLIMIT_AS, in bytes.
    pub memory_bytes: Option<u64>,
    /// RLIMIT_NOFILE.
    pub open_files: Option<u64>,
    /// RLIMIT_NPROC.
    pub processes: Option<u64>,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.cpu_time_secs.is_none()
            && self.wall_time.is_none()
            && self.memory_bytes.is_none()
            && self.open_files.is_none()
            && self.processes.is_none()
    }

    /// The tighter of `requested` and the wall-time limit.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match (requested, self.wall_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply the rlimits to the calling process.
    ///
    /// Only calls `setrlimit`, so it is safe to run from a `pre_exec` hook.
    #[cfg(unix)]
    pub fn apply_to_current_process(&self) -> io::Result<()> {
        if let Some(secs) = self.cpu_time_secs {
            set_limit(libc::RLIMIT_CPU, secs)?;
        }
        if let Some(bytes) = self.memory_bytes {
            set_limit(libc::RLIMIT_AS, bytes)?;
        }
        if let Some(files) = self.open_files {
            set_limit(libc::RLIMIT_NOFILE, files)?;
        }
        if let Some(procs) = self.processes {
            set_limit(libc::RLIMIT_NPROC, procs)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_to_current_process(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type Resource = libc::c_int;

#[cfg(unix)]
fn set_limit(resource: Resource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_unlimited() {
        assert!(ResourceLimits::default().is_unlimited());
    }

    #[test]
    fn effective_timeout_takes_the_tighter_bound() {
        let limits = ResourceLimits {
            wall_time: Some(Duration::from_secs(10)),
            ..ResourceLimits::default()
        };
        assert_eq!(
            limits.effective_timeout(Some(Duration::from_secs(60))),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            limits.effective_timeout(Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            ResourceLimits::default().effective_timeout(None),
            None
        );
    }
}
