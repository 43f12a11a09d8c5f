//! Signal delivery to supervised children.
//!
//! PID-based: the child handle is owned by the exit-monitor task, so all
//! termination goes through the OS by process id.

use appvisor_common::{SupervisorError, SupervisorResult};

/// Signals a caller may send to a running unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSignal {
    /// SIGTERM: polite termination request.
    Terminate,
    /// SIGINT: conventionally "reload your configuration" for units.
    Interrupt,
    /// SIGHUP.
    Hangup,
    /// SIGUSR1.
    User1,
    /// SIGUSR2.
    User2,
}

/// Send an arbitrary signal to a process.
#[cfg(unix)]
pub(crate) fn send(id: &str, pid: u32, signal: UnitSignal) -> SupervisorResult<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        UnitSignal::Terminate => Signal::SIGTERM,
        UnitSignal::Interrupt => Signal::SIGINT,
        UnitSignal::Hangup => Signal::SIGHUP,
        UnitSignal::User1 => Signal::SIGUSR1,
        UnitSignal::User2 => Signal::SIGUSR2,
    };
    kill(Pid::from_raw(pid as i32), sig)
        .map_err(|e| SupervisorError::signal_failed(id, e.to_string()))
}

/// Request graceful termination (SIGTERM).
#[cfg(unix)]
pub(crate) fn terminate_gracefully(id: &str, pid: u32) -> SupervisorResult<()> {
    send(id, pid, UnitSignal::Terminate)
}

/// Force kill (SIGKILL); the process gets no chance to clean up.
#[cfg(unix)]
pub(crate) fn force_kill(id: &str, pid: u32) -> SupervisorResult<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| SupervisorError::signal_failed(id, e.to_string()))
}

#[cfg(not(unix))]
pub(crate) fn send(id: &str, _pid: u32, _signal: UnitSignal) -> SupervisorResult<()> {
    Err(SupervisorError::signal_failed(id, "signals unsupported on this platform"))
}

#[cfg(not(unix))]
pub(crate) fn terminate_gracefully(id: &str, _pid: u32) -> SupervisorResult<()> {
    Err(SupervisorError::signal_failed(id, "signals unsupported on this platform"))
}

#[cfg(not(unix))]
pub(crate) fn force_kill(id: &str, _pid: u32) -> SupervisorResult<()> {
    Err(SupervisorError::signal_failed(id, "signals unsupported on this platform"))
}
