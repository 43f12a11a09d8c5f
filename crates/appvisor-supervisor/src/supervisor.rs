//! The per-unit process state machine.
//!
//! State is derived from two facts guarded by one lock: the `enabled`
//! intent and the live child pid. The child handle itself is moved into
//! an exit-monitor task at spawn time, so termination is PID-based.
//! Invariant: a child is only spawned while enabled and with no live pid,
//! so at most one process is ever alive per supervisor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use appvisor_common::{SupervisorError, SupervisorResult};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{SupervisorEvent, SupervisorEventKind};
use crate::log_writer::{pump_stream, UnitLogWriter};
use crate::signals::{self, UnitSignal};

/// Delay between an unexpected exit and the respawn attempt. Fixed: no
/// backoff growth and no retry ceiling.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// How long a graceful stop waits before escalating to a forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Static definition of the supervised process.
#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    /// Identifier used in events, errors, and log fields.
    pub id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub log_path: PathBuf,
    pub restart_delay: Duration,
    pub grace_period: Duration,
}

impl SupervisorSpec {
    pub fn new(
        id: impl Into<String>,
        program: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            log_path: log_path.into(),
            restart_delay: DEFAULT_RESTART_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Observable supervisor state, derived from `enabled` × live-pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Disabled, nothing alive.
    Stopped,
    /// Enabled with a live child.
    Running,
    /// Disabled but the child has not exited yet (grace period running).
    Stopping,
    /// Enabled with no live child; the restart timer is armed.
    RestartScheduled,
}

/// Supervises one external child process.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

struct Shared {
    spec: SupervisorSpec,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

#[derive(Default)]
struct Inner {
    enabled: bool,
    pid: Option<u32>,
    restart_timer: Option<JoinHandle<()>>,
    kill_timer: Option<JoinHandle<()>>,
    /// One-shot override for the next restart delay; a soft restart sets
    /// it to zero so the respawn is immediate.
    next_restart_delay: Option<Duration>,
}

impl ProcessSupervisor {
    pub fn new(spec: SupervisorSpec, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                spec,
                inner: Mutex::new(Inner::default()),
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.spec.id
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.inner.lock().enabled
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.inner.lock().pid
    }

    pub fn state(&self) -> SupervisorState {
        let inner = self.shared.inner.lock();
        match (inner.enabled, inner.pid) {
            (true, Some(_)) => SupervisorState::Running,
            (true, None) => SupervisorState::RestartScheduled,
            (false, Some(_)) => SupervisorState::Stopping,
            (false, None) => SupervisorState::Stopped,
        }
    }

    /// Mark the process as supposed-to-run and spawn it.
    ///
    /// Fails with `AlreadyRunning` when already enabled. If a previous
    /// child is still draining its grace period, the spawn is deferred to
    /// the exit-observation path rather than violating the
    /// one-live-process invariant.
    pub fn start(&self) -> SupervisorResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.enabled {
            return Err(SupervisorError::already_running(self.id()));
        }
        inner.enabled = true;
        if inner.pid.is_none() {
            self.spawn_child(&mut inner);
        } else {
            debug!(unit = %self.id(), "previous child still exiting; respawn deferred");
        }
        self.emit(SupervisorEventKind::Started);
        Ok(())
    }

    /// Request a graceful stop.
    ///
    /// Sends SIGTERM, cancels any pending restart, and arms the grace
    /// timer; if the child has not exited when it fires, it is
    /// force-killed. A stop while a grace timer is already armed still
    /// records the disable and cancels any pending restart, but does not
    /// re-arm the timer. Fails with `NotRunning` only when fully stopped
    /// and disabled.
    pub fn stop(&self) -> SupervisorResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.kill_timer.is_some() {
            // The grace timer stays armed, but the disable must still be
            // recorded or a deferred respawn would outlive this stop.
            debug!(unit = %self.id(), "stop already in progress");
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            if inner.enabled {
                inner.enabled = false;
                self.emit(SupervisorEventKind::Stopped);
            }
            return Ok(());
        }
        if let Some(pid) = inner.pid {
            if let Err(err) = signals::terminate_gracefully(self.id(), pid) {
                warn!(unit = %self.id(), pid, %err, "failed to send termination signal");
            }
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            inner.enabled = false;
            self.arm_kill_timer(&mut inner, pid);
        } else if inner.enabled {
            // The child already died and a restart is pending; just
            // cancel it.
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            inner.enabled = false;
        } else {
            return Err(SupervisorError::not_running(self.id()));
        }
        self.emit(SupervisorEventKind::Stopped);
        Ok(())
    }

    /// Soft restart: signal the running child without toggling intent.
    ///
    /// The child is expected to exit (or reload) on its own; the crash
    /// recovery path respawns it immediately because the next restart
    /// delay is zeroed. Valid only while enabled with a live child.
    pub fn restart(&self, signal: UnitSignal) -> SupervisorResult<()> {
        let mut inner = self.shared.inner.lock();
        if !inner.enabled {
            return Err(SupervisorError::not_running(self.id()));
        }
        let pid = inner
            .pid
            .ok_or_else(|| SupervisorError::not_running(self.id()))?;
        signals::send(self.id(), pid, signal)?;
        inner.next_restart_delay = Some(Duration::ZERO);
        debug!(unit = %self.id(), pid, ?signal, "soft restart signalled");
        Ok(())
    }

    fn emit(&self, kind: SupervisorEventKind) {
        let _ = self.shared.events.send(SupervisorEvent {
            id: self.shared.spec.id.clone(),
            kind,
        });
    }

    /// Spawn the child and wire up log pumps and the exit monitor.
    /// Caller holds the lock and guarantees `pid` is empty.
    fn spawn_child(&self, inner: &mut Inner) {
        let spec = &self.shared.spec;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    unit = %self.id(),
                    program = %spec.program.display(),
                    %err,
                    "failed to spawn child; scheduling retry"
                );
                self.schedule_restart(inner);
                return;
            }
        };
        // A missing pid means the child is already gone; never fall back
        // to pid 0, which kill(2) reads as the whole process group.
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                warn!(unit = %self.id(), "child had no pid at spawn; scheduling retry");
                self.schedule_restart(inner);
                return;
            }
        };
        inner.pid = Some(pid);
        info!(unit = %self.id(), pid, "child process spawned");

        let writer = UnitLogWriter::new(&spec.log_path);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(spec.id.clone(), writer.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(spec.id.clone(), writer, stderr));
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!(unit = %supervisor.id(), pid, ?status, "child exited");
            supervisor.on_child_exit(pid);
        });
    }

    /// Exit observation. Clears the pid, cancels a pending forced kill,
    /// and schedules a respawn when the exit was unexpected.
    fn on_child_exit(&self, pid: u32) {
        let mut inner = self.shared.inner.lock();
        if inner.pid != Some(pid) {
            return;
        }
        inner.pid = None;
        if let Some(timer) = inner.kill_timer.take() {
            timer.abort();
        }
        if inner.enabled {
            self.schedule_restart(&mut inner);
        }
    }

    /// Arm the restart timer. On expiry the respawn happens only if the
    /// supervisor is still enabled with nothing alive.
    fn schedule_restart(&self, inner: &mut Inner) {
        if let Some(timer) = inner.restart_timer.take() {
            timer.abort();
        }
        let delay = inner
            .next_restart_delay
            .take()
            .unwrap_or(self.shared.spec.restart_delay);
        let supervisor = self.clone();
        inner.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = supervisor.shared.inner.lock();
            inner.restart_timer = None;
            if inner.enabled && inner.pid.is_none() {
                supervisor.spawn_child(&mut inner);
                supervisor.emit(SupervisorEventKind::Restarted);
            }
        }));
    }

    /// Arm the grace timer for a stop; "brutalize" the child if it is
    /// still the live one when the timer fires.
    fn arm_kill_timer(&self, inner: &mut Inner, pid: u32) {
        let grace = self.shared.spec.grace_period;
        let supervisor = self.clone();
        inner.kill_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut inner = supervisor.shared.inner.lock();
            inner.kill_timer = None;
            if inner.pid == Some(pid) {
                warn!(unit = %supervisor.id(), pid, "grace period expired; force killing");
                if let Err(err) = signals::force_kill(supervisor.id(), pid) {
                    warn!(unit = %supervisor.id(), pid, %err, "force kill failed");
                }
                supervisor.emit(SupervisorEventKind::Killed);
            }
        }));
    }
}
