//! Supervisor lifecycle events.

/// What happened to a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEventKind {
    /// The supervisor was enabled and (re)spawned its child.
    Started,
    /// The supervisor was disabled; a graceful stop is underway or done.
    Stopped,
    /// The child exited while enabled and was respawned.
    Restarted,
    /// The grace period expired and the child was force-killed.
    Killed,
}

/// A lifecycle event tagged with the owning unit's identifier.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub id: String,
    pub kind: SupervisorEventKind,
}
