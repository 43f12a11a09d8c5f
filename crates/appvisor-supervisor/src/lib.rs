//! Per-unit child-process supervision.
//!
//! A [`ProcessSupervisor`] owns exactly one external process definition
//! (program, working directory, environment, log destination) and its
//! execution state. It provides start, graceful stop with forced-kill
//! escalation, soft restart by signal, and fixed-delay crash recovery.
//! Lifecycle transitions are emitted as [`SupervisorEvent`]s over an
//! mpsc channel supplied at construction, so the owning unit can observe
//! and log them.

mod events;
mod log_writer;
mod signals;
mod supervisor;

pub use events::{SupervisorEvent, SupervisorEventKind};
pub use log_writer::UnitLogWriter;
pub use signals::UnitSignal;
pub use supervisor::{
    ProcessSupervisor, SupervisorSpec, SupervisorState, DEFAULT_GRACE_PERIOD,
    DEFAULT_RESTART_DELAY,
};
