//! Per-device update session state.
//!
//! Each driver owns one [`SessionState`] and is its only mutator; the
//! orchestrator's polling loop reads concurrent snapshots. All fields are
//! simple atomics or small mutex-guarded scalars; there is no shared
//! structural mutation across threads.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::identity::ModuleType;

/// Phase of a device's update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdatePhase {
    /// Driver constructed, nothing sent yet.
    Idle = 0,
    /// Broadcasting identity requests, waiting for a target.
    Discovering = 1,
    /// Waiting for a warning packet announcing update readiness.
    WaitingForReady = 2,
    /// Waiting for the device to drop off the bus and re-enumerate.
    Reconnecting = 3,
    /// Driving erase/write/CRC page cycles.
    Flashing = 4,
    /// Committing the end-flash trailer.
    WritingTrailer = 5,
    /// Broadcasting the reboot command.
    Rebooting = 6,
    /// Terminal; success or failure per the recorded error.
    Done = 7,
}

impl UpdatePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Discovering,
            2 => Self::WaitingForReady,
            3 => Self::Reconnecting,
            4 => Self::Flashing,
            5 => Self::WritingTrailer,
            6 => Self::Rebooting,
            7 => Self::Done,
            _ => Self::Idle,
        }
    }
}

/// Shared mutable state of one update session.
#[derive(Debug, Default)]
pub struct SessionState {
    phase: AtomicU8,
    progress_current: AtomicU8,
    progress_total: AtomicU8,
    uuid: AtomicU64,
    stop: AtomicBool,
    module_type: Mutex<Option<ModuleType>>,
    error: Mutex<Option<String>>,
}

/// Read-only snapshot of a session, taken by the orchestrator each tick.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Current phase.
    pub phase: UpdatePhase,
    /// Progress of the module currently being flashed, 0-100.
    pub progress_current: u8,
    /// Progress of the whole session, 0-100.
    pub progress_total: u8,
    /// Target uuid once discovered.
    pub uuid: Option<u64>,
    /// Module type currently being flashed.
    pub module_type: Option<ModuleType>,
    /// Terminal error message, if the session failed.
    pub error: Option<String>,
}

impl SessionSnapshot {
    /// Whether the session reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.phase == UpdatePhase::Done
    }

    /// Whether the session finished without a fatal error.
    pub fn is_success(&self) -> bool {
        self.is_done() && self.error.is_none()
    }
}

impl SessionState {
    /// Fresh session in [`UpdatePhase::Idle`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> UpdatePhase {
        UpdatePhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    /// Enter a new phase.
    pub fn set_phase(&self, phase: UpdatePhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    /// Record per-module and whole-session progress (0-100 each).
    pub fn set_progress(&self, current: u8, total: u8) {
        self.progress_current
            .store(current.min(100), Ordering::Relaxed);
        self.progress_total.store(total.min(100), Ordering::Relaxed);
    }

    /// Record the discovered target uuid.
    pub fn set_uuid(&self, uuid: u64) {
        self.uuid.store(uuid, Ordering::Relaxed);
    }

    /// Record the module type currently being flashed.
    pub fn set_module_type(&self, module_type: ModuleType) {
        *self.lock(&self.module_type) = Some(module_type);
    }

    /// Terminate successfully.
    pub fn finish(&self) {
        self.set_progress(100, 100);
        self.set_phase(UpdatePhase::Done);
    }

    /// Terminate with an error message.
    pub fn fail(&self, message: impl Into<String>) {
        *self.lock(&self.error) = Some(message.into());
        self.set_phase(UpdatePhase::Done);
    }

    /// Ask the driver to stop; it observes the flag within one poll
    /// interval and records a terminal state before exiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough snapshot for progress reporting.
    pub fn snapshot(&self) -> SessionSnapshot {
        let uuid = self.uuid.load(Ordering::Relaxed);
        SessionSnapshot {
            phase: self.phase(),
            progress_current: self.progress_current.load(Ordering::Relaxed),
            progress_total: self.progress_total.load(Ordering::Relaxed),
            uuid: (uuid != 0).then_some(uuid),
            module_type: *self.lock(&self.module_type),
            error: self.lock(&self.error).clone(),
        }
    }

    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        let session = SessionState::new();
        assert_eq!(session.phase(), UpdatePhase::Idle);
        session.set_phase(UpdatePhase::Flashing);
        assert_eq!(session.phase(), UpdatePhase::Flashing);
    }

    #[test]
    fn test_snapshot_terminal_states() {
        let session = SessionState::new();
        session.set_uuid(0x2030_0000_0ABC);
        session.finish();
        let snapshot = session.snapshot();
        assert!(snapshot.is_done());
        assert!(snapshot.is_success());
        assert_eq!(snapshot.uuid, Some(0x2030_0000_0ABC));
        assert_eq!(snapshot.progress_total, 100);

        let failed = SessionState::new();
        failed.fail("Response timed-out");
        let snapshot = failed.snapshot();
        assert!(snapshot.is_done());
        assert!(!snapshot.is_success());
        assert_eq!(snapshot.error.as_deref(), Some("Response timed-out"));
    }

    #[test]
    fn test_progress_saturates() {
        let session = SessionState::new();
        session.set_progress(130, 250);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.progress_current, 100);
        assert_eq!(snapshot.progress_total, 100);
    }

    #[test]
    fn test_stop_flag() {
        let session = SessionState::new();
        assert!(!session.stop_requested());
        session.request_stop();
        assert!(session.stop_requested());
    }
}
