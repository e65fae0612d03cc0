//! Progress reporting interface.
//!
//! The engine never renders anything itself; drivers and the batch
//! orchestrator push events through a [`Reporter`] and the embedding
//! presentation layer (CLI, GUI) decides what to do with them. Every
//! method has a no-op default so implementations subscribe only to what
//! they need.

use crate::identity::ModuleType;
use crate::session::UpdatePhase;

/// Callback contract between the update engine and a presentation layer.
///
/// `device` indexes into the list announced by [`Reporter::device_list`];
/// it is stable for the lifetime of one batch.
pub trait Reporter: Send + Sync {
    /// The batch has been constructed with these device locations.
    fn device_list(&self, locations: &[String]) {
        let _ = locations;
    }

    /// A device entered a new phase.
    fn device_phase(&self, device: usize, phase: UpdatePhase) {
        let _ = (device, phase);
    }

    /// The module currently being flashed on a device changed.
    fn device_module(&self, device: usize, module_type: ModuleType) {
        let _ = (device, module_type);
    }

    /// A device's network module uuid became known.
    fn device_uuid(&self, device: usize, uuid: u64) {
        let _ = (device, uuid);
    }

    /// Per-device progress: current module and whole session, 0-100 each.
    fn device_progress(&self, device: usize, current: u8, total: u8) {
        let _ = (device, current, total);
    }

    /// A device session ended with an error message. Fired exactly once.
    fn device_error(&self, device: usize, message: &str) {
        let _ = (device, message);
    }

    /// A network update needs the user to unplug or replug the device.
    fn reconnect_prompt(&self, device: usize, waiting_for_detach: bool) {
        let _ = (device, waiting_for_detach);
    }

    /// Aggregate progress across the batch, 0-100.
    fn total_progress(&self, percent: u8) {
        let _ = percent;
    }

    /// Aggregate status line ("Uploading...", "Complete").
    fn total_status(&self, status: &str) {
        let _ = status;
    }
}

/// Reporter that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Reporter that forwards everything to the `log` crate, useful for
/// headless embedders.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn device_phase(&self, device: usize, phase: UpdatePhase) {
        log::debug!("device {device}: phase {phase:?}");
    }

    fn device_module(&self, device: usize, module_type: ModuleType) {
        log::info!("device {device}: flashing {module_type}");
    }

    fn device_progress(&self, device: usize, current: u8, total: u8) {
        log::debug!("device {device}: {current}% (session {total}%)");
    }

    fn device_error(&self, device: usize, message: &str) {
        log::warn!("device {device}: {message}");
    }

    fn reconnect_prompt(&self, device: usize, waiting_for_detach: bool) {
        if waiting_for_detach {
            log::info!("device {device}: please disconnect the network module");
        } else {
            log::info!("device {device}: please reconnect the network module");
        }
    }

    fn total_progress(&self, percent: u8) {
        log::debug!("batch: {percent}%");
    }

    fn total_status(&self, status: &str) {
        log::info!("batch: {status}");
    }
}
