//! Update driver for module application firmware.
//!
//! Talks to the modules behind one network module acting as the serial
//! bridge. The driver broadcasts the update-mode request, collects the
//! readiness warnings modules emit as they drop into their bootloaders,
//! and flashes each announced module sequentially. Modules that announce
//! themselves while another one is being flashed are queued and picked up
//! afterwards.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::firmware::{FirmwareStore, MODULE_APP_OFFSET};
use crate::identity::ModuleIdentity;
use crate::link::Link;
use crate::protocol::command::{self, ModuleState, Opcode, PnpState, Warning};
use crate::protocol::packet::{BROADCAST_ID, Packet};
use crate::session::{SessionState, UpdatePhase};

use super::{FlashEngine, UpdaterConfig, wait_for_packet};

/// Pause between repeated broadcasts of the same state request.
const BROADCAST_REPEAT_DELAY: Duration = Duration::from_millis(50);

/// How long to keep listening for a late readiness warning once the
/// worklist is otherwise empty.
const LATE_READY_WINDOW: Duration = Duration::from_millis(50);

/// Sequentially flashes every module that enters update mode on one bus.
pub struct ModuleUpdater {
    link: Link,
    session: Arc<SessionState>,
    store: Arc<FirmwareStore>,
    config: UpdaterConfig,
    to_update: VecDeque<ModuleIdentity>,
    updated: Vec<u64>,
}

impl ModuleUpdater {
    /// Build a driver over an already-open link.
    pub fn new(
        link: Link,
        session: Arc<SessionState>,
        store: Arc<FirmwareStore>,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            link,
            session,
            store,
            config,
            to_update: VecDeque::new(),
            updated: Vec::new(),
        }
    }

    /// Run the session to completion, recording the terminal state in the
    /// shared [`SessionState`]. Never panics out of its thread.
    pub fn run(mut self) {
        match self.try_run() {
            Ok(()) => self.session.finish(),
            Err(Error::Cancelled) => self.session.fail("Update cancelled"),
            Err(e) => self.session.fail(e.to_string()),
        }
        self.link.close();
    }

    fn try_run(&mut self) -> Result<()> {
        let bridge = self.discover()?;
        self.session.set_uuid(bridge.uuid);

        self.broadcast_state(ModuleState::UpdateFirmware)?;
        self.wait_for_first_target()?;
        let failure = self.flash_worklist()?;
        self.reboot();

        match failure {
            Some(message) => Err(Error::FlashOperationFailed(message)),
            None => Ok(()),
        }
    }

    /// Broadcast identity requests until the bridge answers; silence past
    /// the discovery timeout means nothing is attached to this port.
    fn discover(&mut self) -> Result<ModuleIdentity> {
        self.session.set_phase(UpdatePhase::Discovering);
        let deadline = Instant::now() + self.config.discovery_timeout;

        loop {
            self.link.send(&command::request_uuid(false))?;
            let got = wait_for_packet(
                &self.link,
                &self.session,
                self.config.discovery_retry_interval,
                |packet| packet.command == Opcode::IdentityResponse as u8,
            )?;
            if let Some(packet) = got {
                let identity = ModuleIdentity::from_identity_response(&packet);
                debug!(
                    "{}: found {} {:#014x}",
                    self.link.name(),
                    identity.module_type,
                    identity.uuid
                );
                return Ok(identity);
            }
            if Instant::now() >= deadline {
                return Err(Error::NoResponse(BROADCAST_ID));
            }
        }
    }

    fn broadcast_state(&self, state: ModuleState) -> Result<()> {
        // The broadcast is unacknowledged; repeat a few times to survive a
        // lossy line.
        for _ in 0..3 {
            self.link
                .send(&command::set_module_state(BROADCAST_ID, state, PnpState::Off))?;
            thread::sleep(BROADCAST_REPEAT_DELAY);
        }
        Ok(())
    }

    /// Wait until at least one module announces it is ready for firmware.
    fn wait_for_first_target(&mut self) -> Result<()> {
        self.session.set_phase(UpdatePhase::WaitingForReady);

        let link = &self.link;
        let to_update = &mut self.to_update;
        let updated = &self.updated;
        let got = wait_for_packet(
            link,
            &self.session,
            self.config.ready_timeout,
            |packet| match Warning::from_packet(packet) {
                Some(warning) if warning.code == Warning::WAITING_ACK => {
                    let identity = ModuleIdentity::from_uuid(warning.uuid);
                    let _ = link.send(&command::set_module_state(
                        identity.module_id,
                        ModuleState::UpdateFirmwareReady,
                        PnpState::Off,
                    ));
                    false
                }
                Some(warning) if warning.code == Warning::READY => {
                    enqueue_target(to_update, updated, ModuleIdentity::from_uuid(warning.uuid));
                    !to_update.is_empty()
                }
                _ => false,
            },
        )?;

        if got.is_none() {
            return Err(Error::Timeout(
                "No module entered firmware update mode".into(),
            ));
        }
        Ok(())
    }

    /// Flash every queued module, queuing late arrivals as they announce
    /// themselves. Returns the first recorded failure, if any.
    fn flash_worklist(&mut self) -> Result<Option<String>> {
        let mut engine = FlashEngine::new(&self.link, &self.session, &self.config);
        let mut first_failure: Option<String> = None;

        while let Some(target) = self.to_update.pop_front() {
            self.session.set_phase(UpdatePhase::Flashing);
            self.session.set_module_type(target.module_type);
            info!(
                "Updating {} ({:#014x}) on {}",
                target.module_type,
                target.uuid,
                self.link.name()
            );

            let image = self.store.module_image(target.module_type)?;
            engine.reset_report();

            let done = self.updated.len();
            let total_targets = done + self.to_update.len() + 1;
            let session = Arc::clone(&self.session);
            engine.flash_image(target.module_id, &image, MODULE_APP_OFFSET, 0, |percent| {
                #[allow(clippy::cast_possible_truncation)]
                let overall = ((done * 100 + percent as usize) / total_targets) as u8;
                session.set_progress(percent, overall);
            })?;

            self.session.set_phase(UpdatePhase::WritingTrailer);
            let report = engine.report().clone();
            engine.write_trailer(target.module_id, image.version(), report.has_update_error)?;

            if report.has_update_error && first_failure.is_none() {
                warn!("{} {:#014x} updated with errors", target.module_type, target.uuid);
                first_failure = Some(report.error_detail.unwrap_or_else(|| {
                    format!("{} firmware verification failed", target.module_type)
                }));
            }

            self.updated.push(target.uuid);

            // Warnings that arrived while flashing may announce new targets.
            for packet in engine.take_pending() {
                handle_stray_warning(&self.link, &mut self.to_update, &self.updated, &packet);
            }
            while let Some(packet) = self.link.try_recv() {
                handle_stray_warning(&self.link, &mut self.to_update, &self.updated, &packet);
            }
            // A readiness warning can still be between the wire and the
            // channel when the queue runs dry; listen once more before
            // declaring the worklist finished.
            while self.to_update.is_empty() {
                let Some(packet) = self.link.recv_timeout(LATE_READY_WINDOW) else {
                    break;
                };
                handle_stray_warning(&self.link, &mut self.to_update, &self.updated, &packet);
            }
        }

        Ok(first_failure)
    }

    fn reboot(&mut self) {
        self.session.set_phase(UpdatePhase::Rebooting);
        // Failures are moot here; the bus is about to go down anyway.
        if let Err(e) = self.broadcast_state(ModuleState::Reboot) {
            debug!("{}: reboot broadcast failed: {e}", self.link.name());
        }
        thread::sleep(self.config.reboot_settle);
    }
}

/// Dispatch a warning that arrived while the engine was mid-operation.
fn handle_stray_warning(
    link: &Link,
    queue: &mut VecDeque<ModuleIdentity>,
    updated: &[u64],
    packet: &Packet,
) {
    match Warning::from_packet(packet) {
        Some(warning) if warning.code == Warning::WAITING_ACK => {
            let identity = ModuleIdentity::from_uuid(warning.uuid);
            let _ = link.send(&command::set_module_state(
                identity.module_id,
                ModuleState::UpdateFirmwareReady,
                PnpState::Off,
            ));
        }
        Some(warning) if warning.code == Warning::READY => {
            enqueue_target(queue, updated, ModuleIdentity::from_uuid(warning.uuid));
        }
        _ => {}
    }
}

/// Add a target unless it was already updated or is already queued.
fn enqueue_target(
    queue: &mut VecDeque<ModuleIdentity>,
    updated: &[u64],
    identity: ModuleIdentity,
) {
    if updated.contains(&identity.uuid) || queue.iter().any(|m| m.uuid == identity.uuid) {
        return;
    }
    debug!("queueing {} {:#014x}", identity.module_type, identity.uuid);
    queue.push_back(identity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ModuleType;

    #[test]
    fn test_enqueue_deduplicates() {
        let mut queue = VecDeque::new();
        let button = ModuleIdentity::from_uuid(0x2030_0000_0ABC);
        let led = ModuleIdentity::from_uuid(0x4020_0000_0DEF);

        enqueue_target(&mut queue, &[], button);
        enqueue_target(&mut queue, &[], button);
        enqueue_target(&mut queue, &[], led);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].module_type, ModuleType::Button);

        // Already-updated modules are not re-queued.
        let mut queue = VecDeque::new();
        enqueue_target(&mut queue, &[button.uuid], button);
        assert!(queue.is_empty());
    }
}
