//! Update driver for the network module's own base firmware.
//!
//! Updating the module that is also the serial bridge needs a reconnect
//! cycle: after the update-mode request the module re-enumerates as a USB
//! device. Recent firmware requires a physical replug (the hard path, with
//! user prompts); older firmware only needs the host to close and reopen
//! the port (the soft path). Which path applies is decided by the version
//! the module reported during discovery against a configurable threshold.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::firmware::{FirmwareStore, NETWORK_BASE_OFFSET, NETWORK_PAGE_OFFSET};
use crate::identity::{FirmwareVersion, ModuleIdentity, ModuleType};
use crate::link::Link;
use crate::port::{PortInfo, PortProvider, SerialConfig};
use crate::protocol::command::{self, ModuleState, Opcode, PnpState, Warning};
use crate::protocol::packet::BROADCAST_ID;
use crate::report::Reporter;
use crate::session::{SessionState, UpdatePhase};

use super::{FlashEngine, UpdaterConfig, wait_for_packet};

/// Poll interval while watching port enumeration during reconnect.
const ENUMERATION_POLL: Duration = Duration::from_millis(200);

/// Flashes the base firmware of one network module.
pub struct NetworkUpdater {
    link: Link,
    port_name: String,
    location: String,
    provider: Arc<dyn PortProvider>,
    session: Arc<SessionState>,
    store: Arc<FirmwareStore>,
    config: UpdaterConfig,
    reporter: Arc<dyn Reporter>,
    device_index: usize,
}

impl NetworkUpdater {
    /// Build a driver over an already-open link. `port` must describe the
    /// port the link was opened on; its location key is what the reconnect
    /// cycle watches for.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: Link,
        port: &PortInfo,
        provider: Arc<dyn PortProvider>,
        session: Arc<SessionState>,
        store: Arc<FirmwareStore>,
        config: UpdaterConfig,
        reporter: Arc<dyn Reporter>,
        device_index: usize,
    ) -> Self {
        Self {
            link,
            port_name: port.name.clone(),
            location: port.location(),
            provider,
            session,
            store,
            config,
            reporter,
            device_index,
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
        let network = self.discover()?;
        self.session.set_uuid(network.uuid);
        self.session.set_module_type(ModuleType::Network);

        self.request_update_mode(network.module_id)?;
        self.reconnect(network.version)?;
        self.wait_for_ready(network.module_id)?;
        let failure = self.flash_base(network.module_id)?;
        self.reboot();

        match failure {
            Some(message) => Err(Error::FlashOperationFailed(message)),
            None => Ok(()),
        }
    }

    /// Learn the network module's uuid and version. An identity response
    /// carries both; a warning broadcast at least gives the uuid, leaving
    /// the version unknown (which selects the soft reconnect path).
    fn discover(&mut self) -> Result<ModuleIdentity> {
        self.session.set_phase(UpdatePhase::Discovering);
        let deadline = Instant::now() + self.config.discovery_timeout;

        loop {
            self.link.send(&command::request_uuid(true))?;
            let got = wait_for_packet(
                &self.link,
                &self.session,
                self.config.discovery_retry_interval,
                |packet| {
                    if packet.command == Opcode::IdentityResponse as u8 {
                        return ModuleIdentity::from_identity_response(packet).module_type
                            == ModuleType::Network;
                    }
                    Warning::from_packet(packet)
                        .is_some_and(|w| ModuleIdentity::from_uuid(w.uuid).module_type == ModuleType::Network)
                },
            )?;
            if let Some(packet) = got {
                let identity = if packet.command == Opcode::IdentityResponse as u8 {
                    ModuleIdentity::from_identity_response(&packet)
                } else {
                    // uuid-only, from a warning; the version stays unknown
                    let Some(warning) = Warning::from_packet(&packet) else {
                        continue;
                    };
                    ModuleIdentity::from_uuid(warning.uuid)
                };
                debug!(
                    "{}: network module {:#014x}, version {:?}",
                    self.link.name(),
                    identity.uuid,
                    identity.version
                );
                return Ok(identity);
            }
            if Instant::now() >= deadline {
                return Err(Error::NoResponse(BROADCAST_ID));
            }
        }
    }

    fn request_update_mode(&self, module_id: u16) -> Result<()> {
        for _ in 0..3 {
            self.link.send(&command::set_network_state(
                module_id,
                ModuleState::UpdateFirmware,
                PnpState::Off,
            ))?;
            thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }

    fn reconnect(&mut self, version: Option<FirmwareVersion>) -> Result<()> {
        self.session.set_phase(UpdatePhase::Reconnecting);
        let hard = version.is_some_and(|v| v >= self.config.hard_reconnect_from);
        if hard {
            self.hard_reconnect()
        } else {
            self.soft_reconnect()
        }
    }

    /// Close and reopen the same port after a settle delay.
    fn soft_reconnect(&mut self) -> Result<()> {
        info!("{}: soft reconnect", self.port_name);
        self.link.close();
        thread::sleep(self.config.reconnect_settle);
        self.reopen()
    }

    /// Prompt the user to replug the module, watching enumeration for the
    /// device to disappear and come back (possibly under a new port name).
    fn hard_reconnect(&mut self) -> Result<()> {
        info!("{}: waiting for physical replug", self.port_name);
        self.reporter.reconnect_prompt(self.device_index, true);
        self.link.close();
        self.wait_detached()?;

        self.reporter.reconnect_prompt(self.device_index, false);
        let port = self.wait_attached()?;
        self.port_name = port.name;

        // Give the OS a moment to finish setting up the CDC endpoint.
        thread::sleep(self.config.reconnect_settle);
        self.reopen()
    }

    fn reopen(&mut self) -> Result<()> {
        let transport = self.provider.open(&SerialConfig::new(self.port_name.clone()))?;
        self.link = Link::new(transport);
        Ok(())
    }

    fn wait_detached(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.reconnect_window;
        loop {
            if self.session.stop_requested() {
                return Err(Error::Cancelled);
            }
            if self.provider.find_by_location(&self.location)?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ReconnectTimeout(format!(
                    "{} was not disconnected", self.location
                )));
            }
            thread::sleep(ENUMERATION_POLL);
        }
    }

    fn wait_attached(&self) -> Result<PortInfo> {
        let deadline = Instant::now() + self.config.reconnect_window;
        loop {
            if self.session.stop_requested() {
                return Err(Error::Cancelled);
            }
            if let Some(port) = self.provider.find_by_location(&self.location)? {
                return Ok(port);
            }
            if Instant::now() >= deadline {
                return Err(Error::ReconnectTimeout(format!(
                    "{} did not come back", self.location
                )));
            }
            thread::sleep(ENUMERATION_POLL);
        }
    }

    /// Wait for the module's bootloader to announce readiness.
    fn wait_for_ready(&mut self, module_id: u16) -> Result<()> {
        self.session.set_phase(UpdatePhase::WaitingForReady);

        let link = &self.link;
        let got = wait_for_packet(
            link,
            &self.session,
            self.config.ready_timeout,
            |packet| match Warning::from_packet(packet) {
                Some(warning) if warning.code == Warning::WAITING_ACK => {
                    let _ = link.send(&command::set_module_state(
                        module_id,
                        ModuleState::UpdateFirmwareReady,
                        PnpState::Off,
                    ));
                    false
                }
                Some(warning) => warning.code == Warning::READY,
                None => false,
            },
        )?;

        if got.is_none() {
            return Err(Error::Timeout("Firmware update is not ready".into()));
        }
        Ok(())
    }

    /// Drive the page cycle over the base image and commit the trailer.
    fn flash_base(&mut self, module_id: u16) -> Result<Option<String>> {
        self.session.set_phase(UpdatePhase::Flashing);
        info!("Updating network base firmware on {}", self.link.name());

        let image = self.store.network_base_image()?;
        let mut engine = FlashEngine::new(&self.link, &self.session, &self.config);

        let session = Arc::clone(&self.session);
        engine.flash_image(
            module_id,
            &image,
            NETWORK_BASE_OFFSET,
            NETWORK_PAGE_OFFSET,
            |percent| session.set_progress(percent, percent),
        )?;

        self.session.set_phase(UpdatePhase::WritingTrailer);
        let report = engine.report().clone();
        engine.write_trailer(module_id, image.version(), report.has_update_error)?;

        if report.has_update_error {
            Ok(Some(report.error_detail.unwrap_or_else(|| {
                "network base firmware verification failed".into()
            })))
        } else {
            Ok(None)
        }
    }

    fn reboot(&mut self) {
        self.session.set_phase(UpdatePhase::Rebooting);
        for _ in 0..3 {
            if self
                .link
                .send(&command::set_module_state(
                    BROADCAST_ID,
                    ModuleState::Reboot,
                    PnpState::Off,
                ))
                .is_err()
            {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        thread::sleep(self.config.reboot_settle);
    }
}
