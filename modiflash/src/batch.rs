//! Multi-device batch orchestrator.
//!
//! Opens every requested port, runs one driver per device on its own
//! thread and polls the session states, translating changes into
//! [`Reporter`] events. Devices are fully independent: a port that fails
//! to open or a device that dies mid-update is recorded and the rest of
//! the batch keeps going.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};
use crate::firmware::FirmwareStore;
use crate::link::Link;
use crate::port::{PortInfo, PortProvider, SerialConfig};
use crate::report::Reporter;
use crate::session::{SessionSnapshot, SessionState, UpdatePhase};
use crate::update::{UpdaterConfig, module::ModuleUpdater, network::NetworkUpdater};

/// Cap on simultaneously updated devices; one reader thread plus one
/// driver thread each.
pub const MAX_DEVICES: usize = 10;

/// Poll interval of the reporting loop.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What a batch flashes on each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Application firmware of the modules behind each network module.
    Modules,
    /// The network modules' own base firmware.
    NetworkBase,
}

/// Terminal record of one device's session.
#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    /// Port the device was (or failed to be) opened on.
    pub port: String,
    /// Network module uuid, when discovery got that far.
    pub uuid: Option<u64>,
    /// Terminal error message; `None` means the update succeeded.
    pub error: Option<String>,
}

impl DeviceOutcome {
    /// Whether this device updated cleanly.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct DeviceSlot {
    port: PortInfo,
    session: Arc<SessionState>,
    handle: Option<JoinHandle<()>>,
    /// Whether a driver thread was actually started for this port. Ports
    /// that failed to open keep their slot for the outcome list but are
    /// excluded from the aggregate progress.
    launched: bool,
    last: Option<SessionSnapshot>,
    terminal_reported: bool,
}

/// Update every listed device concurrently, blocking until all sessions
/// reach a terminal state. Returns one outcome per requested port, in
/// order.
pub fn run_batch(
    provider: Arc<dyn PortProvider>,
    ports: &[PortInfo],
    mode: UpdateMode,
    store: Arc<FirmwareStore>,
    config: &UpdaterConfig,
    reporter: Arc<dyn Reporter>,
) -> Result<Vec<DeviceOutcome>> {
    if ports.is_empty() {
        return Err(Error::NoModulesFound);
    }
    let ports = if ports.len() > MAX_DEVICES {
        warn!("{} devices requested, updating the first {MAX_DEVICES}", ports.len());
        &ports[..MAX_DEVICES]
    } else {
        ports
    };

    let locations: Vec<String> = ports.iter().map(PortInfo::location).collect();
    reporter.device_list(&locations);
    reporter.total_status("Uploading...");

    let mut slots: Vec<DeviceSlot> = Vec::with_capacity(ports.len());
    for (index, port) in ports.iter().enumerate() {
        let session = Arc::new(SessionState::new());
        let handle = match provider.open(&SerialConfig::new(port.name.clone())) {
            Ok(transport) => Some(spawn_driver(
                Link::new(transport),
                port,
                index,
                mode,
                Arc::clone(&provider),
                Arc::clone(&session),
                Arc::clone(&store),
                config.clone(),
                Arc::clone(&reporter),
            )),
            Err(e) => {
                warn!("{}: open failed: {e}", port.name);
                session.fail(format!("Could not open port: {e}"));
                None
            }
        };
        slots.push(DeviceSlot {
            port: port.clone(),
            session,
            launched: handle.is_some(),
            handle,
            last: None,
            terminal_reported: false,
        });
    }

    // Reporting loop: translate session state changes into events until
    // every device is terminal.
    loop {
        let mut sum = 0usize;
        let mut launched = 0usize;
        let mut all_done = true;

        for (index, slot) in slots.iter_mut().enumerate() {
            let snapshot = slot.session.snapshot();
            publish_changes(&reporter, index, slot, &snapshot);
            if slot.launched {
                sum += usize::from(snapshot.progress_total);
                launched += 1;
            }
            all_done &= snapshot.is_done();
            slot.last = Some(snapshot);
        }

        if all_done {
            break;
        }

        if launched > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let mean = (sum / launched).min(99) as u8;
            reporter.total_progress(mean);
        }
        thread::sleep(POLL_INTERVAL);
    }

    for slot in &mut slots {
        if let Some(handle) = slot.handle.take() {
            let _ = handle.join();
        }
    }

    reporter.total_progress(100);
    reporter.total_status("Complete");

    Ok(slots
        .into_iter()
        .map(|slot| {
            let snapshot = slot.session.snapshot();
            DeviceOutcome {
                port: slot.port.name,
                uuid: snapshot.uuid,
                error: snapshot.error,
            }
        })
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn spawn_driver(
    link: Link,
    port: &PortInfo,
    index: usize,
    mode: UpdateMode,
    provider: Arc<dyn PortProvider>,
    session: Arc<SessionState>,
    store: Arc<FirmwareStore>,
    config: UpdaterConfig,
    reporter: Arc<dyn Reporter>,
) -> JoinHandle<()> {
    match mode {
        UpdateMode::Modules => {
            let driver = ModuleUpdater::new(link, session, store, config);
            thread::spawn(move || driver.run())
        }
        UpdateMode::NetworkBase => {
            let driver = NetworkUpdater::new(
                link, port, provider, session, store, config, reporter, index,
            );
            thread::spawn(move || driver.run())
        }
    }
}

/// Fire reporter events for whatever changed since the last snapshot.
/// Terminal events fire exactly once per device.
fn publish_changes(
    reporter: &Arc<dyn Reporter>,
    index: usize,
    slot: &mut DeviceSlot,
    snapshot: &SessionSnapshot,
) {
    let last = slot.last.as_ref();

    if last.is_none_or(|l| l.phase != snapshot.phase) && snapshot.phase != UpdatePhase::Done {
        reporter.device_phase(index, snapshot.phase);
    }
    if let Some(uuid) = snapshot.uuid {
        if last.and_then(|l| l.uuid) != Some(uuid) {
            reporter.device_uuid(index, uuid);
        }
    }
    if let Some(module_type) = snapshot.module_type {
        if last.and_then(|l| l.module_type) != Some(module_type) {
            reporter.device_module(index, module_type);
        }
    }
    if last.is_none_or(|l| {
        l.progress_current != snapshot.progress_current
            || l.progress_total != snapshot.progress_total
    }) {
        reporter.device_progress(index, snapshot.progress_current, snapshot.progress_total);
    }

    if snapshot.is_done() && !slot.terminal_reported {
        slot.terminal_reported = true;
        reporter.device_phase(index, UpdatePhase::Done);
        if let Some(error) = &snapshot.error {
            reporter.device_error(index, error);
        }
    }
}
