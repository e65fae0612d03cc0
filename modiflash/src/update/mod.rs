//! Firmware update drivers.
//!
//! Two concrete drivers share one page-flash engine:
//!
//! - [`module::ModuleUpdater`] flashes the application firmware of ordinary
//!   modules reachable through a network module;
//! - [`network::NetworkUpdater`] flashes the network module's own base
//!   firmware, including the serial reconnect cycle that update requires.
//!
//! Both run as a single blocking call on their own thread and communicate
//! with the outside world only through their [`SessionState`] and the
//! [`Reporter`](crate::report::Reporter).

pub mod module;
pub mod network;

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::firmware::{BLOCK_SIZE, FLASH_BASE, FirmwareImage, page_is_blank};
use crate::firmware::{END_FLASH_ADDR, end_flash_record};
use crate::identity::FirmwareVersion;
use crate::link::Link;
use crate::protocol::command::{self, FlashAck, FlashOp};
use crate::protocol::crc::page_checksum;
use crate::protocol::packet::Packet;
use crate::session::SessionState;

/// Tuning knobs shared by both drivers.
///
/// Defaults mirror the timings the MODI bootloader was validated against;
/// the reconnect version threshold is deliberately configuration, not a
/// constant.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Overall bound on the discovery phase.
    pub discovery_timeout: Duration,
    /// Interval between repeated identity-request broadcasts.
    pub discovery_retry_interval: Duration,
    /// Overall bound on the ready-warning wait.
    pub ready_timeout: Duration,
    /// Bound on one erase/CRC command response.
    pub response_timeout: Duration,
    /// Consecutive same-page erase failures tolerated before the page is
    /// recorded as failed and skipped.
    pub erase_retry_limit: u32,
    /// Consecutive same-page CRC failures tolerated before the page is
    /// recorded as failed and skipped.
    pub crc_retry_limit: u32,
    /// Full erase/write/CRC attempts for the end-flash trailer page.
    pub trailer_retry_limit: u32,
    /// Error-class responses tolerated per session while waiting for acks.
    pub response_error_limit: u32,
    /// Pause between 8-byte data bursts (device receive buffer pacing).
    pub block_delay: Duration,
    /// Pause after each committed page.
    pub page_delay: Duration,
    /// How long a reconnecting device may stay off the bus.
    pub reconnect_window: Duration,
    /// Settle time between closing and reopening the port on reconnect.
    pub reconnect_settle: Duration,
    /// Network modules reporting at least this version take the hard
    /// reconnect path (physical replug); older ones get a soft reopen.
    pub hard_reconnect_from: FirmwareVersion,
    /// Settle time after broadcasting the reboot command.
    pub reboot_settle: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(3),
            discovery_retry_interval: Duration::from_millis(200),
            ready_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            erase_retry_limit: 2,
            crc_retry_limit: 2,
            trailer_retry_limit: 10,
            response_error_limit: 75,
            block_delay: Duration::from_millis(2),
            page_delay: Duration::from_millis(10),
            reconnect_window: Duration::from_secs(60),
            reconnect_settle: Duration::from_secs(1),
            hard_reconnect_from: FirmwareVersion::new(1, 2, 1),
            reboot_settle: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it reports success, at most `attempts` times.
///
/// `Ok(false)` is a retryable failure; errors abort immediately. This is
/// the explicit replacement for the original driver's retry-by-recursion
/// wrapper: every call site that needs bounded retries says so.
pub(crate) fn retry_bounded(
    attempts: u32,
    mut op: impl FnMut() -> Result<bool>,
) -> Result<bool> {
    for attempt in 1..=attempts.max(1) {
        if op()? {
            return Ok(true);
        }
        debug!("attempt {attempt}/{attempts} failed");
    }
    Ok(false)
}

/// Wait up to `timeout` for a packet accepted by `take`, polling in short
/// slices so a stop request is honored within one interval.
pub(crate) fn wait_for_packet(
    link: &Link,
    session: &SessionState,
    timeout: Duration,
    mut take: impl FnMut(&Packet) -> bool,
) -> Result<Option<Packet>> {
    let deadline = Instant::now() + timeout;
    loop {
        if session.stop_requested() {
            return Err(Error::Cancelled);
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Ok(None);
        };
        let slice = remaining.min(Duration::from_millis(10));
        if let Some(packet) = link.recv_timeout(slice) {
            if take(&packet) {
                return Ok(Some(packet));
            }
        }
    }
}

/// Outcome of flashing one image region.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlashReport {
    /// Whether any page exhausted its retry cap.
    pub has_update_error: bool,
    /// Human-readable detail of the first recorded page failure.
    pub error_detail: Option<String>,
}

/// Page-oriented erase/write/CRC engine shared by both drivers.
///
/// The engine owns the command/response correlation: the wire protocol has
/// no request ids, so the next erase/crc-class response is taken to answer
/// the most recent outstanding request. This holds because each device's
/// command stream from this driver is strictly sequential.
pub(crate) struct FlashEngine<'a> {
    link: &'a Link,
    session: &'a SessionState,
    config: &'a UpdaterConfig,
    /// Unrelated packets (warnings, identity responses) seen while waiting
    /// for acks; the driver drains these between operations.
    pending: Vec<Packet>,
    response_errors: u32,
    report: FlashReport,
}

impl<'a> FlashEngine<'a> {
    pub fn new(link: &'a Link, session: &'a SessionState, config: &'a UpdaterConfig) -> Self {
        Self {
            link,
            session,
            config,
            pending: Vec::new(),
            response_errors: 0,
            report: FlashReport::default(),
        }
    }

    /// Packets that arrived while the engine was waiting for acks.
    pub fn take_pending(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.pending)
    }

    /// Flash report accumulated so far.
    pub fn report(&self) -> &FlashReport {
        &self.report
    }

    /// Reset the per-module error record (the module drivers flash several
    /// targets per session).
    pub fn reset_report(&mut self) {
        self.report = FlashReport::default();
    }

    /// Send one erase or CRC-verify command and await the device's verdict.
    ///
    /// `Ok(false)` means the device answered with an error ack; a missing
    /// answer is a fatal [`Error::Timeout`].
    fn flash_command(
        &mut self,
        op: FlashOp,
        module_id: u16,
        crc: u32,
        page_addr: u32,
    ) -> Result<bool> {
        self.link
            .send(&command::firmware_command(op, module_id, crc, page_addr))?;

        let mut others = Vec::new();
        let mut ack = None;
        let got = wait_for_packet(
            self.link,
            self.session,
            self.config.response_timeout,
            |packet| match FlashAck::from_packet(packet) {
                Some(found) => {
                    ack = Some(found);
                    true
                }
                None => {
                    others.push(packet.clone());
                    false
                }
            },
        )?;
        self.pending.append(&mut others);

        if got.is_none() {
            return Err(Error::Timeout("Response timed-out".into()));
        }

        let Some(ack) = ack else {
            return Err(Error::Timeout("Response timed-out".into()));
        };

        if ack.is_success() {
            return Ok(true);
        }

        self.response_errors += 1;
        if self.response_errors > self.config.response_error_limit {
            return Err(Error::FlashOperationFailed("Response errored".into()));
        }
        Ok(false)
    }

    /// Stream one 8-byte block and advance the running page checksum.
    fn write_block(&mut self, module_id: u16, seq: u16, block: &[u8], crc: u32) -> Result<u32> {
        self.link.send(&command::firmware_data(module_id, seq, block))?;
        thread::sleep(self.config.block_delay);
        Ok(page_checksum(block, crc))
    }

    /// One full erase + data burst + CRC attempt for a page.
    fn flash_page_once(&mut self, module_id: u16, page_addr: u32, page: &[u8]) -> Result<PageAttempt> {
        if !self.flash_command(FlashOp::Erase, module_id, 0, page_addr)? {
            return Ok(PageAttempt::EraseFailed);
        }

        let mut checksum = 0u32;
        for (seq, block) in page.chunks(BLOCK_SIZE).enumerate() {
            if self.session.stop_requested() {
                return Err(Error::Cancelled);
            }
            #[allow(clippy::cast_possible_truncation)] // at most 256 blocks per page
            let seq = seq as u16;
            checksum = self.write_block(module_id, seq, block, checksum)?;
        }

        if self.flash_command(FlashOp::Crc, module_id, checksum, page_addr)? {
            Ok(PageAttempt::Committed)
        } else {
            Ok(PageAttempt::CrcFailed)
        }
    }

    /// Drive the page cycle over `image` starting at `begin`, placing pages
    /// at `FLASH_BASE + offset + page_offset`.
    ///
    /// Retry policy, applied uniformly: a failed erase or CRC rewinds and
    /// retries the same page (a partial page is never resumed mid-write);
    /// past the per-operation cap the page is recorded as failed and the
    /// cursor advances. `on_progress` runs after every page with the region
    /// percentage.
    pub fn flash_image(
        &mut self,
        module_id: u16,
        image: &FirmwareImage,
        begin: usize,
        page_offset: u32,
        mut on_progress: impl FnMut(u8),
    ) -> Result<()> {
        let end = image.page_end(begin);
        if end <= begin {
            return Err(Error::InvalidFirmware(format!(
                "image too small: no pages past offset {begin:#x}"
            )));
        }

        for (offset, page) in image.pages(begin) {
            if self.session.stop_requested() {
                return Err(Error::Cancelled);
            }

            #[allow(clippy::cast_possible_truncation)]
            let percent = (100 * (offset - begin) / (end - begin)) as u8;
            on_progress(percent);

            if page_is_blank(page) {
                continue;
            }

            #[allow(clippy::cast_possible_truncation)]
            let page_addr = FLASH_BASE + offset as u32 + page_offset;
            self.flash_page(module_id, page_addr, page)?;
        }

        on_progress(100);
        Ok(())
    }

    /// Flash one page, rewinding to the erase step on every failure until
    /// the per-operation cap is exhausted, then record the page as failed
    /// and move on.
    fn flash_page(&mut self, module_id: u16, page_addr: u32, page: &[u8]) -> Result<()> {
        let mut erase_errors = 0u32;
        let mut crc_errors = 0u32;
        loop {
            match self.flash_page_once(module_id, page_addr, page)? {
                PageAttempt::Committed => {
                    thread::sleep(self.config.page_delay);
                    return Ok(());
                }
                PageAttempt::EraseFailed => {
                    erase_errors += 1;
                    if erase_errors > self.config.erase_retry_limit {
                        self.record_page_error(module_id, page_addr, "erase flash failed");
                        return Ok(());
                    }
                }
                PageAttempt::CrcFailed => {
                    crc_errors += 1;
                    if crc_errors > self.config.crc_retry_limit {
                        self.record_page_error(module_id, page_addr, "crc check failed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Commit the end-flash trailer at the fixed sentinel address.
    ///
    /// The erase must succeed first try per attempt; a failed CRC retries
    /// the whole cycle up to the trailer cap. Failure here is fatal to the
    /// device session.
    pub fn write_trailer(
        &mut self,
        module_id: u16,
        version: FirmwareVersion,
        had_error: bool,
    ) -> Result<()> {
        let record = end_flash_record(version, had_error);
        let attempts = self.config.trailer_retry_limit;

        let mut attempt = || -> Result<bool> {
            if !self.flash_command(FlashOp::Erase, module_id, 0, END_FLASH_ADDR)? {
                // A sentinel page that will not erase is unrecoverable.
                return Err(Error::TrailerWriteFailed("end erase error".into()));
            }
            let checksum = self.write_block(module_id, 0, &record, 0)?;
            self.flash_command(FlashOp::Crc, module_id, checksum, END_FLASH_ADDR)
        };

        let committed = retry_bounded(attempts, &mut attempt)?;

        if committed {
            debug!("end flash written for module {module_id:#05x}");
            Ok(())
        } else {
            Err(Error::TrailerWriteFailed("end crc error".into()))
        }
    }

    fn record_page_error(&mut self, module_id: u16, page_addr: u32, what: &str) {
        warn!("module {module_id:#05x}: page {page_addr:#010x} {what}");
        self.report.has_update_error = true;
        if self.report.error_detail.is_none() {
            self.report.error_detail =
                Some(format!("module {module_id:#05x}: {what} at {page_addr:#010x}"));
        }
    }
}

/// Result of a single page attempt.
enum PageAttempt {
    Committed,
    EraseFailed,
    CrcFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_bounded_counts_attempts() {
        let mut calls = 0;
        let ok = retry_bounded(3, || {
            calls += 1;
            Ok(calls == 2)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 2);

        let mut calls = 0;
        let ok = retry_bounded(3, || {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_bounded_propagates_errors() {
        let result: Result<bool> = retry_bounded(5, || Err(Error::Cancelled));
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
