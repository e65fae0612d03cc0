//! # modiflash
//!
//! A library for updating LUXROBO MODI module firmware over serial.
//!
//! This crate provides the core functionality for talking to MODI modules
//! through a network module's USB CDC port, including:
//!
//! - JSON-envelope packet codec with base64 payloads
//! - Page-oriented erase/write/CRC flashing state machine
//! - Module discovery and identity decoding
//! - Concurrent multi-device batch orchestration
//!
//! ## Update modes
//!
//! - **Modules**: application firmware of the modules attached behind a
//!   network module
//! - **Network base**: the network module's own base firmware, including
//!   the reconnect cycle its bootloader requires
//!
//! ## Features
//!
//! - `native` (default): native serial port support via the `serialport`
//!   crate. Without it the crate is transport-agnostic and embedders
//!   supply their own [`port::Transport`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use modiflash::batch::{run_batch, UpdateMode};
//! use modiflash::firmware::FirmwareStore;
//! use modiflash::port::SerialProvider;
//! use modiflash::report::LogReporter;
//! use modiflash::update::UpdaterConfig;
//!
//! fn main() -> modiflash::Result<()> {
//!     let provider = SerialProvider;
//!     let ports = provider.list_modi_ports()?;
//!
//!     let outcomes = run_batch(
//!         Arc::new(provider),
//!         &ports,
//!         UpdateMode::Modules,
//!         Arc::new(FirmwareStore::from_dir("firmware")),
//!         &UpdaterConfig::default(),
//!         Arc::new(LogReporter),
//!     )?;
//!
//!     for outcome in outcomes {
//!         println!("{}: {:?}", outcome.port, outcome.error);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod error;
pub mod firmware;
pub mod identity;
pub mod link;
pub mod port;
pub mod protocol;
pub mod report;
pub mod session;
pub mod update;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, SerialProvider};
pub use {
    batch::{DeviceOutcome, MAX_DEVICES, UpdateMode, run_batch},
    error::{Error, Result},
    firmware::{FirmwareImage, FirmwareStore},
    identity::{FirmwareVersion, ModuleIdentity, ModuleType},
    port::{PortInfo, PortProvider, SerialConfig, Transport},
    report::{LogReporter, NullReporter, Reporter},
    session::{SessionSnapshot, SessionState, UpdatePhase},
    update::UpdaterConfig,
};
