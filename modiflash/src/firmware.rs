//! Firmware images and the on-disk asset store.
//!
//! Each module type ships as a raw binary blob (`button.bin`, `led.bin`,
//! ...) accompanied by a plain-text version file whose first line reads
//! `vMAJOR.MINOR.PATCH`. The network module's own base firmware is
//! `network.bin` with `base_version.txt`.
//!
//! Images are segmented into fixed 0x800-byte pages for the erase/write/CRC
//! cycle; all-zero pages are skipped entirely.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Error, Result};
use crate::identity::{FirmwareVersion, ModuleType};

/// Flash erase/write unit in bytes.
pub const PAGE_SIZE: usize = 0x800;

/// Size of one firmware data burst.
pub const BLOCK_SIZE: usize = 8;

/// Base address of the target's flash memory.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// First writable image offset for ordinary module application firmware.
pub const MODULE_APP_OFFSET: usize = 0x9000;

/// First writable image offset for the network base firmware (one page in).
pub const NETWORK_BASE_OFFSET: usize = PAGE_SIZE;

/// Extra page-address displacement applied when flashing the network base
/// image (the bootloader region sits behind the application area).
pub const NETWORK_PAGE_OFFSET: u32 = 0x8800;

/// Fixed sentinel address of the end-flash trailer page.
pub const END_FLASH_ADDR: u32 = 0x0801_F800;

/// Trailer verify header for a clean update.
pub const VERIFY_OK: u8 = 0xAA;

/// Trailer verify header when any page hit its retry cap.
pub const VERIFY_DIRTY: u8 = 0xFF;

/// One loaded firmware image plus its version.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    version: FirmwareVersion,
}

impl FirmwareImage {
    /// Wrap in-memory image bytes.
    pub fn new(data: Vec<u8>, version: FirmwareVersion) -> Self {
        Self { data, version }
    }

    /// Load a binary blob and its version file.
    pub fn from_files(bin_path: &Path, version_path: &Path) -> Result<Self> {
        let data = fs::read(bin_path)?;
        let text = fs::read_to_string(version_path)?;
        let first_line = text.lines().next().unwrap_or_default();
        let version = FirmwareVersion::parse(first_line)?;
        debug!(
            "Loaded firmware {} ({} bytes, v{version})",
            bin_path.display(),
            data.len()
        );
        Ok(Self { data, version })
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image version, written into the end-flash trailer.
    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    /// End of the writable page range starting at `begin`: the image length
    /// rounded down to a whole number of pages past `begin`.
    pub fn page_end(&self, begin: usize) -> usize {
        let len = self.data.len();
        if len <= begin {
            return begin;
        }
        len - ((len - begin) % PAGE_SIZE)
    }

    /// Iterate the pages in `[begin, page_end)`. The final page may be
    /// shorter than [`PAGE_SIZE`] only if the image itself ends early.
    pub fn pages(&self, begin: usize) -> impl Iterator<Item = (usize, &[u8])> {
        let end = self.page_end(begin);
        (begin..end).step_by(PAGE_SIZE).map(move |offset| {
            let page_end = (offset + PAGE_SIZE).min(self.data.len());
            (offset, &self.data[offset..page_end])
        })
    }
}

/// Whether a page contains only zero bytes (skipped during flashing).
pub fn page_is_blank(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Build the fixed 8-byte end-flash record.
///
/// Byte 0 is the verify header (0xAA clean / 0xFF dirty), bytes 6-7 carry
/// the packed firmware version little-endian, the rest stays zero.
#[allow(clippy::cast_possible_truncation)]
pub fn end_flash_record(version: FirmwareVersion, had_error: bool) -> [u8; 8] {
    let mut record = [0u8; 8];
    record[0] = if had_error { VERIFY_DIRTY } else { VERIFY_OK };
    let packed = version.packed();
    record[6] = (packed & 0xFF) as u8;
    record[7] = (packed >> 8) as u8;
    record
}

/// Firmware asset store: resolves module types to images, loading from a
/// root directory on demand and caching the result.
///
/// Images can also be inserted directly, which is how tests and embedders
/// provide in-memory firmware.
#[derive(Debug, Default)]
pub struct FirmwareStore {
    root: Option<PathBuf>,
    cache: Mutex<HashMap<String, Arc<FirmwareImage>>>,
}

/// Cache key for the network base image (distinct from the network module's
/// application image).
const NETWORK_BASE_KEY: &str = "network-base";

impl FirmwareStore {
    /// Store backed by a directory of `<type>.bin` blobs.
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Empty in-memory store; populate with [`FirmwareStore::insert`].
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Provide the application image for a module type directly.
    pub fn insert(&self, module_type: ModuleType, image: FirmwareImage) {
        self.lock_cache()
            .insert(module_type.name().to_string(), Arc::new(image));
    }

    /// Provide the network base image directly.
    pub fn insert_network_base(&self, image: FirmwareImage) {
        self.lock_cache()
            .insert(NETWORK_BASE_KEY.to_string(), Arc::new(image));
    }

    /// Application firmware image for one module type.
    pub fn module_image(&self, module_type: ModuleType) -> Result<Arc<FirmwareImage>> {
        self.load(module_type.name(), &format!("{module_type}.bin"), "version.txt")
    }

    /// The network module's own base firmware image.
    pub fn network_base_image(&self) -> Result<Arc<FirmwareImage>> {
        self.load(NETWORK_BASE_KEY, "network.bin", "base_version.txt")
    }

    fn load(&self, key: &str, bin_name: &str, version_name: &str) -> Result<Arc<FirmwareImage>> {
        if let Some(image) = self.lock_cache().get(key) {
            return Ok(Arc::clone(image));
        }

        let root = self.root.as_ref().ok_or_else(|| {
            Error::InvalidFirmware(format!("no firmware available for {key}"))
        })?;
        let image = Arc::new(FirmwareImage::from_files(
            &root.join(bin_name),
            &root.join(version_name),
        )?);
        self.lock_cache().insert(key.to_string(), Arc::clone(&image));
        Ok(image)
    }

    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<FirmwareImage>>> {
        self.cache.lock().unwrap()
    }
}
