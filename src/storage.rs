//! Storage backend interface and Logical Unit records
//!
//! A [BlockDevice] serves every Logical Unit of a class instance. LUNs are plain indexes
//! into the [LogicalUnit] slice handed to the [SCSI] translator.
//!
//! [SCSI]: crate::subclass::scsi::Scsi

use crate::subclass::scsi::sense::Sense;

/// Block size assumed until the backend reports a capacity
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Backend failure. Every variant maps onto a single sense triple, see [Sense]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaError {
    /// No medium in the unit
    NotPresent,
    /// The medium has just become available
    NotReadyToReady,
    /// The medium has just been removed
    ReadyToNotReady,
    /// The unit exists but cannot serve commands yet
    LunNotReady,
    /// The unit does not exist on the backend
    LunUnsupported,
    /// The unit is used by someone else
    Busy,
    /// The backend did not answer in time
    Timeout,
    /// Any other backend failure
    Io,
}

/// Medium geometry as reported by [BlockDevice::capacity]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capacity {
    pub block_count: u64,
    pub block_size: u32,
}

/// Storage backend serving one or more Logical Units.
///
/// `buf` passed to [read] and [write] is always exactly `blocks * block_size` bytes long.
///
/// [read]: BlockDevice::read
/// [write]: BlockDevice::write
pub trait BlockDevice {
    fn capacity(&mut self, lun: u8) -> Result<Capacity, MediaError>;

    fn read(&mut self, lun: u8, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<(), MediaError>;

    fn write(&mut self, lun: u8, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), MediaError>;

    /// Reports medium presence and readiness transitions
    fn status(&mut self, lun: u8) -> Result<(), MediaError>;

    /// Claims the medium for the USB host, waiting at most `timeout_ms`
    fn lock(&mut self, lun: u8, timeout_ms: u32) -> Result<(), MediaError>;

    fn unlock(&mut self, lun: u8) -> Result<(), MediaError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn capacity(&mut self, lun: u8) -> Result<Capacity, MediaError> {
        (**self).capacity(lun)
    }

    fn read(&mut self, lun: u8, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<(), MediaError> {
        (**self).read(lun, lba, blocks, buf)
    }

    fn write(&mut self, lun: u8, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), MediaError> {
        (**self).write(lun, lba, blocks, buf)
    }

    fn status(&mut self, lun: u8) -> Result<(), MediaError> {
        (**self).status(lun)
    }

    fn lock(&mut self, lun: u8, timeout_ms: u32) -> Result<(), MediaError> {
        (**self).lock(lun, timeout_ms)
    }

    fn unlock(&mut self, lun: u8) -> Result<(), MediaError> {
        (**self).unlock(lun)
    }
}

/// Host-visible medium flags of a Logical Unit
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Medium {
    /// Claimed by the host through TEST UNIT READY
    pub locked: bool,
    /// Ejected by the host through START STOP UNIT
    pub ejected: bool,
}

/// A single addressable volume
#[derive(Debug, Clone)]
pub struct LogicalUnit {
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
    read_only: bool,
    block_count: u64,
    block_size: u32,
    pub(crate) medium: Medium,
    pub(crate) sense: Sense,
}

impl LogicalUnit {
    /// Creates a writable unit with an unknown block count.
    ///
    /// Identification strings are truncated or padded with spaces to 8, 16 and 4 bytes.
    pub fn new(vendor: &str, product: &str, revision: &str) -> Self {
        Self {
            vendor: padded(vendor),
            product: padded(product),
            revision: padded(revision),
            read_only: false,
            block_count: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            medium: Medium::default(),
            sense: Sense::NO_SENSE,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the initial geometry. The backend's [capacity] overrides it once queried.
    ///
    /// [capacity]: BlockDevice::capacity
    pub fn geometry(mut self, block_count: u64, block_size: u32) -> Self {
        self.block_count = block_count;
        self.block_size = block_size;
        self
    }

    pub fn vendor(&self) -> &[u8; 8] {
        &self.vendor
    }

    pub fn product(&self) -> &[u8; 16] {
        &self.product
    }

    pub fn revision(&self) -> &[u8; 4] {
        &self.revision
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// The sense data REQUEST SENSE would report
    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub(crate) fn set_capacity(&mut self, capacity: Capacity) {
        self.block_count = capacity.block_count;
        self.block_size = capacity.block_size;
    }
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    for (dst, src) in out.iter_mut().zip(s.bytes()) {
        *dst = if src.is_ascii_graphic() { src } else { b' ' };
    }
    out
}
