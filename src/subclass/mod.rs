//! USB Mass Storage subclasses
//!
//! A subclass is the command set carried inside Command Block Wrappers. The [Bulk Only]
//! engine drives any [CommandSet]. [SCSI] is the one this crate ships.
//!
//! [Bulk Only]: crate::transport::bbb::BulkOnly
//! [SCSI]: crate::subclass::scsi::Scsi

use crate::transport::DataDirection;

pub mod scsi;

/// What a command expects from the data phase
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response {
    /// Number of bytes the device intends to move
    pub len: u32,
    pub direction: DataDirection,
}

impl Response {
    /// No data phase
    pub const fn none() -> Self {
        Self {
            len: 0,
            direction: DataDirection::NotExpected,
        }
    }

    /// Device to host data phase of `len` bytes
    pub const fn to_host(len: u32) -> Self {
        Self {
            len,
            direction: DataDirection::In,
        }
    }

    /// Host to device data phase of `len` bytes
    pub const fn from_host(len: u32) -> Self {
        Self {
            len,
            direction: DataDirection::Out,
        }
    }
}

/// One piece of a device to host data phase
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataChunk {
    /// Bytes placed at the start of the buffer
    pub len: usize,
    /// Whether further calls will produce more data
    pub more: bool,
}

/// Command set interpreter driven by a transport.
///
/// Every command goes through [process] first. If the [Response] announces a data phase,
/// the transport then calls [read_data] or [write_data] until the announced length has
/// been moved or the command set reports that nothing more is pending.
///
/// All per-command state lives in [Context], owned by the transport for the
/// duration of one command. State that must survive a command (sense data, lock
/// state of the media) lives in the implementor.
///
/// [process]: CommandSet::process
/// [read_data]: CommandSet::read_data
/// [write_data]: CommandSet::write_data
/// [Context]: CommandSet::Context
pub trait CommandSet {
    /// Per-command state
    type Context: Default;
    /// Command failure. The details are kept by the implementor for later retrieval.
    type Error;

    /// Number of Logical Units
    fn lun_count(&self) -> u8;

    /// The smallest IO buffer the data phase can work with
    fn min_buffer_len(&self) -> usize;

    /// Size of the IO buffer the transport moves data through.
    /// No data chunk passed to [read_data] or [write_data] is longer.
    ///
    /// [read_data]: CommandSet::read_data
    /// [write_data]: CommandSet::write_data
    fn set_buffer_len(&mut self, len: usize);

    /// Validates and executes a command block
    fn process(
        &mut self,
        ctx: &mut Self::Context,
        lun: u8,
        cb: &[u8],
    ) -> Result<Response, Self::Error>;

    /// Largest chunk not above `max` the current command can move in one go
    fn chunk_len(&self, ctx: &Self::Context, max: usize) -> usize;

    /// Fills `buf` with the next piece of a device to host data phase
    fn read_data(
        &mut self,
        ctx: &mut Self::Context,
        lun: u8,
        buf: &mut [u8],
    ) -> Result<DataChunk, Self::Error>;

    /// Consumes the next piece of a host to device data phase, returning whether more data is expected
    fn write_data(
        &mut self,
        ctx: &mut Self::Context,
        lun: u8,
        buf: &[u8],
    ) -> Result<bool, Self::Error>;

    /// Drops any state left over from previous commands
    fn reset(&mut self);

    /// Called for every Logical Unit when a configuration becomes active
    fn connect(&mut self, lun: u8);

    /// Releases the medium of a Logical Unit. Releasing twice is not an error.
    fn unlock(&mut self, lun: u8) -> Result<(), Self::Error>;
}
