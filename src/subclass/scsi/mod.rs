//! USB SCSI
//!
//! Translates SCSI transparent command set blocks into [BlockDevice] calls.

pub mod command;
pub mod sense;

use crate::fmt::{debug, info, trace, warning};
use crate::storage::{BlockDevice, Capacity, LogicalUnit, MediaError, DEFAULT_BLOCK_SIZE};
use crate::subclass::{CommandSet, DataChunk, Response};
use command::{parse_cb, ScsiCommand};
use core::borrow::BorrowMut;
use core::cmp::min;
use sense::Sense;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/// How long TEST UNIT READY waits for [BlockDevice::lock]
pub const DEFAULT_LOCK_TIMEOUT_MS: u32 = 1000;

const INQUIRY_LEN: usize = 36;
const READ_CAPACITY_10_LEN: usize = 8;
const READ_CAPACITY_16_LEN: usize = 32;
const READ_FORMAT_CAPACITIES_LEN: usize = 12;
const RESPONSE_BUF_LEN: usize = 64;

/* Mode parameters */
const PAGE_RW_ERROR_RECOVERY: u8 = 0x01;
const PAGE_INFORMATIONAL_EXCEPTIONS: u8 = 0x1C;
const PAGE_ALL: u8 = 0x3F;
const MODE_PAGE_LEN: usize = 12;
const MODE_HEADER_6_LEN: usize = 4;
const MODE_HEADER_10_LEN: usize = 8;
const DEVICE_SPECIFIC_WRITE_PROTECT: u8 = 0x80;

const RW_ERROR_RECOVERY_PAGE: [u8; MODE_PAGE_LEN] =
    [PAGE_RW_ERROR_RECOVERY, 0x0A, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
const INFORMATIONAL_EXCEPTIONS_PAGE: [u8; MODE_PAGE_LEN] =
    [PAGE_INFORMATIONAL_EXCEPTIONS, 0x0A, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

const FORMATTED_MEDIA: u8 = 0x02;

/// The command ended with CHECK CONDITION status.
///
/// The same sense is recorded on the Logical Unit for a following REQUEST SENSE.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CheckCondition(pub Sense);

impl From<MediaError> for CheckCondition {
    fn from(err: MediaError) -> Self {
        CheckCondition(Sense::from(err))
    }
}

#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Phase {
    #[default]
    None,
    Buffered,
    ReadBlocks,
    WriteBlocks,
}

/// State of the SCSI command in flight
#[derive(Debug, Clone)]
pub struct ScsiContext {
    opcode: u8,
    phase: Phase,
    lba: u64,
    blocks_remaining: u32,
    block_size: u32,
    response: [u8; RESPONSE_BUF_LEN],
    response_len: usize,
    response_pos: usize,
}

impl Default for ScsiContext {
    fn default() -> Self {
        Self {
            opcode: 0,
            phase: Phase::None,
            lba: 0,
            blocks_remaining: 0,
            block_size: 0,
            response: [0u8; RESPONSE_BUF_LEN],
            response_len: 0,
            response_pos: 0,
        }
    }
}

impl ScsiContext {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Next block to transfer
    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn blocks_remaining(&self) -> u32 {
        self.blocks_remaining
    }

    /// Buffers a short response truncated to the allocation length
    fn respond(&mut self, data: &[u8], alloc_len: usize) -> Response {
        let len = min(min(data.len(), alloc_len), RESPONSE_BUF_LEN);
        self.response[..len].copy_from_slice(&data[..len]);
        self.response_len = len;
        self.response_pos = 0;
        self.phase = Phase::Buffered;
        Response::to_host(len as u32)
    }

    fn drain_response(&mut self, buf: &mut [u8]) -> DataChunk {
        let pending = &self.response[self.response_pos..self.response_len];
        let len = min(pending.len(), buf.len());
        buf[..len].copy_from_slice(&pending[..len]);
        self.response_pos += len;
        DataChunk {
            len,
            more: self.response_pos < self.response_len,
        }
    }

    /// Prepares a block transfer, returning its length in bytes
    fn start_blocks(
        &mut self,
        phase: Phase,
        lba: u64,
        blocks: u32,
        block_size: u32,
        buffer_len: usize,
    ) -> Result<u32, CheckCondition> {
        // a block must fit into a single chunk of the data phase
        if block_size == 0 || block_size as usize > buffer_len {
            return Err(CheckCondition(Sense::INTERNAL_TARGET_FAILURE));
        }
        let len = u32::try_from(u64::from(blocks) * u64::from(block_size))
            .map_err(|_| CheckCondition(Sense::INVALID_FIELD_IN_CDB))?;
        self.phase = phase;
        self.lba = lba;
        self.blocks_remaining = blocks;
        self.block_size = block_size;
        Ok(len)
    }

    fn advance(&mut self, blocks: u32) {
        self.lba += u64::from(blocks);
        self.blocks_remaining -= blocks;
    }

    /// Whole blocks that fit into `len` bytes, bounded by what is left
    fn blocks_for(&self, len: usize) -> u32 {
        let fit = len / self.block_size as usize;
        min(fit, self.blocks_remaining as usize) as u32
    }
}

/// SCSI transparent command set translator
///
/// Owns the storage backend and the Logical Units it serves. Sense data is kept per
/// Logical Unit and reset at the start of every command but REQUEST SENSE.
pub struct Scsi<D: BlockDevice, U: BorrowMut<[LogicalUnit]>> {
    device: D,
    units: U,
    lock_timeout_ms: u32,
    buffer_len: usize,
}

impl<D, U> Scsi<D, U>
where
    D: BlockDevice,
    U: BorrowMut<[LogicalUnit]>,
{
    /// Creates a translator for `units`. LUN `n` is `units[n]`.
    pub fn new(device: D, units: U) -> Self {
        Self {
            device,
            units,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            buffer_len: usize::MAX,
        }
    }

    pub fn with_lock_timeout(mut self, timeout_ms: u32) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn units(&self) -> &[LogicalUnit] {
        self.units.borrow()
    }

    pub fn unit(&self, lun: u8) -> Option<&LogicalUnit> {
        self.units().get(lun as usize)
    }

    fn target(&mut self, lun: u8) -> Result<Target<'_, D>, CheckCondition> {
        let unit = self
            .units
            .borrow_mut()
            .get_mut(lun as usize)
            .ok_or(CheckCondition(Sense::LOGICAL_UNIT_NOT_SUPPORTED))?;
        Ok(Target {
            device: &mut self.device,
            unit,
            lun,
            lock_timeout_ms: self.lock_timeout_ms,
            buffer_len: self.buffer_len,
        })
    }
}

impl<D, U> CommandSet for Scsi<D, U>
where
    D: BlockDevice,
    U: BorrowMut<[LogicalUnit]>,
{
    type Context = ScsiContext;
    type Error = CheckCondition;

    fn lun_count(&self) -> u8 {
        u8::try_from(self.units().len()).unwrap_or(u8::MAX)
    }

    fn min_buffer_len(&self) -> usize {
        self.units()
            .iter()
            .map(|unit| unit.block_size() as usize)
            .max()
            .unwrap_or(DEFAULT_BLOCK_SIZE as usize)
    }

    fn set_buffer_len(&mut self, len: usize) {
        self.buffer_len = len;
    }

    fn process(
        &mut self,
        ctx: &mut ScsiContext,
        lun: u8,
        cb: &[u8],
    ) -> Result<Response, CheckCondition> {
        *ctx = ScsiContext::default();
        let mut target = self.target(lun)?;

        let Some(command) = parse_cb(cb) else {
            warning!("usb: scsi: Malformed command block, len: {}", cb.len());
            let sense = if cb.is_empty() {
                Sense::INVALID_COMMAND_OPERATION_CODE
            } else {
                Sense::INVALID_FIELD_IN_CDB
            };
            return Err(target.fail(sense));
        };
        ctx.opcode = cb[0];

        debug!("usb: scsi: Command: {}", command);

        if !matches!(command, ScsiCommand::RequestSense { .. }) {
            target.unit.sense = Sense::NO_SENSE;
        }

        match target.execute(ctx, command) {
            Ok(response) => Ok(response),
            Err(CheckCondition(sense)) => Err(target.fail(sense)),
        }
    }

    fn chunk_len(&self, ctx: &ScsiContext, max: usize) -> usize {
        match ctx.phase {
            Phase::ReadBlocks | Phase::WriteBlocks => max - max % ctx.block_size as usize,
            Phase::None | Phase::Buffered => max,
        }
    }

    fn read_data(
        &mut self,
        ctx: &mut ScsiContext,
        lun: u8,
        buf: &mut [u8],
    ) -> Result<DataChunk, CheckCondition> {
        match ctx.phase {
            Phase::Buffered => Ok(ctx.drain_response(buf)),
            Phase::ReadBlocks => {
                let blocks = ctx.blocks_for(buf.len());
                if blocks == 0 {
                    return Ok(DataChunk {
                        len: 0,
                        more: ctx.blocks_remaining > 0,
                    });
                }
                let len = blocks as usize * ctx.block_size as usize;

                trace!("usb: scsi: Read lba: {}, blocks: {}", ctx.lba, blocks);
                let mut target = self.target(lun)?;
                if let Err(err) = target.device.read(lun, ctx.lba, blocks, &mut buf[..len]) {
                    return Err(target.fail(err.into()));
                }
                ctx.advance(blocks);

                Ok(DataChunk {
                    len,
                    more: ctx.blocks_remaining > 0,
                })
            }
            Phase::None | Phase::WriteBlocks => Ok(DataChunk::default()),
        }
    }

    fn write_data(
        &mut self,
        ctx: &mut ScsiContext,
        lun: u8,
        buf: &[u8],
    ) -> Result<bool, CheckCondition> {
        match ctx.phase {
            Phase::WriteBlocks => {
                let blocks = ctx.blocks_for(buf.len());
                if blocks > 0 {
                    let len = blocks as usize * ctx.block_size as usize;

                    trace!("usb: scsi: Write lba: {}, blocks: {}", ctx.lba, blocks);
                    let mut target = self.target(lun)?;
                    if let Err(err) = target.device.write(lun, ctx.lba, blocks, &buf[..len]) {
                        return Err(target.fail(err.into()));
                    }
                    ctx.advance(blocks);
                }
                Ok(ctx.blocks_remaining > 0)
            }
            // nothing this command set accepts from the host besides blocks
            Phase::None | Phase::Buffered | Phase::ReadBlocks => Ok(false),
        }
    }

    fn reset(&mut self) {
        for unit in self.units.borrow_mut() {
            unit.sense = Sense::NO_SENSE;
        }
    }

    fn connect(&mut self, lun: u8) {
        if let Some(unit) = self.units.borrow_mut().get_mut(lun as usize) {
            unit.medium.ejected = false;
        }
    }

    fn unlock(&mut self, lun: u8) -> Result<(), CheckCondition> {
        let mut target = self.target(lun)?;
        match target.unlock() {
            Ok(()) => Ok(()),
            Err(err) => Err(target.fail(err.into())),
        }
    }
}

/// A single Logical Unit together with the backend serving it
struct Target<'a, D> {
    device: &'a mut D,
    unit: &'a mut LogicalUnit,
    lun: u8,
    lock_timeout_ms: u32,
    buffer_len: usize,
}

#[derive(Copy, Clone)]
enum ModeHeader {
    Six,
    Ten,
}

impl<D: BlockDevice> Target<'_, D> {
    fn fail(&mut self, sense: Sense) -> CheckCondition {
        info!("usb: scsi: Check condition, lun: {}, sense: {}", self.lun, sense);
        self.unit.sense = sense;
        CheckCondition(sense)
    }

    fn execute(
        &mut self,
        ctx: &mut ScsiContext,
        command: ScsiCommand,
    ) -> Result<Response, CheckCondition> {
        match command {
            ScsiCommand::Inquiry {
                evpd,
                page_code,
                alloc_len,
            } => self.inquiry(ctx, evpd, page_code, alloc_len.into()),
            ScsiCommand::TestUnitReady => self.test_unit_ready(),
            ScsiCommand::RequestSense { alloc_len, .. } => {
                Ok(ctx.respond(&self.unit.sense.to_fixed(), alloc_len.into()))
            }
            ScsiCommand::ModeSense6 {
                page_code,
                subpage_code,
                alloc_len,
                ..
            } => self.mode_sense(ctx, ModeHeader::Six, page_code, subpage_code, alloc_len.into()),
            ScsiCommand::ModeSense10 {
                page_code,
                subpage_code,
                alloc_len,
                ..
            } => self.mode_sense(ctx, ModeHeader::Ten, page_code, subpage_code, alloc_len.into()),
            ScsiCommand::PreventAllowMediumRemoval { .. } | ScsiCommand::SynchronizeCache => {
                Ok(Response::none())
            }
            ScsiCommand::StartStopUnit { start, load_eject } => self.start_stop(start, load_eject),
            ScsiCommand::ReadCapacity10 => self.read_capacity_10(ctx),
            ScsiCommand::ReadCapacity16 { alloc_len } => {
                self.read_capacity_16(ctx, usize::try_from(alloc_len).unwrap_or(usize::MAX))
            }
            ScsiCommand::ReadFormatCapacities { alloc_len } => {
                self.read_format_capacities(ctx, alloc_len.into())
            }
            ScsiCommand::Read { lba, len } => {
                self.require_medium()?;
                let capacity = self.blocks_in_range(lba, len)?;
                ctx.start_blocks(
                    Phase::ReadBlocks,
                    lba,
                    len,
                    capacity.block_size,
                    self.buffer_len,
                )
                .map(Response::to_host)
            }
            ScsiCommand::Write { lba, len } => {
                if self.unit.is_read_only() {
                    return Err(CheckCondition(Sense::WRITE_PROTECTED));
                }
                self.require_medium()?;
                let capacity = self.blocks_in_range(lba, len)?;
                ctx.start_blocks(
                    Phase::WriteBlocks,
                    lba,
                    len,
                    capacity.block_size,
                    self.buffer_len,
                )
                .map(Response::from_host)
            }
            ScsiCommand::Verify { lba, len } => {
                self.blocks_in_range(lba, len)?;
                Ok(Response::none())
            }
            ScsiCommand::Unknown { opcode } => {
                warning!("usb: scsi: Unsupported opcode: {}", opcode);
                Err(CheckCondition(Sense::INVALID_COMMAND_OPERATION_CODE))
            }
        }
    }

    fn inquiry(
        &mut self,
        ctx: &mut ScsiContext,
        evpd: bool,
        page_code: u8,
        alloc_len: usize,
    ) -> Result<Response, CheckCondition> {
        if evpd || page_code != 0 {
            return Err(CheckCondition(Sense::INVALID_FIELD_IN_CDB));
        }

        let mut data = [0u8; INQUIRY_LEN];
        data[0] = 0x00; // periph qualifier, direct access block device
        data[1] = 0x80; // removable
        data[2] = 0x04; // SPC-2 compliance
        data[3] = 0x02; // response data format
        data[4] = (INQUIRY_LEN - 5) as u8;
        data[8..16].copy_from_slice(self.unit.vendor());
        data[16..32].copy_from_slice(self.unit.product());
        data[32..36].copy_from_slice(self.unit.revision());

        Ok(ctx.respond(&data, alloc_len))
    }

    fn test_unit_ready(&mut self) -> Result<Response, CheckCondition> {
        if self.unit.medium.ejected {
            return Err(MediaError::NotPresent.into());
        }

        self.device.status(self.lun)?;

        if !self.unit.medium.locked {
            if let Err(err) = self.device.lock(self.lun, self.lock_timeout_ms) {
                warning!("usb: scsi: Lock failed, lun: {}, err: {}", self.lun, err);
                return Err(MediaError::NotPresent.into());
            }
            info!("usb: scsi: Locked lun: {}", self.lun);
            self.unit.medium.locked = true;
        }

        Ok(Response::none())
    }

    fn mode_sense(
        &mut self,
        ctx: &mut ScsiContext,
        header: ModeHeader,
        page_code: u8,
        subpage_code: u8,
        alloc_len: usize,
    ) -> Result<Response, CheckCondition> {
        // no subpages are implemented
        if subpage_code != 0 {
            return Err(CheckCondition(Sense::INVALID_FIELD_IN_CDB));
        }

        let header_len = match header {
            ModeHeader::Six => MODE_HEADER_6_LEN,
            ModeHeader::Ten => MODE_HEADER_10_LEN,
        };

        let mut data = [0u8; RESPONSE_BUF_LEN];
        let pages_len = write_mode_pages(page_code, &mut data[header_len..])
            .ok_or(CheckCondition(Sense::INVALID_FIELD_IN_CDB))?;
        let total = header_len + pages_len;

        let device_specific = if self.unit.is_read_only() {
            DEVICE_SPECIFIC_WRITE_PROTECT
        } else {
            0x00
        };

        // medium type and block descriptor length stay zero
        match header {
            ModeHeader::Six => {
                data[0] = (total - 1) as u8;
                data[2] = device_specific;
            }
            ModeHeader::Ten => {
                data[..2].copy_from_slice(&((total - 2) as u16).to_be_bytes());
                data[3] = device_specific;
            }
        }

        Ok(ctx.respond(&data[..total], alloc_len))
    }

    fn start_stop(&mut self, start: bool, load_eject: bool) -> Result<Response, CheckCondition> {
        if !(load_eject && !start) {
            return Err(CheckCondition(Sense::INVALID_FIELD_IN_CDB));
        }

        self.unlock()?;
        self.unit.medium.ejected = true;
        info!("usb: scsi: Ejected lun: {}", self.lun);

        Ok(Response::none())
    }

    fn read_capacity_10(&mut self, ctx: &mut ScsiContext) -> Result<Response, CheckCondition> {
        self.require_medium()?;
        let capacity = self.capacity()?;

        let last_lba = u32::try_from(capacity.block_count.saturating_sub(1)).unwrap_or(u32::MAX);
        let mut data = [0u8; READ_CAPACITY_10_LEN];
        data[..4].copy_from_slice(&last_lba.to_be_bytes());
        data[4..].copy_from_slice(&capacity.block_size.to_be_bytes());

        Ok(ctx.respond(&data, READ_CAPACITY_10_LEN))
    }

    fn read_capacity_16(
        &mut self,
        ctx: &mut ScsiContext,
        alloc_len: usize,
    ) -> Result<Response, CheckCondition> {
        self.require_medium()?;
        let capacity = self.capacity()?;

        let mut data = [0u8; READ_CAPACITY_16_LEN];
        data[..8].copy_from_slice(&capacity.block_count.saturating_sub(1).to_be_bytes());
        data[8..12].copy_from_slice(&capacity.block_size.to_be_bytes());

        Ok(ctx.respond(&data, alloc_len))
    }

    fn read_format_capacities(
        &mut self,
        ctx: &mut ScsiContext,
        alloc_len: usize,
    ) -> Result<Response, CheckCondition> {
        self.require_medium()?;
        let capacity = self.capacity()?;

        let blocks = u32::try_from(capacity.block_count).unwrap_or(u32::MAX);
        let mut data = [0u8; READ_FORMAT_CAPACITIES_LEN];
        data[3] = 0x08; // capacity list length
        data[4..8].copy_from_slice(&blocks.to_be_bytes());
        data[8] = FORMATTED_MEDIA;
        data[9..12].copy_from_slice(&capacity.block_size.to_be_bytes()[1..]);

        Ok(ctx.respond(&data, alloc_len))
    }

    fn require_medium(&self) -> Result<(), CheckCondition> {
        if self.unit.medium.ejected || !self.unit.medium.locked {
            Err(MediaError::NotPresent.into())
        } else {
            Ok(())
        }
    }

    fn capacity(&mut self) -> Result<Capacity, CheckCondition> {
        let capacity = self.device.capacity(self.lun)?;
        self.unit.set_capacity(capacity);
        Ok(capacity)
    }

    fn blocks_in_range(&mut self, lba: u64, blocks: u32) -> Result<Capacity, CheckCondition> {
        let capacity = self.capacity()?;
        lba.checked_add(u64::from(blocks))
            .filter(|end| *end <= capacity.block_count)
            .ok_or(CheckCondition(Sense::LBA_OUT_OF_RANGE))?;
        Ok(capacity)
    }

    fn unlock(&mut self) -> Result<(), MediaError> {
        if self.unit.medium.ejected || !self.unit.medium.locked {
            return Ok(());
        }
        self.device.unlock(self.lun)?;
        self.unit.medium.locked = false;
        info!("usb: scsi: Unlocked lun: {}", self.lun);
        Ok(())
    }
}

/// Writes the requested mode pages into `out`, returning their total length
fn write_mode_pages(page_code: u8, out: &mut [u8]) -> Option<usize> {
    let pages: &[&[u8; MODE_PAGE_LEN]] = match page_code {
        PAGE_RW_ERROR_RECOVERY => &[&RW_ERROR_RECOVERY_PAGE],
        PAGE_INFORMATIONAL_EXCEPTIONS => &[&INFORMATIONAL_EXCEPTIONS_PAGE],
        PAGE_ALL => &[&RW_ERROR_RECOVERY_PAGE, &INFORMATIONAL_EXCEPTIONS_PAGE],
        _ => return None,
    };

    let mut len = 0;
    for page in pages {
        out[len..len + MODE_PAGE_LEN].copy_from_slice(*page);
        len += MODE_PAGE_LEN;
    }
    Some(len)
}
