//! SCSI command blocks

use num_enum::TryFromPrimitive;

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const MODE_SENSE_10: u8 = 0x5A;

/* SBC */
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const VERIFY_10: u8 = 0x2F;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;
const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8A;
const VERIFY_16: u8 = 0x8F;
const SERVICE_ACTION_IN_16: u8 = 0x9E;
const READ_12: u8 = 0xA8;
const WRITE_12: u8 = 0xAA;
const VERIFY_12: u8 = 0xAF;

const SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;

/* MMC */
const READ_FORMAT_CAPACITIES: u8 = 0x23;

const MAX_CB_LEN: usize = 16;

/// SCSI command
///
/// Refer to specifications (SPC,SBC,MMC)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    Unknown {
        opcode: u8,
    },

    /* SPC */
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    TestUnitReady,
    RequestSense {
        desc: bool,
        alloc_len: u8,
    },
    ModeSense6 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u8,
    },
    ModeSense10 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u16,
    },
    PreventAllowMediumRemoval {
        prevent: bool,
    },
    StartStopUnit {
        start: bool,
        load_eject: bool,
    },

    /* SBC */
    ReadCapacity10,
    ReadCapacity16 {
        alloc_len: u32,
    },
    Read {
        lba: u64,
        len: u32,
    },
    Write {
        lba: u64,
        len: u32,
    },
    Verify {
        lba: u64,
        len: u32,
    },
    SynchronizeCache,

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

/// Length of a command block as implied by the group code of its opcode
pub fn cdb_len(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None, // reserved and vendor specific groups
    }
}

/// Parses a command block.
///
/// Returns `None` if the block is empty or shorter than its opcode requires.
pub fn parse_cb(cb: &[u8]) -> Option<ScsiCommand> {
    let opcode = *cb.first()?;
    if cb.len() < cdb_len(opcode).unwrap_or(1) {
        return None;
    }

    // zero-extend so that every field below is addressable
    let mut block = [0u8; MAX_CB_LEN];
    let len = cb.len().min(MAX_CB_LEN);
    block[..len].copy_from_slice(&cb[..len]);
    let cb = &block;

    let command = match opcode {
        TEST_UNIT_READY => ScsiCommand::TestUnitReady,
        INQUIRY => ScsiCommand::Inquiry {
            evpd: (cb[1] & 0b00000001) != 0,
            page_code: cb[2],
            alloc_len: be_u16(cb, 3),
        },
        REQUEST_SENSE => ScsiCommand::RequestSense {
            desc: (cb[1] & 0b00000001) != 0,
            alloc_len: cb[4],
        },
        MODE_SENSE_6 => ScsiCommand::ModeSense6 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: page_control(cb[2]),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: cb[4],
        },
        MODE_SENSE_10 => ScsiCommand::ModeSense10 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: page_control(cb[2]),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: be_u16(cb, 7),
        },
        PREVENT_ALLOW_MEDIUM_REMOVAL => ScsiCommand::PreventAllowMediumRemoval {
            prevent: (cb[4] & 0b00000011) != 0,
        },
        START_STOP_UNIT => ScsiCommand::StartStopUnit {
            start: (cb[4] & 0b00000001) != 0,
            load_eject: (cb[4] & 0b00000010) != 0,
        },
        READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
        SERVICE_ACTION_IN_16 if (cb[1] & 0b00011111) == SERVICE_ACTION_READ_CAPACITY_16 => {
            ScsiCommand::ReadCapacity16 {
                alloc_len: be_u32(cb, 10),
            }
        }
        READ_10 => ScsiCommand::Read {
            lba: be_u32(cb, 2) as u64,
            len: be_u16(cb, 7) as u32,
        },
        READ_12 => ScsiCommand::Read {
            lba: be_u32(cb, 2) as u64,
            len: be_u32(cb, 6),
        },
        READ_16 => ScsiCommand::Read {
            lba: be_u64(cb, 2),
            len: be_u32(cb, 10),
        },
        WRITE_10 => ScsiCommand::Write {
            lba: be_u32(cb, 2) as u64,
            len: be_u16(cb, 7) as u32,
        },
        WRITE_12 => ScsiCommand::Write {
            lba: be_u32(cb, 2) as u64,
            len: be_u32(cb, 6),
        },
        WRITE_16 => ScsiCommand::Write {
            lba: be_u64(cb, 2),
            len: be_u32(cb, 10),
        },
        VERIFY_10 => ScsiCommand::Verify {
            lba: be_u32(cb, 2) as u64,
            len: be_u16(cb, 7) as u32,
        },
        VERIFY_12 => ScsiCommand::Verify {
            lba: be_u32(cb, 2) as u64,
            len: be_u32(cb, 6),
        },
        VERIFY_16 => ScsiCommand::Verify {
            lba: be_u64(cb, 2),
            len: be_u32(cb, 10),
        },
        SYNCHRONIZE_CACHE_10 => ScsiCommand::SynchronizeCache,
        READ_FORMAT_CAPACITIES => ScsiCommand::ReadFormatCapacities {
            alloc_len: be_u16(cb, 7),
        },
        opcode => ScsiCommand::Unknown { opcode },
    };

    Some(command)
}

fn page_control(byte: u8) -> PageControl {
    PageControl::try_from_primitive(byte >> 6).unwrap_or(PageControl::CurrentValues)
}

fn be_u16(cb: &[u8; MAX_CB_LEN], at: usize) -> u16 {
    u16::from_be_bytes([cb[at], cb[at + 1]])
}

fn be_u32(cb: &[u8; MAX_CB_LEN], at: usize) -> u32 {
    u32::from_be_bytes([cb[at], cb[at + 1], cb[at + 2], cb[at + 3]])
}

fn be_u64(cb: &[u8; MAX_CB_LEN], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&cb[at..at + 8]);
    u64::from_be_bytes(bytes)
}
