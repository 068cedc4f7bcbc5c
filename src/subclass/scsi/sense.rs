//! SCSI sense data

use crate::storage::MediaError;

/// Fixed format sense data length
pub const SENSE_LEN: usize = 18;

const RESPONSE_CODE_CURRENT_FIXED: u8 = 0x70;

/* Additional sense codes */
const ASC_NO_ADDITIONAL_SENSE: u8 = 0x00;
const ASC_LUN_NOT_READY: u8 = 0x04;
const ASC_INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
const ASC_LUN_NOT_SUPPORTED: u8 = 0x25;
const ASC_WRITE_PROTECTED: u8 = 0x27;
const ASC_NOT_READY_TO_READY_CHANGE: u8 = 0x28;
const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
const ASC_INTERNAL_TARGET_FAILURE: u8 = 0x44;

#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    #[default]
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

/// Sense key, additional sense code and its qualifier
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NO_SENSE: Sense = Sense::new(SenseKey::NoSense, ASC_NO_ADDITIONAL_SENSE, 0x00);
    pub const MEDIUM_NOT_PRESENT: Sense = Sense::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT, 0x00);
    pub const NOT_READY_TO_READY_CHANGE: Sense =
        Sense::new(SenseKey::UnitAttention, ASC_NOT_READY_TO_READY_CHANGE, 0x00);
    pub const LOGICAL_UNIT_NOT_READY: Sense = Sense::new(SenseKey::NotReady, ASC_LUN_NOT_READY, 0x00);
    pub const LOGICAL_UNIT_NOT_SUPPORTED: Sense =
        Sense::new(SenseKey::IllegalRequest, ASC_LUN_NOT_SUPPORTED, 0x00);
    pub const UNIT_ATTENTION: Sense = Sense::new(SenseKey::UnitAttention, ASC_NO_ADDITIONAL_SENSE, 0x00);
    pub const INTERNAL_TARGET_FAILURE: Sense =
        Sense::new(SenseKey::HardwareError, ASC_INTERNAL_TARGET_FAILURE, 0x00);
    pub const INVALID_COMMAND_OPERATION_CODE: Sense =
        Sense::new(SenseKey::IllegalRequest, ASC_INVALID_COMMAND_OPERATION_CODE, 0x00);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE, 0x00);
    pub const INVALID_FIELD_IN_CDB: Sense =
        Sense::new(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB, 0x00);
    pub const WRITE_PROTECTED: Sense = Sense::new(SenseKey::DataProtect, ASC_WRITE_PROTECTED, 0x00);

    pub const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Fixed format sense data for the current error
    pub fn to_fixed(&self) -> [u8; SENSE_LEN] {
        [
            RESPONSE_CODE_CURRENT_FIXED,
            0x00,           // obsolete
            self.key as u8, // bits 3..0
            0x00,
            0x00,
            0x00,
            0x00,                  // information
            (SENSE_LEN - 8) as u8, // additional sense length
            0x00,
            0x00,
            0x00,
            0x00, // command-specific information
            self.asc,
            self.ascq,
            0x00, // field replaceable unit code
            0x00,
            0x00,
            0x00, // sense-key specific
        ]
    }
}

/// The one place backend errors become sense data
impl From<MediaError> for Sense {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NotPresent | MediaError::ReadyToNotReady => Sense::MEDIUM_NOT_PRESENT,
            MediaError::NotReadyToReady => Sense::NOT_READY_TO_READY_CHANGE,
            MediaError::LunNotReady => Sense::LOGICAL_UNIT_NOT_READY,
            MediaError::LunUnsupported => Sense::LOGICAL_UNIT_NOT_SUPPORTED,
            MediaError::Busy => Sense::UNIT_ATTENTION,
            MediaError::Timeout | MediaError::Io => Sense::INTERNAL_TARGET_FAILURE,
        }
    }
}
