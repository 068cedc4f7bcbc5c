use usbd_msc::subclass::scsi::command::ScsiCommand;

const UNKNOWN: u8 = 0xC0;
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const START_STOP_UNIT: u8 = 0x1B;
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const VERIFY_10: u8 = 0x2F;
const MODE_SENSE_10: u8 = 0x5A;
const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8A;
const SERVICE_ACTION_IN_16: u8 = 0x9E;
const READ_12: u8 = 0xA8;
const WRITE_12: u8 = 0xAA;

const SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;

pub fn cmd_into_bytes(cmd: ScsiCommand) -> Vec<u8> {
    let mut bytes = vec![];
    match cmd {
        ScsiCommand::Unknown { .. } => {
            bytes.push(UNKNOWN);
        }
        ScsiCommand::Inquiry {
            evpd,
            page_code,
            alloc_len,
        } => {
            bytes.push(INQUIRY);
            bytes.push(evpd as u8);
            bytes.push(page_code);
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0); // control
        }
        ScsiCommand::TestUnitReady => {
            bytes.extend_from_slice([TEST_UNIT_READY; 6].as_slice());
        }
        ScsiCommand::RequestSense { desc, alloc_len } => {
            bytes.push(REQUEST_SENSE);
            bytes.push(desc as u8);
            bytes.extend_from_slice([0; 2].as_slice());
            bytes.push(alloc_len);
            bytes.push(0);
        }
        ScsiCommand::StartStopUnit { start, load_eject } => {
            bytes.push(START_STOP_UNIT);
            bytes.extend_from_slice([0; 3].as_slice());
            bytes.push((start as u8) | ((load_eject as u8) << 1));
            bytes.push(0);
        }
        ScsiCommand::ReadCapacity10 => {
            bytes.push(READ_CAPACITY_10);
            bytes.extend_from_slice([0; 9].as_slice());
        }
        ScsiCommand::Read { lba, len } => {
            bytes.push(READ_10);
            bytes.push(0);
            bytes.extend_from_slice((lba as u32).to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::Write { lba, len } => {
            bytes.push(WRITE_10);
            bytes.push(0);
            bytes.extend_from_slice((lba as u32).to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::ReadCapacity16 { alloc_len } => {
            bytes.push(SERVICE_ACTION_IN_16);
            bytes.push(SERVICE_ACTION_READ_CAPACITY_16);
            bytes.extend_from_slice([0; 8].as_slice()); // lba
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.extend_from_slice([0; 2].as_slice());
        }
        ScsiCommand::Verify { lba, len } => {
            bytes.push(VERIFY_10);
            bytes.push(0);
            bytes.extend_from_slice((lba as u32).to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::ModeSense10 {
            dbd,
            page_control,
            page_code,
            subpage_code,
            alloc_len,
        } => {
            bytes.push(MODE_SENSE_10);
            bytes.push((dbd as u8) << 3);
            bytes.push(((page_control as u8) << 6) | page_code);
            bytes.push(subpage_code);
            bytes.extend_from_slice([0; 3].as_slice());
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        cmd => unimplemented!("{:?}", cmd),
    }
    bytes
}

/// READ (12) or WRITE (12) command block
fn cdb_12(opcode: u8, lba: u32, len: u32) -> Vec<u8> {
    let mut bytes = vec![opcode, 0];
    bytes.extend_from_slice(lba.to_be_bytes().as_slice());
    bytes.extend_from_slice(len.to_be_bytes().as_slice());
    bytes.extend_from_slice([0; 2].as_slice());
    bytes
}

/// READ (16) or WRITE (16) command block
fn cdb_16(opcode: u8, lba: u64, len: u32) -> Vec<u8> {
    let mut bytes = vec![opcode, 0];
    bytes.extend_from_slice(lba.to_be_bytes().as_slice());
    bytes.extend_from_slice(len.to_be_bytes().as_slice());
    bytes.extend_from_slice([0; 2].as_slice());
    bytes
}

pub fn read_12(lba: u32, len: u32) -> Vec<u8> {
    cdb_12(READ_12, lba, len)
}

pub fn write_12(lba: u32, len: u32) -> Vec<u8> {
    cdb_12(WRITE_12, lba, len)
}

pub fn read_16(lba: u64, len: u32) -> Vec<u8> {
    cdb_16(READ_16, lba, len)
}

pub fn write_16(lba: u64, len: u32) -> Vec<u8> {
    cdb_16(WRITE_16, lba, len)
}
