use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::bus::{PollResult, UsbBus};
use usb_device::class_prelude::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};
use usbd_msc::transport::bbb::CSW_LEN;
use usbd_msc::transport::{
    CommandStatus, DataDirection, EndpointDriver, Timeout, TransferError,
};

const MAX_CB_LEN: usize = 16;

pub const EP_OUT_ADDR: u8 = 0x01;
pub const EP_IN_ADDR: u8 = 0x81;

pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn new(tag: u32, data_transfer_len: u32, direction: DataDirection, block: Vec<u8>) -> Self {
        Self {
            tag,
            data_transfer_len,
            direction,
            lun: 0,
            block,
        }
    }

    pub fn into_bytes(&self) -> Vec<u8> {
        const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();

        assert!((1..=MAX_CB_LEN).contains(&self.block.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(CBW_SIGNATURE_LE.as_slice()); // signature
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice()); // tag
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice()); // data transfer len

        let direction = match self.direction {
            DataDirection::In => 1_u8 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0u8,
        };
        bytes.push(direction); // direction
        bytes.push(self.lun); // lun
        bytes.push(self.block.len() as u8); // block size

        let mut block = vec![0u8; MAX_CB_LEN];
        block.as_mut_slice()[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice()); // block

        bytes
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(CSW_SIGNATURE_LE.as_slice(), &bytes[..4]);

        let status = match bytes[12] {
            0x00 => CommandStatus::Passed,
            0x01 => CommandStatus::Failed,
            0x02 => CommandStatus::PhaseError,
            _ => panic!("invalid status code"),
        };

        Self {
            tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            data_residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            status,
        }
    }
}

pub struct DummyEp {
    addr: EndpointAddress,
    max_packet_size: u16,
    stalled: bool,
    packets: VecDeque<Vec<u8>>,
}

impl DummyEp {
    pub fn new(addr: EndpointAddress, max_packet_size: u16) -> Self {
        Self {
            addr,
            max_packet_size,
            stalled: false,
            packets: VecDeque::new(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(self.max_packet_size as usize) {
            self.packets.push_back(chunk.to_vec());
        }
    }
}

/// Bus and bulk transfer driver in one, with the host side exposed to tests
#[derive(Clone)]
pub struct DummyUsbBus {
    inner: Arc<Mutex<Inner>>,
}

impl DummyUsbBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Write Command Block Wrapper as if it was written by a USB host
    pub fn write_cbw(&self, cbw: &Cbw) {
        self.write_data(cbw.into_bytes().as_slice());
    }

    /// Write some data as if it was written by a USB host during Host to Device data transfer
    pub fn write_data(&self, data: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_out.as_mut().unwrap();
        ep.write_bytes(data);
    }

    /// Whether the device has not consumed everything the host wrote yet
    pub fn has_out_data(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.ep_out.as_ref().map_or(false, |ep| !ep.packets.is_empty())
    }

    /// Read a single packet as if it was read by a USB host
    pub fn read_packet(&self) -> Option<Vec<u8>> {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_in.as_mut().unwrap().packets.pop_front()
    }

    /// Read everything the device has sent so far
    pub fn read_all(&self) -> Vec<u8> {
        let mut bytes = vec![];
        while let Some(mut packet) = self.read_packet() {
            bytes.append(&mut packet);
        }
        bytes
    }

    /// Read Command Status as if it was read by a USB host
    pub fn read_csw(&self) -> Option<Csw> {
        let mut bytes = vec![];
        while bytes.len() < CSW_LEN {
            let mut packet = self.read_packet()?;
            bytes.append(&mut packet);
        }
        Some(Csw::from_bytes(bytes.as_slice()))
    }

    pub fn is_halted(&self, addr: u8) -> bool {
        UsbBus::is_stalled(self, EndpointAddress::from(addr))
    }

    /// Clear a halt the way the device core does on CLEAR_FEATURE(ENDPOINT_HALT)
    pub fn clear_halt(&self, addr: u8) {
        UsbBus::set_stalled(self, EndpointAddress::from(addr), false);
    }

    pub fn aborts(&self) -> usize {
        self.inner.lock().unwrap().aborts
    }

    /// Make the next bulk IN transfer fail with `err`
    pub fn fail_next_transmit(&self, err: TransferError) {
        self.inner.lock().unwrap().transmit_fault = Some(err);
    }

    /// Make the next bulk OUT transfer fail with `err`
    pub fn fail_next_receive(&self, err: TransferError) {
        self.inner.lock().unwrap().receive_fault = Some(err);
    }
}

struct Inner {
    enabled: bool,
    ep_in: Option<DummyEp>,
    ep_out: Option<DummyEp>,
    aborts: usize,
    transmit_fault: Option<TransferError>,
    receive_fault: Option<TransferError>,
}

impl Inner {
    fn new() -> Self {
        Self {
            enabled: false,
            ep_in: None,
            ep_out: None,
            aborts: 0,
            transmit_fault: None,
            receive_fault: None,
        }
    }

    fn ep(&mut self, addr: EndpointAddress) -> Option<&mut DummyEp> {
        [self.ep_in.as_mut(), self.ep_out.as_mut()]
            .into_iter()
            .flatten()
            .find(|ep| ep.addr == addr)
    }
}

impl UsbBus for DummyUsbBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        _ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        assert!(!self.inner.lock().unwrap().enabled);

        if matches!(ep_type, EndpointType::Control) {
            return Ok(EndpointAddress::from_parts(0, ep_dir));
        }

        let mut lock = self.inner.lock().unwrap();
        let addr = match ep_dir {
            UsbDirection::Out => {
                let addr = EndpointAddress::from(EP_OUT_ADDR);
                lock.ep_out.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
            UsbDirection::In => {
                let addr = EndpointAddress::from(EP_IN_ADDR);
                lock.ep_in.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
        };

        Ok(addr)
    }

    fn enable(&mut self) {
        self.inner.lock().unwrap().enabled = true;
    }

    fn reset(&self) {}

    fn set_device_address(&self, _addr: u8) {}

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep(ep_addr).ok_or(UsbError::InvalidEndpoint)?;

        if buf.len() > ep.max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }
        ep.packets.push_back(buf.to_vec());

        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep(ep_addr).ok_or(UsbError::InvalidEndpoint)?;

        match ep.packets.pop_front() {
            Some(packet) if packet.len() > buf.len() => Err(UsbError::BufferOverflow),
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => Err(UsbError::WouldBlock),
        }
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        if let Some(ep) = self.inner.lock().unwrap().ep(ep_addr) {
            ep.stalled = stalled;
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.inner
            .lock()
            .unwrap()
            .ep(ep_addr)
            .map_or(false, |ep| ep.stalled)
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        PollResult::None
    }
}

impl EndpointDriver for DummyUsbBus {
    /// Collects packets until the buffer is full or a short packet arrives
    fn receive(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        _timeout: Timeout,
    ) -> Result<usize, TransferError> {
        let mut lock = self.inner.lock().unwrap();
        if let Some(err) = lock.receive_fault.take() {
            return Err(err);
        }
        let ep = lock
            .ep(ep)
            .ok_or(TransferError::Usb(UsbError::InvalidEndpoint))?;

        let mut count = 0;
        let mut received = false;
        while count < buf.len() {
            let Some(len) = ep.packets.front().map(|p| p.len()) else {
                break;
            };
            if len > buf.len() - count {
                return Err(TransferError::Overflow);
            }
            let packet = ep.packets.pop_front().unwrap();
            buf[count..count + len].copy_from_slice(&packet);
            count += len;
            received = true;
            if len < ep.max_packet_size as usize {
                break;
            }
        }

        if received {
            Ok(count)
        } else {
            drop(lock);
            std::thread::yield_now();
            Err(TransferError::Timeout)
        }
    }

    fn transmit(
        &self,
        ep: EndpointAddress,
        buf: &[u8],
        _timeout: Timeout,
        zlp: bool,
    ) -> Result<usize, TransferError> {
        let mut lock = self.inner.lock().unwrap();
        if let Some(err) = lock.transmit_fault.take() {
            return Err(err);
        }
        let ep = lock
            .ep(ep)
            .ok_or(TransferError::Usb(UsbError::InvalidEndpoint))?;

        ep.write_bytes(buf);
        if zlp && buf.len() % ep.max_packet_size as usize == 0 {
            ep.packets.push_back(vec![]);
        }

        Ok(buf.len())
    }

    fn set_stalled(&self, ep: EndpointAddress, stalled: bool) {
        UsbBus::set_stalled(self, ep, stalled)
    }

    fn is_stalled(&self, ep: EndpointAddress) -> bool {
        UsbBus::is_stalled(self, ep)
    }

    fn abort(&self, _ep: EndpointAddress) {
        self.inner.lock().unwrap().aborts += 1;
    }
}
