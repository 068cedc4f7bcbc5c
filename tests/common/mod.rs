#![allow(dead_code)]

use crate::common::bbb::{Cbw, Csw, DummyUsbBus};
use crate::common::storage::RamDisk;
use std::sync::mpsc::sync_channel;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;
use usb_device::bus::UsbBusAllocator;
use usbd_msc::class::{MassStorageClass, MscShared, WakeSignal};
use usbd_msc::storage::LogicalUnit;
use usbd_msc::subclass::scsi::Scsi;
use usbd_msc::transport::bbb::{BulkOnly, ClassState, Config, State, CSW_LEN};

pub mod bbb;
pub mod scsi;
pub mod storage;

pub const PACKET_SIZE: [u16; 4] = [8, 16, 32, 64];

pub const IO_BUF_LEN: usize = 1024;

pub type TestScsi = Scsi<RamDisk, Vec<LogicalUnit>>;
pub type TestBulkOnly<'a> = BulkOnly<'a, DummyUsbBus, TestSignal, TestScsi, Vec<u8>>;
pub type TestClass<'a> = MassStorageClass<'a, 'a, DummyUsbBus, DummyUsbBus, TestSignal>;

/// Counting semaphore backed by a condition variable
pub struct TestSignal {
    count: Mutex<u32>,
    cond: Condvar,
}

impl TestSignal {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
}

impl WakeSignal for TestSignal {
    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn wake(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }
}

/// What the host observed during a single command
pub struct Transaction {
    pub data: Vec<u8>,
    /// `None` while the device holds an endpoint halted
    pub csw: Option<Csw>,
}

/// A configured Mass Storage function with both of its halves
pub struct Device<'a> {
    pub host: DummyUsbBus,
    pub class: TestClass<'a>,
    pub bulk: TestBulkOnly<'a>,
}

impl Device<'_> {
    pub fn state(&self) -> State {
        self.class.shared().state()
    }

    pub fn scsi(&self) -> &TestScsi {
        self.bulk.command_set()
    }

    pub fn disk(&self) -> &RamDisk {
        self.bulk.command_set().device()
    }

    pub fn is_stall_state(&self) -> bool {
        matches!(
            self.state(),
            State::BulkInStall
                | State::BulkOutStall
                | State::ResetRecoveryBulkInStall
                | State::ResetRecoveryBulkOutStall
        )
    }

    /// Steps the worker until it has nothing to do without the host
    pub fn process(&mut self) {
        loop {
            let run = match self.state() {
                State::None => self.bulk.class_state() == ClassState::Configured,
                State::AwaitingCbw => {
                    self.bulk.class_state() == ClassState::Initialized || self.host.has_out_data()
                }
                State::DataPhase | State::SendingCsw | State::ResetRecovery => true,
                State::BulkInStall
                | State::BulkOutStall
                | State::ResetRecoveryBulkInStall
                | State::ResetRecoveryBulkOutStall => false,
            };
            if !run {
                return;
            }
            self.bulk.step();
        }
    }

    /// Sends a CBW followed by `data_out` and collects everything the device sent back
    pub fn transact(&mut self, cbw: &Cbw, data_out: &[u8]) -> Transaction {
        self.host.write_cbw(cbw);
        if !data_out.is_empty() {
            self.host.write_data(data_out);
        }
        self.process();
        self.collect()
    }

    /// Collects what the device sent since the last call
    pub fn collect(&mut self) -> Transaction {
        let mut data = self.host.read_all();
        let csw = if self.is_stall_state() || data.len() < CSW_LEN {
            None
        } else {
            let csw = data.split_off(data.len() - CSW_LEN);
            Some(Csw::from_bytes(csw.as_slice()))
        };
        Transaction { data, csw }
    }

    /// Clears a halt the way the host does and lets the worker continue
    pub fn clear_halt(&mut self, addr: u8) {
        self.host.clear_halt(addr);
        self.class.endpoint_state_update(addr.into());
        self.process();
    }

    pub fn disconnect(&mut self) {
        self.class.disconnect();
        self.process();
    }

    pub fn connect(&mut self) {
        self.class.connect();
        self.process();
    }
}

/// Runs `f` against a connected device with an IO buffer of [IO_BUF_LEN]
pub fn with_device<F>(packet_size: u16, units: Vec<LogicalUnit>, disk: RamDisk, f: F)
where
    F: FnOnce(Device<'_>),
{
    let host = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(host.clone());
    let shared = MscShared::new(units.len() as u8, TestSignal::new());

    let class = MassStorageClass::new(&alloc, packet_size, &shared, &host).unwrap();
    let config = Config {
        packet_size,
        ..Default::default()
    };
    let bulk = BulkOnly::new(
        &shared,
        &host,
        class.endpoints(),
        config,
        Scsi::new(disk, units),
        vec![0u8; IO_BUF_LEN],
    )
    .unwrap();

    let mut device = Device {
        host: host.clone(),
        class,
        bulk,
    };
    device.connect();
    assert_eq!(ClassState::Configured, device.bulk.class_state());

    f(device);
}

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}
