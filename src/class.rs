//! USB class driver side of a Mass Storage function
//!
//! [MassStorageClass] is polled by the USB device core, usually from the USB interrupt.
//! It answers class requests and forwards endpoint events to the [BulkOnly] worker
//! through [MscShared].
//!
//! [BulkOnly]: crate::transport::bbb::BulkOnly

use crate::fmt::{debug, info, warning};
use crate::subclass::scsi::SUBCLASS_SCSI;
use crate::transport::bbb::{
    BulkEndpoint, BulkOnlyError, Endpoints, State, CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET,
    CLASS_SPECIFIC_GET_MAX_LUN, TRANSPORT_BBB,
};
use crate::transport::EndpointDriver;
use crate::{CLASS_MASS_STORAGE, MAX_LUN_COUNT};
use core::cell::Cell;
use critical_section::Mutex;
use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

/// Request-layer timeout for GET MAX LUN and Bulk-Only Mass Storage Reset
pub const CONTROL_TIMEOUT_MS: u32 = 5000;

/* Standard requests */
const CLEAR_FEATURE: u8 = 0x01;
const FEATURE_ENDPOINT_HALT: u16 = 0x00;
const ENDPOINT_ADDRESS_MASK: u16 = 0x8F;

/// Wakes the worker task from interrupt context.
///
/// Wakes must not get lost: a [wake] issued before [wait] makes the next [wait]
/// return immediately, the way a counting semaphore behaves.
///
/// [wake]: WakeSignal::wake
/// [wait]: WakeSignal::wait
pub trait WakeSignal {
    /// Blocks the worker until woken
    fn wait(&self);

    /// Called from interrupt context
    fn wake(&self);
}

/// Busy-waiting [WakeSignal] for single task firmware
pub struct PollSignal {
    count: Mutex<Cell<u32>>,
}

impl PollSignal {
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(Cell::new(0)),
        }
    }
}

impl Default for PollSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal for PollSignal {
    fn wait(&self) {
        loop {
            let woken = critical_section::with(|cs| {
                let count = self.count.borrow(cs);
                match count.get() {
                    0 => false,
                    n => {
                        count.set(n - 1);
                        true
                    }
                }
            });
            if woken {
                return;
            }
            core::hint::spin_loop();
        }
    }

    fn wake(&self) {
        critical_section::with(|cs| {
            let count = self.count.borrow(cs);
            count.set(count.get().saturating_add(1));
        });
    }
}

/// Link state as seen by the worker at the start of a step
#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Link {
    pub(crate) configured: bool,
    /// Bumped on each connect
    pub(crate) session: u32,
    /// Published by the worker
    pub(crate) state: State,
    /// Posted by interrupt context, adopted by the worker on its next step
    pub(crate) next: Option<State>,
    pub(crate) stalled: bool,
}

impl Link {
    const INIT: Link = Link {
        configured: false,
        session: 0,
        state: State::None,
        next: None,
        stalled: false,
    };

    fn effective(&self) -> State {
        self.next.unwrap_or(self.state)
    }
}

/// State shared between the [MassStorageClass] and the [BulkOnly] worker
///
/// [BulkOnly]: crate::transport::bbb::BulkOnly
pub struct MscShared<S: WakeSignal> {
    link: Mutex<Cell<Link>>,
    signal: S,
    lun_count: u8,
}

impl<S: WakeSignal> MscShared<S> {
    /// Creates a link for a function exposing `lun_count` Logical Units
    pub const fn new(lun_count: u8, signal: S) -> Self {
        Self {
            link: Mutex::new(Cell::new(Link::INIT)),
            signal,
            lun_count,
        }
    }

    pub fn lun_count(&self) -> u8 {
        self.lun_count
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }

    /// Communication state, including a transition not yet picked up by the worker
    pub fn state(&self) -> State {
        self.with(|link| link.effective())
    }

    pub fn is_configured(&self) -> bool {
        self.with(|link| link.configured)
    }

    /// Whether the worker stalled an endpoint and waits for the host to clear it
    pub fn is_stalled(&self) -> bool {
        self.with(|link| link.stalled)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Link) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.link.borrow(cs);
            let mut link = cell.get();
            let result = f(&mut link);
            cell.set(link);
            result
        })
    }

    /// Adopts a posted transition and returns the resulting link
    pub(crate) fn begin_step(&self) -> Link {
        self.with(|link| {
            if let Some(next) = link.next.take() {
                debug!("usb: msc: Enter state: {}", next);
                link.state = next;
            }
            *link
        })
    }

    pub(crate) fn set_state(&self, state: State) {
        debug!("usb: msc: Enter state: {}", state);
        self.with(|link| link.state = state);
    }

    pub(crate) fn enter_stall(&self, state: State) {
        debug!("usb: msc: Enter state: {}", state);
        self.with(|link| {
            link.state = state;
            link.stalled = true;
        });
    }

    pub(crate) fn clear_stall(&self) {
        self.with(|link| link.stalled = false);
    }

    /// Whether interrupt context posted a transition the worker has not adopted yet
    pub(crate) fn has_pending(&self) -> bool {
        self.with(|link| link.next.is_some())
    }

    pub(crate) fn wait(&self) {
        self.signal.wait()
    }

    fn post(&self, f: impl FnOnce(&mut Link)) {
        self.with(f);
        self.signal.wake();
    }

    pub(crate) fn connect(&self) {
        self.post(|link| {
            link.configured = true;
            link.session = link.session.wrapping_add(1);
            link.next = Some(State::AwaitingCbw);
            link.stalled = false;
        });
    }

    pub(crate) fn disconnect(&self) {
        self.post(|link| {
            link.configured = false;
            link.next = Some(State::None);
        });
    }

    pub(crate) fn mass_storage_reset(&self) {
        self.post(|link| link.next = Some(State::ResetRecoveryBulkInStall));
    }

    /// Advances a stall state once `ep` is no longer halted.
    /// Returns whether a transition was posted.
    pub(crate) fn endpoint_state_update(&self, ep: BulkEndpoint, stalled: bool) -> bool {
        if stalled {
            return false;
        }

        let posted = self.with(|link| {
            let next = match (link.effective(), ep) {
                (State::BulkInStall, BulkEndpoint::In) => Some(State::SendingCsw),
                (State::BulkOutStall, BulkEndpoint::Out) => Some(State::SendingCsw),
                (State::ResetRecoveryBulkInStall, BulkEndpoint::In) => {
                    Some(State::ResetRecoveryBulkOutStall)
                }
                (State::ResetRecoveryBulkOutStall, BulkEndpoint::Out) => {
                    Some(State::ResetRecovery)
                }
                (State::BulkInStall, BulkEndpoint::Out)
                | (State::BulkOutStall, BulkEndpoint::In)
                | (State::ResetRecoveryBulkInStall, BulkEndpoint::Out)
                | (State::ResetRecoveryBulkOutStall, BulkEndpoint::In)
                | (State::None, _)
                | (State::AwaitingCbw, _)
                | (State::DataPhase, _)
                | (State::SendingCsw, _)
                | (State::ResetRecovery, _) => None,
            };
            if let Some(state) = next {
                link.next = next;
                if state == State::SendingCsw {
                    link.stalled = false;
                }
            }
            next
        });

        match posted {
            Some(next) => {
                info!("usb: msc: Halt cleared on {} ep, next: {}", ep, next);
                self.signal.wake();
                true
            }
            None => false,
        }
    }
}

/// How [MassStorageClass::class_request] handled a control request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassReply {
    /// Not addressed to this function
    Ignored,
    /// Addressed to this function but malformed or unsupported
    Rejected,
    /// Bulk-Only Mass Storage Reset accepted
    Accepted,
    /// GET MAX LUN answer
    MaxLun(u8),
}

/// Mass Storage Class driver: SCSI transparent command set over Bulk Only Transport
pub struct MassStorageClass<'a, 'alloc, B, D, S>
where
    B: UsbBus,
    D: EndpointDriver,
    S: WakeSignal,
{
    interface: InterfaceNumber,
    bulk_in: EndpointIn<'alloc, B>,
    bulk_out: EndpointOut<'alloc, B>,
    shared: &'a MscShared<S>,
    driver: &'a D,
    halt_cleared_in: bool,
    halt_cleared_out: bool,
}

impl<'a, 'alloc, B, D, S> MassStorageClass<'a, 'alloc, B, D, S>
where
    B: UsbBus,
    D: EndpointDriver,
    S: WakeSignal,
{
    /// Allocates the interface and both bulk endpoints
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `packet_size` - Maximum USB packet size. Allowed values: 8,16,32,64
    /// * `shared` - the link shared with the [BulkOnly] worker
    /// * `driver` - used to abort transfers and query halts from interrupt context
    ///
    /// # Errors
    /// [InvalidLunCount] if the link announces no Logical Units or more than 16
    ///
    /// # Panics
    /// Panics if endpoint allocations fails.
    ///
    /// [InvalidLunCount]: crate::transport::bbb::BulkOnlyError::InvalidLunCount
    /// [BulkOnly]: crate::transport::bbb::BulkOnly
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    pub fn new(
        alloc: &'alloc UsbBusAllocator<B>,
        packet_size: u16,
        shared: &'a MscShared<S>,
        driver: &'a D,
    ) -> Result<Self, BulkOnlyError> {
        if shared.lun_count() == 0 || shared.lun_count() > MAX_LUN_COUNT {
            return Err(BulkOnlyError::InvalidLunCount);
        }

        Ok(Self {
            interface: alloc.interface(),
            bulk_in: alloc.bulk(packet_size),
            bulk_out: alloc.bulk(packet_size),
            shared,
            driver,
            halt_cleared_in: false,
            halt_cleared_out: false,
        })
    }

    /// Addresses to hand over to the [BulkOnly] worker
    ///
    /// [BulkOnly]: crate::transport::bbb::BulkOnly
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            bulk_in: self.bulk_in.address(),
            bulk_out: self.bulk_out.address(),
        }
    }

    pub fn shared(&self) -> &'a MscShared<S> {
        self.shared
    }

    /// The host activated a configuration containing this function
    pub fn connect(&mut self) {
        info!("usb: msc: Connect");
        self.halt_cleared_in = false;
        self.halt_cleared_out = false;
        self.shared.connect();
    }

    /// The configuration is gone. Cancels transfers in flight.
    pub fn disconnect(&mut self) {
        info!("usb: msc: Disconnect");
        self.shared.disconnect();
        self.abort_all();
    }

    /// Handles a class-specific request addressed to this interface
    ///
    /// Never waits for the worker, so the reply is ready well within
    /// [CONTROL_TIMEOUT_MS] even while a bulk transfer is in flight.
    pub fn class_request(&mut self, req: &Request) -> ClassReply {
        if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
            return ClassReply::Ignored;
        }
        if req.index != u8::from(self.interface) as u16 {
            return ClassReply::Ignored;
        }

        info!("usb: msc: Recv class request: {}", req.request);

        match req.request {
            // USB BBB doc, section 3.1
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET => {
                if req.direction == UsbDirection::Out && req.value == 0 && req.length == 0 {
                    self.shared.mass_storage_reset();
                    self.abort_all();
                    ClassReply::Accepted
                } else {
                    ClassReply::Rejected
                }
            }
            // USB BBB doc, section 3.2
            CLASS_SPECIFIC_GET_MAX_LUN => {
                if req.direction == UsbDirection::In && req.value == 0 && req.length == 1 {
                    ClassReply::MaxLun(self.shared.lun_count() - 1)
                } else {
                    ClassReply::Rejected
                }
            }
            _ => ClassReply::Rejected,
        }
    }

    /// Re-examines the halt condition of `addr` and advances the worker's stall state
    pub fn endpoint_state_update(&mut self, addr: EndpointAddress) {
        let ep = if addr == self.bulk_in.address() {
            BulkEndpoint::In
        } else if addr == self.bulk_out.address() {
            BulkEndpoint::Out
        } else {
            return;
        };

        let stalled = self.driver.is_stalled(addr);
        self.shared.endpoint_state_update(ep, stalled);
    }

    fn abort_all(&self) {
        self.driver.abort(self.bulk_in.address());
        self.driver.abort(self.bulk_out.address());
    }

    /// Records a CLEAR_FEATURE(ENDPOINT_HALT) for one of the bulk endpoints.
    /// The device core performs the clear itself.
    fn record_halt_clear(&mut self, req: &Request) -> bool {
        if !(req.request_type == RequestType::Standard
            && req.recipient == Recipient::Endpoint
            && req.request == CLEAR_FEATURE
            && req.value == FEATURE_ENDPOINT_HALT)
        {
            return false;
        }

        let addr = EndpointAddress::from((req.index & ENDPOINT_ADDRESS_MASK) as u8);
        if addr == self.bulk_in.address() {
            self.halt_cleared_in = true;
        } else if addr == self.bulk_out.address() {
            self.halt_cleared_out = true;
        } else {
            return false;
        }
        debug!("usb: msc: Halt clear requested: {}", u8::from(addr));
        true
    }
}

impl<B, D, S> UsbClass<B> for MassStorageClass<'_, '_, B, D, S>
where
    B: UsbBus,
    D: EndpointDriver,
    S: WakeSignal,
{
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.iad(
            self.interface,
            1,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            TRANSPORT_BBB,
            None,
        )?;
        writer.interface(self.interface, CLASS_MASS_STORAGE, SUBCLASS_SCSI, TRANSPORT_BBB)?;
        writer.endpoint(&self.bulk_in)?;
        writer.endpoint(&self.bulk_out)?;
        Ok(())
    }

    fn reset(&mut self) {
        info!("usb: msc: Recv bus reset");
        self.disconnect();
    }

    fn poll(&mut self) {
        if self.halt_cleared_in {
            self.halt_cleared_in = false;
            self.endpoint_state_update(self.bulk_in.address());
        }
        if self.halt_cleared_out {
            self.halt_cleared_out = false;
            self.endpoint_state_update(self.bulk_out.address());
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        let result = match self.class_request(&req) {
            ClassReply::Ignored => return,
            ClassReply::MaxLun(max_lun) => xfer.accept_with(&[max_lun]),
            ClassReply::Accepted | ClassReply::Rejected => xfer.reject(),
        };
        if let Err(err) = result {
            warning!("usb: msc: Control IN failed: {}", err);
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();
        if self.record_halt_clear(&req) {
            return;
        }

        let result = match self.class_request(&req) {
            ClassReply::Ignored => return,
            ClassReply::Accepted => xfer.accept(),
            ClassReply::MaxLun(_) | ClassReply::Rejected => xfer.reject(),
        };
        if let Err(err) = result {
            warning!("usb: msc: Control OUT failed: {}", err);
        }
    }
}
