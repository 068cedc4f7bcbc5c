//! Bulk Only Transport (BBB/BOT)

use crate::class::{MscShared, WakeSignal};
use crate::fmt::{debug, info, trace, warning};
use crate::subclass::CommandSet;
use crate::transport::{CommandStatus, DataDirection, EndpointDriver, Timeout, TransferError};
use crate::MAX_LUN_COUNT;
use core::borrow::BorrowMut;
use core::cmp::{max, min};
use usb_device::endpoint::EndpointAddress;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

pub(crate) const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
pub(crate) const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;

/// Command Block Wrapper length
pub const CBW_LEN: usize = 31;
/// Command Status Wrapper length
pub const CSW_LEN: usize = 13;

const MAX_CB_LEN: usize = 16;
const DEFAULT_PACKET_SIZE: u16 = 64;

/// Why a received CBW is not meaningful
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InvalidCbwError {
    /// Not exactly 31 bytes
    Length,
    Signature,
    /// Reserved bits of the flags, LUN or CB length fields are set
    ReservedBits,
    /// CB length outside of 1..=16
    BlockLength,
    /// LUN not below the Logical Unit count
    Lun,
}

/// Bulk Only Transport configuration error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkOnlyError {
    /// Logical Unit count is 0 or above 16. Refer to USB BBB doc
    InvalidLunCount,
    /// The command set serves a different number of Logical Units than announced to the host
    LunCountMismatch,
    /// The IO buffer cannot fit a CBW, a single full packet or a block
    BufferTooSmall,
}

/// Communication state of a Bulk Only function
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No active configuration
    #[default]
    None,
    AwaitingCbw,
    DataPhase,
    SendingCsw,
    /// Waiting for the host to clear the bulk IN halt before the CSW
    BulkInStall,
    /// Waiting for the host to clear the bulk OUT halt before the CSW
    BulkOutStall,
    ResetRecoveryBulkInStall,
    ResetRecoveryBulkOutStall,
    ResetRecovery,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkEndpoint {
    In,
    Out,
}

/// Bulk endpoint addresses of a class instance
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Endpoints {
    pub bulk_in: EndpointAddress,
    pub bulk_out: EndpointAddress,
}

impl Endpoints {
    fn address(&self, ep: BulkEndpoint) -> EndpointAddress {
        match ep {
            BulkEndpoint::In => self.bulk_in,
            BulkEndpoint::Out => self.bulk_out,
        }
    }
}

/// Worker configuration
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Wait for the next CBW. Expiring retries the receive
    pub cbw_timeout: Timeout,
    /// Wait for each data phase transfer
    pub data_timeout: Timeout,
    /// Wait for the CSW to be taken by the host
    pub csw_timeout: Timeout,
    /// Maximum USB packet size. Allowed values: 8,16,32,64
    pub packet_size: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cbw_timeout: Timeout::Infinite,
            data_timeout: Timeout::Infinite,
            csw_timeout: Timeout::Infinite,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassState {
    #[default]
    Initialized,
    Configured,
}

/// Command Block Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlockWrapper {
    tag: u32,
    data_transfer_len: u32,
    direction: DataDirection,
    lun: u8,
    block_len: usize,
    block: [u8; MAX_CB_LEN],
}

impl CommandBlockWrapper {
    /// Parses and validates a received CBW against the number of Logical Units
    pub fn parse(bytes: &[u8], lun_count: u8) -> Result<Self, InvalidCbwError> {
        let bytes: &[u8; CBW_LEN] = bytes.try_into().map_err(|_| InvalidCbwError::Length)?;

        if u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) != CBW_SIGNATURE {
            return Err(InvalidCbwError::Signature);
        }

        let flags = bytes[12];
        let lun = bytes[13];
        let block_len = bytes[14];

        if flags & 0b01111111 != 0 || lun & 0b11110000 != 0 || block_len & 0b11100000 != 0 {
            return Err(InvalidCbwError::ReservedBits);
        }
        if !(1..=MAX_CB_LEN).contains(&(block_len as usize)) {
            return Err(InvalidCbwError::BlockLength);
        }
        if lun >= lun_count {
            return Err(InvalidCbwError::Lun);
        }

        let data_transfer_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let direction = if data_transfer_len == 0 {
            DataDirection::NotExpected
        } else if flags & (1 << 7) != 0 {
            DataDirection::In
        } else {
            DataDirection::Out
        };

        let mut block = [0u8; MAX_CB_LEN];
        block.copy_from_slice(&bytes[15..]);

        Ok(CommandBlockWrapper {
            tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            data_transfer_len,
            direction,
            lun,
            block_len: block_len as usize,
            block,
        })
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Number of bytes the host expects to move
    pub fn data_transfer_len(&self) -> u32 {
        self.data_transfer_len
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// The meaningful part of the command block
    pub fn block(&self) -> &[u8] {
        &self.block[..self.block_len]
    }
}

/// Command Status Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// A passing status for `cbw` with nothing transferred yet
    pub fn for_cbw(cbw: &CommandBlockWrapper) -> Self {
        Self {
            tag: cbw.tag,
            data_residue: cbw.data_transfer_len,
            status: CommandStatus::Passed,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; CSW_LEN] {
        let mut csw = [0u8; CSW_LEN];
        csw[..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        csw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        csw[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        csw[12] = self.status as u8;
        csw
    }
}

/// Outcome of matching the host's expectation against the device's intent
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reconciliation {
    pub status: CommandStatus,
    /// Endpoint to stall once the data phase is over
    pub stall: Option<BulkEndpoint>,
    /// Bytes to move in the data phase
    pub bytes: u32,
}

impl Reconciliation {
    const fn new(status: CommandStatus, stall: Option<BulkEndpoint>, bytes: u32) -> Self {
        Self {
            status,
            stall,
            bytes,
        }
    }

    const fn phase_error() -> Self {
        Self::new(CommandStatus::PhaseError, None, 0)
    }
}

/// The thirteen cases of the USB BBB doc, section 6.7
///
/// A phase error never moves any data.
pub fn reconcile(
    host_len: u32,
    host_dir: DataDirection,
    dev_len: u32,
    dev_dir: DataDirection,
) -> Reconciliation {
    use BulkEndpoint::{In, Out};
    use CommandStatus::{Failed, Passed};

    if host_len == 0 || host_dir == DataDirection::NotExpected {
        // Hn
        return if dev_len == 0 {
            Reconciliation::new(Passed, None, 0)
        } else {
            Reconciliation::phase_error()
        };
    }

    if dev_len == 0 {
        // Hi, Ho against Dn
        return match host_dir {
            DataDirection::In => Reconciliation::new(Failed, Some(In), 0),
            _ => Reconciliation::new(Passed, Some(Out), 0),
        };
    }

    if host_dir != dev_dir || dev_len > host_len {
        return Reconciliation::phase_error();
    }

    let stall = if dev_len < host_len {
        match host_dir {
            DataDirection::In => Some(In),
            _ => Some(Out),
        }
    } else {
        None
    };

    Reconciliation::new(Passed, stall, dev_len)
}

/// A configuration binding of the host
struct Connection<Ctx> {
    session: u32,
    cbw: CommandBlockWrapper,
    csw: CommandStatusWrapper,
    bytes_to_transfer: u32,
    context: Ctx,
}

impl<Ctx: Default> Connection<Ctx> {
    fn new(session: u32) -> Self {
        Self {
            session,
            cbw: Default::default(),
            csw: Default::default(),
            bytes_to_transfer: 0,
            context: Default::default(),
        }
    }

    fn start_transaction(&mut self, cbw: CommandBlockWrapper) {
        self.cbw = cbw;
        self.csw = CommandStatusWrapper::for_cbw(&cbw);
        self.bytes_to_transfer = 0;
        self.context = Default::default();
    }

    fn reset_transaction(&mut self) {
        self.cbw = Default::default();
        self.csw = Default::default();
        self.bytes_to_transfer = 0;
        self.context = Default::default();
    }

    fn advance(&mut self, count: u32) {
        self.bytes_to_transfer = self.bytes_to_transfer.saturating_sub(count);
        self.csw.data_residue = self.csw.data_residue.saturating_sub(count);
        trace!("usb: bbb: Data residue: {}", self.csw.data_residue);
    }
}

enum DataError {
    /// The command set failed the command
    Failed,
    /// A reset or disconnect arrived from interrupt context
    Interrupted,
}

/// Bulk Only Transport worker
///
/// Runs the CBW, data and CSW phases on its own task, blocking in the [EndpointDriver]
/// transfers and in [WakeSignal::wait]. Interrupt context drives stall and Reset Recovery
/// transitions through the [MscShared] link, see [MassStorageClass].
///
/// All data goes through a single IO buffer in both directions.
///
/// [MassStorageClass]: crate::class::MassStorageClass
pub struct BulkOnly<'a, D, S, C, Buf>
where
    D: EndpointDriver,
    S: WakeSignal,
    C: CommandSet,
    Buf: BorrowMut<[u8]>,
{
    shared: &'a MscShared<S>,
    driver: &'a D,
    endpoints: Endpoints,
    config: Config,
    command_set: C,
    buf: Buf,
    class_state: ClassState,
    connection: Option<Connection<C::Context>>,
}

impl<'a, D, S, C, Buf> BulkOnly<'a, D, S, C, Buf>
where
    D: EndpointDriver,
    S: WakeSignal,
    C: CommandSet,
    Buf: BorrowMut<[u8]>,
{
    /// Creates a Bulk Only Transport worker
    ///
    /// # Arguments
    /// * `shared` - the link shared with the [MassStorageClass]
    /// * `driver` - bulk transfer primitives
    /// * `endpoints` - addresses allocated by the [MassStorageClass]
    /// * `config` - timeouts and packet size
    /// * `command_set` - interpreter of the command blocks
    /// * `buf` - The underlying IO buffer. It is **required** to fit at least a `CBW`, a single
    /// packet and the largest block of the command set
    ///
    /// # Errors
    /// * [InvalidLunCount]
    /// * [LunCountMismatch]
    /// * [BufferTooSmall]
    ///
    /// [InvalidLunCount]: crate::transport::bbb::BulkOnlyError::InvalidLunCount
    /// [LunCountMismatch]: crate::transport::bbb::BulkOnlyError::LunCountMismatch
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    /// [MassStorageClass]: crate::class::MassStorageClass
    pub fn new(
        shared: &'a MscShared<S>,
        driver: &'a D,
        endpoints: Endpoints,
        config: Config,
        mut command_set: C,
        buf: Buf,
    ) -> Result<Self, BulkOnlyError> {
        let lun_count = command_set.lun_count();
        if lun_count == 0 || lun_count > MAX_LUN_COUNT {
            return Err(BulkOnlyError::InvalidLunCount);
        }
        if lun_count != shared.lun_count() {
            return Err(BulkOnlyError::LunCountMismatch);
        }

        let required = max(
            max(CBW_LEN, config.packet_size as usize),
            command_set.min_buffer_len(),
        );
        if buf.borrow().len() < required {
            return Err(BulkOnlyError::BufferTooSmall);
        }
        command_set.set_buffer_len(buf.borrow().len());

        Ok(BulkOnly {
            shared,
            driver,
            endpoints,
            config,
            command_set,
            buf,
            class_state: ClassState::Initialized,
            connection: None,
        })
    }

    pub fn command_set(&self) -> &C {
        &self.command_set
    }

    pub fn command_set_mut(&mut self) -> &mut C {
        &mut self.command_set
    }

    pub fn class_state(&self) -> ClassState {
        self.class_state
    }

    /// The current communication state
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Runs the worker forever
    pub fn run(&mut self) -> ! {
        loop {
            self.step()
        }
    }

    /// Runs a single state machine iteration
    ///
    /// Blocks while waiting for a configuration, for a stall to be cleared, or for a
    /// bulk transfer to complete.
    pub fn step(&mut self) {
        let link = self.shared.begin_step();

        if !link.configured || link.state == State::None {
            self.close();
            self.shared.wait();
            return;
        }

        if self.connection.as_ref().map(|conn| conn.session) != Some(link.session) {
            self.close();
            self.open(link.session);
        }

        match link.state {
            State::AwaitingCbw => self.receive_cbw(),
            State::DataPhase => self.data_phase(),
            State::SendingCsw => self.send_csw(),
            State::ResetRecovery => self.reset_recovery(),
            State::BulkInStall
            | State::BulkOutStall
            | State::ResetRecoveryBulkInStall
            | State::ResetRecoveryBulkOutStall => self.shared.wait(),
            State::None => {}
        }
    }

    fn open(&mut self, session: u32) {
        info!("usb: bbb: Open session: {}", session);
        self.command_set.reset();
        for lun in 0..self.command_set.lun_count() {
            self.command_set.connect(lun);
        }
        self.connection = Some(Connection::new(session));
        self.class_state = ClassState::Configured;
    }

    fn close(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        info!("usb: bbb: Close session: {}", conn.session);

        for lun in 0..self.command_set.lun_count() {
            if self.command_set.unlock(lun).is_err() {
                warning!("usb: bbb: Unlock failed, lun: {}", lun);
            }
        }
        self.class_state = ClassState::Initialized;
    }

    fn receive_cbw(&mut self) {
        let mut raw = [0u8; CBW_LEN];
        let received = self
            .driver
            .receive(self.endpoints.bulk_out, &mut raw, self.config.cbw_timeout);

        match received {
            Ok(len) => match CommandBlockWrapper::parse(&raw[..len], self.shared.lun_count()) {
                Ok(cbw) => {
                    info!("usb: bbb: Recv CBW: {}", cbw);
                    if let Some(conn) = self.connection.as_mut() {
                        conn.start_transaction(cbw);
                    }
                    self.shared.set_state(State::DataPhase);
                }
                Err(err) => {
                    // USB BBB doc, 6.6.1
                    warning!("usb: bbb: Invalid CBW: {}", err);
                    self.stall_both();
                }
            },
            Err(err) if !err.is_fatal() => {
                trace!("usb: bbb: No CBW yet: {}", err);
            }
            Err(err) => {
                if !self.interrupted(err) {
                    self.stall_both();
                }
            }
        }
    }

    fn data_phase(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let cbw = conn.cbw;

        let response = match self.command_set.process(&mut conn.context, cbw.lun, cbw.block()) {
            Ok(response) => response,
            Err(_) => {
                conn.csw.status = CommandStatus::Failed;
                match cbw.direction {
                    DataDirection::In => self.stall(State::BulkInStall, BulkEndpoint::In),
                    DataDirection::Out => self.stall(State::BulkOutStall, BulkEndpoint::Out),
                    DataDirection::NotExpected => self.shared.set_state(State::SendingCsw),
                }
                return;
            }
        };

        let reconciled = reconcile(
            cbw.data_transfer_len,
            cbw.direction,
            response.len,
            response.direction,
        );
        debug!(
            "usb: bbb: Response: {}, reconciled: {}",
            response, reconciled
        );
        conn.csw.status = reconciled.status;
        conn.bytes_to_transfer = reconciled.bytes;

        let mut stall = reconciled.stall;
        if reconciled.bytes > 0 {
            let moved = match cbw.direction {
                DataDirection::In => self.send_data(),
                DataDirection::Out => self.receive_data(),
                DataDirection::NotExpected => Ok(()),
            };

            let Some(conn) = self.connection.as_mut() else {
                return;
            };
            match moved {
                Ok(()) => {}
                Err(DataError::Interrupted) => return,
                Err(DataError::Failed) => conn.csw.status = CommandStatus::Failed,
            }

            // the host still expects data the device will never move
            if conn.csw.data_residue > 0 && stall.is_none() {
                stall = match cbw.direction {
                    DataDirection::In => Some(BulkEndpoint::In),
                    DataDirection::Out => Some(BulkEndpoint::Out),
                    DataDirection::NotExpected => None,
                };
            }
        }

        match stall {
            Some(BulkEndpoint::In) => self.stall(State::BulkInStall, BulkEndpoint::In),
            Some(BulkEndpoint::Out) => self.stall(State::BulkOutStall, BulkEndpoint::Out),
            None => self.shared.set_state(State::SendingCsw),
        }
    }

    /// Device to host data phase
    fn send_data(&mut self) -> Result<(), DataError> {
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        let buf = self.buf.borrow_mut();
        let lun = conn.cbw.lun;

        while conn.bytes_to_transfer > 0 {
            pending_transition(self.shared)?;
            let len = self
                .command_set
                .chunk_len(&conn.context, min(buf.len(), conn.bytes_to_transfer as usize));
            if len == 0 {
                warning!("usb: bbb: Chunk does not fit the IO buffer");
                return Err(DataError::Failed);
            }

            let chunk = self
                .command_set
                .read_data(&mut conn.context, lun, &mut buf[..len])
                .map_err(|_| DataError::Failed)?;
            let count = min(chunk.len, len);
            if count == 0 {
                break;
            }

            // the backend may have taken long enough for a reset to arrive
            pending_transition(self.shared)?;

            match self.driver.transmit(
                self.endpoints.bulk_in,
                &buf[..count],
                self.config.data_timeout,
                false,
            ) {
                Ok(sent) => conn.advance(sent as u32),
                Err(err) => return Err(data_error(self.shared, err)),
            }

            if !chunk.more {
                break;
            }
        }

        Ok(())
    }

    /// Host to device data phase
    fn receive_data(&mut self) -> Result<(), DataError> {
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        let buf = self.buf.borrow_mut();
        let lun = conn.cbw.lun;

        while conn.bytes_to_transfer > 0 {
            pending_transition(self.shared)?;
            let len = self
                .command_set
                .chunk_len(&conn.context, min(buf.len(), conn.bytes_to_transfer as usize));
            if len == 0 {
                warning!("usb: bbb: Chunk does not fit the IO buffer");
                return Err(DataError::Failed);
            }

            let count = match self.driver.receive(
                self.endpoints.bulk_out,
                &mut buf[..len],
                self.config.data_timeout,
            ) {
                Ok(count) => count,
                Err(err) => return Err(data_error(self.shared, err)),
            };
            conn.advance(count as u32);

            // data received after a reset must not reach the medium
            pending_transition(self.shared)?;

            let more = self
                .command_set
                .write_data(&mut conn.context, lun, &buf[..count])
                .map_err(|_| DataError::Failed)?;

            // a short packet ends the transfer
            if !more || count < len {
                break;
            }
        }

        Ok(())
    }

    fn send_csw(&mut self) {
        let Some(conn) = self.connection.as_ref() else {
            return;
        };
        let csw = conn.csw;

        match self.driver.transmit(
            self.endpoints.bulk_in,
            &csw.to_le_bytes(),
            self.config.csw_timeout,
            false,
        ) {
            Ok(_) => {
                info!("usb: bbb: Sent CSW: {}", csw);
                if csw.status == CommandStatus::PhaseError {
                    self.shared.set_state(State::ResetRecovery);
                } else {
                    self.shared.set_state(State::AwaitingCbw);
                }
            }
            Err(err) => {
                if !self.interrupted(err) {
                    self.stall(State::BulkInStall, BulkEndpoint::In);
                }
            }
        }
    }

    fn reset_recovery(&mut self) {
        info!("usb: bbb: Reset recovery");
        if let Some(conn) = self.connection.as_mut() {
            conn.reset_transaction();
        }
        self.command_set.reset();
        self.shared.clear_stall();
        self.shared.set_state(State::AwaitingCbw);
    }

    /// Whether a failed transfer was cut short by interrupt context
    fn interrupted(&self, err: TransferError) -> bool {
        let pending = self.shared.has_pending();
        if pending {
            info!("usb: bbb: Transfer interrupted: {}", err);
        } else {
            warning!("usb: bbb: Transfer failed: {}", err);
        }
        pending
    }

    fn stall(&self, state: State, ep: BulkEndpoint) {
        self.shared.enter_stall(state);
        self.stall_ep(ep);
    }

    fn stall_both(&self) {
        self.shared.enter_stall(State::ResetRecoveryBulkInStall);
        self.stall_ep(BulkEndpoint::In);
        self.stall_ep(BulkEndpoint::Out);
    }

    fn stall_ep(&self, ep: BulkEndpoint) {
        info!("usb: bbb: Stall {} ep", ep);
        self.driver.set_stalled(self.endpoints.address(ep), true);
    }
}

/// Gives way to a reset or disconnect posted by interrupt context
fn pending_transition<S: WakeSignal>(shared: &MscShared<S>) -> Result<(), DataError> {
    if shared.has_pending() {
        info!("usb: bbb: Data phase interrupted");
        Err(DataError::Interrupted)
    } else {
        Ok(())
    }
}

fn data_error<S: WakeSignal>(shared: &MscShared<S>, err: TransferError) -> DataError {
    if shared.has_pending() {
        info!("usb: bbb: Data phase interrupted: {}", err);
        DataError::Interrupted
    } else {
        warning!("usb: bbb: Data phase failed: {}", err);
        DataError::Failed
    }
}
