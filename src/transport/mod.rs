//! USB Mass Storage transports

use usb_device::endpoint::EndpointAddress;
use usb_device::UsbError;

pub mod bbb;

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Data phase direction, as seen from the host
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
    #[default]
    NotExpected,
}

/// How long a single bulk transfer may block
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    #[default]
    Infinite,
    Millis(u32),
}

/// Bulk transfer failure reported by an [EndpointDriver]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// The transfer did not complete in time
    Timeout,
    /// The transfer was cancelled by [EndpointDriver::abort]
    Aborted,
    /// The host sent more data than the buffer can hold
    Overflow,
    /// The driver could not queue the transfer
    Queue,
    /// USB stack error
    Usb(UsbError),
}

impl TransferError {
    /// Whether the current transaction cannot continue after this error
    ///
    /// Only a timeout (or a driver saying it would block) may be retried in place.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransferError::Timeout | TransferError::Usb(UsbError::WouldBlock)
        )
    }
}

/// Bulk endpoint primitives of the USB device core.
///
/// Transfers block until the whole buffer is moved, a short packet ends the transfer,
/// the timeout expires or the endpoint is aborted. All methods take `&self` so that
/// interrupt context (see [MassStorageClass]) can abort and query endpoints while the
/// worker is blocked in a transfer.
///
/// [MassStorageClass]: crate::class::MassStorageClass
pub trait EndpointDriver {
    /// Reads up to `buf.len()` bytes from an OUT endpoint, returning the number of bytes read
    fn receive(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<usize, TransferError>;

    /// Writes `buf` to an IN endpoint, returning the number of bytes sent.
    ///
    /// When `zlp` is set a transfer that ends on a packet boundary is terminated with
    /// a zero length packet.
    fn transmit(
        &self,
        ep: EndpointAddress,
        buf: &[u8],
        timeout: Timeout,
        zlp: bool,
    ) -> Result<usize, TransferError>;

    fn set_stalled(&self, ep: EndpointAddress, stalled: bool);

    fn is_stalled(&self, ep: EndpointAddress) -> bool;

    /// Cancels any transfer in flight on `ep`
    fn abort(&self, ep: EndpointAddress);
}
