//! USB Mass Storage Bulk-Only Transport device function for [usb-device]
//!
//! The crate is split the same way the USB Mass Storage documents are:
//! * [Bulk Only] - the BOT engine that frames commands into CBW/data/CSW phases
//! * [SCSI] - the command set translator that executes commands against a [BlockDevice]
//! * [class] - the [UsbClass] side that lives next to the USB device core
//!
//! A device owns one [MassStorageClass] (polled by the USB device core) and one
//! [BulkOnly] worker (driven from its own task via [BulkOnly::run]). Both halves
//! talk through a [MscShared] link.
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [SCSI]: crate::subclass::scsi
//! [Bulk Only]: crate::transport::bbb
//! [class]: crate::class
//! [BlockDevice]: crate::storage::BlockDevice
//! [UsbClass]: usb_device::class::UsbClass
//! [MassStorageClass]: crate::class::MassStorageClass
//! [MscShared]: crate::class::MscShared
//! [BulkOnly]: crate::transport::bbb::BulkOnly
//! [BulkOnly::run]: crate::transport::bbb::BulkOnly::run

#![no_std]

pub mod class;
pub(crate) mod fmt;
pub mod storage;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;

/// The largest number of Logical Units a single Bulk Only function can expose
pub const MAX_LUN_COUNT: u8 = 16;
