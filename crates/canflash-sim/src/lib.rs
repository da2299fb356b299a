//! canflash-sim - simulated flashing targets
//!
//! Firmware-side counterparts of the two flashing protocols, for tests and
//! bench runs without hardware.
//!
//! # Modules
//!
//! - [`iap`] - raw-frame IAP bootloader
//! - [`ecu`] - UDS application and bootloader behind ISO-TP
//! - [`uds`] - UDS response helpers
//!
//! Devices are synchronous frame handlers. [`attach`] plugs one into a
//! [`MockTransport`] so every frame the host transmits is answered in
//! place; the `canflash-sim` binary drives the same handler from a real
//! CAN interface.

pub mod ecu;
pub mod iap;
pub mod uds;

use std::sync::Arc;

use canflash::frame::CanFrame;
use canflash::transport::MockTransport;
use parking_lot::Mutex;

pub use ecu::{EcuMode, UdsEcu, UdsFaults};
pub use iap::{IapBootloader, IapFaults, IapPhase};

/// A simulated device on the bus
pub trait SimDevice: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Handle one frame seen on the bus and return the frames sent in reply
    fn on_frame(&mut self, frame: &CanFrame) -> Vec<CanFrame>;
}

/// Answer every frame transmitted on `mock` with `device`
///
/// The device stays shared so a test can inspect it after the run.
pub fn attach<D>(mock: &MockTransport, device: Arc<Mutex<D>>)
where
    D: SimDevice + 'static,
{
    mock.set_responder(move |frame| device.lock().on_frame(frame));
}
