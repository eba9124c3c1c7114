pub mod device;
pub mod dll;
pub mod message;
#[cfg(test)]
pub mod mock;
pub mod types;

use std::sync::Arc;

use device::{DeviceDescriptor, LoadDeviceError, VersionInfo};
use types::{ConnectFlags, FilterType, IoctlId, J2534Error, PassThruMsg, Protocol, SConfig};

/// The PassThru function table of one loaded driver library.
///
/// Implemented by the native DLL wrapper and by the test mock. Every call returns
/// the raw J2534 status; the session layer turns it into a `PassThruError`.
pub trait Driver: Send + Sync {
    fn open(&self) -> Result<u32, J2534Error>;
    fn close(&self, device_id: u32) -> Result<(), J2534Error>;
    fn read_version(&self, device_id: u32) -> Result<VersionInfo, J2534Error>;
    /// READ_VBATT, in millivolts
    fn read_battery_voltage(&self, device_id: u32) -> Result<u32, J2534Error>;
    fn set_programming_voltage(&self, device_id: u32, pin: u32, millivolts: u32)
        -> Result<(), J2534Error>;

    fn connect(
        &self,
        device_id: u32,
        protocol: Protocol,
        flags: ConnectFlags,
        baudrate: u32,
    ) -> Result<u32, J2534Error>;
    fn disconnect(&self, channel_id: u32) -> Result<(), J2534Error>;

    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: FilterType,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, J2534Error>;
    fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> Result<(), J2534Error>;

    /// Returns how many messages the driver accepted, which may be fewer than given
    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        timeout_ms: u32,
    ) -> Result<usize, J2534Error>;
    /// An empty receive buffer is an empty Vec, not an error
    fn read_msgs(
        &self,
        channel_id: u32,
        max_msgs: u32,
        timeout_ms: u32,
    ) -> Result<Vec<PassThruMsg>, J2534Error>;

    fn start_periodic_msg(
        &self,
        channel_id: u32,
        msg: &PassThruMsg,
        interval_ms: u32,
    ) -> Result<u32, J2534Error>;
    fn stop_periodic_msg(&self, channel_id: u32, msg_id: u32) -> Result<(), J2534Error>;

    fn get_config(&self, channel_id: u32, params: &mut [SConfig]) -> Result<(), J2534Error>;
    fn set_config(&self, channel_id: u32, params: &[SConfig]) -> Result<(), J2534Error>;
    /// IOCTLs that take no input and produce no output (the CLEAR_* family)
    fn ioctl(&self, channel_id: u32, ioctl_id: IoctlId) -> Result<(), J2534Error>;

    /// PassThruGetLastError text, if the driver has any
    fn last_error(&self) -> Option<String>;
}

/// Where devices come from and how their driver libraries are loaded
pub trait Backend: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, LoadDeviceError>;
    fn load(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Driver>, LoadDeviceError>;
}
