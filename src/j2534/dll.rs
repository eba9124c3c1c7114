use std::ffi::{c_char, c_void};
use std::path::Path;
use std::sync::Arc;

use crate::config::HostConfig;
use crate::j2534::device::{self, DeviceDescriptor, LoadDeviceError, VersionInfo};
use crate::j2534::types::*;
use crate::j2534::{Backend, Driver};

/// Type aliases for J2534 DLL function pointers
type PassThruOpenFn = unsafe extern "system" fn(*const c_void, *mut u32) -> u32;
type PassThruCloseFn = unsafe extern "system" fn(u32) -> u32;
type PassThruConnectFn = unsafe extern "system" fn(u32, u32, u32, u32, *mut u32) -> u32;
type PassThruDisconnectFn = unsafe extern "system" fn(u32) -> u32;
type PassThruReadMsgsFn = unsafe extern "system" fn(u32, *mut PassThruMsg, *mut u32, u32) -> u32;
type PassThruWriteMsgsFn = unsafe extern "system" fn(u32, *const PassThruMsg, *mut u32, u32) -> u32;
type PassThruStartPeriodicMsgFn =
    unsafe extern "system" fn(u32, *const PassThruMsg, *mut u32, u32) -> u32;
type PassThruStopPeriodicMsgFn = unsafe extern "system" fn(u32, u32) -> u32;
type PassThruStartMsgFilterFn =
    unsafe extern "system" fn(u32, u32, *const PassThruMsg, *const PassThruMsg, *const PassThruMsg, *mut u32) -> u32;
type PassThruStopMsgFilterFn = unsafe extern "system" fn(u32, u32) -> u32;
type PassThruSetProgrammingVoltageFn = unsafe extern "system" fn(u32, u32, u32) -> u32;
type PassThruReadVersionFn = unsafe extern "system" fn(u32, *mut c_char, *mut c_char, *mut c_char) -> u32;
type PassThruGetLastErrorFn = unsafe extern "system" fn(*mut c_char) -> u32;
type PassThruIoctlFn = unsafe extern "system" fn(u32, u32, *const c_void, *mut c_void) -> u32;

/// Version and error strings are written into 80-byte buffers
const STRING_BUF_LEN: usize = 80;

/// Holds a dynamically loaded J2534 DLL and its function pointers
pub struct J2534Lib {
    pass_thru_open: PassThruOpenFn,
    pass_thru_close: PassThruCloseFn,
    pass_thru_connect: PassThruConnectFn,
    pass_thru_disconnect: PassThruDisconnectFn,
    pass_thru_read_msgs: PassThruReadMsgsFn,
    pass_thru_write_msgs: PassThruWriteMsgsFn,
    pass_thru_start_periodic_msg: PassThruStartPeriodicMsgFn,
    pass_thru_stop_periodic_msg: PassThruStopPeriodicMsgFn,
    pass_thru_start_msg_filter: PassThruStartMsgFilterFn,
    pass_thru_stop_msg_filter: PassThruStopMsgFilterFn,
    pass_thru_set_programming_voltage: PassThruSetProgrammingVoltageFn,
    pass_thru_read_version: PassThruReadVersionFn,
    pass_thru_get_last_error: PassThruGetLastErrorFn,
    pass_thru_ioctl: PassThruIoctlFn,
    _lib: libloading::Library,
}

impl J2534Lib {
    /// Load a J2534 DLL and resolve all PassThru entry points
    pub fn load(path: &Path) -> Result<Self, LoadDeviceError> {
        let shown = path.display();
        unsafe {
            let lib = libloading::Library::new(path).map_err(|e| {
                LoadDeviceError::LibLoad(format!("Failed to load J2534 DLL '{}': {}", shown, e))
            })?;

            macro_rules! symbol {
                ($ty:ty, $name:literal) => {
                    *lib.get::<$ty>(concat!($name, "\0").as_bytes()).map_err(|e| {
                        LoadDeviceError::LibLoad(format!("{} not found in '{}': {}", $name, shown, e))
                    })?
                };
            }

            let pass_thru_open = symbol!(PassThruOpenFn, "PassThruOpen");
            let pass_thru_close = symbol!(PassThruCloseFn, "PassThruClose");
            let pass_thru_connect = symbol!(PassThruConnectFn, "PassThruConnect");
            let pass_thru_disconnect = symbol!(PassThruDisconnectFn, "PassThruDisconnect");
            let pass_thru_read_msgs = symbol!(PassThruReadMsgsFn, "PassThruReadMsgs");
            let pass_thru_write_msgs = symbol!(PassThruWriteMsgsFn, "PassThruWriteMsgs");
            let pass_thru_start_periodic_msg =
                symbol!(PassThruStartPeriodicMsgFn, "PassThruStartPeriodicMsg");
            let pass_thru_stop_periodic_msg =
                symbol!(PassThruStopPeriodicMsgFn, "PassThruStopPeriodicMsg");
            let pass_thru_start_msg_filter =
                symbol!(PassThruStartMsgFilterFn, "PassThruStartMsgFilter");
            let pass_thru_stop_msg_filter =
                symbol!(PassThruStopMsgFilterFn, "PassThruStopMsgFilter");
            let pass_thru_set_programming_voltage =
                symbol!(PassThruSetProgrammingVoltageFn, "PassThruSetProgrammingVoltage");
            let pass_thru_read_version = symbol!(PassThruReadVersionFn, "PassThruReadVersion");
            let pass_thru_get_last_error = symbol!(PassThruGetLastErrorFn, "PassThruGetLastError");
            let pass_thru_ioctl = symbol!(PassThruIoctlFn, "PassThruIoctl");

            log::debug!("Resolved PassThru entry points in {}", shown);

            Ok(Self {
                pass_thru_open,
                pass_thru_close,
                pass_thru_connect,
                pass_thru_disconnect,
                pass_thru_read_msgs,
                pass_thru_write_msgs,
                pass_thru_start_periodic_msg,
                pass_thru_stop_periodic_msg,
                pass_thru_start_msg_filter,
                pass_thru_stop_msg_filter,
                pass_thru_set_programming_voltage,
                pass_thru_read_version,
                pass_thru_get_last_error,
                pass_thru_ioctl,
                _lib: lib,
            })
        }
    }
}

/// NUL-terminated C string from a fixed buffer
fn c_buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

impl Driver for J2534Lib {
    fn open(&self) -> Result<u32, J2534Error> {
        let mut device_id: u32 = 0;
        status(unsafe { (self.pass_thru_open)(std::ptr::null(), &mut device_id) })?;
        Ok(device_id)
    }

    fn close(&self, device_id: u32) -> Result<(), J2534Error> {
        status(unsafe { (self.pass_thru_close)(device_id) })
    }

    fn read_version(&self, device_id: u32) -> Result<VersionInfo, J2534Error> {
        let mut firmware = [0u8; STRING_BUF_LEN];
        let mut dll = [0u8; STRING_BUF_LEN];
        let mut api = [0u8; STRING_BUF_LEN];
        status(unsafe {
            (self.pass_thru_read_version)(
                device_id,
                firmware.as_mut_ptr() as *mut c_char,
                dll.as_mut_ptr() as *mut c_char,
                api.as_mut_ptr() as *mut c_char,
            )
        })?;
        Ok(VersionInfo {
            fw_version: c_buf_to_string(&firmware),
            api_version: c_buf_to_string(&api),
            dll_version: c_buf_to_string(&dll),
        })
    }

    fn read_battery_voltage(&self, device_id: u32) -> Result<u32, J2534Error> {
        let mut millivolts: u32 = 0;
        status(unsafe {
            (self.pass_thru_ioctl)(
                device_id,
                IoctlId::ReadVbatt as u32,
                std::ptr::null(),
                &mut millivolts as *mut u32 as *mut c_void,
            )
        })?;
        Ok(millivolts)
    }

    fn set_programming_voltage(
        &self,
        device_id: u32,
        pin: u32,
        millivolts: u32,
    ) -> Result<(), J2534Error> {
        status(unsafe { (self.pass_thru_set_programming_voltage)(device_id, pin, millivolts) })
    }

    fn connect(
        &self,
        device_id: u32,
        protocol: Protocol,
        flags: ConnectFlags,
        baudrate: u32,
    ) -> Result<u32, J2534Error> {
        let mut channel_id: u32 = 0;
        status(unsafe {
            (self.pass_thru_connect)(
                device_id,
                protocol.id(),
                flags.bits(),
                baudrate,
                &mut channel_id,
            )
        })?;
        Ok(channel_id)
    }

    fn disconnect(&self, channel_id: u32) -> Result<(), J2534Error> {
        status(unsafe { (self.pass_thru_disconnect)(channel_id) })
    }

    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: FilterType,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, J2534Error> {
        let fc_ptr = flow_control.map_or(std::ptr::null(), |fc| fc as *const PassThruMsg);
        let mut filter_id: u32 = 0;
        status(unsafe {
            (self.pass_thru_start_msg_filter)(
                channel_id,
                filter_type as u32,
                mask,
                pattern,
                fc_ptr,
                &mut filter_id,
            )
        })?;
        Ok(filter_id)
    }

    fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> Result<(), J2534Error> {
        status(unsafe { (self.pass_thru_stop_msg_filter)(channel_id, filter_id) })
    }

    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        timeout_ms: u32,
    ) -> Result<usize, J2534Error> {
        if msgs.is_empty() {
            return Ok(0);
        }
        let mut num_msgs = msgs.len() as u32;
        let ret = unsafe {
            (self.pass_thru_write_msgs)(channel_id, msgs.as_ptr(), &mut num_msgs, timeout_ms)
        };
        match status(ret) {
            Ok(()) => Ok(num_msgs as usize),
            // Timed out part way: the driver reports how many went out
            Err(J2534Error::Timeout) if num_msgs > 0 => Ok(num_msgs as usize),
            Err(e) => Err(e),
        }
    }

    fn read_msgs(
        &self,
        channel_id: u32,
        max_msgs: u32,
        timeout_ms: u32,
    ) -> Result<Vec<PassThruMsg>, J2534Error> {
        let mut msgs = vec![PassThruMsg::default(); max_msgs as usize];
        let mut num_msgs = max_msgs;
        let ret = unsafe {
            (self.pass_thru_read_msgs)(channel_id, msgs.as_mut_ptr(), &mut num_msgs, timeout_ms)
        };
        // BufferEmpty and Timeout are not fatal, they just mean fewer messages than asked for
        match status(ret) {
            Ok(()) | Err(J2534Error::BufferEmpty) | Err(J2534Error::Timeout) => {
                msgs.truncate((num_msgs as usize).min(max_msgs as usize));
                Ok(msgs)
            }
            Err(e) => Err(e),
        }
    }

    fn start_periodic_msg(
        &self,
        channel_id: u32,
        msg: &PassThruMsg,
        interval_ms: u32,
    ) -> Result<u32, J2534Error> {
        let mut msg_id: u32 = 0;
        status(unsafe {
            (self.pass_thru_start_periodic_msg)(channel_id, msg, &mut msg_id, interval_ms)
        })?;
        Ok(msg_id)
    }

    fn stop_periodic_msg(&self, channel_id: u32, msg_id: u32) -> Result<(), J2534Error> {
        status(unsafe { (self.pass_thru_stop_periodic_msg)(channel_id, msg_id) })
    }

    fn get_config(&self, channel_id: u32, params: &mut [SConfig]) -> Result<(), J2534Error> {
        let list = SConfigList {
            num_of_params: params.len() as u32,
            config_ptr: params.as_mut_ptr(),
        };
        status(unsafe {
            (self.pass_thru_ioctl)(
                channel_id,
                IoctlId::GetConfig as u32,
                &list as *const SConfigList as *const c_void,
                std::ptr::null_mut(),
            )
        })
    }

    fn set_config(&self, channel_id: u32, params: &[SConfig]) -> Result<(), J2534Error> {
        // SET_CONFIG only reads the list, but the API takes a mutable pointer
        let mut owned = params.to_vec();
        let list = SConfigList {
            num_of_params: owned.len() as u32,
            config_ptr: owned.as_mut_ptr(),
        };
        status(unsafe {
            (self.pass_thru_ioctl)(
                channel_id,
                IoctlId::SetConfig as u32,
                &list as *const SConfigList as *const c_void,
                std::ptr::null_mut(),
            )
        })
    }

    fn ioctl(&self, channel_id: u32, ioctl_id: IoctlId) -> Result<(), J2534Error> {
        status(unsafe {
            (self.pass_thru_ioctl)(
                channel_id,
                ioctl_id as u32,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        })
    }

    fn last_error(&self) -> Option<String> {
        let mut buf = [0u8; STRING_BUF_LEN];
        let ret = unsafe { (self.pass_thru_get_last_error)(buf.as_mut_ptr() as *mut c_char) };
        if ret != 0 {
            return None;
        }
        let text = c_buf_to_string(&buf);
        (!text.is_empty()).then_some(text)
    }
}

/// Finds devices the way the host OS registers them and loads their DLLs
pub struct SystemBackend {
    config: HostConfig,
}

impl SystemBackend {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

impl Backend for SystemBackend {
    #[cfg(target_os = "windows")]
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, LoadDeviceError> {
        device::discover_registry(&self.config.registry_key)
    }

    #[cfg(not(target_os = "windows"))]
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, LoadDeviceError> {
        device::discover_manifests(&self.config.manifest_dir())
    }

    fn load(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Driver>, LoadDeviceError> {
        log::info!(
            "Loading J2534 library for {} ({})",
            descriptor.name,
            descriptor.library_path.display()
        );
        let lib = J2534Lib::load(&descriptor.library_path)?;
        Ok(Arc::new(lib))
    }
}
