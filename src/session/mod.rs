pub mod channel;
pub mod filter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};

use crate::error::{ErrorKind, PassThruError, Result};
use crate::j2534::device::{DeviceDescriptor, VersionInfo};
use crate::j2534::message::Message;
use crate::j2534::types::*;
use crate::j2534::Driver;
use channel::{ChannelInfo, ChannelManager, ClearTarget, ConfigValue};
use filter::Filter;

/// Held while an operation is using the device. Dropping it frees the device.
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
    release: bool,
}

impl BusyGuard<'_> {
    /// Leave the flag set for good, so a closed session rejects everything
    fn keep(mut self) {
        self.release = false;
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.release {
            self.flag.store(false, Ordering::Release);
        }
    }
}

/// An open adapter. Created by a successful PassThruOpen, gone after close.
pub struct Session {
    device_id: u32,
    descriptor: DeviceDescriptor,
    opened_at: DateTime<Local>,
    driver: Arc<dyn Driver>,
    busy: AtomicBool,
    channels: Mutex<ChannelManager>,
}

impl Session {
    pub fn open(descriptor: DeviceDescriptor, driver: Arc<dyn Driver>) -> Result<Self> {
        let device_id = driver
            .open()
            .map_err(|e| PassThruError::from_driver(e, driver.as_ref()))?;
        log::info!(
            "Opened {} ({}) as device {}",
            descriptor.name,
            descriptor.vendor,
            device_id
        );
        let channels = ChannelManager::new(driver.clone(), device_id, descriptor.capabilities);
        Ok(Self {
            device_id,
            descriptor,
            opened_at: Local::now(),
            driver,
            busy: AtomicBool::new(false),
            channels: Mutex::new(channels),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Take the device lock, failing fast with `DeviceBusy` if someone holds it
    pub fn acquire(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PassThruError::from(ErrorKind::DeviceBusy))?;
        Ok(BusyGuard {
            flag: &self.busy,
            release: true,
        })
    }

    fn driver_err(&self, err: J2534Error) -> PassThruError {
        PassThruError::from_driver(err, self.driver.as_ref())
    }

    fn channels(&self) -> Result<MutexGuard<'_, ChannelManager>> {
        Ok(self.channels.lock()?)
    }

    /// Run `f` on the channel registry with the device lock held
    fn with_channels<T>(&self, f: impl FnOnce(&mut ChannelManager) -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        let mut channels = self.channels()?;
        f(&mut channels)
    }

    pub fn version(&self) -> Result<VersionInfo> {
        let _guard = self.acquire()?;
        self.driver
            .read_version(self.device_id)
            .map_err(|e| self.driver_err(e))
    }

    /// Battery voltage in millivolts. Does not wait for or take the device lock.
    pub fn voltage(&self) -> Result<u32> {
        self.driver
            .read_battery_voltage(self.device_id)
            .map_err(|e| self.driver_err(e))
    }

    pub fn set_programming_voltage(&self, pin: u32, millivolts: u32) -> Result<()> {
        let _guard = self.acquire()?;
        self.driver
            .set_programming_voltage(self.device_id, pin, millivolts)
            .map_err(|e| self.driver_err(e))?;
        log::info!("Programming voltage on pin {} set to {} mV", pin, millivolts);
        Ok(())
    }

    pub fn connect(&self, protocol: Protocol, flags: ConnectFlags, baudrate: u32) -> Result<u32> {
        self.with_channels(|ch| ch.connect(protocol, flags, baudrate))
    }

    pub fn disconnect(&self, channel_id: u32) -> Result<()> {
        self.with_channels(|ch| ch.disconnect(channel_id))
    }

    pub fn send(&self, channel_id: u32, messages: &[Message], timeout_ms: u32) -> Result<usize> {
        self.with_channels(|ch| ch.send(channel_id, messages, timeout_ms))
    }

    pub fn read(&self, channel_id: u32, max_msgs: u32, timeout_ms: u32) -> Result<Vec<Message>> {
        self.with_channels(|ch| ch.read(channel_id, max_msgs, timeout_ms))
    }

    pub fn set_filter(&self, channel_id: u32, filter: Filter) -> Result<u32> {
        self.with_channels(|ch| ch.set_filter(channel_id, filter))
    }

    pub fn remove_filter(&self, channel_id: u32, filter_id: u32) -> Result<()> {
        self.with_channels(|ch| ch.remove_filter(channel_id, filter_id))
    }

    pub fn start_periodic(&self, channel_id: u32, message: Message, interval_ms: u32) -> Result<u32> {
        self.with_channels(|ch| ch.start_periodic(channel_id, message, interval_ms))
    }

    pub fn stop_periodic(&self, channel_id: u32, msg_id: u32) -> Result<()> {
        self.with_channels(|ch| ch.stop_periodic(channel_id, msg_id))
    }

    pub fn get_config(&self, channel_id: u32, params: &[IoctlParam]) -> Result<Vec<ConfigValue>> {
        self.with_channels(|ch| ch.get_config(channel_id, params))
    }

    pub fn set_config(&self, channel_id: u32, values: &[ConfigValue]) -> Result<()> {
        self.with_channels(|ch| ch.set_config(channel_id, values))
    }

    pub fn clear(&self, channel_id: u32, target: ClearTarget) -> Result<()> {
        self.with_channels(|ch| ch.clear(channel_id, target))
    }

    pub fn channel_info(&self) -> Result<Vec<ChannelInfo>> {
        self.with_channels(|ch| Ok(ch.info()))
    }

    /// Disconnect every channel and release the device.
    ///
    /// On success the busy flag stays set, so anyone still holding this
    /// session gets `DeviceBusy`. On a driver failure the session is left
    /// usable and the error is returned.
    pub fn close(&self) -> Result<()> {
        let guard = self.acquire()?;
        self.channels()?.disconnect_all();
        self.driver
            .close(self.device_id)
            .map_err(|e| self.driver_err(e))?;
        guard.keep();
        log::info!(
            "Closed device {} ({}), open since {}",
            self.device_id,
            self.descriptor.name,
            self.opened_at.format("%H:%M:%S%.3f")
        );
        Ok(())
    }

    /// Release the device regardless of the busy flag. Driver failures are logged, not returned.
    pub fn force_close(&self) {
        self.busy.store(true, Ordering::Release);
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.disconnect_all();
        if let Err(e) = self.driver.close(self.device_id) {
            log::warn!("Force close of device {}: {}", self.device_id, self.driver_err(e));
        }
        log::warn!("Device {} ({}) force closed", self.device_id, self.descriptor.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::j2534::mock::{mock_descriptor, MockDriver, MockOp};

    fn open() -> (Arc<MockDriver>, Session) {
        let driver = Arc::new(MockDriver::new());
        let session = Session::open(mock_descriptor("mock"), driver.clone()).unwrap();
        (driver, session)
    }

    #[test]
    fn test_open_failure_is_enriched() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_next(MockOp::Open, J2534Error::Failed);
        driver.set_last_error("USB device not found");
        let err = Session::open(mock_descriptor("mock"), driver.clone())
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert_eq!(err.detail.as_deref(), Some("USB device not found"));
        assert!(!driver.is_open());
    }

    #[test]
    fn test_busy_blocks_locked_operations() {
        let (_driver, session) = open();
        let guard = session.acquire().unwrap();
        assert!(session.is_busy());

        assert_eq!(session.version().unwrap_err().kind, ErrorKind::DeviceBusy);
        assert_eq!(
            session
                .connect(Protocol::Can, ConnectFlags::empty(), 500_000)
                .unwrap_err()
                .kind,
            ErrorKind::DeviceBusy
        );
        assert_eq!(session.close().unwrap_err().kind, ErrorKind::DeviceBusy);
        // Voltage bypasses the lock
        assert_eq!(session.voltage().unwrap(), 12_600);

        drop(guard);
        assert!(!session.is_busy());
        assert!(session.version().is_ok());
    }

    #[test]
    fn test_lock_released_after_error() {
        let (driver, session) = open();
        driver.fail_next(MockOp::ReadVersion, J2534Error::DeviceNotConnected);
        assert_eq!(session.version().unwrap_err().kind, ErrorKind::DeviceNotConnected);
        assert!(!session.is_busy());
    }

    #[test]
    fn test_close_disconnects_channels() {
        let (driver, session) = open();
        let ch = session
            .connect(Protocol::Iso15765, ConnectFlags::empty(), 500_000)
            .unwrap();
        session
            .set_filter(ch, Filter::iso15765_flow_control(0x7E0, 0x7E8))
            .unwrap();
        let info = session.channel_info().unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].protocol, Protocol::Iso15765);
        assert_eq!(info[0].filter_ids, vec![1]);

        session.close().unwrap();
        assert!(driver.open_channels().is_empty());
        assert!(driver.active_filters(ch).is_empty());
        assert_eq!(driver.closes(), vec![session.device_id()]);
        // Stale handles stay locked out
        assert_eq!(session.version().unwrap_err().kind, ErrorKind::DeviceBusy);
    }

    #[test]
    fn test_close_failure_keeps_session() {
        let (driver, session) = open();
        driver.fail_next(MockOp::Close, J2534Error::Failed);
        assert_eq!(session.close().unwrap_err().kind, ErrorKind::Failed);
        assert!(!session.is_busy());
        assert!(driver.is_open());
        session.close().unwrap();
    }

    #[test]
    fn test_force_close_ignores_busy() {
        let (driver, session) = open();
        session
            .connect(Protocol::Can, ConnectFlags::empty(), 500_000)
            .unwrap();
        let guard = session.acquire().unwrap();
        std::mem::forget(guard);

        session.force_close();
        assert!(!driver.is_open());
        assert!(driver.open_channels().is_empty());
    }

    #[test]
    fn test_programming_voltage() {
        let (driver, session) = open();
        session.set_programming_voltage(15, 18_000).unwrap();
        assert_eq!(driver.programming_voltages(), vec![(15, 18_000)]);
    }

    #[test]
    fn test_concurrent_call_gets_busy() {
        let (driver, session) = open();
        let session = Arc::new(session);
        let ch = session
            .connect(Protocol::Iso15765, ConnectFlags::empty(), 500_000)
            .unwrap();

        let gate = driver.gate_next_read();
        let reader = {
            let session = session.clone();
            std::thread::spawn(move || session.read(ch, 10, 1000))
        };
        gate.wait_entered();

        assert_eq!(session.close().unwrap_err().kind, ErrorKind::DeviceBusy);
        assert_eq!(
            session.send(ch, &[Message::new_iso15765(0x7E0, &[0x3E])], 0).unwrap_err().kind,
            ErrorKind::DeviceBusy
        );
        assert_eq!(session.voltage().unwrap(), 12_600);

        gate.release();
        assert!(reader.join().unwrap().unwrap().is_empty());
        session.close().unwrap();
    }
}
