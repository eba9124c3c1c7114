use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::j2534::device::{Capabilities, DeviceDescriptor, LoadDeviceError, VersionInfo};
use crate::j2534::message::Message;
use crate::j2534::types::*;
use crate::j2534::{Backend, Driver};

/// Driver entry points, for call recording and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    Close,
    ReadVersion,
    ReadVoltage,
    SetProgrammingVoltage,
    Connect,
    Disconnect,
    StartFilter,
    StopFilter,
    Write,
    Read,
    StartPeriodic,
    StopPeriodic,
    GetConfig,
    SetConfig,
    Ioctl,
}

#[derive(Default)]
struct MockState {
    next_id: HashMap<MockOp, u32>,
    repeat_ids: bool,
    device: Option<u32>,
    /// channel id -> protocol
    channels: BTreeMap<u32, Protocol>,
    filters: BTreeMap<(u32, u32), FilterType>,
    periodic: BTreeMap<(u32, u32), u32>,
    config: HashMap<(u32, u32), u32>,
    rx: HashMap<u32, VecDeque<PassThruMsg>>,
    sent: Vec<(u32, Message)>,
    write_limit: Option<usize>,
    failures: HashMap<MockOp, J2534Error>,
    calls: Vec<MockOp>,
    disconnects: Vec<u32>,
    closes: Vec<u32>,
    ioctls: Vec<(u32, IoctlId)>,
    programming: Vec<(u32, u32)>,
    voltage_mv: u32,
    version: Option<VersionInfo>,
    last_error: Option<String>,
}

/// Lets a test park a read inside the driver while it pokes at the session
pub struct ReadGate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl ReadGate {
    /// Block until the gated read is inside the driver
    pub fn wait_entered(&self) {
        self.entered.recv().unwrap();
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// In-memory PassThru driver. Ids count up from 1 per kind.
pub struct MockDriver {
    state: Mutex<MockState>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                voltage_mv: 12_600,
                ..Default::default()
            }),
            gate: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_voltage(&self, mv: u32) {
        self.state().voltage_mv = mv;
    }

    pub fn set_version(&self, version: VersionInfo) {
        self.state().version = Some(version);
    }

    pub fn set_last_error(&self, text: &str) {
        self.state().last_error = Some(text.to_string());
    }

    /// The next call of `op` fails with `err`
    pub fn fail_next(&self, op: MockOp, err: J2534Error) {
        self.state().failures.insert(op, err);
    }

    /// Accept at most `n` messages per write
    pub fn limit_writes(&self, n: usize) {
        self.state().write_limit = Some(n);
    }

    /// Hand out id 1 for every channel, filter and periodic message
    pub fn repeat_ids(&self) {
        self.state().repeat_ids = true;
    }

    pub fn queue_rx(&self, channel_id: u32, msg: &Message) {
        let raw = PassThruMsg::try_from(msg).unwrap();
        self.state().rx.entry(channel_id).or_default().push_back(raw);
    }

    pub fn gate_next_read(&self) -> ReadGate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        ReadGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn calls(&self) -> Vec<MockOp> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state().calls.iter().filter(|c| **c == op).count()
    }

    pub fn sent(&self) -> Vec<(u32, Message)> {
        self.state().sent.clone()
    }

    pub fn open_channels(&self) -> Vec<u32> {
        self.state().channels.keys().copied().collect()
    }

    pub fn active_filters(&self, channel_id: u32) -> Vec<u32> {
        self.state()
            .filters
            .keys()
            .filter(|(c, _)| *c == channel_id)
            .map(|(_, f)| *f)
            .collect()
    }

    pub fn active_periodic(&self, channel_id: u32) -> Vec<u32> {
        self.state()
            .periodic
            .keys()
            .filter(|(c, _)| *c == channel_id)
            .map(|(_, m)| *m)
            .collect()
    }

    pub fn disconnects(&self) -> Vec<u32> {
        self.state().disconnects.clone()
    }

    pub fn closes(&self) -> Vec<u32> {
        self.state().closes.clone()
    }

    pub fn ioctls(&self) -> Vec<(u32, IoctlId)> {
        self.state().ioctls.clone()
    }

    pub fn programming_voltages(&self) -> Vec<(u32, u32)> {
        self.state().programming.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().device.is_some()
    }

    /// Record the call and consume any injected failure for it
    fn enter(&self, op: MockOp) -> Result<MutexGuard<'_, MockState>, J2534Error> {
        let mut state = self.state();
        state.calls.push(op);
        let failure = state.failures.remove(&op);
        match failure {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn next_id(state: &mut MockState, op: MockOp) -> u32 {
    if state.repeat_ids {
        return 1;
    }
    let id = state.next_id.entry(op).or_insert(0);
    *id += 1;
    *id
}

fn check_device(state: &MockState, device_id: u32) -> Result<(), J2534Error> {
    match state.device {
        Some(id) if id == device_id => Ok(()),
        _ => Err(J2534Error::InvalidDeviceId),
    }
}

fn check_channel(state: &MockState, channel_id: u32) -> Result<Protocol, J2534Error> {
    state
        .channels
        .get(&channel_id)
        .copied()
        .ok_or(J2534Error::InvalidChannelId)
}

impl Driver for MockDriver {
    fn open(&self) -> Result<u32, J2534Error> {
        let mut state = self.enter(MockOp::Open)?;
        if state.device.is_some() {
            return Err(J2534Error::DeviceInUse);
        }
        let id = next_id(&mut state, MockOp::Open);
        state.device = Some(id);
        Ok(id)
    }

    fn close(&self, device_id: u32) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::Close)?;
        check_device(&state, device_id)?;
        state.device = None;
        state.closes.push(device_id);
        Ok(())
    }

    fn read_version(&self, device_id: u32) -> Result<VersionInfo, J2534Error> {
        let state = self.enter(MockOp::ReadVersion)?;
        check_device(&state, device_id)?;
        Ok(state.version.clone().unwrap_or_else(|| VersionInfo {
            fw_version: "1.0.0".to_string(),
            api_version: "04.04".to_string(),
            dll_version: "1.0.0".to_string(),
        }))
    }

    fn read_battery_voltage(&self, device_id: u32) -> Result<u32, J2534Error> {
        let state = self.enter(MockOp::ReadVoltage)?;
        check_device(&state, device_id)?;
        Ok(state.voltage_mv)
    }

    fn set_programming_voltage(
        &self,
        device_id: u32,
        pin: u32,
        millivolts: u32,
    ) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::SetProgrammingVoltage)?;
        check_device(&state, device_id)?;
        state.programming.push((pin, millivolts));
        Ok(())
    }

    fn connect(
        &self,
        device_id: u32,
        protocol: Protocol,
        _flags: ConnectFlags,
        _baudrate: u32,
    ) -> Result<u32, J2534Error> {
        let mut state = self.enter(MockOp::Connect)?;
        check_device(&state, device_id)?;
        let id = next_id(&mut state, MockOp::Connect);
        state.channels.insert(id, protocol);
        Ok(id)
    }

    fn disconnect(&self, channel_id: u32) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::Disconnect)?;
        check_channel(&state, channel_id)?;
        state.channels.remove(&channel_id);
        state.filters.retain(|(c, _), _| *c != channel_id);
        state.periodic.retain(|(c, _), _| *c != channel_id);
        state.disconnects.push(channel_id);
        Ok(())
    }

    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: FilterType,
        _mask: &PassThruMsg,
        _pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, J2534Error> {
        let mut state = self.enter(MockOp::StartFilter)?;
        check_channel(&state, channel_id)?;
        if filter_type == FilterType::FlowControl && flow_control.is_none() {
            return Err(J2534Error::NoFlowControl);
        }
        let id = next_id(&mut state, MockOp::StartFilter);
        state.filters.insert((channel_id, id), filter_type);
        Ok(id)
    }

    fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::StopFilter)?;
        check_channel(&state, channel_id)?;
        state
            .filters
            .remove(&(channel_id, filter_id))
            .map(|_| ())
            .ok_or(J2534Error::InvalidFilterId)
    }

    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        _timeout_ms: u32,
    ) -> Result<usize, J2534Error> {
        let mut state = self.enter(MockOp::Write)?;
        let protocol = check_channel(&state, channel_id)?;
        if msgs.iter().any(|m| m.protocol_id != protocol.id()) {
            return Err(J2534Error::MsgProtocolId);
        }
        let accepted = state.write_limit.map_or(msgs.len(), |n| n.min(msgs.len()));
        for raw in &msgs[..accepted] {
            let msg = Message::try_from(raw).unwrap();
            state.sent.push((channel_id, msg));
        }
        Ok(accepted)
    }

    fn read_msgs(
        &self,
        channel_id: u32,
        max_msgs: u32,
        _timeout_ms: u32,
    ) -> Result<Vec<PassThruMsg>, J2534Error> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        let mut state = self.enter(MockOp::Read)?;
        check_channel(&state, channel_id)?;
        let queue = state.rx.entry(channel_id).or_default();
        let n = (max_msgs as usize).min(queue.len());
        let msgs: Vec<PassThruMsg> = queue.drain(..n).collect();
        Ok(msgs)
    }

    fn start_periodic_msg(
        &self,
        channel_id: u32,
        _msg: &PassThruMsg,
        interval_ms: u32,
    ) -> Result<u32, J2534Error> {
        let mut state = self.enter(MockOp::StartPeriodic)?;
        check_channel(&state, channel_id)?;
        let id = next_id(&mut state, MockOp::StartPeriodic);
        state.periodic.insert((channel_id, id), interval_ms);
        Ok(id)
    }

    fn stop_periodic_msg(&self, channel_id: u32, msg_id: u32) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::StopPeriodic)?;
        check_channel(&state, channel_id)?;
        state
            .periodic
            .remove(&(channel_id, msg_id))
            .map(|_| ())
            .ok_or(J2534Error::InvalidMsgId)
    }

    fn get_config(&self, channel_id: u32, params: &mut [SConfig]) -> Result<(), J2534Error> {
        let state = self.enter(MockOp::GetConfig)?;
        check_channel(&state, channel_id)?;
        for param in params.iter_mut() {
            param.value = state
                .config
                .get(&(channel_id, param.parameter))
                .copied()
                .unwrap_or(0);
        }
        Ok(())
    }

    fn set_config(&self, channel_id: u32, params: &[SConfig]) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::SetConfig)?;
        check_channel(&state, channel_id)?;
        for param in params {
            state.config.insert((channel_id, param.parameter), param.value);
        }
        Ok(())
    }

    fn ioctl(&self, channel_id: u32, ioctl_id: IoctlId) -> Result<(), J2534Error> {
        let mut state = self.enter(MockOp::Ioctl)?;
        check_channel(&state, channel_id)?;
        match ioctl_id {
            IoctlId::ClearRxBuffer => {
                state.rx.remove(&channel_id);
            }
            IoctlId::ClearPeriodicMsgs => state.periodic.retain(|(c, _), _| *c != channel_id),
            IoctlId::ClearMsgFilters => state.filters.retain(|(c, _), _| *c != channel_id),
            _ => {}
        }
        state.ioctls.push((channel_id, ioctl_id));
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }
}

/// Test adapter with every protocol except the SCI family
pub fn mock_descriptor(name: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        name: name.to_string(),
        vendor: "Mock Vendor".to_string(),
        library_path: PathBuf::from(format!("/usr/lib/{}.so", name)),
        capabilities: Capabilities {
            can: true,
            iso15765: true,
            iso9141: true,
            iso14230: true,
            j1850vpw: true,
            j1850pwm: true,
            ..Default::default()
        },
    }
}

/// Backend that hands out one shared mock driver
pub struct MockBackend {
    pub devices: Vec<DeviceDescriptor>,
    pub driver: Arc<MockDriver>,
    pub fail_load: bool,
}

impl MockBackend {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            driver: Arc::new(MockDriver::new()),
            fail_load: false,
        }
    }
}

impl Backend for MockBackend {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, LoadDeviceError> {
        Ok(self.devices.clone())
    }

    fn load(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Driver>, LoadDeviceError> {
        if self.fail_load {
            return Err(LoadDeviceError::LibLoad(format!(
                "cannot open {}",
                descriptor.library_path.display()
            )));
        }
        Ok(self.driver.clone())
    }
}
