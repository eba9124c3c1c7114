use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, PassThruError, Result};
use crate::j2534::device::{self, DeviceDescriptor, VersionInfo};
use crate::j2534::message::Message;
use crate::j2534::types::*;
use crate::session::channel::{ClearTarget, ConfigValue};
use crate::session::filter::Filter;
use crate::state::AppState;

/// Log a command failure and hand it back unchanged
fn log_err(context: &str, err: PassThruError) -> PassThruError {
    log::error!("[{}] {}", context, err);
    err
}

/// Error half of a command reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub err: ErrorKind,
    pub detail: Option<String>,
}

/// What every command returns: the payload, or `{ "err": ..., "detail": ... }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response<T> {
    Err(ErrorBody),
    Ok(T),
}

impl<T> Response<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err(body) => Err(PassThruError {
                kind: body.err,
                detail: body.detail,
            }),
        }
    }
}

impl<T> From<Result<T>> for Response<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::Err(ErrorBody {
                err: e.kind,
                detail: e.detail,
            }),
        }
    }
}

/// Run a command body, logging any failure under the command name
fn respond<T>(context: &str, result: Result<T>) -> Response<T> {
    result.map_err(|e| log_err(context, e)).into()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReply {
    pub device_id: u32,
    pub opened_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltageReply {
    pub mv: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReply {
    pub channel_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterReply {
    pub filter_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentReply {
    pub sent_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicReply {
    pub msg_id: u32,
}

/// A message as it crosses the command boundary. Protocol and flags are
/// raw numbers so bad values surface as `InvalidProtocolId` / `InvalidFlags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDto {
    pub protocol: u32,
    pub data: Vec<u8>,
    #[serde(default)]
    pub tx_flags: u32,
    #[serde(default)]
    pub rx_status: u32,
    #[serde(default)]
    pub extra_data_index: u32,
    #[serde(default)]
    pub timestamp: u32,
}

impl TryFrom<MessageDto> for Message {
    type Error = PassThruError;

    fn try_from(dto: MessageDto) -> Result<Self> {
        Ok(Message {
            protocol: protocol(dto.protocol)?,
            data: dto.data,
            tx_flags: TxFlags::from_bits(dto.tx_flags).ok_or_else(|| {
                PassThruError::with_detail(
                    ErrorKind::InvalidFlags,
                    format!("unknown tx flags {:#010X}", dto.tx_flags),
                )
            })?,
            rx_status: RxStatus::from_bits_retain(dto.rx_status),
            extra_data_index: dto.extra_data_index,
            timestamp: dto.timestamp,
        })
    }
}

impl From<&Message> for MessageDto {
    fn from(msg: &Message) -> Self {
        Self {
            protocol: msg.protocol.id(),
            data: msg.data.clone(),
            tx_flags: msg.tx_flags.bits(),
            rx_status: msg.rx_status.bits(),
            extra_data_index: msg.extra_data_index,
            timestamp: msg.timestamp,
        }
    }
}

fn protocol(id: u32) -> Result<Protocol> {
    Protocol::try_from(id).map_err(|_| {
        PassThruError::with_detail(
            ErrorKind::InvalidProtocolId,
            format!("unknown protocol id {:#04X}", id),
        )
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub protocol: u32,
    pub baud: u32,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub channel_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetFilterRequest {
    pub channel_id: u32,
    pub filter_type: u32,
    pub mask: Vec<u8>,
    pub pattern: Vec<u8>,
    #[serde(default)]
    pub flow_control: Option<Vec<u8>>,
    #[serde(default)]
    pub tx_flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveFilterRequest {
    pub channel_id: u32,
    pub filter_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub channel_id: u32,
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub channel_id: u32,
    /// Defaults to the configured read batch
    #[serde(default)]
    pub max_msgs: Option<u32>,
    #[serde(default)]
    pub timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPeriodicRequest {
    pub channel_id: u32,
    pub message: MessageDto,
    pub interval_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPeriodicRequest {
    pub channel_id: u32,
    pub msg_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgrammingVoltageRequest {
    pub pin: u32,
    pub mv: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigRequest {
    pub channel_id: u32,
    pub params: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfigValue {
    pub param: u32,
    pub value: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfigRequest {
    pub channel_id: u32,
    pub params: Vec<RawConfigValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRequest {
    pub channel_id: u32,
    pub target: ClearTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfigRequest {
    pub path: PathBuf,
}

fn config_param(id: u32) -> Result<IoctlParam> {
    IoctlParam::try_from(id).map_err(|_| {
        PassThruError::with_detail(
            ErrorKind::InvalidIoctlValue,
            format!("unknown config parameter {:#04X}", id),
        )
    })
}

pub fn list_devices(state: &AppState) -> Response<Vec<DeviceDescriptor>> {
    respond("list_devices", state.list_devices())
}

pub fn open_device(state: &AppState, descriptor: DeviceDescriptor) -> Response<DeviceReply> {
    respond(
        "open_device",
        state.open(descriptor).map(|session| DeviceReply {
            device_id: session.device_id(),
            opened_at: session.opened_at(),
        }),
    )
}

pub fn close_device(state: &AppState) -> Response<Empty> {
    respond("close_device", state.close().map(|_| Empty {}))
}

pub fn force_close(state: &AppState) -> Response<Empty> {
    respond("force_close", state.force_close().map(|_| Empty {}))
}

pub fn get_version(state: &AppState) -> Response<VersionInfo> {
    respond("get_version", state.session().and_then(|s| s.version()))
}

pub fn get_voltage(state: &AppState) -> Response<VoltageReply> {
    respond(
        "get_voltage",
        state
            .session()
            .and_then(|s| s.voltage())
            .map(|mv| VoltageReply { mv }),
    )
}

pub fn get_descriptor(state: &AppState) -> Response<DeviceDescriptor> {
    respond(
        "get_descriptor",
        state.session().map(|s| s.descriptor().clone()),
    )
}

pub fn set_programming_voltage(
    state: &AppState,
    req: ProgrammingVoltageRequest,
) -> Response<Empty> {
    respond(
        "set_programming_voltage",
        state
            .session()
            .and_then(|s| s.set_programming_voltage(req.pin, req.mv))
            .map(|_| Empty {}),
    )
}

fn connect_channel_inner(state: &AppState, req: ConnectRequest) -> Result<ChannelReply> {
    let session = state.session()?;
    let protocol = protocol(req.protocol)?;
    let flags = ConnectFlags::from_bits(req.flags).ok_or_else(|| {
        PassThruError::with_detail(
            ErrorKind::InvalidFlags,
            format!("unknown connect flags {:#010X}", req.flags),
        )
    })?;
    let channel_id = session.connect(protocol, flags, req.baud)?;
    Ok(ChannelReply { channel_id })
}

pub fn connect_channel(state: &AppState, req: ConnectRequest) -> Response<ChannelReply> {
    respond("connect_channel", connect_channel_inner(state, req))
}

pub fn disconnect_channel(state: &AppState, req: ChannelRequest) -> Response<Empty> {
    respond(
        "disconnect_channel",
        state
            .session()
            .and_then(|s| s.disconnect(req.channel_id))
            .map(|_| Empty {}),
    )
}

fn set_filter_inner(state: &AppState, req: SetFilterRequest) -> Result<FilterReply> {
    let session = state.session()?;
    let filter_type = FilterType::try_from(req.filter_type).map_err(|_| {
        PassThruError::with_detail(
            ErrorKind::NotSupported,
            format!("unknown filter type {}", req.filter_type),
        )
    })?;
    let mut filter = Filter::new(filter_type, req.mask, req.pattern, req.flow_control);
    filter.tx_flags = TxFlags::from_bits(req.tx_flags)
        .ok_or_else(|| PassThruError::from(ErrorKind::InvalidFlags))?;
    let filter_id = session.set_filter(req.channel_id, filter)?;
    Ok(FilterReply { filter_id })
}

pub fn set_filter(state: &AppState, req: SetFilterRequest) -> Response<FilterReply> {
    respond("set_filter", set_filter_inner(state, req))
}

pub fn remove_filter(state: &AppState, req: RemoveFilterRequest) -> Response<Empty> {
    respond(
        "remove_filter",
        state
            .session()
            .and_then(|s| s.remove_filter(req.channel_id, req.filter_id))
            .map(|_| Empty {}),
    )
}

fn send_messages_inner(state: &AppState, req: SendRequest) -> Result<SentReply> {
    let session = state.session()?;
    let messages = req
        .messages
        .into_iter()
        .map(Message::try_from)
        .collect::<Result<Vec<_>>>()?;
    let sent_count = session.send(req.channel_id, &messages, req.timeout)?;
    Ok(SentReply { sent_count })
}

pub fn send_messages(state: &AppState, req: SendRequest) -> Response<SentReply> {
    respond("send_messages", send_messages_inner(state, req))
}

fn read_messages_inner(state: &AppState, req: ReadRequest) -> Result<Vec<MessageDto>> {
    let session = state.session()?;
    let max_msgs = req.max_msgs.unwrap_or(state.config().read_batch);
    let messages = session.read(req.channel_id, max_msgs, req.timeout)?;
    Ok(messages.iter().map(MessageDto::from).collect())
}

pub fn read_messages(state: &AppState, req: ReadRequest) -> Response<Vec<MessageDto>> {
    respond("read_messages", read_messages_inner(state, req))
}

fn start_periodic_inner(state: &AppState, req: StartPeriodicRequest) -> Result<PeriodicReply> {
    let session = state.session()?;
    let message = Message::try_from(req.message)?;
    let msg_id = session.start_periodic(req.channel_id, message, req.interval_ms)?;
    Ok(PeriodicReply { msg_id })
}

pub fn start_periodic(state: &AppState, req: StartPeriodicRequest) -> Response<PeriodicReply> {
    respond("start_periodic", start_periodic_inner(state, req))
}

pub fn stop_periodic(state: &AppState, req: StopPeriodicRequest) -> Response<Empty> {
    respond(
        "stop_periodic",
        state
            .session()
            .and_then(|s| s.stop_periodic(req.channel_id, req.msg_id))
            .map(|_| Empty {}),
    )
}

fn get_config_inner(state: &AppState, req: GetConfigRequest) -> Result<Vec<ConfigValue>> {
    let session = state.session()?;
    let params = req
        .params
        .iter()
        .map(|p| config_param(*p))
        .collect::<Result<Vec<_>>>()?;
    session.get_config(req.channel_id, &params)
}

pub fn get_config(state: &AppState, req: GetConfigRequest) -> Response<Vec<ConfigValue>> {
    respond("get_config", get_config_inner(state, req))
}

fn set_config_inner(state: &AppState, req: SetConfigRequest) -> Result<Empty> {
    let session = state.session()?;
    let values = req
        .params
        .iter()
        .map(|p| {
            Ok(ConfigValue {
                param: config_param(p.param)?,
                value: p.value,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    session.set_config(req.channel_id, &values)?;
    Ok(Empty {})
}

pub fn set_config(state: &AppState, req: SetConfigRequest) -> Response<Empty> {
    respond("set_config", set_config_inner(state, req))
}

pub fn clear_buffers(state: &AppState, req: ClearRequest) -> Response<Empty> {
    respond(
        "clear_buffers",
        state
            .session()
            .and_then(|s| s.clear(req.channel_id, req.target))
            .map(|_| Empty {}),
    )
}

/// Parse a device manifest. Does not touch the session.
pub fn load_config(req: LoadConfigRequest) -> Response<DeviceDescriptor> {
    respond(
        "load_config",
        device::load_manifest(&req.path).map_err(PassThruError::from),
    )
}

fn call<Req, T, F>(state: &AppState, command: &str, args: Value, f: F) -> Value
where
    Req: DeserializeOwned,
    T: Serialize,
    F: FnOnce(&AppState, Req) -> Response<T>,
{
    let response = match serde_json::from_value::<Req>(args) {
        Ok(req) => f(state, req),
        Err(e) => respond(
            command,
            Err(PassThruError::with_detail(
                ErrorKind::InvalidMsg,
                format!("bad arguments: {}", e),
            )),
        ),
    };
    to_value(command, response)
}

fn to_value<T: Serialize>(command: &str, response: Response<T>) -> Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        log::error!("[{}] reply not serializable: {}", command, e);
        serde_json::json!({ "err": ErrorKind::Failed, "detail": e.to_string() })
    })
}

/// Route a command by name with JSON arguments, the way the IPC layer calls in
pub fn invoke(state: &AppState, command: &str, args: Value) -> Value {
    log::debug!("invoke {} {}", command, args);
    match command {
        "list_devices" => to_value(command, list_devices(state)),
        "open_device" => call(state, command, args, open_device),
        "close_device" => to_value(command, close_device(state)),
        "force_close" => to_value(command, force_close(state)),
        "get_version" => to_value(command, get_version(state)),
        "get_voltage" => to_value(command, get_voltage(state)),
        "get_descriptor" => to_value(command, get_descriptor(state)),
        "set_programming_voltage" => call(state, command, args, set_programming_voltage),
        "connect_channel" => call(state, command, args, connect_channel),
        "disconnect_channel" => call(state, command, args, disconnect_channel),
        "set_filter" => call(state, command, args, set_filter),
        "remove_filter" => call(state, command, args, remove_filter),
        "send_messages" => call(state, command, args, send_messages),
        "read_messages" => call(state, command, args, read_messages),
        "start_periodic" => call(state, command, args, start_periodic),
        "stop_periodic" => call(state, command, args, stop_periodic),
        "get_config" => call(state, command, args, get_config),
        "set_config" => call(state, command, args, set_config),
        "clear_buffers" => call(state, command, args, clear_buffers),
        "load_config" => call(state, command, args, |_, req| load_config(req)),
        other => to_value(
            command,
            respond::<()>(
                command,
                Err(PassThruError::with_detail(
                    ErrorKind::NotSupported,
                    format!("unknown command {}", other),
                )),
            ),
        ),
    }
}
