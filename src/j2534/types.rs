use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub const MAX_DATA_SIZE: usize = 4128;

/// Longest mask/pattern/flow-control sequence a J2534 04.04 filter accepts
pub const MAX_FILTER_LEN: usize = 12;

/// Length of the big-endian CAN id that prefixes CAN and ISO15765 data
pub const CAN_ID_LEN: usize = 4;

/// J2534 protocol IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum Protocol {
    J1850Vpw = 0x01,
    J1850Pwm = 0x02,
    Iso9141 = 0x03,
    Iso14230 = 0x04,
    Can = 0x05,
    Iso15765 = 0x06,
    SciAEngine = 0x07,
    SciATrans = 0x08,
    SciBEngine = 0x09,
    SciBTrans = 0x0A,
}

impl Protocol {
    pub const ALL: [Protocol; 10] = [
        Self::J1850Vpw,
        Self::J1850Pwm,
        Self::Iso9141,
        Self::Iso14230,
        Self::Can,
        Self::Iso15765,
        Self::SciAEngine,
        Self::SciATrans,
        Self::SciBEngine,
        Self::SciBTrans,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    /// CAN-family protocols carry a 4-byte CAN id at the start of every data field
    pub fn has_can_id(self) -> bool {
        matches!(self, Self::Can | Self::Iso15765)
    }
}

impl TryFrom<u32> for Protocol {
    type Error = J2534Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|p| p.id() == value)
            .ok_or(J2534Error::InvalidProtocolId)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::J1850Vpw => "J1850VPW",
            Self::J1850Pwm => "J1850PWM",
            Self::Iso9141 => "ISO9141",
            Self::Iso14230 => "ISO14230",
            Self::Can => "CAN",
            Self::Iso15765 => "ISO15765",
            Self::SciAEngine => "SCI_A_ENGINE",
            Self::SciATrans => "SCI_A_TRANS",
            Self::SciBEngine => "SCI_B_ENGINE",
            Self::SciBTrans => "SCI_B_TRANS",
        };
        f.write_str(name)
    }
}

/// J2534 filter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum FilterType {
    Pass = 0x01,
    Block = 0x02,
    FlowControl = 0x03,
}

impl TryFrom<u32> for FilterType {
    type Error = J2534Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Pass),
            0x02 => Ok(Self::Block),
            0x03 => Ok(Self::FlowControl),
            _ => Err(J2534Error::NotSupported),
        }
    }
}

bitflags! {
    /// Flags passed to PassThruConnect
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectFlags: u32 {
        const CAN_29BIT_ID = 0x0000_0100;
        const ISO9141_NO_CHECKSUM = 0x0000_0200;
        const CAN_ID_BOTH = 0x0000_0800;
        const ISO9141_K_LINE_ONLY = 0x0000_1000;
    }
}

bitflags! {
    /// Per-message transmit flags. An empty set is TX_NORMAL_TRANSMIT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxFlags: u32 {
        const ISO15765_FRAME_PAD = 0x0000_0040;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;
        const WAIT_P3_MIN_ONLY = 0x0000_0200;
        const BLOCKING = 0x0001_0000;
        const SCI_MODE = 0x0040_0000;
        const SCI_TX_VOLTAGE = 0x0080_0000;
    }
}

bitflags! {
    /// Receive status reported by the adapter on every read message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxStatus: u32 {
        const TX_MSG_TYPE = 0x0000_0001;
        /// Also ISO15765_FIRST_FRAME on ISO15765 channels
        const START_OF_MESSAGE = 0x0000_0002;
        const RX_BREAK = 0x0000_0004;
        const TX_INDICATION = 0x0000_0008;
        const ISO15765_PADDING_ERROR = 0x0000_0010;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;
    }
}

/// J2534 IOCTL IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoctlId {
    GetConfig = 0x01,
    SetConfig = 0x02,
    ReadVbatt = 0x03,
    FiveBaudInit = 0x04,
    FastInit = 0x05,
    ClearTxBuffer = 0x07,
    ClearRxBuffer = 0x08,
    ClearPeriodicMsgs = 0x09,
    ClearMsgFilters = 0x0A,
    ClearFunctMsgLookupTable = 0x0B,
    AddToFunctMsgLookupTable = 0x0C,
    DeleteFromFunctMsgLookupTable = 0x0D,
    ReadProgVoltage = 0x0E,
}

/// Config parameter IDs for GET_CONFIG / SET_CONFIG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum IoctlParam {
    DataRate = 0x01,
    Loopback = 0x03,
    NodeAddress = 0x04,
    NetworkLine = 0x05,
    P1Min = 0x06,
    P1Max = 0x07,
    P2Min = 0x08,
    P2Max = 0x09,
    P3Min = 0x0A,
    P3Max = 0x0B,
    P4Min = 0x0C,
    P4Max = 0x0D,
    W1 = 0x0E,
    W2 = 0x0F,
    W3 = 0x10,
    W4 = 0x11,
    W5 = 0x12,
    Tidle = 0x13,
    Tinil = 0x14,
    Twup = 0x15,
    Parity = 0x16,
    BitSamplePoint = 0x17,
    SyncJumpWidth = 0x18,
    W0 = 0x19,
    T1Max = 0x1A,
    T2Max = 0x1B,
    T4Max = 0x1C,
    T5Max = 0x1D,
    Iso15765Bs = 0x1E,
    Iso15765Stmin = 0x1F,
    DataBits = 0x20,
    FiveBaudMod = 0x21,
    BsTx = 0x22,
    StminTx = 0x23,
    T3Max = 0x24,
    Iso15765WftMax = 0x25,
}

impl IoctlParam {
    const ALL: [IoctlParam; 36] = [
        Self::DataRate,
        Self::Loopback,
        Self::NodeAddress,
        Self::NetworkLine,
        Self::P1Min,
        Self::P1Max,
        Self::P2Min,
        Self::P2Max,
        Self::P3Min,
        Self::P3Max,
        Self::P4Min,
        Self::P4Max,
        Self::W1,
        Self::W2,
        Self::W3,
        Self::W4,
        Self::W5,
        Self::Tidle,
        Self::Tinil,
        Self::Twup,
        Self::Parity,
        Self::BitSamplePoint,
        Self::SyncJumpWidth,
        Self::W0,
        Self::T1Max,
        Self::T2Max,
        Self::T4Max,
        Self::T5Max,
        Self::Iso15765Bs,
        Self::Iso15765Stmin,
        Self::DataBits,
        Self::FiveBaudMod,
        Self::BsTx,
        Self::StminTx,
        Self::T3Max,
        Self::Iso15765WftMax,
    ];
}

impl TryFrom<u32> for IoctlParam {
    type Error = J2534Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|p| *p as u32 == value)
            .ok_or(J2534Error::InvalidIoctlValue)
    }
}

/// PASSTHRU_MSG as laid out by the J2534 04.04 API
#[repr(C)]
#[derive(Clone)]
pub struct PassThruMsg {
    pub protocol_id: u32,
    pub rx_status: u32,
    pub tx_flags: u32,
    pub timestamp: u32,
    pub data_size: u32,
    pub extra_data_index: u32,
    pub data: [u8; MAX_DATA_SIZE],
}

impl Default for PassThruMsg {
    fn default() -> Self {
        Self {
            protocol_id: 0,
            rx_status: 0,
            tx_flags: 0,
            timestamp: 0,
            data_size: 0,
            extra_data_index: 0,
            data: [0u8; MAX_DATA_SIZE],
        }
    }
}

impl PassThruMsg {
    /// Bytes covered by `data_size`, clamped to the buffer
    pub fn bytes(&self) -> &[u8] {
        let len = (self.data_size as usize).min(MAX_DATA_SIZE);
        &self.data[..len]
    }
}

impl fmt::Debug for PassThruMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassThruMsg")
            .field("protocol_id", &self.protocol_id)
            .field("tx_flags", &format_args!("{:#010X}", self.tx_flags))
            .field("rx_status", &format_args!("{:#010X}", self.rx_status))
            .field("data_size", &self.data_size)
            .field("data", &format_args!("[{}]", hex(self.bytes())))
            .finish()
    }
}

/// Space-separated uppercase hex, used in traffic logs
pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Status codes returned by PassThru functions (STATUS_NOERROR excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u32)]
pub enum J2534Error {
    #[error("Not supported")]
    NotSupported = 0x01,
    #[error("Invalid channel ID")]
    InvalidChannelId = 0x02,
    #[error("Invalid protocol ID")]
    InvalidProtocolId = 0x03,
    #[error("Null parameter")]
    NullParameter = 0x04,
    #[error("Invalid IOCTL value")]
    InvalidIoctlValue = 0x05,
    #[error("Invalid flags")]
    InvalidFlags = 0x06,
    #[error("Failed")]
    Failed = 0x07,
    #[error("Device not connected")]
    DeviceNotConnected = 0x08,
    #[error("Timeout")]
    Timeout = 0x09,
    #[error("Invalid message")]
    InvalidMsg = 0x0A,
    #[error("Invalid time interval")]
    InvalidTimeInterval = 0x0B,
    #[error("Exceeded limit")]
    ExceededLimit = 0x0C,
    #[error("Invalid message ID")]
    InvalidMsgId = 0x0D,
    #[error("Device in use")]
    DeviceInUse = 0x0E,
    #[error("Invalid IOCTL ID")]
    InvalidIoctlId = 0x0F,
    #[error("Buffer empty")]
    BufferEmpty = 0x10,
    #[error("Buffer full")]
    BufferFull = 0x11,
    #[error("Buffer overflow")]
    BufferOverflow = 0x12,
    #[error("Pin invalid")]
    PinInvalid = 0x13,
    #[error("Channel in use")]
    ChannelInUse = 0x14,
    #[error("Message protocol ID mismatch")]
    MsgProtocolId = 0x15,
    #[error("Invalid filter ID")]
    InvalidFilterId = 0x16,
    #[error("No flow control")]
    NoFlowControl = 0x17,
    #[error("Not unique")]
    NotUnique = 0x18,
    #[error("Invalid baudrate")]
    InvalidBaudrate = 0x19,
    #[error("Invalid device ID")]
    InvalidDeviceId = 0x1A,
}

impl J2534Error {
    /// Map a non-zero status code. Codes outside the 04.04 table become `Failed`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x01 => Self::NotSupported,
            0x02 => Self::InvalidChannelId,
            0x03 => Self::InvalidProtocolId,
            0x04 => Self::NullParameter,
            0x05 => Self::InvalidIoctlValue,
            0x06 => Self::InvalidFlags,
            0x07 => Self::Failed,
            0x08 => Self::DeviceNotConnected,
            0x09 => Self::Timeout,
            0x0A => Self::InvalidMsg,
            0x0B => Self::InvalidTimeInterval,
            0x0C => Self::ExceededLimit,
            0x0D => Self::InvalidMsgId,
            0x0E => Self::DeviceInUse,
            0x0F => Self::InvalidIoctlId,
            0x10 => Self::BufferEmpty,
            0x11 => Self::BufferFull,
            0x12 => Self::BufferOverflow,
            0x13 => Self::PinInvalid,
            0x14 => Self::ChannelInUse,
            0x15 => Self::MsgProtocolId,
            0x16 => Self::InvalidFilterId,
            0x17 => Self::NoFlowControl,
            0x18 => Self::NotUnique,
            0x19 => Self::InvalidBaudrate,
            0x1A => Self::InvalidDeviceId,
            _ => Self::Failed,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Turn a raw PassThru return value into a Result
pub fn status(code: u32) -> Result<(), J2534Error> {
    match code {
        0 => Ok(()),
        other => Err(J2534Error::from_code(other)),
    }
}

/// SCONFIG structure for IOCTL
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SConfig {
    pub parameter: u32,
    pub value: u32,
}

/// SCONFIG_LIST structure for IOCTL
#[repr(C)]
pub struct SConfigList {
    pub num_of_params: u32,
    pub config_ptr: *mut SConfig,
}
