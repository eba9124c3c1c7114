use std::fmt;

use serde::{Deserialize, Serialize};

use crate::j2534::types::J2534Error;
use crate::j2534::Driver;

/// Every failure kind a caller can see, driver-reported or synthesized locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotSupported,
    InvalidChannelId,
    InvalidProtocolId,
    NullParameter,
    InvalidIoctlValue,
    InvalidFlags,
    /// ERR_FAILED, the driver's non-specific code
    Failed,
    DeviceNotConnected,
    Timeout,
    InvalidMsg,
    InvalidTimeInterval,
    ExceededLimit,
    InvalidMsgId,
    DeviceInUse,
    InvalidIoctlId,
    BufferEmpty,
    BufferFull,
    BufferOverflow,
    PinInvalid,
    ChannelInUse,
    MsgProtocolId,
    InvalidFilterId,
    NoFlowControl,
    NotUnique,
    InvalidBaudrate,
    InvalidDeviceId,
    // Local kinds, never returned by a driver
    AlreadyOpen,
    NotOpen,
    DeviceBusy,
    MalformedMessage,
    LibraryLoad,
    Config,
}

impl From<J2534Error> for ErrorKind {
    fn from(e: J2534Error) -> Self {
        match e {
            J2534Error::NotSupported => Self::NotSupported,
            J2534Error::InvalidChannelId => Self::InvalidChannelId,
            J2534Error::InvalidProtocolId => Self::InvalidProtocolId,
            J2534Error::NullParameter => Self::NullParameter,
            J2534Error::InvalidIoctlValue => Self::InvalidIoctlValue,
            J2534Error::InvalidFlags => Self::InvalidFlags,
            J2534Error::Failed => Self::Failed,
            J2534Error::DeviceNotConnected => Self::DeviceNotConnected,
            J2534Error::Timeout => Self::Timeout,
            J2534Error::InvalidMsg => Self::InvalidMsg,
            J2534Error::InvalidTimeInterval => Self::InvalidTimeInterval,
            J2534Error::ExceededLimit => Self::ExceededLimit,
            J2534Error::InvalidMsgId => Self::InvalidMsgId,
            J2534Error::DeviceInUse => Self::DeviceInUse,
            J2534Error::InvalidIoctlId => Self::InvalidIoctlId,
            J2534Error::BufferEmpty => Self::BufferEmpty,
            J2534Error::BufferFull => Self::BufferFull,
            J2534Error::BufferOverflow => Self::BufferOverflow,
            J2534Error::PinInvalid => Self::PinInvalid,
            J2534Error::ChannelInUse => Self::ChannelInUse,
            J2534Error::MsgProtocolId => Self::MsgProtocolId,
            J2534Error::InvalidFilterId => Self::InvalidFilterId,
            J2534Error::NoFlowControl => Self::NoFlowControl,
            J2534Error::NotUnique => Self::NotUnique,
            J2534Error::InvalidBaudrate => Self::InvalidBaudrate,
            J2534Error::InvalidDeviceId => Self::InvalidDeviceId,
        }
    }
}

impl ErrorKind {
    /// The J2534 status code behind this kind, if it has one
    pub fn driver_code(self) -> Option<J2534Error> {
        let code = match self {
            Self::NotSupported => J2534Error::NotSupported,
            Self::InvalidChannelId => J2534Error::InvalidChannelId,
            Self::InvalidProtocolId => J2534Error::InvalidProtocolId,
            Self::NullParameter => J2534Error::NullParameter,
            Self::InvalidIoctlValue => J2534Error::InvalidIoctlValue,
            Self::InvalidFlags => J2534Error::InvalidFlags,
            Self::Failed => J2534Error::Failed,
            Self::DeviceNotConnected => J2534Error::DeviceNotConnected,
            Self::Timeout => J2534Error::Timeout,
            Self::InvalidMsg => J2534Error::InvalidMsg,
            Self::InvalidTimeInterval => J2534Error::InvalidTimeInterval,
            Self::ExceededLimit => J2534Error::ExceededLimit,
            Self::InvalidMsgId => J2534Error::InvalidMsgId,
            Self::DeviceInUse => J2534Error::DeviceInUse,
            Self::InvalidIoctlId => J2534Error::InvalidIoctlId,
            Self::BufferEmpty => J2534Error::BufferEmpty,
            Self::BufferFull => J2534Error::BufferFull,
            Self::BufferOverflow => J2534Error::BufferOverflow,
            Self::PinInvalid => J2534Error::PinInvalid,
            Self::ChannelInUse => J2534Error::ChannelInUse,
            Self::MsgProtocolId => J2534Error::MsgProtocolId,
            Self::InvalidFilterId => J2534Error::InvalidFilterId,
            Self::NoFlowControl => J2534Error::NoFlowControl,
            Self::NotUnique => J2534Error::NotUnique,
            Self::InvalidBaudrate => J2534Error::InvalidBaudrate,
            Self::InvalidDeviceId => J2534Error::InvalidDeviceId,
            Self::AlreadyOpen
            | Self::NotOpen
            | Self::DeviceBusy
            | Self::MalformedMessage
            | Self::LibraryLoad
            | Self::Config => return None,
        };
        Some(code)
    }

    /// True for kinds this layer produces without a driver round-trip
    pub fn is_local(self) -> bool {
        self.driver_code().is_none()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyOpen => write!(f, "Device already open"),
            Self::NotOpen => write!(f, "No device open"),
            Self::DeviceBusy => write!(f, "Device in operation"),
            Self::MalformedMessage => write!(f, "Malformed message"),
            Self::LibraryLoad => write!(f, "Driver library load failed"),
            Self::Config => write!(f, "Device configuration error"),
            other => match other.driver_code() {
                Some(code) => write!(f, "{}", code),
                None => write!(f, "{:?}", other),
            },
        }
    }
}

/// Error returned by every session, channel and codec operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}{}", .detail.as_ref().map(|d| format!(": {}", d)).unwrap_or_default())]
pub struct PassThruError {
    pub kind: ErrorKind,
    pub detail: Option<String>,
}

pub type Result<T> = std::result::Result<T, PassThruError>;

impl PassThruError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    /// Convert a driver status, pulling the last-error text when the code is ERR_FAILED.
    /// The kind is kept either way so callers can still match on it.
    pub fn from_driver(err: J2534Error, driver: &dyn Driver) -> Self {
        if err != J2534Error::Failed {
            return Self::new(err.into());
        }
        match driver.last_error() {
            Some(text) if !text.trim().is_empty() => {
                Self::with_detail(ErrorKind::Failed, text.trim().to_string())
            }
            _ => Self::new(ErrorKind::Failed),
        }
    }
}

impl From<ErrorKind> for PassThruError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<J2534Error> for PassThruError {
    fn from(e: J2534Error) -> Self {
        Self::new(e.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PassThruError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::with_detail(ErrorKind::Failed, e.to_string())
    }
}
