use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, PassThruError, Result};
use crate::j2534::types::*;

/// Wire header: protocol, tx flags, rx status, timestamp, data size,
/// extra data index. Six little-endian u32s.
pub const HEADER_LEN: usize = 24;

const CAN_MAX_PAYLOAD: usize = 8;

/// A protocol message as the session layer sees it.
///
/// `timestamp` and `rx_status` are filled in by the adapter on receive and
/// are zero for messages built locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: Protocol,
    pub data: Vec<u8>,
    pub tx_flags: TxFlags,
    pub rx_status: RxStatus,
    pub extra_data_index: u32,
    pub timestamp: u32,
}

impl Message {
    pub fn new(protocol: Protocol, data: impl Into<Vec<u8>>) -> Self {
        Self {
            protocol,
            data: data.into(),
            tx_flags: TxFlags::empty(),
            rx_status: RxStatus::empty(),
            extra_data_index: 0,
            timestamp: 0,
        }
    }

    /// ISO15765 message with the 4-byte CAN id header and frame padding set
    pub fn new_iso15765(can_id: u32, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(CAN_ID_LEN + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Self::new(Protocol::Iso15765, data).with_tx_flags(TxFlags::ISO15765_FRAME_PAD)
    }

    /// Raw CAN frame. More than 8 data bytes after the id is `InvalidMsg`.
    pub fn new_can(can_id: u32, payload: &[u8]) -> Result<Self> {
        if payload.len() > CAN_MAX_PAYLOAD {
            return Err(PassThruError::with_detail(
                ErrorKind::InvalidMsg,
                format!(
                    "CAN frame carries at most {} bytes, got {}",
                    CAN_MAX_PAYLOAD,
                    payload.len()
                ),
            ));
        }
        let mut data = Vec::with_capacity(CAN_ID_LEN + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Ok(Self::new(Protocol::Can, data))
    }

    pub fn with_tx_flags(mut self, flags: TxFlags) -> Self {
        self.tx_flags = flags;
        self
    }

    pub fn can_id(&self) -> Option<u32> {
        if !self.protocol.has_can_id() || self.data.len() < CAN_ID_LEN {
            return None;
        }
        let mut id = [0u8; CAN_ID_LEN];
        id.copy_from_slice(&self.data[..CAN_ID_LEN]);
        Some(u32::from_be_bytes(id))
    }

    /// Data after the CAN id header, or the whole data on non-CAN protocols
    pub fn payload(&self) -> &[u8] {
        if !self.protocol.has_can_id() {
            return &self.data;
        }
        self.data.get(CAN_ID_LEN..).unwrap_or(&[])
    }

    /// Loopback echo of a message we transmitted
    pub fn is_tx_echo(&self) -> bool {
        self.rx_status.contains(RxStatus::TX_MSG_TYPE)
    }

    /// ISO15765 first-frame indication, no payload yet
    pub fn is_first_frame(&self) -> bool {
        self.protocol == Protocol::Iso15765 && self.rx_status.contains(RxStatus::START_OF_MESSAGE)
    }

    fn check(&self) -> Result<()> {
        if self.data.len() > MAX_DATA_SIZE {
            return Err(PassThruError::with_detail(
                ErrorKind::MalformedMessage,
                format!("{} data bytes, max {}", self.data.len(), MAX_DATA_SIZE),
            ));
        }
        if self.extra_data_index as usize > self.data.len() {
            return Err(PassThruError::with_detail(
                ErrorKind::MalformedMessage,
                format!(
                    "extra data index {} beyond data size {}",
                    self.extra_data_index,
                    self.data.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Encode a message into the wire format.
///
/// ```text
/// ┌──────────┬──────────┬───────────┬───────────┬───────────┬────────────┬──────────────┐
/// │ protocol │ tx_flags │ rx_status │ timestamp │ data_size │ extra_data │ data         │
/// │ (4B LE)  │ (4B LE)  │ (4B LE)   │ (4B LE)   │ (4B LE)   │ (4B LE)    │ (data_size)  │
/// └──────────┴──────────┴───────────┴───────────┴───────────┴────────────┴──────────────┘
/// ```
pub fn encode(msg: &Message) -> Result<Bytes> {
    msg.check()?;
    let mut dst = BytesMut::with_capacity(HEADER_LEN + msg.data.len());
    dst.put_u32_le(msg.protocol.id());
    dst.put_u32_le(msg.tx_flags.bits());
    dst.put_u32_le(msg.rx_status.bits());
    dst.put_u32_le(msg.timestamp);
    dst.put_u32_le(msg.data.len() as u32);
    dst.put_u32_le(msg.extra_data_index);
    dst.put_slice(&msg.data);
    Ok(dst.freeze())
}

/// Decode one message. The input must hold exactly one encoded message.
pub fn decode(mut src: &[u8]) -> Result<Message> {
    if src.len() < HEADER_LEN {
        return Err(malformed(format!(
            "{} bytes, header needs {}",
            src.len(),
            HEADER_LEN
        )));
    }
    let protocol_id = src.get_u32_le();
    let tx_bits = src.get_u32_le();
    let rx_bits = src.get_u32_le();
    let timestamp = src.get_u32_le();
    let data_size = src.get_u32_le() as usize;
    let extra_data_index = src.get_u32_le();

    if data_size > MAX_DATA_SIZE {
        return Err(malformed(format!(
            "data size {} exceeds {}",
            data_size, MAX_DATA_SIZE
        )));
    }
    if src.remaining() != data_size {
        return Err(malformed(format!(
            "data size {} but {} bytes follow",
            data_size,
            src.remaining()
        )));
    }
    let protocol = Protocol::try_from(protocol_id)
        .map_err(|_| malformed(format!("unknown protocol id {:#04X}", protocol_id)))?;

    let msg = Message {
        protocol,
        data: src.to_vec(),
        tx_flags: TxFlags::from_bits_retain(tx_bits),
        rx_status: RxStatus::from_bits_retain(rx_bits),
        extra_data_index,
        timestamp,
    };
    msg.check()?;
    Ok(msg)
}

fn malformed(detail: String) -> PassThruError {
    PassThruError::with_detail(ErrorKind::MalformedMessage, detail)
}

impl TryFrom<&Message> for PassThruMsg {
    type Error = PassThruError;

    fn try_from(msg: &Message) -> Result<Self> {
        msg.check()?;
        let mut raw = PassThruMsg {
            protocol_id: msg.protocol.id(),
            rx_status: msg.rx_status.bits(),
            tx_flags: msg.tx_flags.bits(),
            timestamp: msg.timestamp,
            data_size: msg.data.len() as u32,
            extra_data_index: msg.extra_data_index,
            ..Default::default()
        };
        raw.data[..msg.data.len()].copy_from_slice(&msg.data);
        Ok(raw)
    }
}

impl TryFrom<&PassThruMsg> for Message {
    type Error = PassThruError;

    /// Adapters set vendor-specific status and echo flag bits, so both are kept as-is.
    fn try_from(raw: &PassThruMsg) -> Result<Self> {
        if raw.data_size as usize > MAX_DATA_SIZE {
            return Err(malformed(format!(
                "driver reported data size {}",
                raw.data_size
            )));
        }
        let protocol = Protocol::try_from(raw.protocol_id)
            .map_err(|_| malformed(format!("unknown protocol id {:#04X}", raw.protocol_id)))?;
        let msg = Message {
            protocol,
            data: raw.bytes().to_vec(),
            tx_flags: TxFlags::from_bits_retain(raw.tx_flags),
            rx_status: RxStatus::from_bits_retain(raw.rx_status),
            extra_data_index: raw.extra_data_index,
            timestamp: raw.timestamp,
        };
        msg.check()?;
        Ok(msg)
    }
}
