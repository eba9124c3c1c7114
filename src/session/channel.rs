use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PassThruError, Result};
use crate::j2534::device::Capabilities;
use crate::j2534::message::Message;
use crate::j2534::types::*;
use crate::j2534::Driver;
use crate::session::filter::{Filter, FilterRegistry};

/// Periodic message intervals the PassThru API accepts, in ms
pub const PERIODIC_INTERVAL_MS: RangeInclusive<u32> = 5..=65535;

/// Most messages one read may request. The driver buffer is allocated up front.
pub const MAX_READ_MSGS: u32 = 1024;

/// Buffers and tables an IOCTL can clear on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearTarget {
    TxBuffer,
    RxBuffer,
    PeriodicMsgs,
    MsgFilters,
}

impl ClearTarget {
    pub fn ioctl(self) -> IoctlId {
        match self {
            Self::TxBuffer => IoctlId::ClearTxBuffer,
            Self::RxBuffer => IoctlId::ClearRxBuffer,
            Self::PeriodicMsgs => IoctlId::ClearPeriodicMsgs,
            Self::MsgFilters => IoctlId::ClearMsgFilters,
        }
    }
}

/// One GET_CONFIG / SET_CONFIG entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub param: IoctlParam,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicMsg {
    pub message: Message,
    pub interval_ms: u32,
}

/// A connected logical channel and everything installed on it
#[derive(Debug)]
pub struct Channel {
    pub id: u32,
    pub protocol: Protocol,
    pub baudrate: u32,
    pub flags: ConnectFlags,
    pub filters: FilterRegistry,
    pub periodic: BTreeMap<u32, PeriodicMsg>,
}

/// Snapshot of a channel for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub channel_id: u32,
    pub protocol: Protocol,
    pub baudrate: u32,
    pub flags: u32,
    pub filter_ids: Vec<u32>,
    pub periodic_ids: Vec<u32>,
}

impl From<&Channel> for ChannelInfo {
    fn from(ch: &Channel) -> Self {
        Self {
            channel_id: ch.id,
            protocol: ch.protocol,
            baudrate: ch.baudrate,
            flags: ch.flags.bits(),
            filter_ids: ch.filters.ids(),
            periodic_ids: ch.periodic.keys().copied().collect(),
        }
    }
}

/// Open channels of one device, keyed by driver channel id.
///
/// Every entry here has a live driver channel behind it. Entries are only
/// removed once the driver has disconnected them, and filters/periodic
/// messages are stopped before that.
///
/// A channel, filter or periodic id the driver hands out twice is refused
/// with `NotUnique` and not torn down: the id names the entry that is
/// already registered, so disconnecting or stopping it would kill that one.
pub struct ChannelManager {
    driver: Arc<dyn Driver>,
    device_id: u32,
    capabilities: Capabilities,
    channels: BTreeMap<u32, Channel>,
}

impl ChannelManager {
    pub fn new(driver: Arc<dyn Driver>, device_id: u32, capabilities: Capabilities) -> Self {
        Self {
            driver,
            device_id,
            capabilities,
            channels: BTreeMap::new(),
        }
    }

    fn driver_err(&self, err: J2534Error) -> PassThruError {
        PassThruError::from_driver(err, self.driver.as_ref())
    }

    fn channel(&self, channel_id: u32) -> Result<&Channel> {
        self.channels
            .get(&channel_id)
            .ok_or_else(|| ErrorKind::InvalidChannelId.into())
    }

    fn channel_mut(&mut self, channel_id: u32) -> Result<&mut Channel> {
        self.channels
            .get_mut(&channel_id)
            .ok_or_else(|| ErrorKind::InvalidChannelId.into())
    }

    pub fn connect(&mut self, protocol: Protocol, flags: ConnectFlags, baudrate: u32) -> Result<u32> {
        if !self.capabilities.supports(protocol) {
            return Err(PassThruError::with_detail(
                ErrorKind::NotSupported,
                format!("device does not advertise {}", protocol),
            ));
        }
        let channel_id = self
            .driver
            .connect(self.device_id, protocol, flags, baudrate)
            .map_err(|e| self.driver_err(e))?;
        if self.channels.contains_key(&channel_id) {
            log::warn!("Driver returned channel id {} which is already open", channel_id);
            return Err(PassThruError::with_detail(
                ErrorKind::NotUnique,
                format!("channel id {} already open", channel_id),
            ));
        }
        log::info!(
            "Connected {} channel {} at {} baud (flags {:#06X})",
            protocol,
            channel_id,
            baudrate,
            flags.bits()
        );
        self.channels.insert(
            channel_id,
            Channel {
                id: channel_id,
                protocol,
                baudrate,
                flags,
                filters: FilterRegistry::new(),
                periodic: BTreeMap::new(),
            },
        );
        Ok(channel_id)
    }

    /// Stop filters and periodic messages, then disconnect.
    /// If the driver refuses, the channel stays registered without them.
    pub fn disconnect(&mut self, channel_id: u32) -> Result<()> {
        let mut channel = self
            .channels
            .remove(&channel_id)
            .ok_or_else(|| PassThruError::from(ErrorKind::InvalidChannelId))?;

        for filter_id in channel.filters.ids() {
            if let Err(e) = self.driver.stop_msg_filter(channel_id, filter_id) {
                log::warn!("Stopping filter {} on channel {} failed: {}", filter_id, channel_id, e);
            }
        }
        channel.filters.clear();
        for msg_id in std::mem::take(&mut channel.periodic).into_keys() {
            if let Err(e) = self.driver.stop_periodic_msg(channel_id, msg_id) {
                log::warn!("Stopping periodic message {} on channel {} failed: {}", msg_id, channel_id, e);
            }
        }

        if let Err(e) = self.driver.disconnect(channel_id) {
            let err = self.driver_err(e);
            self.channels.insert(channel_id, channel);
            return Err(err);
        }
        log::info!("Disconnected {} channel {}", channel.protocol, channel_id);
        Ok(())
    }

    /// Best-effort disconnect of every channel, used on close
    pub fn disconnect_all(&mut self) {
        for channel_id in self.ids() {
            if let Err(e) = self.disconnect(channel_id) {
                log::warn!("Disconnect of channel {} during close failed: {}", channel_id, e);
                self.channels.remove(&channel_id);
            }
        }
    }

    /// Returns how many messages the driver accepted
    pub fn send(&self, channel_id: u32, messages: &[Message], timeout_ms: u32) -> Result<usize> {
        let channel = self.channel(channel_id)?;
        let raw = messages
            .iter()
            .map(|msg| {
                if msg.protocol != channel.protocol {
                    return Err(PassThruError::with_detail(
                        ErrorKind::MsgProtocolId,
                        format!("{} message on {} channel", msg.protocol, channel.protocol),
                    ));
                }
                PassThruMsg::try_from(msg)
            })
            .collect::<Result<Vec<_>>>()?;

        for msg in messages {
            log::debug!("TX ch{} [{}] {}", channel_id, msg.protocol, hex(&msg.data));
        }
        let sent = self
            .driver
            .write_msgs(channel_id, &raw, timeout_ms)
            .map_err(|e| self.driver_err(e))?;
        if sent < raw.len() {
            log::warn!("Channel {} accepted {} of {} messages", channel_id, sent, raw.len());
        }
        Ok(sent)
    }

    pub fn read(&self, channel_id: u32, max_msgs: u32, timeout_ms: u32) -> Result<Vec<Message>> {
        self.channel(channel_id)?;
        if max_msgs > MAX_READ_MSGS {
            return Err(PassThruError::with_detail(
                ErrorKind::ExceededLimit,
                format!("{} messages requested, at most {} per read", max_msgs, MAX_READ_MSGS),
            ));
        }
        let raw = self
            .driver
            .read_msgs(channel_id, max_msgs, timeout_ms)
            .map_err(|e| self.driver_err(e))?;
        let messages = raw
            .iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>>>()?;
        for msg in &messages {
            log::debug!(
                "RX ch{} [{}] {} (status {:#010X})",
                channel_id,
                msg.protocol,
                hex(&msg.data),
                msg.rx_status.bits()
            );
        }
        Ok(messages)
    }

    pub fn set_filter(&mut self, channel_id: u32, filter: Filter) -> Result<u32> {
        let protocol = self.channel(channel_id)?.protocol;
        filter.validate(protocol)?;

        let (mask, pattern, flow_control) = filter.to_raw(protocol);
        let filter_id = self
            .driver
            .start_msg_filter(
                channel_id,
                filter.filter_type,
                &mask,
                &pattern,
                flow_control.as_ref(),
            )
            .map_err(|e| self.driver_err(e))?;

        log::info!(
            "Filter {} on channel {}: {:?} mask={} pattern={}",
            filter_id,
            channel_id,
            filter.filter_type,
            hex(&filter.mask),
            hex(&filter.pattern)
        );
        self.channel_mut(channel_id)?
            .filters
            .insert(filter_id, filter)
            .inspect_err(|_| {
                log::warn!(
                    "Driver returned filter id {} which is already active on channel {}",
                    filter_id,
                    channel_id
                )
            })?;
        Ok(filter_id)
    }

    pub fn remove_filter(&mut self, channel_id: u32, filter_id: u32) -> Result<()> {
        if !self.channel(channel_id)?.filters.contains(filter_id) {
            return Err(ErrorKind::InvalidFilterId.into());
        }
        self.driver
            .stop_msg_filter(channel_id, filter_id)
            .map_err(|e| self.driver_err(e))?;
        self.channel_mut(channel_id)?.filters.remove(filter_id)?;
        log::info!("Removed filter {} from channel {}", filter_id, channel_id);
        Ok(())
    }

    pub fn start_periodic(&mut self, channel_id: u32, message: Message, interval_ms: u32) -> Result<u32> {
        let protocol = self.channel(channel_id)?.protocol;
        if !PERIODIC_INTERVAL_MS.contains(&interval_ms) {
            return Err(PassThruError::with_detail(
                ErrorKind::InvalidTimeInterval,
                format!("{} ms outside {:?}", interval_ms, PERIODIC_INTERVAL_MS),
            ));
        }
        if message.protocol != protocol {
            return Err(ErrorKind::MsgProtocolId.into());
        }
        let raw = PassThruMsg::try_from(&message)?;
        let msg_id = self
            .driver
            .start_periodic_msg(channel_id, &raw, interval_ms)
            .map_err(|e| self.driver_err(e))?;

        let channel = self.channel_mut(channel_id)?;
        if channel.periodic.contains_key(&msg_id) {
            log::warn!(
                "Driver returned periodic id {} which is already running on channel {}",
                msg_id,
                channel_id
            );
            return Err(PassThruError::with_detail(
                ErrorKind::NotUnique,
                format!("periodic message id {} already registered", msg_id),
            ));
        }
        log::info!(
            "Periodic message {} on channel {} every {} ms: {}",
            msg_id,
            channel_id,
            interval_ms,
            hex(&message.data)
        );
        channel.periodic.insert(msg_id, PeriodicMsg { message, interval_ms });
        Ok(msg_id)
    }

    pub fn stop_periodic(&mut self, channel_id: u32, msg_id: u32) -> Result<()> {
        if !self.channel(channel_id)?.periodic.contains_key(&msg_id) {
            return Err(ErrorKind::InvalidMsgId.into());
        }
        self.driver
            .stop_periodic_msg(channel_id, msg_id)
            .map_err(|e| self.driver_err(e))?;
        self.channel_mut(channel_id)?.periodic.remove(&msg_id);
        Ok(())
    }

    pub fn get_config(&self, channel_id: u32, params: &[IoctlParam]) -> Result<Vec<ConfigValue>> {
        self.channel(channel_id)?;
        let mut list: Vec<SConfig> = params
            .iter()
            .map(|p| SConfig {
                parameter: *p as u32,
                value: 0,
            })
            .collect();
        self.driver
            .get_config(channel_id, &mut list)
            .map_err(|e| self.driver_err(e))?;
        Ok(params
            .iter()
            .zip(list)
            .map(|(param, sc)| ConfigValue {
                param: *param,
                value: sc.value,
            })
            .collect())
    }

    pub fn set_config(&self, channel_id: u32, values: &[ConfigValue]) -> Result<()> {
        self.channel(channel_id)?;
        let list: Vec<SConfig> = values
            .iter()
            .map(|v| SConfig {
                parameter: v.param as u32,
                value: v.value,
            })
            .collect();
        self.driver
            .set_config(channel_id, &list)
            .map_err(|e| self.driver_err(e))?;
        log::debug!("SET_CONFIG on channel {}: {:?}", channel_id, values);
        Ok(())
    }

    pub fn clear(&mut self, channel_id: u32, target: ClearTarget) -> Result<()> {
        self.channel(channel_id)?;
        self.driver
            .ioctl(channel_id, target.ioctl())
            .map_err(|e| self.driver_err(e))?;
        let channel = self.channel_mut(channel_id)?;
        match target {
            ClearTarget::PeriodicMsgs => channel.periodic.clear(),
            ClearTarget::MsgFilters => channel.filters.clear(),
            ClearTarget::TxBuffer | ClearTarget::RxBuffer => {}
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }

    pub fn info(&self) -> Vec<ChannelInfo> {
        self.channels.values().map(ChannelInfo::from).collect()
    }

    pub fn get(&self, channel_id: u32) -> Option<&Channel> {
        self.channels.get(&channel_id)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
