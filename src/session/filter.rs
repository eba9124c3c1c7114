use std::collections::BTreeMap;

use crate::error::{ErrorKind, PassThruError, Result};
use crate::j2534::types::*;

/// One message filter as installed on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub filter_type: FilterType,
    pub mask: Vec<u8>,
    pub pattern: Vec<u8>,
    /// Only for flow-control filters
    pub flow_control: Option<Vec<u8>>,
    /// Applied to the mask, pattern and flow-control messages
    pub tx_flags: TxFlags,
}

impl Filter {
    pub fn new(
        filter_type: FilterType,
        mask: impl Into<Vec<u8>>,
        pattern: impl Into<Vec<u8>>,
        flow_control: Option<Vec<u8>>,
    ) -> Self {
        Self {
            filter_type,
            mask: mask.into(),
            pattern: pattern.into(),
            flow_control,
            tx_flags: TxFlags::empty(),
        }
    }

    /// ISO15765 flow-control filter for a tester/ECU CAN id pair, 11-bit mask, padded frames
    pub fn iso15765_flow_control(tx_id: u32, rx_id: u32) -> Self {
        let mut filter = Self::new(
            FilterType::FlowControl,
            0x0000_07FFu32.to_be_bytes(),
            rx_id.to_be_bytes(),
            Some(tx_id.to_be_bytes().to_vec()),
        );
        filter.tx_flags = TxFlags::ISO15765_FRAME_PAD;
        filter
    }

    /// Structural checks that need no driver round-trip
    pub fn validate(&self, protocol: Protocol) -> Result<()> {
        match (self.filter_type, &self.flow_control) {
            (FilterType::FlowControl, None) => return Err(ErrorKind::NoFlowControl.into()),
            (FilterType::Pass | FilterType::Block, Some(_)) => {
                return Err(invalid("flow control bytes given for a pass/block filter"))
            }
            _ => {}
        }

        let len = self.mask.len();
        if len == 0 {
            return Err(invalid("empty mask"));
        }
        if self.pattern.len() != len {
            return Err(invalid(format!(
                "mask is {} bytes, pattern is {}",
                len,
                self.pattern.len()
            )));
        }
        if let Some(fc) = &self.flow_control {
            if fc.len() != len {
                return Err(invalid(format!(
                    "mask is {} bytes, flow control is {}",
                    len,
                    fc.len()
                )));
            }
        }
        if len > MAX_FILTER_LEN {
            return Err(invalid(format!(
                "{} bytes exceeds the {} byte filter limit",
                len, MAX_FILTER_LEN
            )));
        }
        if protocol.has_can_id() && len < CAN_ID_LEN {
            return Err(invalid(format!(
                "{} filters need the {} byte CAN id, got {}",
                protocol, CAN_ID_LEN, len
            )));
        }
        Ok(())
    }

    /// Driver-side messages for mask, pattern and flow control
    pub fn to_raw(
        &self,
        protocol: Protocol,
    ) -> (PassThruMsg, PassThruMsg, Option<PassThruMsg>) {
        (
            self.raw_msg(protocol, &self.mask),
            self.raw_msg(protocol, &self.pattern),
            self.flow_control
                .as_ref()
                .map(|fc| self.raw_msg(protocol, fc)),
        )
    }

    fn raw_msg(&self, protocol: Protocol, bytes: &[u8]) -> PassThruMsg {
        let mut msg = PassThruMsg {
            protocol_id: protocol.id(),
            tx_flags: self.tx_flags.bits(),
            data_size: bytes.len() as u32,
            ..Default::default()
        };
        msg.data[..bytes.len()].copy_from_slice(bytes);
        msg
    }
}

fn invalid(detail: impl Into<String>) -> PassThruError {
    PassThruError::with_detail(ErrorKind::InvalidMsg, detail)
}

/// Filters installed on one channel, keyed by driver-assigned id
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: BTreeMap<u32, Filter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `NotUnique` if the id is already registered
    pub fn insert(&mut self, filter_id: u32, filter: Filter) -> Result<()> {
        if self.filters.contains_key(&filter_id) {
            return Err(PassThruError::with_detail(
                ErrorKind::NotUnique,
                format!("filter id {} already registered", filter_id),
            ));
        }
        self.filters.insert(filter_id, filter);
        Ok(())
    }

    pub fn remove(&mut self, filter_id: u32) -> Result<Filter> {
        self.filters
            .remove(&filter_id)
            .ok_or_else(|| ErrorKind::InvalidFilterId.into())
    }

    pub fn get(&self, filter_id: u32) -> Option<&Filter> {
        self.filters.get(&filter_id)
    }

    pub fn contains(&self, filter_id: u32) -> bool {
        self.filters.contains_key(&filter_id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.filters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }
}
