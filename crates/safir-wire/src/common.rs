use crate::{require_len, DecodeError};

/// `dataType` values reserved by the fabric itself; anything else names an
/// application-defined payload kind.
pub mod data_type {
    pub const HEARTBEAT: i64 = -1;
    pub const ACK: i64 = -2;
    pub const CONTROL_DATA: i64 = -3;
    pub const WELCOME: i64 = -4;
}

/// One of the reserved [`data_type`] constants, or an application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Heartbeat,
    Ack,
    ControlData,
    Welcome,
    Application(i64),
}

impl From<i64> for DataType {
    fn from(value: i64) -> Self {
        match value {
            data_type::HEARTBEAT => Self::Heartbeat,
            data_type::ACK => Self::Ack,
            data_type::CONTROL_DATA => Self::ControlData,
            data_type::WELCOME => Self::Welcome,
            other => Self::Application(other),
        }
    }
}

impl From<DataType> for i64 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Heartbeat => data_type::HEARTBEAT,
            DataType::Ack => data_type::ACK,
            DataType::ControlData => data_type::CONTROL_DATA,
            DataType::Welcome => data_type::WELCOME,
            DataType::Application(id) => id,
        }
    }
}

/// The header every datagram begins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub data_type: i64,
}

impl CommonHeader {
    pub const ENCODE_LEN: usize = 24;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODE_LEN] {
        let mut buf = [0u8; Self::ENCODE_LEN];
        buf[0..8].copy_from_slice(&self.sender_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.receiver_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_type.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        require_len(buf, Self::ENCODE_LEN)?;
        Ok(Self {
            sender_id: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            receiver_id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            data_type: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    #[must_use]
    pub fn kind(&self) -> DataType {
        DataType::from(self.data_type)
    }
}
