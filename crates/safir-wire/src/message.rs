use crate::{common::CommonHeader, require_len, DecodeError};

/// `sendMethod`: whether a message was addressed to one peer or broadcast to
/// all current system peers over a shared sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SendMethod {
    SingleReceiver = 0,
    MultiReceiver = 1,
}

impl SendMethod {
    fn decode(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(Self::SingleReceiver),
            1 => Ok(Self::MultiReceiver),
            value => Err(DecodeError::InvalidDiscriminant {
                name: "SendMethod",
                value,
            }),
        }
    }
}

/// `deliveryGuarantee`: reliable-ordered-fragmented vs best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryGuarantee {
    Unacked = 0,
    Acked = 1,
}

impl DeliveryGuarantee {
    fn decode(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(Self::Unacked),
            1 => Ok(Self::Acked),
            value => Err(DecodeError::InvalidDiscriminant {
                name: "DeliveryGuarantee",
                value,
            }),
        }
    }
}

/// The per-fragment header carried by every application or control payload,
/// immediately following the [`CommonHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub common: CommonHeader,
    pub send_method: SendMethod,
    pub delivery_guarantee: DeliveryGuarantee,
    pub ack_now: bool,
    pub sequence_number: u64,
    pub total_content_size: u32,
    pub fragment_offset: u32,
    pub fragment_content_size: u32,
    pub fragment_number: u16,
    pub number_of_fragments: u16,
}

impl MessageHeader {
    /// `CommonHeader::ENCODE_LEN` (24) + this struct's own fields (28) = 52.
    pub const ENCODE_LEN: usize = 52;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODE_LEN] {
        let mut buf = [0u8; Self::ENCODE_LEN];
        buf[0..24].copy_from_slice(&self.common.encode());
        buf[24] = self.send_method as u8;
        buf[25] = self.delivery_guarantee as u8;
        buf[26] = u8::from(self.ack_now);
        buf[27] = 0; // _pad
        buf[28..36].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[36..40].copy_from_slice(&self.total_content_size.to_le_bytes());
        buf[40..44].copy_from_slice(&self.fragment_offset.to_le_bytes());
        buf[44..48].copy_from_slice(&self.fragment_content_size.to_le_bytes());
        buf[48..50].copy_from_slice(&self.fragment_number.to_le_bytes());
        buf[50..52].copy_from_slice(&self.number_of_fragments.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        require_len(buf, Self::ENCODE_LEN)?;
        let common = CommonHeader::decode(&buf[0..24])?;
        Ok(Self {
            common,
            send_method: SendMethod::decode(buf[24])?,
            delivery_guarantee: DeliveryGuarantee::decode(buf[25])?,
            ack_now: buf[26] != 0,
            sequence_number: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            total_content_size: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            fragment_offset: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            fragment_content_size: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
            fragment_number: u16::from_le_bytes(buf[48..50].try_into().unwrap()),
            number_of_fragments: u16::from_le_bytes(buf[50..52].try_into().unwrap()),
        })
    }

    #[must_use]
    pub fn is_last_fragment(&self) -> bool {
        self.fragment_number + 1 == self.number_of_fragments
    }
}

/// Default path-MTU-safe datagram size; `FragmentDataSize = FRAGMENT_SIZE -
/// MessageHeader::ENCODE_LEN`.
pub const FRAGMENT_SIZE: usize = 1500;

#[must_use]
pub const fn fragment_data_size(fragment_size: usize) -> usize {
    fragment_size - MessageHeader::ENCODE_LEN
}
