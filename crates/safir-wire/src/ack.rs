use crate::{common::CommonHeader, message::SendMethod, require_len, DecodeError};

/// Selective-repeat acknowledgement: `missing[i] == true` iff the slot for
/// `sequence_number - i` has not yet been received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub common: CommonHeader,
    pub send_method: SendMethod,
    /// Equal to the acker's `biggestSequence` for the acknowledged channel.
    pub sequence_number: u64,
    pub missing: Vec<bool>,
}

impl Ack {
    /// Byte length of an encoded ack for a given sliding-window size `w`.
    #[must_use]
    pub fn encode_len(window_size: usize) -> usize {
        CommonHeader::ENCODE_LEN + 1 + 8 + window_size.div_ceil(8)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let bitmap_len = self.missing.len().div_ceil(8);
        let mut buf = vec![0u8; Self::encode_len(self.missing.len())];
        buf[0..CommonHeader::ENCODE_LEN].copy_from_slice(&self.common.encode());
        let mut offset = CommonHeader::ENCODE_LEN;
        buf[offset] = self.send_method as u8;
        offset += 1;
        buf[offset..offset + 8].copy_from_slice(&self.sequence_number.to_le_bytes());
        offset += 8;
        for (i, &bit) in self.missing.iter().enumerate() {
            if bit {
                buf[offset + i / 8] |= 1 << (i % 8);
            }
        }
        debug_assert_eq!(offset + bitmap_len, buf.len());
        buf
    }

    pub fn decode(buf: &[u8], window_size: usize) -> Result<Self, DecodeError> {
        require_len(buf, Self::encode_len(window_size))?;
        let common = CommonHeader::decode(&buf[0..CommonHeader::ENCODE_LEN])?;
        let mut offset = CommonHeader::ENCODE_LEN;
        let send_method = match buf[offset] {
            0 => SendMethod::SingleReceiver,
            1 => SendMethod::MultiReceiver,
            value => {
                return Err(DecodeError::InvalidDiscriminant {
                    name: "SendMethod",
                    value,
                })
            }
        };
        offset += 1;
        let sequence_number = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let missing = (0..window_size)
            .map(|i| buf[offset + i / 8] & (1 << (i % 8)) != 0)
            .collect();
        Ok(Self {
            common,
            send_method,
            sequence_number,
            missing,
        })
    }
}
