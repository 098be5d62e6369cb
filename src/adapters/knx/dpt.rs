//! KNX data-point encodings.
//!
//! Only the encodings the control plane publishes or consumes: 1-bit
//! booleans (DPT 1.x), the unsigned byte (DPT 5.010) used for volumes and
//! track/playlist indices, and 2-byte unsigned (DPT 7.001) for latency.
//! Integer status values outside 0..=255 are sent as 0 with a warning, per
//! the building-automation convention that a wrapped value is worse than a
//! sentinel.

use tracing::warn;

/// A typed KNX group value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupValue {
    /// DPT 1.x - transported in the APCI low bits
    Bool(bool),
    /// DPT 5.010 - one data byte
    Byte(u8),
    /// DPT 7.001 - two data bytes, big endian
    Short(u16),
}

impl GroupValue {
    /// Clamp an arbitrary integer into DPT 5.010. Out-of-range values become
    /// 0 with a warning rather than wrapping.
    pub fn dpt5(value: i64) -> Self {
        if (0..=255).contains(&value) {
            Self::Byte(value as u8)
        } else {
            warn!(value, "value outside DPT 5.010 range, sending 0");
            Self::Byte(0)
        }
    }

    /// Playback state encoding: 0=Stopped, 1=Playing, 2=Paused.
    pub fn playback(state: crate::state::zone::PlaybackState) -> Self {
        use crate::state::zone::PlaybackState;
        Self::Byte(match state {
            PlaybackState::Stopped => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Paused => 2,
        })
    }

    /// APDU payload for a GroupValueWrite. Booleans ride in the APCI byte's
    /// low 6 bits (small APDU form); byte/short values follow as data octets.
    pub fn encode_apdu(&self) -> Vec<u8> {
        // First two octets: TPCI/APCI. 0x00 0x80 = GroupValueWrite.
        match self {
            Self::Bool(b) => vec![0x00, 0x80 | u8::from(*b)],
            Self::Byte(v) => vec![0x00, 0x80, *v],
            Self::Short(v) => {
                let be = v.to_be_bytes();
                vec![0x00, 0x80, be[0], be[1]]
            }
        }
    }

    /// Decode a GroupValueWrite/Response APDU into a typed value.
    /// Returns None for APDUs this control plane does not understand.
    pub fn decode_apdu(apdu: &[u8]) -> Option<Self> {
        if apdu.len() < 2 {
            return None;
        }
        let apci = apdu[1] & 0xc0;
        // 0x80 = GroupValueWrite, 0x40 = GroupValueResponse
        if apci != 0x80 && apci != 0x40 {
            return None;
        }
        match apdu.len() {
            2 => Some(Self::Bool(apdu[1] & 0x01 != 0)),
            3 => Some(Self::Byte(apdu[2])),
            4 => Some(Self::Short(u16::from_be_bytes([apdu[2], apdu[3]]))),
            _ => None,
        }
    }

    /// Interpret the value as a boolean command (0/1 semantics for byte
    /// encodings some actuators use).
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Byte(v) => *v != 0,
            Self::Short(v) => *v != 0,
        }
    }

    /// Interpret the value as an unsigned integer.
    pub fn as_int(&self) -> u16 {
        match self {
            Self::Bool(b) => u16::from(*b),
            Self::Byte(v) => *v as u16,
            Self::Short(v) => *v,
        }
    }
}
