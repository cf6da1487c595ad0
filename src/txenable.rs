//! Per-output transmitter control.
//!
//! Each output port `i` has a control register at `0x20 + i`. Bits [5:4]
//! select the transmitter state; this tool leaves every other bit clear.

use std::fmt;
use std::num::ParseIntError;

use thiserror::Error;

pub const TX_PORTS: usize = 16;

const TX_STATE_MASK: u8 = 0b0011_0000;
const TX_STATE_SHIFT: u32 = 4;

/// Control byte for an enabled transmitter.
pub const TX_ENABLED: u8 = 0b0011_0000;
/// Control byte for a disabled transmitter (lowest power).
pub const TX_DISABLED: u8 = 0b0000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Disabled,
    Standby,
    Squelched,
    Enabled,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Disabled => "disabled",
            TxState::Standby => "standby",
            TxState::Squelched => "squelched",
            TxState::Enabled => "enabled",
        };
        f.pad(name)
    }
}

/// Control bytes for ports 0..16, bit `i` of `flags` enabling port `i`.
pub fn encode_tx_flags(flags: u16) -> [u8; TX_PORTS] {
    std::array::from_fn(|port| {
        if flags & (1 << port) != 0 {
            TX_ENABLED
        } else {
            TX_DISABLED
        }
    })
}

pub fn decode_tx_state(control: u8) -> TxState {
    match (control & TX_STATE_MASK) >> TX_STATE_SHIFT {
        0 => TxState::Disabled,
        1 => TxState::Standby,
        2 => TxState::Squelched,
        _ => TxState::Enabled,
    }
}

#[derive(Debug, Error)]
#[error("invalid TX enable mask {text:?}: {source}")]
pub struct TxFlagsError {
    text: String,
    source: ParseIntError,
}

/// Parse a 16-bit enable mask written as `0x..` hex, `0b..` binary or decimal.
pub fn parse_tx_flags(text: &str) -> Result<u16, TxFlagsError> {
    let trimmed = text.trim().replace('_', "");
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or(trimmed.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else if let Some(bin) = trimmed.strip_prefix("0b").or(trimmed.strip_prefix("0B")) {
        u16::from_str_radix(bin, 2)
    } else {
        trimmed.parse::<u16>()
    };

    parsed.map_err(|source| TxFlagsError {
        text: text.to_owned(),
        source,
    })
}
