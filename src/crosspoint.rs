//! Crosspoint map codec.
//!
//! A map routes one of 16 inputs to each of the 16 crossbar outputs and is
//! written by hand as 16 hex digits, digit `i` naming the input for output
//! `i`. The board stores a map in 8 registers, two outputs per register,
//! with the even output in the low nibble. Reading the hex text two digits
//! at a time therefore gives bytes whose nibbles are swapped relative to the
//! register contents.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Outputs (and hex digits) in one map.
pub const MAP_OUTPUTS: usize = 16;
/// Registers holding one packed map.
pub const MAP_REGISTERS: usize = MAP_OUTPUTS / 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("crosspoint map must be {MAP_OUTPUTS} hex digits, got {got}")]
    InvalidLength { got: usize },
    #[error("crosspoint map has non-hex character {found:?} at position {position}")]
    InvalidDigit { position: usize, found: char },
}

/// Input selection for each of the 16 outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CrosspointMap([u8; MAP_OUTPUTS]);

impl CrosspointMap {
    /// Build a map from per-output input numbers. Only the low nibble of
    /// each entry is kept.
    pub fn new(inputs: [u8; MAP_OUTPUTS]) -> Self {
        Self(inputs.map(|input| input & 0x0F))
    }

    /// The input routed to `output`.
    pub fn input_for(&self, output: usize) -> Option<u8> {
        self.0.get(output).copied()
    }

    pub fn to_registers(&self) -> [u8; MAP_REGISTERS] {
        let mut regs = [0u8; MAP_REGISTERS];
        for (reg, pair) in regs.iter_mut().zip(self.0.chunks_exact(2)) {
            // Even output in the low nibble.
            *reg = (pair[1] << 4) | pair[0];
        }
        regs
    }

    pub fn from_registers(regs: &[u8; MAP_REGISTERS]) -> Self {
        let mut inputs = [0u8; MAP_OUTPUTS];
        for (pair, reg) in inputs.chunks_exact_mut(2).zip(regs) {
            pair[0] = reg & 0x0F;
            pair[1] = (reg >> 4) & 0x0F;
        }
        Self(inputs)
    }
}

impl FromStr for CrosspointMap {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let got = s.chars().count();
        if got != MAP_OUTPUTS {
            return Err(CodecError::InvalidLength { got });
        }

        let mut inputs = [0u8; MAP_OUTPUTS];
        for (position, (slot, c)) in inputs.iter_mut().zip(s.chars()).enumerate() {
            *slot = c
                .to_digit(16)
                .ok_or(CodecError::InvalidDigit { position, found: c })? as u8;
        }
        Ok(Self(inputs))
    }
}

impl fmt::Display for CrosspointMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in self.0 {
            write!(f, "{input:x}")?;
        }
        Ok(())
    }
}

/// Pack a 16-digit hex map into register bytes.
pub fn encode_map(hex: &str) -> Result<[u8; MAP_REGISTERS], CodecError> {
    Ok(hex.parse::<CrosspointMap>()?.to_registers())
}

/// Unpack register bytes into the 16-digit (lowercase) hex map.
pub fn decode_map(regs: &[u8; MAP_REGISTERS]) -> String {
    CrosspointMap::from_registers(regs).to_string()
}
