/// Network function the register frames are carried under as IPMI raw commands.
pub const IPMI_NETFN: u8 = 0x30;

const READ_PREFIX: [u8; 5] = [0x00, 0x02, 0x4B, 0x01, 0x01];
const WRITE_PREFIX: [u8; 5] = [0x00, 0x02, 0x4B, 0x02, 0x01];

/// Status pair (offsets 1 and 2 of the response) acknowledging a read.
const READ_ACK: (u8, u8) = (1, 1);
/// Status pair acknowledging a write.
const WRITE_ACK: (u8, u8) = (2, 1);

/// One register operation, as sent to the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterCommand {
    Read { address: u8 },
    Write { address: u8, value: u8 },
}

impl RegisterCommand {
    pub fn address(&self) -> u8 {
        match *self {
            RegisterCommand::Read { address } => address,
            RegisterCommand::Write { address, .. } => address,
        }
    }

    /// Build the raw frame.
    /// Layout:
    /// [0..5) operation prefix (byte 0 is the IPMI command byte)
    /// [5]    register address
    /// [6]    data byte (writes only)
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            RegisterCommand::Read { address } => {
                let mut frame = Vec::with_capacity(6);
                frame.extend_from_slice(&READ_PREFIX);
                frame.push(address);
                frame
            }
            RegisterCommand::Write { address, value } => {
                let mut frame = Vec::with_capacity(7);
                frame.extend_from_slice(&WRITE_PREFIX);
                frame.push(address);
                frame.push(value);
                frame
            }
        }
    }

    /// Check a response against this operation's status pair.
    ///
    /// Returns the data byte (offset 3) for an accepted read and the
    /// second status byte for an accepted write. `None` means the
    /// attempt failed.
    pub fn accepts(&self, response: &[u8]) -> Option<u8> {
        match *self {
            RegisterCommand::Read { .. } => match response {
                [_, s1, s2, data, ..] if (*s1, *s2) == READ_ACK => Some(*data),
                _ => None,
            },
            RegisterCommand::Write { .. } => match response {
                [_, s1, s2, ..] if (*s1, *s2) == WRITE_ACK => Some(*s2),
                _ => None,
            },
        }
    }
}
