//! Crossbar configuration sequence and read-back.
//!
//! The board only reaches a consistent configuration when the registers are
//! written in this order: reset, both packed maps, active-map select,
//! commit, per-port TX control. The sequence is not transactional; a failure
//! part way leaves the board partially reconfigured.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::crosspoint::{CodecError, CrosspointMap, MAP_OUTPUTS, MAP_REGISTERS};
use crate::transport::{Exchange, RegisterTransport, TransportError};
use crate::txenable::{TX_PORTS, TxState, decode_tx_state, encode_tx_flags};

pub mod regs {
    pub const RESET: u8 = 0x00;
    pub const TX_CONTROL_BASE: u8 = 0x20;
    pub const COMMIT: u8 = 0x80;
    pub const ACTIVE_MAP: u8 = 0x81;
    pub const MAP0_BASE: u8 = 0x90;
    pub const MAP1_BASE: u8 = 0x98;
}

const RESET_VALUE: u8 = 0x01;
const COMMIT_VALUE: u8 = 0x01;

/// Which of the two stored maps drives the outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ActiveMap {
    #[default]
    Map0,
    Map1,
}

impl ActiveMap {
    pub fn register_value(self) -> u8 {
        match self {
            ActiveMap::Map0 => 0,
            ActiveMap::Map1 => 1,
        }
    }
}

impl TryFrom<u8> for ActiveMap {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ActiveMap::Map0),
            1 => Ok(ActiveMap::Map1),
            other => Err(ConfigError::BadActiveMap(other)),
        }
    }
}

impl fmt::Display for ActiveMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.register_value())
    }
}

/// Steps of the configuration sequence, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigStep {
    Reset,
    LoadMap0,
    LoadMap1,
    SelectActiveMap,
    Commit,
    EnableOutputs,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigStep::Reset => "reset",
            ConfigStep::LoadMap0 => "load-map-0",
            ConfigStep::LoadMap1 => "load-map-1",
            ConfigStep::SelectActiveMap => "select-active-map",
            ConfigStep::Commit => "commit",
            ConfigStep::EnableOutputs => "enable-outputs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("crosspoint map must be {expected} hex digits, got {got}")]
    BadMapLength { got: usize, expected: usize },
    #[error(transparent)]
    BadMap(CodecError),
    #[error("active map must be 0 or 1, got {0}")]
    BadActiveMap(u8),
    #[error("configuration failed at step {failed_step}; board is partially configured and must be reconfigured")]
    PartialConfiguration {
        failed_step: ConfigStep,
        #[source]
        source: TransportError,
    },
}

impl From<CodecError> for ConfigError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::InvalidLength { got } => ConfigError::BadMapLength {
                got,
                expected: MAP_OUTPUTS,
            },
            other => ConfigError::BadMap(other),
        }
    }
}

/// A complete crossbar configuration, validated before any hardware access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrossbarConfig {
    pub tx_enable: u16,
    pub map0: CrosspointMap,
    pub map1: CrosspointMap,
    pub active_map: ActiveMap,
}

impl CrossbarConfig {
    pub fn from_hex(
        tx_enable: u16,
        map0: &str,
        map1: &str,
        active_map: u8,
    ) -> Result<Self, ConfigError> {
        // Both lengths are checked before either map is parsed.
        for map in [map0, map1] {
            let got = map.chars().count();
            if got != MAP_OUTPUTS {
                return Err(ConfigError::BadMapLength {
                    got,
                    expected: MAP_OUTPUTS,
                });
            }
        }

        Ok(Self {
            tx_enable,
            map0: map0.parse()?,
            map1: map1.parse()?,
            active_map: ActiveMap::try_from(active_map)?,
        })
    }
}

/// Configuration as read back from the board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossbarStatus {
    pub map0: CrosspointMap,
    pub map1: CrosspointMap,
    pub active_map: ActiveMap,
    /// Raw contents of the active-map register; only bit 0 selects the map.
    pub active_select: u8,
    pub tx_states: [TxState; TX_PORTS],
}

pub struct Crossbar<E> {
    transport: RegisterTransport<E>,
}

impl<E: Exchange> Crossbar<E> {
    pub fn new(transport: RegisterTransport<E>) -> Self {
        Self { transport }
    }

    /// Raw register access to the same board.
    pub fn transport_mut(&mut self) -> &mut RegisterTransport<E> {
        &mut self.transport
    }

    pub fn into_transport(self) -> RegisterTransport<E> {
        self.transport
    }

    /// Parse and apply a configuration given as hex map strings.
    pub fn configure_from_hex(
        &mut self,
        tx_enable: u16,
        map0: &str,
        map1: &str,
        active_map: u8,
    ) -> Result<(), ConfigError> {
        let config = CrossbarConfig::from_hex(tx_enable, map0, map1, active_map)?;
        self.configure(&config)
    }

    /// Run the full configuration sequence, stopping at the first failure.
    pub fn configure(&mut self, config: &CrossbarConfig) -> Result<(), ConfigError> {
        let _span = info_span!("configure", active_map = %config.active_map).entered();

        self.step(ConfigStep::Reset, |t| t.write_register(regs::RESET, RESET_VALUE))?;
        self.step(ConfigStep::LoadMap0, |t| {
            write_block(t, regs::MAP0_BASE, &config.map0.to_registers())
        })?;
        self.step(ConfigStep::LoadMap1, |t| {
            write_block(t, regs::MAP1_BASE, &config.map1.to_registers())
        })?;
        self.step(ConfigStep::SelectActiveMap, |t| {
            t.write_register(regs::ACTIVE_MAP, config.active_map.register_value())
        })?;
        self.step(ConfigStep::Commit, |t| t.write_register(regs::COMMIT, COMMIT_VALUE))?;
        // Ports ascend from 0; each port's register is addressed explicitly.
        self.step(ConfigStep::EnableOutputs, |t| {
            write_block(t, regs::TX_CONTROL_BASE, &encode_tx_flags(config.tx_enable))
        })?;

        info!(
            "Crossbar configured: map0={} map1={} active={} tx=0x{:04X}",
            config.map0, config.map1, config.active_map, config.tx_enable
        );
        Ok(())
    }

    fn step<F>(&mut self, step: ConfigStep, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut RegisterTransport<E>) -> Result<(), TransportError>,
    {
        debug!("Step {step}");
        f(&mut self.transport).map_err(|source| ConfigError::PartialConfiguration {
            failed_step: step,
            source,
        })
    }

    /// Read the stored maps, the active-map select and every port's TX state.
    pub fn read_config(&mut self) -> Result<CrossbarStatus, TransportError> {
        let map0: [u8; MAP_REGISTERS] = read_block(&mut self.transport, regs::MAP0_BASE)?;
        let map1: [u8; MAP_REGISTERS] = read_block(&mut self.transport, regs::MAP1_BASE)?;

        let tx_control: [u8; TX_PORTS] = read_block(&mut self.transport, regs::TX_CONTROL_BASE)?;

        let select = self.transport.read_register(regs::ACTIVE_MAP)?;
        if select & !0x01 != 0 {
            warn!("Active map register reads 0x{select:02X}; bit 0 selects the map");
        }
        let active_map = if select & 0x01 == 0 {
            ActiveMap::Map0
        } else {
            ActiveMap::Map1
        };

        Ok(CrossbarStatus {
            map0: CrosspointMap::from_registers(&map0),
            map1: CrosspointMap::from_registers(&map1),
            active_map,
            active_select: select,
            tx_states: tx_control.map(decode_tx_state),
        })
    }
}

fn write_block<E: Exchange>(
    transport: &mut RegisterTransport<E>,
    base: u8,
    values: &[u8],
) -> Result<(), TransportError> {
    for (offset, value) in values.iter().enumerate() {
        transport.write_register(base + offset as u8, *value)?;
    }
    Ok(())
}

fn read_block<E: Exchange, const N: usize>(
    transport: &mut RegisterTransport<E>,
    base: u8,
) -> Result<[u8; N], TransportError> {
    let mut values = [0u8; N];
    for (offset, value) in values.iter_mut().enumerate() {
        *value = transport.read_register(base + offset as u8)?;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    /// Register file behind the frame protocol. Writes to `fail_on` are
    /// never acknowledged.
    #[derive(Default)]
    struct FakeBoard {
        registers: HashMap<u8, u8>,
        writes: Vec<(u8, u8)>,
        reads: Vec<u8>,
        fail_on: Option<u8>,
    }

    impl Exchange for FakeBoard {
        fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
            match request {
                [0x00, 0x02, 0x4B, 0x01, 0x01, address] => {
                    self.reads.push(*address);
                    let value = self.registers.get(address).copied().unwrap_or(0);
                    Ok(vec![0x00, 1, 1, value])
                }
                [0x00, 0x02, 0x4B, 0x02, 0x01, address, value] => {
                    if self.fail_on == Some(*address) {
                        return Ok(vec![0x00, 0xFF, 0x00]);
                    }
                    self.writes.push((*address, *value));
                    self.registers.insert(*address, *value);
                    Ok(vec![0x00, 2, 1])
                }
                other => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unexpected frame {other:02X?}"),
                )),
            }
        }
    }

    fn crossbar(board: FakeBoard) -> Crossbar<FakeBoard> {
        Crossbar::new(RegisterTransport::new(board))
    }

    fn board(crossbar: Crossbar<FakeBoard>) -> FakeBoard {
        crossbar.into_transport().into_inner()
    }

    #[test]
    fn configure_writes_in_sequence_order() {
        let mut xbar = crossbar(FakeBoard::default());
        xbar.configure_from_hex(0x0021, "0123456789abcdef", "fedcba9876543210", 1)
            .unwrap();

        let addresses: Vec<u8> = board(xbar).writes.iter().map(|(a, _)| *a).collect();
        let mut expected = vec![0x00];
        expected.extend(0x90..=0x97);
        expected.extend(0x98..=0x9F);
        expected.push(0x81);
        expected.push(0x80);
        expected.extend(0x20..=0x2F);
        assert_eq!(addresses, expected);
    }

    #[test]
    fn configure_writes_encoded_values() {
        let mut xbar = crossbar(FakeBoard::default());
        xbar.configure_from_hex(0x0021, "0123456789abcdef", "fedcba9876543210", 1)
            .unwrap();
        let writes = board(xbar).writes;

        assert_eq!(writes[0], (0x00, 0x01));
        assert_eq!(writes[1], (0x90, 0x10));
        assert_eq!(writes[8], (0x97, 0xFE));
        assert_eq!(writes[9], (0x98, 0xEF));
        assert_eq!(writes[17], (0x81, 0x01));
        assert_eq!(writes[18], (0x80, 0x01));
        assert_eq!(writes[19], (0x20, 0x30));
        assert_eq!(writes[20], (0x21, 0x00));
        assert_eq!(writes[24], (0x25, 0x30));
        assert_eq!(writes.len(), 35);
    }

    #[test]
    fn failed_select_stops_before_outputs() {
        let mut xbar = crossbar(FakeBoard {
            fail_on: Some(0x81),
            ..Default::default()
        });
        let err = xbar
            .configure_from_hex(0xFFFF, "0000000000000000", "1111111111111111", 0)
            .unwrap_err();

        assert_eq!(
            err,
            ConfigError::PartialConfiguration {
                failed_step: ConfigStep::SelectActiveMap,
                source: TransportError::Exhausted {
                    address: 0x81,
                    attempts: 11
                },
            }
        );
        assert!(err.to_string().contains("select-active-map"));

        let writes = board(xbar).writes;
        assert_eq!(writes.len(), 17);
        assert!(writes.iter().all(|(a, _)| !(0x20..=0x2F).contains(a)));
        assert!(writes.iter().all(|(a, _)| *a != 0x80));
    }

    #[test]
    fn every_step_is_named_on_failure() {
        // (unacknowledged register, failing step, writes completed before it)
        let cases = [
            (0x00, ConfigStep::Reset, 0),
            (0x93, ConfigStep::LoadMap0, 4),
            (0x9A, ConfigStep::LoadMap1, 11),
            (0x81, ConfigStep::SelectActiveMap, 17),
            (0x80, ConfigStep::Commit, 18),
            (0x2F, ConfigStep::EnableOutputs, 34),
        ];

        for (register, step, completed) in cases {
            let mut xbar = crossbar(FakeBoard {
                fail_on: Some(register),
                ..Default::default()
            });
            let err = xbar
                .configure_from_hex(0xFFFF, "0123456789abcdef", "fedcba9876543210", 1)
                .unwrap_err();

            assert_eq!(
                err,
                ConfigError::PartialConfiguration {
                    failed_step: step,
                    source: TransportError::Exhausted {
                        address: register,
                        attempts: 11
                    },
                },
                "register 0x{register:02X}"
            );
            assert!(err.to_string().contains(&step.to_string()));

            let writes = board(xbar).writes;
            assert_eq!(writes.len(), completed, "step {step}");
            if step != ConfigStep::EnableOutputs {
                assert!(writes.iter().all(|(a, _)| !(0x20..=0x2F).contains(a)));
            }
        }
    }

    #[test]
    fn failed_reset_names_reset_step() {
        let mut xbar = crossbar(FakeBoard {
            fail_on: Some(0x00),
            ..Default::default()
        });
        let err = xbar
            .configure_from_hex(0, "0000000000000000", "0000000000000000", 0)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PartialConfiguration {
                failed_step: ConfigStep::Reset,
                ..
            }
        ));
        assert!(board(xbar).writes.is_empty());
    }

    #[test]
    fn bad_map_length_touches_nothing() {
        for len in [0usize, 15, 17, 32] {
            let bad = "a".repeat(len);
            let mut xbar = crossbar(FakeBoard::default());

            let err = xbar
                .configure_from_hex(0xFFFF, &bad, "0000000000000000", 0)
                .unwrap_err();
            assert_eq!(err, ConfigError::BadMapLength { got: len, expected: 16 });

            let err = xbar
                .configure_from_hex(0xFFFF, "0000000000000000", &bad, 0)
                .unwrap_err();
            assert_eq!(err, ConfigError::BadMapLength { got: len, expected: 16 });

            let board = board(xbar);
            assert!(board.writes.is_empty());
            assert!(board.reads.is_empty());
        }
    }

    #[test]
    fn bad_digit_and_selector_touch_nothing() {
        let mut xbar = crossbar(FakeBoard::default());
        assert!(matches!(
            xbar.configure_from_hex(0, "000000000000000z", "0000000000000000", 0),
            Err(ConfigError::BadMap(CodecError::InvalidDigit { position: 15, .. }))
        ));
        assert_eq!(
            xbar.configure_from_hex(0, "0000000000000000", "0000000000000000", 2),
            Err(ConfigError::BadActiveMap(2))
        );
        assert!(board(xbar).writes.is_empty());
    }

    #[test]
    fn read_config_recovers_configuration() {
        let mut xbar = crossbar(FakeBoard::default());
        xbar.configure_from_hex(0x8005, "0123456789abcdef", "00112233445566ff", 1)
            .unwrap();

        let status = xbar.read_config().unwrap();
        assert_eq!(status.map0.to_string(), "0123456789abcdef");
        assert_eq!(status.map1.to_string(), "00112233445566ff");
        assert_eq!(status.active_map, ActiveMap::Map1);
        assert_eq!(status.active_select, 0x01);
        assert_eq!(status.tx_states[0], TxState::Enabled);
        assert_eq!(status.tx_states[1], TxState::Disabled);
        assert_eq!(status.tx_states[2], TxState::Enabled);
        assert_eq!(status.tx_states[15], TxState::Enabled);
        assert_eq!(status.tx_states[14], TxState::Disabled);
    }

    #[test]
    fn read_config_decodes_other_tx_states() {
        let mut fake = FakeBoard::default();
        fake.registers.insert(0x23, 0b0001_0000);
        fake.registers.insert(0x24, 0b1010_0110);
        fake.registers.insert(0x81, 0x02);

        let mut xbar = crossbar(fake);
        let status = xbar.read_config().unwrap();
        assert_eq!(status.tx_states[3], TxState::Standby);
        assert_eq!(status.tx_states[4], TxState::Squelched);
        assert_eq!(status.active_map, ActiveMap::Map0);
        assert_eq!(status.active_select, 0x02);
        assert_eq!(status.map0.to_string(), "0000000000000000");

        let reads = board(xbar).reads;
        assert_eq!(reads.len(), 8 + 8 + 16 + 1);
        assert_eq!(reads.last(), Some(&0x81));
    }

    #[test]
    fn read_config_propagates_exhaustion() {
        struct Silent;
        impl Exchange for Silent {
            fn exchange(&mut self, _request: &[u8]) -> io::Result<Vec<u8>> {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"))
            }
        }

        let mut xbar = Crossbar::new(RegisterTransport::new(Silent));
        assert_eq!(
            xbar.read_config(),
            Err(TransportError::Exhausted {
                address: 0x90,
                attempts: 11
            })
        );
    }
}
