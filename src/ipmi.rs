//! Carriers for the raw register frames.
//!
//! Both hand a frame to an IPMI raw command under [`IPMI_NETFN`]: the first
//! frame byte is the command, the rest is request data. The response given
//! back to the transport is the completion code followed by response data.

use std::io;
use std::io::{Read, Write};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, trace};

use crate::frame::IPMI_NETFN;
use crate::transport::Exchange;

/// IPMB-L address of a MicroTCA AMC slot (1..=12).
pub fn amc_slot_address(slot: u8) -> Option<u8> {
    match slot {
        1..=12 => Some(0x70 + 2 * slot),
        _ => None,
    }
}

/// Runs `ipmitool raw` once per exchange. Session setup, bridging and
/// authentication are left to ipmitool.
#[derive(Clone, Debug, Default)]
pub struct Ipmitool {
    pub program: String,
    pub interface: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub channel: Option<u8>,
    pub target: Option<u8>,
}

impl Ipmitool {
    pub fn new() -> Self {
        Self {
            program: "ipmitool".to_owned(),
            ..Default::default()
        }
    }

    fn args(&self, request: &[u8]) -> io::Result<Vec<String>> {
        let (command, data) = request.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty request frame")
        })?;

        let mut args = Vec::new();
        if let Some(interface) = &self.interface {
            args.extend(["-I".to_owned(), interface.clone()]);
        }
        if let Some(host) = &self.host {
            args.extend(["-H".to_owned(), host.clone()]);
        }
        if let Some(user) = &self.user {
            args.extend(["-U".to_owned(), user.clone()]);
        }
        if self.password.is_some() {
            // Read from IPMI_PASSWORD rather than the command line.
            args.push("-E".to_owned());
        }
        if let Some(channel) = self.channel {
            args.extend(["-b".to_owned(), channel.to_string()]);
        }
        if let Some(target) = self.target {
            args.extend(["-t".to_owned(), format!("0x{target:02x}")]);
        }

        args.push("raw".to_owned());
        args.push(format!("0x{IPMI_NETFN:02x}"));
        args.push(format!("0x{command:02x}"));
        args.extend(data.iter().map(|b| format!("0x{b:02x}")));
        Ok(args)
    }
}

/// Parse `ipmitool raw` output (whitespace separated hex bytes).
fn parse_raw_output(text: &str) -> io::Result<Vec<u8>> {
    text.split_whitespace()
        .map(|word| {
            u8::from_str_radix(word, 16).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected ipmitool output {word:?}"),
                )
            })
        })
        .collect()
}

impl Exchange for Ipmitool {
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        let args = self.args(request)?;
        trace!("{} {}", self.program, args.join(" "));

        let mut command = Command::new(&self.program);
        command.args(&args);
        if let Some(password) = &self.password {
            command.env("IPMI_PASSWORD", password);
        }
        let output = command.output()?;

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "ipmitool failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // ipmitool only prints data for completion code 0.
        let mut response = vec![0x00];
        response.extend(parse_raw_output(&String::from_utf8_lossy(&output.stdout))?);
        Ok(response)
    }
}

const TERMINAL_LINE_MAX: usize = 256;
const TERMINAL_LUN: u8 = 0;

/// IPMI serial terminal mode: one `[NetFn/LUN Seq Cmd data..]` text line per
/// request, answered by `[NetFn/LUN Seq Cmd CC data..]`.
pub struct TerminalMode<P> {
    port: P,
    seq: u8,
}

impl TerminalMode<Box<dyn serialport::SerialPort>> {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> serialport::Result<Self> {
        let port = serialport::new(path, baud).timeout(timeout).open()?;
        Ok(Self::new(port))
    }
}

impl<P: Read + Write> TerminalMode<P> {
    pub fn new(port: P) -> Self {
        Self { port, seq: 0 }
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    fn encode(&self, request: &[u8]) -> io::Result<String> {
        let (command, data) = request.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty request frame")
        })?;

        let mut line = format!(
            "[{:02X} {:02X} {:02X}",
            (IPMI_NETFN << 2) | TERMINAL_LUN,
            self.seq << 2,
            command
        );
        for b in data {
            line.push_str(&format!(" {b:02X}"));
        }
        line.push_str("]\r");
        Ok(line)
    }

    /// Read up to and including the closing `]` of the next message.
    fn read_message(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let mut started = false;
        let mut buf = [0u8; 1];

        loop {
            let n = self.port.read(&mut buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "terminal mode port closed",
                ));
            }
            let c = buf[0] as char;
            match c {
                '[' => {
                    started = true;
                    line.clear();
                }
                ']' if started => return Ok(line),
                _ if started => line.push(c),
                _ => {}
            }
            if line.len() > TERMINAL_LINE_MAX {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "terminal mode response too long",
                ));
            }
        }
    }
}

/// A decoded terminal mode response message.
struct Reply {
    netfn_lun: u8,
    seq: u8,
    command: u8,
    /// Completion code followed by response data.
    payload: Vec<u8>,
}

fn parse_reply(body: &str) -> io::Result<Reply> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 || !compact.is_ascii() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed terminal mode response {body:?}"),
        ));
    }
    let bytes = (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&compact[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    match bytes.as_slice() {
        [netfn_lun, seq_bridge, command, payload @ ..] if !payload.is_empty() => Ok(Reply {
            netfn_lun: *netfn_lun,
            seq: *seq_bridge >> 2,
            command: *command,
            payload: payload.to_vec(),
        }),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("short terminal mode response {bytes:02X?}"),
        )),
    }
}

impl<P: Read + Write> Exchange for TerminalMode<P> {
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        let line = self.encode(request)?;
        let seq = self.seq;
        self.seq = (self.seq + 1) & 0x3F;
        trace!("terminal mode > {}", line.trim_end());

        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;

        // Replies to earlier timed-out requests may still be queued ahead of
        // ours; drop them until our sequence number shows up or the read
        // times out.
        loop {
            let body = self.read_message()?;
            trace!("terminal mode < [{body}]");
            let reply = parse_reply(&body)?;

            if reply.seq != seq {
                debug!(
                    "Terminal mode: dropping stale reply (seq {}, want {seq})",
                    reply.seq
                );
                continue;
            }
            let expected_netfn_lun = ((IPMI_NETFN | 1) << 2) | TERMINAL_LUN;
            if reply.netfn_lun != expected_netfn_lun || reply.command != request[0] {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "terminal mode response for NetFn/LUN 0x{:02X} cmd 0x{:02X}",
                        reply.netfn_lun, reply.command
                    ),
                ));
            }
            return Ok(reply.payload);
        }
    }
}
