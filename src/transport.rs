use std::io;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::frame::RegisterCommand;

/// Retries after the first attempt before a register operation gives up.
pub const MAX_RETRIES: u32 = 10;

/// One raw request/response exchange with a board.
///
/// Byte 0 of the response is the IPMI completion code. Target addressing,
/// sessions and authentication belong to the implementor.
pub trait Exchange {
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>>;
}

impl<E: Exchange + ?Sized> Exchange for &mut E {
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        (**self).exchange(request)
    }
}

impl<E: Exchange + ?Sized> Exchange for Box<E> {
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        (**self).exchange(request)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("register 0x{address:02X}: no acknowledged response after {attempts} attempts")]
    Exhausted { address: u8, attempts: u32 },
}

/// Byte-wide register access to a single board.
///
/// The transport owns its exchange and every operation takes `&mut self`,
/// so one handle serializes all traffic to its board.
pub struct RegisterTransport<E> {
    exchange: E,
}

impl<E: Exchange> RegisterTransport<E> {
    pub fn new(exchange: E) -> Self {
        Self { exchange }
    }

    pub fn into_inner(self) -> E {
        self.exchange
    }

    pub fn read_register(&mut self, address: u8) -> Result<u8, TransportError> {
        let value = self.execute(RegisterCommand::Read { address })?;
        trace!(address, value, "register read");
        Ok(value)
    }

    pub fn write_register(&mut self, address: u8, value: u8) -> Result<(), TransportError> {
        self.execute(RegisterCommand::Write { address, value })?;
        trace!(address, value, "register write");
        Ok(())
    }

    /// Send the same frame until the board acknowledges it or the retry
    /// bound is reached.
    fn execute(&mut self, command: RegisterCommand) -> Result<u8, TransportError> {
        let frame = command.to_bytes();
        let address = command.address();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.exchange.exchange(&frame) {
                Ok(response) => match command.accepts(&response) {
                    Some(data) => return Ok(data),
                    None => debug!(
                        "Register 0x{address:02X}: unexpected response {response:02X?} (attempt {attempt})"
                    ),
                },
                Err(e) => {
                    debug!("Register 0x{address:02X}: exchange failed: {e} (attempt {attempt})")
                }
            }

            if attempt > MAX_RETRIES {
                warn!("Register 0x{address:02X}: giving up after {attempt} attempts");
                return Err(TransportError::Exhausted {
                    address,
                    attempts: attempt,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replies from a script; once the script runs out every reply is a NAK.
    struct Scripted {
        replies: VecDeque<io::Result<Vec<u8>>>,
        requests: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn new(replies: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                replies: replies.into(),
                requests: Vec::new(),
            }
        }
    }

    impl Exchange for Scripted {
        fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
            self.requests.push(request.to_vec());
            self.replies
                .pop_front()
                .unwrap_or_else(|| Ok(vec![0x00, 0xFF, 0xFF, 0x00]))
        }
    }

    #[test]
    fn read_returns_data_byte() {
        let reply = vec![0x00, 1, 1, 0xA5];
        let mut transport = RegisterTransport::new(Scripted::new(vec![Ok(reply)]));
        assert_eq!(transport.read_register(0x81), Ok(0xA5));
        let exchange = transport.into_inner();
        assert_eq!(
            exchange.requests,
            vec![vec![0x00, 0x02, 0x4B, 0x01, 0x01, 0x81]]
        );
    }

    #[test]
    fn read_gives_up_after_eleven_attempts() {
        let mut transport = RegisterTransport::new(Scripted::new(vec![]));
        assert_eq!(
            transport.read_register(0x90),
            Err(TransportError::Exhausted {
                address: 0x90,
                attempts: 11
            })
        );
        assert_eq!(transport.into_inner().requests.len(), 11);
    }

    #[test]
    fn write_gives_up_after_eleven_attempts() {
        let mut transport = RegisterTransport::new(Scripted::new(vec![]));
        assert_eq!(
            transport.write_register(0x80, 0x01),
            Err(TransportError::Exhausted {
                address: 0x80,
                attempts: 11
            })
        );
        let requests = transport.into_inner().requests;
        assert_eq!(requests.len(), 11);
        // Every retry resends the identical frame.
        assert!(requests.iter().all(|r| r == &requests[0]));
    }

    #[test]
    fn write_succeeds_on_last_allowed_attempt() {
        let mut replies: Vec<io::Result<Vec<u8>>> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "glitch"))
                } else {
                    Ok(vec![0x00, 1, 1, 0x00])
                }
            })
            .collect();
        replies.push(Ok(vec![0x00, 2, 1]));

        let mut transport = RegisterTransport::new(Scripted::new(replies));
        assert_eq!(transport.write_register(0x20, 0x30), Ok(()));
        assert_eq!(transport.into_inner().requests.len(), 11);
    }

    #[test]
    fn short_responses_count_as_failures() {
        let mut transport = RegisterTransport::new(Scripted::new(vec![
            Ok(vec![]),
            Ok(vec![0x00, 1, 1]),
            Ok(vec![0x00, 1, 1, 0x07]),
        ]));
        assert_eq!(transport.read_register(0x21), Ok(0x07));
        assert_eq!(transport.into_inner().requests.len(), 3);
    }
}
