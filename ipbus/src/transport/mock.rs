//! Mock transport used in testing the interface: an in-memory device
//! model that speaks the full wire protocol against a word-addressed
//! memory map, with knobs for injecting the failure modes a real device
//! or gateway can produce.

use super::Transport;
use crate::{
    buffer::Buffers,
    error::Error,
    pack::{
        HubTarget,
        Validator,
    },
};
use ipbus_wire::{
    header::{
        Header,
        TransactionType,
    },
    hub,
    WORD,
};
use std::{
    collections::HashMap,
    time::Duration,
};

/// A failure to inject into the emulator's next reply
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The first non-probe transaction reply carries this response code
    ResponseCode(u8),
    /// The device never replies
    DropReply,
    /// The gateway reply names a different downstream IP
    WrongHubTarget,
    /// The gateway reply carries this error code
    HubError(u16),
    /// The first non-probe transaction reply carries the wrong id
    CorruptId,
}

/// A register-level device model. Feed it a request packet's bytes and it
/// produces the reply packet a well-behaved device (or gateway plus
/// device) would send, executing transactions against a sparse
/// word-addressed memory.
#[derive(Debug)]
pub struct Emulator {
    memory: HashMap<u32, u32>,
    hub: Option<HubTarget>,
    fault: Option<Fault>,
}

impl Emulator {
    #[must_use]
    pub fn new(hub: Option<HubTarget>) -> Self {
        Self {
            memory: HashMap::new(),
            hub,
            fault: None,
        }
    }

    /// Arm a one-shot fault for the next reply
    pub fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Write a word directly into device memory
    pub fn poke(&mut self, addr: u32, value: u32) {
        self.memory.insert(addr, value);
    }

    /// Read a word directly out of device memory
    #[must_use]
    pub fn peek(&self, addr: u32) -> u32 {
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    fn take_word(cursor: &mut &[u8]) -> u32 {
        assert!(cursor.len() >= WORD, "mock received a truncated packet");
        let word = u32::from_le_bytes(cursor[..WORD].try_into().expect("4-byte slice"));
        *cursor = &cursor[WORD..];
        word
    }

    /// Produce the reply for one request packet, or `None` when a
    /// `DropReply` fault is armed
    pub fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if self.fault == Some(Fault::DropReply) {
            self.fault = None;
            return None;
        }
        let mut cursor = request;
        let mut out = Vec::new();
        let hub = self.hub;
        if let Some(target) = hub {
            // consume the routing preamble, lay down the reply preamble
            // with the counts patched in at the end
            assert!(
                cursor.len() >= hub::SEND_PREAMBLE_BYTES,
                "mock received a packet shorter than the hub preamble"
            );
            cursor = &cursor[hub::SEND_PREAMBLE_BYTES..];
            out.extend_from_slice(&[0; 8]);
            let mut ip = target.ip.octets();
            if self.fault == Some(Fault::WrongHubTarget) {
                self.fault = None;
                ip[3] = ip[3].wrapping_add(1);
            }
            out.extend_from_slice(&ip);
            out.extend_from_slice(&target.port.to_be_bytes());
            let error = match self.fault {
                Some(Fault::HubError(code)) => {
                    self.fault = None;
                    code
                }
                _ => 0,
            };
            out.extend_from_slice(&error.to_be_bytes());
        }

        while !cursor.is_empty() {
            let raw = Self::take_word(&mut cursor);
            let header = Header::unpack(raw).expect("mock received a malformed header");
            let mut reply = Header::new(header.kind, header.word_count, header.id);
            if header.kind != TransactionType::ByteOrder {
                match self.fault {
                    Some(Fault::ResponseCode(code)) => {
                        self.fault = None;
                        reply.response = code;
                    }
                    Some(Fault::CorruptId) => {
                        self.fault = None;
                        reply.id = (reply.id + 1) & ipbus_wire::header::TRANSACTION_ID_MASK;
                    }
                    _ => {}
                }
            }
            out.extend_from_slice(&reply.pack().to_le_bytes());
            let count = u32::from(header.word_count);
            match header.kind {
                TransactionType::ByteOrder => {}
                TransactionType::Read | TransactionType::NonIncrementingRead => {
                    let addr = Self::take_word(&mut cursor);
                    for i in 0..count {
                        let a = if header.kind == TransactionType::Read {
                            addr + i
                        } else {
                            addr
                        };
                        out.extend_from_slice(&self.peek(a).to_le_bytes());
                    }
                }
                TransactionType::Write | TransactionType::NonIncrementingWrite => {
                    let addr = Self::take_word(&mut cursor);
                    for i in 0..count {
                        let value = Self::take_word(&mut cursor);
                        let a = if header.kind == TransactionType::Write {
                            addr + i
                        } else {
                            addr
                        };
                        self.memory.insert(a, value);
                    }
                }
                TransactionType::RmwBits => {
                    let addr = Self::take_word(&mut cursor);
                    let and_term = Self::take_word(&mut cursor);
                    let or_term = Self::take_word(&mut cursor);
                    let value = (self.peek(addr) & and_term) | or_term;
                    self.memory.insert(addr, value);
                    out.extend_from_slice(&value.to_le_bytes());
                }
                TransactionType::RmwSum => {
                    let addr = Self::take_word(&mut cursor);
                    let addend = Self::take_word(&mut cursor);
                    let value = self.peek(addr).wrapping_add(addend);
                    self.memory.insert(addr, value);
                    out.extend_from_slice(&value.to_le_bytes());
                }
                TransactionType::ReservedAddressInfo => {
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }

        if hub.is_some() {
            let total = u32::try_from(out.len() - 4).expect("reply fits in u32");
            let chunk = u32::try_from(out.len() - 8).expect("reply fits in u32");
            out[0..4].copy_from_slice(&total.to_be_bytes());
            out[4..8].copy_from_slice(&chunk.to_be_bytes());
        }
        Some(out)
    }
}

/// A transport backed by an [`Emulator`] instead of a socket
#[derive(Debug)]
pub struct Mock {
    emulator: Emulator,
    validator: Validator,
    timeout: Duration,
    dead: bool,
}

impl Mock {
    #[must_use]
    pub fn new(hub: Option<HubTarget>) -> Self {
        Self {
            emulator: Emulator::new(hub),
            validator: Validator::new(hub),
            timeout: Duration::from_secs(1),
            dead: false,
        }
    }

    /// Access the device model, to seed memory or inject faults
    pub fn emulator_mut(&mut self) -> &mut Emulator {
        &mut self.emulator
    }
}

impl Transport for Mock {
    fn dispatch(&mut self, buffers: Buffers) -> Result<(), Error> {
        if self.dead {
            return Err(Error::unusable());
        }
        let result = match self.emulator.respond(buffers.send_bytes()) {
            None => Err(Error::Timeout),
            Some(reply) => buffers
                .scatter(&reply)
                .map_err(Error::from)
                .and_then(|()| self.validator.validate(&buffers)),
        };
        if result.is_err() {
            self.dead = true;
        }
        result
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{
            HubError,
            ValidationError,
        },
        pack::{
            BlockMode,
            Packer,
        },
    };
    use std::net::Ipv4Addr;

    #[test]
    fn test_rmw_semantics() {
        let mut emulator = Emulator::new(None);
        emulator.poke(0x10, 0xFF00);
        // rmw-bits returns and stores the post-modify value
        let header = Header::new(TransactionType::RmwBits, 1, 0).pack();
        let mut request = header.to_le_bytes().to_vec();
        request.extend_from_slice(&0x10u32.to_le_bytes());
        request.extend_from_slice(&0x0FF0u32.to_le_bytes());
        request.extend_from_slice(&0x00AAu32.to_le_bytes());
        let reply = emulator.respond(&request).unwrap();
        let value = u32::from_le_bytes(reply[4..8].try_into().unwrap());
        assert_eq!(value, (0xFF00 & 0x0FF0) | 0x00AA);
        assert_eq!(emulator.peek(0x10), value);
    }

    #[test]
    fn test_fifo_write_hits_one_address() {
        let mut packer = Packer::new(1400, 1400, None);
        let mut mock = Mock::new(None);
        packer
            .write_block(&mut mock, 0x30, &[1, 2, 3], BlockMode::NonIncrementing)
            .unwrap();
        packer.dispatch(&mut mock).unwrap();
        assert_eq!(mock.emulator_mut().peek(0x30), 3);
        assert_eq!(mock.emulator_mut().peek(0x31), 0);
    }

    #[test]
    fn test_response_code_fails_validation() {
        let mut packer = Packer::new(1400, 1400, None);
        let mut mock = Mock::new(None);
        let write = packer.write(&mut mock, 0x100, 0xCAFE).unwrap();
        mock.emulator_mut().inject(Fault::ResponseCode(1));
        let result = packer.dispatch(&mut mock);
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::ResponseCode(1)))
        ));
        // handles in the failed buffer stay invalid
        assert!(!write.valid());
    }

    #[test]
    fn test_corrupt_id_fails_validation() {
        let mut packer = Packer::new(1400, 1400, None);
        let mut mock = Mock::new(None);
        packer.write(&mut mock, 0x100, 0xCAFE).unwrap();
        mock.emulator_mut().inject(Fault::CorruptId);
        assert!(matches!(
            packer.dispatch(&mut mock),
            Err(Error::Validation(ValidationError::IdMismatch { .. }))
        ));
    }

    #[test]
    fn test_hub_target_mismatch() {
        let target = HubTarget {
            ip: Ipv4Addr::new(10, 1, 2, 3),
            port: 50001,
        };
        let mut packer = Packer::new(1400, 1400, Some(target));
        let mut mock = Mock::new(Some(target));
        packer.write(&mut mock, 0x0, 1).unwrap();
        mock.emulator_mut().inject(Fault::WrongHubTarget);
        assert!(matches!(
            packer.dispatch(&mut mock),
            Err(Error::ControlHub(HubError::IpMismatch { .. }))
        ));
    }

    #[test]
    fn test_hub_error_code() {
        let target = HubTarget {
            ip: Ipv4Addr::new(10, 1, 2, 3),
            port: 50001,
        };
        let mut packer = Packer::new(1400, 1400, Some(target));
        let mut mock = Mock::new(Some(target));
        packer.read_word::<u32>(&mut mock, 0x0, None).unwrap();
        mock.emulator_mut().inject(Fault::HubError(1));
        assert!(matches!(
            packer.dispatch(&mut mock),
            Err(Error::ControlHub(HubError::Code(_)))
        ));
    }

    #[test]
    fn test_dropped_reply_then_unusable() {
        let mut packer = Packer::new(1400, 1400, None);
        let mut mock = Mock::new(None);
        packer.write(&mut mock, 0x0, 1).unwrap();
        mock.emulator_mut().inject(Fault::DropReply);
        assert!(matches!(packer.dispatch(&mut mock), Err(Error::Timeout)));
        packer.write(&mut mock, 0x0, 2).unwrap();
        assert!(matches!(
            packer.dispatch(&mut mock),
            Err(Error::SocketIo(_))
        ));
    }
}
