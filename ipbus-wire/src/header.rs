//! IPbus transaction headers.
//!
//! A transaction header is one 32-bit word, little-endian on the wire:
//! `[31:28]` protocol version, `[27:16]` transaction id, `[15:8]` word
//! count, `[7:4]` type code, `[3:0]` response code. The response code is
//! only meaningful in replies, where anything non-zero reports a
//! device-side error.

use crate::{
    PROTOCOL_VERSION,
    WORD,
};
use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use num_traits::FromPrimitive;

/// Transaction ids occupy an 11-bit counter space.
pub const TRANSACTION_ID_MASK: u16 = 0x7FF;

/// The word-count field is 8 bits, so no single transaction carries more
/// than this many payload words.
pub const MAX_WORD_COUNT: usize = 0xFF;

/// Errors produced while decoding wire words
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Header 0x{0:08x} carries protocol version {1}, expected {PROTOCOL_VERSION}")]
    BadVersion(u32, u32),
    #[error("Header 0x{0:08x} carries an unknown transaction type code")]
    BadType(u32),
}

/// The transaction kinds of the protocol, with their wire type codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TransactionType {
    /// Byte-order probe, the first transaction of every packet
    ByteOrder = 0,
    /// Block read from a single address (FIFO port)
    NonIncrementingRead = 2,
    /// Read from consecutive addresses
    Read = 3,
    /// Block write to a single address (FIFO port)
    NonIncrementingWrite = 4,
    /// Write to consecutive addresses
    Write = 5,
    /// Read-modify-write: `(old & and) | or`
    RmwBits = 6,
    /// Read-modify-write: `old + addend`
    RmwSum = 7,
    /// Reserved-address info query
    ReservedAddressInfo = 8,
}

impl TransactionType {
    /// How many scatter-gather reply slots a transaction of this type
    /// consumes: one for the reply header, plus one more when the reply
    /// carries payload words.
    #[must_use]
    pub fn reply_slots(self) -> usize {
        match self {
            TransactionType::ByteOrder
            | TransactionType::NonIncrementingWrite
            | TransactionType::Write => 1,
            TransactionType::ReservedAddressInfo
            | TransactionType::NonIncrementingRead
            | TransactionType::Read
            | TransactionType::RmwBits
            | TransactionType::RmwSum => 2,
        }
    }
}

/// A decoded (or to-be-encoded) transaction header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: TransactionType,
    pub word_count: u8,
    pub id: u16,
    pub response: u8,
}

impl Header {
    /// Build a request header. Requests always carry a zero response code.
    #[must_use]
    pub fn new(kind: TransactionType, word_count: u8, id: u16) -> Self {
        Self {
            kind,
            word_count,
            id: id & TRANSACTION_ID_MASK,
            response: 0,
        }
    }

    /// Encode into the 32-bit wire word
    #[must_use]
    pub fn pack(&self) -> u32 {
        (PROTOCOL_VERSION << 28)
            | (u32::from(self.id) << 16)
            | (u32::from(self.word_count) << 8)
            | ((self.kind as u32) << 4)
            | u32::from(self.response)
    }

    /// Decode a 32-bit wire word
    /// # Errors
    /// Returns an error if the version nibble or type code is not one we
    /// know about.
    pub fn unpack(raw: u32) -> Result<Self, Error> {
        let version = raw >> 28;
        if version != PROTOCOL_VERSION {
            return Err(Error::BadVersion(raw, version));
        }
        let kind = TransactionType::from_u32((raw >> 4) & 0xF).ok_or(Error::BadType(raw))?;
        Ok(Self {
            kind,
            word_count: ((raw >> 8) & 0xFF) as u8,
            id: ((raw >> 16) & 0xFFF) as u16,
            response: (raw & 0xF) as u8,
        })
    }

    /// Total send-side size of this transaction in words, header included
    #[must_use]
    pub fn send_words(&self) -> usize {
        match self.kind {
            TransactionType::ByteOrder | TransactionType::ReservedAddressInfo => 1,
            TransactionType::NonIncrementingRead | TransactionType::Read => 2,
            TransactionType::NonIncrementingWrite | TransactionType::Write => {
                2 + self.word_count as usize
            }
            TransactionType::RmwSum => 3,
            TransactionType::RmwBits => 4,
        }
    }

    /// Total reply-side size of this transaction in words, header included
    #[must_use]
    pub fn reply_words(&self) -> usize {
        match self.kind {
            TransactionType::ByteOrder
            | TransactionType::NonIncrementingWrite
            | TransactionType::Write => 1,
            TransactionType::NonIncrementingRead | TransactionType::Read => {
                1 + self.word_count as usize
            }
            TransactionType::ReservedAddressInfo => 3,
            TransactionType::RmwSum | TransactionType::RmwBits => 2,
        }
    }

    /// Send-side size in bytes
    #[must_use]
    pub fn send_bytes(&self) -> usize {
        self.send_words() * WORD
    }

    /// Reply-side size in bytes
    #[must_use]
    pub fn reply_bytes(&self) -> usize {
        self.reply_words() * WORD
    }
}

/// Per-client monotonic transaction id source, wrapping in the 11-bit id
/// space
#[derive(Debug, Default)]
pub struct TransactionId(u16);

impl TransactionId {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next id
    pub fn next_id(&mut self) -> u16 {
        let id = self.0;
        self.0 = (self.0 + 1) & TRANSACTION_ID_MASK;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_read() {
        let header = Header::new(TransactionType::Read, 1, 0x2A);
        assert_eq!(header.pack(), 0x202A_0130);
    }

    #[test]
    fn test_pack_write() {
        let header = Header::new(TransactionType::Write, 4, 1);
        assert_eq!(header.pack(), 0x2001_0450);
    }

    #[test]
    fn test_pack_byte_order() {
        let header = Header::new(TransactionType::ByteOrder, 0, 0);
        assert_eq!(header.pack(), 0x2000_0000);
    }

    #[test]
    fn test_unpack_rmw_bits() {
        let header = Header::unpack(0x2003_0160).unwrap();
        assert_eq!(header.kind, TransactionType::RmwBits);
        assert_eq!(header.word_count, 1);
        assert_eq!(header.id, 3);
        assert_eq!(header.response, 0);
    }

    #[test]
    fn test_unpack_response_code() {
        let header = Header::unpack(0x2000_0131).unwrap();
        assert_eq!(header.kind, TransactionType::Read);
        assert_eq!(header.response, 1);
    }

    #[test]
    fn test_unpack_bad_version() {
        assert_eq!(
            Header::unpack(0x1000_0130),
            Err(Error::BadVersion(0x1000_0130, 1))
        );
    }

    #[test]
    fn test_unpack_bad_type() {
        assert_eq!(Header::unpack(0x2000_0110), Err(Error::BadType(0x2000_0110)));
    }

    #[test]
    fn test_roundtrip() {
        for kind in [
            TransactionType::ByteOrder,
            TransactionType::NonIncrementingRead,
            TransactionType::Read,
            TransactionType::NonIncrementingWrite,
            TransactionType::Write,
            TransactionType::RmwBits,
            TransactionType::RmwSum,
            TransactionType::ReservedAddressInfo,
        ] {
            let header = Header::new(kind, 7, 0x123);
            assert_eq!(Header::unpack(header.pack()).unwrap(), header);
        }
    }

    #[test]
    fn test_send_reply_words() {
        // (type, payload words, send words, reply words)
        let table = [
            (TransactionType::ByteOrder, 0, 1, 1),
            (TransactionType::ReservedAddressInfo, 0, 1, 3),
            (TransactionType::Read, 5, 2, 6),
            (TransactionType::NonIncrementingRead, 5, 2, 6),
            (TransactionType::Write, 5, 7, 1),
            (TransactionType::NonIncrementingWrite, 5, 7, 1),
            (TransactionType::RmwSum, 1, 3, 2),
            (TransactionType::RmwBits, 1, 4, 2),
        ];
        for (kind, wc, send, reply) in table {
            let header = Header::new(kind, wc, 0);
            assert_eq!(header.send_words(), send, "{kind:?}");
            assert_eq!(header.reply_words(), reply, "{kind:?}");
        }
    }

    #[test]
    fn test_id_wraps() {
        let mut ids = TransactionId::new();
        for expected in 0..=TRANSACTION_ID_MASK {
            assert_eq!(ids.next_id(), expected);
        }
        assert_eq!(ids.next_id(), 0);
    }
}
