//! ControlHub preamble layout.
//!
//! A ControlHub gateway multiplexes many clients onto many devices over one
//! TCP stream. Each packet routed through it grows a routing preamble,
//! big-endian unlike the rest of the protocol:
//!
//! send: `[u32 byte count][u32 target IP][u16 target port][u16 word count]`
//! reply: `[u32 total bytes][u32 chunk bytes][u32 target IP][u16 target port][u16 error code]`
//!
//! The two count fields of the send preamble are zero when the preamble is
//! laid down and patched just before transmission, once the packet's final
//! size is known. The leading byte-count field doubles as the TCP frame
//! header: it holds the number of bytes that follow it.

use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use num_traits::FromPrimitive;
use std::net::Ipv4Addr;

/// Send-side preamble size in bytes
pub const SEND_PREAMBLE_BYTES: usize = 12;
/// Reply-side preamble size in bytes
pub const REPLY_PREAMBLE_BYTES: usize = 16;

/// Offset of the patched byte-count field within the send preamble
pub const BYTE_COUNT_OFFSET: usize = 0;
/// Offset of the patched word-count field within the send preamble
pub const WORD_COUNT_OFFSET: usize = 10;

/// Byte lengths of the five reply-preamble fields, in wire order
pub const REPLY_FIELD_BYTES: [usize; 5] = [4, 4, 4, 2, 2];

/// Error codes a gateway can report in its reply preamble
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ErrorCode {
    #[error("Target device did not respond")]
    TargetTimeout = 1,
    #[error("Gateway could not bind a socket for the target")]
    TargetUnreachable = 2,
    #[error("Malformed request")]
    BadRequest = 3,
    #[error("Gateway internal error")]
    Internal = 4,
}

impl ErrorCode {
    /// Interpret a raw wire code, keeping unknown codes as raw numbers
    #[must_use]
    pub fn interpret(raw: u16) -> Option<Result<Self, u16>> {
        match raw {
            0 => None,
            n => Some(Self::from_u16(n).ok_or(n)),
        }
    }
}

/// Encode the send preamble for a downstream target, count fields zeroed
#[must_use]
pub fn pack_send_preamble(ip: Ipv4Addr, port: u16) -> [u8; SEND_PREAMBLE_BYTES] {
    let mut bytes = [0u8; SEND_PREAMBLE_BYTES];
    bytes[4..8].copy_from_slice(&ip.octets());
    bytes[8..10].copy_from_slice(&port.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_send_preamble() {
        let packed = pack_send_preamble(Ipv4Addr::new(192, 168, 0, 7), 50001);
        assert_eq!(
            packed,
            [0, 0, 0, 0, 192, 168, 0, 7, 0xC3, 0x51, 0, 0]
        );
    }

    #[test]
    fn test_field_layout_totals() {
        assert_eq!(REPLY_FIELD_BYTES.iter().sum::<usize>(), REPLY_PREAMBLE_BYTES);
        assert_eq!(WORD_COUNT_OFFSET + 2, SEND_PREAMBLE_BYTES);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::interpret(0), None);
        assert_eq!(ErrorCode::interpret(1), Some(Ok(ErrorCode::TargetTimeout)));
        assert_eq!(ErrorCode::interpret(0xBEEF), Some(Err(0xBEEF)));
    }
}
