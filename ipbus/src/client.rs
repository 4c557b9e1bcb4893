//! The client facade: binds a packing engine to a transport and exposes
//! the public operation surface.

use crate::{
    error::Error,
    pack::{
        BlockMode,
        HubTarget,
        Packer,
        Validator,
    },
    transport::{
        tcp::{
            Framing,
            Tcp,
        },
        udp::Udp,
        Transport,
    },
    uri::{
        Scheme,
        Uri,
    },
    val::{
        ValHeader,
        ValVector,
        ValWord,
    },
};
use std::time::Duration;

/// Default packet budget in bytes, each way: 350 words, inside a common
/// 1500-byte MTU
pub const DEFAULT_MAX_PACKET_BYTES: usize = 1400;
/// Smallest accepted packet budget; a fresh buffer must always hold the
/// preamble plus one unsplittable transaction
pub const MIN_PACKET_BYTES: usize = 64;
/// Dispatch deadline applied until `set_timeout_period` says otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A connected IPbus client
pub struct Client {
    id: String,
    uri: String,
    packer: Packer,
    transport: Box<dyn Transport>,
}

fn check_budget(max_send: usize, max_reply: usize) -> Result<(), Error> {
    if max_send < MIN_PACKET_BYTES || max_reply < MIN_PACKET_BYTES {
        return Err(Error::BufferOverflow {
            requested_send: MIN_PACKET_BYTES,
            requested_reply: MIN_PACKET_BYTES,
        });
    }
    Ok(())
}

impl Client {
    /// Connect to the device named by `uri`. Query arguments
    /// `max_send_size`/`max_reply_size` override the packet budget and
    /// `pipeline=1` moves I/O onto a background worker; `chtcp-2.0` URIs
    /// additionally need `target=ip:port`.
    /// # Errors
    /// URI grammar failures and socket creation failures.
    pub fn new(id: impl Into<String>, uri: &str) -> Result<Self, Error> {
        let parsed = Uri::parse(uri)?;
        let max_send = parsed
            .size_arg("max_send_size")?
            .unwrap_or(DEFAULT_MAX_PACKET_BYTES);
        let max_reply = parsed
            .size_arg("max_reply_size")?
            .unwrap_or(DEFAULT_MAX_PACKET_BYTES);
        check_budget(max_send, max_reply)?;
        let pipelined = parsed.flag("pipeline");
        let hub = match parsed.scheme {
            Scheme::ChTcp => Some(parsed.target()?),
            _ => None,
        };
        let validator = Validator::new(hub);
        let addr = (parsed.host.as_str(), parsed.port);
        let transport: Box<dyn Transport> = match parsed.scheme {
            Scheme::IpbusUdp => Box::new(Udp::connect(
                addr,
                validator,
                max_reply,
                DEFAULT_TIMEOUT,
                pipelined,
            )?),
            Scheme::IpbusTcp => Box::new(Tcp::connect(
                addr,
                Framing::LengthPrefixed,
                validator,
                max_reply,
                DEFAULT_TIMEOUT,
                pipelined,
            )?),
            Scheme::ChTcp => Box::new(Tcp::connect(
                addr,
                Framing::Hub,
                validator,
                max_reply,
                DEFAULT_TIMEOUT,
                pipelined,
            )?),
        };
        Ok(Self {
            id: id.into(),
            uri: uri.to_string(),
            packer: Packer::new(max_send, max_reply, hub),
            transport,
        })
    }

    /// Bind the packing engine to a caller-supplied transport (the mock,
    /// in tests). `hub` must match the transport's own validation
    /// expectation.
    /// # Errors
    /// Fails when the packet budget is below [`MIN_PACKET_BYTES`].
    pub fn with_transport(
        id: impl Into<String>,
        uri: impl Into<String>,
        transport: impl Transport + 'static,
        hub: Option<HubTarget>,
        max_send: usize,
        max_reply: usize,
    ) -> Result<Self, Error> {
        check_budget(max_send, max_reply)?;
        Ok(Self {
            id: id.into(),
            uri: uri.into(),
            packer: Packer::new(max_send, max_reply, hub),
            transport: Box::new(transport),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_timeout_period(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    #[must_use]
    pub fn timeout_period(&self) -> Duration {
        self.transport.timeout()
    }

    /// Queue a single-word write
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn write(&mut self, addr: u32, value: u32) -> Result<ValHeader, Error> {
        self.packer.write(self.transport.as_mut(), addr, value)
    }

    /// Queue a block write
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn write_block(
        &mut self,
        addr: u32,
        source: &[u32],
        mode: BlockMode,
    ) -> Result<ValHeader, Error> {
        self.packer
            .write_block(self.transport.as_mut(), addr, source, mode)
    }

    /// Queue a single-word read
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn read(&mut self, addr: u32) -> Result<ValWord<u32>, Error> {
        self.packer.read_word(self.transport.as_mut(), addr, None)
    }

    /// Queue a masked read; the value comes back masked and shifted down
    /// to the mask's lowest set bit
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn read_masked(&mut self, addr: u32, mask: u32) -> Result<ValWord<u32>, Error> {
        self.packer
            .read_word(self.transport.as_mut(), addr, Some(mask))
    }

    /// Queue a single-word read interpreted as signed
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn read_signed(&mut self, addr: u32) -> Result<ValWord<i32>, Error> {
        self.packer.read_word(self.transport.as_mut(), addr, None)
    }

    /// Queue a block read
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn read_block(
        &mut self,
        addr: u32,
        size: usize,
        mode: BlockMode,
    ) -> Result<ValVector<u32>, Error> {
        self.packer
            .read_block(self.transport.as_mut(), addr, size, mode)
    }

    /// Queue a block read interpreted as signed
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn read_block_signed(
        &mut self,
        addr: u32,
        size: usize,
        mode: BlockMode,
    ) -> Result<ValVector<i32>, Error> {
        self.packer
            .read_block(self.transport.as_mut(), addr, size, mode)
    }

    /// Queue a read-modify-write: the device applies
    /// `(old & and_term) | or_term` and replies with the result
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn rmw_bits(
        &mut self,
        addr: u32,
        and_term: u32,
        or_term: u32,
    ) -> Result<ValWord<u32>, Error> {
        self.packer
            .rmw_bits(self.transport.as_mut(), addr, and_term, or_term)
    }

    /// Queue a read-modify-write: the device applies `old + addend` and
    /// replies with the result
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn rmw_sum(&mut self, addr: u32, addend: i32) -> Result<ValWord<i32>, Error> {
        self.packer.rmw_sum(self.transport.as_mut(), addr, addend)
    }

    /// Queue a reserved-address info query
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn read_reserved_address_info(&mut self) -> Result<ValVector<u32>, Error> {
        self.packer
            .read_reserved_address_info(self.transport.as_mut())
    }

    /// Queue an explicit byte-order probe
    /// # Errors
    /// Packet-budget overflow, or any failure flushing a full buffer.
    pub fn byte_order_transaction(&mut self) -> Result<ValHeader, Error> {
        self.packer.byte_order_transaction(self.transport.as_mut())
    }

    /// Push the filling buffer through the transport and block until
    /// every queued transaction has round-tripped and validated
    /// # Errors
    /// Transport failures, timeouts, validation mismatches, and any error
    /// stored by a pipelined worker.
    pub fn dispatch(&mut self) -> Result<(), Error> {
        self.packer.dispatch(self.transport.as_mut())
    }

    /// Block until work already handed to the transport completes,
    /// without dispatching the filling buffer
    /// # Errors
    /// Rethrows errors stored by a pipelined worker.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.transport.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        transport::mock::Mock,
        val::Word,
    };
    use paste::paste;

    fn mock_client(max_send: usize, max_reply: usize) -> Client {
        Client::with_transport(
            "board0",
            "mock://device",
            Mock::new(None),
            None,
            max_send,
            max_reply,
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let mut client = mock_client(1400, 1400);
        let wrote = client.write(0x100, 0xDEAD_BEEF).unwrap();
        let read = client.read(0x100).unwrap();
        assert!(!wrote.valid());
        assert!(matches!(read.value(), Err(Error::NonValidatedMemory)));
        client.dispatch().unwrap();
        assert!(wrote.valid());
        assert_eq!(read.value().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_masked_read() {
        let mut client = mock_client(1400, 1400);
        client.write(0x20, 0x0000_3A00).unwrap();
        let field = client.read_masked(0x20, 0x0000_FF00).unwrap();
        client.dispatch().unwrap();
        assert_eq!(field.value().unwrap(), 0x3A);
    }

    #[test]
    fn test_rmw() {
        let mut client = mock_client(1400, 1400);
        client.write(0x10, 0xFF00).unwrap();
        client.dispatch().unwrap();
        let modified = client.rmw_bits(0x10, 0x0FF0, 0x00AA).unwrap();
        let readback = client.read(0x10).unwrap();
        client.dispatch().unwrap();
        let expected = (0xFF00 & 0x0FF0) | 0x00AA;
        assert_eq!(modified.value().unwrap(), expected);
        assert_eq!(readback.value().unwrap(), expected);

        let summed = client.rmw_sum(0x10, -2).unwrap();
        client.dispatch().unwrap();
        assert_eq!(summed.value().unwrap(), i32::try_from(expected).unwrap() - 2);
    }

    macro_rules! test_block_rw {
        ($mode:ident, $max:literal) => {
            paste! {
                #[test]
                fn [<test_block_rw_ $mode:snake _ $max>]() {
                    let mut client = mock_client($max, $max);
                    let source: Vec<u32> = (0..32).map(|i| i * 3 + 7).collect();
                    client
                        .write_block(0x200, &source, BlockMode::$mode)
                        .unwrap();
                    let read = client
                        .read_block(0x200, 32, BlockMode::$mode)
                        .unwrap();
                    client.dispatch().unwrap();
                    let expected: Vec<u32> = match BlockMode::$mode {
                        // a FIFO port replays the last word written
                        BlockMode::NonIncrementing => vec![source[31]; 32],
                        BlockMode::Incremental => source.clone(),
                    };
                    assert_eq!(read.value().unwrap(), expected);
                }
            }
        };
    }

    // the 64-byte budget forces every block to split across packets
    test_block_rw!(Incremental, 1400);
    test_block_rw!(Incremental, 64);
    test_block_rw!(NonIncrementing, 1400);
    test_block_rw!(NonIncrementing, 64);

    #[test]
    fn test_signed_round_trip() {
        let mut client = mock_client(1400, 1400);
        client.write(0x40, (-123i32).to_raw()).unwrap();
        let word = client.read_signed(0x40).unwrap();
        client.dispatch().unwrap();
        assert_eq!(word.value().unwrap(), -123);

        client
            .write_block(0x50, &[(-1i32).to_raw(), 2, (-3i32).to_raw()], BlockMode::Incremental)
            .unwrap();
        let block = client.read_block_signed(0x50, 3, BlockMode::Incremental).unwrap();
        client.dispatch().unwrap();
        assert_eq!(block.value().unwrap(), vec![-1, 2, -3]);
    }

    #[test]
    fn test_reserved_address_info() {
        let mut client = mock_client(1400, 1400);
        let info = client.read_reserved_address_info().unwrap();
        client.dispatch().unwrap();
        assert_eq!(info.value().unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_explicit_probe() {
        let mut client = mock_client(1400, 1400);
        let probe = client.byte_order_transaction().unwrap();
        client.dispatch().unwrap();
        assert!(probe.valid());
    }

    #[test]
    fn test_empty_blocks() {
        let mut client = mock_client(1400, 1400);
        let wrote = client
            .write_block(0x0, &[], BlockMode::Incremental)
            .unwrap();
        let read = client.read_block(0x0, 0, BlockMode::Incremental).unwrap();
        client.dispatch().unwrap();
        assert!(wrote.valid());
        assert!(read.is_empty());
        assert_eq!(read.value().unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_dispatch_without_work() {
        let mut client = mock_client(1400, 1400);
        client.dispatch().unwrap();
    }

    #[test]
    fn test_budget_floor() {
        assert!(matches!(
            Client::with_transport("x", "mock://", Mock::new(None), None, 32, 1400),
            Err(Error::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_accessors() {
        let mut client = mock_client(1400, 1400);
        assert_eq!(client.id(), "board0");
        assert_eq!(client.uri(), "mock://device");
        client.set_timeout_period(Duration::from_millis(250));
        assert_eq!(client.timeout_period(), Duration::from_millis(250));
    }
}
