//! The packing engine: accumulates logical register operations into
//! buffer pairs, segments oversize block operations across packets, and
//! validates replies transaction-by-transaction.
//!
//! Every operation is non-blocking: it lays its transaction down in the
//! currently-filling buffer (dispatching a full one to the transport along
//! the way) and hands back a deferred handle. Values appear in the handles
//! only after `dispatch` has pushed the buffer through the transport and
//! validation has walked the reply.

use crate::{
    buffer::{
        Buffers,
        HubField,
        HubRecord,
        HubReply,
        ReplySlot,
    },
    error::{
        Error,
        HubError,
        ValidationError,
    },
    transport::Transport,
    val::{
        ValHeader,
        ValVector,
        ValWord,
        Word,
    },
};
use ipbus_wire::{
    header::{
        Header,
        TransactionId,
        TransactionType,
        MAX_WORD_COUNT,
    },
    hub,
    WORD,
};
use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        Mutex,
    },
};
use tracing::error;

/// Whether a block operation walks consecutive addresses or hammers a
/// single FIFO port
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockMode {
    Incremental,
    NonIncrementing,
}

/// The downstream device a ControlHub gateway should route packets to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HubTarget {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Everything reply validation needs to know, cheap to clone into a
/// transport worker
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    hub: Option<HubTarget>,
}

impl Validator {
    #[must_use]
    pub fn new(hub: Option<HubTarget>) -> Self {
        Self { hub }
    }

    /// Walk send and reply in lockstep and, on success, flip every handle
    /// attached to the buffer to valid. Pure over the buffer contents, so
    /// it may run on a transport worker thread.
    /// # Errors
    /// Any mismatch between the streams is fatal for the packet; nothing
    /// is retried.
    pub fn validate(&self, buffers: &Buffers) -> Result<(), Error> {
        validate_streams(buffers, self.hub)?;
        buffers.mark_valid();
        Ok(())
    }
}

fn validate_streams(buffers: &Buffers, hub: Option<HubTarget>) -> Result<(), Error> {
    let mut send = buffers.send_bytes();
    let slots = buffers.slots();
    let mut slot_index = 0;

    if let Some(target) = hub {
        if send.len() < hub::SEND_PREAMBLE_BYTES || slots.len() < hub::REPLY_FIELD_BYTES.len() {
            return Err(ValidationError::Truncated.into());
        }
        send = &send[hub::SEND_PREAMBLE_BYTES..];
        slot_index = hub::REPLY_FIELD_BYTES.len();
        let reply = buffers.hub_reply().ok_or(ValidationError::Truncated)?;
        let got_ip = Ipv4Addr::from(reply.ip);
        if got_ip != target.ip {
            error!(%got_ip, expected = %target.ip, "Gateway reply targets the wrong device IP");
            return Err(HubError::IpMismatch {
                expected: target.ip,
                got: got_ip,
            }
            .into());
        }
        if reply.port != target.port {
            error!(
                got = reply.port,
                expected = target.port,
                "Gateway reply targets the wrong device port"
            );
            return Err(HubError::PortMismatch {
                expected: target.port,
                got: reply.port,
            }
            .into());
        }
        match hub::ErrorCode::interpret(reply.error) {
            None => {}
            Some(Ok(code)) => {
                error!(code = reply.error, "Gateway reported an error");
                return Err(HubError::Code(code).into());
            }
            Some(Err(raw)) => {
                error!(code = raw, "Gateway reported an unknown error code");
                return Err(HubError::UnknownCode(raw).into());
            }
        }
    }

    while !send.is_empty() && slot_index < slots.len() {
        if send.len() < WORD {
            return Err(ValidationError::Truncated.into());
        }
        let send_raw = u32::from_le_bytes(send[..WORD].try_into().expect("4-byte slice"));
        let send_header = Header::unpack(send_raw).map_err(|e| {
            error!(raw = format_args!("{send_raw:#010x}"), "Unable to parse send header");
            ValidationError::SendHeader(e)
        })?;
        let reply_raw = slots[slot_index]
            .header_word()
            .ok_or(ValidationError::Truncated)?;
        let reply_header = Header::unpack(reply_raw).map_err(|e| {
            error!(raw = format_args!("{reply_raw:#010x}"), "Unable to parse reply header");
            ValidationError::ReplyHeader(e)
        })?;
        if reply_header.response != 0 {
            error!(
                code = reply_header.response,
                id = reply_header.id,
                "Reply response code indicates a device-side error"
            );
            return Err(ValidationError::ResponseCode(reply_header.response).into());
        }
        if send_header.kind != reply_header.kind {
            error!(
                sent = ?send_header.kind,
                got = ?reply_header.kind,
                "Reply transaction type does not match that sent"
            );
            return Err(ValidationError::TypeMismatch {
                sent: send_header.kind,
                got: reply_header.kind,
            }
            .into());
        }
        if send_header.id != reply_header.id {
            error!(
                sent = send_header.id,
                got = reply_header.id,
                "Reply transaction id does not match that sent"
            );
            return Err(ValidationError::IdMismatch {
                sent: send_header.id,
                got: reply_header.id,
            }
            .into());
        }
        let advance = send_header.send_bytes();
        if send.len() < advance {
            return Err(ValidationError::Truncated.into());
        }
        send = &send[advance..];
        slot_index += send_header.kind.reply_slots();
    }

    if send.is_empty() && slot_index == slots.len() {
        Ok(())
    } else {
        error!("Send and reply streams did not exhaust together");
        Err(ValidationError::Truncated.into())
    }
}

/// The packing engine proper
#[derive(Debug)]
pub(crate) struct Packer {
    current: Option<Buffers>,
    max_send: usize,
    max_reply: usize,
    ids: TransactionId,
    hub: Option<HubTarget>,
}

impl Packer {
    pub(crate) fn new(max_send: usize, max_reply: usize, hub: Option<HubTarget>) -> Self {
        Self {
            current: None,
            max_send,
            max_reply,
            ids: TransactionId::new(),
            hub,
        }
    }

    fn filling(&mut self) -> &mut Buffers {
        self.current
            .as_mut()
            .expect("a filling buffer exists after a space check")
    }

    /// Start a fresh buffer: lay down the hub preamble (when routed
    /// through a gateway) and the byte-order probe that opens every
    /// packet.
    fn fresh_buffer(&mut self) {
        let mut buffers = Buffers::new(self.max_send);
        if let Some(target) = self.hub {
            let base = buffers.send(&hub::pack_send_preamble(target.ip, target.port));
            let reply = Arc::new(Mutex::new(HubReply::default()));
            let fields = [
                HubField::TotalBytes,
                HubField::ChunkBytes,
                HubField::Ip,
                HubField::Port,
                HubField::Error,
            ];
            for (field, len) in fields.into_iter().zip(hub::REPLY_FIELD_BYTES) {
                buffers.receive(ReplySlot::hub(reply.clone(), field, len));
            }
            buffers.set_hub_record(HubRecord {
                byte_count_offset: base + hub::BYTE_COUNT_OFFSET,
                word_count_offset: base + hub::WORD_COUNT_OFFSET,
                reply,
            });
        }
        let header = Header::new(TransactionType::ByteOrder, 0, self.ids.next_id());
        buffers.send(&header.pack().to_le_bytes());
        let probe = ValHeader::new();
        let index = probe.storage().push_header();
        buffers.receive(ReplySlot::header(probe.storage(), index));
        buffers.attach(probe.storage());
        self.current = Some(buffers);
    }

    /// Patch the hub preamble's count fields now that the packet's final
    /// size is known
    fn predispatch(buffers: &mut Buffers) {
        if let Some(record) = buffers.hub_record() {
            let byte_count_offset = record.byte_count_offset;
            let word_count_offset = record.word_count_offset;
            let counter = buffers.send_counter();
            let byte_count = u32::try_from(counter - 4).expect("packet fits in u32");
            let word_count =
                u16::try_from((counter - hub::SEND_PREAMBLE_BYTES) / WORD).expect("word count fits");
            buffers.patch_u32_be(byte_count_offset, byte_count);
            buffers.patch_u16_be(word_count_offset, word_count);
        }
    }

    fn dispatch_current(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        if let Some(mut buffers) = self.current.take() {
            Self::predispatch(&mut buffers);
            transport.dispatch(buffers)?;
        }
        Ok(())
    }

    /// Flush the filling buffer to the transport and block until every
    /// outstanding buffer has round-tripped and validated
    pub(crate) fn dispatch(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        if self.current.is_some() {
            self.dispatch_current(transport)?;
            transport.flush()?;
        }
        Ok(())
    }

    fn free_space(&self) -> (usize, usize) {
        let buffers = self
            .current
            .as_ref()
            .expect("a filling buffer exists after a space check");
        (
            self.max_send - buffers.send_counter(),
            self.max_reply - buffers.reply_counter(),
        )
    }

    /// The buffer-budget protocol. Returns the send and reply byte counts
    /// actually available: the requested sizes when they fit the filling
    /// buffer; whatever space is left when more than 16 bytes remain on
    /// both sides (block operations chunk themselves to this); otherwise
    /// the filling buffer is dispatched and a fresh one started.
    fn check_space(
        &mut self,
        transport: &mut dyn Transport,
        request_send: usize,
        request_reply: usize,
    ) -> Result<(usize, usize), Error> {
        if self.current.is_none() {
            self.fresh_buffer();
        }
        let (free_send, free_reply) = self.free_space();
        if request_send <= free_send && request_reply <= free_reply {
            return Ok((request_send, request_reply));
        }
        if free_send > 16 && free_reply > 16 {
            return Ok((free_send, free_reply));
        }
        self.dispatch_current(transport)?;
        self.fresh_buffer();
        let (free_send, free_reply) = self.free_space();
        if request_send <= free_send && request_reply <= free_reply {
            Ok((request_send, request_reply))
        } else {
            Ok((free_send, free_reply))
        }
    }

    /// Like `check_space`, for transactions that cannot be split: anything
    /// less than the requested space is a hard overflow.
    fn require_space(
        &mut self,
        transport: &mut dyn Transport,
        request_send: usize,
        request_reply: usize,
    ) -> Result<(), Error> {
        let (avail_send, avail_reply) = self.check_space(transport, request_send, request_reply)?;
        if avail_send < request_send || avail_reply < request_reply {
            return Err(Error::BufferOverflow {
                requested_send: request_send,
                requested_reply: request_reply,
            });
        }
        Ok(())
    }

    pub(crate) fn byte_order_transaction(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<ValHeader, Error> {
        self.require_space(transport, WORD, WORD)?;
        let header = Header::new(TransactionType::ByteOrder, 0, self.ids.next_id());
        let probe = ValHeader::new();
        let index = probe.storage().push_header();
        let buffers = self.filling();
        buffers.send(&header.pack().to_le_bytes());
        buffers.receive(ReplySlot::header(probe.storage(), index));
        buffers.attach(probe.storage());
        Ok(probe)
    }

    pub(crate) fn write(
        &mut self,
        transport: &mut dyn Transport,
        addr: u32,
        value: u32,
    ) -> Result<ValHeader, Error> {
        self.require_space(transport, 3 * WORD, WORD)?;
        let header = Header::new(TransactionType::Write, 1, self.ids.next_id());
        let reply = ValHeader::new();
        let index = reply.storage().push_header();
        let buffers = self.filling();
        buffers.send(&header.pack().to_le_bytes());
        buffers.send(&addr.to_le_bytes());
        buffers.send(&value.to_le_bytes());
        buffers.receive(ReplySlot::header(reply.storage(), index));
        buffers.attach(reply.storage());
        Ok(reply)
    }

    pub(crate) fn write_block(
        &mut self,
        transport: &mut dyn Transport,
        addr: u32,
        source: &[u32],
        mode: BlockMode,
    ) -> Result<ValHeader, Error> {
        if source.is_empty() {
            self.check_space(transport, 0, 0)?;
            let reply = ValHeader::new();
            self.filling().attach(reply.storage());
            return Ok(reply);
        }
        let kind = match mode {
            BlockMode::Incremental => TransactionType::Write,
            BlockMode::NonIncrementing => TransactionType::NonIncrementingWrite,
        };
        let mut remaining = source;
        let mut addr = addr;
        loop {
            let request_send = (2 + remaining.len()) * WORD;
            let (avail_send, _) = self.check_space(transport, request_send, WORD)?;
            let payload_words = (avail_send.saturating_sub(2 * WORD) / WORD)
                .min(remaining.len())
                .min(MAX_WORD_COUNT);
            if payload_words == 0 {
                return Err(Error::BufferOverflow {
                    requested_send: 3 * WORD,
                    requested_reply: WORD,
                });
            }
            let word_count = u8::try_from(payload_words).expect("chunk capped at 255 words");
            let header = Header::new(kind, word_count, self.ids.next_id());
            let chunk = ValHeader::new();
            let index = chunk.storage().push_header();
            let buffers = self.filling();
            buffers.send(&header.pack().to_le_bytes());
            buffers.send(&addr.to_le_bytes());
            for word in &remaining[..payload_words] {
                buffers.send(&word.to_le_bytes());
            }
            buffers.receive(ReplySlot::header(chunk.storage(), index));
            buffers.attach(chunk.storage());
            remaining = &remaining[payload_words..];
            if mode == BlockMode::Incremental {
                addr += u32::from(word_count);
            }
            if remaining.is_empty() {
                return Ok(chunk);
            }
        }
    }

    pub(crate) fn read_word<T: Word>(
        &mut self,
        transport: &mut dyn Transport,
        addr: u32,
        mask: Option<u32>,
    ) -> Result<ValWord<T>, Error> {
        self.require_space(transport, 2 * WORD, 2 * WORD)?;
        let header = Header::new(TransactionType::Read, 1, self.ids.next_id());
        let reply = ValWord::new(mask);
        let index = reply.storage().push_header();
        let buffers = self.filling();
        buffers.send(&header.pack().to_le_bytes());
        buffers.send(&addr.to_le_bytes());
        buffers.receive(ReplySlot::header(reply.storage(), index));
        buffers.receive(ReplySlot::words(reply.storage(), 0, WORD));
        buffers.attach(reply.storage());
        Ok(reply)
    }

    pub(crate) fn read_block<T: Word>(
        &mut self,
        transport: &mut dyn Transport,
        addr: u32,
        size: usize,
        mode: BlockMode,
    ) -> Result<ValVector<T>, Error> {
        let reply = ValVector::new(size);
        if size == 0 {
            self.check_space(transport, 0, 0)?;
            self.filling().attach(reply.storage());
            return Ok(reply);
        }
        let kind = match mode {
            BlockMode::Incremental => TransactionType::Read,
            BlockMode::NonIncrementing => TransactionType::NonIncrementingRead,
        };
        let mut word_offset = 0;
        let mut addr = addr;
        loop {
            let request_reply = (1 + (size - word_offset)) * WORD;
            let (_, avail_reply) = self.check_space(transport, 2 * WORD, request_reply)?;
            let payload_words = (avail_reply.saturating_sub(WORD) / WORD)
                .min(size - word_offset)
                .min(MAX_WORD_COUNT);
            if payload_words == 0 {
                return Err(Error::BufferOverflow {
                    requested_send: 2 * WORD,
                    requested_reply: 2 * WORD,
                });
            }
            let word_count = u8::try_from(payload_words).expect("chunk capped at 255 words");
            let header = Header::new(kind, word_count, self.ids.next_id());
            let index = reply.storage().push_header();
            let buffers = self.filling();
            buffers.send(&header.pack().to_le_bytes());
            buffers.send(&addr.to_le_bytes());
            buffers.receive(ReplySlot::header(reply.storage(), index));
            buffers.receive(ReplySlot::words(
                reply.storage(),
                word_offset,
                payload_words * WORD,
            ));
            word_offset += payload_words;
            if mode == BlockMode::Incremental {
                addr += u32::from(word_count);
            }
            if word_offset == size {
                // the handle rides the final chunk's buffer, so it stays
                // alive until every chunk has come back
                self.filling().attach(reply.storage());
                return Ok(reply);
            }
        }
    }

    pub(crate) fn rmw_bits(
        &mut self,
        transport: &mut dyn Transport,
        addr: u32,
        and_term: u32,
        or_term: u32,
    ) -> Result<ValWord<u32>, Error> {
        self.require_space(transport, 4 * WORD, 2 * WORD)?;
        let header = Header::new(TransactionType::RmwBits, 1, self.ids.next_id());
        let reply = ValWord::new(None);
        let index = reply.storage().push_header();
        let buffers = self.filling();
        buffers.send(&header.pack().to_le_bytes());
        buffers.send(&addr.to_le_bytes());
        buffers.send(&and_term.to_le_bytes());
        buffers.send(&or_term.to_le_bytes());
        buffers.receive(ReplySlot::header(reply.storage(), index));
        buffers.receive(ReplySlot::words(reply.storage(), 0, WORD));
        buffers.attach(reply.storage());
        Ok(reply)
    }

    pub(crate) fn rmw_sum(
        &mut self,
        transport: &mut dyn Transport,
        addr: u32,
        addend: i32,
    ) -> Result<ValWord<i32>, Error> {
        self.require_space(transport, 3 * WORD, 2 * WORD)?;
        let header = Header::new(TransactionType::RmwSum, 1, self.ids.next_id());
        let reply = ValWord::new(None);
        let index = reply.storage().push_header();
        let buffers = self.filling();
        buffers.send(&header.pack().to_le_bytes());
        buffers.send(&addr.to_le_bytes());
        buffers.send(&addend.to_raw().to_le_bytes());
        buffers.receive(ReplySlot::header(reply.storage(), index));
        buffers.receive(ReplySlot::words(reply.storage(), 0, WORD));
        buffers.attach(reply.storage());
        Ok(reply)
    }

    pub(crate) fn read_reserved_address_info(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<ValVector<u32>, Error> {
        self.require_space(transport, WORD, 3 * WORD)?;
        let header = Header::new(TransactionType::ReservedAddressInfo, 0, self.ids.next_id());
        let reply = ValVector::new(2);
        let index = reply.storage().push_header();
        let buffers = self.filling();
        buffers.send(&header.pack().to_le_bytes());
        buffers.receive(ReplySlot::header(reply.storage(), index));
        buffers.receive(ReplySlot::words(reply.storage(), 0, 2 * WORD));
        buffers.attach(reply.storage());
        Ok(reply)
    }
}
