//! The buffer pair: one outbound byte sequence plus the scatter-gather
//! layout of its expected reply.
//!
//! The send side is append-only; `send` returns the byte offset of what it
//! wrote so count fields can be patched later, once the packet's final
//! size is known. The reply side is an ordered list of slots, each naming
//! a destination inside some handle's shared storage (or the hub reply
//! record) and a byte length. Slot destinations use interior mutability,
//! so a received reply can be scattered and validated from a transport
//! worker thread without touching the packing engine.

use crate::{
    error::ValidationError,
    val::Storage,
};
use std::sync::{
    Arc,
    Mutex,
};

/// The decoded reply preamble of a ControlHub packet, filled during
/// scatter
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HubReply {
    pub total_bytes: u32,
    pub chunk_bytes: u32,
    pub ip: u32,
    pub port: u16,
    pub error: u16,
}

/// Which field of the hub reply a slot lands in
#[derive(Debug, Clone, Copy)]
pub(crate) enum HubField {
    TotalBytes,
    ChunkBytes,
    Ip,
    Port,
    Error,
}

/// Send-side bookkeeping for a packet routed through a ControlHub: the
/// offsets of the two count fields patched at predispatch, and the shared
/// record its reply preamble scatters into
#[derive(Debug)]
pub(crate) struct HubRecord {
    pub byte_count_offset: usize,
    pub word_count_offset: usize,
    pub reply: Arc<Mutex<HubReply>>,
}

#[derive(Debug)]
enum SlotDest {
    /// One reply-header word of a handle
    Header { storage: Arc<Storage>, index: usize },
    /// Payload words of a handle, starting at a word offset
    Words {
        storage: Arc<Storage>,
        word_offset: usize,
    },
    /// One field of the hub reply preamble (big-endian on the wire)
    Hub {
        record: Arc<Mutex<HubReply>>,
        field: HubField,
    },
}

/// One scatter-gather reply slot
#[derive(Debug)]
pub(crate) struct ReplySlot {
    dest: SlotDest,
    len: usize,
}

impl ReplySlot {
    pub(crate) fn header(storage: Arc<Storage>, index: usize) -> Self {
        Self {
            dest: SlotDest::Header { storage, index },
            len: 4,
        }
    }

    pub(crate) fn words(storage: Arc<Storage>, word_offset: usize, len: usize) -> Self {
        Self {
            dest: SlotDest::Words {
                storage,
                word_offset,
            },
            len,
        }
    }

    pub(crate) fn hub(record: Arc<Mutex<HubReply>>, field: HubField, len: usize) -> Self {
        Self {
            dest: SlotDest::Hub { record, field },
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Land `src` (exactly `len` bytes) in this slot's destination
    fn fill(&self, src: &[u8]) {
        match &self.dest {
            SlotDest::Header { storage, index } => {
                let word = u32::from_le_bytes(src.try_into().expect("header slots are 4 bytes"));
                storage.set_header(*index, word);
            }
            SlotDest::Words {
                storage,
                word_offset,
            } => storage.write_words(*word_offset, src),
            SlotDest::Hub { record, field } => {
                let mut reply = record.lock().expect("hub reply record poisoned");
                match field {
                    HubField::TotalBytes => {
                        reply.total_bytes =
                            u32::from_be_bytes(src.try_into().expect("4-byte field"));
                    }
                    HubField::ChunkBytes => {
                        reply.chunk_bytes =
                            u32::from_be_bytes(src.try_into().expect("4-byte field"));
                    }
                    HubField::Ip => {
                        reply.ip = u32::from_be_bytes(src.try_into().expect("4-byte field"));
                    }
                    HubField::Port => {
                        reply.port = u16::from_be_bytes(src.try_into().expect("2-byte field"));
                    }
                    HubField::Error => {
                        reply.error = u16::from_be_bytes(src.try_into().expect("2-byte field"));
                    }
                }
            }
        }
    }

    /// Read back the reply-header word this slot landed, if it is a header
    /// slot
    pub(crate) fn header_word(&self) -> Option<u32> {
        match &self.dest {
            SlotDest::Header { storage, index } => Some(storage.header(*index)),
            _ => None,
        }
    }
}

/// A send buffer and the reply layout it expects, the unit handed to a
/// transport
#[derive(Debug)]
pub struct Buffers {
    send: Vec<u8>,
    reply: Vec<ReplySlot>,
    reply_counter: usize,
    attached: Vec<Arc<Storage>>,
    hub: Option<HubRecord>,
}

impl Buffers {
    pub(crate) fn new(max_send: usize) -> Self {
        Self {
            send: Vec::with_capacity(max_send),
            reply: Vec::new(),
            reply_counter: 0,
            attached: Vec::new(),
            hub: None,
        }
    }

    /// Append to the send side, returning the byte offset of the appended
    /// region. The caller has already checked capacity.
    pub(crate) fn send(&mut self, bytes: &[u8]) -> usize {
        let offset = self.send.len();
        self.send.extend_from_slice(bytes);
        offset
    }

    /// Record a reply slot
    pub(crate) fn receive(&mut self, slot: ReplySlot) {
        self.reply_counter += slot.len();
        self.reply.push(slot);
    }

    /// Keep a handle's storage alive until validation completes
    pub(crate) fn attach(&mut self, storage: Arc<Storage>) {
        self.attached.push(storage);
    }

    /// Flip every attached handle to valid
    pub(crate) fn mark_valid(&self) {
        for storage in &self.attached {
            storage.mark_valid();
        }
    }

    #[must_use]
    pub fn send_bytes(&self) -> &[u8] {
        &self.send
    }

    pub(crate) fn send_counter(&self) -> usize {
        self.send.len()
    }

    /// Total bytes the reply slots expect
    #[must_use]
    pub fn reply_counter(&self) -> usize {
        self.reply_counter
    }

    pub(crate) fn slots(&self) -> &[ReplySlot] {
        &self.reply
    }

    pub(crate) fn patch_u32_be(&mut self, offset: usize, value: u32) {
        self.send[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn patch_u16_be(&mut self, offset: usize, value: u16) {
        self.send[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn set_hub_record(&mut self, record: HubRecord) {
        self.hub = Some(record);
    }

    pub(crate) fn hub_record(&self) -> Option<&HubRecord> {
        self.hub.as_ref()
    }

    pub(crate) fn hub_reply(&self) -> Option<HubReply> {
        self.hub
            .as_ref()
            .map(|record| *record.reply.lock().expect("hub reply record poisoned"))
    }

    /// Distribute a contiguous reply byte region across the slots, in
    /// order
    /// # Errors
    /// Fails if the region length does not match the recorded layout
    /// exactly.
    pub fn scatter(&self, raw: &[u8]) -> Result<(), ValidationError> {
        if raw.len() != self.reply_counter {
            return Err(ValidationError::Length {
                expected: self.reply_counter,
                got: raw.len(),
            });
        }
        let mut cursor = 0;
        for slot in &self.reply {
            slot.fill(&raw[cursor..cursor + slot.len()]);
            cursor += slot.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::val::ValWord;

    #[test]
    fn test_counters_track_appends() {
        let mut buffers = Buffers::new(64);
        assert_eq!(buffers.send(&[1, 2, 3, 4]), 0);
        assert_eq!(buffers.send(&[5, 6]), 4);
        assert_eq!(buffers.send_counter(), 6);

        let word: ValWord<u32> = ValWord::new(None);
        let index = word.storage().push_header();
        buffers.receive(ReplySlot::header(word.storage(), index));
        buffers.receive(ReplySlot::words(word.storage(), 0, 4));
        assert_eq!(buffers.reply_counter(), 8);
        assert_eq!(
            buffers.slots().iter().map(ReplySlot::len).sum::<usize>(),
            buffers.reply_counter()
        );
    }

    #[test]
    fn test_scatter_length_mismatch() {
        let mut buffers = Buffers::new(64);
        let word: ValWord<u32> = ValWord::new(None);
        let index = word.storage().push_header();
        buffers.receive(ReplySlot::header(word.storage(), index));
        assert!(matches!(
            buffers.scatter(&[0; 3]),
            Err(ValidationError::Length {
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    fn test_scatter_lands_in_storage() {
        let mut buffers = Buffers::new(64);
        let word: ValWord<u32> = ValWord::new(None);
        let index = word.storage().push_header();
        buffers.receive(ReplySlot::header(word.storage(), index));
        buffers.receive(ReplySlot::words(word.storage(), 0, 4));
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x2000_0130_u32.to_le_bytes());
        raw.extend_from_slice(&0xCAFE_F00D_u32.to_le_bytes());
        buffers.scatter(&raw).unwrap();
        assert_eq!(buffers.slots()[0].header_word(), Some(0x2000_0130));
        buffers.mark_valid();
        assert_eq!(word.value().unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn test_patch() {
        let mut buffers = Buffers::new(64);
        buffers.send(&[0; 12]);
        buffers.patch_u32_be(0, 0x0102_0304);
        buffers.patch_u16_be(10, 0xBEEF);
        assert_eq!(
            buffers.send_bytes(),
            [1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0xBE, 0xEF]
        );
    }
}
