//! Deferred value handles.
//!
//! Every packing operation hands back one of these. The handle shares its
//! storage with the buffer pair that will carry the reply, so the reply
//! bytes have somewhere to land even if the user drops the handle, and the
//! user can keep the handle long after the buffer is gone. Values are
//! unreadable until the owning buffer has been dispatched and its reply
//! validated; the `valid` flag flips false to true exactly once.

use crate::error::Error;
use std::{
    marker::PhantomData,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
};

mod sealed {
    pub trait Sealed {}
}

/// The word types a register can be read or written as
pub trait Word: Copy + sealed::Sealed {
    fn from_raw(raw: u32) -> Self;
    fn to_raw(self) -> u32;
}

impl sealed::Sealed for u32 {}
impl Word for u32 {
    fn from_raw(raw: u32) -> Self {
        raw
    }
    fn to_raw(self) -> u32 {
        self
    }
}

impl sealed::Sealed for i32 {}
impl Word for i32 {
    #[allow(clippy::cast_possible_wrap)]
    fn from_raw(raw: u32) -> Self {
        raw as i32
    }
    #[allow(clippy::cast_sign_loss)]
    fn to_raw(self) -> u32 {
        self as u32
    }
}

/// The shared backing store of a deferred handle. One reply-header word is
/// recorded per packet chunk; payload words (if any) fill `words`.
#[derive(Debug, Default)]
pub(crate) struct Storage {
    valid: AtomicBool,
    mask: Option<u32>,
    headers: Mutex<Vec<u32>>,
    words: Mutex<Vec<u32>>,
}

impl Storage {
    fn with_words(mask: Option<u32>, word_count: usize) -> Arc<Self> {
        Arc::new(Self {
            valid: AtomicBool::new(false),
            mask,
            headers: Mutex::new(Vec::new()),
            words: Mutex::new(vec![0; word_count]),
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Reserve one more reply-header word, returning its index
    pub(crate) fn push_header(&self) -> usize {
        let mut headers = self.headers.lock().expect("header storage poisoned");
        headers.push(0);
        headers.len() - 1
    }

    pub(crate) fn set_header(&self, index: usize, word: u32) {
        self.headers.lock().expect("header storage poisoned")[index] = word;
    }

    pub(crate) fn header(&self, index: usize) -> u32 {
        self.headers.lock().expect("header storage poisoned")[index]
    }

    /// Land reply payload bytes as little-endian words starting at
    /// `word_offset`
    pub(crate) fn write_words(&self, word_offset: usize, bytes: &[u8]) {
        let mut words = self.words.lock().expect("word storage poisoned");
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            words[word_offset + i] = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
        }
    }

    fn word(&self, index: usize) -> u32 {
        self.words.lock().expect("word storage poisoned")[index]
    }

    fn word_count(&self) -> usize {
        self.words.lock().expect("word storage poisoned").len()
    }
}

/// Handle for a transaction whose reply is a bare header (writes and the
/// byte-order probe)
#[derive(Debug, Clone, Default)]
pub struct ValHeader {
    inner: Arc<Storage>,
}

impl ValHeader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn storage(&self) -> Arc<Storage> {
        self.inner.clone()
    }

    /// Has the owning buffer round-tripped and validated?
    #[must_use]
    pub fn valid(&self) -> bool {
        self.inner.is_valid()
    }
}

/// Handle for a single reply word, optionally masked
#[derive(Debug, Clone)]
pub struct ValWord<T> {
    inner: Arc<Storage>,
    marker: PhantomData<T>,
}

impl<T: Word> ValWord<T> {
    pub(crate) fn new(mask: Option<u32>) -> Self {
        Self {
            inner: Storage::with_words(mask, 1),
            marker: PhantomData,
        }
    }

    pub(crate) fn storage(&self) -> Arc<Storage> {
        self.inner.clone()
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.inner.is_valid()
    }

    #[must_use]
    pub fn mask(&self) -> Option<u32> {
        self.inner.mask
    }

    /// The reply word, masked and shifted down to the mask's lowest set bit
    /// if a mask was supplied
    /// # Errors
    /// Returns [`Error::NonValidatedMemory`] until the owning buffer has
    /// been dispatched and validated.
    pub fn value(&self) -> Result<T, Error> {
        if !self.inner.is_valid() {
            return Err(Error::NonValidatedMemory);
        }
        let raw = self.inner.word(0);
        let raw = match self.inner.mask {
            Some(mask) => (raw & mask) >> mask.trailing_zeros(),
            None => raw,
        };
        Ok(T::from_raw(raw))
    }
}

/// Handle for a block of reply words
#[derive(Debug, Clone)]
pub struct ValVector<T> {
    inner: Arc<Storage>,
    marker: PhantomData<T>,
}

impl<T: Word> ValVector<T> {
    pub(crate) fn new(word_count: usize) -> Self {
        Self {
            inner: Storage::with_words(None, word_count),
            marker: PhantomData,
        }
    }

    pub(crate) fn storage(&self) -> Arc<Storage> {
        self.inner.clone()
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.inner.is_valid()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.word_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One word of the block
    /// # Errors
    /// Returns [`Error::NonValidatedMemory`] until validated.
    pub fn get(&self, index: usize) -> Result<T, Error> {
        if !self.inner.is_valid() {
            return Err(Error::NonValidatedMemory);
        }
        Ok(T::from_raw(self.inner.word(index)))
    }

    /// A snapshot of the whole block
    /// # Errors
    /// Returns [`Error::NonValidatedMemory`] until validated.
    pub fn value(&self) -> Result<Vec<T>, Error> {
        if !self.inner.is_valid() {
            return Err(Error::NonValidatedMemory);
        }
        let words = self.inner.words.lock().expect("word storage poisoned");
        Ok(words.iter().map(|&w| T::from_raw(w)).collect())
    }
}
