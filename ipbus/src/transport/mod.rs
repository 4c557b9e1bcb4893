//! Transport drivers that carry buffer pairs between client and device.
//!
//! A transport takes ownership of each dispatched buffer for the duration
//! of the I/O, scatters the reply back into the buffer's slots, and runs
//! validation. In pipelined mode a background worker owns the socket and
//! the caller synchronizes through `flush`; errors raised on the worker
//! are stored and rethrown from the next user-visible call. Any failure
//! leaves the transport unusable until the client is rebuilt.

pub mod mock;
pub mod tcp;
pub mod udp;

use crate::{
    buffer::Buffers,
    error::Error,
};
use std::{
    sync::{
        Condvar,
        Mutex,
    },
    time::Duration,
};

/// The trait every transport driver implements. Implementations assume
/// the connection is already established.
pub trait Transport: Send {
    /// Hand a buffer pair over for I/O. In single-threaded mode this
    /// round-trips and validates inline; in pipelined mode it enqueues
    /// and returns.
    /// # Errors
    /// Transport failures, timeouts, and validation mismatches; also any
    /// error stored by a pipelined worker since the last call.
    fn dispatch(&mut self, buffers: Buffers) -> Result<(), Error>;

    /// Block until every dispatched buffer has round-tripped and
    /// validated
    /// # Errors
    /// Rethrows errors stored by a pipelined worker.
    fn flush(&mut self) -> Result<(), Error>;

    fn set_timeout(&mut self, timeout: Duration);

    fn timeout(&self) -> Duration;
}

/// State shared between a pipelined worker and the caller thread
#[derive(Debug, Default)]
pub(crate) struct Shared {
    state: Mutex<PipeState>,
    completed: Condvar,
}

#[derive(Debug, Default)]
struct PipeState {
    in_flight: usize,
    stored: Option<Error>,
    dead: bool,
}

impl Shared {
    /// Gate a dispatch: rethrow a stored worker error, refuse when dead,
    /// otherwise count the buffer as outstanding
    pub(crate) fn begin_dispatch(&self) -> Result<(), Error> {
        let mut state = self.state.lock().expect("transport state poisoned");
        if let Some(error) = state.stored.take() {
            return Err(error);
        }
        if state.dead {
            return Err(Error::unusable());
        }
        state.in_flight += 1;
        Ok(())
    }

    /// Worker side: record one buffer's outcome and wake any flusher
    pub(crate) fn complete(&self, result: Result<(), Error>) {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.in_flight -= 1;
        if let Err(error) = result {
            state.dead = true;
            if state.stored.is_none() {
                state.stored = Some(error);
            }
        }
        self.completed.notify_all();
    }

    /// A dispatch that never reached the worker: uncount it and store the
    /// failure
    pub(crate) fn abort_dispatch(&self, error: Error) -> Error {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.in_flight -= 1;
        state.dead = true;
        self.completed.notify_all();
        error
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state.lock().expect("transport state poisoned").dead
    }

    /// Block until the outstanding count drains, then rethrow any stored
    /// worker error
    pub(crate) fn wait_flush(&self) -> Result<(), Error> {
        let mut state = self.state.lock().expect("transport state poisoned");
        while state.in_flight > 0 {
            state = self
                .completed
                .wait(state)
                .expect("transport state poisoned");
        }
        match state.stored.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
