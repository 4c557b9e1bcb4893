//! The UDP transport: one datagram out, one datagram back, per buffer
//! pair.
//!
//! UDP gives no ordering guarantees between packets, so the pipelined
//! worker keeps exactly one buffer in flight at a time; the dispatch
//! queue still lets the caller run ahead of the network.

use super::{
    Shared,
    Transport,
};
use crate::{
    buffer::Buffers,
    error::Error,
    pack::Validator,
};
use std::{
    net::{
        Ipv4Addr,
        ToSocketAddrs,
        UdpSocket,
    },
    sync::{
        mpsc,
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

/// A connected UDP transport
#[derive(Debug)]
pub struct Udp {
    socket: Arc<UdpSocket>,
    mode: Mode,
    validator: Validator,
    max_reply: usize,
    timeout: Duration,
}

#[derive(Debug)]
enum Mode {
    Blocking { dead: bool },
    Pipelined(Worker),
}

#[derive(Debug)]
struct Worker {
    queue: Option<mpsc::Sender<Buffers>>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl Udp {
    /// Create a datagram socket and connect it to the device, resolving
    /// hostnames. `pipelined` moves the I/O loop onto a background
    /// worker.
    /// # Errors
    /// Will return an error if the socket cannot be created or connected.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        validator: Validator,
        max_reply: usize,
        timeout: Duration,
        pipelined: bool,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(Error::SocketCreation)?;
        socket
            .set_read_timeout(Some(timeout))
            .map_err(Error::SocketCreation)?;
        socket.connect(addr).map_err(Error::SocketCreation)?;
        let socket = Arc::new(socket);
        let mode = if pipelined {
            Mode::Pipelined(Worker::spawn(socket.clone(), validator, max_reply))
        } else {
            Mode::Blocking { dead: false }
        };
        Ok(Self {
            socket,
            mode,
            validator,
            max_reply,
            timeout,
        })
    }
}

/// Send one buffer, wait for the reply under the socket deadline, scatter
/// and validate
fn round_trip(
    socket: &UdpSocket,
    validator: &Validator,
    scratch: &mut [u8],
    buffers: &Buffers,
) -> Result<(), Error> {
    socket.send(buffers.send_bytes()).map_err(Error::SocketIo)?;
    debug!(bytes = buffers.send_counter(), "Sent datagram");
    let received = match socket.recv(scratch) {
        Ok(n) => n,
        Err(e) => match e.kind() {
            // Compat for both windows and *nix
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                return Err(Error::Timeout)
            }
            _ => return Err(Error::SocketIo(e)),
        },
    };
    debug!(bytes = received, "Received datagram");
    buffers.scatter(&scratch[..received])?;
    validator.validate(buffers)
}

impl Transport for Udp {
    fn dispatch(&mut self, buffers: Buffers) -> Result<(), Error> {
        match &mut self.mode {
            Mode::Blocking { dead } => {
                if *dead {
                    return Err(Error::unusable());
                }
                let mut scratch = vec![0u8; self.max_reply];
                let result = round_trip(&self.socket, &self.validator, &mut scratch, &buffers);
                if result.is_err() {
                    warn!("UDP transport is now unusable");
                    *dead = true;
                }
                result
            }
            Mode::Pipelined(worker) => worker.dispatch(buffers),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        match &mut self.mode {
            // single-threaded dispatch already round-tripped
            Mode::Blocking { .. } => Ok(()),
            Mode::Pipelined(worker) => worker.shared.wait_flush(),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Err(e) = self.socket.set_read_timeout(Some(timeout)) {
            warn!(error = %e, "Could not update the socket deadline");
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Worker {
    fn spawn(socket: Arc<UdpSocket>, validator: Validator, max_reply: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let (queue, jobs) = mpsc::channel::<Buffers>();
        let handle = std::thread::spawn(move || {
            let mut scratch = vec![0u8; max_reply];
            // strict FIFO, one datagram in flight at a time
            for buffers in &jobs {
                let result = if worker_shared.is_dead() {
                    Err(Error::unusable())
                } else {
                    round_trip(&socket, &validator, &mut scratch, &buffers)
                };
                worker_shared.complete(result);
            }
        });
        Self {
            queue: Some(queue),
            handle: Some(handle),
            shared,
        }
    }

    fn dispatch(&mut self, buffers: Buffers) -> Result<(), Error> {
        self.shared.begin_dispatch()?;
        let queue = self.queue.as_ref().ok_or_else(Error::unusable)?;
        queue
            .send(buffers)
            .map_err(|_| self.shared.abort_dispatch(Error::unusable()))?;
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // closing the queue ends the worker loop
        drop(self.queue.take());
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}
